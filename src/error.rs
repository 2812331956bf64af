use serenity::model::id::GuildId;
use thiserror::Error;

/// Errores del protocolo orquestador <-> worker
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown envelope tag `{0}`")]
    UnknownTag(String),

    #[error("`play` command received without tracks")]
    MissingTracks,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

/// Errores del pipeline de codificación
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot build a pipeline for an empty track list")]
    NoTracks,

    #[error("failed to spawn encoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder process has no {0} handle")]
    MissingPipe(&'static str),
}

/// Errores del orquestador de guilds
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("guild {0} has no active worker")]
    NoActiveGuild(GuildId),

    #[error("guild {0} already has an active worker")]
    AlreadyActive(GuildId),

    #[error("queue for guild {guild} is full (max {max} tracks)")]
    QueueFull { guild: GuildId, max: usize },

    #[error("queue position {index} is out of range")]
    OutOfRange { index: usize },

    #[error("worker for guild {guild} failed to connect: {reason}")]
    ConnectFailed { guild: GuildId, reason: String },
}
