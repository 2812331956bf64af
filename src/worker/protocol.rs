//! Envelopes crossing the orchestrator <-> worker boundary.
//!
//! Both directions travel as owned, versioned envelopes; the typed
//! [`WorkerCommand`] / [`WorkerEvent`] enums are the closed set of messages
//! and are decoded from the envelopes on arrival.

use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{error::ProtocolError, library::Track};

pub const PROTOCOL_VERSION: u16 = 1;

/// Comandos que el orquestador envía al worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Play(Vec<Track>),
    Skip,
    Leave,
    Shutdown,
}

/// Eventos que el worker emite hacia el orquestador
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Log(String),
    Error(String),
    RequestNext,
    Disconnect,
}

/// `{event: "leave"|"play"|"skip"|"shutdown", data?: Track[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default = "default_version")]
    pub version: u16,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Track>>,
}

/// `{event: "log"|"error"|"requestNext"|"disconnect", message?, error?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default = "default_version")]
    pub version: u16,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_version() -> u16 {
    PROTOCOL_VERSION
}

fn check_version(version: u16) -> Result<(), ProtocolError> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion(version))
    }
}

impl From<WorkerCommand> for CommandEnvelope {
    fn from(command: WorkerCommand) -> Self {
        let (event, data) = match command {
            WorkerCommand::Play(tracks) => ("play", Some(tracks)),
            WorkerCommand::Skip => ("skip", None),
            WorkerCommand::Leave => ("leave", None),
            WorkerCommand::Shutdown => ("shutdown", None),
        };

        Self {
            version: PROTOCOL_VERSION,
            event: event.to_string(),
            data,
        }
    }
}

impl TryFrom<CommandEnvelope> for WorkerCommand {
    type Error = ProtocolError;

    fn try_from(envelope: CommandEnvelope) -> Result<Self, Self::Error> {
        check_version(envelope.version)?;

        match envelope.event.as_str() {
            "play" => match envelope.data {
                Some(tracks) if !tracks.is_empty() => Ok(WorkerCommand::Play(tracks)),
                _ => Err(ProtocolError::MissingTracks),
            },
            "skip" => Ok(WorkerCommand::Skip),
            "leave" => Ok(WorkerCommand::Leave),
            "shutdown" => Ok(WorkerCommand::Shutdown),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

impl From<WorkerEvent> for EventEnvelope {
    fn from(event: WorkerEvent) -> Self {
        let (tag, message, error) = match event {
            WorkerEvent::Log(message) => ("log", Some(message), None),
            WorkerEvent::Error(error) => ("error", None, Some(error)),
            WorkerEvent::RequestNext => ("requestNext", None, None),
            WorkerEvent::Disconnect => ("disconnect", None, None),
        };

        Self {
            version: PROTOCOL_VERSION,
            event: tag.to_string(),
            message,
            error,
        }
    }
}

impl TryFrom<EventEnvelope> for WorkerEvent {
    type Error = ProtocolError;

    fn try_from(envelope: EventEnvelope) -> Result<Self, ProtocolError> {
        check_version(envelope.version)?;

        match envelope.event.as_str() {
            "log" => Ok(WorkerEvent::Log(envelope.message.unwrap_or_default())),
            "error" => Ok(WorkerEvent::Error(
                envelope.error.or(envelope.message).unwrap_or_default(),
            )),
            "requestNext" => Ok(WorkerEvent::RequestNext),
            "disconnect" => Ok(WorkerEvent::Disconnect),
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// Evento de worker etiquetado con su guild
#[derive(Debug, Clone)]
pub struct GuildEvent {
    pub guild_id: GuildId,
    pub envelope: EventEnvelope,
}

/// Extremo emisor de eventos de un worker
#[derive(Debug, Clone)]
pub struct EventSink {
    guild_id: GuildId,
    tx: mpsc::UnboundedSender<GuildEvent>,
}

impl EventSink {
    pub fn new(guild_id: GuildId, tx: mpsc::UnboundedSender<GuildEvent>) -> Self {
        Self { guild_id, tx }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn send(&self, event: WorkerEvent) {
        let envelope = EventEnvelope::from(event);
        if self
            .tx
            .send(GuildEvent {
                guild_id: self.guild_id,
                envelope,
            })
            .is_err()
        {
            debug!("Orquestador cerrado, evento descartado para guild {}", self.guild_id);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.send(WorkerEvent::Log(message.into()));
    }

    pub fn error(&self, error: impl Into<String>) {
        self.send(WorkerEvent::Error(error.into()));
    }
}
