//! # Voice Module
//!
//! Narrow binding to the voice platform: connect to a channel, hand it an
//! audio stream, tear the connection down, and receive status signals.
//!
//! The playback core only sees [`VoicePlatform`], [`VoiceConnection`] and
//! [`VoiceSignal`]. The production binding, [`driver::SongbirdPlatform`],
//! drives a songbird `Call` and routes serenity voice-state updates to the
//! worker that owns the guild.

use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;

use crate::audio::pipeline::OpusStream;

pub mod driver;

pub use driver::SongbirdPlatform;

/// Cambio de estado de voz de un usuario dentro del guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateChange {
    pub user_id: UserId,
    pub old_channel: Option<ChannelId>,
    pub new_channel: Option<ChannelId>,
    /// Miembros que no son bots presentes ahora en el canal del bot
    pub listeners: usize,
}

/// Señales que la plataforma de voz entrega al worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceSignal {
    /// Conexión establecida y lista para recibir audio
    Ready,
    /// El stream suscrito con esta generación terminó o se detuvo
    StreamIdle { generation: u64 },
    /// La conexión fue destruida
    Destroyed,
    VoiceStateChanged(VoiceStateChange),
}

#[async_trait]
pub trait VoicePlatform: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        signals: mpsc::UnboundedSender<VoiceSignal>,
    ) -> Result<Box<dyn VoiceConnection>>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    /// Reemplaza la fuente de audio actual por `stream`
    async fn subscribe(&mut self, stream: OpusStream, generation: u64) -> Result<()>;

    /// Detiene la fuente actual sin esperar a que consuma lo ya codificado.
    ///
    /// La plataforma reporta luego [`VoiceSignal::StreamIdle`] con la
    /// generación de esa fuente.
    async fn stop_stream(&mut self) -> Result<()>;

    /// Cierra la conexión; la plataforma emite [`VoiceSignal::Destroyed`]
    async fn destroy(&mut self) -> Result<()>;
}
