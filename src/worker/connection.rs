use anyhow::Result;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        pipeline::{PipelineConfig, PipelineHandle},
        process::{EncoderLauncher, TerminationOutcome},
        replaygain::MetadataProbe,
    },
    library::Track,
    voice::{VoiceConnection, VoicePlatform, VoiceSignal},
    worker::protocol::EventSink,
};

/// Owns the voice connection and the live pipeline of one guild.
///
/// At most one pipeline exists at a time: [`ConnectionSupervisor::play`]
/// waits for the previous encoder to be confirmed terminated before the
/// next one is launched.
pub struct ConnectionSupervisor {
    guild_id: GuildId,
    channel_id: ChannelId,
    platform: Arc<dyn VoicePlatform>,
    probe: Arc<dyn MetadataProbe>,
    launcher: Arc<dyn EncoderLauncher>,
    config: PipelineConfig,
    events: EventSink,
    signals: mpsc::UnboundedSender<VoiceSignal>,
    connection: Option<Box<dyn VoiceConnection>>,
    pipeline: Option<PipelineHandle>,
    next_generation: u64,
    active_generation: Option<u64>,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        platform: Arc<dyn VoicePlatform>,
        probe: Arc<dyn MetadataProbe>,
        launcher: Arc<dyn EncoderLauncher>,
        config: PipelineConfig,
        events: EventSink,
        signals: mpsc::UnboundedSender<VoiceSignal>,
    ) -> Self {
        Self {
            guild_id,
            channel_id,
            platform,
            probe,
            launcher,
            config,
            events,
            signals,
            connection: None,
            pipeline: None,
            next_generation: 0,
            active_generation: None,
        }
    }

    /// Canal de la conexión viva, o el solicitado si aún no conecta
    pub fn channel_id(&self) -> ChannelId {
        self.connection
            .as_ref()
            .map_or(self.channel_id, |c| c.channel_id())
    }

    /// Conecta al canal de voz; una sola conexión por worker
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            debug!("Guild {} ya conectado, ignorando connect", self.guild_id);
            return Ok(());
        }

        let connection = self
            .platform
            .connect(self.guild_id, self.channel_id, self.signals.clone())
            .await?;

        info!("🔊 Conectado al canal {} en guild {}", self.channel_id, self.guild_id);
        self.connection = Some(connection);
        Ok(())
    }

    /// Reemplaza el pipeline actual por uno nuevo para `tracks`
    pub async fn play(&mut self, tracks: Vec<Track>) -> Result<()> {
        let previous_pid = self.pipeline.as_ref().and_then(PipelineHandle::pid);
        if let Some(TerminationOutcome::Stuck) = self.stop_pipeline().await {
            let pid = previous_pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
            warn!(
                "🧟 Codificador pid {} sigue vivo en guild {}, lanzando el siguiente igualmente",
                pid, self.guild_id
            );
            self.events.error(format!(
                "encoder pid {} leaked: still running while its replacement starts",
                pid
            ));
        }
        // El idle del stream anterior ya no es vigente
        self.active_generation = None;

        self.next_generation += 1;
        let generation = self.next_generation;

        let (handle, stream) = PipelineHandle::start(
            tracks,
            generation,
            &self.config,
            self.probe.as_ref(),
            self.launcher.as_ref(),
            self.events.clone(),
        )
        .await?;

        // El pipeline existe aunque la suscripción falle, para poder detenerlo
        self.pipeline = Some(handle);
        self.active_generation = Some(generation);

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("guild {} has no voice connection", self.guild_id))?;
        connection.subscribe(stream, generation).await
    }

    /// Detiene el pipeline vivo, si existe, y espera su terminación
    pub async fn stop_pipeline(&mut self) -> Option<TerminationOutcome> {
        let handle = self.pipeline.take()?;
        let generation = handle.generation();
        let track_count = handle.tracks().len();

        // Primero el stream, para que el audio ya codificado no siga sonando
        handle.cut_stream();
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.stop_stream().await {
                warn!("⚠️ No se pudo detener el stream #{}: {:#}", generation, e);
            }
        }

        let outcome = handle.terminate().await;

        match outcome {
            TerminationOutcome::Stuck => warn!(
                "⚠️ Pipeline #{} de guild {} no confirmó su salida",
                generation, self.guild_id
            ),
            _ => debug!(
                "Pipeline #{} ({} track(s)) detenido: {:?}",
                generation, track_count, outcome
            ),
        }

        Some(outcome)
    }

    /// El idle corresponde al stream vigente (también tras un skip)
    pub fn is_current(&self, generation: u64) -> bool {
        self.active_generation == Some(generation)
    }

    /// Marca el idle como consumido para que no se procese dos veces
    pub fn consume_idle(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.active_generation = None;
        }
    }

    /// Detiene el pipeline y cierra la conexión. Devuelve si había conexión.
    pub async fn disconnect(&mut self) -> Result<bool> {
        self.stop_pipeline().await;

        let Some(mut connection) = self.connection.take() else {
            return Ok(false);
        };

        info!("👋 Desconectando de guild {}", self.guild_id);
        connection.destroy().await?;
        Ok(true)
    }
}
