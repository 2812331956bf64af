//! # Worker Module
//!
//! One isolated task per active guild. The worker owns that guild's voice
//! connection and encoder pipeline; the orchestrator only reaches it through
//! versioned [`protocol::CommandEnvelope`]s and hears back through
//! [`protocol::EventEnvelope`]s. Nothing else is shared.
//!
//! Inside the worker, commands and voice signals are serialized through a
//! single loop and fed to the [`state::PlaybackMachine`].

use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{pipeline::PipelineConfig, process::EncoderLauncher, replaygain::MetadataProbe},
    voice::{VoicePlatform, VoiceSignal},
};

pub mod connection;
pub mod protocol;
pub mod state;

use connection::ConnectionSupervisor;
use protocol::{CommandEnvelope, EventSink, WorkerCommand, WorkerEvent};
use state::{listeners_gone, Action, PlaybackMachine, PlaybackState, Stimulus};

/// Fallos de arranque consecutivos antes de abandonar el canal
const MAX_START_FAILURES: u32 = 3;

/// Resultado de la conexión inicial del worker
pub type ReadyResult = Result<(), String>;

/// Todo lo que un worker necesita para arrancar
pub struct WorkerContext {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub bot_user_id: UserId,
    pub platform: Arc<dyn VoicePlatform>,
    pub probe: Arc<dyn MetadataProbe>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub pipeline: PipelineConfig,
    pub events: EventSink,
}

/// Referencia del orquestador a un worker
#[derive(Debug)]
pub struct WorkerHandle {
    guild_id: GuildId,
    commands: mpsc::UnboundedSender<CommandEnvelope>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Envía un comando; `false` si el worker ya terminó
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.send_envelope(command.into())
    }

    pub fn send_envelope(&self, envelope: CommandEnvelope) -> bool {
        self.commands.send(envelope).is_ok()
    }

    /// Espera, acotado, a que la tarea del worker termine
    pub async fn wait_finished(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.task).await.is_ok()
    }

    /// Handle sin worker detrás; los comandos quedan en el receptor
    #[cfg(test)]
    pub fn detached(guild_id: GuildId) -> (Self, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            guild_id,
            commands,
            task: tokio::spawn(async {}),
        };
        (handle, rx)
    }
}

/// Spawns the worker for one guild.
///
/// The returned receiver resolves once the voice connection is ready, or
/// with the failure reason. A panic inside the worker is reported upward as
/// `error` followed by `disconnect`.
pub fn spawn_worker(context: WorkerContext) -> (WorkerHandle, oneshot::Receiver<ReadyResult>) {
    let guild_id = context.guild_id;
    let events = context.events.clone();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    let inner = tokio::spawn(run(context, commands_rx, ready_tx));
    let task = tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                error!("💥 Worker de guild {} terminó con pánico", guild_id);
                events.error(format!("worker panicked: {}", e));
                events.send(WorkerEvent::Disconnect);
            }
        }
    });

    (
        WorkerHandle {
            guild_id,
            commands: commands_tx,
            task,
        },
        ready_rx,
    )
}

async fn run(
    context: WorkerContext,
    mut commands: mpsc::UnboundedReceiver<CommandEnvelope>,
    ready: oneshot::Sender<ReadyResult>,
) {
    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    let mut worker = Worker::new(context, signals_tx, ready);

    info!("🧵 Worker iniciado para guild {}", worker.guild_id);

    if !worker.apply(Stimulus::ConnectRequested).await {
        return;
    }

    loop {
        let stimulus = tokio::select! {
            command = commands.recv() => match command {
                Some(envelope) => worker.decode_command(envelope),
                // El orquestador soltó el handle
                None => Some(Stimulus::Shutdown),
            },
            Some(signal) = signals.recv() => worker.decode_signal(signal),
        };

        if let Some(stimulus) = stimulus {
            if !worker.apply(stimulus).await {
                break;
            }
        }
    }

    info!("🧵 Worker finalizado para guild {}", worker.guild_id);
}

struct Worker {
    guild_id: GuildId,
    bot_user_id: UserId,
    machine: PlaybackMachine,
    connection: ConnectionSupervisor,
    events: EventSink,
    ready: Option<oneshot::Sender<ReadyResult>>,
    start_failures: u32,
}

impl Worker {
    fn new(
        context: WorkerContext,
        signals: mpsc::UnboundedSender<VoiceSignal>,
        ready: oneshot::Sender<ReadyResult>,
    ) -> Self {
        let connection = ConnectionSupervisor::new(
            context.guild_id,
            context.channel_id,
            context.platform,
            context.probe,
            context.launcher,
            context.pipeline,
            context.events.clone(),
            signals,
        );

        Self {
            guild_id: context.guild_id,
            bot_user_id: context.bot_user_id,
            machine: PlaybackMachine::new(),
            connection,
            events: context.events,
            ready: Some(ready),
            start_failures: 0,
        }
    }

    fn decode_command(&self, envelope: CommandEnvelope) -> Option<Stimulus> {
        match WorkerCommand::try_from(envelope) {
            Ok(WorkerCommand::Play(tracks)) => Some(Stimulus::Play(tracks)),
            Ok(WorkerCommand::Skip) => Some(Stimulus::Skip),
            Ok(WorkerCommand::Leave) => Some(Stimulus::Leave),
            Ok(WorkerCommand::Shutdown) => Some(Stimulus::Shutdown),
            Err(e) => {
                // Error local: no se reenvía al orquestador
                warn!("⚠️ Comando inválido para guild {}: {}", self.guild_id, e);
                None
            }
        }
    }

    fn decode_signal(&mut self, signal: VoiceSignal) -> Option<Stimulus> {
        match signal {
            VoiceSignal::Ready => {
                self.report_ready(Ok(()));
                Some(Stimulus::ConnectionReady)
            }
            VoiceSignal::StreamIdle { generation } => {
                if self.connection.is_current(generation) {
                    self.connection.consume_idle(generation);
                    Some(Stimulus::StreamIdle)
                } else {
                    debug!("Idle obsoleto #{} ignorado en guild {}", generation, self.guild_id);
                    None
                }
            }
            VoiceSignal::Destroyed => Some(Stimulus::ConnectionDestroyed),
            VoiceSignal::VoiceStateChanged(change) => {
                if listeners_gone(&change, self.bot_user_id, self.connection.channel_id()) {
                    info!("🚶 No quedan oyentes en guild {}, saliendo", self.guild_id);
                    Some(Stimulus::ListenersGone)
                } else {
                    None
                }
            }
        }
    }

    fn report_ready(&mut self, result: ReadyResult) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    /// Ejecuta las acciones de la máquina; devuelve `false` cuando el worker debe terminar
    async fn apply(&mut self, stimulus: Stimulus) -> bool {
        let mut pending = VecDeque::from([stimulus]);

        while let Some(stimulus) = pending.pop_front() {
            for action in self.machine.handle(stimulus) {
                match action {
                    Action::Connect => {
                        if let Err(e) = self.connection.connect().await {
                            error!("❌ No se pudo conectar en guild {}: {:#}", self.guild_id, e);
                            self.events.error(format!("voice connection failed: {:#}", e));
                            self.report_ready(Err(format!("{:#}", e)));
                            return false;
                        }
                        self.events
                            .log(format!("connected to channel {}", self.connection.channel_id()));
                    }

                    Action::RequestNext => self.events.send(WorkerEvent::RequestNext),

                    Action::StartPipeline(tracks) => {
                        let title = tracks.first().map(|t| t.display_title()).unwrap_or_default();
                        match self.connection.play(tracks).await {
                            Ok(()) => {
                                self.start_failures = 0;
                                self.events.log(format!("now playing {}", title));
                            }
                            Err(e) => {
                                self.start_failures += 1;
                                error!(
                                    "❌ Falló el inicio de reproducción en guild {} ({}/{}): {:#}",
                                    self.guild_id, self.start_failures, MAX_START_FAILURES, e
                                );
                                self.events.error(format!("failed to start playback: {:#}", e));

                                if self.start_failures >= MAX_START_FAILURES {
                                    pending.push_back(Stimulus::Leave);
                                } else {
                                    pending.push_back(Stimulus::StartFailed);
                                }
                            }
                        }
                    }

                    Action::StopPipeline => {
                        let outcome = self.connection.stop_pipeline().await;
                        if outcome.is_some_and(|o| o.is_fatal())
                            && self.machine.state() == PlaybackState::Destroyed
                        {
                            error!(
                                "🧟 Worker de guild {} filtrado: el codificador sigue vivo",
                                self.guild_id
                            );
                        }
                    }

                    Action::TearDown => match self.connection.disconnect().await {
                        // La plataforma emitirá Destroyed
                        Ok(true) => {}
                        Ok(false) => pending.push_back(Stimulus::ConnectionDestroyed),
                        Err(e) => {
                            warn!("⚠️ Error al desconectar guild {}: {:#}", self.guild_id, e);
                            self.events.error(format!("failed to disconnect: {:#}", e));
                            pending.push_back(Stimulus::ConnectionDestroyed);
                        }
                    },

                    Action::EmitDisconnect => {
                        self.report_ready(Err("connection closed before ready".to_string()));
                        self.events.send(WorkerEvent::Disconnect);
                    }

                    Action::Exit => {
                        self.report_ready(Err("worker shut down".to_string()));
                        return false;
                    }
                }
            }
        }

        true
    }
}
