//! # Guild Orchestrator
//!
//! Main-side authority over playback. Owns, per active guild, the request
//! queue, the track group currently streaming and its timing bookkeeping,
//! plus the handle of the worker that does the actual streaming.
//!
//! Workers never touch this state. They ask for work with `requestNext` and
//! report `disconnect`; the orchestrator answers with `play` or `leave`.
//! Events of one guild are handled in arrival order by a single event loop,
//! so per-guild queue mutation is effectively single-threaded.

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{pipeline::PipelineConfig, process::EncoderLauncher, replaygain::MetadataProbe},
    error::OrchestratorError,
    library::{Track, TrackLibrary},
    voice::VoicePlatform,
    worker::{
        protocol::{EventSink, GuildEvent, WorkerCommand, WorkerEvent},
        spawn_worker, WorkerContext, WorkerHandle,
    },
};

/// Espera máxima para que un worker nuevo quede conectado
const READY_TIMEOUT: Duration = Duration::from_secs(20);

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Estado de cola de un guild
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuildQueueState {
    /// Grupo de tracks en reproducción; `None` cuando no suena nada
    pub current_track: Option<Vec<Track>>,
    pub request_queue: VecDeque<Track>,
    pub playback_started_at: Option<DateTime<Utc>>,
    pub current_total_duration: Option<Duration>,
}

impl GuildQueueState {
    fn clear_current(&mut self) {
        self.current_track = None;
        self.playback_started_at = None;
        self.current_total_duration = None;
    }
}

/// Copia del estado de un guild para mostrar
#[derive(Debug, Clone, PartialEq)]
pub struct GuildQueueSnapshot {
    pub channel_id: ChannelId,
    pub current_track: Option<Vec<Track>>,
    pub request_queue: Vec<Track>,
    pub playback_started_at: Option<DateTime<Utc>>,
    pub current_total_duration: Option<Duration>,
}

impl GuildQueueSnapshot {
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed_at(Utc::now())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Utc::now())
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.playback_started_at?;
        Some((now - started).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let total = self.current_total_duration?;
        Some(total.saturating_sub(self.elapsed_at(now)?))
    }
}

struct GuildSession {
    channel_id: ChannelId,
    state: GuildQueueState,
    worker: WorkerHandle,
}

/// Aviso externo de que la cola de un guild cambió
#[cfg_attr(test, mockall::automock)]
pub trait QueueNotifier: Send + Sync {
    fn notify_queue_update(&self, guild_id: GuildId);
}

/// Notificador que solo deja constancia en el log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl QueueNotifier for LogNotifier {
    fn notify_queue_update(&self, guild_id: GuildId) {
        debug!("📣 Cola actualizada en guild {}", guild_id);
    }
}

/// Colaboradores externos del orquestador
#[derive(Clone)]
pub struct Collaborators {
    pub library: Arc<dyn TrackLibrary>,
    pub probe: Arc<dyn MetadataProbe>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub platform: Arc<dyn VoicePlatform>,
    pub notifier: Arc<dyn QueueNotifier>,
}

pub struct GuildOrchestrator {
    sessions: Arc<DashMap<GuildId, GuildSession>>,
    collaborators: Collaborators,
    pipeline: PipelineConfig,
    max_queue_size: usize,
    events_tx: mpsc::UnboundedSender<GuildEvent>,
}

impl GuildOrchestrator {
    /// Crea el orquestador junto al receptor de eventos de sus workers
    pub fn new(
        collaborators: Collaborators,
        pipeline: PipelineConfig,
        max_queue_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<GuildEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        (
            Self {
                sessions: Arc::new(DashMap::new()),
                collaborators,
                pipeline,
                max_queue_size,
                events_tx,
            },
            events_rx,
        )
    }

    /// Procesa los eventos de todos los workers en orden de llegada
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<GuildEvent>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                orchestrator.on_worker_event(event);
            }
            debug!("Bucle de eventos del orquestador finalizado");
        })
    }

    /// Creates the guild session and its worker, returning once the worker
    /// reports its voice connection ready or fails.
    ///
    /// `initial_queue` is in place before the worker exists, so its first
    /// `requestNext` already sees it instead of falling back to a random
    /// pick. A failed join leaves no state behind; the caller may simply
    /// retry.
    pub async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        bot_user_id: UserId,
        initial_queue: Vec<Track>,
    ) -> OrchestratorResult<()> {
        if initial_queue.len() > self.max_queue_size {
            return Err(OrchestratorError::QueueFull {
                guild: guild_id,
                max: self.max_queue_size,
            });
        }

        let ready = match self.sessions.entry(guild_id) {
            Entry::Occupied(_) => return Err(OrchestratorError::AlreadyActive(guild_id)),
            Entry::Vacant(slot) => {
                let (worker, ready) = spawn_worker(WorkerContext {
                    guild_id,
                    channel_id,
                    bot_user_id,
                    platform: self.collaborators.platform.clone(),
                    probe: self.collaborators.probe.clone(),
                    launcher: self.collaborators.launcher.clone(),
                    pipeline: self.pipeline.clone(),
                    events: EventSink::new(guild_id, self.events_tx.clone()),
                });

                slot.insert(GuildSession {
                    channel_id,
                    state: GuildQueueState {
                        request_queue: initial_queue.into(),
                        ..GuildQueueState::default()
                    },
                    worker,
                });
                ready
            }
        };

        let reason = match tokio::time::timeout(READY_TIMEOUT, ready).await {
            Ok(Ok(Ok(()))) => {
                info!("✅ Guild {} conectado al canal {}", guild_id, channel_id);
                return Ok(());
            }
            Ok(Ok(Err(reason))) => reason,
            Ok(Err(_)) => "worker exited before reporting readiness".to_string(),
            Err(_) => format!("voice connection not ready after {:?}", READY_TIMEOUT),
        };

        warn!("⚠️ No se pudo unir al guild {}: {}", guild_id, reason);
        if let Some((_, session)) = self.sessions.remove(&guild_id) {
            session.worker.send(WorkerCommand::Shutdown);
        }

        Err(OrchestratorError::ConnectFailed {
            guild: guild_id,
            reason,
        })
    }

    pub fn leave(&self, guild_id: GuildId) -> OrchestratorResult<()> {
        self.send(guild_id, WorkerCommand::Leave)
    }

    pub fn skip(&self, guild_id: GuildId) -> OrchestratorResult<()> {
        self.send(guild_id, WorkerCommand::Skip)
    }

    fn send(&self, guild_id: GuildId, command: WorkerCommand) -> OrchestratorResult<()> {
        let session = self
            .sessions
            .get(&guild_id)
            .ok_or(OrchestratorError::NoActiveGuild(guild_id))?;

        if !session.worker.send(command) {
            warn!("⚠️ Worker de guild {} ya no recibe comandos", guild_id);
        }
        Ok(())
    }

    /// Añade un track al final de la cola y devuelve su posición (1-based)
    pub fn enqueue(&self, guild_id: GuildId, track: Track) -> OrchestratorResult<usize> {
        let position = {
            let mut session = self
                .sessions
                .get_mut(&guild_id)
                .ok_or(OrchestratorError::NoActiveGuild(guild_id))?;

            let queue = &mut session.state.request_queue;
            if queue.len() >= self.max_queue_size {
                return Err(OrchestratorError::QueueFull {
                    guild: guild_id,
                    max: self.max_queue_size,
                });
            }

            debug!("➕ {} encolado en guild {}", track.display_title(), guild_id);
            queue.push_back(track);
            queue.len()
        };

        self.collaborators.notifier.notify_queue_update(guild_id);
        Ok(position)
    }

    /// Quita el track en `index` (0-based) de la cola
    pub fn remove_from_queue(&self, guild_id: GuildId, index: usize) -> OrchestratorResult<Track> {
        let removed = {
            let mut session = self
                .sessions
                .get_mut(&guild_id)
                .ok_or(OrchestratorError::NoActiveGuild(guild_id))?;

            session
                .state
                .request_queue
                .remove(index)
                .ok_or(OrchestratorError::OutOfRange { index })?
        };

        self.collaborators.notifier.notify_queue_update(guild_id);
        Ok(removed)
    }

    /// Vacía la cola y devuelve cuántos tracks se quitaron
    pub fn clear_queue(&self, guild_id: GuildId) -> OrchestratorResult<usize> {
        let cleared = {
            let mut session = self
                .sessions
                .get_mut(&guild_id)
                .ok_or(OrchestratorError::NoActiveGuild(guild_id))?;

            let cleared = session.state.request_queue.len();
            session.state.request_queue.clear();
            cleared
        };

        self.collaborators.notifier.notify_queue_update(guild_id);
        Ok(cleared)
    }

    pub fn get_guild_state(&self, guild_id: GuildId) -> Option<GuildQueueSnapshot> {
        self.sessions.get(&guild_id).map(|session| GuildQueueSnapshot {
            channel_id: session.channel_id,
            current_track: session.state.current_track.clone(),
            request_queue: session.state.request_queue.iter().cloned().collect(),
            playback_started_at: session.state.playback_started_at,
            current_total_duration: session.state.current_total_duration,
        })
    }

    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn on_worker_event(&self, event: GuildEvent) {
        let guild_id = event.guild_id;

        match WorkerEvent::try_from(event.envelope) {
            Ok(WorkerEvent::RequestNext) => self.request_next(guild_id),
            Ok(WorkerEvent::Disconnect) => self.on_disconnect(guild_id),
            Ok(WorkerEvent::Log(message)) => info!("🎧 [guild {}] {}", guild_id, message),
            Ok(WorkerEvent::Error(message)) => error!("❌ [guild {}] {}", guild_id, message),
            Err(e) => warn!("⚠️ Evento inválido de guild {}: {}", guild_id, e),
        }
    }

    /// Chooses what plays next: the queue head expanded to its sequence
    /// group, else a random pick, else the worker is told to leave.
    fn request_next(&self, guild_id: GuildId) {
        let library = &self.collaborators.library;

        let Some(mut session) = self.sessions.get_mut(&guild_id) else {
            debug!("requestNext de guild inactivo {}, ignorado", guild_id);
            return;
        };

        let next = match session.state.request_queue.pop_front() {
            Some(head) => {
                let run = library.sequence_tracks(&head);
                splice_run(&mut session.state.request_queue, &head, &run);
                Some(run)
            }
            None => library.random_item().map(|pick| library.sequence_tracks(&pick)),
        };

        match next.filter(|run| !run.is_empty()) {
            Some(run) => {
                let state = &mut session.state;
                state.current_track = Some(run.clone());
                state.playback_started_at = Some(Utc::now());
                state.current_total_duration = run
                    .iter()
                    .map(Track::library_duration)
                    .sum::<Option<Duration>>();

                info!(
                    "🎵 Guild {}: {} ({} track(s))",
                    guild_id,
                    run[0].display_title(),
                    run.len()
                );
                session.worker.send(WorkerCommand::Play(run.clone()));
                drop(session);

                self.collaborators.notifier.notify_queue_update(guild_id);
                self.spawn_duration_lookup(guild_id, run);
            }
            None => {
                info!("📭 Nada más que reproducir en guild {}, saliendo", guild_id);
                session.state.clear_current();
                session.worker.send(WorkerCommand::Leave);
                drop(session);

                self.collaborators.notifier.notify_queue_update(guild_id);
            }
        }
    }

    /// Refina la duración total con los metadatos de los archivos
    fn spawn_duration_lookup(&self, guild_id: GuildId, run: Vec<Track>) {
        let sessions = Arc::clone(&self.sessions);
        let probe = Arc::clone(&self.collaborators.probe);

        tokio::spawn(async move {
            let mut total = Duration::ZERO;
            for track in &run {
                let duration = match probe.resolve_duration(&track.location).await {
                    Some(duration) => duration,
                    None => match track.library_duration() {
                        Some(duration) => duration,
                        None => {
                            debug!("Duración desconocida para {}", track.name);
                            return;
                        }
                    },
                };
                total += duration;
            }

            if let Some(mut session) = sessions.get_mut(&guild_id) {
                // Solo si sigue sonando el mismo grupo
                if session.state.current_track.as_ref() == Some(&run) {
                    session.state.current_total_duration = Some(total);
                }
            }
        });
    }

    fn on_disconnect(&self, guild_id: GuildId) {
        let Some((_, session)) = self.sessions.remove(&guild_id) else {
            debug!("disconnect de guild inactivo {}, ignorado", guild_id);
            return;
        };

        session.worker.send(WorkerCommand::Shutdown);
        info!("👋 Guild {} desconectado, estado eliminado", guild_id);
        self.collaborators.notifier.notify_queue_update(guild_id);
    }

    /// Envía `shutdown` a todos los workers y espera, acotado, a que terminen
    pub async fn shutdown_all(&self, timeout: Duration) {
        let guilds = self.active_guilds();
        if guilds.is_empty() {
            return;
        }

        info!("🛑 Cerrando {} worker(s)", guilds.len());

        let workers: Vec<WorkerHandle> = guilds
            .into_iter()
            .filter_map(|guild_id| self.sessions.remove(&guild_id))
            .map(|(_, session)| {
                session.worker.send(WorkerCommand::Shutdown);
                session.worker
            })
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for worker in workers {
            let guild_id = worker.guild_id();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !worker.wait_finished(remaining).await {
                error!("🧟 Worker de guild {} no terminó a tiempo", guild_id);
            }
        }
    }

    #[cfg(test)]
    fn insert_session(&self, guild_id: GuildId, channel_id: ChannelId, worker: WorkerHandle) {
        self.sessions.insert(
            guild_id,
            GuildSession {
                channel_id,
                state: GuildQueueState::default(),
                worker,
            },
        );
    }
}

/// Removes from `queue` the other members of the run that `head` expanded
/// to, one occurrence each. The order of what remains is untouched.
fn splice_run(queue: &mut VecDeque<Track>, head: &Track, run: &[Track]) {
    for member in run.iter().filter(|t| t.persistent_id != head.persistent_id) {
        if let Some(position) = queue
            .iter()
            .position(|queued| queued.persistent_id == member.persistent_id)
        {
            queue.remove(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        library::JsonLibrary,
        testing::{track, wait_until, FakeLauncher, FakePlatform, StaticProbe},
        worker::protocol::{CommandEnvelope, EventEnvelope},
    };
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(5);
    const CHANNEL: ChannelId = ChannelId::new(50);
    const BOT: UserId = UserId::new(1);

    fn movement(id: &str, number: u32) -> Track {
        track(id)
            .with_album("Suite", "Composer")
            .with_sequence("suite", 1, number)
    }

    fn collaborators(catalog: Vec<Track>, notifier: Arc<dyn QueueNotifier>) -> Collaborators {
        Collaborators {
            library: Arc::new(JsonLibrary::from_tracks(catalog)),
            probe: Arc::new(StaticProbe::default()),
            launcher: Arc::new(FakeLauncher::default()),
            platform: Arc::new(FakePlatform::default()),
            notifier,
        }
    }

    fn quiet_notifier() -> Arc<dyn QueueNotifier> {
        let mut notifier = MockQueueNotifier::new();
        notifier.expect_notify_queue_update().returning(|_| ());
        Arc::new(notifier)
    }

    /// Orquestador con un worker falso cuyos comandos se pueden leer
    fn detached(
        catalog: Vec<Track>,
        notifier: Arc<dyn QueueNotifier>,
    ) -> (GuildOrchestrator, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let (orchestrator, _events) =
            GuildOrchestrator::new(collaborators(catalog, notifier), PipelineConfig::default(), 3);
        let (worker, commands) = WorkerHandle::detached(GUILD);
        orchestrator.insert_session(GUILD, CHANNEL, worker);
        (orchestrator, commands)
    }

    fn event(worker_event: WorkerEvent) -> GuildEvent {
        GuildEvent {
            guild_id: GUILD,
            envelope: EventEnvelope::from(worker_event),
        }
    }

    fn next_command(commands: &mut mpsc::UnboundedReceiver<CommandEnvelope>) -> WorkerCommand {
        WorkerCommand::try_from(commands.try_recv().expect("no command sent")).unwrap()
    }

    #[tokio::test]
    async fn test_request_next_dequeues_sequence_and_keeps_suffix() {
        let catalog = vec![movement("M3", 3), movement("M1", 1), movement("M2", 2), track("X"), track("Y")];
        let (orchestrator, mut commands) = detached(catalog.clone(), quiet_notifier());

        for id in ["M2", "X", "M1", "Y", "M3"] {
            let queued = catalog.iter().find(|t| t.persistent_id == id).unwrap().clone();
            orchestrator.sessions.get_mut(&GUILD).unwrap().state.request_queue.push_back(queued);
        }

        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));

        let expected = vec![movement("M1", 1), movement("M2", 2), movement("M3", 3)];
        assert_eq!(next_command(&mut commands), WorkerCommand::Play(expected.clone()));

        let snapshot = orchestrator.get_guild_state(GUILD).unwrap();
        assert_eq!(snapshot.current_track, Some(expected));
        assert_eq!(snapshot.request_queue, vec![track("X"), track("Y")]);
        assert!(snapshot.playback_started_at.is_some());
    }

    #[tokio::test]
    async fn test_single_track_catalog_repeats() {
        let (orchestrator, mut commands) = detached(vec![track("T")], quiet_notifier());

        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));
        assert_eq!(next_command(&mut commands), WorkerCommand::Play(vec![track("T")]));

        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));
        assert_eq!(next_command(&mut commands), WorkerCommand::Play(vec![track("T")]));
    }

    #[tokio::test]
    async fn test_exhausted_pool_sends_leave_and_clears_current() {
        let (orchestrator, mut commands) =
            detached(vec![track("Hidden").excluded_from_shuffle()], quiet_notifier());

        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));

        assert_eq!(next_command(&mut commands), WorkerCommand::Leave);
        let snapshot = orchestrator.get_guild_state(GUILD).unwrap();
        assert_eq!(snapshot.current_track, None);
        assert_eq!(snapshot.playback_started_at, None);
    }

    #[tokio::test]
    async fn test_queue_limits_and_edits_notify() {
        let mut notifier = MockQueueNotifier::new();
        notifier
            .expect_notify_queue_update()
            .withf(|guild| *guild == GUILD)
            .times(5)
            .returning(|_| ());
        let (orchestrator, _commands) = detached(Vec::new(), Arc::new(notifier));

        assert_eq!(orchestrator.enqueue(GUILD, track("A")).unwrap(), 1);
        assert_eq!(orchestrator.enqueue(GUILD, track("B")).unwrap(), 2);
        assert_eq!(orchestrator.enqueue(GUILD, track("C")).unwrap(), 3);
        assert!(matches!(
            orchestrator.enqueue(GUILD, track("D")),
            Err(OrchestratorError::QueueFull { max: 3, .. })
        ));

        assert_eq!(orchestrator.remove_from_queue(GUILD, 1).unwrap(), track("B"));
        assert!(matches!(
            orchestrator.remove_from_queue(GUILD, 7),
            Err(OrchestratorError::OutOfRange { index: 7 })
        ));
        assert_eq!(orchestrator.clear_queue(GUILD).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_commands_to_inactive_guild_are_rejected() {
        let (orchestrator, _events) =
            GuildOrchestrator::new(collaborators(Vec::new(), quiet_notifier()), PipelineConfig::default(), 10);

        assert!(matches!(orchestrator.skip(GUILD), Err(OrchestratorError::NoActiveGuild(_))));
        assert!(matches!(orchestrator.leave(GUILD), Err(OrchestratorError::NoActiveGuild(_))));
        assert!(orchestrator.get_guild_state(GUILD).is_none());

        // Eventos de guilds desconocidos no hacen nada
        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));
        orchestrator.on_worker_event(event(WorkerEvent::Disconnect));
        assert!(orchestrator.active_guilds().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_shuts_worker_down_and_drops_state() {
        let (orchestrator, mut commands) = detached(vec![track("T")], quiet_notifier());

        orchestrator.on_worker_event(event(WorkerEvent::Disconnect));

        assert_eq!(next_command(&mut commands), WorkerCommand::Shutdown);
        assert!(orchestrator.get_guild_state(GUILD).is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_tag_is_ignored() {
        let (orchestrator, mut commands) = detached(vec![track("T")], quiet_notifier());

        orchestrator.on_worker_event(GuildEvent {
            guild_id: GUILD,
            envelope: EventEnvelope {
                version: crate::worker::protocol::PROTOCOL_VERSION,
                event: "progress".to_string(),
                message: None,
                error: None,
            },
        });

        assert!(commands.try_recv().is_err());
        assert!(orchestrator.get_guild_state(GUILD).is_some());
    }

    #[tokio::test]
    async fn test_duration_refined_from_metadata() {
        let catalog = vec![movement("M1", 1), movement("M2", 2)];
        let (orchestrator, _commands) = detached(catalog, quiet_notifier());

        orchestrator.on_worker_event(event(WorkerEvent::RequestNext));

        wait_until(|| {
            orchestrator
                .get_guild_state(GUILD)
                .and_then(|s| s.current_total_duration)
                == Some(Duration::from_secs(360))
        })
        .await;
    }

    #[test]
    fn test_snapshot_elapsed_and_remaining() {
        let started = Utc::now();
        let snapshot = GuildQueueSnapshot {
            channel_id: CHANNEL,
            current_track: Some(vec![track("T")]),
            request_queue: Vec::new(),
            playback_started_at: Some(started),
            current_total_duration: Some(Duration::from_secs(200)),
        };

        let later = started + chrono::Duration::seconds(50);
        assert_eq!(snapshot.elapsed_at(later), Some(Duration::from_secs(50)));
        assert_eq!(snapshot.remaining_at(later), Some(Duration::from_secs(150)));

        let overrun = started + chrono::Duration::seconds(500);
        assert_eq!(snapshot.remaining_at(overrun), Some(Duration::ZERO));
    }

    struct Live {
        orchestrator: Arc<GuildOrchestrator>,
        launcher: FakeLauncher,
        platform: FakePlatform,
    }

    /// Orquestador completo sobre workers reales y plataforma falsa
    async fn live(catalog: Vec<Track>) -> Live {
        live_with_queue(catalog, Vec::new()).await
    }

    async fn live_with_queue(catalog: Vec<Track>, initial_queue: Vec<Track>) -> Live {
        let launcher = FakeLauncher::default();
        let platform = FakePlatform::default();
        let (orchestrator, events) = GuildOrchestrator::new(
            Collaborators {
                library: Arc::new(JsonLibrary::from_tracks(catalog)),
                probe: Arc::new(StaticProbe::default()),
                launcher: Arc::new(launcher.clone()),
                platform: Arc::new(platform.clone()),
                notifier: Arc::new(LogNotifier),
            },
            PipelineConfig::default(),
            100,
        );
        let orchestrator = Arc::new(orchestrator);
        orchestrator.spawn_event_loop(events);

        orchestrator.join(GUILD, CHANNEL, BOT, initial_queue).await.unwrap();
        Live {
            orchestrator,
            launcher,
            platform,
        }
    }

    fn current_ids(orchestrator: &GuildOrchestrator) -> Option<Vec<String>> {
        orchestrator
            .get_guild_state(GUILD)?
            .current_track
            .map(|run| run.into_iter().map(|t| t.persistent_id).collect())
    }

    #[tokio::test]
    async fn test_skip_with_queue_plays_head_after_termination() {
        let catalog = vec![
            track("C"),
            track("A").excluded_from_shuffle(),
            track("B").excluded_from_shuffle(),
        ];
        let Live {
            orchestrator,
            launcher,
            platform,
        } = live(catalog).await;

        wait_until(|| platform.subscriptions(GUILD).len() == 1).await;
        orchestrator.enqueue(GUILD, track("A")).unwrap();
        orchestrator.enqueue(GUILD, track("B")).unwrap();

        orchestrator.skip(GUILD).unwrap();

        wait_until(|| platform.subscriptions(GUILD).len() == 2).await;
        assert_eq!(launcher.history(), vec!["launch:C", "stop:C", "launch:A"]);
        assert_eq!(current_ids(&orchestrator), Some(vec!["A".to_string()]));
        assert_eq!(
            orchestrator.get_guild_state(GUILD).unwrap().request_queue,
            vec![track("B")]
        );
    }

    #[tokio::test]
    async fn test_join_with_request_plays_it_before_any_random_pick() {
        let catalog = vec![track("R"), track("Wanted").excluded_from_shuffle()];
        let Live {
            orchestrator,
            launcher,
            platform,
        } = live_with_queue(catalog, vec![track("Wanted")]).await;

        wait_until(|| platform.subscriptions(GUILD).len() == 1).await;

        assert_eq!(launcher.launched_ids(), vec![vec!["Wanted".to_string()]]);
        assert_eq!(current_ids(&orchestrator), Some(vec!["Wanted".to_string()]));
        assert!(orchestrator.get_guild_state(GUILD).unwrap().request_queue.is_empty());
    }

    #[tokio::test]
    async fn test_join_rejects_oversized_initial_queue() {
        let (orchestrator, _events) = GuildOrchestrator::new(
            collaborators(vec![track("C")], quiet_notifier()),
            PipelineConfig::default(),
            1,
        );

        assert!(matches!(
            orchestrator
                .join(GUILD, CHANNEL, BOT, vec![track("A"), track("B")])
                .await,
            Err(OrchestratorError::QueueFull { max: 1, .. })
        ));
        assert!(orchestrator.active_guilds().is_empty());
    }

    #[tokio::test]
    async fn test_leave_while_playing_ends_with_disconnect() {
        let Live {
            orchestrator,
            launcher,
            platform,
        } = live(vec![track("C")]).await;

        wait_until(|| platform.subscriptions(GUILD).len() == 1).await;
        orchestrator.leave(GUILD).unwrap();

        wait_until(|| orchestrator.get_guild_state(GUILD).is_none()).await;
        assert_eq!(platform.destroyed(), vec![GUILD]);
        assert_eq!(launcher.launched_ids(), vec![vec!["C".to_string()]]);
        assert_eq!(launcher.terminated(), 1);
    }

    #[tokio::test]
    async fn test_join_twice_and_failed_join() {
        let Live { orchestrator, .. } = live(vec![track("C")]).await;
        assert!(matches!(
            orchestrator.join(GUILD, CHANNEL, BOT, Vec::new()).await,
            Err(OrchestratorError::AlreadyActive(_))
        ));

        let (failing, _events) = GuildOrchestrator::new(
            Collaborators {
                platform: Arc::new(FakePlatform::failing()),
                ..collaborators(vec![track("C")], quiet_notifier())
            },
            PipelineConfig::default(),
            10,
        );
        assert!(matches!(
            failing.join(GUILD, CHANNEL, BOT, vec![track("C")]).await,
            Err(OrchestratorError::ConnectFailed { .. })
        ));
        assert!(failing.active_guilds().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_every_worker() {
        let Live {
            orchestrator,
            launcher,
            platform,
        } = live(vec![track("C")]).await;
        wait_until(|| platform.subscriptions(GUILD).len() == 1).await;

        orchestrator.shutdown_all(Duration::from_secs(5)).await;

        assert!(orchestrator.active_guilds().is_empty());
        assert_eq!(launcher.terminated(), 1);
    }
}
