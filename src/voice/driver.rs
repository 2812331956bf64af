use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    error::ControlError,
    input::{AudioStream, Input, LiveInput},
    tracks::TrackHandle,
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use symphonia::core::{
    io::{MediaSource, ReadOnlySource},
    probe::Hint,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::pipeline::OpusStream,
    voice::{VoiceConnection, VoicePlatform, VoiceSignal, VoiceStateChange},
};

/// Canal de señales del worker dueño de un guild
struct Route {
    channel_id: ChannelId,
    signals: mpsc::UnboundedSender<VoiceSignal>,
}

/// Voice platform backed by songbird.
///
/// Keeps a route per connected guild so gateway voice-state updates reach
/// the worker that owns the guild.
#[derive(Clone)]
pub struct SongbirdPlatform {
    manager: Arc<Songbird>,
    routes: Arc<DashMap<GuildId, Route>>,
}

impl SongbirdPlatform {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Canal de voz en el que está el bot para `guild_id`
    pub fn channel_of(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.routes.get(&guild_id).map(|route| route.channel_id)
    }

    /// Entrega un cambio de estado de voz al worker del guild, si existe
    pub fn route_voice_state(&self, guild_id: GuildId, change: VoiceStateChange) -> bool {
        match self.routes.get(&guild_id) {
            Some(route) => route.signals.send(VoiceSignal::VoiceStateChanged(change)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl VoicePlatform for SongbirdPlatform {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        signals: mpsc::UnboundedSender<VoiceSignal>,
    ) -> Result<Box<dyn VoiceConnection>> {
        info!("🔗 Conectando al canal {} en guild {}", channel_id, guild_id);

        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| anyhow!("failed to join channel {}: {:?}", channel_id, e))?;

        {
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier {
                    guild_id,
                    signals: signals.clone(),
                },
            );
        }

        self.routes.insert(
            guild_id,
            Route {
                channel_id,
                signals: signals.clone(),
            },
        );
        let _ = signals.send(VoiceSignal::Ready);

        Ok(Box::new(SongbirdConnection {
            guild_id,
            channel_id,
            call,
            manager: self.manager.clone(),
            routes: self.routes.clone(),
            signals,
            track: None,
        }))
    }
}

struct SongbirdConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    call: Arc<Mutex<Call>>,
    manager: Arc<Songbird>,
    routes: Arc<DashMap<GuildId, Route>>,
    signals: mpsc::UnboundedSender<VoiceSignal>,
    track: Option<TrackHandle>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    async fn subscribe(&mut self, stream: OpusStream, generation: u64) -> Result<()> {
        let mut hint = Hint::new();
        hint.with_extension("ogg");

        let source: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(stream));
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: source,
                hint: Some(hint),
            }),
            None,
        );

        // play_only_input detiene cualquier pista anterior
        let track = {
            let mut handler = self.call.lock().await;
            handler.play_only_input(input)
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(
                    Event::Track(event),
                    IdleNotifier {
                        generation,
                        signals: self.signals.clone(),
                    },
                )
                .map_err(|e| anyhow!("failed to watch stream #{}: {:?}", generation, e))?;
        }

        debug!("Stream #{} suscrito en guild {}", generation, self.guild_id);
        self.track = Some(track);
        Ok(())
    }

    async fn stop_stream(&mut self) -> Result<()> {
        let Some(track) = self.track.take() else {
            return Ok(());
        };

        // Dispara TrackEvent::End, que reporta el idle de esa generación
        match track.stop() {
            // La pista ya había terminado sola
            Ok(()) | Err(ControlError::Finished) => Ok(()),
            Err(e) => Err(anyhow!("failed to stop stream in guild {}: {:?}", self.guild_id, e)),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        self.track = None;
        self.routes.remove(&self.guild_id);
        let result = self.manager.remove(self.guild_id).await;
        let _ = self.signals.send(VoiceSignal::Destroyed);

        result.map_err(|e| anyhow!("failed to leave guild {}: {:?}", self.guild_id, e))
    }
}

/// Reporta el fin (o error) de un stream con su generación
struct IdleNotifier {
    generation: u64,
    signals: mpsc::UnboundedSender<VoiceSignal>,
}

#[async_trait]
impl VoiceEventHandler for IdleNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                debug!("Stream #{} terminó en estado {:?}", self.generation, state.playing);
            }
        }

        let _ = self.signals.send(VoiceSignal::StreamIdle {
            generation: self.generation,
        });
        None
    }
}

struct DisconnectNotifier {
    guild_id: GuildId,
    signals: mpsc::UnboundedSender<VoiceSignal>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            warn!(
                "🔌 Driver de voz desconectado en guild {}: {:?} ({:?})",
                self.guild_id, data.kind, data.reason
            );
        }

        let _ = self.signals.send(VoiceSignal::Destroyed);
        None
    }
}
