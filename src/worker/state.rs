//! Playback state machine of a guild worker.
//!
//! Every connection signal, command and voice-state change funnels through
//! [`PlaybackMachine::handle`], which returns the side effects to run. Leave
//! handling lives in one place: once a leave is pending, idle signals only
//! clean up and never request another track.

use serenity::model::id::{ChannelId, UserId};

use crate::{library::Track, voice::VoiceStateChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Connecting,
    Ready,
    Playing,
    LeavePending,
    Destroyed,
}

/// Estímulos que recibe la máquina
#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    ConnectRequested,
    ConnectionReady,
    Play(Vec<Track>),
    /// El pipeline no pudo arrancar
    StartFailed,
    StreamIdle,
    Skip,
    Leave,
    ListenersGone,
    ConnectionDestroyed,
    Shutdown,
}

/// Efectos que el worker ejecuta, en orden
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect,
    RequestNext,
    StartPipeline(Vec<Track>),
    StopPipeline,
    TearDown,
    EmitDisconnect,
    Exit,
}

#[derive(Debug)]
pub struct PlaybackMachine {
    state: PlaybackState,
}

impl Default for PlaybackMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackMachine {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn handle(&mut self, stimulus: Stimulus) -> Vec<Action> {
        use PlaybackState::*;

        match (self.state, stimulus) {
            (Idle, Stimulus::ConnectRequested) => {
                self.state = Connecting;
                vec![Action::Connect]
            }

            (Connecting, Stimulus::ConnectionReady) => {
                self.state = Ready;
                vec![Action::RequestNext]
            }

            (Ready | Playing, Stimulus::Play(tracks)) => {
                self.state = Playing;
                vec![Action::StartPipeline(tracks)]
            }

            // Sin pipeline no habrá idle: pedir otra pista
            (Playing, Stimulus::StartFailed) => {
                self.state = Ready;
                vec![Action::RequestNext]
            }

            (Playing, Stimulus::StreamIdle) => {
                self.state = Ready;
                vec![Action::StopPipeline, Action::RequestNext]
            }
            (LeavePending, Stimulus::StreamIdle) => vec![Action::StopPipeline],

            (Playing, Stimulus::Skip) => vec![Action::StopPipeline],

            (Idle | Connecting | Ready | Playing, Stimulus::Leave | Stimulus::ListenersGone) => {
                self.state = LeavePending;
                vec![Action::StopPipeline, Action::TearDown]
            }

            (Destroyed, Stimulus::ConnectionDestroyed) => Vec::new(),
            (_, Stimulus::ConnectionDestroyed) => {
                self.state = Destroyed;
                vec![Action::StopPipeline, Action::EmitDisconnect]
            }

            (_, Stimulus::Shutdown) => {
                self.state = Destroyed;
                vec![Action::StopPipeline, Action::TearDown, Action::Exit]
            }

            // Estímulos fuera de lugar (play tras leave, idle obsoleto...)
            _ => Vec::new(),
        }
    }
}

/// Decides whether a voice-state change leaves the bot's channel empty.
///
/// Only changes that touch `channel` count, and the bot's own moves are
/// ignored; then the channel is empty when no non-bot listener remains.
pub fn listeners_gone(change: &VoiceStateChange, bot_id: UserId, channel: ChannelId) -> bool {
    if change.user_id == bot_id {
        return false;
    }

    let touches_channel =
        change.old_channel == Some(channel) || change.new_channel == Some(channel);
    if !touches_channel {
        return false;
    }

    change.listeners == 0
}
