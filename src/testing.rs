//! In-process fakes for the encoder, the metadata probe and the voice
//! platform, shared by the unit tests of several modules.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::HashMap,
    io::{self, Read},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{mpsc, watch},
};

use crate::{
    audio::{
        filter::EncoderSpec,
        pipeline::OpusStream,
        process::{EncoderLauncher, EncoderProcess, LaunchedEncoder, ProcessExit},
        replaygain::{MetadataProbe, ReplayGain},
    },
    error::PipelineError,
    library::Track,
    voice::{VoiceConnection, VoicePlatform, VoiceSignal},
};

/// Track cuyo id coincide con el nombre de archivo, como espera [`FakeLauncher`]
pub fn track(id: &str) -> Track {
    Track::new(id, id, format!("/music/{}.flac", id))
}

/// Espera activa acotada hasta que `cond` se cumpla
pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

struct EncoderSlot {
    ids: Vec<String>,
    exit: watch::Sender<Option<ProcessExit>>,
    writer: Option<DuplexStream>,
}

impl EncoderSlot {
    fn finish(&mut self, exit: ProcessExit) {
        if self.exit.borrow().is_none() {
            self.exit.send_replace(Some(exit));
        }
        // Cerrar la salida: el stream llega a EOF
        self.writer.take();
    }
}

#[derive(Default)]
struct LauncherState {
    slots: Vec<EncoderSlot>,
    history: Vec<String>,
    terminated: usize,
    failing: bool,
    /// Los codificadores ignoran tanto `q` como kill
    stubborn: bool,
}

/// Launcher whose "encoders" are duplex pipes that stay open until stopped.
///
/// Track ids are recovered from the input file stems, so tests should build
/// tracks with [`track`].
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        let launcher = Self::default();
        launcher.set_failing(true);
        launcher
    }

    pub fn stubborn() -> Self {
        let launcher = Self::default();
        launcher.state.lock().stubborn = true;
        launcher
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn launched_ids(&self) -> Vec<Vec<String>> {
        self.state.lock().slots.iter().map(|s| s.ids.clone()).collect()
    }

    /// Lanzamientos y paradas en orden: `launch:A,B`, `stop:A,B`
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub fn terminated(&self) -> usize {
        self.state.lock().terminated
    }

    /// El último codificador termina por su cuenta con `code`
    pub fn crash_last(&self, code: i32) {
        if let Some(slot) = self.state.lock().slots.last_mut() {
            slot.finish(ProcessExit::Code(code));
        }
    }

    /// El último codificador termina normalmente (fin de la pista)
    pub fn finish_last(&self) {
        self.crash_last(0);
    }

    /// Escribe `data` en la salida del último codificador, como audio ya codificado
    pub async fn feed_last(&self, data: &[u8]) {
        let writer = self.state.lock().slots.last_mut().and_then(|slot| slot.writer.take());
        let Some(mut writer) = writer else {
            return;
        };

        // Si el proceso terminó mientras escribíamos, la salida queda cerrada
        let _ = writer.write_all(data).await;

        let mut state = self.state.lock();
        if let Some(slot) = state.slots.last_mut() {
            if slot.exit.borrow().is_none() {
                slot.writer = Some(writer);
            }
        }
    }
}

impl EncoderLauncher for FakeLauncher {
    fn launch(&self, spec: &EncoderSpec) -> Result<LaunchedEncoder, PipelineError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(PipelineError::Spawn {
                program: spec.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "fake encoder unavailable"),
            });
        }

        let ids: Vec<String> = spec
            .args
            .iter()
            .zip(spec.args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-i")
            .filter_map(|(_, path)| Path::new(path).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .collect();

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);

        state.history.push(format!("launch:{}", ids.join(",")));
        state.slots.push(EncoderSlot {
            ids,
            exit: exit_tx,
            writer: Some(writer),
        });
        let index = state.slots.len() - 1;

        Ok(LaunchedEncoder {
            process: Box::new(FakeProcess {
                index,
                state: self.state.clone(),
                exit: exit_rx,
            }),
            output: Box::new(reader),
        })
    }
}

struct FakeProcess {
    index: usize,
    state: Arc<Mutex<LauncherState>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl FakeProcess {
    fn finish(&self, exit: ProcessExit, record_stop: bool) {
        let mut state = self.state.lock();
        if state.stubborn {
            return;
        }
        if record_stop {
            let ids = state.slots[self.index].ids.join(",");
            state.history.push(format!("stop:{}", ids));
            state.terminated += 1;
        }
        state.slots[self.index].finish(exit);
    }
}

#[async_trait]
impl EncoderProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(10_000 + self.index as u32)
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        self.finish(ProcessExit::Code(0), true);
        Ok(())
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.finish(ProcessExit::Signal, false);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => Ok((*exit).unwrap_or(ProcessExit::Signal)),
            Err(_) => Ok(ProcessExit::Signal),
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.exit.borrow())
    }
}

/// Probe con valores fijos
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    pub gain: ReplayGain,
    pub duration: Option<Duration>,
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self {
            gain: ReplayGain::Untagged,
            duration: Some(Duration::from_secs(180)),
        }
    }
}

#[async_trait]
impl MetadataProbe for StaticProbe {
    async fn album_gain(&self, _path: &Path) -> ReplayGain {
        self.gain
    }

    async fn resolve_duration(&self, _path: &Path) -> Option<Duration> {
        self.duration
    }
}

#[derive(Default)]
struct PlatformState {
    fail_connect: bool,
    /// Pausa del lector entre lecturas, como un consumidor en tiempo real
    read_pace: Option<Duration>,
    consumed: usize,
    stream_stops: usize,
    routes: HashMap<GuildId, mpsc::UnboundedSender<VoiceSignal>>,
    connects: usize,
    subscriptions: Vec<(GuildId, u64)>,
    destroyed: Vec<GuildId>,
}

/// Voice platform that accepts any stream and reports it idle at EOF.
#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    pub fn failing() -> Self {
        let platform = Self::default();
        platform.state.lock().fail_connect = true;
        platform
    }

    /// Plataforma que consume cada stream a ritmo de reproducción
    pub fn paced(pause: Duration) -> Self {
        let platform = Self::default();
        platform.state.lock().read_pace = Some(pause);
        platform
    }

    /// Bytes leídos de todos los streams
    pub fn consumed(&self) -> usize {
        self.state.lock().consumed
    }

    pub fn stream_stops(&self) -> usize {
        self.state.lock().stream_stops
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn subscriptions(&self, guild_id: GuildId) -> Vec<u64> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|(guild, _)| *guild == guild_id)
            .map(|(_, generation)| *generation)
            .collect()
    }

    pub fn destroyed(&self) -> Vec<GuildId> {
        self.state.lock().destroyed.clone()
    }

    /// Inyecta una señal como si viniera del gateway de voz
    pub fn emit(&self, guild_id: GuildId, signal: VoiceSignal) -> bool {
        match self.state.lock().routes.get(&guild_id) {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl VoicePlatform for FakePlatform {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        signals: mpsc::UnboundedSender<VoiceSignal>,
    ) -> Result<Box<dyn VoiceConnection>> {
        let mut state = self.state.lock();
        if state.fail_connect {
            bail!("voice gateway unavailable");
        }

        state.connects += 1;
        state.routes.insert(guild_id, signals.clone());
        let _ = signals.send(VoiceSignal::Ready);

        Ok(Box::new(FakeConnection {
            guild_id,
            channel_id,
            signals,
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    signals: mpsc::UnboundedSender<VoiceSignal>,
    state: Arc<Mutex<PlatformState>>,
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    async fn subscribe(&mut self, mut stream: OpusStream, generation: u64) -> Result<()> {
        let pace = {
            let mut state = self.state.lock();
            state.subscriptions.push((self.guild_id, generation));
            state.read_pace
        };

        let signals = self.signals.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = [0u8; 4096];
            while let Ok(n @ 1..) = stream.read(&mut sink) {
                state.lock().consumed += n;
                if let Some(pause) = pace {
                    std::thread::sleep(pause);
                }
            }
            let _ = signals.send(VoiceSignal::StreamIdle { generation });
        });
        Ok(())
    }

    async fn stop_stream(&mut self) -> Result<()> {
        self.state.lock().stream_stops += 1;
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.destroyed.push(self.guild_id);
            state.routes.remove(&self.guild_id);
        }
        let _ = self.signals.send(VoiceSignal::Destroyed);
        Ok(())
    }
}
