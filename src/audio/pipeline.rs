use bytes::{Bytes, BytesMut};
use std::{
    io::Read,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        filter::EncoderSpec,
        process::{terminate, EncoderLauncher, EncoderProcess, ProcessExit, TerminationOutcome},
        replaygain::{MetadataProbe, ReplayGain},
    },
    error::PipelineError,
    library::Track,
    worker::protocol::EventSink,
};

/// Tamaño de lectura desde la salida del codificador
const READ_CHUNK: usize = 16 * 1024;

/// Cada cuánto un lector en espera revisa si el stream fue cortado
const CUT_POLL: Duration = Duration::from_millis(20);

/// Parámetros del pipeline de codificación
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub ffmpeg_path: String,
    pub bitrate: u32,
    pub frame_duration_ms: u32,
    pub base_attenuation_db: f32,
    pub missing_gain_fallback_db: f32,
    pub stream_buffer_chunks: usize,
    pub termination_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            bitrate: 256_000,
            frame_duration_ms: 20,
            base_attenuation_db: -6.0,
            missing_gain_fallback_db: -10.0,
            stream_buffer_chunks: 64,
            termination_timeout: Duration::from_secs(10),
        }
    }
}

/// Continuous Ogg/Opus byte stream produced by one pipeline.
///
/// Implements blocking [`Read`] so the voice driver can consume it from its
/// own thread. Returns end-of-stream once the encoder output closes, or
/// immediately once the owning pipeline is stopped, dropping whatever audio
/// the encoder had already produced ahead of playback.
pub struct OpusStream {
    rx: flume::Receiver<Bytes>,
    pending: Bytes,
    cut: Arc<AtomicBool>,
}

impl OpusStream {
    fn new(rx: flume::Receiver<Bytes>, cut: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
            cut,
        }
    }

    fn is_cut(&self) -> bool {
        self.cut.load(Ordering::Acquire)
    }
}

impl Read for OpusStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            if self.is_cut() {
                return Ok(0);
            }
            match self.rx.recv_timeout(CUT_POLL) {
                Ok(chunk) => self.pending = chunk,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                // Emisor cerrado: fin del stream
                Err(flume::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        if self.is_cut() {
            self.pending.clear();
            return Ok(0);
        }

        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

type TerminateRequest = oneshot::Sender<TerminationOutcome>;

/// Live encoder bound to a track list.
///
/// Owned by the worker; at most one exists per worker at a time.
pub struct PipelineHandle {
    tracks: Vec<Track>,
    generation: u64,
    pid: Option<u32>,
    cut: Arc<AtomicBool>,
    audio: flume::Receiver<Bytes>,
    control: mpsc::Sender<TerminateRequest>,
    supervisor: JoinHandle<()>,
}

impl PipelineHandle {
    /// Construye el grafo, lanza el codificador y empieza a bombear audio
    pub async fn start(
        tracks: Vec<Track>,
        generation: u64,
        config: &PipelineConfig,
        probe: &dyn MetadataProbe,
        launcher: &dyn EncoderLauncher,
        events: EventSink,
    ) -> Result<(Self, OpusStream), PipelineError> {
        let first = tracks.first().ok_or(PipelineError::NoTracks)?;

        let gain = probe.album_gain(&first.location).await;
        match gain {
            ReplayGain::Album(db) => debug!("Replay gain de álbum {:.2}dB para {}", db, first.name),
            ReplayGain::Untagged => debug!("Sin replay gain de álbum para {}", first.name),
            ReplayGain::Unreadable => warn!(
                "⚠️ Metadatos ilegibles para {}, usando {:.2}dB",
                first.name, config.missing_gain_fallback_db
            ),
        }

        let spec = EncoderSpec::build(&tracks, gain, config)?;
        debug!("🎛️ Grafo de filtros: {}", spec.filter);

        let launched = launcher.launch(&spec)?;
        let pid = launched.process.id();
        let cut = Arc::new(AtomicBool::new(false));
        let (audio_tx, audio_rx) = flume::bounded(config.stream_buffer_chunks);
        tokio::spawn(pump_output(launched.output, audio_tx, cut.clone()));

        let (control, control_rx) = mpsc::channel(1);
        let supervisor = tokio::spawn(supervise(
            launched.process,
            config.termination_timeout,
            events,
            control_rx,
        ));

        info!(
            "▶️ Pipeline #{} iniciado con {} track(s): {}",
            generation,
            tracks.len(),
            first.display_title()
        );

        Ok((
            Self {
                tracks,
                generation,
                pid,
                cut: cut.clone(),
                audio: audio_rx.clone(),
                control,
                supervisor,
            },
            OpusStream::new(audio_rx, cut),
        ))
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Corta el stream: el lector ve fin de stream y el audio pendiente se descarta
    pub fn cut_stream(&self) {
        if !self.cut.swap(true, Ordering::AcqRel) {
            let dropped: usize = self.audio.drain().map(|chunk| chunk.len()).sum();
            debug!("Stream #{} cortado, {} bytes descartados", self.generation, dropped);
        }
    }

    /// Corta el stream, termina el codificador con escalado y espera la confirmación
    pub async fn terminate(self) -> TerminationOutcome {
        self.cut_stream();
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.control.send(reply_tx).await.is_err() {
            // El supervisor ya respondió a todo y terminó: el proceso salió
            return TerminationOutcome::AlreadyExited(ProcessExit::Signal);
        }

        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.supervisor.abort();
                TerminationOutcome::Stuck
            }
        }
    }
}

/// Copia la salida del codificador al canal acotado del stream.
///
/// Tras el corte sigue leyendo hasta EOF, descartando, para que el
/// codificador nunca quede bloqueado escribiendo.
async fn pump_output<R>(mut output: R, tx: flume::Sender<Bytes>, cut: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut total = 0usize;

    loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match output.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if cut.load(Ordering::Acquire) {
                    continue;
                }
                if tx.send_async(buf.freeze()).await.is_err() {
                    debug!("Stream de audio sin consumidor, dejando de leer");
                    break;
                }
            }
            Err(e) => {
                warn!("⚠️ Error leyendo la salida del codificador: {}", e);
                break;
            }
        }
    }

    debug!("Salida del codificador cerrada tras {} bytes", total);
}

/// Owns the encoder process for its whole life.
///
/// Reports abnormal exits as `error` events. A natural exit never requests
/// the next track; that only happens when playback reports the stream idle.
async fn supervise(
    mut process: Box<dyn EncoderProcess>,
    timeout: Duration,
    events: EventSink,
    mut control: mpsc::Receiver<TerminateRequest>,
) {
    let exit = tokio::select! {
        status = process.wait() => match status {
            Ok(exit) => {
                if exit.is_abnormal() {
                    error!("❌ Codificador salió con {:?}", exit);
                    events.error(format!("encoder exited abnormally: {:?}", exit));
                } else {
                    debug!("Codificador terminó: {:?}", exit);
                }
                exit
            }
            Err(e) => {
                error!("❌ No se pudo esperar al codificador: {}", e);
                events.error(format!("failed to wait for encoder: {}", e));
                ProcessExit::Signal
            }
        },
        request = control.recv() => {
            let outcome = terminate(process.as_mut(), timeout).await;
            if outcome.is_fatal() {
                let pid = process.id().map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
                events.error(format!("encoder pid {} did not exit after forced termination", pid));
            }
            match request {
                Some(reply) => {
                    let _ = reply.send(outcome);
                }
                // Handle soltado sin pedir terminación
                None => {
                    if outcome.is_fatal() {
                        error!("❌ Codificador huérfano sin confirmar salida");
                    }
                }
            }
            return;
        }
    };

    while let Some(reply) = control.recv().await {
        let _ = reply.send(TerminationOutcome::AlreadyExited(exit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{track, FakeLauncher, StaticProbe};
    use crate::worker::protocol::{GuildEvent, WorkerEvent};
    use serenity::model::id::GuildId;
    use tokio::io::AsyncWriteExt;

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<GuildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(GuildId::new(1), tx), rx)
    }

    #[tokio::test]
    async fn test_opus_stream_reads_across_chunks() {
        let (tx, rx) = flume::bounded(4);
        tx.send(Bytes::from_static(b"Ogg")).unwrap();
        tx.send(Bytes::from_static(b"S-data")).unwrap();
        drop(tx);

        let mut stream = OpusStream::new(rx, Arc::default());
        let out = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap();

        assert_eq!(out, b"OggS-data");
    }

    #[tokio::test]
    async fn test_pump_forwards_until_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (tx, rx) = flume::bounded(8);
        let pump = tokio::spawn(pump_output(reader, tx, Arc::default()));

        writer.write_all(b"opus-frames").await.unwrap();
        drop(writer);
        pump.await.unwrap();

        let collected: Vec<u8> = rx.drain().flat_map(|b| b.to_vec()).collect();
        assert_eq!(collected, b"opus-frames");
    }

    #[tokio::test]
    async fn test_start_and_terminate_pipeline() {
        let launcher = FakeLauncher::default();
        let (events, _rx) = sink();
        let tracks = vec![track("A")];

        let (handle, _stream) = PipelineHandle::start(
            tracks,
            1,
            &PipelineConfig::default(),
            &StaticProbe::default(),
            &launcher,
            events,
        )
        .await
        .unwrap();

        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.tracks()[0].persistent_id, "A");

        let outcome = handle.terminate().await;
        assert_eq!(outcome, TerminationOutcome::Graceful(ProcessExit::Code(0)));
        assert_eq!(launcher.launched_ids(), vec![vec!["A".to_string()]]);
        assert_eq!(launcher.terminated(), 1);
    }

    #[tokio::test]
    async fn test_terminate_discards_audio_encoded_ahead() {
        let launcher = FakeLauncher::default();
        let (events, _rx) = sink();

        let (handle, mut stream) = PipelineHandle::start(
            vec![track("A")],
            1,
            &PipelineConfig::default(),
            &StaticProbe::default(),
            &launcher,
            events,
        )
        .await
        .unwrap();

        // ~4s de audio a 256kbps, ya codificado y esperando al lector
        launcher.feed_last(&vec![0u8; 128 * 1024]).await;

        handle.terminate().await;

        let out = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap();

        assert!(out.is_empty(), "{} bytes still playable after stop", out.len());
    }

    #[tokio::test]
    async fn test_abnormal_exit_reports_error_without_request_next() {
        let launcher = FakeLauncher::default();
        let (events, mut rx) = sink();
        let tracks = vec![track("A")];

        let (handle, _stream) = PipelineHandle::start(
            tracks,
            1,
            &PipelineConfig::default(),
            &StaticProbe::default(),
            &launcher,
            events,
        )
        .await
        .unwrap();

        launcher.crash_last(1);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            WorkerEvent::try_from(event.envelope).unwrap(),
            WorkerEvent::Error("encoder exited abnormally: Code(1)".to_string())
        );
        assert_eq!(
            handle.terminate().await,
            TerminationOutcome::AlreadyExited(ProcessExit::Code(1))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let launcher = FakeLauncher::failing();
        let (events, _rx) = sink();

        let result = PipelineHandle::start(
            vec![track("A")],
            1,
            &PipelineConfig::default(),
            &StaticProbe::default(),
            &launcher,
            events,
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Spawn { .. })));
    }
}
