use async_trait::async_trait;
use std::{io, process::ExitStatus, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
};
use tracing::{debug, error, info, warn};

use crate::{audio::filter::EncoderSpec, error::PipelineError};

/// Cómo terminó un proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Terminado por señal, sin código de salida
    Signal,
}

impl ProcessExit {
    /// Código distinto de cero (una salida por señal no cuenta)
    pub fn is_abnormal(self) -> bool {
        matches!(self, ProcessExit::Code(code) if code != 0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        status.code().map_or(ProcessExit::Signal, ProcessExit::Code)
    }
}

/// Resultado de la terminación escalonada
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    AlreadyExited(ProcessExit),
    Graceful(ProcessExit),
    Forced(ProcessExit),
    /// Ni la petición ordenada ni el kill forzado confirmaron la salida
    Stuck,
}

impl TerminationOutcome {
    pub fn is_fatal(self) -> bool {
        matches!(self, TerminationOutcome::Stuck)
    }
}

/// Proceso codificador supervisable
#[async_trait]
pub trait EncoderProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Pide una salida ordenada que permita vaciar el codificador
    async fn request_stop(&mut self) -> io::Result<()>;

    fn force_kill(&mut self) -> io::Result<()>;

    async fn wait(&mut self) -> io::Result<ProcessExit>;

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;
}

/// Two-phase termination with a bounded wait after each phase.
///
/// A graceful stop is requested first and given `timeout` to take effect.
/// Only when that fails or times out is the process force-killed, which
/// again gets `timeout`. If that also fails the outcome is
/// [`TerminationOutcome::Stuck`]; the caller reports it, nothing panics.
pub async fn terminate<P>(process: &mut P, timeout: Duration) -> TerminationOutcome
where
    P: EncoderProcess + ?Sized,
{
    if let Ok(Some(exit)) = process.try_wait() {
        return TerminationOutcome::AlreadyExited(exit);
    }

    let pid = process.id();

    match process.request_stop().await {
        Ok(()) => match tokio::time::timeout(timeout, process.wait()).await {
            Ok(Ok(exit)) => {
                debug!("Codificador {:?} terminó ordenadamente: {:?}", pid, exit);
                return TerminationOutcome::Graceful(exit);
            }
            Ok(Err(e)) => warn!("⚠️ Error esperando al codificador {:?}: {}", pid, e),
            Err(_) => warn!(
                "⏱️ El codificador {:?} no terminó en {:?}, forzando cierre",
                pid, timeout
            ),
        },
        Err(e) => warn!("⚠️ No se pudo pedir la salida ordenada a {:?}: {}", pid, e),
    }

    if let Err(e) = process.force_kill() {
        error!("❌ Kill forzado falló para {:?}: {}", pid, e);
    }

    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(Ok(exit)) => {
            info!("🔪 Codificador {:?} terminado a la fuerza: {:?}", pid, exit);
            TerminationOutcome::Forced(exit)
        }
        Ok(Err(e)) => {
            error!("❌ El codificador {:?} no confirmó su salida: {}", pid, e);
            TerminationOutcome::Stuck
        }
        Err(_) => {
            error!("❌ El codificador {:?} sigue vivo tras el kill forzado", pid);
            TerminationOutcome::Stuck
        }
    }
}

/// Salida de audio y proceso recién lanzados
pub struct LaunchedEncoder {
    pub process: Box<dyn EncoderProcess>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

/// Lanza procesos codificadores a partir de un [`EncoderSpec`]
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, spec: &EncoderSpec) -> Result<LaunchedEncoder, PipelineError>;
}

/// ffmpeg como subproceso, con salida ordenada vía `q` por stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegLauncher;

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, spec: &EncoderSpec) -> Result<LaunchedEncoder, PipelineError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(PipelineError::MissingPipe("stdout"))?;
        let stdin = child.stdin.take();
        let pid = child.id();

        // Reenviar stderr de ffmpeg al log
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[ffmpeg {:?}] {}", pid, line);
                }
            });
        }

        debug!("🎛️ ffmpeg lanzado con PID {:?}", pid);

        Ok(LaunchedEncoder {
            process: Box::new(FfmpegProcess { child, stdin }),
            output: Box::new(stdout),
        })
    }
}

pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        // Ya solicitado: stdin cerrado
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };

        stdin.write_all(b"q").await?;
        stdin.flush().await?;
        drop(stdin);
        Ok(())
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.child.wait().await.map(ProcessExit::from)
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(ProcessExit::from))
    }
}
