use std::ffi::OsString;

use crate::{audio::pipeline::PipelineConfig, audio::replaygain::ReplayGain, error::PipelineError, library::Track};

/// Etiqueta de salida del grafo de filtros
pub const OUTPUT_LABEL: &str = "out";

/// Read-ahead por entrada (paquetes en cola por hilo de lectura).
/// Windows tiene el acceso a disco más lento, así que se le da más margen.
#[cfg(target_os = "windows")]
pub const INPUT_QUEUE_PACKETS: u32 = 4096;
#[cfg(not(target_os = "windows"))]
pub const INPUT_QUEUE_PACKETS: u32 = 1024;

/// Construye el grafo de filtros de ffmpeg.
///
/// Una entrada: atenuación base + replay gain de álbum.
/// Varias entradas: se concatenan en orden y luego se aplica la misma
/// atenuación al stream resultante, de modo que la secuencia suena sin cortes.
pub fn filter_graph(input_count: usize, gain: ReplayGain, config: &PipelineConfig) -> String {
    let gain_chain = format!(
        "volume={:.2}dB,volume={:.2}dB",
        config.base_attenuation_db,
        gain.offset_db(config.missing_gain_fallback_db)
    );

    if input_count <= 1 {
        return format!("[0:a]{}[{}]", gain_chain, OUTPUT_LABEL);
    }

    let inputs: String = (0..input_count).map(|i| format!("[{}:a]", i)).collect();
    format!(
        "{}concat=n={}:v=0:a=1[joined];[joined]{}[{}]",
        inputs, input_count, gain_chain, OUTPUT_LABEL
    )
}

/// Programa y argumentos para lanzar el codificador
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub filter: String,
}

impl EncoderSpec {
    pub fn build(tracks: &[Track], gain: ReplayGain, config: &PipelineConfig) -> Result<Self, PipelineError> {
        if tracks.is_empty() {
            return Err(PipelineError::NoTracks);
        }

        let filter = filter_graph(tracks.len(), gain, config);
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error"]
            .iter()
            .map(OsString::from)
            .collect();

        for track in tracks {
            args.push("-thread_queue_size".into());
            args.push(INPUT_QUEUE_PACKETS.to_string().into());
            args.push("-i".into());
            args.push(track.location.clone().into_os_string());
        }

        // Ráfaga ~1.5x y buffer 2x sobre el bitrate nominal
        let bitrate = config.bitrate;
        let maxrate = bitrate + bitrate / 2;
        let bufsize = bitrate * 2;

        let output: [String; 22] = [
            "-filter_complex".into(),
            filter.clone(),
            "-map".into(),
            format!("[{}]", OUTPUT_LABEL),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "48000".into(),
            "-c:a".into(),
            "libopus".into(),
            "-b:a".into(),
            bitrate.to_string(),
            "-maxrate".into(),
            maxrate.to_string(),
            "-bufsize".into(),
            bufsize.to_string(),
            "-frame_duration".into(),
            config.frame_duration_ms.to_string(),
            "-application".into(),
            "audio".into(),
            "-f".into(),
            "ogg".into(),
        ];
        args.extend(output.into_iter().map(OsString::from));
        args.push("pipe:1".into());

        Ok(Self {
            program: config.ffmpeg_path.clone(),
            args,
            filter,
        })
    }
}
