use async_trait::async_trait;
use std::{
    fs::File,
    path::Path,
    time::Duration,
};
use symphonia::core::{
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::{MetadataOptions, StandardTagKey, Tag},
    probe::{Hint, ProbeResult},
};
use tracing::debug;

/// Resultado de buscar el replay gain de álbum en un archivo.
///
/// `Untagged` y `Unreadable` son deliberadamente distintos: un archivo cuyo
/// encabezado se leyó sin etiqueta no recibe ajuste, uno ilegible recibe
/// la ganancia de respaldo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayGain {
    /// Etiqueta `REPLAYGAIN_ALBUM_GAIN` encontrada (dB)
    Album(f32),
    /// Encabezado leído, sin etiqueta de álbum
    Untagged,
    /// Metadatos ausentes o ilegibles
    Unreadable,
}

impl ReplayGain {
    /// Offset en dB a aplicar sobre la atenuación base
    pub fn offset_db(self, unreadable_fallback_db: f32) -> f32 {
        match self {
            ReplayGain::Album(db) => db,
            ReplayGain::Untagged => 0.0,
            ReplayGain::Unreadable => unreadable_fallback_db,
        }
    }
}

/// Lookup of per-file metadata the playback core needs.
///
/// Both lookups are best-effort: failures degrade to [`ReplayGain::Unreadable`]
/// and `None` rather than erroring.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn album_gain(&self, path: &Path) -> ReplayGain;

    async fn resolve_duration(&self, path: &Path) -> Option<Duration>;
}

/// Lee etiquetas y parámetros de códec con symphonia
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProbe;

#[async_trait]
impl MetadataProbe for SymphoniaProbe {
    async fn album_gain(&self, path: &Path) -> ReplayGain {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_album_gain(&path))
            .await
            .unwrap_or(ReplayGain::Unreadable)
    }

    async fn resolve_duration(&self, path: &Path) -> Option<Duration> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_duration(&path))
            .await
            .ok()
            .flatten()
    }
}

fn probe_file(path: &Path) -> Option<ProbeResult> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("No se pudo abrir {}: {}", path.display(), e);
            return None;
        }
    };

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => Some(probed),
        Err(e) => {
            debug!("Formato no reconocido en {}: {}", path.display(), e);
            None
        }
    }
}

fn read_album_gain(path: &Path) -> ReplayGain {
    let Some(mut probed) = probe_file(path) else {
        return ReplayGain::Unreadable;
    };

    let mut tags: Vec<Tag> = Vec::new();

    // Etiquetas previas al contenedor (p. ej. ID3v2) y las del propio contenedor
    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            tags.extend(revision.tags().iter().cloned());
        }
    }
    if let Some(revision) = probed.format.metadata().current() {
        tags.extend(revision.tags().iter().cloned());
    }

    album_gain_from_tags(&tags)
}

fn read_duration(path: &Path) -> Option<Duration> {
    let probed = probe_file(path)?;
    let track = probed.format.default_track()?;
    let params = &track.codec_params;
    let frames = params.n_frames?;

    if let Some(time_base) = params.time_base {
        let time = time_base.calc_time(frames);
        return Some(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac));
    }

    let rate = params.sample_rate?;
    Some(Duration::from_secs_f64(frames as f64 / rate as f64))
}

pub(crate) fn album_gain_from_tags(tags: &[Tag]) -> ReplayGain {
    tags.iter()
        .find(|tag| {
            matches!(tag.std_key, Some(StandardTagKey::ReplayGainAlbumGain))
                || tag.key.eq_ignore_ascii_case("REPLAYGAIN_ALBUM_GAIN")
        })
        .and_then(|tag| parse_gain(&tag.value.to_string()))
        .map_or(ReplayGain::Untagged, ReplayGain::Album)
}

/// Interpreta valores como "-7.30 dB", "+1.5dB" o "2"
pub(crate) fn parse_gain(raw: &str) -> Option<f32> {
    let trimmed = raw.trim();
    let number = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .or_else(|| trimmed.strip_suffix("DB"))
        .unwrap_or(trimmed)
        .trim();

    number.parse::<f32>().ok().filter(|v| v.is_finite())
}
