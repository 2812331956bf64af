use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::{reservoir_pick, sequence_from, Track, TrackLibrary};

/// Formato del archivo de catálogo
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    /// Directorio base para rutas relativas; por defecto, el del archivo
    #[serde(default)]
    pub music_root: Option<PathBuf>,
    pub tracks: Vec<Track>,
}

/// Catálogo en memoria cargado desde un archivo JSON
pub struct JsonLibrary {
    path: Option<PathBuf>,
    tracks: RwLock<Vec<Track>>,
}

impl JsonLibrary {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tracks = Self::read_catalog(&path).await?;

        info!("📚 Biblioteca cargada: {} tracks desde {}", tracks.len(), path.display());

        Ok(Self {
            path: Some(path),
            tracks: RwLock::new(tracks),
        })
    }

    #[cfg(test)]
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        Self {
            path: None,
            tracks: RwLock::new(tracks),
        }
    }

    /// Relee el archivo de catálogo
    pub async fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.len());
        };

        let tracks = Self::read_catalog(path).await?;
        let count = tracks.len();
        *self.tracks.write() = tracks;

        info!("🔄 Biblioteca recargada: {} tracks", count);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    async fn read_catalog(path: &Path) -> Result<Vec<Track>> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("No se pudo leer el catálogo {}", path.display()))?;

        let catalog: CatalogFile = serde_json::from_str(&content)
            .with_context(|| format!("Catálogo inválido en {}", path.display()))?;

        let root = catalog
            .music_root
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        let mut tracks = Vec::with_capacity(catalog.tracks.len());
        for track in catalog.tracks {
            if track.location.as_os_str().is_empty() {
                warn!("⚠️ Track sin ubicación ignorado: {}", track.name);
                continue;
            }

            if track.location.is_relative() {
                let resolved = root.join(&track.location);
                tracks.push(track.with_location(resolved));
            } else {
                tracks.push(track);
            }
        }

        Ok(tracks)
    }
}

impl TrackLibrary for JsonLibrary {
    fn sequence_tracks(&self, track: &Track) -> Vec<Track> {
        let tracks = self.tracks.read();
        sequence_from(tracks.iter(), track)
    }

    fn random_item(&self) -> Option<Track> {
        let tracks = self.tracks.read();
        reservoir_pick(tracks.iter(), &mut rand::thread_rng())
    }

    fn find(&self, query: &str, limit: usize) -> Vec<Track> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let matches = |field: Option<&str>| field.is_some_and(|f| f.to_lowercase().contains(&needle));

        self.tracks
            .read()
            .iter()
            .filter(|t| {
                matches(Some(t.name.as_str()))
                    || matches(t.artist.as_deref())
                    || matches(t.album.as_deref())
            })
            .take(limit)
            .cloned()
            .collect()
    }
}
