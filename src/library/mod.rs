//! # Library Module
//!
//! Track model and the narrow interface the playback core uses to talk to
//! the music library: sequence expansion and random selection.
//!
//! Library ingestion and indexing live outside this crate; the core only
//! ever sees [`Track`] values and calls [`TrackLibrary`].
//!
//! ## Sequence groups
//!
//! Tracks that carry a `keepTracksInSequence` key are played back-to-back
//! as one unit. The group of a track is every catalog entry sharing the
//! same album, album artist and sequence key, ordered by disc number then
//! track number. Ties keep catalog order.
//!
//! ## Random selection
//!
//! [`reservoir_pick`] walks the catalog once, keeping one candidate and
//! replacing it with the Nth eligible track with probability 1/N, so memory
//! stays constant regardless of catalog size.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

pub mod json;

pub use json::JsonLibrary;

/// Representa un track de la biblioteca
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub persistent_id: String,
    pub name: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub album_artist: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    pub location: PathBuf,
    #[serde(default)]
    pub keep_tracks_in_sequence: Option<String>,
    #[serde(default)]
    pub exclude_from_shuffle: bool,
    #[serde(default)]
    pub disc_number: Option<u32>,
    #[serde(default)]
    pub track_number: Option<u32>,
    /// Duración informada por la biblioteca, en milisegundos
    #[serde(default)]
    pub total_time: Option<u64>,
}

impl Track {
    /// Adjunta la ruta resuelta; es la única mutación que hace el core
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = location.into();
        self
    }

    pub fn library_duration(&self) -> Option<Duration> {
        self.total_time.map(Duration::from_millis)
    }

    /// Título para mostrar: "Artista - Nombre"
    pub fn display_title(&self) -> String {
        match self.artist.as_deref().or(self.album_artist.as_deref()) {
            Some(artist) => format!("{} - {}", artist, self.name),
            None => self.name.clone(),
        }
    }

    fn sequence_order(&self) -> (u32, u32) {
        (self.disc_number.unwrap_or(0), self.track_number.unwrap_or(0))
    }

    fn same_sequence_group(&self, other: &Track) -> bool {
        self.keep_tracks_in_sequence.is_some()
            && self.keep_tracks_in_sequence == other.keep_tracks_in_sequence
            && self.album == other.album
            && self.album_artist == other.album_artist
    }
}

// Constructores para tests; el catálogo real llega deserializado
#[cfg(test)]
impl Track {
    pub fn new(persistent_id: impl Into<String>, name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            persistent_id: persistent_id.into(),
            name: name.into(),
            album: None,
            album_artist: None,
            artist: None,
            location: location.into(),
            keep_tracks_in_sequence: None,
            exclude_from_shuffle: false,
            disc_number: None,
            track_number: None,
            total_time: None,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>, album_artist: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self.album_artist = Some(album_artist.into());
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_sequence(mut self, key: impl Into<String>, disc: u32, track: u32) -> Self {
        self.keep_tracks_in_sequence = Some(key.into());
        self.disc_number = Some(disc);
        self.track_number = Some(track);
        self
    }

    pub fn excluded_from_shuffle(mut self) -> Self {
        self.exclude_from_shuffle = true;
        self
    }
}

/// Interfaz que el orquestador consume de la biblioteca
pub trait TrackLibrary: Send + Sync {
    /// Expande un track a su grupo de secuencia (o `[track]` si no tiene)
    fn sequence_tracks(&self, track: &Track) -> Vec<Track>;

    /// Selección uniforme entre los tracks no excluidos del shuffle
    fn random_item(&self) -> Option<Track>;

    /// Búsqueda simple por nombre, artista o álbum
    fn find(&self, query: &str, limit: usize) -> Vec<Track>;
}

/// Expands `track` to its sequence group drawn from `catalog`.
///
/// Without a sequence key, or when the catalog holds no member of the
/// group, the result is exactly `[track]`.
pub fn sequence_from<'a, I>(catalog: I, track: &Track) -> Vec<Track>
where
    I: IntoIterator<Item = &'a Track>,
{
    if track.keep_tracks_in_sequence.is_none() {
        return vec![track.clone()];
    }

    let mut group: Vec<Track> = catalog
        .into_iter()
        .filter(|candidate| candidate.same_sequence_group(track))
        .cloned()
        .collect();

    if group.is_empty() {
        return vec![track.clone()];
    }

    // sort_by_key es estable: los empates conservan el orden del catálogo
    group.sort_by_key(Track::sequence_order);
    group
}

/// Single-pass reservoir sampling over the shuffle-eligible tracks.
pub fn reservoir_pick<'a, I, R>(catalog: I, rng: &mut R) -> Option<Track>
where
    I: IntoIterator<Item = &'a Track>,
    R: Rng + ?Sized,
{
    let mut chosen: Option<&Track> = None;
    let mut seen: u64 = 0;

    for candidate in catalog.into_iter().filter(|t| !t.exclude_from_shuffle) {
        seen += 1;
        if rng.gen_range(0..seen) == 0 {
            chosen = Some(candidate);
        }
    }

    chosen.cloned()
}
