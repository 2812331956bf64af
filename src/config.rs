use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::audio::pipeline::PipelineConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Biblioteca
    pub library_path: PathBuf,

    // Audio
    pub ffmpeg_path: String,
    pub opus_bitrate: u32,
    pub frame_duration_ms: u32,
    pub base_attenuation_db: f32,
    pub missing_gain_fallback_db: f32,
    pub stream_buffer_chunks: usize,

    // Límites
    pub max_queue_size: usize,
    pub termination_timeout_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Biblioteca
            library_path: std::env::var("LIBRARY_PATH")
                .unwrap_or_else(|_| "/app/data/library.json".to_string())
                .into(),

            // Audio
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "256000".to_string())
                .parse()?,
            frame_duration_ms: std::env::var("FRAME_DURATION_MS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            base_attenuation_db: std::env::var("BASE_ATTENUATION_DB")
                .unwrap_or_else(|_| "-6.0".to_string())
                .parse()?,
            missing_gain_fallback_db: std::env::var("MISSING_GAIN_FALLBACK_DB")
                .unwrap_or_else(|_| "-10.0".to_string())
                .parse()?,
            stream_buffer_chunks: std::env::var("STREAM_BUFFER_CHUNKS")
                .unwrap_or_else(|_| "64".to_string())
                .parse()?,

            // Límites
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,
            termination_timeout_secs: std::env::var("TERMINATION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Opus bitrate must be within 8kbps..=510kbps (Discord limit)
    /// - Opus frame duration must be one the encoder accepts
    /// - Queue size, stream buffer and termination timeout must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if ![10, 20, 40, 60].contains(&self.frame_duration_ms) {
            anyhow::bail!(
                "Opus frame duration must be 10, 20, 40 or 60 ms, got: {}",
                self.frame_duration_ms
            );
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.stream_buffer_chunks == 0 {
            anyhow::bail!("Stream buffer must hold at least one chunk");
        }

        if self.termination_timeout_secs == 0 {
            anyhow::bail!("Termination timeout must be greater than 0");
        }

        Ok(())
    }

    /// Parámetros del pipeline que recibe cada worker
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            ffmpeg_path: self.ffmpeg_path.clone(),
            bitrate: self.opus_bitrate,
            frame_duration_ms: self.frame_duration_ms,
            base_attenuation_db: self.base_attenuation_db,
            missing_gain_fallback_db: self.missing_gain_fallback_db,
            stream_buffer_chunks: self.stream_buffer_chunks,
            termination_timeout: Duration::from_secs(self.termination_timeout_secs),
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Library: {}\n  \
            Audio: {} @ {}kbps, {}ms frames, base {}dB, fallback gain {}dB\n  \
            Limits: {} queue, {}s termination timeout",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.library_path.display(),
            self.ffmpeg_path,
            self.opus_bitrate / 1000,
            self.frame_duration_ms,
            self.base_attenuation_db,
            self.missing_gain_fallback_db,
            self.max_queue_size,
            self.termination_timeout_secs,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            library_path: "/app/data/library.json".into(),

            // Audio defaults
            ffmpeg_path: "ffmpeg".to_string(),
            opus_bitrate: 256_000,
            frame_duration_ms: 20,
            base_attenuation_db: -6.0,
            missing_gain_fallback_db: -10.0,
            stream_buffer_chunks: 64,

            // Limit defaults
            max_queue_size: 1000,
            termination_timeout_secs: 10,
        }
    }
}
