//! # Audio Module
//!
//! Turns a group of library tracks into a single continuous Ogg/Opus stream
//! for the voice driver.
//!
//! ## Architecture
//!
//! ### [`replaygain`] - Metadata
//! - Reads the album replay gain and the duration of local files
//!
//! ### [`filter`] - Encoder Arguments
//! - Builds the ffmpeg filter graph: per-input gain, resampling to 48kHz
//!   stereo and gapless concatenation
//! - Produces the full argument vector for one encoder invocation
//!
//! ### [`process`] - Encoder Process
//! - Spawns ffmpeg and terminates it in two phases (graceful, then forced)
//!
//! ### [`pipeline`] - Stream Pipeline
//! - Wires the encoder output into a bounded channel readable by songbird
//! - Supervises the encoder and reports abnormal exits
//!
//! ## Audio Quality
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Channels**: Stereo (2 channels)
//! - **Encoding**: Opus at 256kbps (configurable)

pub mod filter;
pub mod pipeline;
pub mod process;
pub mod replaygain;
