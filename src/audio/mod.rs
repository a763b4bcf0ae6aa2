//! # Audio Relay Module
//!
//! Everything between the library's audio file and the bytes a speaker
//! fetches.
//!
//! ## Key Components:
//! - **Gain Stage** (`gain`): per-sample volume on raw PCM, adjustable mid-stream
//! - **Fades** (`fade`): stepped, cancellable gain ramps
//! - **Processes** (`process`): ffmpeg decode/encode children behind a launcher trait
//! - **Pipeline** (`pipeline`): decode → gain → encode, with position accounting
//!
//! ## PCM Format Between Processes:
//! - **Bit Depth**: 16-bit signed
//! - **Encoding**: little-endian by default (`SampleFormat`)
//! - **Rate / Channels**: from `[transcoder]` config, 44.1 kHz stereo by default

pub mod fade;
pub mod gain;
pub mod pipeline;
pub mod process;
