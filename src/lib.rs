//! # bookrelay
//!
//! Relays audiobooks to networked speakers through a gain stage, so a sleep
//! timer can fade playback out without touching the device volume.
//!
//! ## Module Map:
//! - **audio**: gain stage, fades, ffmpeg processes, transcoding pipeline
//! - **proxy**: per-listener sessions and their response streams
//! - **playback**: receiver client interface, position tracker, sleep timer
//! - **handlers / health / middleware**: the HTTP surface
//! - **config / error / state / library**: ambient plumbing

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod library;
pub mod middleware;
pub mod playback;
pub mod proxy;
pub mod state;
