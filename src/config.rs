//! # Configuration Management
//!
//! This module handles loading relay configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with `APP__` prefix and `__` between levels)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive `Serialize`/`Deserialize` so the `config` crate can merge sources
//! - **impl blocks**: conversion helpers turn config sections into runtime option structs
//! - **Result<T, E>**: loading and validation both return `anyhow::Result`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__TRANSCODER__BITRATE_KBPS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::gain::SampleFormat;
use crate::audio::pipeline::PipelineSettings;
use crate::playback::sleep_timer::SleepTimerOptions;
use crate::playback::tracker::TrackerOptions;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main relay configuration.
///
/// ## Why separate config structs:
/// Each section maps to one component, so a component can be handed its own
/// section without seeing unrelated settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub library: LibraryConfig,
    pub transcoder: TranscoderConfig,
    pub performance: PerformanceConfig,
    pub tracker: TrackerConfig,
    pub sleep_timer: SleepTimerConfig,
}

/// Where the HTTP relay listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: localhost only (development)
/// - `host = "0.0.0.0"`: reachable by speakers on the LAN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// How book ids become stream URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Must contain `{book_id}`
    pub stream_url_template: String,
    /// Sent as a bearer token; never logged
    pub api_token: Option<String>,
}

/// External codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub ffmpeg_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: u32,
    /// Bytes read from the decoder per gain pass
    pub chunk_size: usize,
    /// Encoded chunks buffered ahead of a slow listener
    pub output_buffer_chunks: usize,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Position tracker polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub poll_interval_ms: u64,
    /// Minimum position change before a sync is forwarded
    pub sync_threshold_seconds: f64,
}

/// Sleep timer defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepTimerConfig {
    pub fade_duration_ms: u64,
    pub fade_steps: u32,
    /// Start the fade this much early to cover output buffering
    pub latency_compensation_ms: u64,
    pub position_poll_interval_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            library: LibraryConfig {
                stream_url_template: "http://127.0.0.1:13378/api/items/{book_id}/file".to_string(),
                api_token: None,
            },
            transcoder: TranscoderConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                sample_rate: 44_100,
                channels: 2,
                bitrate_kbps: 128,
                chunk_size: 16 * 1024,
                output_buffer_chunks: 32,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            tracker: TrackerConfig {
                poll_interval_ms: 5_000,
                sync_threshold_seconds: 5.0,
            },
            sleep_timer: SleepTimerConfig {
                fade_duration_ms: 30_000,
                fade_steps: 20,
                latency_compensation_ms: 2_000,
                position_poll_interval_ms: 10_000,
                tick_interval_ms: 1_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`
    /// - `APP__LIBRARY__API_TOKEN=...`
    /// - `APP__SLEEP_TIMER__FADE_DURATION_MS=15000`
    /// - `HOST=0.0.0.0` / `PORT=3000`
    ///
    /// A double underscore separates levels because several keys contain a
    /// single underscore.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings that would make the relay misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if !self.library.stream_url_template.contains("{book_id}") {
            return Err(anyhow!("library.stream_url_template must contain {{book_id}}"));
        }

        if self.transcoder.ffmpeg_path.trim().is_empty() {
            return Err(anyhow!("transcoder.ffmpeg_path cannot be empty"));
        }

        if !(8_000..=192_000).contains(&self.transcoder.sample_rate) {
            return Err(anyhow!(
                "transcoder.sample_rate must be between 8000 and 192000, got {}",
                self.transcoder.sample_rate
            ));
        }

        if !(1..=8).contains(&self.transcoder.channels) {
            return Err(anyhow!(
                "transcoder.channels must be between 1 and 8, got {}",
                self.transcoder.channels
            ));
        }

        if self.transcoder.bitrate_kbps == 0 {
            return Err(anyhow!("transcoder.bitrate_kbps must be greater than 0"));
        }

        if self.transcoder.chunk_size < 2 || self.transcoder.output_buffer_chunks == 0 {
            return Err(anyhow!("transcoder buffer sizes must be positive"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.tracker.poll_interval_ms == 0 || self.sleep_timer.position_poll_interval_ms == 0 {
            return Err(anyhow!("Poll intervals must be greater than 0"));
        }

        if !self.tracker.sync_threshold_seconds.is_finite() || self.tracker.sync_threshold_seconds < 0.0 {
            return Err(anyhow!("tracker.sync_threshold_seconds must be a non-negative number"));
        }

        if self.sleep_timer.fade_steps == 0 {
            return Err(anyhow!("sleep_timer.fade_steps must be greater than 0"));
        }

        if self.sleep_timer.tick_interval_ms == 0 {
            return Err(anyhow!("sleep_timer.tick_interval_ms must be greater than 0"));
        }

        Ok(())
    }
}

impl TranscoderConfig {
    /// Pipeline settings for a new session, starting at unity gain.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            format: SampleFormat::S16Le,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate_kbps: self.bitrate_kbps,
            chunk_size: self.chunk_size,
            output_buffer_chunks: self.output_buffer_chunks,
            initial_gain: 1.0,
        }
    }
}

impl TrackerConfig {
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            sync_threshold_seconds: self.sync_threshold_seconds,
        }
    }
}

impl SleepTimerConfig {
    /// Options for a timer of `duration`; everything else comes from config.
    pub fn timer_options(&self, duration: Duration) -> SleepTimerOptions {
        SleepTimerOptions {
            duration,
            fade_duration: Duration::from_millis(self.fade_duration_ms),
            fade_steps: self.fade_steps,
            latency_compensation: Duration::from_millis(self.latency_compensation_ms),
            position_poll_interval: Duration::from_millis(self.position_poll_interval_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
        }
    }
}
