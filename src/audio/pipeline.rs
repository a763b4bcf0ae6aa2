//! # Transcoding Pipeline
//!
//! One pipeline per stream session:
//!
//! ```text
//! source URL ─▶ decoder ─(PCM)─▶ GainStage ─(PCM)─▶ encoder ─(MP3)─▶ output
//! ```
//!
//! The output is a bounded channel of byte chunks, consumed by the HTTP
//! response. Every byte handed to it is counted; the playback position is
//! derived from that count and the start offset, never from the processes.
//!
//! ## Failure Semantics:
//! - A process exiting abnormally puts an error on the output and tears down
//!   the other process, so the listener never gets a silently truncated book
//! - A spawn failure is delivered on the output as well as returned
//! - `stop()` kills both processes and ends the output, whatever their state

use crate::audio::gain::{GainStage, GainTransform, SampleFormat};
use crate::audio::process::{
    decode_args, encode_args, ProcessCommand, ProcessExit, ProcessHandle, ProcessLauncher,
    ProcessReader, ProcessRole, ProcessWriter,
};
use crate::library::StreamSource;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Encoded audio as consumed by the HTTP layer.
pub type PipelineOutput = ReceiverStream<io::Result<Bytes>>;

/// Audio format and buffering knobs shared by every pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: u32,
    /// Read size for both pumps
    pub chunk_size: usize,
    /// Encoded chunks buffered ahead of a slow consumer
    pub output_buffer_chunks: usize,
    pub initial_gain: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16Le,
            sample_rate: 44100,
            channels: 2,
            bitrate_kbps: 128,
            chunk_size: 16 * 1024,
            output_buffer_chunks: 32,
            initial_gain: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    /// Encoder reached end of stream
    Finished,
    /// Torn down by `stop()`
    Stopped,
    Failed,
}

struct PipelineInner {
    state: PipelineState,
    decoder: Option<ProcessHandle>,
    encoder: Option<ProcessHandle>,
    shutdown: CancellationToken,
    output: Option<PipelineOutput>,
    error: Option<String>,
}

type SharedInner = Arc<Mutex<PipelineInner>>;

fn lock(inner: &SharedInner) -> MutexGuard<'_, PipelineInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TranscodingPipeline {
    label: String,
    source: StreamSource,
    start_offset_seconds: f64,
    settings: PipelineSettings,
    launcher: Arc<dyn ProcessLauncher>,
    gain: GainStage,
    bytes_emitted: Arc<AtomicU64>,
    inner: SharedInner,
}

impl TranscodingPipeline {
    /// Create an idle pipeline. `label` identifies it in logs (the session id).
    pub fn new(
        label: impl Into<String>,
        source: StreamSource,
        start_offset_seconds: f64,
        settings: PipelineSettings,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let gain = GainStage::new(settings.initial_gain, settings.format);
        Self {
            label: label.into(),
            source,
            start_offset_seconds: start_offset_seconds.max(0.0),
            settings,
            launcher,
            gain,
            bytes_emitted: Arc::new(AtomicU64::new(0)),
            inner: Arc::new(Mutex::new(PipelineInner {
                state: PipelineState::Idle,
                decoder: None,
                encoder: None,
                shutdown: CancellationToken::new(),
                output: None,
                error: None,
            })),
        }
    }

    /// Spawn both processes and start pumping. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.state {
            PipelineState::Idle => {}
            PipelineState::Running => {
                debug!(pipeline = %self.label, "Pipeline already running");
                return Ok(());
            }
            other => bail!("pipeline {} cannot be restarted from {:?}", self.label, other),
        }

        let (tx, rx) = mpsc::channel(self.settings.output_buffer_chunks.max(1));
        inner.output = Some(ReceiverStream::new(rx));

        let (decoder, encoder, pcm_in, pcm_out, encoded) = match self.spawn_processes() {
            Ok(parts) => parts,
            Err(e) => {
                error!(pipeline = %self.label, error = %e, "Pipeline failed to start");
                let _ = tx.try_send(Err(io::Error::other(format!(
                    "pipeline failed to start: {:#}",
                    e
                ))));
                inner.state = PipelineState::Failed;
                inner.error = Some(format!("{:#}", e));
                return Err(e);
            }
        };

        let shutdown = inner.shutdown.clone();
        tokio::spawn(pump_pcm(
            self.label.clone(),
            pcm_in,
            pcm_out,
            GainTransform::new(self.gain.clone()),
            self.settings.chunk_size,
            shutdown.clone(),
        ));
        tokio::spawn(pump_output(
            self.label.clone(),
            encoded,
            tx.clone(),
            self.bytes_emitted.clone(),
            self.settings.chunk_size,
            shutdown.clone(),
            self.inner.clone(),
        ));
        tokio::spawn(watch_exit(
            self.label.clone(),
            ProcessRole::Decode,
            decoder.exited(),
            tx.clone(),
            shutdown.clone(),
            self.inner.clone(),
        ));
        tokio::spawn(watch_exit(
            self.label.clone(),
            ProcessRole::Encode,
            encoder.exited(),
            tx,
            shutdown,
            self.inner.clone(),
        ));

        inner.decoder = Some(decoder);
        inner.encoder = Some(encoder);
        inner.state = PipelineState::Running;

        info!(
            pipeline = %self.label,
            start_offset_seconds = self.start_offset_seconds,
            bitrate_kbps = self.settings.bitrate_kbps,
            "Pipeline started"
        );
        Ok(())
    }

    fn spawn_processes(
        &self,
    ) -> Result<(ProcessHandle, ProcessHandle, ProcessReader, ProcessWriter, ProcessReader)> {
        let s = &self.settings;
        let mut decoder = self.launcher.launch(&ProcessCommand {
            role: ProcessRole::Decode,
            args: decode_args(
                &self.source.url,
                self.source.auth_header.as_deref(),
                self.start_offset_seconds,
                s.format,
                s.sample_rate,
                s.channels,
            ),
        })?;

        let encoder = self.launcher.launch(&ProcessCommand {
            role: ProcessRole::Encode,
            args: encode_args(s.format, s.sample_rate, s.channels, s.bitrate_kbps),
        });
        let mut encoder = match encoder {
            Ok(encoder) => encoder,
            Err(e) => {
                decoder.stop();
                return Err(e);
            }
        };

        let pipes = (|| -> Result<_> {
            let pcm_in = decoder.take_stdout().context("decoder stdout unavailable")?;
            let pcm_out = encoder.take_stdin().context("encoder stdin unavailable")?;
            let encoded = encoder.take_stdout().context("encoder stdout unavailable")?;
            Ok((pcm_in, pcm_out, encoded))
        })();

        match pipes {
            Ok((pcm_in, pcm_out, encoded)) => Ok((decoder, encoder, pcm_in, pcm_out, encoded)),
            Err(e) => {
                decoder.stop();
                encoder.stop();
                Err(e)
            }
        }
    }

    /// Kill both processes and close the output. Idempotent.
    pub fn stop(&self) {
        let mut inner = lock(&self.inner);
        if inner.shutdown.is_cancelled() && inner.decoder.is_none() && inner.encoder.is_none() {
            return;
        }

        inner.shutdown.cancel();
        for process in [inner.decoder.take(), inner.encoder.take()].into_iter().flatten() {
            process.stop();
        }
        inner.output = None;
        if matches!(inner.state, PipelineState::Idle | PipelineState::Running) {
            inner.state = PipelineState::Stopped;
        }

        info!(
            pipeline = %self.label,
            bytes_emitted = self.bytes_emitted(),
            "Pipeline stopped"
        );
    }

    /// Hand the encoded output to its consumer. Only the first call gets it.
    pub fn take_output(&self) -> Option<PipelineOutput> {
        lock(&self.inner).output.take()
    }

    pub fn gain_stage(&self) -> &GainStage {
        &self.gain
    }

    pub fn gain(&self) -> f32 {
        self.gain.gain()
    }

    /// Set the gain (clamped); returns the value actually applied.
    pub fn set_gain(&self, gain: f32) -> f32 {
        self.gain.set_gain(gain)
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted.load(Ordering::Acquire)
    }

    /// `start_offset + bytes_emitted * 8 / bitrate`, in seconds.
    pub fn current_position(&self) -> f64 {
        let bits_per_second = self.settings.bitrate_kbps.max(1) as f64 * 1000.0;
        self.start_offset_seconds + (self.bytes_emitted() as f64 * 8.0) / bits_per_second
    }

    pub fn start_offset_seconds(&self) -> f64 {
        self.start_offset_seconds
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Reason for the last failure, if any.
    pub fn error(&self) -> Option<String> {
        lock(&self.inner).error.clone()
    }
}

impl Drop for TranscodingPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// decoder stdout → gain → encoder stdin. Closes encoder stdin on EOF so the
/// encoder can flush and finish.
async fn pump_pcm(
    label: String,
    mut pcm_in: ProcessReader,
    mut pcm_out: ProcessWriter,
    mut transform: GainTransform,
    chunk_size: usize,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; chunk_size.max(2)];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = pcm_in.read(&mut buf) => read,
        };

        let chunk = match read {
            Ok(0) => break,
            Ok(n) => transform.process(&buf[..n]),
            Err(e) => {
                warn!(pipeline = %label, error = %e, "Reading decoder output failed");
                break;
            }
        };

        let written = tokio::select! {
            _ = shutdown.cancelled() => return,
            written = pcm_out.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            warn!(pipeline = %label, error = %e, "Writing to encoder failed");
            return;
        }
    }

    let tail = transform.finish();
    if !tail.is_empty() {
        let _ = pcm_out.write_all(&tail).await;
    }
    if let Err(e) = pcm_out.shutdown().await {
        debug!(pipeline = %label, error = %e, "Closing encoder input failed");
    }
    debug!(pipeline = %label, "Decoder output drained");
}

/// encoder stdout → output channel, counting every byte forwarded.
async fn pump_output(
    label: String,
    mut encoded: ProcessReader,
    tx: mpsc::Sender<io::Result<Bytes>>,
    bytes_emitted: Arc<AtomicU64>,
    chunk_size: usize,
    shutdown: CancellationToken,
    inner: SharedInner,
) {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = encoded.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                let mut inner = lock(&inner);
                if inner.state == PipelineState::Running {
                    inner.state = PipelineState::Finished;
                }
                info!(pipeline = %label, "Encoder output complete");
                return;
            }
            Ok(n) => {
                bytes_emitted.fetch_add(n as u64, Ordering::AcqRel);
                let sent = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))) => sent,
                };
                if sent.is_err() {
                    debug!(pipeline = %label, "Output consumer went away");
                    return;
                }
            }
            Err(e) => {
                warn!(pipeline = %label, error = %e, "Reading encoder output failed");
                lock(&inner).state = PipelineState::Failed;
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

/// Turn an abnormal exit into an output error and tear the pipeline down.
async fn watch_exit(
    label: String,
    role: ProcessRole,
    exited: impl Future<Output = ProcessExit>,
    tx: mpsc::Sender<io::Result<Bytes>>,
    shutdown: CancellationToken,
    inner: SharedInner,
) {
    let exit = exited.await;
    if !exit.is_failure() || shutdown.is_cancelled() {
        debug!(pipeline = %label, process = %role, exit = %exit, "Process exited");
        return;
    }

    let reason = anyhow!("{} {}", role, exit);
    error!(pipeline = %label, process = %role, exit = %exit, "External process failed");
    {
        let mut inner = lock(&inner);
        inner.state = PipelineState::Failed;
        inner.error = Some(reason.to_string());
        shutdown.cancel();
        for process in [inner.decoder.as_ref(), inner.encoder.as_ref()].into_iter().flatten() {
            process.stop();
        }
    }
    let _ = tx.send(Err(io::Error::other(reason.to_string()))).await;
}
