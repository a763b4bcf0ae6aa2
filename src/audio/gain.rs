//! # Gain Stage
//!
//! Applies a real-time adjustable gain to raw 16-bit PCM travelling between the
//! decoder and the encoder of a transcoding pipeline.
//!
//! ## Format Requirements:
//! - **Bit Depth**: 16-bit signed PCM
//! - **Endianness**: fixed per stage (little-endian for ffmpeg `s16le`)
//! - **Length**: output byte length always equals input byte length
//!
//! ## Threading:
//! `GainStage` is a cheap, clonable handle. The current gain lives in an atomic,
//! so HTTP handlers and the sleep timer can call `set_gain` while the pump task
//! is in the middle of a buffer. The new value applies from the next sample.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lowest gain a stage accepts.
pub const MIN_GAIN: f32 = 0.0;

/// Highest gain a stage accepts.
pub const MAX_GAIN: f32 = 1.5;

/// Bytes per sample for the supported formats.
const SAMPLE_WIDTH: usize = 2;

/// Sample layout of the PCM handled by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Signed 16-bit, little-endian (ffmpeg `s16le`)
    #[default]
    S16Le,
    /// Signed 16-bit, big-endian (ffmpeg `s16be`)
    S16Be,
}

impl SampleFormat {
    /// Width of one sample in bytes.
    pub fn sample_width(&self) -> usize {
        SAMPLE_WIDTH
    }

    /// Name ffmpeg uses for this raw format (`-f` argument).
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
        }
    }

    /// Codec ffmpeg uses to produce this raw format (`-acodec` argument).
    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            SampleFormat::S16Le => "pcm_s16le",
            SampleFormat::S16Be => "pcm_s16be",
        }
    }

    fn read(&self, bytes: &[u8]) -> i16 {
        match self {
            SampleFormat::S16Le => LittleEndian::read_i16(bytes),
            SampleFormat::S16Be => BigEndian::read_i16(bytes),
        }
    }

    fn write(&self, bytes: &mut [u8], sample: i16) {
        match self {
            SampleFormat::S16Le => LittleEndian::write_i16(bytes, sample),
            SampleFormat::S16Be => BigEndian::write_i16(bytes, sample),
        }
    }
}

/// Clamp a requested gain into `[MIN_GAIN, MAX_GAIN]`.
///
/// NaN collapses to silence rather than poisoning every following sample.
pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        return MIN_GAIN;
    }
    gain.clamp(MIN_GAIN, MAX_GAIN)
}

/// Scale one sample: `clamp(round(sample * gain), i16::MIN, i16::MAX)`.
pub fn scale_sample(sample: i16, gain: f32) -> i16 {
    let scaled = (sample as f64 * gain as f64).round();
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Shared handle to a mutable gain factor.
///
/// Cloning the handle shares the gain; two pipelines never share a stage,
/// but a pipeline and the sleep timer driving its fade do.
#[derive(Debug, Clone)]
pub struct GainStage {
    gain_bits: Arc<AtomicU32>,
    format: SampleFormat,
}

impl GainStage {
    /// Create a stage with an initial gain (clamped).
    pub fn new(initial_gain: f32, format: SampleFormat) -> Self {
        Self {
            gain_bits: Arc::new(AtomicU32::new(clamp_gain(initial_gain).to_bits())),
            format,
        }
    }

    /// Current gain factor.
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Acquire))
    }

    /// Replace the gain factor, clamping into range. Returns the stored value.
    pub fn set_gain(&self, gain: f32) -> f32 {
        let clamped = clamp_gain(gain);
        self.gain_bits.store(clamped.to_bits(), Ordering::Release);
        clamped
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Scale every complete sample in `buf` in place.
    ///
    /// The gain is re-read per sample so a concurrent `set_gain` lands on the
    /// very next sample. A trailing partial sample is left untouched; use
    /// [`GainTransform`] for streams that may split samples across reads.
    pub fn apply_in_place(&self, buf: &mut [u8]) {
        for frame in buf.chunks_exact_mut(SAMPLE_WIDTH) {
            let gain = self.gain();
            if gain == 1.0 {
                continue;
            }
            let sample = self.format.read(frame);
            self.format.write(frame, scale_sample(sample, gain));
        }
    }

    /// Scale a copy of `input`. Output length always equals input length.
    pub fn transform(&self, input: &[u8]) -> Vec<u8> {
        let mut output = input.to_vec();
        self.apply_in_place(&mut output);
        output
    }
}

/// Streaming wrapper around a [`GainStage`] that keeps sample alignment when
/// the upstream reader splits a sample across two chunks.
///
/// A dangling byte is held back until its partner arrives, so any single call
/// may return one byte more or less than it received; across the whole stream
/// (including [`GainTransform::finish`]) bytes out equal bytes in.
#[derive(Debug)]
pub struct GainTransform {
    stage: GainStage,
    carry: Option<u8>,
}

impl GainTransform {
    pub fn new(stage: GainStage) -> Self {
        Self { stage, carry: None }
    }

    /// Process the next chunk of the stream.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut joined = Vec::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.carry.take() {
            joined.push(byte);
        }
        joined.extend_from_slice(chunk);

        if joined.len() % SAMPLE_WIDTH != 0 {
            self.carry = joined.pop();
        }

        self.stage.apply_in_place(&mut joined);
        joined
    }

    /// Flush a held-back byte at end of stream. It is emitted unchanged since
    /// it never formed a complete sample.
    pub fn finish(&mut self) -> Vec<u8> {
        self.carry.take().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_gain_is_clamped_on_every_write() {
        let stage = GainStage::new(3.0, SampleFormat::S16Le);
        assert_eq!(stage.gain(), MAX_GAIN);

        assert_eq!(stage.set_gain(-0.5), MIN_GAIN);
        assert_eq!(stage.set_gain(f32::NAN), MIN_GAIN);
        assert_eq!(stage.set_gain(0.75), 0.75);
        assert_eq!(stage.gain(), 0.75);
    }

    #[test]
    fn test_transform_matches_scaling_law() {
        let input = [0i16, 1, -1, 100, -100, 12345, -12345, i16::MAX, i16::MIN, 3];
        for gain in [0.0f32, 0.1, 0.5, 0.8, 1.0, 1.25, 1.5] {
            let stage = GainStage::new(gain, SampleFormat::S16Le);
            let out = stage.transform(&pcm(&input));
            assert_eq!(out.len(), input.len() * 2);

            for (s, o) in input.iter().zip(samples(&out)) {
                let expected = (*s as f64 * gain as f64)
                    .round()
                    .clamp(-32768.0, 32767.0) as i16;
                assert_eq!(o, expected, "sample {} at gain {}", s, gain);
            }
        }
    }

    #[test]
    fn test_loud_samples_clip_instead_of_wrapping() {
        let stage = GainStage::new(1.5, SampleFormat::S16Le);
        let out = samples(&stage.transform(&pcm(&[30000, -30000])));
        assert_eq!(out, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_big_endian_format() {
        let stage = GainStage::new(0.5, SampleFormat::S16Be);
        let input: Vec<u8> = 1000i16.to_be_bytes().to_vec();
        let out = stage.transform(&input);
        assert_eq!(i16::from_be_bytes([out[0], out[1]]), 500);
    }

    #[test]
    fn test_odd_length_buffer_keeps_length() {
        let stage = GainStage::new(0.5, SampleFormat::S16Le);
        let mut input = pcm(&[1000, 2000]);
        input.push(0x7f);
        let out = stage.transform(&input);
        assert_eq!(out.len(), input.len());
        assert_eq!(samples(&out[..4]), vec![500, 1000]);
        assert_eq!(out[4], 0x7f);
    }

    #[test]
    fn test_set_gain_applies_to_following_samples() {
        let stage = GainStage::new(1.0, SampleFormat::S16Le);
        let mut first = pcm(&[1000, 1000]);
        stage.apply_in_place(&mut first);

        stage.set_gain(0.0);
        let mut second = pcm(&[1000, 1000]);
        stage.apply_in_place(&mut second);

        assert_eq!(samples(&first), vec![1000, 1000]);
        assert_eq!(samples(&second), vec![0, 0]);
    }

    #[test]
    fn test_stream_transform_realigns_split_samples() {
        let stage = GainStage::new(0.5, SampleFormat::S16Le);
        let mut transform = GainTransform::new(stage);
        let input = pcm(&[1000, -2000, 3000]);

        let mut out = transform.process(&input[..3]);
        out.extend(transform.process(&input[3..]));
        out.extend(transform.finish());

        assert_eq!(out.len(), input.len());
        assert_eq!(samples(&out), vec![500, -1000, 1500]);
    }

    #[test]
    fn test_stream_transform_flushes_dangling_byte() {
        let stage = GainStage::new(0.0, SampleFormat::S16Le);
        let mut transform = GainTransform::new(stage);

        let out = transform.process(&[0x10, 0x20, 0x30]);
        assert_eq!(out, vec![0, 0]);
        assert_eq!(transform.finish(), vec![0x30]);
        assert!(transform.finish().is_empty());
    }
}
