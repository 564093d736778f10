use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::AudioCapture;

/// Microphone stand-in that replays a 16-bit WAV file
pub struct WavFileCapture {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    /// Channel count of the file; samples are downmixed to mono
    pub source_channels: u16,
    samples: Vec<i16>,
    position: usize,
    chunk_samples: usize,
}

impl WavFileCapture {
    pub fn open(path: impl AsRef<Path>, chunk_duration: Duration) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            anyhow::bail!(
                "Expected 16-bit integer PCM, got {} bits ({:?})",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let interleaved: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let samples = downmix(&interleaved, spec.channels);
        let duration_seconds = samples.len() as f64 / spec.sample_rate as f64;
        let chunk_samples =
            ((spec.sample_rate as u128 * chunk_duration.as_millis()) / 1000).max(1) as usize;

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples per chunk",
            duration_seconds, spec.sample_rate, spec.channels, chunk_samples
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            source_channels: spec.channels,
            samples,
            position: 0,
            chunk_samples,
        })
    }

    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl AudioCapture for WavFileCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_chunk(&mut self) -> Option<Vec<i16>> {
        if self.position >= self.samples.len() {
            return None;
        }
        let end = (self.position + self.chunk_samples).min(self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;
        Some(chunk)
    }
}

/// Average interleaved channels into one
fn downmix(interleaved: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}
