use tokio::time::Instant;
use tracing::{debug, warn};

use crate::modality::AudioChunk;

/// A fixed-size audio chunk ready for analysis
#[derive(Debug, Clone)]
pub struct CoalescedChunk {
    /// Chunk number (0-indexed)
    pub chunk_index: usize,
    pub chunk: AudioChunk,
    /// Sample-weighted mean confidence of the contributing frames
    pub confidence: f32,
    /// Capture time of the first contributing frame
    pub captured_at: Instant,
}

/// Coalesces variable-size capture frames into fixed-size chunks
///
/// Audio is never dropped: every sample pushed ends up in exactly one chunk,
/// with the trailing partial chunk returned by `flush`.
pub struct AudioCoalescer {
    chunk_samples: usize,
    target_rate: u32,
    buffer: Vec<i16>,
    buffer_rate: u32,
    confidence_weight: f64,
    first_captured_at: Option<Instant>,
    chunk_index: usize,
}

impl AudioCoalescer {
    pub fn new(chunk_samples: usize, target_rate: u32) -> Self {
        let chunk_samples = chunk_samples.max(1);
        Self {
            chunk_samples,
            target_rate,
            buffer: Vec::with_capacity(chunk_samples),
            buffer_rate: target_rate,
            confidence_weight: 0.0,
            first_captured_at: None,
            chunk_index: 0,
        }
    }

    /// Add a capture frame, returning every chunk it completes
    pub fn push(&mut self, frame: AudioChunk, confidence: f32, captured_at: Instant) -> Vec<CoalescedChunk> {
        let mut completed = Vec::new();

        let frame = Self::downsample(frame, self.target_rate);
        if frame.sample_rate != self.buffer_rate {
            // Rate changed mid-stream and cannot be decimated: close out the
            // current chunk so no chunk mixes rates
            warn!(
                "Audio rate changed from {}Hz to {}Hz, starting a new chunk",
                self.buffer_rate, frame.sample_rate
            );
            completed.extend(self.flush());
            self.buffer_rate = frame.sample_rate;
        }

        let mut remaining = frame.samples.as_slice();
        while !remaining.is_empty() {
            if self.first_captured_at.is_none() {
                self.first_captured_at = Some(captured_at);
            }

            let room = self.chunk_samples - self.buffer.len();
            let take = room.min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            self.confidence_weight += confidence as f64 * take as f64;
            remaining = &remaining[take..];

            if self.buffer.len() == self.chunk_samples {
                completed.extend(self.flush());
            }
        }

        completed
    }

    /// Emit the buffered partial chunk, if any
    pub fn flush(&mut self) -> Option<CoalescedChunk> {
        if self.buffer.is_empty() {
            return None;
        }

        let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_samples));
        let confidence = (self.confidence_weight / samples.len() as f64) as f32;
        let captured_at = self.first_captured_at.take().unwrap_or_else(Instant::now);
        self.confidence_weight = 0.0;

        let chunk = CoalescedChunk {
            chunk_index: self.chunk_index,
            chunk: AudioChunk::new(samples, self.buffer_rate),
            confidence,
            captured_at,
        };
        self.chunk_index += 1;

        debug!(
            "Audio chunk {} complete ({} samples)",
            chunk.chunk_index,
            chunk.chunk.samples.len()
        );

        Some(chunk)
    }

    /// Downsample by decimation when the capture rate is an integer multiple of the target
    fn downsample(frame: AudioChunk, target_rate: u32) -> AudioChunk {
        if frame.sample_rate == target_rate || target_rate == 0 {
            return frame;
        }
        if frame.sample_rate < target_rate || frame.sample_rate % target_rate != 0 {
            return frame; // Can't upsample or decimate cleanly
        }

        let ratio = (frame.sample_rate / target_rate) as usize;
        let samples: Vec<i16> = frame.samples.iter().step_by(ratio).copied().collect();

        AudioChunk {
            samples,
            sample_rate: target_rate,
            redacted: frame.redacted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_coalesce_into_fixed_chunks() {
        let mut coalescer = AudioCoalescer::new(1600, 16000);
        let start = Instant::now();

        // 25 frames of 10 ms = 250 ms = 2 full chunks + 50 ms remainder
        let mut chunks = Vec::new();
        for _ in 0..25 {
            chunks.extend(coalescer.push(AudioChunk::new(vec![1; 160], 16000), 0.5, start));
        }

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chunk.samples.len() == 1600));
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);

        let tail = coalescer.flush().unwrap();
        assert_eq!(tail.chunk.samples.len(), 800);
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn test_no_samples_lost_across_large_frame() {
        let mut coalescer = AudioCoalescer::new(100, 16000);
        let samples: Vec<i16> = (0..350).map(|i| i as i16).collect();

        let mut out: Vec<i16> = coalescer
            .push(AudioChunk::new(samples.clone(), 16000), 1.0, Instant::now())
            .into_iter()
            .flat_map(|c| c.chunk.samples)
            .collect();
        out.extend(coalescer.flush().unwrap().chunk.samples);

        assert_eq!(out, samples);
    }

    #[test]
    fn test_confidence_is_sample_weighted() {
        let mut coalescer = AudioCoalescer::new(400, 16000);
        let now = Instant::now();
        coalescer.push(AudioChunk::new(vec![0; 100], 16000), 1.0, now);
        let chunks = coalescer.push(AudioChunk::new(vec![0; 300], 16000), 0.2, now);

        assert_eq!(chunks.len(), 1);
        assert!((chunks[0].confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_48k_capture_is_decimated() {
        let mut coalescer = AudioCoalescer::new(160, 16000);
        let chunks = coalescer.push(AudioChunk::new(vec![3; 480], 48000), 1.0, Instant::now());

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk.sample_rate, 16000);
        assert_eq!(chunks[0].chunk.samples.len(), 160);
    }
}
