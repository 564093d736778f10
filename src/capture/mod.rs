//! Capture collaborators
//!
//! Platform capture and on-device pose estimation live outside this crate.
//! These traits are the seams they plug into; `WavFileCapture` replays a
//! recording in place of a live microphone.

pub mod file;

pub use file::WavFileCapture;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::CoachingEngine;
use crate::modality::{AudioChunk, Modality, PoseLandmarks, SamplePayload, VisionFrame};

/// Microphone source producing mono 16-bit PCM
pub trait AudioCapture: Send {
    fn sample_rate(&self) -> u32;

    /// Next chunk of samples, or `None` at end of stream
    fn next_chunk(&mut self) -> Option<Vec<i16>>;
}

/// On-device pose estimator
pub trait PoseEstimator: Send {
    fn detect(&mut self, frame: &VisionFrame) -> Option<PoseLandmarks>;
}

/// Stream `capture` into the engine at real-time pace until it ends or
/// `cancel` fires. Returns the number of chunks submitted.
pub async fn pump_audio<C: AudioCapture>(
    mut capture: C,
    engine: &CoachingEngine,
    cancel: &CancellationToken,
) -> usize {
    let sample_rate = capture.sample_rate();
    let mut next = Instant::now();
    let mut chunks = 0;

    while let Some(samples) = capture.next_chunk() {
        let chunk = AudioChunk::new(samples, sample_rate);
        next += chunk.duration();

        engine.submit(Modality::Audio, SamplePayload::Audio(chunk), 1.0);
        chunks += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(next) => {}
        }
    }

    info!("Audio capture finished after {} chunks", chunks);
    chunks
}

/// Run pose estimation on a camera frame and submit both the landmarks and
/// the frame itself. Returns whether a pose was detected.
pub fn submit_frame<E: PoseEstimator + ?Sized>(
    estimator: &mut E,
    frame: VisionFrame,
    engine: &CoachingEngine,
) -> bool {
    let detected = match estimator.detect(&frame) {
        Some(pose) => {
            let confidence = mean_visibility(&pose);
            engine.submit(Modality::Pose, SamplePayload::Pose(pose), confidence);
            true
        }
        None => {
            debug!("No pose detected in frame");
            false
        }
    };

    engine.submit(Modality::Vision, SamplePayload::Vision(frame), 1.0);
    detected
}

fn mean_visibility(pose: &PoseLandmarks) -> f32 {
    if pose.landmarks.is_empty() {
        return 0.0;
    }
    pose.landmarks.iter().map(|l| l.visibility).sum::<f32>() / pose.landmarks.len() as f32
}
