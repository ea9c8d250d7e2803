use crate::control::StopToken;
use std::time::Instant;

pub const DEFAULT_FRAME_SKIP: u64 = 5;

/// Instantaneous FPS over processed frames.
#[derive(Debug, Default)]
pub struct FrameRateTracker {
    previous: Option<Instant>,
    last_fps: f64,
}

impl FrameRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 on the first tick and repeats the last value when no time has
    /// passed since the previous tick.
    pub fn tick(&mut self, now: Instant) -> f64 {
        if let Some(previous) = self.previous {
            let elapsed = now.saturating_duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                self.last_fps = 1.0 / elapsed;
            }
        }
        self.previous = Some(now);
        self.last_fps
    }
}

/// Frame-skip throttling plus the cooperative stop check.
#[derive(Debug, Clone)]
pub struct PlaybackController {
    frame_skip: u64,
    stop: StopToken,
}

impl PlaybackController {
    pub fn new(frame_skip: u64, stop: StopToken) -> Self {
        Self {
            frame_skip: frame_skip.max(1),
            stop,
        }
    }

    pub fn frame_skip(&self) -> u64 {
        self.frame_skip
    }

    /// `frame_index` counts captured frames starting at 1.
    pub fn should_process(&self, frame_index: u64) -> bool {
        frame_index % self.frame_skip == 0
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}
