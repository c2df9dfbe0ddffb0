use std::collections::VecDeque;

/// Number of recent frame levels kept for display smoothing.
pub const LEVEL_QUEUE_CAPACITY: usize = 20;
/// Scale applied to the frame RMS before it is stored as an integer level.
const LEVEL_SCALE: f32 = 200.0;

/// Bounded history of per-frame RMS levels used for the input meter.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    queue: VecDeque<u32>,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(LEVEL_QUEUE_CAPACITY),
        }
    }

    /// Records the level of one frame, evicting the oldest entry once the
    /// queue is full, and returns the stored value.
    pub fn push(&mut self, frame: &[f32]) -> u32 {
        let level = (compute_rms(frame) * LEVEL_SCALE) as u32;
        if self.queue.len() == LEVEL_QUEUE_CAPACITY {
            self.queue.pop_front();
        }
        self.queue.push_back(level);
        level
    }

    /// Mean of the queued levels, `0` when nothing was recorded yet.
    pub fn average(&self) -> u32 {
        if self.queue.is_empty() {
            return 0;
        }
        let sum: u64 = self.queue.iter().map(|&level| u64::from(level)).sum();
        (sum / self.queue.len() as u64) as u32
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}
