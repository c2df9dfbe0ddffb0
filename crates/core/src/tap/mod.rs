use std::time::{Duration, Instant};

/// Taps further apart than this start a new sequence.
pub const TAP_STALE_AFTER: Duration = Duration::from_secs(1);
/// Taps kept per sequence; older ones fall out of the average.
pub const TAP_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Tap {
    at: Instant,
    since_previous: Option<Duration>,
}

/// Converts manual taps into a BPM estimate.
///
/// The history is never cleared explicitly: a gap longer than
/// [`TAP_STALE_AFTER`] keeps only the newest tap, which becomes the start of
/// the next sequence. The first entry's delta is never part of the average.
#[derive(Debug, Clone, Default)]
pub struct TapTempo {
    taps: Vec<Tap>,
}

impl TapTempo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tap at `now`. Returns the rounded BPM once at least two
    /// taps of the current sequence are known.
    pub fn tap(&mut self, now: Instant) -> Option<u32> {
        let Some(previous) = self.taps.last().copied() else {
            self.taps.push(Tap {
                at: now,
                since_previous: None,
            });
            return None;
        };

        let delta = now.saturating_duration_since(previous.at);
        self.taps.push(Tap {
            at: now,
            since_previous: Some(delta),
        });

        if self.taps.len() > TAP_WINDOW {
            self.taps.remove(0);
        }

        if delta > TAP_STALE_AFTER {
            self.taps.drain(..self.taps.len() - 1);
            tracing::debug!(gap_ms = delta.as_millis() as u64, "tap sequence went stale");
            return None;
        }

        let deltas: Vec<Duration> = self.taps[1..]
            .iter()
            .filter_map(|tap| tap.since_previous)
            .collect();
        let mean = deltas.iter().sum::<Duration>().as_secs_f64() / deltas.len() as f64;
        if mean <= f64::EPSILON {
            return None;
        }

        Some((60.0 / mean).round() as u32)
    }

    /// Number of taps in the current sequence.
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}
