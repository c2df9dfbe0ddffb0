use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{BpmOscError, Result};

/// Slowest tempo the autocorrelation search considers.
const MIN_TEMPO_BPM: f32 = 40.0;
/// Fastest tempo the autocorrelation search considers.
const MAX_TEMPO_BPM: f32 = 240.0;
/// Centre of the log-Gaussian tempo prior.
const PRIOR_CENTER_BPM: f32 = 120.0;
/// Width of the tempo prior in octaves.
const PRIOR_WIDTH_OCTAVES: f32 = 1.0;
/// Seconds of onset history kept for the autocorrelation.
const ONSET_HISTORY_SECONDS: f32 = 6.0;
/// Seconds of history required before the first tempo estimate.
const MIN_HISTORY_SECONDS: f32 = 3.0;
/// Seconds between tempo re-estimations.
const TEMPO_UPDATE_SECONDS: f32 = 0.5;
/// Seconds of onset history the adaptive onset threshold averages.
const THRESHOLD_WINDOW_SECONDS: f32 = 0.5;
const ONSET_SENSITIVITY: f32 = 1.5;
const ONSET_FLOOR: f32 = 1e-3;
/// Log compression applied to spectral magnitudes.
const MAGNITUDE_COMPRESSION: f32 = 100.0;
/// Fraction of a beat period an onset may deviate from the prediction.
const PHASE_TOLERANCE: f32 = 0.25;
/// Predicted beats emitted without a confirming onset before going quiet.
const MAX_FLYWHEEL_BEATS: u32 = 4;

/// Output of the estimator for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Whether a beat falls on this frame.
    pub occurred: bool,
    /// Current tempo estimate; `0.0` until enough audio was analysed.
    pub bpm: f32,
}

/// Construction parameters for a tempo estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub frame_size: usize,
    pub hop_size: usize,
    pub sample_rate: u32,
}

impl TrackerConfig {
    /// Non-overlapping configuration: the hop equals the frame size.
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            hop_size: frame_size,
            sample_rate,
        }
    }
}

/// Streaming beat and tempo tracker. Stateful and single-consumer: every
/// call depends on the frames that came before it.
pub trait TempoEstimator: Send {
    /// Analyses exactly one frame of `frame_size` samples.
    fn process(&mut self, frame: &[f32]) -> Result<BeatEvent>;

    fn frame_size(&self) -> usize;

    /// Forgets all history while keeping the configuration.
    fn reset(&mut self);
}

/// Spectral-flux beat tracker.
///
/// Each frame is appended to a two-frame Hann-windowed analysis buffer whose
/// half-wave rectified log spectral flux forms the onset function. The tempo
/// comes from the autocorrelation of the recent onset function weighted by a
/// tempo prior, and beats are emitted by a phase-locked clock that snaps to
/// onsets near each predicted beat and free-runs briefly when they go
/// missing.
pub struct TempoTracker {
    frame_size: usize,
    sample_rate: u32,
    frame_rate: f32,
    window: Vec<f32>,
    analysis: Vec<f32>,
    previous_spectrum: Vec<f32>,
    onsets: VecDeque<f32>,
    onset_capacity: usize,
    min_history: usize,
    threshold_window: usize,
    tempo_update_frames: usize,
    frames_since_update: usize,
    autocorrelation: Vec<f32>,
    period: Option<f32>,
    frames_since_beat: f32,
    flywheel_beats: u32,
    fft: FftResources,
}

impl TempoTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        if config.hop_size != config.frame_size {
            return Err(BpmOscError::InvalidInput(
                "tempo tracker requires hop size equal to frame size",
            ));
        }
        if config.frame_size < 2 {
            return Err(BpmOscError::InvalidInput(
                "tempo tracker requires frames with at least two samples",
            ));
        }
        if config.sample_rate == 0 {
            return Err(BpmOscError::InvalidInput("sample rate must be positive"));
        }

        let window_len = config.frame_size * 2;
        let frame_rate = config.sample_rate as f32 / config.frame_size as f32;
        let frames_for = |seconds: f32| ((seconds * frame_rate).round() as usize).max(1);

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = FftResources::new(&mut planner, window_len);

        Ok(Self {
            frame_size: config.frame_size,
            sample_rate: config.sample_rate,
            frame_rate,
            window: (0..window_len).map(|i| hann_value(i, window_len)).collect(),
            analysis: vec![0.0; window_len],
            previous_spectrum: vec![0.0; fft.spectrum.len()],
            onsets: VecDeque::with_capacity(frames_for(ONSET_HISTORY_SECONDS)),
            onset_capacity: frames_for(ONSET_HISTORY_SECONDS),
            min_history: frames_for(MIN_HISTORY_SECONDS),
            threshold_window: frames_for(THRESHOLD_WINDOW_SECONDS),
            tempo_update_frames: frames_for(TEMPO_UPDATE_SECONDS),
            frames_since_update: 0,
            autocorrelation: Vec::new(),
            period: None,
            frames_since_beat: 0.0,
            flywheel_beats: 0,
            fft,
        })
    }

    /// Current tempo estimate, if one has been established.
    pub fn bpm(&self) -> Option<f32> {
        self.period.map(|period| 60.0 * self.frame_rate / period)
    }

    fn spectral_flux(&mut self, frame: &[f32]) -> Result<f32> {
        self.analysis.copy_within(self.frame_size.., 0);
        self.analysis[self.frame_size..].copy_from_slice(frame);

        let fft = &mut self.fft;
        for ((slot, sample), weight) in fft
            .input
            .iter_mut()
            .zip(&self.analysis)
            .zip(&self.window)
        {
            *slot = sample * weight;
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let mut flux = 0.0;
        for (bin, previous) in fft.spectrum.iter().zip(self.previous_spectrum.iter_mut()) {
            let magnitude = (MAGNITUDE_COMPRESSION * bin.norm()).ln_1p();
            flux += (magnitude - *previous).max(0.0);
            *previous = magnitude;
        }
        Ok(flux)
    }

    fn is_onset(&self, flux: f32) -> bool {
        let recent = self.onsets.iter().rev().take(self.threshold_window);
        let count = recent.len();
        let mean = if count == 0 {
            0.0
        } else {
            recent.sum::<f32>() / count as f32
        };
        let previous = self.onsets.back().copied().unwrap_or(0.0);
        flux > mean * ONSET_SENSITIVITY + ONSET_FLOOR && flux >= previous
    }

    fn push_onset(&mut self, flux: f32) {
        if self.onsets.len() == self.onset_capacity {
            self.onsets.pop_front();
        }
        self.onsets.push_back(flux);

        self.frames_since_update += 1;
        if self.frames_since_update >= self.tempo_update_frames
            && self.onsets.len() >= self.min_history
        {
            self.frames_since_update = 0;
            if let Some(period) = self.estimate_period() {
                self.period = Some(period);
            }
        }
    }

    /// Beat period in frames from the prior-weighted autocorrelation of the
    /// onset history.
    fn estimate_period(&mut self) -> Option<f32> {
        let len = self.onsets.len();
        let min_lag = ((60.0 * self.frame_rate / MAX_TEMPO_BPM).floor() as usize).max(1);
        let max_lag = ((60.0 * self.frame_rate / MIN_TEMPO_BPM).ceil() as usize).min(len / 2);
        if min_lag + 2 > max_lag {
            return None;
        }

        let mean = self.onsets.iter().sum::<f32>() / len as f32;
        let centred: Vec<f32> = self.onsets.iter().map(|value| value - mean).collect();
        let prior_lag = 60.0 * self.frame_rate / PRIOR_CENTER_BPM;

        self.autocorrelation.clear();
        self.autocorrelation.resize(max_lag + 2, 0.0);
        for lag in min_lag.saturating_sub(1)..=(max_lag + 1).min(len - 1) {
            let sum: f32 = centred[lag..]
                .iter()
                .zip(&centred)
                .map(|(a, b)| a * b)
                .sum();
            let octaves = (lag.max(1) as f32 / prior_lag).log2() / PRIOR_WIDTH_OCTAVES;
            let prior = (-0.5 * octaves * octaves).exp();
            self.autocorrelation[lag] = prior * sum / (len - lag) as f32;
        }

        let scores = &self.autocorrelation;
        let best = (min_lag..=max_lag).max_by(|&a, &b| scores[a].total_cmp(&scores[b]))?;
        if scores[best] <= f32::EPSILON {
            return None;
        }

        let (before, peak, after) = (scores[best - 1], scores[best], scores[best + 1]);
        let curvature = before - 2.0 * peak + after;
        let offset = if curvature < 0.0 {
            (0.5 * (before - after) / curvature).clamp(-0.5, 0.5)
        } else {
            0.0
        };

        Some(best as f32 + offset)
    }

    fn track_beat(&mut self, onset: bool) -> bool {
        self.frames_since_beat += 1.0;
        let Some(period) = self.period else {
            return false;
        };

        let early = period * (1.0 - PHASE_TOLERANCE);
        let late = period * (1.0 + PHASE_TOLERANCE);
        self.frames_since_beat = self.frames_since_beat.min(late);

        if onset {
            if self.frames_since_beat >= early {
                self.frames_since_beat = 0.0;
                self.flywheel_beats = 0;
                return true;
            }
            if self.flywheel_beats > 0 {
                // Re-anchor on the real onset; its beat was already predicted.
                self.frames_since_beat = 0.0;
                self.flywheel_beats = 0;
            }
            return false;
        }

        if self.frames_since_beat >= late && self.flywheel_beats < MAX_FLYWHEEL_BEATS {
            self.frames_since_beat -= period;
            self.flywheel_beats += 1;
            return true;
        }

        false
    }
}

impl TempoEstimator for TempoTracker {
    fn process(&mut self, frame: &[f32]) -> Result<BeatEvent> {
        if frame.len() != self.frame_size {
            return Err(BpmOscError::InvalidFrameSize {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }

        let flux = self.spectral_flux(frame)?;
        let onset = self.is_onset(flux);
        self.push_onset(flux);
        let occurred = self.track_beat(onset);

        Ok(BeatEvent {
            occurred,
            bpm: self.bpm().unwrap_or(0.0),
        })
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn reset(&mut self) {
        self.analysis.fill(0.0);
        self.previous_spectrum.fill(0.0);
        self.onsets.clear();
        self.frames_since_update = 0;
        self.period = None;
        self.frames_since_beat = 0.0;
        self.flywheel_beats = 0;
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for TempoTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempoTracker")
            .field("frame_size", &self.frame_size)
            .field("sample_rate", &self.sample_rate)
            .field("onsets", &self.onsets.len())
            .field("period", &self.period)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

/// Synthetic test signals.
pub mod synthetic {
    /// Mono click track: a short decaying 1 kHz burst every `period` samples.
    pub fn click_track(period: usize, total: usize, sample_rate: u32) -> Vec<f32> {
        let burst = (sample_rate as usize / 200).max(1);
        (0..total)
            .map(|i| {
                let offset = i % period;
                if offset < burst {
                    let t = offset as f32 / sample_rate as f32;
                    let envelope = 1.0 - offset as f32 / burst as f32;
                    0.8 * envelope * (2.0 * std::f32::consts::PI * 1_000.0 * t).sin()
                } else {
                    0.0
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::click_track;
    use super::*;

    const SAMPLE_RATE: u32 = 44_100;
    const FRAME: usize = 512;

    fn build_tracker() -> TempoTracker {
        TempoTracker::new(TrackerConfig::new(FRAME, SAMPLE_RATE)).unwrap()
    }

    fn run(tracker: &mut TempoTracker, signal: &[f32]) -> Vec<BeatEvent> {
        signal
            .chunks_exact(FRAME)
            .map(|frame| tracker.process(frame).unwrap())
            .collect()
    }

    #[test]
    fn rejects_mismatched_frames() {
        let mut tracker = build_tracker();
        let err = tracker.process(&[0.0; FRAME - 1]).unwrap_err();
        assert!(matches!(
            err,
            BpmOscError::InvalidFrameSize {
                expected: FRAME,
                actual
            } if actual == FRAME - 1
        ));
    }

    #[test]
    fn rejects_overlapping_hops() {
        let config = TrackerConfig {
            frame_size: FRAME,
            hop_size: FRAME / 2,
            sample_rate: SAMPLE_RATE,
        };
        assert!(TempoTracker::new(config).is_err());
    }

    #[test]
    fn silence_produces_no_beats() {
        let mut tracker = build_tracker();
        let events = run(&mut tracker, &vec![0.0; FRAME * 900]);

        assert!(events.iter().all(|event| !event.occurred));
        assert_eq!(events.last().unwrap().bpm, 0.0);
        assert_eq!(tracker.bpm(), None);
    }

    #[test]
    fn locks_onto_click_track_tempo() {
        // 43 frames per click: 60 * 44100 / (512 * 43) = 120.18 bpm
        let period = FRAME * 43;
        let signal = click_track(period, FRAME * 43 * 24, SAMPLE_RATE);
        let mut tracker = build_tracker();
        let events = run(&mut tracker, &signal);

        let bpm = events.last().unwrap().bpm;
        assert!((bpm - 120.18).abs() < 2.0, "estimated {bpm}");

        // The final eight clicks each produce exactly one beat.
        let tail = &events[events.len() - 43 * 8..];
        let beats = tail.iter().filter(|event| event.occurred).count();
        assert_eq!(beats, 8);
    }

    #[test]
    fn reset_forgets_tempo() {
        let signal = click_track(FRAME * 43, FRAME * 43 * 12, SAMPLE_RATE);
        let mut tracker = build_tracker();
        run(&mut tracker, &signal);
        assert!(tracker.bpm().is_some());

        tracker.reset();
        assert_eq!(tracker.bpm(), None);
        assert_eq!(tracker.frame_size(), FRAME);
    }

    #[test]
    fn hann_window_is_symmetric() {
        let len = 16;
        for i in 0..len {
            let a = hann_value(i, len);
            let b = hann_value(len - 1 - i, len);
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(hann_value(0, 1), 1.0);
    }
}
