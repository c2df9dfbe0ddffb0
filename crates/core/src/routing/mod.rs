use std::sync::Arc;

use crate::{
    analysis::BeatEvent,
    control::Controls,
    display::{BpmReadout, DisplayEvent, DisplayHandle, DisplayTarget},
    osc::{OscSink, OscValue},
};

/// Detected BPM values must lie strictly between these bounds to be used.
pub const LIVE_BPM_FLOOR: u32 = 20;
pub const LIVE_BPM_CEILING: u32 = 200;
/// Length of the rolling beat counter window.
pub const BAR_LENGTH: u32 = 4;

/// What the router did with one beat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No beat, or a BPM outside the accepted detector range.
    Ignored,
    /// The run state is no longer running; the stream should stop.
    Stop,
    /// Only the live readout was updated.
    Displayed,
    /// The value was transmitted and shown on the send readout.
    Transmitted(u32),
}

/// Turns estimator output into display updates and OSC transmissions,
/// honouring sync mode and the beat divider. Lives on the audio context.
pub struct BeatRouter {
    controls: Arc<Controls>,
    osc: Arc<dyn OscSink>,
    display: DisplayHandle,
    tempo_address: String,
    current_bpm: Option<u32>,
    beat_counter: u32,
}

impl BeatRouter {
    pub fn new(
        controls: Arc<Controls>,
        osc: Arc<dyn OscSink>,
        display: DisplayHandle,
        tempo_address: impl Into<String>,
    ) -> Self {
        Self {
            controls,
            osc,
            display,
            tempo_address: tempo_address.into(),
            current_bpm: None,
            beat_counter: 0,
        }
    }

    /// Last accepted live BPM.
    pub fn current_bpm(&self) -> Option<u32> {
        self.current_bpm
    }

    pub fn beat_counter(&self) -> u32 {
        self.beat_counter
    }

    pub fn route(&mut self, event: BeatEvent, running: bool) -> RouteOutcome {
        if !event.occurred || !event.bpm.is_finite() {
            return RouteOutcome::Ignored;
        }
        let bpm = event.bpm.round().max(0.0) as u32;
        if bpm <= LIVE_BPM_FLOOR || bpm >= LIVE_BPM_CEILING {
            return RouteOutcome::Ignored;
        }
        if !running {
            return RouteOutcome::Stop;
        }

        self.current_bpm = Some(bpm);
        let controls = self.controls.snapshot();
        if !controls.sync_enabled {
            self.display
                .bpm(BpmReadout::Value(bpm), DisplayTarget::Live, false);
            return RouteOutcome::Displayed;
        }

        self.display
            .bpm(BpmReadout::Value(bpm), DisplayTarget::Live, true);
        self.beat_counter += 1;

        let factor = controls.beat_divider.factor();
        let outcome = if factor == 1 || (self.beat_counter + 1) % factor == 0 {
            let value = bpm / factor;
            self.transmit(bpm, value);
            RouteOutcome::Transmitted(value)
        } else {
            RouteOutcome::Displayed
        };

        // The bar window ignores the divider; with divider 2 a resync mid-bar
        // leaves the transmitted beats out of step with the bar.
        if self.beat_counter >= BAR_LENGTH {
            self.beat_counter = 0;
        }

        outcome
    }

    fn transmit(&self, bpm: u32, value: u32) {
        self.osc
            .send(&self.tempo_address, OscValue::from(value), true);
        // The held value stays undivided; the no-sync transmitter applies the
        // divider itself when sync is switched off.
        self.controls.set_send_bpm(bpm);
        self.display
            .bpm(BpmReadout::Value(value), DisplayTarget::Send, true);
        self.display.emit(DisplayEvent::BeatLedAdvance);
    }
}

impl std::fmt::Debug for BeatRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatRouter")
            .field("tempo_address", &self.tempo_address)
            .field("current_bpm", &self.current_bpm)
            .field("beat_counter", &self.beat_counter)
            .finish()
    }
}
