use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

/// Number of steps in the beat LED bar animation.
pub const BEAT_LED_STEPS: u8 = 4;

/// Which BPM readout an update is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayTarget {
    Live,
    Send,
    Both,
}

/// Value shown on a readout. `Placeholder` renders as dashes while stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BpmReadout {
    Value(u32),
    Placeholder,
}

/// Presentation updates emitted by the core. Consumed on the presentation
/// context, never awaited by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisplayEvent {
    BpmUpdate {
        readout: BpmReadout,
        target: DisplayTarget,
        blink: bool,
    },
    Level { rms: u32 },
    BeatLedAdvance,
    BeatLedReset,
}

/// Default queue depth between the core and the presentation context.
pub const DEFAULT_DISPLAY_CAPACITY: usize = 64;

/// Producer side of the bounded display queue. Cloning is cheap; every send
/// is non-blocking and silently drops the event if the consumer lags.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    sender: Sender<DisplayEvent>,
}

impl DisplayHandle {
    /// Creates a bounded display queue and returns both ends.
    pub fn channel(capacity: usize) -> (Self, Receiver<DisplayEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// A handle whose events go nowhere.
    pub fn detached() -> Self {
        let (handle, _) = Self::channel(1);
        handle
    }

    pub fn emit(&self, event: DisplayEvent) {
        match self.sender.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!(?event, "display queue full, dropping update");
            }
        }
    }

    pub fn bpm(&self, readout: BpmReadout, target: DisplayTarget, blink: bool) {
        self.emit(DisplayEvent::BpmUpdate {
            readout,
            target,
            blink,
        });
    }
}

/// Four-step beat/bar animation driven by `BeatLedAdvance`/`BeatLedReset`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BeatLed {
    step: u8,
    lit: bool,
}

impl BeatLed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lit step in `0..BEAT_LED_STEPS`, or `None` before the first
    /// advance after a reset.
    pub fn step(&self) -> Option<u8> {
        self.lit.then_some(self.step)
    }

    pub fn advance(&mut self) {
        if self.lit {
            self.step = (self.step + 1) % BEAT_LED_STEPS;
        } else {
            self.lit = true;
            self.step = 0;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn apply(&mut self, event: &DisplayEvent) {
        match event {
            DisplayEvent::BeatLedAdvance => self.advance(),
            DisplayEvent::BeatLedReset => self.reset(),
            _ => {}
        }
    }
}
