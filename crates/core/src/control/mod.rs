use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{BpmOscError, Result};

/// Lowest send BPM the controller accepts (inclusive).
pub const MIN_SEND_BPM: u32 = 20;
/// Highest send BPM the controller accepts (inclusive).
pub const MAX_SEND_BPM: u32 = 500;

/// Factor by which the live beat rate is divided before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BeatDivider {
    /// Every beat is forwarded.
    #[default]
    Whole,
    /// Every second beat is forwarded at half the tempo.
    Half,
}

impl BeatDivider {
    pub fn factor(self) -> u32 {
        match self {
            BeatDivider::Whole => 1,
            BeatDivider::Half => 2,
        }
    }
}

impl TryFrom<u32> for BeatDivider {
    type Error = BpmOscError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(BeatDivider::Whole),
            2 => Ok(BeatDivider::Half),
            _ => Err(BpmOscError::InvalidInput("beat divider must be 1 or 2")),
        }
    }
}

impl From<BeatDivider> for u32 {
    fn from(value: BeatDivider) -> Self {
        value.factor()
    }
}

/// Manual adjustments applied to the held send BPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBpmAdjust {
    Increment,
    Decrement,
    Double,
    Halve,
}

impl SendBpmAdjust {
    fn apply(self, bpm: u32) -> u32 {
        match self {
            SendBpmAdjust::Increment => bpm.saturating_add(1),
            SendBpmAdjust::Decrement => bpm.saturating_sub(1),
            SendBpmAdjust::Double => bpm.saturating_mul(2),
            SendBpmAdjust::Halve => bpm / 2,
        }
    }
}

/// Snapshot of the user controlled fields shared between the control,
/// audio and transmitter contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub sync_enabled: bool,
    pub beat_divider: BeatDivider,
    pub send_bpm: u32,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            beat_divider: BeatDivider::Whole,
            send_bpm: 128,
        }
    }
}

pub fn is_valid_send_bpm(bpm: u32) -> bool {
    (MIN_SEND_BPM..=MAX_SEND_BPM).contains(&bpm)
}

/// Mutex guarded control state. Every read hands out a full snapshot so a
/// divider change and a sync switch are never observed half applied.
#[derive(Debug, Default)]
pub struct Controls {
    state: Mutex<ControlState>,
}

impl Controls {
    /// Creates controls from an initial state. The send BPM must already be
    /// inside `[MIN_SEND_BPM, MAX_SEND_BPM]`.
    pub fn new(initial: ControlState) -> Result<Self> {
        if !is_valid_send_bpm(initial.send_bpm) {
            return Err(BpmOscError::InvalidBpm(initial.send_bpm));
        }
        Ok(Self {
            state: Mutex::new(initial),
        })
    }

    pub fn snapshot(&self) -> ControlState {
        *self.lock()
    }

    pub fn send_bpm(&self) -> u32 {
        self.lock().send_bpm
    }

    /// Switches sync mode and returns the previous value.
    pub fn set_sync_enabled(&self, enabled: bool) -> bool {
        std::mem::replace(&mut self.lock().sync_enabled, enabled)
    }

    pub fn set_beat_divider(&self, divider: BeatDivider) {
        self.lock().beat_divider = divider;
    }

    /// Stores a new send BPM. Values outside the accepted range are ignored
    /// and `false` is returned.
    pub fn set_send_bpm(&self, bpm: u32) -> bool {
        if !is_valid_send_bpm(bpm) {
            return false;
        }
        self.lock().send_bpm = bpm;
        true
    }

    /// Applies a manual adjustment. Returns the new value, or `None` when the
    /// result would leave the accepted range (the value is then unchanged).
    pub fn adjust_send_bpm(&self, adjust: SendBpmAdjust) -> Option<u32> {
        let mut state = self.lock();
        let next = adjust.apply(state.send_bpm);
        if !is_valid_send_bpm(next) {
            return None;
        }
        state.send_bpm = next;
        Some(next)
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        // The guarded value is plain `Copy` data, always consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
