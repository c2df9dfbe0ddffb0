//! Periodic re-transmission of the held send BPM while sync is off.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    control::{is_valid_send_bpm, BeatDivider, Controls},
    display::{BpmReadout, DisplayEvent, DisplayHandle, DisplayTarget},
    osc::{OscSink, OscValue},
    BpmOscError, Result,
};

/// Why a [`WakeSignal::wait_timeout`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The interval elapsed.
    Timeout,
    /// A resync pulse: re-arm immediately and keep running.
    Resync,
    /// Terminal cancellation.
    Stop,
}

#[derive(Debug, Default)]
struct Pending {
    resync: bool,
    stopped: bool,
}

/// Cancellable sleep with two distinguishable wake causes. A resync pulse is
/// consumed by the waiter that observes it; a stop is sticky.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<Pending>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resync(&self) {
        self.lock().resync = true;
        self.condvar.notify_all();
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Blocks until `timeout` elapses or a signal arrives. Stop wins over a
    /// pending resync.
    pub fn wait_timeout(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();
        loop {
            if pending.stopped {
                return Wake::Stop;
            }
            if std::mem::take(&mut pending.resync) {
                return Wake::Resync;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Timeout;
            }
            pending = self
                .condvar
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counters reported when the transmitter loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitStats {
    pub iterations: u64,
    pub transmissions: u64,
    pub resyncs: u64,
}

/// Loop body and state of the no-sync transmitter.
///
/// Every iteration advances the beat LED, transmits the send BPM (divided by
/// the divider captured at loop entry) only when it changed since the last
/// transmission, then sleeps for one beat of the live send BPM minus the time
/// the iteration took.
pub struct NoSyncTransmitter {
    controls: Arc<Controls>,
    osc: Arc<dyn OscSink>,
    display: DisplayHandle,
    tempo_address: String,
    divider: BeatDivider,
    last_sent: Option<u32>,
    stats: TransmitStats,
}

impl NoSyncTransmitter {
    pub fn new(
        controls: Arc<Controls>,
        osc: Arc<dyn OscSink>,
        display: DisplayHandle,
        tempo_address: impl Into<String>,
    ) -> Self {
        let divider = controls.snapshot().beat_divider;
        Self {
            controls,
            osc,
            display,
            tempo_address: tempo_address.into(),
            divider,
            last_sent: None,
            stats: TransmitStats::default(),
        }
    }

    pub fn stats(&self) -> TransmitStats {
        self.stats
    }

    /// Runs one iteration and returns how long to wait before the next one.
    pub fn step(&mut self, started: Instant) -> Result<Duration> {
        self.stats.iterations += 1;
        self.display.emit(DisplayEvent::BeatLedAdvance);

        let send_bpm = self.controls.send_bpm();
        if !is_valid_send_bpm(send_bpm) {
            return Err(BpmOscError::InvalidBpm(send_bpm));
        }

        let value = send_bpm / self.divider.factor();
        if self.last_sent != Some(value) {
            self.osc
                .send(&self.tempo_address, OscValue::from(value), true);
            self.display
                .bpm(BpmReadout::Value(value), DisplayTarget::Send, true);
            self.last_sent = Some(value);
            self.stats.transmissions += 1;
        }

        let interval = Duration::from_secs_f64(60.0 / f64::from(send_bpm));
        Ok(interval.saturating_sub(started.elapsed()))
    }

    /// Loops until `signal` is stopped. Resync pulses re-arm the loop
    /// immediately.
    pub fn run(mut self, signal: &WakeSignal) -> Result<TransmitStats> {
        tracing::debug!(divider = self.divider.factor(), "no-sync transmitter started");
        loop {
            let started = Instant::now();
            let wait = self.step(started)?;
            match signal.wait_timeout(wait) {
                Wake::Timeout => {}
                Wake::Resync => {
                    self.stats.resyncs += 1;
                    tracing::debug!("no-sync transmitter re-armed");
                }
                Wake::Stop => break,
            }
        }
        tracing::debug!(stats = ?self.stats, "no-sync transmitter stopped");
        Ok(self.stats)
    }
}

/// Handle to a transmitter running on its own thread.
#[derive(Debug)]
pub struct TransmitterHandle {
    signal: Arc<WakeSignal>,
    thread: JoinHandle<Result<TransmitStats>>,
}

impl TransmitterHandle {
    pub fn spawn(transmitter: NoSyncTransmitter) -> Result<Self> {
        let signal = Arc::new(WakeSignal::new());
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name("no-sync-transmitter".into())
            .spawn(move || {
                let result = transmitter.run(&thread_signal);
                if let Err(err) = &result {
                    tracing::error!("no-sync transmitter failed: {err}");
                }
                result
            })?;
        Ok(Self { signal, thread })
    }

    pub fn resync(&self) {
        self.signal.resync();
    }

    /// Requests termination without waiting for it.
    pub fn signal_stop(&self) {
        self.signal.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn stop(self) -> Result<TransmitStats> {
        self.signal.stop();
        self.thread
            .join()
            .map_err(|_| BpmOscError::msg("no-sync transmitter thread panicked"))?
    }
}

impl std::fmt::Debug for NoSyncTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoSyncTransmitter")
            .field("tempo_address", &self.tempo_address)
            .field("divider", &self.divider)
            .field("last_sent", &self.last_sent)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::control::ControlState;
    use crate::osc::testing::RecordingSink;

    const TEMPO: &str = "/tempo";

    fn transmitter(state: ControlState) -> (NoSyncTransmitter, Arc<Controls>, Arc<RecordingSink>) {
        let controls = Arc::new(Controls::new(state).unwrap());
        let osc = Arc::new(RecordingSink::default());
        let transmitter =
            NoSyncTransmitter::new(controls.clone(), osc.clone(), DisplayHandle::detached(), TEMPO);
        (transmitter, controls, osc)
    }

    fn no_sync(send_bpm: u32) -> ControlState {
        ControlState {
            sync_enabled: false,
            send_bpm,
            ..Default::default()
        }
    }

    #[test]
    fn unchanged_bpm_is_transmitted_once() {
        let (mut tx, controls, osc) = transmitter(no_sync(140));

        for _ in 0..3 {
            tx.step(Instant::now()).unwrap();
        }
        assert_eq!(osc.floats_to(TEMPO), vec![0.25]);

        controls.set_send_bpm(260);
        tx.step(Instant::now()).unwrap();
        tx.step(Instant::now()).unwrap();
        assert_eq!(osc.floats_to(TEMPO), vec![0.25, 0.5]);
        assert_eq!(
            tx.stats(),
            TransmitStats {
                iterations: 5,
                transmissions: 2,
                resyncs: 0,
            }
        );
    }

    #[test]
    fn divider_is_captured_at_loop_entry() {
        let (mut tx, controls, osc) = transmitter(ControlState {
            beat_divider: BeatDivider::Half,
            ..no_sync(140)
        });
        controls.set_beat_divider(BeatDivider::Whole);

        tx.step(Instant::now()).unwrap();
        // 140 / 2 = 70 -> (70 - 20) / 480
        assert_eq!(osc.floats_to(TEMPO), vec![50.0 / 480.0]);
    }

    #[test]
    fn wait_follows_live_send_bpm() {
        let (mut tx, controls, _) = transmitter(no_sync(120));
        let wait = tx.step(Instant::now()).unwrap();
        assert!(wait <= Duration::from_millis(500));
        assert!(wait > Duration::from_millis(400));

        controls.set_send_bpm(240);
        let wait = tx.step(Instant::now()).unwrap();
        assert!(wait <= Duration::from_millis(250));
    }

    #[test]
    fn resync_rearms_and_stop_terminates() {
        let signal = Arc::new(WakeSignal::new());

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(30)))
        };
        signal.resync();
        assert_eq!(waiter.join().unwrap(), Wake::Resync);
        assert!(!signal.is_stopped());

        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(30)))
        };
        signal.stop();
        assert_eq!(waiter.join().unwrap(), Wake::Stop);
        assert_eq!(signal.wait_timeout(Duration::from_secs(30)), Wake::Stop);
    }

    #[test]
    fn wait_times_out_without_signals() {
        let signal = WakeSignal::new();
        assert_eq!(signal.wait_timeout(Duration::from_millis(5)), Wake::Timeout);
    }

    #[test]
    fn running_transmitter_survives_resync() {
        // 20 bpm: a three second wait that only signals can cut short.
        let (tx, _, osc) = transmitter(no_sync(20));
        let handle = TransmitterHandle::spawn(tx).unwrap();

        thread::sleep(Duration::from_millis(50));
        handle.resync();
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());

        let stats = handle.stop().unwrap();
        assert!(stats.iterations >= 2);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.transmissions, 1);
        // 20 bpm has no mapping, so nothing reaches the wire.
        assert!(osc.packets().is_empty());
    }
}
