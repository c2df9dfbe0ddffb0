//! Run-state owner tying capture, estimation, routing and the no-sync
//! transmitter together behind the control-plane operations.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    analysis::{TempoEstimator, TempoTracker, TrackerConfig},
    audio::{AudioBackend, CaptureStream, CpalBackend, FrameHandler, StreamControl},
    config::AppConfig,
    control::{BeatDivider, ControlState, Controls, SendBpmAdjust, MAX_SEND_BPM, MIN_SEND_BPM},
    display::{BpmReadout, DisplayEvent, DisplayHandle, DisplayTarget},
    level::LevelMeter,
    osc::{OscSink, OscValue, UdpOscSender},
    routing::{BeatRouter, RouteOutcome},
    tap::TapTempo,
    transmit::{NoSyncTransmitter, TransmitterHandle},
    Result,
};

/// Seconds of audio between two published level samples.
const LEVEL_PUBLISH_SECONDS: f32 = 0.05;

struct Session {
    running: Arc<AtomicBool>,
    stream: Box<dyn CaptureStream>,
    transmitter: Option<TransmitterHandle>,
}

/// Owns one BPM-to-OSC pipeline and its lifecycle.
///
/// Control operations are called from a single presentation context. The
/// audio callback and the no-sync transmitter only share the [`Controls`],
/// the OSC sink and the display queue with it.
pub struct BeatEngine {
    config: AppConfig,
    controls: Arc<Controls>,
    display: DisplayHandle,
    osc: Arc<dyn OscSink>,
    backend: Box<dyn AudioBackend>,
    taps: TapTempo,
    session: Option<Session>,
}

impl BeatEngine {
    /// Engine capturing through `cpal` and sending over UDP to the
    /// configured target.
    pub fn new(config: AppConfig, display: DisplayHandle) -> Result<Self> {
        let osc = Arc::new(UdpOscSender::new(&config.osc)?);
        Self::with_parts(config, display, Box::new(CpalBackend), osc)
    }

    pub fn with_parts(
        config: AppConfig,
        display: DisplayHandle,
        backend: Box<dyn AudioBackend>,
        osc: Arc<dyn OscSink>,
    ) -> Result<Self> {
        config.validate()?;
        let controls = Arc::new(Controls::new(config.tempo.initial_state())?);
        Ok(Self {
            config,
            controls,
            display,
            osc,
            backend,
            taps: TapTempo::new(),
            session: None,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controls(&self) -> &Arc<Controls> {
        &self.controls
    }

    pub fn state(&self) -> ControlState {
        self.controls.snapshot()
    }

    /// True while a session is open and its stream still delivers audio.
    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|session| {
            session.running.load(Ordering::SeqCst) && session.stream.is_active()
        })
    }

    /// Opens the audio stream with a fresh estimator and router. On failure
    /// the engine stays stopped.
    pub fn start(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if session.stream.is_active() {
                tracing::debug!("engine already running");
                return Ok(());
            }
            tracing::warn!("audio stream ended on its own, restarting");
            self.stop()?;
        }

        let audio = &self.config.audio;
        let mut estimator =
            TempoTracker::new(TrackerConfig::new(audio.frame_size, audio.sample_rate))?;
        let mut router = BeatRouter::new(
            self.controls.clone(),
            self.osc.clone(),
            self.display.clone(),
            self.config.osc.tempo_address.clone(),
        );
        let mut meter = LevelMeter::new();
        let level_every = ((LEVEL_PUBLISH_SECONDS * audio.sample_rate as f32
            / audio.frame_size as f32)
            .round() as usize)
            .max(1);
        let mut frames_since_level = 0;

        let running = Arc::new(AtomicBool::new(true));
        let callback_running = running.clone();
        let display = self.display.clone();
        let handler: FrameHandler = Box::new(move |frame| {
            meter.push(frame);
            frames_since_level += 1;
            if frames_since_level >= level_every {
                frames_since_level = 0;
                display.emit(DisplayEvent::Level {
                    rms: meter.average(),
                });
            }

            let event = match estimator.process(frame) {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!("tempo estimation failed: {err}");
                    return StreamControl::Complete;
                }
            };
            match router.route(event, callback_running.load(Ordering::SeqCst)) {
                RouteOutcome::Stop => StreamControl::Complete,
                _ => StreamControl::Continue,
            }
        });

        let stream = self.backend.open(audio, handler)?;
        let mut session = Session {
            running,
            stream,
            transmitter: None,
        };
        if !self.controls.snapshot().sync_enabled {
            session.transmitter = Some(self.spawn_transmitter()?);
        }
        self.session = Some(session);

        tracing::info!(
            sample_rate = audio.sample_rate,
            frame_size = audio.frame_size,
            "engine started"
        );
        Ok(())
    }

    /// Stops the transmitter, closes the stream and resets the displays.
    /// Stopping an idle engine does nothing.
    pub fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.running.store(false, Ordering::SeqCst);
        if let Some(transmitter) = &session.transmitter {
            transmitter.signal_stop();
        }
        let closed = session.stream.close();
        let joined = match session.transmitter {
            Some(transmitter) => transmitter.stop().map(|stats| {
                tracing::debug!(?stats, "no-sync transmitter joined");
            }),
            None => Ok(()),
        };

        self.display
            .bpm(BpmReadout::Placeholder, DisplayTarget::Both, false);
        self.display.emit(DisplayEvent::BeatLedReset);
        tracing::info!("engine stopped");

        closed.and(joined)
    }

    /// Switches between following the detector and holding the send BPM.
    /// Disabling sync while running starts the no-sync transmitter;
    /// re-enabling it stops the transmitter.
    pub fn set_sync_enabled(&mut self, enabled: bool) -> Result<()> {
        let previous = self.controls.set_sync_enabled(enabled);
        if previous == enabled {
            tracing::debug!(enabled, "sync state already set");
            return Ok(());
        }
        tracing::info!(enabled, "sync switched");

        if enabled {
            return self.stop_transmitter();
        }
        if self.is_running() {
            self.stop_transmitter()?;
            let transmitter = self.spawn_transmitter()?;
            if let Some(session) = self.session.as_mut() {
                session.transmitter = Some(transmitter);
            }
        }
        Ok(())
    }

    /// A running transmitter keeps the divider it started with.
    pub fn set_beat_divider(&mut self, divider: BeatDivider) {
        self.controls.set_beat_divider(divider);
        tracing::info!(divider = divider.factor(), "beat divider changed");
    }

    pub fn tap(&mut self) -> Result<Option<u32>> {
        self.tap_at(Instant::now())
    }

    /// Registers a tap. Once a BPM can be derived it is clamped into the send
    /// range, becomes the held send BPM and sync is switched off.
    pub fn tap_at(&mut self, now: Instant) -> Result<Option<u32>> {
        let Some(bpm) = self.taps.tap(now) else {
            return Ok(None);
        };

        let bpm = bpm.clamp(MIN_SEND_BPM, MAX_SEND_BPM);
        self.controls.set_send_bpm(bpm);
        self.set_sync_enabled(false)?;
        self.display
            .bpm(BpmReadout::Value(bpm), DisplayTarget::Send, false);
        tracing::debug!(bpm, "tap tempo");
        Ok(Some(bpm))
    }

    /// Applies a +1/-1/x2/÷2 step. Returns the new send BPM, or `None` when
    /// the step would leave the allowed range.
    pub fn adjust_send_bpm(&self, adjust: SendBpmAdjust) -> Option<u32> {
        let bpm = self.controls.adjust_send_bpm(adjust);
        match bpm {
            Some(bpm) => self
                .display
                .bpm(BpmReadout::Value(bpm), DisplayTarget::Send, false),
            None => tracing::debug!(?adjust, "send bpm adjustment out of range"),
        }
        bpm
    }

    /// Asks the receiver to realign its bar and restarts the local beat
    /// animation and transmitter wait. Only acts while running.
    pub fn resync_bar(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            tracing::debug!("resync ignored while stopped");
            return false;
        };

        self.osc
            .send(&self.config.osc.resync_address, OscValue::Int(1), false);
        self.display.emit(DisplayEvent::BeatLedReset);
        if let Some(transmitter) = &session.transmitter {
            transmitter.resync();
        }
        true
    }

    fn spawn_transmitter(&self) -> Result<TransmitterHandle> {
        let transmitter = NoSyncTransmitter::new(
            self.controls.clone(),
            self.osc.clone(),
            self.display.clone(),
            self.config.osc.tempo_address.clone(),
        );
        TransmitterHandle::spawn(transmitter)
    }

    fn stop_transmitter(&mut self) -> Result<()> {
        let transmitter = self
            .session
            .as_mut()
            .and_then(|session| session.transmitter.take());
        match transmitter {
            Some(transmitter) => transmitter.stop().map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for BeatEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("engine shutdown failed: {err}");
        }
    }
}

impl std::fmt::Debug for BeatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatEngine")
            .field("config", &self.config)
            .field("controls", &self.controls.snapshot())
            .field("taps", &self.taps.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        thread,
        time::Duration,
    };

    use crossbeam_channel::Receiver;
    use rosc::OscType;

    use super::*;
    use crate::analysis::synthetic::click_track;
    use crate::config::AudioConfig;
    use crate::osc::testing::RecordingSink;
    use crate::BpmOscError;

    type Slot = Arc<Mutex<Option<FrameHandler>>>;

    /// Backend whose frames are pushed by the test itself.
    #[derive(Default)]
    struct ManualBackend {
        slot: Slot,
        fail: bool,
    }

    struct ManualStream {
        slot: Slot,
    }

    impl AudioBackend for ManualBackend {
        fn open(
            &self,
            _config: &AudioConfig,
            handler: FrameHandler,
        ) -> Result<Box<dyn CaptureStream>> {
            if self.fail {
                return Err(BpmOscError::Audio("no input device".into()));
            }
            *self.slot.lock().unwrap() = Some(handler);
            Ok(Box::new(ManualStream {
                slot: self.slot.clone(),
            }))
        }
    }

    impl CaptureStream for ManualStream {
        fn is_active(&self) -> bool {
            self.slot.lock().unwrap().is_some()
        }

        fn close(self: Box<Self>) -> Result<()> {
            self.slot.lock().unwrap().take();
            Ok(())
        }
    }

    /// Delivers one frame; `None` once the stream is closed or completed.
    fn feed(slot: &Slot, frame: &[f32]) -> Option<StreamControl> {
        let mut guard = slot.lock().unwrap();
        let control = (guard.as_mut()?)(frame);
        if control == StreamControl::Complete {
            guard.take();
        }
        Some(control)
    }

    struct Harness {
        engine: BeatEngine,
        slot: Slot,
        osc: Arc<RecordingSink>,
        display: Receiver<DisplayEvent>,
    }

    fn harness(config: AppConfig) -> Harness {
        let backend = ManualBackend::default();
        let slot = backend.slot.clone();
        let osc = Arc::new(RecordingSink::default());
        let (display, receiver) = DisplayHandle::channel(4096);
        let engine =
            BeatEngine::with_parts(config, display, Box::new(backend), osc.clone()).unwrap();
        Harness {
            engine,
            slot,
            osc,
            display: receiver,
        }
    }

    fn held(send_bpm: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.tempo.sync_enabled = false;
        config.tempo.initial_send_bpm = send_bpm;
        config
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn failed_open_leaves_engine_stopped() {
        let backend = ManualBackend {
            fail: true,
            ..Default::default()
        };
        let mut engine = BeatEngine::with_parts(
            AppConfig::default(),
            DisplayHandle::detached(),
            Box::new(backend),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();

        assert!(matches!(engine.start(), Err(BpmOscError::Audio(_))));
        assert!(!engine.is_running());
        assert!(!engine.resync_bar());
    }

    #[test]
    fn stop_closes_stream_and_resets_displays() {
        let mut h = harness(AppConfig::default());
        h.engine.start().unwrap();
        assert!(h.engine.is_running());
        assert_eq!(feed(&h.slot, &[0.0; 512]), Some(StreamControl::Continue));

        h.engine.stop().unwrap();
        assert!(!h.engine.is_running());
        assert_eq!(feed(&h.slot, &[0.0; 512]), None);

        let events: Vec<_> = h.display.try_iter().collect();
        assert!(events.contains(&DisplayEvent::BpmUpdate {
            readout: BpmReadout::Placeholder,
            target: DisplayTarget::Both,
            blink: false,
        }));
        assert_eq!(events.last(), Some(&DisplayEvent::BeatLedReset));

        // The engine can be started again once stopped.
        h.engine.start().unwrap();
        assert!(h.engine.is_running());
    }

    #[test]
    fn publishes_level_samples() {
        let mut h = harness(AppConfig::default());
        h.engine.start().unwrap();
        for _ in 0..10 {
            feed(&h.slot, &[0.5; 512]);
        }

        let levels: Vec<_> = h
            .display
            .try_iter()
            .filter_map(|event| match event {
                DisplayEvent::Level { rms } => Some(rms),
                _ => None,
            })
            .collect();
        // 50 ms at 44.1 kHz rounds to every fourth 512-sample frame.
        assert_eq!(levels, vec![100, 100]);
    }

    #[test]
    fn click_track_drives_tempo_messages() {
        let mut h = harness(AppConfig::default());
        h.engine.start().unwrap();

        let signal = click_track(512 * 43, 512 * 43 * 24, 44_100);
        for frame in signal.chunks_exact(512) {
            assert_eq!(feed(&h.slot, frame), Some(StreamControl::Continue));
        }

        let sent = h.osc.floats_to(&h.engine.config().osc.tempo_address);
        assert!(sent.len() >= 8, "only {} tempo messages", sent.len());
        let bpm = sent.last().unwrap() * 480.0 + 20.0;
        assert!((bpm - 120.0).abs() <= 2.5, "sent {bpm}");
        assert_eq!(h.engine.state().send_bpm, bpm.round() as u32);
    }

    #[test]
    fn stream_ending_on_its_own_is_not_running() {
        let mut h = harness(AppConfig::default());
        h.engine.start().unwrap();

        // A short frame fails estimation, which completes the stream.
        assert_eq!(feed(&h.slot, &[0.0; 100]), Some(StreamControl::Complete));
        assert!(!h.engine.is_running());

        h.engine.start().unwrap();
        assert!(h.engine.is_running());
    }

    #[test]
    fn sync_off_keeps_divided_tempo() {
        let mut config = AppConfig::default();
        config.tempo.beat_divider = BeatDivider::Half;
        let mut h = harness(config);
        h.engine.start().unwrap();
        let address = h.engine.config().osc.tempo_address.clone();

        let signal = click_track(512 * 43, 512 * 43 * 24, 44_100);
        for frame in signal.chunks_exact(512) {
            feed(&h.slot, frame);
        }
        let synced = h.osc.floats_to(&address);
        let last = *synced.last().unwrap();
        let halved = last * 480.0 + 20.0;
        assert!((halved - 60.0).abs() <= 1.5, "sent {halved}");

        h.engine.set_sync_enabled(false).unwrap();
        assert!(wait_for(|| h.osc.floats_to(&address).len() == synced.len() + 1));
        assert_eq!(h.osc.floats_to(&address).last(), Some(&last));
        h.engine.stop().unwrap();
    }

    #[test]
    fn held_tempo_is_transmitted_when_starting_unsynced() {
        let mut h = harness(held(140));
        h.engine.start().unwrap();

        let address = h.engine.config().osc.tempo_address.clone();
        assert!(wait_for(|| h.osc.floats_to(&address) == vec![0.25]));

        h.engine.stop().unwrap();
        h.engine.start().unwrap();
        // A fresh transmitter sends the held value again.
        assert!(wait_for(|| h.osc.floats_to(&address).len() == 2));
        h.engine.stop().unwrap();
    }

    #[test]
    fn sync_toggle_controls_transmitter() {
        let mut h = harness(AppConfig::default());
        h.engine.start().unwrap();
        let address = h.engine.config().osc.tempo_address.clone();

        h.engine.set_sync_enabled(false).unwrap();
        assert!(wait_for(|| h.osc.floats_to(&address).len() == 1));
        // 128 -> (128 - 20) / 480
        assert_eq!(h.osc.floats_to(&address), vec![108.0 / 480.0]);

        h.engine.set_sync_enabled(true).unwrap();
        assert!(h.engine.state().sync_enabled);
        h.engine.adjust_send_bpm(SendBpmAdjust::Double);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(h.osc.floats_to(&address).len(), 1);
    }

    #[test]
    fn tapping_holds_tempo_and_disables_sync() {
        let mut h = harness(AppConfig::default());
        let t0 = Instant::now();

        assert_eq!(h.engine.tap_at(t0).unwrap(), None);
        assert!(h.engine.state().sync_enabled);
        assert_eq!(
            h.engine.tap_at(t0 + Duration::from_millis(500)).unwrap(),
            Some(120)
        );

        let state = h.engine.state();
        assert!(!state.sync_enabled);
        assert_eq!(state.send_bpm, 120);
        assert!(h.display.try_iter().any(|event| event
            == DisplayEvent::BpmUpdate {
                readout: BpmReadout::Value(120),
                target: DisplayTarget::Send,
                blink: false,
            }));

        // Tap history survives a start/stop cycle.
        h.engine.start().unwrap();
        h.engine.stop().unwrap();
        assert_eq!(
            h.engine.tap_at(t0 + Duration::from_millis(1000)).unwrap(),
            Some(120)
        );
    }

    #[test]
    fn fast_taps_are_clamped() {
        let mut h = harness(AppConfig::default());
        let t0 = Instant::now();
        h.engine.tap_at(t0).unwrap();
        assert_eq!(
            h.engine.tap_at(t0 + Duration::from_millis(100)).unwrap(),
            Some(MAX_SEND_BPM)
        );
        assert_eq!(h.engine.state().send_bpm, MAX_SEND_BPM);
    }

    #[test]
    fn adjustments_respect_bounds() {
        let h = harness(held(300));
        assert_eq!(h.engine.adjust_send_bpm(SendBpmAdjust::Double), None);
        assert_eq!(h.engine.adjust_send_bpm(SendBpmAdjust::Halve), Some(150));
        assert_eq!(h.engine.adjust_send_bpm(SendBpmAdjust::Increment), Some(151));
        assert_eq!(h.engine.state().send_bpm, 151);
    }

    #[test]
    fn resync_sends_unmapped_pulse() {
        let mut h = harness(held(20));
        h.engine.start().unwrap();
        assert!(h.engine.resync_bar());

        let resync = h.engine.config().osc.resync_address.clone();
        assert!(h
            .osc
            .packets()
            .contains(&(resync, OscType::Int(1))));
        assert!(h
            .display
            .try_iter()
            .any(|event| event == DisplayEvent::BeatLedReset));
        // The transmitter keeps running after the pulse.
        assert!(h.engine.is_running());
        h.engine.stop().unwrap();
    }

    #[test]
    fn drop_stops_the_engine() {
        let h = harness(held(140));
        let Harness {
            mut engine, slot, ..
        } = h;
        engine.start().unwrap();
        drop(engine);
        assert!(slot.lock().unwrap().is_none());
    }
}
