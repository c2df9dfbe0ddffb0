//! Core library for the BPM to OSC bridge.
//!
//! Live audio is analysed frame by frame for beats and tempo, the detected
//! tempo is filtered and divided according to the user's controls, and the
//! result is sent as OSC messages to a tempo-following receiver. A held tempo
//! can be set by tapping and is re-sent periodically while sync is off.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod control;
pub mod display;
pub mod engine;
pub mod error;
pub mod level;
pub mod osc;
pub mod routing;
pub mod tap;
pub mod transmit;

pub use analysis::{BeatEvent, TempoEstimator, TempoTracker, TrackerConfig};
pub use audio::{AudioBackend, CaptureStream, CpalBackend, FrameHandler, StreamControl};
pub use config::{AppConfig, AudioConfig, OscConfig, TempoConfig};
pub use control::{BeatDivider, ControlState, Controls, SendBpmAdjust};
pub use display::{BeatLed, BpmReadout, DisplayEvent, DisplayHandle, DisplayTarget};
pub use engine::BeatEngine;
pub use error::{BpmOscError, Result};
pub use level::LevelMeter;
pub use osc::{OscSink, OscValue, UdpOscSender};
pub use routing::{BeatRouter, RouteOutcome};
pub use tap::TapTempo;
pub use transmit::{NoSyncTransmitter, TransmitStats, TransmitterHandle, WakeSignal};
