//! Line-oriented console front end: command parsing and display rendering.

use std::str::FromStr;

use bpm_osc_core::{BeatDivider, BeatLed, BpmReadout, DisplayEvent, DisplayTarget, SendBpmAdjust};

/// One console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Tap,
    Sync(bool),
    Divider(BeatDivider),
    Adjust(SendBpmAdjust),
    Resync,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err("empty command".into());
        };
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments for `{head}`"));
        }

        let command = match (head.to_ascii_lowercase().as_str(), arg) {
            ("start", None) => Command::Start,
            ("stop", None) => Command::Stop,
            ("t" | "tap", None) => Command::Tap,
            ("sync", Some("on")) => Command::Sync(true),
            ("sync", Some("off")) => Command::Sync(false),
            ("sync", _) => return Err("usage: sync on|off".into()),
            ("div", Some(value)) => {
                let factor: u32 = value
                    .parse()
                    .map_err(|_| format!("`{value}` is not a divider"))?;
                let divider = BeatDivider::try_from(factor).map_err(|err| err.to_string())?;
                Command::Divider(divider)
            }
            ("div", None) => return Err("usage: div 1|2".into()),
            ("+", None) => Command::Adjust(SendBpmAdjust::Increment),
            ("-", None) => Command::Adjust(SendBpmAdjust::Decrement),
            ("x2" | "*2", None) => Command::Adjust(SendBpmAdjust::Double),
            ("/2", None) => Command::Adjust(SendBpmAdjust::Halve),
            ("r" | "resync", None) => Command::Resync,
            ("s" | "status", None) => Command::Status,
            ("h" | "help" | "?", None) => Command::Help,
            ("q" | "quit" | "exit", None) => Command::Quit,
            _ => return Err(format!("unknown command `{}`", line.trim())),
        };
        Ok(command)
    }
}

pub const HELP: &str = "\
commands:
  start | stop        open or close the audio input
  t | tap             tap tempo (switches sync off)
  sync on|off         follow the detected tempo or hold the send tempo
  div 1|2             beat divider
  + | - | x2 | /2     adjust the held send tempo
  r | resync          resync the receiver's bar
  s | status          show the current controls
  q | quit            exit";

/// Turns display events into output lines.
#[derive(Debug, Default)]
pub struct Renderer {
    json: bool,
    led: BeatLed,
    live_blink: bool,
    send_blink: bool,
}

impl Renderer {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            ..Self::default()
        }
    }

    /// Returns the line to print for `event`, if any. Text mode keeps level
    /// samples off the console.
    pub fn render(&mut self, event: &DisplayEvent) -> Option<String> {
        self.led.apply(event);
        if self.json {
            return serde_json::to_string(event).ok();
        }

        match *event {
            DisplayEvent::BpmUpdate {
                readout,
                target,
                blink,
            } => {
                let lit = blink && self.toggle_blink(target);
                let value = match readout {
                    BpmReadout::Value(bpm) => format!("{bpm:>3}"),
                    BpmReadout::Placeholder => "---".to_string(),
                };
                let target = match target {
                    DisplayTarget::Live => "live",
                    DisplayTarget::Send => "send",
                    DisplayTarget::Both => "live+send",
                };
                let marker = if lit { '*' } else { ' ' };
                Some(format!("{target:>9} {value} {marker} [{}]", self.led_bar()))
            }
            DisplayEvent::Level { .. } => None,
            DisplayEvent::BeatLedAdvance | DisplayEvent::BeatLedReset => None,
        }
    }

    /// Flips the blink phase of the readouts `target` covers and returns the
    /// new phase. Each readout alternates on its own.
    fn toggle_blink(&mut self, target: DisplayTarget) -> bool {
        match target {
            DisplayTarget::Live => {
                self.live_blink = !self.live_blink;
                self.live_blink
            }
            DisplayTarget::Send => {
                self.send_blink = !self.send_blink;
                self.send_blink
            }
            DisplayTarget::Both => {
                self.live_blink = !self.live_blink;
                self.send_blink = self.live_blink;
                self.live_blink
            }
        }
    }

    fn led_bar(&self) -> String {
        (0..bpm_osc_core::display::BEAT_LED_STEPS)
            .map(|step| if self.led.step() == Some(step) { '#' } else { '.' })
            .collect()
    }
}
