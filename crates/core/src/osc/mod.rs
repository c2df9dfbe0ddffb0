//! OSC output adapter.
//!
//! Tempo values can be mapped onto the normalised `[0, 1]` range Resolume's
//! tempo controller expects; everything else is sent verbatim over UDP.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use rosc::{OscMessage, OscPacket, OscType};

use crate::{config::OscConfig, Result};

/// Lower bound (exclusive) of the BPM range mapped to the target.
pub const MAP_MIN_BPM: f32 = 20.0;
/// Upper bound (exclusive) of the BPM range mapped to the target.
pub const MAP_MAX_BPM: f32 = 500.0;

/// Numeric payload handed to an [`OscSink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OscValue {
    Int(i32),
    Float(f32),
}

impl OscValue {
    fn as_f32(self) -> f32 {
        match self {
            OscValue::Int(value) => value as f32,
            OscValue::Float(value) => value,
        }
    }
}

impl From<i32> for OscValue {
    fn from(value: i32) -> Self {
        OscValue::Int(value)
    }
}

impl From<u32> for OscValue {
    fn from(value: u32) -> Self {
        OscValue::Int(i32::try_from(value).unwrap_or(i32::MAX))
    }
}

impl From<f32> for OscValue {
    fn from(value: f32) -> Self {
        OscValue::Float(value)
    }
}

/// Maps a BPM onto the target's normalised tempo range. Values outside the
/// open interval `(20, 500)` have no mapping.
pub fn map_to_target(bpm: f32) -> Option<f32> {
    if bpm > MAP_MIN_BPM && bpm < MAP_MAX_BPM {
        Some((bpm - MAP_MIN_BPM) / (MAP_MAX_BPM - MAP_MIN_BPM))
    } else {
        None
    }
}

/// Resolves the argument actually put on the wire, or `None` when a mapped
/// value falls outside the mapping range and must be dropped.
pub fn prepare_argument(value: OscValue, map: bool) -> Option<OscType> {
    if map {
        return map_to_target(value.as_f32()).map(OscType::Float);
    }
    Some(match value {
        OscValue::Int(value) => OscType::Int(value),
        OscValue::Float(value) => OscType::Float(value),
    })
}

/// Fire-and-forget OSC transmitter.
pub trait OscSink: Send + Sync {
    /// Transmits one message with a single, already prepared argument.
    fn send_packet(&self, address: &str, argument: OscType);

    /// Sends `value` to `address`, optionally mapped onto the target's tempo
    /// range. Out-of-range mapped values are silently dropped.
    fn send(&self, address: &str, value: OscValue, map: bool) {
        match prepare_argument(value, map) {
            Some(argument) => self.send_packet(address, argument),
            None => tracing::trace!(address, ?value, "value outside mapping range, not sent"),
        }
    }
}

/// UDP OSC client. The socket is non-blocking so callers on the audio
/// callback never wait on the network.
#[derive(Debug)]
pub struct UdpOscSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpOscSender {
    pub fn new(config: &OscConfig) -> Result<Self> {
        let target = config.target_addr()?;
        let bind_addr = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        tracing::info!(%target, "osc sender ready");

        Ok(Self { socket, target })
    }
}

impl OscSink for UdpOscSender {
    fn send_packet(&self, address: &str, argument: OscType) {
        let packet = OscPacket::Message(OscMessage {
            addr: address.to_string(),
            args: vec![argument],
        });

        let bytes = match rosc::encoder::encode(&packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(address, "failed to encode osc message: {err:?}");
                return;
            }
        };

        match self.socket.send_to(&bytes, self.target) {
            Ok(_) => tracing::trace!(address, target = %self.target, "osc message sent"),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                tracing::debug!(address, "osc socket busy, dropping message");
            }
            Err(err) => tracing::warn!(address, "osc send failed: {err}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use rosc::OscType;

    use super::OscSink;

    /// Records every packet instead of sending it.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        packets: Mutex<Vec<(String, OscType)>>,
    }

    impl RecordingSink {
        pub fn packets(&self) -> Vec<(String, OscType)> {
            self.packets.lock().unwrap().clone()
        }

        pub fn floats_to(&self, address: &str) -> Vec<f32> {
            self.packets()
                .into_iter()
                .filter(|(addr, _)| addr == address)
                .filter_map(|(_, arg)| match arg {
                    OscType::Float(value) => Some(value),
                    _ => None,
                })
                .collect()
        }
    }

    impl OscSink for RecordingSink {
        fn send_packet(&self, address: &str, argument: OscType) {
            self.packets
                .lock()
                .unwrap()
                .push((address.to_string(), argument));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn maps_tempo_into_unit_range() {
        assert_eq!(map_to_target(140.0), Some(0.25));
        assert_eq!(map_to_target(500.0), None);
        assert_eq!(map_to_target(20.0), None);
        assert_eq!(map_to_target(21.0), Some(1.0 / 480.0));
    }

    #[test]
    fn mapped_sends_drop_out_of_range_values() {
        let sink = RecordingSink::default();
        sink.send("/tempo", OscValue::Int(140), true);
        sink.send("/tempo", OscValue::Int(500), true);
        sink.send("/tempo", OscValue::Int(20), true);

        assert_eq!(sink.floats_to("/tempo"), vec![0.25]);
    }

    #[test]
    fn unmapped_values_are_sent_verbatim() {
        let sink = RecordingSink::default();
        sink.send("/resync", OscValue::Int(1), false);
        sink.send("/raw", OscValue::Float(640.0), false);

        assert_eq!(
            sink.packets(),
            vec![
                ("/resync".to_string(), OscType::Int(1)),
                ("/raw".to_string(), OscType::Float(640.0)),
            ]
        );
    }

    #[test]
    fn udp_sender_delivers_encoded_messages() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = UdpOscSender::new(&OscConfig {
            port,
            ..OscConfig::default()
        })
        .unwrap();
        sender.send("/composition/tempocontroller/tempo", OscValue::Int(140), true);

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..len]).unwrap();
        match packet {
            OscPacket::Message(message) => {
                assert_eq!(message.addr, "/composition/tempocontroller/tempo");
                assert_eq!(message.args, vec![OscType::Float(0.25)]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
