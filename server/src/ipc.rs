//! Control-channel message types and framing.
//!
//! Every in-band message travels as newline-free compact JSON of the shape
//! `{"type": <tag>, "data": <obj>, "timestamp": <float>}` behind a
//! big-endian `u32` length prefix.

use std::collections::BTreeMap;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Worker id assigned by the master; stable for the worker's lifetime and
/// never reused while that worker is alive.
pub type WorkerId = u32;

/// Control messages exchanged between master and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum IpcPayload {
    /// The worker finished initialization and accepts hand-offs.
    WorkerReady {
        /// Id of the worker that became ready.
        worker_id: WorkerId,
    },
    /// A connection previously handed to the worker was closed.
    ConnectionClosed {
        /// Id assigned to the connection at accept time.
        connection_id: u64,
    },
    /// Periodic worker statistics for export by the master.
    WorkerMetrics {
        /// Counter and gauge values by name.
        metrics: BTreeMap<String, f64>,
    },
    /// Drain in-flight requests and exit.
    Shutdown {},
    /// Re-execute initialization; workers treat this as advisory.
    Reload {},
}

/// One tagged control message with its send timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// The discriminated payload.
    #[serde(flatten)]
    pub payload: IpcPayload,
    /// Seconds since the Unix epoch at send time.
    pub timestamp: f64,
}

impl IpcMessage {
    /// Wraps a payload, stamping it with the current time.
    pub fn new(payload: IpcPayload) -> Self {
        IpcMessage {
            payload,
            timestamp: unix_now(),
        }
    }

    /// Serializes to a length-prefixed compact JSON frame.
    pub fn encode(&self) -> Vec<u8> {
        // no map keys or values here can fail to serialize
        let json = serde_json::to_vec(self).expect("ipc message serializes");
        frame(&json)
    }

    /// Parses a frame produced by [`IpcMessage::encode`].
    pub fn decode(frame: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(unframe(frame)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Metadata accompanying a descriptor hand-off from master to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// The worker the connection was assigned to.
    pub worker_id: WorkerId,
    /// Id assigned to the connection at accept time.
    pub connection_id: u64,
    /// Remote peer address.
    pub remote_ip: String,
    /// Remote peer port.
    pub remote_port: u16,
    /// Seconds since the Unix epoch when the connection was accepted.
    pub accepted_at: f64,
}

impl Handoff {
    /// Serializes to a length-prefixed compact JSON frame.
    pub fn encode(&self) -> Vec<u8> {
        let json = serde_json::to_vec(self).expect("handoff metadata serializes");
        frame(&json)
    }

    /// Parses a frame produced by [`Handoff::encode`].
    pub fn decode(frame: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(unframe(frame)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Seconds since the Unix epoch, as the wire format's float timestamps.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn frame(json: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(json);
    out
}

fn unframe(frame: &[u8]) -> io::Result<&[u8]> {
    if frame.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than its length prefix",
        ));
    }

    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[4..];
    if declared != body.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length prefix mismatch",
        ));
    }

    Ok(body)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn messages_round_trip_through_framing() {
        let cases = [
            IpcPayload::WorkerReady { worker_id: 3 },
            IpcPayload::ConnectionClosed { connection_id: 99 },
            IpcPayload::WorkerMetrics {
                metrics: BTreeMap::from([
                    ("connections_active".to_string(), 4.0),
                    ("requests_served".to_string(), 128.0),
                ]),
            },
            IpcPayload::Shutdown {},
            IpcPayload::Reload {},
        ];

        for payload in cases {
            let message = IpcMessage::new(payload);
            let decoded = IpcMessage::decode(&message.encode()).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn wire_shape_is_tagged_json_with_timestamp() {
        let message = IpcMessage {
            payload: IpcPayload::WorkerReady { worker_id: 7 },
            timestamp: 1234.5,
        };

        let frame = message.encode();
        let json: serde_json::Value = serde_json::from_slice(&frame[4..]).unwrap();

        assert_eq!("worker_ready", json["type"]);
        assert_eq!(7, json["data"]["worker_id"]);
        assert_eq!(1234.5, json["timestamp"]);
        assert!(!frame[4..].contains(&b'\n'));
    }

    #[test]
    fn length_prefix_is_validated() {
        let message = IpcMessage::new(IpcPayload::Shutdown {});
        let mut frame = message.encode();

        assert!(IpcMessage::decode(&frame[..2]).is_err());

        frame[3] = frame[3].wrapping_add(1);
        assert!(IpcMessage::decode(&frame).is_err());
    }

    #[test]
    fn handoff_metadata_round_trips() {
        let meta = Handoff {
            worker_id: 1,
            connection_id: 42,
            remote_ip: "192.0.2.7".to_string(),
            remote_port: 50412,
            accepted_at: unix_now(),
        };

        let decoded = Handoff::decode(&meta.encode()).unwrap();
        assert_eq!(meta, decoded);
    }

    #[test]
    fn timestamps_advance() {
        let a = unix_now();
        let b = unix_now();
        assert!(b >= a);
        assert!(a > 0.0);
    }
}
