//! VISCA over IP transport.
//!
//! Wire format (UDP datagram):
//! ```text
//! ┌──────────────┬────────────────┬─────────────┬──────────────────┐
//! │ payload type │ payload length │ sequence no │ VISCA payload    │
//! │ 2 bytes BE   │ 2 bytes BE     │ 4 bytes BE  │ 3..16 bytes      │
//! └──────────────┴────────────────┴─────────────┴──────────────────┘
//! ```
//!
//! A command is answered by an ACK (`90 4z FF`) followed by a completion
//! (`90 5z FF`), or by an error (`90 6z ee FF`). An inquiry is answered by a
//! completion carrying data. Replies echo the request's sequence number;
//! anything else is a late answer to an abandoned attempt and is ignored.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::link::{CameraCommand, CameraProtocol, CommandReply, DeviceError};
use super::FocusValue;

pub const PAYLOAD_COMMAND: u16 = 0x0100;
pub const PAYLOAD_INQUIRY: u16 = 0x0110;
pub const PAYLOAD_REPLY: u16 = 0x0111;

/// Default UDP port for VISCA over IP.
pub const DEFAULT_PORT: u16 = 52381;

/// Camera error code for "command buffer full"; the only retryable rejection.
pub const ERROR_BUFFER_FULL: u8 = 0x03;

const HEADER_LEN: usize = 8;
const CAMERA: u8 = 0x81;
const TERMINATOR: u8 = 0xFF;

/// One VISCA-over-IP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload_type: u16,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.payload_type.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.len() < HEADER_LEN {
            return Err(DeviceError::MalformedReply(format!(
                "datagram of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let payload_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let sequence = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != length {
            return Err(DeviceError::MalformedReply(format!(
                "header announces {length} payload bytes, got {}",
                payload.len()
            )));
        }
        Ok(Self {
            payload_type,
            sequence,
            payload: payload.to_vec(),
        })
    }
}

/// Parsed VISCA reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// Completion, with inquiry data if any
    Completion(Vec<u8>),
    Error(u8),
}

pub fn parse_reply(payload: &[u8]) -> Result<Reply, DeviceError> {
    if payload.len() < 3 || payload[0] & 0xF0 < 0x90 || payload[payload.len() - 1] != TERMINATOR {
        return Err(DeviceError::MalformedReply(format!("{payload:02x?}")));
    }
    match payload[1] & 0xF0 {
        0x40 => Ok(Reply::Ack),
        0x50 => Ok(Reply::Completion(payload[2..payload.len() - 1].to_vec())),
        0x60 if payload.len() >= 4 => Ok(Reply::Error(payload[2])),
        _ => Err(DeviceError::MalformedReply(format!("{payload:02x?}"))),
    }
}

/// Split a focus position into the four low nibbles VISCA expects.
pub fn focus_nibbles(focus: FocusValue) -> [u8; 4] {
    [
        ((focus >> 12) & 0x0F) as u8,
        ((focus >> 8) & 0x0F) as u8,
        ((focus >> 4) & 0x0F) as u8,
        (focus & 0x0F) as u8,
    ]
}

fn focus_from_nibbles(data: &[u8]) -> Result<FocusValue, DeviceError> {
    if data.len() != 4 {
        return Err(DeviceError::MalformedReply(format!(
            "focus inquiry returned {} data bytes",
            data.len()
        )));
    }
    Ok(data
        .iter()
        .fold(0u16, |acc, nibble| (acc << 4) | u16::from(nibble & 0x0F)))
}

fn on_off(on: bool) -> u8 {
    if on {
        0x02
    } else {
        0x03
    }
}

/// VISCA messages making up one command, in send order.
pub fn command_payloads(command: CameraCommand) -> Vec<(u16, Vec<u8>)> {
    match command {
        CameraCommand::InquireFocus => {
            vec![(PAYLOAD_INQUIRY, vec![CAMERA, 0x09, 0x04, 0x48, TERMINATOR])]
        }
        CameraCommand::CommitMemory(slot) => {
            vec![(PAYLOAD_COMMAND, vec![CAMERA, 0x01, 0x04, 0x3F, 0x01, slot, TERMINATOR])]
        }
        CameraCommand::Recall { slot, focus } => {
            let [p, q, r, s] = focus_nibbles(focus);
            vec![
                (PAYLOAD_COMMAND, vec![CAMERA, 0x01, 0x04, 0x3F, 0x02, slot, TERMINATOR]),
                // Manual focus, otherwise autofocus overrides the stored value
                (PAYLOAD_COMMAND, vec![CAMERA, 0x01, 0x04, 0x38, 0x03, TERMINATOR]),
                (PAYLOAD_COMMAND, vec![CAMERA, 0x01, 0x04, 0x48, p, q, r, s, TERMINATOR]),
            ]
        }
        CameraCommand::Power(on) => {
            vec![(PAYLOAD_COMMAND, vec![CAMERA, 0x01, 0x04, 0x00, on_off(on), TERMINATOR])]
        }
        CameraCommand::FocusLock(on) => {
            vec![(PAYLOAD_COMMAND, vec![CAMERA, 0x0A, 0x04, 0x68, on_off(on), TERMINATOR])]
        }
    }
}

/// UDP transport to one camera.
pub struct UdpVisca {
    socket: UdpSocket,
    peer: SocketAddr,
    sequence: u32,
}

impl UdpVisca {
    /// Bind an ephemeral local port and associate it with the camera.
    pub async fn connect(peer: SocketAddr) -> std::io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            sequence: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message and wait for its completion data.
    async fn exchange(&mut self, payload_type: u16, payload: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        self.sequence = self.sequence.wrapping_add(1);
        let packet = Packet {
            payload_type,
            sequence: self.sequence,
            payload,
        };
        self.socket.send(&packet.encode()).await?;

        let mut buf = [0u8; 64];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            let reply = match Packet::decode(&buf[..n]) {
                Ok(reply) => reply,
                Err(e) => {
                    log::debug!("Ignoring datagram from {}: {e}", self.peer);
                    continue;
                }
            };
            if reply.sequence != self.sequence {
                log::trace!(
                    "Ignoring stale reply #{} from {} (waiting for #{})",
                    reply.sequence,
                    self.peer,
                    self.sequence
                );
                continue;
            }
            match parse_reply(&reply.payload)? {
                Reply::Ack => continue,
                Reply::Completion(data) => return Ok(data),
                Reply::Error(code) => return Err(DeviceError::Rejected { code }),
            }
        }
    }
}

impl CameraProtocol for UdpVisca {
    async fn execute(&mut self, command: CameraCommand) -> Result<CommandReply, DeviceError> {
        let mut data = Vec::new();
        for (payload_type, payload) in command_payloads(command) {
            data = self.exchange(payload_type, payload).await?;
        }
        match command {
            CameraCommand::InquireFocus => Ok(CommandReply::Focus(focus_from_nibbles(&data)?)),
            _ => Ok(CommandReply::Done),
        }
    }
}
