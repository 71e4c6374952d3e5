// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The four ISO-TP PDU kinds and their wire encoding.
//!
//! Dynamic dispatch on PDU kind is rendered as a tagged enum: one decode
//! function returns one of the four variants, each carrying its own
//! decoded fields, rather than a class hierarchy.

use std::time::Duration;

use crate::error::IsoTpError;
use crate::frame::CanMessage;

/// FlowStatus carried in byte 0 (low nibble) of a FlowControl frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Sender may continue transmitting consecutive frames.
    Continue,
    /// Sender must pause and wait for another FlowControl.
    Wait,
    /// Receiver cannot accept this transfer; sender must abort.
    Overflow,
}

impl FlowStatus {
    fn from_nibble(nibble: u8) -> Result<Self, IsoTpError> {
        match nibble {
            0 => Ok(FlowStatus::Continue),
            1 => Ok(FlowStatus::Wait),
            2 => Ok(FlowStatus::Overflow),
            other => Err(IsoTpError::InvalidCanData(format!(
                "unknown flow status nibble {other:#x}"
            ))),
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            FlowStatus::Continue => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        }
    }
}

/// STmin as decoded off (or destined for) the wire: the separation time
/// a sender must honor between consecutive frames.
///
/// Reserved wire values (0x80-0xF0, 0xFA-0xFF) decode as 127ms (0x7F).
/// This substitution is a deliberate, locked behavior, not a bug: future
/// revisions that want to change it should change it here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparationTime(Duration);

impl SeparationTime {
    /// Build from a millisecond count, clamping to the legal 0-127 range.
    pub fn from_millis(ms: u8) -> Self {
        Self(Duration::from_millis(ms.min(0x7F) as u64))
    }

    /// Build from a microsecond count in the 100-900us range (rounds down
    /// to the nearest 100us step the wire format supports).
    pub fn from_micros_100_step(us: u32) -> Self {
        let step = (us / 100).clamp(1, 9);
        Self(Duration::from_micros((step * 100) as u64))
    }

    pub fn zero() -> Self {
        Self(Duration::ZERO)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Decode a raw STmin wire byte.
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0x00..=0x7F => Self::from_millis(byte),
            0xF1..=0xF9 => Self::from_micros_100_step((byte - 0xF0) as u32 * 100),
            _ => Self::from_millis(0x7F),
        }
    }

    /// Encode back to a wire byte. Values that don't fall on an exact
    /// millisecond or 100us-in-[100,900] step are rounded down.
    pub fn to_wire(self) -> u8 {
        let micros = self.0.as_micros();
        if micros == 0 {
            return 0;
        }
        if micros < 100_000 && micros % 100 == 0 && micros <= 900 {
            return 0xF0 + (micros / 100) as u8;
        }
        let ms = (micros / 1000).min(0x7F as u128);
        ms as u8
    }
}

impl Default for SeparationTime {
    fn default() -> Self {
        Self::zero()
    }
}

/// A decoded (or yet-to-be-encoded) ISO-TP protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// Complete payload fitting in one frame.
    SingleFrame { data: Vec<u8> },
    /// First segment of a multi-frame payload, carrying the total
    /// declared length.
    FirstFrame { length: u32, data: Vec<u8> },
    /// One 4-bit-sequenced segment of a multi-frame payload.
    ConsecutiveFrame { sequence_number: u8, data: Vec<u8> },
    /// Pacing instructions from receiver to sender.
    FlowControl {
        flow_status: FlowStatus,
        block_size: u8,
        stmin: SeparationTime,
    },
}

/// Frame sizing & padding policy applied when serializing a PDU onto a
/// CAN data field.
#[derive(Debug, Clone, Copy)]
pub struct FramingPolicy {
    pub is_fd: bool,
    pub tx_data_min_length: Option<u8>,
    pub tx_padding: Option<u8>,
}

impl Default for FramingPolicy {
    fn default() -> Self {
        Self { is_fd: false, tx_data_min_length: None, tx_padding: None }
    }
}

const DEFAULT_PAD_BYTE: u8 = 0xCC;

impl Pdu {
    /// Decode a PDU from an already-prefix-stripped CAN data field.
    pub fn decode(data: &[u8]) -> Result<Self, IsoTpError> {
        let first = *data
            .first()
            .ok_or_else(|| IsoTpError::InvalidCanData("empty CAN data field".into()))?;
        let kind = first >> 4;
        match kind {
            0x0 => Self::decode_single_frame(data),
            0x1 => Self::decode_first_frame(data),
            0x2 => Self::decode_consecutive_frame(first, data),
            0x3 => Self::decode_flow_control(first, data),
            other => Err(IsoTpError::InvalidCanData(format!(
                "unknown PDU type nibble {other:#x}"
            ))),
        }
    }

    fn decode_single_frame(data: &[u8]) -> Result<Self, IsoTpError> {
        let low_nibble = data[0] & 0x0F;
        let (len, payload_start) = if low_nibble == 0 {
            // CAN-FD escape form: explicit length in byte[1].
            let len = *data
                .get(1)
                .ok_or_else(|| IsoTpError::MissingEscapeSequence)? as usize;
            (len, 2)
        } else {
            (low_nibble as usize, 1)
        };
        if len == 0 {
            return Err(IsoTpError::InvalidCanData("single frame with length 0".into()));
        }
        if payload_start + len > data.len() {
            return Err(IsoTpError::InvalidCanData(
                "single frame length exceeds data field".into(),
            ));
        }
        Ok(Pdu::SingleFrame { data: data[payload_start..payload_start + len].to_vec() })
    }

    fn decode_first_frame(data: &[u8]) -> Result<Self, IsoTpError> {
        if data.len() < 2 {
            return Err(IsoTpError::InvalidCanData("first frame too short".into()));
        }
        let twelve_bit = (((data[0] & 0x0F) as u32) << 8) | data[1] as u32;
        if twelve_bit == 0 {
            // 32-bit escape form.
            if data.len() < 6 {
                return Err(IsoTpError::MissingEscapeSequence);
            }
            let length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
            Ok(Pdu::FirstFrame { length, data: data[6..].to_vec() })
        } else {
            Ok(Pdu::FirstFrame { length: twelve_bit, data: data[2..].to_vec() })
        }
    }

    fn decode_consecutive_frame(first: u8, data: &[u8]) -> Result<Self, IsoTpError> {
        let sequence_number = first & 0x0F;
        Ok(Pdu::ConsecutiveFrame { sequence_number, data: data[1..].to_vec() })
    }

    fn decode_flow_control(first: u8, data: &[u8]) -> Result<Self, IsoTpError> {
        if data.len() < 3 {
            return Err(IsoTpError::InvalidCanData("flow control frame too short".into()));
        }
        let flow_status = FlowStatus::from_nibble(first & 0x0F)?;
        Ok(Pdu::FlowControl {
            flow_status,
            block_size: data[1],
            stmin: SeparationTime::from_wire(data[2]),
        })
    }

    /// Encode this PDU onto a CAN data field, with an optional
    /// `tx_payload_prefix` byte prepended and padding/sizing applied per
    /// `policy`. Returns the finished data field ready to go on the wire.
    pub fn encode(
        &self,
        prefix: Option<u8>,
        policy: FramingPolicy,
    ) -> Result<Vec<u8>, IsoTpError> {
        let mut body = self.encode_body(prefix.is_some(), policy.is_fd)?;
        let mut out = Vec::with_capacity(body.len() + 1);
        if let Some(p) = prefix {
            out.push(p);
        }
        out.append(&mut body);
        Ok(pad(out, policy))
    }

    fn encode_body(&self, has_prefix: bool, is_fd: bool) -> Result<Vec<u8>, IsoTpError> {
        let prefix_len = has_prefix as usize;
        match self {
            Pdu::SingleFrame { data } => encode_single_frame(data, prefix_len, is_fd),
            Pdu::FirstFrame { length, data } => encode_first_frame(*length, data),
            Pdu::ConsecutiveFrame { sequence_number, data } => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(0x20 | (sequence_number & 0x0F));
                out.extend_from_slice(data);
                Ok(out)
            }
            Pdu::FlowControl { flow_status, block_size, stmin } => {
                Ok(vec![0x30 | flow_status.to_nibble(), *block_size, stmin.to_wire()])
            }
        }
    }
}

fn encode_single_frame(data: &[u8], prefix_len: usize, is_fd: bool) -> Result<Vec<u8>, IsoTpError> {
    let classical_max = 7usize.saturating_sub(prefix_len);
    if data.len() <= classical_max && data.len() <= 0x0F {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(data.len() as u8);
        out.extend_from_slice(data);
        return Ok(out);
    }
    if !is_fd {
        return Err(IsoTpError::InvalidArgument(format!(
            "payload of {} bytes does not fit a classical single frame",
            data.len()
        )));
    }
    if data.len() > 0xFF {
        return Err(IsoTpError::InvalidArgument(
            "payload too long even for a CAN-FD escape single frame".into(),
        ));
    }
    let mut out = Vec::with_capacity(2 + data.len());
    out.push(0x00);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    Ok(out)
}

fn encode_first_frame(length: u32, data: &[u8]) -> Result<Vec<u8>, IsoTpError> {
    let mut out = Vec::with_capacity(8 + data.len());
    if length <= 0xFFF {
        out.push(0x10 | ((length >> 8) as u8 & 0x0F));
        out.push((length & 0xFF) as u8);
    } else {
        out.push(0x10);
        out.push(0x00);
        out.extend_from_slice(&length.to_be_bytes());
    }
    out.extend_from_slice(data);
    Ok(out)
}

fn pad(mut data: Vec<u8>, policy: FramingPolicy) -> Vec<u8> {
    let target = CanMessage::fitting_size(data.len(), policy.is_fd, policy.tx_data_min_length);
    if (target as usize) <= data.len() {
        return data;
    }
    let needs_padding = policy.tx_padding.is_some() || policy.tx_data_min_length.is_some();
    if !needs_padding && !policy.is_fd {
        return data;
    }
    let pad_byte = policy.tx_padding.unwrap_or(DEFAULT_PAD_BYTE);
    data.resize(target as usize, pad_byte);
    data
}
