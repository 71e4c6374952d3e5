// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The link-layer data model: a single CAN/CAN-FD frame as seen at the
//! ISO-TP boundary, and the DLC tables both the codec and the params
//! validation share.

use core::fmt;

/// Legal CAN-FD data lengths above the classical 8-byte ceiling.
pub const FD_DATA_LENGTHS: [u8; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

/// One CAN or CAN-FD frame as exchanged with the link layer.
///
/// This is deliberately link-layer-only: it carries no ISO-TP semantics.
/// `pdu::Pdu::decode`/`encode` interpret and produce the `data` field.
#[derive(Clone, PartialEq, Eq)]
pub struct CanMessage {
    /// 11-bit or 29-bit arbitration ID (the CAN_EFF_FLAG bit is not set
    /// here; extendedness is carried in `is_extended_id`).
    pub arbitration_id: u32,
    /// Data length code in the raw wire sense: the actual byte count,
    /// already resolved from whatever the link layer's DLC encoding was.
    pub dlc: u8,
    /// Frame payload, `0..=64` bytes.
    pub data: Vec<u8>,
    /// 29-bit arbitration ID in use.
    pub is_extended_id: bool,
    /// CAN-FD frame (up to 64 data bytes, BRS-capable).
    pub is_fd: bool,
    /// Bit rate switch flag (CAN-FD only).
    pub bitrate_switch: bool,
}

impl CanMessage {
    /// Builds a new classical-CAN message, validating the dlc/data
    /// invariant described above.
    pub fn new(arbitration_id: u32, data: Vec<u8>, is_extended_id: bool) -> Self {
        debug_assert!(data.len() <= 8, "classical CAN data must be <= 8 bytes");
        Self {
            arbitration_id,
            dlc: data.len() as u8,
            data,
            is_extended_id,
            is_fd: false,
            bitrate_switch: false,
        }
    }

    /// Builds a new CAN-FD message.
    pub fn new_fd(
        arbitration_id: u32,
        data: Vec<u8>,
        is_extended_id: bool,
        bitrate_switch: bool,
    ) -> Self {
        debug_assert!(data.len() <= 64, "CAN-FD data must be <= 64 bytes");
        Self {
            arbitration_id,
            dlc: data.len() as u8,
            data,
            is_extended_id,
            is_fd: true,
            bitrate_switch,
        }
    }

    /// Smallest legal frame size (classical: any size 0..=8; FD: the next
    /// entry in [`FD_DATA_LENGTHS`]) that can hold `needed` bytes, honoring
    /// an optional minimum.
    pub fn fitting_size(needed: usize, is_fd: bool, min: Option<u8>) -> u8 {
        let min = min.unwrap_or(0) as usize;
        let needed = needed.max(min);
        if !is_fd {
            return needed.min(8) as u8;
        }
        for candidate in FD_DATA_LENGTHS {
            if (candidate as usize) >= needed {
                return candidate;
            }
        }
        *FD_DATA_LENGTHS.last().unwrap()
    }
}

impl fmt::Debug for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanMessage")
            .field("arbitration_id", &format_args!("{:#x}", self.arbitration_id))
            .field("dlc", &self.dlc)
            .field("data", &format_args!("{:02x?}", self.data))
            .field("is_extended_id", &self.is_extended_id)
            .field("is_fd", &self.is_fd)
            .field("bitrate_switch", &self.bitrate_switch)
            .finish()
    }
}

impl fmt::Display for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}  [{}]", self.arbitration_id, self.dlc)?;
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fitting_size_classical() {
        assert_eq!(CanMessage::fitting_size(3, false, None), 3);
        assert_eq!(CanMessage::fitting_size(3, false, Some(8)), 8);
    }

    #[test]
    fn fitting_size_fd_rounds_up() {
        assert_eq!(CanMessage::fitting_size(9, true, None), 12);
        assert_eq!(CanMessage::fitting_size(8, true, None), 8);
        assert_eq!(CanMessage::fitting_size(64, true, None), 64);
    }
}
