// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Flat, validated configuration. Every field has a documented
//! default; setters validate individually so a caller
//! gets an `IsoTpError::InvalidConfig` at the point of the mistake
//! rather than deep inside the worker.

use std::time::Duration;

use crate::addressing::TargetAddressType;
use crate::error::IsoTpError;
use crate::frame::FD_DATA_LENGTHS;

/// Validated configuration snapshot, cloned by the worker on every tick
/// ("Params are snapshot-copied on each worker tick
/// to avoid torn reads").
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    stmin: u8,
    blocksize: u8,
    tx_data_length: u8,
    tx_data_min_length: Option<u8>,
    override_receiver_stmin: Option<u8>,
    rx_flowcontrol_timeout: Duration,
    rx_consecutive_frame_timeout: Duration,
    tx_padding: Option<u8>,
    wftmax: u8,
    max_frame_size: u32,
    can_fd: bool,
    bitrate_switch: bool,
    default_target_address_type: TargetAddressType,
    rate_limit_enable: bool,
    rate_limit_max_bitrate: u64,
    rate_limit_window_size: Duration,
    listen_mode: bool,
    blocking_send: bool,
    logger_name: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            stmin: 0,
            blocksize: 8,
            tx_data_length: 8,
            tx_data_min_length: None,
            override_receiver_stmin: None,
            rx_flowcontrol_timeout: Duration::from_millis(1000),
            rx_consecutive_frame_timeout: Duration::from_millis(1000),
            tx_padding: None,
            wftmax: 0,
            max_frame_size: 4095,
            can_fd: false,
            bitrate_switch: false,
            default_target_address_type: TargetAddressType::Physical,
            rate_limit_enable: false,
            rate_limit_max_bitrate: 10_000_000,
            rate_limit_window_size: Duration::from_millis(200),
            listen_mode: false,
            blocking_send: false,
            logger_name: "isotp".to_string(),
        }
    }
}

macro_rules! getter {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self) -> $ty {
            self.$name
        }
    };
}

impl Params {
    getter!(stmin, u8);
    getter!(blocksize, u8);
    getter!(tx_data_length, u8);
    getter!(tx_data_min_length, Option<u8>);
    getter!(override_receiver_stmin, Option<u8>);
    getter!(rx_flowcontrol_timeout, Duration);
    getter!(rx_consecutive_frame_timeout, Duration);
    getter!(tx_padding, Option<u8>);
    getter!(wftmax, u8);
    getter!(max_frame_size, u32);
    getter!(can_fd, bool);
    getter!(bitrate_switch, bool);
    getter!(default_target_address_type, TargetAddressType);
    getter!(rate_limit_enable, bool);
    getter!(rate_limit_max_bitrate, u64);
    getter!(rate_limit_window_size, Duration);
    getter!(listen_mode, bool);
    getter!(blocking_send, bool);

    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    pub fn set_stmin(&mut self, stmin: u8) -> Result<(), IsoTpError> {
        self.stmin = stmin;
        Ok(())
    }

    pub fn set_blocksize(&mut self, blocksize: u8) -> Result<(), IsoTpError> {
        self.blocksize = blocksize;
        Ok(())
    }

    pub fn set_tx_data_length(&mut self, len: u8) -> Result<(), IsoTpError> {
        if len != 8 && !FD_DATA_LENGTHS.contains(&len) {
            return Err(IsoTpError::InvalidConfig(format!(
                "tx_data_length must be one of {{8,12,16,20,24,32,48,64}}, got {len}"
            )));
        }
        self.tx_data_length = len;
        Ok(())
    }

    pub fn set_tx_data_min_length(&mut self, len: Option<u8>) -> Result<(), IsoTpError> {
        if let Some(len) = len {
            if len > self.tx_data_length {
                return Err(IsoTpError::InvalidConfig(
                    "tx_data_min_length cannot exceed tx_data_length".into(),
                ));
            }
        }
        self.tx_data_min_length = len;
        Ok(())
    }

    pub fn set_override_receiver_stmin(&mut self, stmin: Option<u8>) -> Result<(), IsoTpError> {
        self.override_receiver_stmin = stmin;
        Ok(())
    }

    pub fn set_rx_flowcontrol_timeout(&mut self, timeout: Duration) -> Result<(), IsoTpError> {
        if timeout.is_zero() {
            return Err(IsoTpError::InvalidConfig(
                "rx_flowcontrol_timeout must be > 0".into(),
            ));
        }
        self.rx_flowcontrol_timeout = timeout;
        Ok(())
    }

    pub fn set_rx_consecutive_frame_timeout(&mut self, timeout: Duration) -> Result<(), IsoTpError> {
        if timeout.is_zero() {
            return Err(IsoTpError::InvalidConfig(
                "rx_consecutive_frame_timeout must be > 0".into(),
            ));
        }
        self.rx_consecutive_frame_timeout = timeout;
        Ok(())
    }

    pub fn set_tx_padding(&mut self, padding: Option<u8>) -> Result<(), IsoTpError> {
        self.tx_padding = padding;
        Ok(())
    }

    pub fn set_wftmax(&mut self, wftmax: u8) -> Result<(), IsoTpError> {
        self.wftmax = wftmax;
        Ok(())
    }

    pub fn set_max_frame_size(&mut self, size: u32) -> Result<(), IsoTpError> {
        if size == 0 {
            return Err(IsoTpError::InvalidConfig("max_frame_size must be > 0".into()));
        }
        self.max_frame_size = size;
        Ok(())
    }

    pub fn set_can_fd(&mut self, can_fd: bool) -> Result<(), IsoTpError> {
        self.can_fd = can_fd;
        if !can_fd && !FD_DATA_LENGTHS[..1].contains(&self.tx_data_length) {
            // classical CAN can only use 8-byte frames; clamp.
            self.tx_data_length = 8;
        }
        Ok(())
    }

    pub fn set_bitrate_switch(&mut self, brs: bool) -> Result<(), IsoTpError> {
        if brs && !self.can_fd {
            return Err(IsoTpError::InvalidConfig(
                "bitrate_switch requires can_fd to be enabled".into(),
            ));
        }
        self.bitrate_switch = brs;
        Ok(())
    }

    pub fn set_default_target_address_type(&mut self, t: TargetAddressType) -> Result<(), IsoTpError> {
        self.default_target_address_type = t;
        Ok(())
    }

    pub fn set_rate_limit_enable(&mut self, enable: bool) -> Result<(), IsoTpError> {
        self.rate_limit_enable = enable;
        Ok(())
    }

    pub fn set_rate_limit_max_bitrate(&mut self, bitrate: u64) -> Result<(), IsoTpError> {
        if bitrate == 0 {
            return Err(IsoTpError::InvalidConfig(
                "rate_limit_max_bitrate must be > 0".into(),
            ));
        }
        self.rate_limit_max_bitrate = bitrate;
        Ok(())
    }

    pub fn set_rate_limit_window_size(&mut self, window: Duration) -> Result<(), IsoTpError> {
        if window.is_zero() {
            return Err(IsoTpError::InvalidConfig(
                "rate_limit_window_size must be > 0".into(),
            ));
        }
        self.rate_limit_window_size = window;
        Ok(())
    }

    pub fn set_listen_mode(&mut self, listen: bool) -> Result<(), IsoTpError> {
        self.listen_mode = listen;
        Ok(())
    }

    pub fn set_blocking_send(&mut self, blocking: bool) -> Result<(), IsoTpError> {
        self.blocking_send = blocking;
        Ok(())
    }

    pub fn set_logger_name(&mut self, name: impl Into<String>) -> Result<(), IsoTpError> {
        self.logger_name = name.into();
        Ok(())
    }

    /// Re-run every individual invariant. Useful after building a
    /// `Params` via `..Default::default()` struct update syntax, where
    /// the per-field setters were bypassed.
    pub fn validate(&self) -> Result<(), IsoTpError> {
        let mut probe = Params::default();
        probe.set_tx_data_length(self.tx_data_length)?;
        probe.set_tx_data_min_length(self.tx_data_min_length)?;
        probe.set_rx_flowcontrol_timeout(self.rx_flowcontrol_timeout)?;
        probe.set_rx_consecutive_frame_timeout(self.rx_consecutive_frame_timeout)?;
        probe.set_max_frame_size(self.max_frame_size)?;
        probe.set_rate_limit_max_bitrate(self.rate_limit_max_bitrate)?;
        probe.set_rate_limit_window_size(self.rate_limit_window_size)?;
        if self.bitrate_switch && !self.can_fd {
            return Err(IsoTpError::InvalidConfig(
                "bitrate_switch requires can_fd to be enabled".into(),
            ));
        }
        Ok(())
    }
}
