// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The kernel-resident ISO-TP socket collaborator: a thin binding to
//! Linux's `CAN_ISOTP` `SOCK_DGRAM` socket.
//!
//! The kernel module runs its own copy of the ISO-15765-2 state machine,
//! so — unlike [`crate::worker::WorkerHandle`] — [`IsoTpSocket`] never
//! touches [`crate::state::RxStateMachine`]/[`crate::state::TxStateMachine`].
//! `read`/`write` here exchange whole reassembled payloads, not individual
//! CAN frames; this module's entire job is marshalling [`Params`]/
//! [`AsymmetricAddress`] into the three kernel option structs
//! (`struct can_isotp_options`, `struct can_isotp_fc_options`,
//! `struct can_isotp_ll_options` from `linux/can/isotp.h`) and binding the
//! socket to the right arbitration ids.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use bitflags::bitflags;
use socket2::{Domain, Protocol, Socket as Socket2, Type};

use crate::addressing::{AsymmetricAddress, TargetAddressType};
use crate::compatibility::{self, canid_t, sockaddr_can, AF_CAN, CAN_EFF_FLAG, CAN_ISOTP, SOL_CAN_BASE};
use crate::error::IsoTpError;
use crate::params::Params;

/// Generous upper bound on a reassembled payload read in one `recv`; the
/// kernel never hands back more than `max_frame_size` bytes (default
/// 4095), but CAN-FD-capable builds can raise that, so this pads well
/// above the common case rather than matching it exactly.
const MAX_PAYLOAD: usize = 1 << 16;

const CAN_ISOTP_OPTS: libc::c_int = 1;
const CAN_ISOTP_RECV_FC: libc::c_int = 2;
const CAN_ISOTP_LL_OPTS: libc::c_int = 5;

const CAN_MTU: u8 = 16;
const CANFD_MTU: u8 = 72;
const CANFD_BRS: u8 = 0x01;

bitflags! {
    /// `can_isotp_options.flags` (`linux/can/isotp.h`). Only the bits this
    /// crate ever needs to set are named; the rest of the kernel's flag
    /// space is left at zero.
    #[derive(Clone, Copy, Debug, Default)]
    struct IsoTpFlags: u32 {
        const LISTEN_MODE = 0x001;
        const EXTEND_ADDR  = 0x002;
        const TX_PADDING   = 0x004;
        const RX_PADDING   = 0x008;
        const RX_EXT_ADDR  = 0x200;
    }
}

/// Mirrors `struct can_isotp_options`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CanIsotpOptions {
    flags: u32,
    frame_txtime: u32,
    ext_address: u8,
    txpad_content: u8,
    rxpad_content: u8,
    rx_ext_address: u8,
}

/// Mirrors `struct can_isotp_fc_options`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CanIsotpFcOptions {
    bs: u8,
    stmin: u8,
    wftmax: u8,
}

/// Mirrors `struct can_isotp_ll_options`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CanIsotpLlOptions {
    mtu: u8,
    tx_dl: u8,
    tx_flags: u8,
}

fn ifindex(interface: &str) -> Result<libc::c_uint, IsoTpError> {
    nix::net::if_::if_nametoindex(interface)
        .map_err(|e| IsoTpError::Io(io::Error::new(io::ErrorKind::Other, e)))
}

fn options_from_params(address: &AsymmetricAddress, params: &Params) -> (CanIsotpOptions, CanIsotpFcOptions, CanIsotpLlOptions) {
    let mut flags = IsoTpFlags::empty();
    if params.listen_mode() {
        flags |= IsoTpFlags::LISTEN_MODE;
    }
    let ext_address = address.tx_payload_prefix().unwrap_or(0);
    if address.tx_payload_prefix().is_some() {
        flags |= IsoTpFlags::EXTEND_ADDR | IsoTpFlags::RX_EXT_ADDR;
    }
    let pad_byte = params.tx_padding();
    if pad_byte.is_some() {
        flags |= IsoTpFlags::TX_PADDING | IsoTpFlags::RX_PADDING;
    }

    let opts = CanIsotpOptions {
        flags: flags.bits(),
        frame_txtime: 0,
        ext_address,
        txpad_content: pad_byte.unwrap_or(0xCC),
        rxpad_content: pad_byte.unwrap_or(0xCC),
        rx_ext_address: ext_address,
    };
    let fc = CanIsotpFcOptions { bs: params.blocksize(), stmin: params.stmin(), wftmax: params.wftmax() };
    let ll = CanIsotpLlOptions {
        mtu: if params.can_fd() { CANFD_MTU } else { CAN_MTU },
        tx_dl: params.tx_data_length(),
        tx_flags: if params.bitrate_switch() { CANFD_BRS } else { 0 },
    };
    (opts, fc, ll)
}

/// A bound, configured `CAN_ISOTP` socket. The kernel performs
/// segmentation, reassembly, flow control and timing itself; this type
/// only marshals configuration and moves whole payloads.
pub struct IsoTpSocket {
    inner: Socket2,
}

impl IsoTpSocket {
    /// Open, configure and bind a `CAN_ISOTP` socket on `interface`
    /// (e.g. `"can0"`) using `address` and `params`. `address` must have
    /// both a tx and an rx arbitration id configured for the physical
    /// direction — the kernel socket is always point-to-point.
    pub fn open(interface: &str, address: &AsymmetricAddress, params: &Params) -> Result<Self, IsoTpError> {
        address.validate()?;
        params.validate()?;

        let tx_id = address.tx_arbitration_id(TargetAddressType::Physical)?;
        let rx_id = address.rx_arbitration_id_physical().ok_or_else(|| {
            IsoTpError::InvalidArgument("address has no physical rx arbitration id configured".into())
        })?;
        let is_extended = address.tx.is_29bit();
        let index = ifindex(interface)?;

        let socket = Socket2::new(Domain::from(AF_CAN), Type::DGRAM, Some(Protocol::from(CAN_ISOTP)))
            .map_err(IsoTpError::Io)?;
        let bound = Self { inner: socket };
        bound.apply_options(address, params)?;
        bound.bind(index as libc::c_int, rx_id, tx_id, is_extended)?;
        Ok(bound)
    }

    fn bind(&self, ifindex: libc::c_int, rx_id: u32, tx_id: u32, is_extended: bool) -> Result<(), IsoTpError> {
        let flag = if is_extended { CAN_EFF_FLAG } else { 0 };
        let mut addr: sockaddr_can = unsafe { std::mem::zeroed() };
        addr.can_family = AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex;
        unsafe {
            addr.can_addr.tp.rx_id = (rx_id as canid_t) | flag;
            addr.can_addr.tp.tx_id = (tx_id as canid_t) | flag;
        }

        let ret = unsafe {
            libc::bind(
                self.inner.as_raw_fd(),
                &addr as *const sockaddr_can as *const libc::sockaddr,
                std::mem::size_of::<sockaddr_can>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(IsoTpError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn apply_options(&self, address: &AsymmetricAddress, params: &Params) -> Result<(), IsoTpError> {
        let (opts, fc, ll) = options_from_params(address, params);
        self.set_option(CAN_ISOTP_OPTS, &opts)?;
        self.set_option(CAN_ISOTP_RECV_FC, &fc)?;
        self.set_option(CAN_ISOTP_LL_OPTS, &ll)?;
        Ok(())
    }

    fn set_option<T>(&self, name: libc::c_int, value: &T) -> Result<(), IsoTpError> {
        let ret = unsafe {
            compatibility::setsockopt_wrapper(
                self.inner.as_raw_fd(),
                SOL_CAN_BASE + CAN_ISOTP,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(IsoTpError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Queue a complete payload. The kernel segments it into First/
    /// Consecutive frames and drives the flow-control handshake itself.
    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(payload)
    }

    /// Block up to `timeout` for one fully reassembled payload.
    /// `Ok(None)` on timeout, matching [`crate::worker::LinkRead`]'s
    /// convention even though this type does not implement that trait.
    pub fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        self.inner.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; MAX_PAYLOAD];
        match self.inner.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::Address;

    #[test]
    fn options_reflect_listen_mode_and_padding() {
        let addr = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x456, rxid: 0x123 });
        let mut params = Params::default();
        params.set_listen_mode(true).unwrap();
        params.set_tx_padding(Some(0xAA)).unwrap();
        let (opts, _fc, _ll) = options_from_params(&addr, &params);
        let flags = IsoTpFlags::from_bits_truncate(opts.flags);
        assert!(flags.contains(IsoTpFlags::LISTEN_MODE));
        assert!(flags.contains(IsoTpFlags::TX_PADDING));
        assert_eq!(opts.txpad_content, 0xAA);
    }

    #[test]
    fn extended_address_sets_ext_addr_flag_and_byte() {
        let addr = AsymmetricAddress::symmetric(Address::Extended11 {
            txid: 0x456,
            rxid: 0x123,
            target_address: 0xF1,
        });
        let (opts, _fc, _ll) = options_from_params(&addr, &Params::default());
        let flags = IsoTpFlags::from_bits_truncate(opts.flags);
        assert!(flags.contains(IsoTpFlags::EXTEND_ADDR));
        assert_eq!(opts.ext_address, 0xF1);
    }
}
