// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! A user-space implementation of the ISO-15765-2 (ISO-TP) transport
//! protocol over CAN/CAN-FD: segmentation, reassembly, flow control and
//! the associated timing, driven by a link layer the caller supplies as
//! a pair of blocking send/receive callables.
//!
//! The core state machines ([`state::RxStateMachine`],
//! [`state::TxStateMachine`]) never touch a socket directly — they are
//! fed frames and clock ticks and return what to send next. [`worker`]
//! wires them to a real thread pair, and [`transport::Transport`] is the
//! handle most callers want. On Linux, [`socket::IsoTpSocket`] offers an
//! alternative path through the kernel's own `CAN_ISOTP` socket, which
//! bypasses this crate's state machines entirely.

pub mod addressing;
pub mod error;
pub mod frame;
pub mod params;
pub mod pdu;
pub mod ratelimiter;
pub mod state;
pub mod transport;
pub mod worker;

mod compatibility;

#[cfg(all(target_os = "linux", feature = "linux"))]
pub mod socket;

pub use addressing::{Address, AsymmetricAddress, TargetAddressType};
pub use error::{IsoTpError, IsoTpResult};
pub use frame::CanMessage;
pub use params::Params;
pub use pdu::{FlowStatus, Pdu, SeparationTime};
pub use transport::Transport;
pub use worker::{LinkRead, LinkWrite};
