// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Raw `libc` re-exports for native Linux SocketCAN. `socket.rs` builds
//! the `CAN_ISOTP` option marshalling on top of these rather than
//! redefining the kernel's struct layout itself.

pub use libc::{
    can_frame, canfd_frame, canxl_frame, can_filter, sockaddr_can, canid_t, can_err_mask_t,
    CAN_EFF_FLAG, CAN_RTR_FLAG, CAN_ERR_FLAG, CAN_SFF_MASK, CAN_EFF_MASK, CAN_ERR_MASK,
    CAN_MAX_DLC, CAN_MAX_DLEN, CANFD_MAX_DLC, CANFD_MAX_DLEN, CANFD_BRS, CANFD_ESI, CANFD_FDF,
    CAN_MTU, CANFD_MTU, CAN_RAW, CAN_BCM, CAN_TP16, CAN_TP20, CAN_MCNET, CAN_ISOTP, CAN_J1939,
    CAN_NPROTO, AF_CAN, PF_CAN, SOL_CAN_BASE, SOL_CAN_RAW, CAN_RAW_FILTER, CAN_RAW_ERR_FILTER,
    CAN_RAW_LOOPBACK, CAN_RAW_RECV_OWN_MSGS, CAN_RAW_FD_FRAMES, CAN_RAW_JOIN_FILTERS,
    CAN_RAW_FILTER_MAX, CAN_INV_FILTER, c_int, c_void, socklen_t,
};

/// Wrapper over `setsockopt`, kept in the per-OS compatibility module so
/// `socket.rs` never calls into `libc` directly, keeping
/// platform-conditional unsafe calls in one place.
pub(crate) unsafe fn setsockopt_wrapper(
    socket: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    option_len: socklen_t,
) -> c_int {
    unsafe { libc::setsockopt(socket, level, name, value, option_len) }
}
