// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Error taxonomy for the ISO-TP transport core.
//!
//! Protocol and timing errors are raised inside the worker thread, caught
//! there, logged, and dispatched to a user-supplied error handler — they
//! never unwind across the worker boundary. Configuration errors and the
//! blocking-send family are the only variants that are ever returned
//! directly to a caller.

use std::io;
use thiserror::Error;

/// Errors produced anywhere in the ISO-TP transport core.
#[derive(Error, Debug)]
pub enum IsoTpError {
    // ---- Timing -------------------------------------------------------
    /// N_Bs expired: no FlowControl arrived while the Tx machine was
    /// waiting for one.
    #[error("flow control timeout (N_Bs) waiting for FC after First Frame")]
    FlowControlTimeout,

    /// N_Cr expired: no ConsecutiveFrame arrived while the Rx machine was
    /// waiting for one.
    #[error("consecutive frame timeout (N_Cr) while reassembling")]
    ConsecutiveFrameTimeout,

    // ---- Protocol violation --------------------------------------------
    /// The CAN data field could not be parsed as any known PDU.
    #[error("invalid CAN data: {0}")]
    InvalidCanData(String),

    /// A FlowControl frame arrived that did not fit the expected shape.
    #[error("unexpected or malformed flow control frame")]
    UnexpectedFlowControl,

    /// A ConsecutiveFrame arrived while the Rx machine was IDLE.
    #[error("unexpected consecutive frame while idle")]
    UnexpectedConsecutiveFrame,

    /// A SingleFrame interrupted an in-progress multi-frame reception.
    #[error("reception interrupted by a single frame")]
    ReceptionInterruptedWithSingleFrame,

    /// A FirstFrame interrupted an in-progress multi-frame reception.
    #[error("reception interrupted by a new first frame")]
    ReceptionInterruptedWithFirstFrame,

    /// A ConsecutiveFrame arrived with the wrong sequence number.
    #[error("wrong sequence number: expected {expected}, got {got}")]
    WrongSequenceNumber {
        /// Sequence number the Rx machine expected.
        expected: u8,
        /// Sequence number actually seen on the wire.
        got: u8,
    },

    /// A sender transmitted more Wait frames than `wftmax` allows.
    #[error("peer is not configured to accept wait frames")]
    UnsupportedWaitFrame,

    /// The Tx machine received more FC(Wait) than `wftmax` permits.
    #[error("maximum number of wait frames reached")]
    MaximumWaitFrameReached,

    /// A 32-bit escape length was implied but the required escape bytes
    /// were absent.
    #[error("missing escape sequence in first/single frame")]
    MissingEscapeSequence,

    /// A ConsecutiveFrame changed the data-field width established by the
    /// first frame of the reassembly.
    #[error("CAN frame data length changed mid-reassembly (RXDL invariant violated)")]
    ChangingInvalidRXDL,

    /// A CAN-FD First Frame used the 32-bit escape form with an RXDL that
    /// cannot hold the declared payload.
    #[error("invalid CAN-FD first frame RXDL for declared length")]
    InvalidCanFdFirstFrameRXDL,

    // ---- Resource -------------------------------------------------------
    /// A First Frame declared a length exceeding `max_frame_size`.
    #[error("frame too long: declared {declared} bytes, max is {max}")]
    FrameTooLong {
        /// Length declared in the offending First Frame.
        declared: u32,
        /// Configured `max_frame_size`.
        max: u32,
    },

    /// The peer signaled FlowStatus::Overflow.
    #[error("peer signaled overflow, aborting transmission")]
    Overflow,

    /// A user-supplied byte producer failed while the Tx machine pulled
    /// more data from it.
    #[error("byte producer failed: {0}")]
    BadGenerator(String),

    // ---- Synchronous failures (raised to the caller, not dispatched) ---
    /// `send(..)` was called with `blocking_send` enabled and the
    /// transmission did not reach IDLE successfully.
    #[error("blocking send failed: {0}")]
    BlockingSendFailure(String),

    /// Specialization of [`IsoTpError::BlockingSendFailure`] for the
    /// timeout case.
    #[error("blocking send timed out after {0:?}")]
    BlockingSendTimeout(std::time::Duration),

    // ---- Configuration / argument errors (raised at call time) ---------
    /// A `Params` field was set to a value the protocol forbids.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An `Address` could not be constructed or used for the requested
    /// direction (e.g. functional send on a multi-frame payload).
    #[error("invalid address or argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O failure, e.g. from the `txfn`/`rxfn` callables or
    /// the kernel socket binding.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type IsoTpResult<T> = Result<T, IsoTpError>;
