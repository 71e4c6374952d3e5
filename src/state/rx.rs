// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The reassembly state machine: IDLE / WAIT_CF, driven one
//! inbound PDU at a time plus a periodic timeout check for N_Cr.

use std::time::Instant;

use crate::error::IsoTpError;
use crate::params::Params;
use crate::pdu::{FlowStatus, Pdu, SeparationTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitCf,
}

/// What the worker should do after feeding one inbound PDU (or one
/// timeout check) to the Rx machine. More than one field can be set at
/// once: e.g. a First Frame interrupting a reassembly in progress both
/// reports an error for the abandoned transfer and starts a new one.
#[derive(Debug, Default)]
pub struct RxStep {
    /// A FlowControl the caller should send back to the peer.
    pub send: Option<Pdu>,
    /// A fully reassembled payload ready for delivery to the receive
    /// queue.
    pub delivered: Option<Vec<u8>>,
    /// Errors observed while processing this PDU, oldest first.
    pub errors: Vec<IsoTpError>,
}

impl RxStep {
    fn with_error(error: IsoTpError) -> Self {
        Self { errors: vec![error], ..Default::default() }
    }
}

/// Reassembles inbound Single/First/Consecutive frames into complete
/// payloads and decides when a FlowControl reply is owed.
pub struct RxStateMachine {
    state: State,
    buffer: Vec<u8>,
    declared_length: usize,
    last_seqnum: u8,
    block_counter: u8,
    actual_rxdl: Option<usize>,
    cf_deadline: Option<Instant>,
    listen_mode: bool,
}

impl RxStateMachine {
    pub fn new(listen_mode: bool) -> Self {
        Self {
            state: State::Idle,
            buffer: Vec::new(),
            declared_length: 0,
            last_seqnum: 0,
            block_counter: 0,
            actual_rxdl: None,
            cf_deadline: None,
            listen_mode,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Abandon any in-progress reassembly, discarding buffered bytes.
    pub fn stop_receiving(&mut self) {
        self.reset_to_idle();
    }

    fn reset_to_idle(&mut self) {
        self.state = State::Idle;
        self.buffer.clear();
        self.declared_length = 0;
        self.last_seqnum = 0;
        self.block_counter = 0;
        self.actual_rxdl = None;
        self.cf_deadline = None;
    }

    /// Feed one PDU decoded from a frame that has already passed
    /// `Address::is_for_me`. `frame_len` is the full CAN data field
    /// length (used for the RXDL invariant).
    pub fn on_frame(&mut self, pdu: Pdu, frame_len: usize, now: Instant, params: &Params) -> RxStep {
        match pdu {
            Pdu::SingleFrame { data } => self.on_single_frame(data),
            Pdu::FirstFrame { length, data } => self.on_first_frame(length, data, frame_len, now, params),
            Pdu::ConsecutiveFrame { sequence_number, data } => {
                self.on_consecutive_frame(sequence_number, data, frame_len, now, params)
            }
            Pdu::FlowControl { .. } => RxStep::default(),
        }
    }

    fn on_single_frame(&mut self, data: Vec<u8>) -> RxStep {
        let mut step = RxStep::default();
        if self.state == State::WaitCf {
            step.errors.push(IsoTpError::ReceptionInterruptedWithSingleFrame);
        }
        self.reset_to_idle();
        step.delivered = Some(data);
        step
    }

    fn on_first_frame(
        &mut self,
        length: u32,
        data: Vec<u8>,
        frame_len: usize,
        now: Instant,
        params: &Params,
    ) -> RxStep {
        let mut step = RxStep::default();
        if self.state == State::WaitCf {
            step.errors.push(IsoTpError::ReceptionInterruptedWithFirstFrame);
        }

        if length > params.max_frame_size() {
            step.send = Some(Pdu::FlowControl {
                flow_status: FlowStatus::Overflow,
                block_size: 0,
                stmin: SeparationTime::zero(),
            });
            step.errors.push(IsoTpError::FrameTooLong { declared: length, max: params.max_frame_size() });
            self.reset_to_idle();
            return step;
        }

        if length > 0xFFF && frame_len < 8 {
            step.errors.push(IsoTpError::InvalidCanFdFirstFrameRXDL);
            self.reset_to_idle();
            return step;
        }

        self.buffer = data;
        self.declared_length = length as usize;
        self.last_seqnum = 0;
        self.block_counter = 0;
        self.actual_rxdl = Some(frame_len);
        self.cf_deadline = Some(now + params.rx_consecutive_frame_timeout());
        self.state = State::WaitCf;

        if self.buffer.len() >= self.declared_length {
            step.delivered = Some(std::mem::take(&mut self.buffer));
            self.reset_to_idle();
        } else if !self.listen_mode {
            step.send = Some(Pdu::FlowControl {
                flow_status: FlowStatus::Continue,
                block_size: params.blocksize(),
                stmin: SeparationTime::from_wire(params.stmin()),
            });
        }
        step
    }

    fn on_consecutive_frame(
        &mut self,
        sequence_number: u8,
        data: Vec<u8>,
        frame_len: usize,
        now: Instant,
        params: &Params,
    ) -> RxStep {
        if self.state != State::WaitCf {
            return RxStep::with_error(IsoTpError::UnexpectedConsecutiveFrame);
        }

        if let Some(rxdl) = self.actual_rxdl {
            if frame_len != rxdl {
                self.reset_to_idle();
                return RxStep::with_error(IsoTpError::ChangingInvalidRXDL);
            }
        }

        let expected = (self.last_seqnum + 1) & 0x0F;
        if sequence_number != expected {
            self.reset_to_idle();
            return RxStep::with_error(IsoTpError::WrongSequenceNumber { expected, got: sequence_number });
        }

        let mut step = RxStep::default();
        let remaining = self.declared_length - self.buffer.len();
        let take = remaining.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.last_seqnum = sequence_number;
        self.block_counter += 1;
        self.cf_deadline = Some(now + params.rx_consecutive_frame_timeout());

        if self.buffer.len() >= self.declared_length {
            step.delivered = Some(std::mem::take(&mut self.buffer));
            self.reset_to_idle();
        } else if params.blocksize() != 0 && self.block_counter == params.blocksize() {
            self.block_counter = 0;
            if !self.listen_mode {
                step.send = Some(Pdu::FlowControl {
                    flow_status: FlowStatus::Continue,
                    block_size: params.blocksize(),
                    stmin: SeparationTime::from_wire(params.stmin()),
                });
            }
        }
        step
    }

    /// Called once per worker tick regardless of whether a frame arrived,
    /// to enforce N_Cr.
    pub fn check_timeout(&mut self, now: Instant) -> Option<IsoTpError> {
        if self.state != State::WaitCf {
            return None;
        }
        let deadline = self.cf_deadline?;
        if now >= deadline {
            self.reset_to_idle();
            Some(IsoTpError::ConsecutiveFrameTimeout)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> Params {
        Params::default()
    }

    #[test]
    fn single_frame_delivers_immediately() {
        let mut rx = RxStateMachine::new(false);
        let step = rx.on_frame(Pdu::SingleFrame { data: vec![1, 2, 3] }, 4, Instant::now(), &params());
        assert_eq!(step.delivered, Some(vec![1, 2, 3]));
        assert!(step.errors.is_empty());
        assert!(rx.is_idle());
    }

    #[test]
    fn first_frame_emits_flow_control_and_waits() {
        let mut rx = RxStateMachine::new(false);
        let now = Instant::now();
        let step = rx.on_frame(Pdu::FirstFrame { length: 10, data: vec![0; 6] }, 8, now, &params());
        assert!(step.delivered.is_none());
        assert!(matches!(step.send, Some(Pdu::FlowControl { flow_status: FlowStatus::Continue, .. })));
        assert!(!rx.is_idle());
    }

    #[test]
    fn full_reassembly_round_trip() {
        let mut rx = RxStateMachine::new(false);
        let now = Instant::now();
        rx.on_frame(Pdu::FirstFrame { length: 10, data: vec![1, 2, 3, 4, 5, 6] }, 8, now, &params());
        let step = rx.on_frame(
            Pdu::ConsecutiveFrame { sequence_number: 1, data: vec![7, 8, 9, 10] },
            8,
            now,
            &params(),
        );
        assert_eq!(step.delivered, Some((1..=10).collect::<Vec<u8>>()));
        assert!(rx.is_idle());
    }

    #[test]
    fn wrong_sequence_number_aborts() {
        let mut rx = RxStateMachine::new(false);
        let now = Instant::now();
        rx.on_frame(Pdu::FirstFrame { length: 10, data: vec![0; 6] }, 8, now, &params());
        let step = rx.on_frame(
            Pdu::ConsecutiveFrame { sequence_number: 5, data: vec![0; 4] },
            8,
            now,
            &params(),
        );
        assert!(matches!(step.errors.as_slice(), [IsoTpError::WrongSequenceNumber { expected: 1, got: 5 }]));
        assert!(rx.is_idle());
    }

    #[test]
    fn consecutive_frame_timeout_fires_after_deadline() {
        let mut rx = RxStateMachine::new(false);
        let now = Instant::now();
        rx.on_frame(Pdu::FirstFrame { length: 10, data: vec![0; 6] }, 8, now, &params());
        assert!(rx.check_timeout(now).is_none());
        let later = now + Duration::from_millis(1001);
        assert!(matches!(rx.check_timeout(later), Some(IsoTpError::ConsecutiveFrameTimeout)));
        assert!(rx.is_idle());
    }

    #[test]
    fn changing_rxdl_mid_reassembly_errors() {
        let mut rx = RxStateMachine::new(false);
        let now = Instant::now();
        rx.on_frame(Pdu::FirstFrame { length: 20, data: vec![0; 6] }, 8, now, &params());
        let step = rx.on_frame(
            Pdu::ConsecutiveFrame { sequence_number: 1, data: vec![0; 10] },
            16,
            now,
            &params(),
        );
        assert!(matches!(step.errors.as_slice(), [IsoTpError::ChangingInvalidRXDL]));
        assert!(rx.is_idle());
    }

    #[test]
    fn oversized_first_frame_signals_overflow() {
        let mut rx = RxStateMachine::new(false);
        let mut p = params();
        p.set_max_frame_size(100).unwrap();
        let step = rx.on_frame(Pdu::FirstFrame { length: 5000, data: vec![0; 6] }, 8, Instant::now(), &p);
        assert!(matches!(step.send, Some(Pdu::FlowControl { flow_status: FlowStatus::Overflow, .. })));
        assert!(matches!(step.errors.as_slice(), [IsoTpError::FrameTooLong { .. }]));
    }

    #[test]
    fn listen_mode_never_sends_flow_control() {
        let mut rx = RxStateMachine::new(true);
        let step = rx.on_frame(Pdu::FirstFrame { length: 10, data: vec![0; 6] }, 8, Instant::now(), &params());
        assert!(step.send.is_none());
    }
}
