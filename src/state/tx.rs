// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The segmentation state machine: IDLE / WAIT_FC /
//! TRANSMIT_CF, driven by worker ticks and inbound FlowControl PDUs.
//!
//! Payload bytes are pulled lazily through a [`ByteSource`] rather than
//! held in one contiguous buffer, so a caller can stream a payload whose
//! full length is known up front without necessarily holding it all in
//! memory at once.

use std::time::Instant;

use crate::addressing::TargetAddressType;
use crate::error::IsoTpError;
use crate::params::Params;
use crate::pdu::{FlowStatus, Pdu, SeparationTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitFc,
    TransmitCf,
}

/// Supplies payload bytes to the Tx machine on demand.
pub trait ByteSource: Send {
    /// Pull up to `max` more bytes. Returning fewer than `max` bytes is
    /// only legal once the source is exhausted; any later call must
    /// return an empty vec.
    fn pull(&mut self, max: usize) -> Result<Vec<u8>, IsoTpError>;
}

/// The common case: the whole payload is already in memory.
pub struct SliceSource {
    data: Vec<u8>,
    pos: usize,
}

impl SliceSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for SliceSource {
    fn pull(&mut self, max: usize) -> Result<Vec<u8>, IsoTpError> {
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }
}

/// A payload handed to [`TxStateMachine::begin`].
pub struct TxRequest {
    pub source: Box<dyn ByteSource>,
    pub total_length: usize,
    pub target: TargetAddressType,
}

/// What the worker should do after a tick or an inbound FlowControl.
#[derive(Debug, Default)]
pub struct TxTickOutput {
    /// A PDU ready to hand to the link layer.
    pub pdu: Option<Pdu>,
    /// The send completed with this tick (terminal, not an error).
    pub done: bool,
    /// Errors observed, oldest first. A non-empty list always implies
    /// the send was aborted back to IDLE.
    pub errors: Vec<IsoTpError>,
}

impl TxTickOutput {
    fn none() -> Self {
        Self::default()
    }

    fn error(error: IsoTpError) -> Self {
        Self { errors: vec![error], ..Default::default() }
    }
}

struct ActiveRequest {
    source: Box<dyn ByteSource>,
    total_length: usize,
    bytes_sent: usize,
    seqnum: u8,
    block_counter: u8,
    wft_counter: u8,
    remote_bs: u8,
    remote_stmin: SeparationTime,
    fc_deadline: Option<Instant>,
    last_cf_at: Option<Instant>,
}

/// Segments an outbound payload into Single/First/Consecutive frames and
/// paces them against the peer's FlowControl replies.
pub struct TxStateMachine {
    state: State,
    request: Option<ActiveRequest>,
}

impl TxStateMachine {
    pub fn new() -> Self {
        Self { state: State::Idle, request: None }
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn transmitting(&self) -> bool {
        !self.is_idle()
    }

    pub fn stop_sending(&mut self) {
        self.state = State::Idle;
        self.request = None;
    }

    /// Start a new send. Only legal while idle. Functional sends that
    /// don't fit a single frame are rejected — callers should already
    /// reject these earlier, this is a defensive backstop.
    pub fn begin(
        &mut self,
        mut request: TxRequest,
        now: Instant,
        params: &Params,
        prefix_len: usize,
    ) -> Result<TxTickOutput, IsoTpError> {
        debug_assert!(self.is_idle());

        let classical_max = 7usize.saturating_sub(prefix_len);
        // escape-form SF header is 2 bytes (type+0x0, length) ahead of the prefix.
        let fd_escape_max = (params.tx_data_length() as usize).saturating_sub(2 + prefix_len);
        let fits_single_frame = request.total_length <= classical_max
            || (params.can_fd() && request.total_length <= fd_escape_max);

        if !fits_single_frame && request.target == TargetAddressType::Functional {
            return Err(IsoTpError::InvalidArgument(
                "functional target addressing only supports single-frame payloads".into(),
            ));
        }

        if fits_single_frame {
            let data = request.source.pull(request.total_length)?;
            if data.len() != request.total_length {
                return Err(IsoTpError::BadGenerator(
                    "byte source returned fewer bytes than the declared total length".into(),
                ));
            }
            return Ok(TxTickOutput { pdu: Some(Pdu::SingleFrame { data }), done: true, errors: Vec::new() });
        }

        let header_len = if request.total_length <= 0xFFF { 2 } else { 6 };
        let ff_data_len = (params.tx_data_length() as usize).saturating_sub(header_len + prefix_len);
        let first_chunk = request.source.pull(ff_data_len)?;
        let bytes_sent = first_chunk.len();

        self.state = State::WaitFc;
        self.request = Some(ActiveRequest {
            source: request.source,
            total_length: request.total_length,
            bytes_sent,
            seqnum: 1,
            block_counter: 0,
            wft_counter: 0,
            remote_bs: 0,
            remote_stmin: SeparationTime::zero(),
            fc_deadline: Some(now + params.rx_flowcontrol_timeout()),
            last_cf_at: None,
        });

        Ok(TxTickOutput {
            pdu: Some(Pdu::FirstFrame { length: request.total_length as u32, data: first_chunk }),
            done: false,
            errors: Vec::new(),
        })
    }

    /// Called once per worker tick. Produces the next ConsecutiveFrame
    /// when STmin pacing allows it, or reports an N_Bs timeout.
    pub fn tick(&mut self, now: Instant, params: &Params, prefix_len: usize) -> TxTickOutput {
        match self.state {
            State::Idle => TxTickOutput::none(),
            State::WaitFc => {
                let Some(req) = &self.request else { return TxTickOutput::none() };
                match req.fc_deadline {
                    Some(deadline) if now >= deadline => {
                        self.stop_sending();
                        TxTickOutput::error(IsoTpError::FlowControlTimeout)
                    }
                    _ => TxTickOutput::none(),
                }
            }
            State::TransmitCf => self.emit_consecutive_frame(now, params, prefix_len),
        }
    }

    fn emit_consecutive_frame(&mut self, now: Instant, params: &Params, prefix_len: usize) -> TxTickOutput {
        let req = self.request.as_mut().expect("TransmitCf implies an active request");

        let stmin = params.override_receiver_stmin().map(SeparationTime::from_wire).unwrap_or(req.remote_stmin);
        if let Some(last) = req.last_cf_at {
            if now < last + stmin.as_duration() {
                return TxTickOutput::none();
            }
        }

        let cf_data_len = (params.tx_data_length() as usize).saturating_sub(1 + prefix_len);
        let remaining = req.total_length - req.bytes_sent;
        let want = cf_data_len.min(remaining);
        let chunk = match req.source.pull(want) {
            Ok(c) => c,
            Err(e) => {
                self.stop_sending();
                return TxTickOutput::error(e);
            }
        };
        if chunk.len() != want {
            self.stop_sending();
            return TxTickOutput::error(IsoTpError::BadGenerator(
                "byte source ran dry before the declared total length was reached".into(),
            ));
        }

        let seqnum = req.seqnum;
        req.seqnum = if req.seqnum == 15 { 0 } else { req.seqnum + 1 };
        req.bytes_sent += chunk.len();
        req.block_counter += 1;
        req.last_cf_at = Some(now);

        let pdu = Pdu::ConsecutiveFrame { sequence_number: seqnum, data: chunk };
        let done = req.bytes_sent >= req.total_length;

        if done {
            self.stop_sending();
        } else if req.remote_bs != 0 && req.block_counter == req.remote_bs {
            req.block_counter = 0;
            req.fc_deadline = Some(now + params.rx_flowcontrol_timeout());
            self.state = State::WaitFc;
        }

        TxTickOutput { pdu: Some(pdu), done, errors: Vec::new() }
    }

    /// Feed an inbound FlowControl PDU. Ignored outside `WAIT_FC`.
    pub fn on_flow_control(&mut self, fc: &Pdu, now: Instant, params: &Params) -> TxTickOutput {
        if self.state != State::WaitFc {
            return TxTickOutput::none();
        }
        let Pdu::FlowControl { flow_status, block_size, stmin } = fc else {
            return TxTickOutput::error(IsoTpError::UnexpectedFlowControl);
        };
        let Some(req) = &mut self.request else { return TxTickOutput::none() };

        match flow_status {
            FlowStatus::Continue => {
                req.remote_bs = *block_size;
                req.remote_stmin = *stmin;
                req.block_counter = 0;
                req.fc_deadline = None;
                req.last_cf_at = None;
                self.state = State::TransmitCf;
                TxTickOutput::none()
            }
            FlowStatus::Wait => {
                if params.wftmax() == 0 {
                    self.stop_sending();
                    return TxTickOutput::error(IsoTpError::UnsupportedWaitFrame);
                }
                req.wft_counter += 1;
                if req.wft_counter > params.wftmax() {
                    self.stop_sending();
                    TxTickOutput::error(IsoTpError::MaximumWaitFrameReached)
                } else {
                    req.fc_deadline = Some(now + params.rx_flowcontrol_timeout());
                    TxTickOutput::none()
                }
            }
            FlowStatus::Overflow => {
                self.stop_sending();
                TxTickOutput::error(IsoTpError::Overflow)
            }
        }
    }
}

impl Default for TxStateMachine {
    fn default() -> Self {
        Self::new()
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
    fn short_payload_sends_as_single_frame() {
        let mut tx = TxStateMachine::new();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![1, 2, 3])),
            total_length: 3,
            target: TargetAddressType::Physical,
        };
        let out = tx.begin(request, Instant::now(), &params(), 0).unwrap();
        assert!(out.done);
        assert_eq!(out.pdu, Some(Pdu::SingleFrame { data: vec![1, 2, 3] }));
        assert!(tx.is_idle());
    }

    #[test]
    fn fd_escape_single_frame_is_bounded_by_tx_data_length() {
        // can_fd with the classical 8-byte tx_data_length must not treat a
        // 10-byte payload as fitting an escape SingleFrame: fd_escape_max
        // should be tx_data_length - 2, i.e. 6, so this still segments.
        let mut tx = TxStateMachine::new();
        let mut p = params();
        p.set_can_fd(true).unwrap();
        let payload: Vec<u8> = (0..10).collect();
        let request = TxRequest {
            source: Box::new(SliceSource::new(payload)),
            total_length: 10,
            target: TargetAddressType::Physical,
        };
        let out = tx.begin(request, Instant::now(), &p, 0).unwrap();
        assert!(!out.done);
        assert!(matches!(out.pdu, Some(Pdu::FirstFrame { length: 10, .. })));
    }

    #[test]
    fn fd_escape_single_frame_fits_when_tx_data_length_allows_it() {
        let mut tx = TxStateMachine::new();
        let mut p = params();
        p.set_can_fd(true).unwrap();
        p.set_tx_data_length(64).unwrap();
        let payload: Vec<u8> = (0..10).collect();
        let request = TxRequest {
            source: Box::new(SliceSource::new(payload.clone())),
            total_length: 10,
            target: TargetAddressType::Physical,
        };
        let out = tx.begin(request, Instant::now(), &p, 0).unwrap();
        assert!(out.done);
        assert_eq!(out.pdu, Some(Pdu::SingleFrame { data: payload }));
    }

    #[test]
    fn long_payload_waits_for_flow_control_then_streams_cfs() {
        let mut tx = TxStateMachine::new();
        let payload: Vec<u8> = (0..20).collect();
        let request = TxRequest {
            source: Box::new(SliceSource::new(payload.clone())),
            total_length: 20,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        let out = tx.begin(request, now, &params(), 0).unwrap();
        assert!(matches!(out.pdu, Some(Pdu::FirstFrame { length: 20, .. })));
        assert!(tx.transmitting());

        let fc = Pdu::FlowControl { flow_status: FlowStatus::Continue, block_size: 0, stmin: SeparationTime::zero() };
        tx.on_flow_control(&fc, now, &params());

        let mut received = Vec::new();
        loop {
            let step = tx.tick(now, &params(), 0);
            match step.pdu {
                Some(Pdu::ConsecutiveFrame { data, .. }) => received.extend(data),
                None => break,
                _ => panic!("unexpected pdu"),
            }
            if step.done {
                break;
            }
        }
        assert!(tx.is_idle());
    }

    #[test]
    fn functional_multi_frame_send_is_rejected() {
        let mut tx = TxStateMachine::new();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![0; 20])),
            total_length: 20,
            target: TargetAddressType::Functional,
        };
        assert!(tx.begin(request, Instant::now(), &params(), 0).is_err());
    }

    #[test]
    fn flow_control_timeout_aborts() {
        let mut tx = TxStateMachine::new();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![0; 20])),
            total_length: 20,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        tx.begin(request, now, &params(), 0).unwrap();
        let later = now + Duration::from_millis(1001);
        let out = tx.tick(later, &params(), 0);
        assert!(matches!(out.errors.as_slice(), [IsoTpError::FlowControlTimeout]));
        assert!(tx.is_idle());
    }

    #[test]
    fn overflow_flow_control_aborts() {
        let mut tx = TxStateMachine::new();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![0; 20])),
            total_length: 20,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        tx.begin(request, now, &params(), 0).unwrap();
        let fc = Pdu::FlowControl { flow_status: FlowStatus::Overflow, block_size: 0, stmin: SeparationTime::zero() };
        let out = tx.on_flow_control(&fc, now, &params());
        assert!(matches!(out.errors.as_slice(), [IsoTpError::Overflow]));
        assert!(tx.is_idle());
    }

    #[test]
    fn wait_frame_with_wftmax_zero_is_unsupported() {
        let mut tx = TxStateMachine::new();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![0; 20])),
            total_length: 20,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        tx.begin(request, now, &params(), 0).unwrap();
        let fc = Pdu::FlowControl { flow_status: FlowStatus::Wait, block_size: 0, stmin: SeparationTime::zero() };
        let out = tx.on_flow_control(&fc, now, &params());
        assert!(matches!(out.errors.as_slice(), [IsoTpError::UnsupportedWaitFrame]));
        assert!(tx.is_idle());
    }

    #[test]
    fn wait_frames_beyond_wftmax_abort() {
        let mut tx = TxStateMachine::new();
        let mut p = params();
        p.set_wftmax(2).unwrap();
        let request = TxRequest {
            source: Box::new(SliceSource::new(vec![0; 20])),
            total_length: 20,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        tx.begin(request, now, &p, 0).unwrap();
        let fc = Pdu::FlowControl { flow_status: FlowStatus::Wait, block_size: 0, stmin: SeparationTime::zero() };
        tx.on_flow_control(&fc, now, &p);
        tx.on_flow_control(&fc, now, &p);
        let out = tx.on_flow_control(&fc, now, &p);
        assert!(matches!(out.errors.as_slice(), [IsoTpError::MaximumWaitFrameReached]));
        assert!(tx.is_idle());
    }

    #[test]
    fn remote_block_size_returns_to_wait_fc() {
        let mut tx = TxStateMachine::new();
        let payload: Vec<u8> = (0..40).collect();
        let request = TxRequest {
            source: Box::new(SliceSource::new(payload)),
            total_length: 40,
            target: TargetAddressType::Physical,
        };
        let now = Instant::now();
        tx.begin(request, now, &params(), 0).unwrap();
        let fc = Pdu::FlowControl { flow_status: FlowStatus::Continue, block_size: 2, stmin: SeparationTime::zero() };
        tx.on_flow_control(&fc, now, &params());
        tx.tick(now, &params(), 0);
        tx.tick(now, &params(), 0);
        assert!(!tx.is_idle());
        // After 2 CFs with block_size=2, the machine must be back waiting
        // for another FlowControl rather than free-running.
        let out = tx.tick(now, &params(), 0);
        assert!(out.pdu.is_none());
    }
}
