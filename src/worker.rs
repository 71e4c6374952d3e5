// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The engine that couples the Rx and Tx state machines to one address
//! and one `Params` snapshot, plus the
//! threaded runtime built on top of it.
//!
//! [`Engine`] is the pure, synchronous core: feed it frames and ticks,
//! it tells you what to send and what was delivered. [`WorkerHandle`]
//! wraps it in a three-thread arrangement: a worker
//! thread owns the `Engine` and drains a command channel with a timeout
//! so it also wakes up to service timers; a relay thread blocks on the
//! link layer's receive call and forwards frames in; the user thread
//! only ever talks to both through channels. Shutdown uses a sentinel
//! command rather than a condvar, so the relay thread's blocking read
//! is the only thing that can still be "stuck" — bounded by its own
//! read timeout.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::addressing::{AsymmetricAddress, TargetAddressType};
use crate::error::IsoTpError;
use crate::frame::CanMessage;
use crate::params::Params;
use crate::pdu::{FramingPolicy, Pdu};
use crate::ratelimiter::RateLimiter;
use crate::state::{ByteSource, RxStateMachine, TxRequest, TxStateMachine};

/// How often the worker thread wakes up even with no commands pending,
/// to service N_Cr/N_Bs timers and STmin pacing.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// How long the relay thread's link read blocks before re-checking the
/// shutdown flag.
pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Depth of the inbound frame / outbound event channels.
const CHANNEL_DEPTH: usize = 64;

/// What an [`Engine`] step produced: zero or one frame to physically
/// send, zero or one delivered payload, and any errors observed.
#[derive(Default)]
pub struct EngineOutput {
    pub to_send: Option<CanMessage>,
    pub delivered: Option<Vec<u8>>,
    pub errors: Vec<IsoTpError>,
    /// The Tx machine reached IDLE because the whole payload went out
    /// successfully.
    pub done_sending: bool,
    /// `errors` originated from the Tx machine (flow-control timeout,
    /// peer overflow/wait-frame abuse, generator failure) rather than the
    /// Rx machine — these always mean the current send was aborted, even
    /// though `done_sending` stays false (that field is reserved for a
    /// *successful* completion).
    pub tx_aborted: bool,
}

/// The synchronous protocol core: one address, one `Params` snapshot,
/// the two state machines, and an optional rate limiter.
pub struct Engine {
    rx: RxStateMachine,
    tx: TxStateMachine,
    limiter: Option<RateLimiter>,
    address: AsymmetricAddress,
    params: Params,
}

impl Engine {
    pub fn new(address: AsymmetricAddress, params: Params) -> Self {
        let limiter = Self::build_limiter(&params);
        Self {
            rx: RxStateMachine::new(params.listen_mode()),
            tx: TxStateMachine::new(),
            limiter,
            address,
            params,
        }
    }

    fn build_limiter(params: &Params) -> Option<RateLimiter> {
        params
            .rate_limit_enable()
            .then(|| RateLimiter::new(params.rate_limit_max_bitrate(), params.rate_limit_window_size()))
    }

    pub fn set_params(&mut self, params: Params) {
        self.limiter = Self::build_limiter(&params);
        self.params = params;
    }

    pub fn set_address(&mut self, address: AsymmetricAddress) {
        self.address = address;
    }

    pub fn transmitting(&self) -> bool {
        self.tx.transmitting()
    }

    pub fn stop_sending(&mut self) {
        self.tx.stop_sending();
    }

    pub fn stop_receiving(&mut self) {
        self.rx.stop_receiving();
    }

    pub fn reset(&mut self) {
        self.stop_sending();
        self.stop_receiving();
    }

    fn framing_policy(&self) -> FramingPolicy {
        FramingPolicy {
            is_fd: self.params.can_fd(),
            tx_data_min_length: self.params.tx_data_min_length(),
            tx_padding: self.params.tx_padding(),
        }
    }

    fn tx_prefix_len(&self) -> usize {
        self.address.tx_payload_prefix().is_some() as usize
    }

    fn encode(&self, pdu: &Pdu, target: TargetAddressType) -> Result<CanMessage, IsoTpError> {
        let arbitration_id = self.address.tx_arbitration_id(target)?;
        let data = pdu.encode(self.address.tx_payload_prefix(), self.framing_policy())?;
        let is_extended = self.address.tx.is_29bit();
        Ok(if self.params.can_fd() {
            CanMessage::new_fd(arbitration_id, data, is_extended, self.params.bitrate_switch())
        } else {
            CanMessage::new(arbitration_id, data, is_extended)
        })
    }

    /// Start a new transmission. Only legal when the Tx machine is idle.
    pub fn begin_send(
        &mut self,
        source: Box<dyn ByteSource>,
        total_length: usize,
        target: TargetAddressType,
        now: Instant,
    ) -> Result<EngineOutput, IsoTpError> {
        if self.tx.transmitting() {
            return Err(IsoTpError::InvalidArgument(
                "a transmission is already in progress".into(),
            ));
        }
        let request = TxRequest { source, total_length, target };
        let step = self.tx.begin(request, now, &self.params, self.tx_prefix_len())?;
        let mut out = EngineOutput { done_sending: step.done, errors: step.errors, ..Default::default() };
        if let Some(pdu) = step.pdu {
            out.to_send = Some(self.encode(&pdu, target)?);
        }
        Ok(out)
    }

    /// Feed one inbound frame. Frames not addressed to us are silently
    /// ignored.
    pub fn on_inbound(&mut self, frame: &CanMessage, now: Instant) -> Result<EngineOutput, IsoTpError> {
        if !self.address.is_for_me(frame) {
            return Ok(EngineOutput::default());
        }
        let prefix = self.address.rx_prefix_size();
        if frame.data.len() < prefix {
            return Err(IsoTpError::InvalidCanData("frame shorter than addressing prefix".into()));
        }
        let pdu = Pdu::decode(&frame.data[prefix..])?;
        let frame_len = frame.data.len();

        if matches!(pdu, Pdu::FlowControl { .. }) {
            let step = self.tx.on_flow_control(&pdu, now, &self.params);
            let tx_aborted = !step.errors.is_empty();
            let mut out = EngineOutput { done_sending: step.done, tx_aborted, errors: step.errors, ..Default::default() };
            if let Some(pdu) = step.pdu {
                out.to_send = Some(self.encode(&pdu, TargetAddressType::Physical)?);
            }
            return Ok(out);
        }

        let step = self.rx.on_frame(pdu, frame_len, now, &self.params);
        let mut out = EngineOutput { delivered: step.delivered, errors: step.errors, ..Default::default() };
        if let Some(pdu) = step.send {
            out.to_send = Some(self.encode(&pdu, TargetAddressType::Physical)?);
        }
        Ok(out)
    }

    /// Service timers and STmin-gated Tx pacing. Called once per worker
    /// tick whether or not a frame arrived.
    pub fn tick(&mut self, now: Instant) -> Result<EngineOutput, IsoTpError> {
        let mut out = EngineOutput::default();
        if let Some(err) = self.rx.check_timeout(now) {
            out.errors.push(err);
        }

        if self.tx.transmitting() {
            if let Some(limiter) = &mut self.limiter {
                let estimated_bits = self.params.tx_data_length() as u64 * 8;
                if !limiter.allow(now, estimated_bits) {
                    return Ok(out);
                }
            }
            let step = self.tx.tick(now, &self.params, self.tx_prefix_len());
            out.done_sending = step.done;
            out.tx_aborted = !step.errors.is_empty();
            out.errors.extend(step.errors);
            if let Some(pdu) = step.pdu {
                let msg = self.encode(&pdu, TargetAddressType::Physical)?;
                if let Some(limiter) = &mut self.limiter {
                    limiter.record(now, (msg.data.len() as u64) * 8);
                }
                out.to_send = Some(msg);
            }
        }
        Ok(out)
    }
}

/// Blocking frame source, e.g. a kernel CAN socket or an in-memory
/// loopback channel used in tests.
pub trait LinkRead: Send {
    /// Block for up to `timeout` waiting for one inbound frame.
    /// `Ok(None)` on timeout with nothing available.
    fn recv_frame(&mut self, timeout: Duration) -> io::Result<Option<CanMessage>>;
}

/// Frame sink, e.g. a kernel CAN socket or an in-memory loopback.
pub trait LinkWrite: Send {
    fn send_frame(&mut self, frame: &CanMessage) -> io::Result<()>;
}

/// Outcome delivered to the user thread for a single queued `send`.
pub type SendOutcome = Result<(), IsoTpError>;

enum Command {
    Send(Box<dyn ByteSource>, usize, TargetAddressType, Option<SyncSender<SendOutcome>>),
    Inbound(CanMessage),
    SetParams(Params),
    SetAddress(AsymmetricAddress),
    StopSending,
    StopReceiving,
    Reset,
    Shutdown,
}

/// Events the worker thread reports back to the user thread.
pub enum WorkerEvent {
    Delivered(Vec<u8>),
    Error(IsoTpError),
}

/// Handle to a running worker + relay thread pair.
pub struct WorkerHandle {
    commands: SyncSender<Command>,
    pub events: Receiver<WorkerEvent>,
    shutdown: Arc<AtomicBool>,
    transmitting: Arc<AtomicBool>,
    worker_thread: Option<JoinHandle<()>>,
    relay_thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        address: AsymmetricAddress,
        params: Params,
        mut link_read: Box<dyn LinkRead>,
        mut link_write: Box<dyn LinkWrite>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = sync_channel::<Command>(CHANNEL_DEPTH);
        let (evt_tx, evt_rx) = sync_channel::<WorkerEvent>(CHANNEL_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let transmitting = Arc::new(AtomicBool::new(false));

        let relay_cmd_tx = cmd_tx.clone();
        let relay_shutdown = shutdown.clone();
        let relay_thread = std::thread::Builder::new()
            .name("isotp-relay".into())
            .spawn(move || {
                while !relay_shutdown.load(Ordering::Acquire) {
                    match link_read.recv_frame(RELAY_POLL_INTERVAL) {
                        Ok(Some(frame)) => {
                            log::trace!("relay: inbound {frame}");
                            if relay_cmd_tx.send(Command::Inbound(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("relay: link read error: {e}"),
                    }
                }
            })
            .expect("failed to spawn isotp relay thread");

        let worker_transmitting = transmitting.clone();
        let worker_thread = std::thread::Builder::new()
            .name("isotp-worker".into())
            .spawn(move || {
                let logger_name = params.logger_name().to_string();
                let mut engine = Engine::new(address, params);
                let mut pending_ack: Option<SyncSender<SendOutcome>> = None;
                log::debug!(target: &logger_name, "worker thread started");

                loop {
                    match cmd_rx.recv_timeout(TICK_INTERVAL) {
                        Ok(Command::Shutdown) => break,
                        Ok(Command::Inbound(frame)) => {
                            dispatch(engine.on_inbound(&frame, Instant::now()), &evt_tx, &mut link_write, &mut pending_ack);
                        }
                        Ok(Command::Send(source, total_length, target, ack)) => {
                            pending_ack = ack;
                            let result = engine.begin_send(source, total_length, target, Instant::now());
                            match result {
                                Ok(out) => dispatch(Ok(out), &evt_tx, &mut link_write, &mut pending_ack),
                                Err(e) => fail_pending(&mut pending_ack, e),
                            }
                        }
                        Ok(Command::SetParams(p)) => engine.set_params(p),
                        Ok(Command::SetAddress(a)) => engine.set_address(a),
                        Ok(Command::StopSending) => {
                            engine.stop_sending();
                            fail_pending(&mut pending_ack, IsoTpError::InvalidArgument("send aborted".into()));
                        }
                        Ok(Command::StopReceiving) => engine.stop_receiving(),
                        Ok(Command::Reset) => {
                            engine.reset();
                            fail_pending(&mut pending_ack, IsoTpError::InvalidArgument("send aborted".into()));
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    dispatch(engine.tick(Instant::now()), &evt_tx, &mut link_write, &mut pending_ack);
                    worker_transmitting.store(engine.transmitting(), Ordering::Release);
                }

                log::debug!(target: &logger_name, "worker thread stopped");
            })
            .expect("failed to spawn isotp worker thread");

        Self {
            commands: cmd_tx,
            events: evt_rx,
            shutdown,
            transmitting,
            worker_thread: Some(worker_thread),
            relay_thread: Some(relay_thread),
        }
    }

    pub fn transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Acquire)
    }

    pub fn send(&self, source: Box<dyn ByteSource>, total_length: usize, target: TargetAddressType) {
        // Set optimistically so transmitting() is observable before this call
        // returns; the worker corrects it back to false if begin_send rejects
        // the request outright (see Engine::begin_send's error path).
        self.transmitting.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Send(source, total_length, target, None));
    }

    /// Queue a send and block until it completes or fails.
    pub fn send_blocking(
        &self,
        source: Box<dyn ByteSource>,
        total_length: usize,
        target: TargetAddressType,
        timeout: Duration,
    ) -> SendOutcome {
        self.transmitting.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = sync_channel(1);
        self.commands
            .send(Command::Send(source, total_length, target, Some(ack_tx)))
            .map_err(|_| IsoTpError::BlockingSendFailure("worker thread is gone".into()))?;
        ack_rx
            .recv_timeout(timeout)
            .map_err(|_| IsoTpError::BlockingSendTimeout(timeout))?
    }

    pub fn set_params(&self, params: Params) {
        let _ = self.commands.send(Command::SetParams(params));
    }

    pub fn set_address(&self, address: AsymmetricAddress) {
        let _ = self.commands.send(Command::SetAddress(address));
    }

    pub fn stop_sending(&self) {
        let _ = self.commands.send(Command::StopSending);
    }

    pub fn stop_receiving(&self) {
        let _ = self.commands.send(Command::StopReceiving);
    }

    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
        if let Some(t) = self.worker_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.relay_thread.take() {
            let _ = t.join();
        }
    }
}

fn dispatch(
    result: Result<EngineOutput, IsoTpError>,
    events: &SyncSender<WorkerEvent>,
    link_write: &mut Box<dyn LinkWrite>,
    pending_ack: &mut Option<SyncSender<SendOutcome>>,
) {
    let out = match result {
        Ok(out) => out,
        Err(e) => {
            fail_pending(pending_ack, clone_error(&e));
            let _ = events.send(WorkerEvent::Error(e));
            return;
        }
    };

    for error in out.errors {
        if out.done_sending || out.tx_aborted {
            fail_pending(pending_ack, clone_error(&error));
        }
        let _ = events.send(WorkerEvent::Error(error));
    }

    if let Some(frame) = out.to_send {
        if let Err(e) = link_write.send_frame(&frame) {
            let _ = events.send(WorkerEvent::Error(IsoTpError::Io(e)));
        }
    }

    if let Some(payload) = out.delivered {
        let _ = events.send(WorkerEvent::Delivered(payload));
    }

    if out.done_sending {
        if let Some(ack) = pending_ack.take() {
            let _ = ack.send(Ok(()));
        }
    }
}

fn fail_pending(pending_ack: &mut Option<SyncSender<SendOutcome>>, error: IsoTpError) {
    if let Some(ack) = pending_ack.take() {
        let _ = ack.send(Err(error));
    }
}

fn clone_error(error: &IsoTpError) -> IsoTpError {
    // `IsoTpError` intentionally does not derive `Clone` (it wraps
    // `io::Error`); build an equivalent variant for the ack channel,
    // which only cares about success/failure plus a message.
    IsoTpError::BlockingSendFailure(error.to_string())
}
