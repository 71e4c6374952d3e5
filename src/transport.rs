// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The public API: a single `Transport` handle the user
//! thread drives, backed by the three-thread worker/relay arrangement
//! in [`crate::worker`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::addressing::{AsymmetricAddress, TargetAddressType};
use crate::error::IsoTpError;
use crate::params::Params;
use crate::state::{ByteSource, SliceSource};
use crate::worker::{Engine, EngineOutput, LinkRead, LinkWrite, WorkerEvent, WorkerHandle};

/// Timeout applied to a send queued while `Params::blocking_send` is
/// enabled. Generous relative to the N_Bs/N_Cr defaults so it only ever
/// trips on a genuinely stuck transmission.
const DEFAULT_BLOCKING_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// An ISO-TP transport bound to one addressing configuration.
///
/// Constructing a `Transport` does not spawn any threads; call
/// [`Transport::start`] to hand the link layer to the worker/relay
/// threads, and [`Transport::stop`] to tear them down. Dropping a
/// started `Transport` stops it implicitly.
pub struct Transport {
    address: AsymmetricAddress,
    params: Params,
    links: Option<(Box<dyn LinkRead>, Box<dyn LinkWrite>)>,
    worker: Option<WorkerHandle>,
    /// The synchronous core, used only in the single-threaded fallback
    /// driven by [`Transport::process`] (retained for
    /// callers that don't want the worker/relay threads at all). `start`
    /// moves the link layer into a [`WorkerHandle`] and this stays
    /// `None` for the lifetime of that handle.
    engine: Option<Engine>,
    received: VecDeque<Vec<u8>>,
    error_handler: Option<Box<dyn FnMut(IsoTpError) + Send>>,
}

impl Transport {
    /// Build a transport. Validates the address and params up front so
    /// configuration mistakes surface before any thread is spawned.
    pub fn new(
        address: AsymmetricAddress,
        params: Params,
        link_read: Box<dyn LinkRead>,
        link_write: Box<dyn LinkWrite>,
    ) -> Result<Self, IsoTpError> {
        address.validate()?;
        params.validate()?;
        Ok(Self {
            address,
            params,
            links: Some((link_read, link_write)),
            worker: None,
            engine: None,
            received: VecDeque::new(),
            error_handler: None,
        })
    }

    /// Install a callback invoked on the worker thread's reporting path
    /// for every error the protocol encounters (timeouts, malformed
    /// frames, wrong sequence numbers, ...). Errors are always logged
    /// via the `log` crate regardless of whether a handler is set.
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: FnMut(IsoTpError) + Send + 'static,
    {
        self.error_handler = Some(Box::new(handler));
    }

    /// Spawn the worker and relay threads, handing them the link layer
    /// supplied to [`Transport::new`]. Idempotent once started.
    pub fn start(&mut self) -> Result<(), IsoTpError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (link_read, link_write) = self.links.take().ok_or_else(|| {
            IsoTpError::InvalidArgument("transport was already started and stopped once".into())
        })?;
        self.worker = Some(WorkerHandle::spawn(self.address.clone(), self.params.clone(), link_read, link_write));
        Ok(())
    }

    /// Stop the worker and relay threads. The link layer handed to
    /// [`Transport::new`] is not recoverable afterwards.
    pub fn stop(&mut self) {
        self.worker = None;
    }

    fn worker(&self) -> Result<&WorkerHandle, IsoTpError> {
        self.worker.as_ref().ok_or_else(|| IsoTpError::InvalidArgument("transport is not started".into()))
    }

    fn drain_events(&mut self) {
        let Some(worker) = &self.worker else { return };
        while let Ok(event) = worker.events.try_recv() {
            match event {
                WorkerEvent::Delivered(payload) => self.received.push_back(payload),
                WorkerEvent::Error(e) => {
                    log::warn!(target: self.params.logger_name(), "{e}");
                    if let Some(handler) = &mut self.error_handler {
                        handler(e);
                    }
                }
            }
        }
    }

    /// Pop the next fully reassembled payload, if one is ready.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.drain_events();
        self.received.pop_front()
    }

    /// True if [`Transport::recv`] would return `Some` right now.
    pub fn available(&mut self) -> bool {
        self.drain_events();
        !self.received.is_empty()
    }

    /// True if a transmission is currently in progress.
    pub fn transmitting(&self) -> bool {
        if let Some(worker) = &self.worker {
            return worker.transmitting();
        }
        self.engine.as_ref().map(Engine::transmitting).unwrap_or(false)
    }

    /// Queue `payload` for transmission to the default target address
    /// type (`Params::default_target_address_type`).
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), IsoTpError> {
        let target = self.params.default_target_address_type();
        self.send_to(payload, target)
    }

    /// Queue `payload` for transmission to an explicit target type.
    pub fn send_to(&mut self, payload: Vec<u8>, target: TargetAddressType) -> Result<(), IsoTpError> {
        let total_length = payload.len();
        self.send_generator(Box::new(SliceSource::new(payload)), total_length, target)
    }

    /// Queue a send whose payload is produced lazily by `source`, which
    /// must yield exactly `total_length` bytes in total.
    pub fn send_generator(
        &mut self,
        source: Box<dyn ByteSource>,
        total_length: usize,
        target: TargetAddressType,
    ) -> Result<(), IsoTpError> {
        if self.worker.is_some() {
            return if self.params.blocking_send() {
                self.worker()?.send_blocking(source, total_length, target, DEFAULT_BLOCKING_SEND_TIMEOUT)
            } else {
                self.worker()?.send(source, total_length, target);
                Ok(())
            };
        }

        // Backward-compat single-threaded mode: no
        // worker thread is running, so the send is begun synchronously
        // against our own `Engine` and driven forward by the caller's
        // own `process()` calls.
        self.engine.get_or_insert_with(|| Engine::new(self.address.clone(), self.params.clone()));
        let now = Instant::now();
        let result = self.engine.as_mut().expect("engine initialized above").begin_send(source, total_length, target, now);
        let (_, link_write) = self.links.as_mut().ok_or_else(|| {
            IsoTpError::InvalidArgument("transport's link layer has been moved to a worker thread".into())
        })?;
        Self::apply_output(&mut self.received, &mut self.error_handler, self.params.logger_name(), link_write.as_mut(), result)?;

        if self.params.blocking_send() {
            let deadline = Instant::now() + DEFAULT_BLOCKING_SEND_TIMEOUT;
            while self.transmitting() {
                if Instant::now() >= deadline {
                    return Err(IsoTpError::BlockingSendTimeout(DEFAULT_BLOCKING_SEND_TIMEOUT));
                }
                self.process()?;
            }
        }
        Ok(())
    }

    /// Drive the protocol for a single step without any worker thread:
    /// poll the link layer once non-blockingly,
    /// feed whatever arrived to the engine, then service timers. Only
    /// usable while [`Transport::start`] has not been called — once a
    /// worker thread owns the link layer, frames arrive on the relay
    /// thread instead.
    pub fn process(&mut self) -> Result<(), IsoTpError> {
        if self.worker.is_some() {
            return Err(IsoTpError::InvalidArgument(
                "process() cannot be used after start(); the worker thread already drives the engine".into(),
            ));
        }
        self.engine.get_or_insert_with(|| Engine::new(self.address.clone(), self.params.clone()));
        let now = Instant::now();
        let (link_read, link_write) = self.links.as_mut().ok_or_else(|| {
            IsoTpError::InvalidArgument("transport's link layer has been moved to a worker thread".into())
        })?;
        let inbound = link_read.recv_frame(Duration::ZERO).map_err(IsoTpError::Io)?;
        let engine = self.engine.as_mut().expect("engine initialized above");

        if let Some(frame) = inbound {
            let result = engine.on_inbound(&frame, now);
            Self::apply_output(&mut self.received, &mut self.error_handler, self.params.logger_name(), link_write.as_mut(), result)?;
        }
        let result = self.engine.as_mut().expect("engine initialized above").tick(now);
        let (_, link_write) = self.links.as_mut().expect("checked above");
        Self::apply_output(&mut self.received, &mut self.error_handler, self.params.logger_name(), link_write.as_mut(), result)?;
        Ok(())
    }

    fn apply_output(
        received: &mut VecDeque<Vec<u8>>,
        error_handler: &mut Option<Box<dyn FnMut(IsoTpError) + Send>>,
        logger_name: &str,
        link_write: &mut dyn LinkWrite,
        result: Result<EngineOutput, IsoTpError>,
    ) -> Result<(), IsoTpError> {
        let out = result?;
        for error in out.errors {
            log::warn!(target: logger_name, "{error}");
            if let Some(handler) = error_handler {
                handler(error);
            }
        }
        if let Some(frame) = out.to_send {
            link_write.send_frame(&frame).map_err(IsoTpError::Io)?;
        }
        if let Some(payload) = out.delivered {
            received.push_back(payload);
        }
        Ok(())
    }

    /// Queue `payload` and block until the transmission completes or
    /// fails, regardless of `Params::blocking_send`.
    pub fn send_blocking(
        &mut self,
        payload: Vec<u8>,
        target: TargetAddressType,
        timeout: Duration,
    ) -> Result<(), IsoTpError> {
        let total_length = payload.len();
        self.worker()?.send_blocking(Box::new(SliceSource::new(payload)), total_length, target, timeout)
    }

    /// Abort an in-progress transmission, if any.
    pub fn stop_sending(&mut self) {
        if let Some(worker) = &self.worker {
            worker.stop_sending();
        } else if let Some(engine) = &mut self.engine {
            engine.stop_sending();
        }
    }

    /// Abandon an in-progress reassembly, if any.
    pub fn stop_receiving(&mut self) {
        if let Some(worker) = &self.worker {
            worker.stop_receiving();
        } else if let Some(engine) = &mut self.engine {
            engine.stop_receiving();
        }
    }

    /// Reset both state machines to IDLE, discarding any in-progress
    /// transmission or reassembly. Only allowed while the worker thread
    /// is not running: either before [`Transport::start`]
    /// or after [`Transport::stop`].
    pub fn reset(&mut self) -> Result<(), IsoTpError> {
        if self.worker.is_some() {
            return Err(IsoTpError::InvalidArgument(
                "reset() is only allowed while the worker thread is not running".into(),
            ));
        }
        if let Some(engine) = &mut self.engine {
            engine.reset();
        }
        Ok(())
    }

    /// Re-address the transport. Only allowed before [`Transport::start`] —
    /// once the worker thread owns the link layer, the
    /// address is fixed for the transport's lifetime.
    pub fn set_address(&mut self, address: AsymmetricAddress) -> Result<(), IsoTpError> {
        if self.worker.is_some() {
            return Err(IsoTpError::InvalidArgument("set_address() is only allowed before start()".into()));
        }
        address.validate()?;
        self.address = address.clone();
        if let Some(engine) = &mut self.engine {
            engine.set_address(address);
        }
        Ok(())
    }

    /// Replace the configuration. Safe at any time: unlike the address,
    /// params may be updated on a running transport.
    pub fn set_params(&mut self, params: Params) -> Result<(), IsoTpError> {
        params.validate()?;
        self.params = params.clone();
        if let Some(worker) = &self.worker {
            worker.set_params(params);
        } else if let Some(engine) = &mut self.engine {
            engine.set_params(params);
        }
        Ok(())
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn address(&self) -> &AsymmetricAddress {
        &self.address
    }
}
