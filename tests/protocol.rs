// This file is part of the 'isotp' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! End-to-end scenarios, exercised through two [`Transport`]
//! handles wired back-to-back over an in-memory channel pair instead of a
//! real CAN bus.

use std::io;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use isotp::pdu::FramingPolicy;
use isotp::{Address, AsymmetricAddress, CanMessage, LinkRead, LinkWrite, Params, Pdu, Transport};

struct ChanReader(Receiver<CanMessage>);

impl LinkRead for ChanReader {
    fn recv_frame(&mut self, timeout: Duration) -> io::Result<Option<CanMessage>> {
        match self.0.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

struct ChanWriter {
    tx: Sender<CanMessage>,
    sent: Arc<Mutex<Vec<CanMessage>>>,
}

impl LinkWrite for ChanWriter {
    fn send_frame(&mut self, frame: &CanMessage) -> io::Result<()> {
        self.sent.lock().unwrap().push(frame.clone());
        let _ = self.tx.send(frame.clone());
        Ok(())
    }
}

/// One direction of a loopback pair: a [`Transport`] plus a handle onto
/// every frame it has physically sent, and the error messages its error
/// handler has observed.
struct Endpoint {
    transport: Transport,
    sent: Arc<Mutex<Vec<CanMessage>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Endpoint {
    fn new(address: AsymmetricAddress, params: Params, reader: Receiver<CanMessage>, writer_tx: Sender<CanMessage>) -> Self {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut transport = Transport::new(
            address,
            params,
            Box::new(ChanReader(reader)),
            Box::new(ChanWriter { tx: writer_tx, sent: sent.clone() }),
        )
        .unwrap();
        let handler_errors = errors.clone();
        transport.set_error_handler(move |e| handler_errors.lock().unwrap().push(e.to_string()));
        Self { transport, sent, errors }
    }

    fn errors_contain(&self, needle: &str) -> bool {
        self.errors.lock().unwrap().iter().any(|e| e.contains(needle))
    }
}

/// Build two threaded, cross-wired endpoints: `a`'s writes arrive at
/// `b`'s reader and vice versa.
fn loopback(addr_a: AsymmetricAddress, params_a: Params, addr_b: AsymmetricAddress, params_b: Params) -> (Endpoint, Endpoint) {
    let (a_to_b_tx, a_to_b_rx) = channel();
    let (b_to_a_tx, b_to_a_rx) = channel();
    let mut a = Endpoint::new(addr_a, params_a, b_to_a_rx, a_to_b_tx);
    let mut b = Endpoint::new(addr_b, params_b, a_to_b_rx, b_to_a_tx);
    a.transport.start().unwrap();
    b.transport.start().unwrap();
    (a, b)
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn single_frame_round_trip_normal_11bit() {
    let addr_a = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x456, rxid: 0x123 });
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });

    let mut params_a = Params::default();
    params_a.set_tx_padding(Some(0xCC)).unwrap();
    params_a.set_tx_data_min_length(Some(8)).unwrap();

    let (mut a, mut b) = loopback(addr_a, params_a, addr_b, Params::default());

    a.transport.send(vec![0x01, 0x02, 0x03]).unwrap();
    assert!(wait_until(Duration::from_millis(500), || b.transport.available()));

    let delivered = b.transport.recv().unwrap();
    assert_eq!(delivered, vec![0x01, 0x02, 0x03]);

    let frames = a.sent.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].arbitration_id, 0x456);
    assert_eq!(frames[0].data, vec![0x03, 0x01, 0x02, 0x03, 0xCC, 0xCC, 0xCC, 0xCC]);
}

#[test]
fn ten_byte_multi_frame_bs0_stmin0() {
    let addr_a = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x456, rxid: 0x123 });
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });
    let mut params_b = Params::default();
    params_b.set_blocksize(0).unwrap();
    params_b.set_stmin(0).unwrap();

    let (mut a, mut b) = loopback(addr_a, Params::default(), addr_b, params_b);

    let payload: Vec<u8> = (0..10).collect();
    a.transport.send(payload.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || b.transport.available()));
    assert_eq!(b.transport.recv().unwrap(), payload);
    assert!(wait_until(Duration::from_secs(1), || !a.transport.transmitting()));
}

#[test]
fn block_size_two_pacing_observes_two_fc_cf_cycles() {
    let addr_a = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x456, rxid: 0x123 });
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });
    let mut params_b = Params::default();
    params_b.set_blocksize(2).unwrap();
    params_b.set_stmin(0).unwrap();

    let (mut a, mut b) = loopback(addr_a, Params::default(), addr_b, params_b);

    // FF carries 6 bytes, each classical CF carries 7: 6 + 7*3 = 27 bytes
    // needs exactly 3 consecutive frames, so BS=2 forces a second FC.
    let payload: Vec<u8> = (0..27).collect();
    a.transport.send(payload.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(1), || b.transport.available()));
    assert_eq!(b.transport.recv().unwrap(), payload);

    let sent_by_a = a.sent.lock().unwrap();
    let cf_count = sent_by_a
        .iter()
        .filter(|f| matches!(Pdu::decode(&f.data), Ok(Pdu::ConsecutiveFrame { .. })))
        .count();
    assert_eq!(cf_count, 3);

    let fc_count = b
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|f| matches!(Pdu::decode(&f.data), Ok(Pdu::FlowControl { .. })))
        .count();
    assert_eq!(fc_count, 2, "BS=2 over 3 CFs should take exactly two FC round trips");
}

#[test]
fn overflow_aborts_both_sides() {
    let addr_a = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x456, rxid: 0x123 });
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });
    let mut params_b = Params::default();
    params_b.set_max_frame_size(100).unwrap();

    let (mut a, mut b) = loopback(addr_a, Params::default(), addr_b, params_b);

    a.transport.send(vec![0u8; 200]).unwrap();
    assert!(wait_until(Duration::from_secs(1), || !a.transport.transmitting()));
    assert!(wait_until(Duration::from_millis(200), || a.errors_contain("overflow")));
    assert!(b.errors_contain("frame too long"));
    assert!(!b.transport.available());
}

#[test]
fn wrong_sequence_number_discards_partial_reassembly() {
    // Feed crafted frames directly into a receiver-only transport driven
    // by `process()` (backward-compat single-threaded mode), so the
    // malformed consecutive frame can be injected exactly as the
    // scenario describes rather than relying on a conformant
    // sender to ever produce it.
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });
    let (inject_tx, inject_rx) = channel();
    let (sink_tx, _sink_rx) = channel();
    let mut b = Endpoint::new(addr_b, Params::default(), inject_rx, sink_tx);

    // 20-byte payload: FF carries 6 bytes, leaving 14 for two more classical
    // CFs (7 bytes each) — enough room for one accepted CF (seq=1) before
    // the malformed one arrives, matching the scenario's "seq=3 instead of
    // 2" description literally.
    let ff = Pdu::FirstFrame { length: 20, data: (0..6).collect() };
    let ff_data = ff.encode(None, FramingPolicy::default()).unwrap();
    inject_tx.send(CanMessage::new(0x456, ff_data, false)).unwrap();
    b.transport.process().unwrap();

    let good_cf = Pdu::ConsecutiveFrame { sequence_number: 1, data: (6..13).collect() };
    let good_cf_data = good_cf.encode(None, FramingPolicy::default()).unwrap();
    inject_tx.send(CanMessage::new(0x456, good_cf_data, false)).unwrap();
    b.transport.process().unwrap();
    assert!(!b.transport.available());

    let bad_cf = Pdu::ConsecutiveFrame { sequence_number: 3, data: vec![13, 14, 15, 16, 17, 18, 19] };
    let bad_cf_data = bad_cf.encode(None, FramingPolicy::default()).unwrap();
    inject_tx.send(CanMessage::new(0x456, bad_cf_data, false)).unwrap();
    b.transport.process().unwrap();

    assert!(b.errors_contain("wrong sequence number: expected 2, got 3"));
    assert!(!b.transport.available());
}

#[test]
fn consecutive_frame_timeout_returns_rx_to_idle() {
    let addr_b = AsymmetricAddress::symmetric(Address::Normal11 { txid: 0x123, rxid: 0x456 });
    let mut params_b = Params::default();
    params_b.set_rx_consecutive_frame_timeout(Duration::from_millis(200)).unwrap();

    let (inject_tx, inject_rx) = channel();
    let (sink_tx, _sink_rx) = channel();
    let mut b = Endpoint::new(addr_b, params_b, inject_rx, sink_tx);
    b.transport.start().unwrap();

    let ff = Pdu::FirstFrame { length: 10, data: vec![0, 1, 2, 3, 4, 5] };
    let ff_data = ff.encode(None, FramingPolicy::default()).unwrap();
    inject_tx.send(CanMessage::new(0x456, ff_data, false)).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert!(b.errors_contain("consecutive frame timeout"));
    assert!(!b.transport.available());
}

#[test]
fn normal_fixed_29_physical_round_trip() {
    // Sender's TA=0xAA, SA=0x55; receiver's own TA/SA are swapped.
    let addr_a = AsymmetricAddress::symmetric(Address::NormalFixed29 { target_address: 0xAA, source_address: 0x55 });
    let addr_b = AsymmetricAddress::symmetric(Address::NormalFixed29 { target_address: 0x55, source_address: 0xAA });

    let (mut a, mut b) = loopback(addr_a, Params::default(), addr_b, Params::default());

    let payload = vec![1, 2, 3, 4, 5];
    a.transport.send(payload.clone()).unwrap();
    assert!(wait_until(Duration::from_millis(500), || b.transport.available()));
    assert_eq!(b.transport.recv().unwrap(), payload);

    let frames = a.sent.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].arbitration_id, 0x18DA_AA55);
    assert_eq!(frames[0].data, vec![0x05, 1, 2, 3, 4, 5]);
}
