//! End-to-end scenarios driving the frame-handling layers directly
//! (`StateMachine` + `Framing` + the application operations) against the
//! in-memory fake transport, without a background thread — this exercises
//! exactly the same dispatch a `CashlessPeripheral` would perform per
//! frame, just without the thread/lock plumbing around it.

use std::cell::RefCell;

use mdb_cashless_peripheral::constants::*;
use mdb_cashless_peripheral::framing::{encode_data, Framing};
use mdb_cashless_peripheral::state_machine::{self, OutboundQueue, StateMachine, VendObserver, VendRequest};
use mdb_cashless_peripheral::test_support::{FakeClock, FakeTransport};
use mdb_cashless_peripheral::State;

fn frame(mut payload: Vec<u8>) -> Vec<u8> {
    let sum = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    payload.push(sum);
    payload
}

fn new_rig() -> (StateMachine, Framing<FakeTransport, FakeClock>, OutboundQueue) {
    let mut framing = Framing::new(FakeTransport::new(), FakeClock::new());
    framing.open().unwrap();
    (StateMachine::new(DEFAULT_ADDRESS), framing, OutboundQueue::new())
}

fn expect_ack(framing: &Framing<FakeTransport, FakeClock>) {
    framing.transport().push_incoming(&[(ACK_BYTE, true)]);
}

#[derive(Default)]
struct RecordingObserver {
    requests: RefCell<Vec<VendRequest>>,
    results: RefCell<Vec<(VendRequest, bool)>>,
}

impl VendObserver for RecordingObserver {
    fn on_vend_request(&self, request: VendRequest) {
        self.requests.borrow_mut().push(request);
    }

    fn on_vend_result(&self, request: VendRequest, dispensed: bool) {
        self.results.borrow_mut().push((request, dispensed));
    }
}

#[test]
fn cold_reset_to_disabled() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();

    expect_ack(&framing);
    let poll = frame(vec![DEFAULT_ADDRESS | CMD_POLL]);
    sm.handle_frame(&poll, &mut framing, &mut queue, &observer);

    assert_eq!(sm.state(), State::Disabled);
    assert_eq!(framing.transport().take_transmitted(), encode_data(JUST_RESET));

    let poll_again = frame(vec![DEFAULT_ADDRESS | CMD_POLL]);
    sm.handle_frame(&poll_again, &mut framing, &mut queue, &observer);
    assert_eq!(sm.state(), State::Disabled);
    assert_eq!(framing.transport().take_transmitted(), vec![(ACK_BYTE, true)]);
}

#[test]
fn enable() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();

    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    assert_eq!(sm.state(), State::Disabled);
    framing.transport().take_transmitted();

    let enable_frame = frame(vec![DEFAULT_ADDRESS | CMD_READER, READER_ENABLE]);
    sm.handle_frame(&enable_frame, &mut framing, &mut queue, &observer);

    assert_eq!(sm.state(), State::Enabled);
    assert_eq!(framing.transport().take_transmitted(), vec![(ACK_BYTE, true)]);
}

#[test]
fn config_query() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();

    expect_ack(&framing);
    let setup = frame(vec![DEFAULT_ADDRESS | CMD_SETUP, SETUP_CONFIG_DATA, 0, 0, 0, 0]);
    sm.handle_frame(&setup, &mut framing, &mut queue, &observer);

    assert_eq!(sm.state(), State::Disabled);
    assert_eq!(
        framing.transport().take_transmitted(),
        encode_data(CONFIG_RESPONSE)
    );
}

#[test]
fn open_session_and_display() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();

    // Drive up to Enabled.
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    let enable_frame = frame(vec![DEFAULT_ADDRESS | CMD_READER, READER_ENABLE]);
    sm.handle_frame(&enable_frame, &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    assert_eq!(sm.state(), State::Enabled);

    // 32-byte display content, as in the scenario this reproduces: with it,
    // SESSION_START(3) + DISPLAY_REQUEST(2 + 32) = 37 bytes, one over
    // MAX_RESPONSE_LENGTH, so the two messages cannot coalesce into a single
    // POLL response and the session-start reply goes out alone first.
    let display = b"AMIV            1 Freibier      ";
    assert_eq!(display.len(), 32);
    state_machine::open_session(sm.state(), &mut queue, Some(display), 6000).unwrap();

    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);

    let checksum = SESSION_START.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    assert_eq!(checksum, 0x41);
    assert_eq!(
        framing.transport().take_transmitted(),
        encode_data(SESSION_START)
    );
    assert_eq!(sm.state(), State::SessionIdle);

    // The display message, still queued, is carried by the next POLL on its own.
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);

    let mut expected_display_payload = vec![0x02, (6000u32 / 100) as u8];
    expected_display_payload.extend_from_slice(display);
    assert_eq!(
        framing.transport().take_transmitted(),
        encode_data(&expected_display_payload)
    );
}

#[test]
fn vend_approve() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();

    // Drive up to SessionIdle.
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    sm.handle_frame(
        &frame(vec![DEFAULT_ADDRESS | CMD_READER, READER_ENABLE]),
        &mut framing,
        &mut queue,
        &observer,
    );
    framing.transport().take_transmitted();
    state_machine::open_session(sm.state(), &mut queue, None, 6000).unwrap();
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    assert_eq!(sm.state(), State::SessionIdle);

    let vend_request = frame(vec![DEFAULT_ADDRESS | CMD_VEND, VEND_REQUEST, 0, 0, 0x00, 0x05]);
    sm.handle_frame(&vend_request, &mut framing, &mut queue, &observer);

    assert_eq!(sm.state(), State::Vend);
    assert_eq!(
        sm.vend_request(),
        Some(VendRequest { id: 0, slot: 0x0005 })
    );
    assert_eq!(framing.transport().take_transmitted(), vec![(ACK_BYTE, true)]);

    state_machine::approve_vend(sm.state(), &mut queue, 500).unwrap();
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);

    assert_eq!(
        framing.transport().take_transmitted(),
        encode_data(&[0x05, (500u16 >> 8) as u8, (500u16 & 0xFF) as u8])
    );
}

#[test]
fn session_teardown() {
    let (mut sm, mut framing, mut queue) = new_rig();
    let observer = RecordingObserver::default();

    // Drive up to Vend.
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    sm.handle_frame(
        &frame(vec![DEFAULT_ADDRESS | CMD_READER, READER_ENABLE]),
        &mut framing,
        &mut queue,
        &observer,
    );
    framing.transport().take_transmitted();
    state_machine::open_session(sm.state(), &mut queue, None, 6000).unwrap();
    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    let vend_request = frame(vec![DEFAULT_ADDRESS | CMD_VEND, VEND_REQUEST, 0, 0, 0x00, 0x05]);
    sm.handle_frame(&vend_request, &mut framing, &mut queue, &observer);
    framing.transport().take_transmitted();
    assert_eq!(sm.state(), State::Vend);

    let vend_success = frame(vec![DEFAULT_ADDRESS | CMD_VEND, VEND_SUCCESS, 0, 0]);
    sm.handle_frame(&vend_success, &mut framing, &mut queue, &observer);

    assert_eq!(sm.state(), State::SessionIdle);
    assert_eq!(framing.transport().take_transmitted(), vec![(ACK_BYTE, true)]);
    assert_eq!(observer.results.borrow().len(), 1);
    assert!(observer.results.borrow()[0].1);

    let session_complete = frame(vec![DEFAULT_ADDRESS | CMD_VEND, VEND_SESSION_COMPLETE]);
    sm.handle_frame(&session_complete, &mut framing, &mut queue, &observer);
    assert_eq!(framing.transport().take_transmitted(), vec![(ACK_BYTE, true)]);
    assert_eq!(sm.state(), State::SessionIdle);

    expect_ack(&framing);
    sm.handle_frame(&frame(vec![DEFAULT_ADDRESS | CMD_POLL]), &mut framing, &mut queue, &observer);

    assert_eq!(
        framing.transport().take_transmitted(),
        encode_data(END_SESSION)
    );
    assert_eq!(sm.state(), State::Enabled);
}
