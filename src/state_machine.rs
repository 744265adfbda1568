//! Cashless-device state machine: owns peripheral state, dispatches on
//! (command, subcommand), and decides what the outbound queue should carry.
//!
//! Grounded in `MDBHandler.py`'s `_handle_frame`, restructured per the
//! "dynamic dispatch on callbacks -> sum-type outcomes" design note: where
//! the original threaded an opaque `Callable[[bool], bool]` through the
//! queue, `QueuedMessage` instead carries a small enum describing what to
//! do once the handshake resolves.

use std::collections::VecDeque;

use crate::constants::*;
use crate::error::MdbError;
use crate::framing::{Clock, Framing, Transport};

/// Peripheral protocol state. Mirrors `MDBState` in the original handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Reset,
    Disabled,
    Enabled,
    SessionIdle,
    Vend,
}

/// A vend authorization request raised by a VEND_REQUEST frame. `id` is an
/// ascending counter, distinct from `slot` (the keypad/shelf slot number
/// parsed out of the frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendRequest {
    pub id: u16,
    pub slot: u16,
}

/// What to do when a queued message's handshake succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelivered {
    DoNothing,
    TransitionTo(State),
}

/// What to do when a queued message's handshake fails (NACK or timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    Discard,
    RequeueOnFail,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::RequeueOnFail
    }
}

/// A message waiting to be coalesced into a POLL response.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub on_delivered: OnDelivered,
    pub on_failure: OnFailure,
}

impl QueuedMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            on_delivered: OnDelivered::DoNothing,
            on_failure: OnFailure::RequeueOnFail,
        }
    }

    pub fn with_on_delivered(mut self, action: OnDelivered) -> Self {
        self.on_delivered = action;
        self
    }

    pub fn with_on_failure(mut self, action: OnFailure) -> Self {
        self.on_failure = action;
        self
    }
}

/// Outbound, FIFO, checksum-less message queue. The checksum and mode
/// bits are only applied once a batch is handed to `Framing`.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: QueuedMessage) -> Result<(), MdbError> {
        if message.payload.len() > MAX_RESPONSE_LENGTH {
            return Err(MdbError::MessageTooLarge {
                len: message.payload.len(),
                limit: MAX_RESPONSE_LENGTH,
            });
        }
        self.messages.push_back(message);
        Ok(())
    }

    pub fn has_queued(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Pop the maximal FIFO prefix whose combined payload length fits in
    /// `MAX_RESPONSE_LENGTH`.
    pub fn pop_batch(&mut self) -> Vec<QueuedMessage> {
        let mut batch = Vec::new();
        let mut total = 0usize;
        while let Some(front) = self.messages.front() {
            if total + front.payload.len() > MAX_RESPONSE_LENGTH {
                break;
            }
            let message = self.messages.pop_front().expect("front just peeked");
            total += message.payload.len();
            batch.push(message);
        }
        batch
    }

    /// Re-prepend the subset of `batch` whose `on_failure` policy requests
    /// a retry, preserving their original relative order at the head of
    /// the queue.
    pub fn requeue_failed(&mut self, batch: Vec<QueuedMessage>) {
        let to_retry: Vec<QueuedMessage> = batch
            .into_iter()
            .filter(|m| m.on_failure == OnFailure::RequeueOnFail)
            .collect();
        for message in to_retry.into_iter().rev() {
            self.messages.push_front(message);
        }
    }
}

/// Observer for vend lifecycle events — the "vend-request hook" the
/// purpose section describes. Implementations decide approve/deny and
/// learn the eventual outcome; they never block the protocol thread.
pub trait VendObserver: Send + Sync {
    /// A VEND_REQUEST was accepted and the device entered `Vend`.
    fn on_vend_request(&self, _request: VendRequest) {}

    /// The VMC reported VEND_SUCCESS (`dispensed = true`) or VEND_FAILURE
    /// (`dispensed = false`) for the given request.
    fn on_vend_result(&self, _request: VendRequest, _dispensed: bool) {}
}

/// No-op observer used when the caller doesn't need vend notifications.
pub struct NullVendObserver;
impl VendObserver for NullVendObserver {}

/// Dispatches validated frames and owns the peripheral's protocol state.
pub struct StateMachine {
    address: u8,
    state: State,
    vend_request: Option<VendRequest>,
    next_vend_id: u16,
}

impl StateMachine {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            state: State::Reset,
            vend_request: None,
            next_vend_id: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn vend_request(&self) -> Option<VendRequest> {
        self.vend_request
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_vend_id;
        self.next_vend_id = self.next_vend_id.wrapping_add(1);
        id
    }

    /// Handle one validated, checksum-correct frame addressed to this
    /// device. `framing` is used for replies that must be sent
    /// synchronously within this frame's transaction; `queue` collects
    /// replies that must wait for the next POLL.
    pub fn handle_frame<T: Transport, C: Clock>(
        &mut self,
        frame: &[u8],
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
        observer: &dyn VendObserver,
    ) {
        if frame[0] & 0xF8 != self.address {
            // Not addressed to us; sniffing is a future revision.
            return;
        }
        let command = frame[0] & 0x07;
        match command {
            CMD_RESET => self.handle_reset(framing, queue),
            CMD_POLL => self.handle_poll(framing, queue),
            CMD_SETUP => self.handle_setup(frame[1], framing),
            CMD_VEND => self.handle_vend(frame, framing, queue, observer),
            CMD_READER => self.handle_reader(frame[1], framing, queue),
            CMD_EXPANSION => self.handle_expansion(frame[1], framing),
            _ => {}
        }
    }

    fn out_of_sequence<T: Transport, C: Clock>(&self, framing: &mut Framing<T, C>) {
        log::warn!("out-of-sequence command in state {:?}", self.state);
        framing.send_data_and_confirm(OUT_OF_SEQUENCE);
    }

    fn handle_reset<T: Transport, C: Clock>(
        &mut self,
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
    ) {
        framing.send_ack();
        queue.clear();
        self.vend_request = None;
        self.set_state(State::Reset);
    }

    fn handle_poll<T: Transport, C: Clock>(
        &mut self,
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
    ) {
        match self.state {
            State::Reset => {
                if framing.send_data_and_confirm(JUST_RESET) {
                    self.set_state(State::Disabled);
                }
            }
            State::Disabled => framing.send_ack(),
            State::Enabled | State::SessionIdle | State::Vend => {
                if queue.has_queued() {
                    self.flush_queue(framing, queue);
                } else {
                    framing.send_ack();
                }
            }
        }
    }

    fn flush_queue<T: Transport, C: Clock>(
        &mut self,
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
    ) {
        let batch = queue.pop_batch();
        if batch.is_empty() {
            framing.send_ack();
            return;
        }
        let mut payload = Vec::new();
        for message in &batch {
            payload.extend_from_slice(&message.payload);
        }
        if framing.send_data_and_confirm(&payload) {
            for message in batch {
                if let OnDelivered::TransitionTo(state) = message.on_delivered {
                    self.set_state(state);
                }
            }
        } else {
            queue.requeue_failed(batch);
        }
    }

    fn handle_setup<T: Transport, C: Clock>(&mut self, subcommand: u8, framing: &mut Framing<T, C>) {
        if self.state == State::Reset {
            return;
        }
        match subcommand {
            SETUP_CONFIG_DATA => {
                framing.send_data_and_confirm(CONFIG_RESPONSE);
            }
            SETUP_MAX_MIN_PRICES => framing.send_ack(),
            _ => {}
        }
    }

    fn handle_expansion<T: Transport, C: Clock>(&mut self, subcommand: u8, framing: &mut Framing<T, C>) {
        if self.state == State::Reset {
            return;
        }
        if subcommand == EXPANSION_REQUEST_ID {
            framing.send_data_and_confirm(EXPANSION_ID_RESPONSE);
        }
    }

    fn handle_reader<T: Transport, C: Clock>(
        &mut self,
        subcommand: u8,
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
    ) {
        match subcommand {
            READER_ENABLE => {
                if self.state == State::Disabled {
                    framing.send_ack();
                    self.set_state(State::Enabled);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            READER_DISABLE => {
                if matches!(self.state, State::Enabled | State::SessionIdle | State::Vend) {
                    framing.send_ack();
                    queue.clear();
                    self.vend_request = None;
                    self.set_state(State::Disabled);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            READER_CANCEL => {
                if matches!(self.state, State::Enabled | State::SessionIdle | State::Vend) {
                    framing.send_data_and_confirm(READER_CANCELLED);
                    self.vend_request = None;
                    self.set_state(State::Enabled);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            _ => {}
        }
    }

    fn handle_vend<T: Transport, C: Clock>(
        &mut self,
        frame: &[u8],
        framing: &mut Framing<T, C>,
        queue: &mut OutboundQueue,
        observer: &dyn VendObserver,
    ) {
        let subcommand = frame[1];
        match subcommand {
            VEND_REQUEST => {
                if self.state == State::SessionIdle {
                    let slot = u16::from_be_bytes([frame[4], frame[5]]);
                    let request = VendRequest {
                        id: self.next_id(),
                        slot,
                    };
                    self.vend_request = Some(request);
                    self.set_state(State::Vend);
                    framing.send_ack();
                    observer.on_vend_request(request);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            VEND_CANCEL => {
                if self.state == State::Vend {
                    framing.send_ack();
                    self.vend_request = None;
                    let _ = queue.enqueue(
                        QueuedMessage::new(VEND_DENIED.to_vec())
                            .with_on_delivered(OnDelivered::TransitionTo(State::SessionIdle)),
                    );
                } else {
                    self.out_of_sequence(framing);
                }
            }
            VEND_SUCCESS => {
                if self.state == State::Vend {
                    framing.send_ack();
                    if let Some(request) = self.vend_request.take() {
                        observer.on_vend_result(request, true);
                    }
                    self.set_state(State::SessionIdle);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            VEND_FAILURE => {
                if self.state == State::Vend {
                    framing.send_ack();
                    if let Some(request) = self.vend_request.take() {
                        observer.on_vend_result(request, false);
                    }
                    self.set_state(State::SessionIdle);
                } else {
                    self.out_of_sequence(framing);
                }
            }
            VEND_SESSION_COMPLETE => {
                if self.state == State::SessionIdle {
                    framing.send_ack();
                    let _ = queue.enqueue(
                        QueuedMessage::new(END_SESSION.to_vec())
                            .with_on_delivered(OnDelivered::TransitionTo(State::Enabled)),
                    );
                } else {
                    self.out_of_sequence(framing);
                }
            }
            VEND_CASH_SALE => {
                // Out-of-band cash transaction notice; no session state to update.
                framing.send_ack();
            }
            _ => {}
        }
    }

    /// Application operation: open a session while `Enabled`. The
    /// optional display message is independent of the session-start
    /// message — see the Open Question about the original's apparently
    /// buggy nested-callback variant.
    pub fn open_session(
        &self,
        queue: &mut OutboundQueue,
        display: Option<&[u8]>,
        display_ms: u32,
    ) -> Result<(), MdbError> {
        open_session(self.state, queue, display, display_ms)
    }

    pub fn update_display(
        &self,
        queue: &mut OutboundQueue,
        content: &[u8],
        display_ms: u32,
    ) -> Result<(), MdbError> {
        update_display(self.state, queue, content, display_ms)
    }

    pub fn approve_vend(&self, queue: &mut OutboundQueue, amount: u16) -> Result<(), MdbError> {
        approve_vend(self.state, queue, amount)
    }

    pub fn deny_vend(&self, queue: &mut OutboundQueue) -> Result<(), MdbError> {
        deny_vend(self.state, queue)
    }

    pub fn cancel_session(&self, queue: &mut OutboundQueue) -> Result<(), MdbError> {
        cancel_session(self.state, queue)
    }

    pub fn close_session(&self, queue: &mut OutboundQueue) -> Result<(), MdbError> {
        close_session(self.state, queue)
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

// --- Application operations as free functions of a state snapshot ----------
//
// These take a plain `State` rather than `&StateMachine` so the
// application thread can call them against a published state snapshot
// without touching the protocol thread's authoritative `StateMachine`,
// which it never has access to — see the peripheral module's locking
// discipline notes.

fn enqueue_display(
    queue: &mut OutboundQueue,
    content: &[u8],
    display_ms: u32,
) -> Result<(), MdbError> {
    let mut payload = Vec::with_capacity(content.len() + 2);
    payload.push(0x02);
    payload.push((display_ms / 100) as u8);
    payload.extend_from_slice(content);
    queue.enqueue(QueuedMessage::new(payload))
}

pub fn open_session(
    state: State,
    queue: &mut OutboundQueue,
    display: Option<&[u8]>,
    display_ms: u32,
) -> Result<(), MdbError> {
    if state != State::Enabled {
        return Err(MdbError::NotReady);
    }
    queue.enqueue(
        QueuedMessage::new(SESSION_START.to_vec())
            .with_on_delivered(OnDelivered::TransitionTo(State::SessionIdle)),
    )?;
    if let Some(content) = display {
        enqueue_display(queue, content, display_ms)?;
    }
    Ok(())
}

pub fn update_display(
    state: State,
    queue: &mut OutboundQueue,
    content: &[u8],
    display_ms: u32,
) -> Result<(), MdbError> {
    if !matches!(state, State::SessionIdle | State::Vend) {
        return Err(MdbError::NotReady);
    }
    enqueue_display(queue, content, display_ms)
}

pub fn approve_vend(state: State, queue: &mut OutboundQueue, amount: u16) -> Result<(), MdbError> {
    if state != State::Vend {
        return Err(MdbError::NotReady);
    }
    let payload = vec![0x05, (amount >> 8) as u8, (amount & 0xFF) as u8];
    queue.enqueue(QueuedMessage::new(payload))
}

pub fn deny_vend(state: State, queue: &mut OutboundQueue) -> Result<(), MdbError> {
    if state != State::Vend {
        return Err(MdbError::NotReady);
    }
    queue.enqueue(QueuedMessage::new(VEND_DENIED.to_vec()))
}

pub fn cancel_session(state: State, queue: &mut OutboundQueue) -> Result<(), MdbError> {
    if !matches!(state, State::SessionIdle | State::Vend) {
        return Err(MdbError::NotReady);
    }
    queue.enqueue(QueuedMessage::new(vec![0x04]))
}

pub fn close_session(state: State, queue: &mut OutboundQueue) -> Result<(), MdbError> {
    if !matches!(state, State::SessionIdle | State::Vend) {
        return Err(MdbError::NotReady);
    }
    queue.enqueue(
        QueuedMessage::new(END_SESSION.to_vec())
            .with_on_delivered(OnDelivered::TransitionTo(State::Enabled)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn queue_rejects_oversize_message() {
        let mut queue = OutboundQueue::new();
        let big = vec![0u8; MAX_RESPONSE_LENGTH + 1];
        let err = queue.enqueue(QueuedMessage::new(big)).unwrap_err();
        assert!(matches!(err, MdbError::MessageTooLarge { .. }));
    }

    #[test]
    fn pop_batch_takes_maximal_prefix_under_limit() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(QueuedMessage::new(vec![0u8; 20])).unwrap();
        queue.enqueue(QueuedMessage::new(vec![0u8; 20])).unwrap();
        queue.enqueue(QueuedMessage::new(vec![0u8; 5])).unwrap();

        let batch = queue.pop_batch();
        // 20 + 20 = 40 > 36, so only the first message fits.
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.len(), 20);
        assert!(queue.has_queued());
    }

    #[test]
    fn requeue_failed_preserves_order_and_honours_discard() {
        let mut queue = OutboundQueue::new();
        let a = QueuedMessage::new(vec![1]);
        let b = QueuedMessage::new(vec![2]).with_on_failure(OnFailure::Discard);
        let c = QueuedMessage::new(vec![3]);
        queue.requeue_failed(vec![a, b, c]);

        let remaining: Vec<u8> = queue
            .pop_batch()
            .into_iter()
            .map(|m| m.payload[0])
            .collect();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[test]
    fn vend_request_parses_slot_big_endian_and_enters_vend() {
        use crate::framing::Framing;
        use crate::test_support::{FakeClock, FakeTransport};

        let mut sm = StateMachine::new(DEFAULT_ADDRESS);
        sm.state = State::SessionIdle;
        let mut queue = OutboundQueue::new();
        let observer = NullVendObserver;
        let mut framing = Framing::new(FakeTransport::new(), FakeClock::new());

        // VEND_PREFIX/VEND_REQUEST, amount bytes ignored here, slot 0x1234 big-endian.
        let frame = [0x13, VEND_REQUEST, 0x00, 0x00, 0x12, 0x34, 0x00];
        sm.handle_frame(&frame, &mut framing, &mut queue, &observer);

        assert_eq!(sm.state(), State::Vend);
        assert_eq!(sm.vend_request(), Some(VendRequest { id: 0, slot: 0x1234 }));
    }

    proptest! {
        #[test]
        fn pop_batch_is_always_the_maximal_fitting_prefix(lens in proptest::collection::vec(1usize..=MAX_RESPONSE_LENGTH, 1..8)) {
            let mut queue = OutboundQueue::new();
            for len in &lens {
                queue.enqueue(QueuedMessage::new(vec![0u8; *len])).unwrap();
            }

            let batch = queue.pop_batch();
            let total: usize = batch.iter().map(|m| m.payload.len()).sum();
            prop_assert!(total <= MAX_RESPONSE_LENGTH);

            // Every message past the batch, if any, would have overflowed
            // the limit had it been included.
            if let Some(next) = queue.pop_batch().first() {
                prop_assert!(total + next.payload.len() > MAX_RESPONSE_LENGTH);
            }
        }

        #[test]
        fn requeue_respects_each_messages_own_policy(
            keep in proptest::collection::vec(any::<bool>(), 1..6),
        ) {
            let mut queue = OutboundQueue::new();
            let batch: Vec<QueuedMessage> = keep
                .iter()
                .enumerate()
                .map(|(i, &retry)| {
                    let policy = if retry { OnFailure::RequeueOnFail } else { OnFailure::Discard };
                    QueuedMessage::new(vec![i as u8]).with_on_failure(policy)
                })
                .collect();
            queue.requeue_failed(batch);

            let remaining: Vec<u8> = queue.pop_batch().into_iter().map(|m| m.payload[0]).collect();
            let expected: Vec<u8> = keep
                .iter()
                .enumerate()
                .filter(|(_, &retry)| retry)
                .map(|(i, _)| i as u8)
                .collect();
            prop_assert_eq!(remaining, expected);
        }

        #[test]
        fn vend_request_slot_round_trips_for_any_u16(slot in any::<u16>()) {
            let mut sm = StateMachine::new(DEFAULT_ADDRESS);
            sm.state = State::SessionIdle;
            let mut queue = OutboundQueue::new();
            let observer = NullVendObserver;
            let mut framing = crate::framing::Framing::new(
                crate::test_support::FakeTransport::new(),
                crate::test_support::FakeClock::new(),
            );
            let [hi, lo] = slot.to_be_bytes();
            let frame = [0x13, VEND_REQUEST, 0x00, 0x00, hi, lo, 0x00];
            sm.handle_frame(&frame, &mut framing, &mut queue, &observer);

            prop_assert_eq!(sm.state(), State::Vend);
            prop_assert_eq!(sm.vend_request().map(|r| r.slot), Some(slot));
        }
    }

    #[test]
    fn unspecified_state_command_pairs_leave_state_unchanged() {
        // READER/CANCEL is only meaningful from Enabled/SessionIdle/Vend;
        // from Disabled it must be rejected as out-of-sequence rather than
        // silently accepted.
        let mut sm = StateMachine::new(DEFAULT_ADDRESS);
        sm.state = State::Disabled;
        let mut queue = OutboundQueue::new();
        let observer = NullVendObserver;
        let mut framing = crate::framing::Framing::new(
            crate::test_support::FakeTransport::new(),
            crate::test_support::FakeClock::new(),
        );
        framing.transport().push_incoming(&[(0x00, true)]);

        let frame = [0x14, READER_CANCEL, 0x16];
        sm.handle_frame(&frame, &mut framing, &mut queue, &observer);

        assert_eq!(sm.state(), State::Disabled);
        assert_eq!(framing.transport().take_transmitted(), crate::framing::encode_data(OUT_OF_SEQUENCE));
    }

    #[test]
    fn frames_addressed_to_another_device_are_ignored() {
        let mut sm = StateMachine::new(DEFAULT_ADDRESS);
        let mut queue = OutboundQueue::new();
        let observer = NullVendObserver;
        let mut framing = crate::framing::Framing::new(
            crate::test_support::FakeTransport::new(),
            crate::test_support::FakeClock::new(),
        );

        // Cashless device #2's address (0x18), not ours.
        let poll_for_other_device = [0x18 | CMD_POLL, 0x1A];
        sm.handle_frame(&poll_for_other_device, &mut framing, &mut queue, &observer);

        assert_eq!(sm.state(), State::Reset);
        assert!(framing.transport().take_transmitted().is_empty());
    }
}
