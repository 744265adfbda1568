//! Background protocol thread plus the thread-safe handle the application
//! drives. Wires `Framing` and `StateMachine` together; the public surface
//! named in the purpose section ("a state-change notification and a
//! vend-request hook") lives here.
//!
//! Grounded in `MDBHandler`/`MDBCommunicator`'s `Thread` split, reshaped
//! around `std::sync::{Mutex, Condvar}` per the concurrency design note:
//! the protocol thread owns its `StateMachine` outright (no lock needed
//! for the dispatch itself, since it is the sole writer) and mirrors each
//! change into a small published snapshot the application thread reads —
//! this is what realises `state_lock`/`queue_lock` without ever nesting
//! `state_lock` under anything else.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{ACK_WINDOW_NS, DEFAULT_ADDRESS};
use crate::error::MdbError;
use crate::framing::{Clock, Framing, Transport};
use crate::state_machine::{
    self, NullVendObserver, OutboundQueue, State, StateMachine, VendObserver, VendRequest,
};

/// Default display duration used by `open_session`/`update_display` when
/// the caller doesn't specify one (6 s, matching the MDB convention of
/// 0.1 s display-duration units).
pub const DEFAULT_DISPLAY_MS: u32 = 6000;

/// Default vend-approval amount: "approved, amount unknown/unlimited".
pub const DEFAULT_VEND_AMOUNT: u16 = 0xFFFF;

/// Construction-time configuration for a [`CashlessPeripheral`]. Every
/// field has a sensible default so a test or an unusual bus topology can
/// override just the one it cares about without forking the crate.
pub struct Config {
    pub address: u8,
    pub ack_window_ns: u64,
    pub default_display_ms: u32,
    pub default_vend_amount: u16,
    pub vend_observer: Arc<dyn VendObserver>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            ack_window_ns: ACK_WINDOW_NS,
            default_display_ms: DEFAULT_DISPLAY_MS,
            default_vend_amount: DEFAULT_VEND_AMOUNT,
            vend_observer: Arc::new(NullVendObserver),
        }
    }
}

/// The authoritative state plus a generation counter bumped on every
/// change, so a waiter can distinguish a real state change from a
/// `Condvar` spurious wakeup.
struct StateCell {
    state: State,
    generation: u64,
}

fn encode_state(state: State) -> u8 {
    match state {
        State::Reset => 0,
        State::Disabled => 1,
        State::Enabled => 2,
        State::SessionIdle => 3,
        State::Vend => 4,
    }
}

fn decode_state(byte: u8) -> State {
    match byte {
        0 => State::Reset,
        1 => State::Disabled,
        2 => State::Enabled,
        3 => State::SessionIdle,
        _ => State::Vend,
    }
}

struct Shared {
    state_lock: Mutex<StateCell>,
    state_cv: Condvar,
    /// Lock-free snapshot of `state_lock.state`, kept in step with it under
    /// the same critical section, for callers that only want to poll the
    /// current state without touching the condvar's mutex.
    state_snapshot: AtomicU8,
    queue_lock: Mutex<OutboundQueue>,
    vend_lock: Mutex<Option<VendRequest>>,
    exit_flag: AtomicBool,
    address: u8,
    default_display_ms: u32,
    default_vend_amount: u16,
    observer: Arc<dyn VendObserver>,
}

impl Shared {
    fn publish(&self, sm: &StateMachine) {
        *self.vend_lock.lock().unwrap() = sm.vend_request();
        let mut guard = self.state_lock.lock().unwrap();
        if guard.state != sm.state() {
            guard.state = sm.state();
            guard.generation = guard.generation.wrapping_add(1);
            self.state_snapshot
                .store(encode_state(guard.state), Ordering::Release);
            // Notify while still holding `state_lock`, so the mutation and
            // the wakeup are ordered inside one critical section and no
            // waiter can miss this change between the two.
            self.state_cv.notify_all();
        }
    }
}

/// The crate's single public entry point: a cashless peripheral that owns
/// a background protocol thread and exposes thread-safe session/vend
/// operations plus a state-change signal to the application.
pub struct CashlessPeripheral<T: Transport + Send + 'static, C: Clock + Send + 'static> {
    shared: Arc<Shared>,
    framing: Mutex<Option<Framing<T, C>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + Send + 'static, C: Clock + Send + 'static> CashlessPeripheral<T, C> {
    /// Open the transport at the default address (`0x10`) with no vend
    /// observer. Transport open failures are propagated here — the
    /// device never enters `Reset` on a failed open.
    pub fn new(transport: T, clock: C) -> Result<Self, MdbError> {
        Self::with_config(transport, clock, Config::default())
    }

    /// As [`Self::new`], but at the given device address.
    pub fn with_address(transport: T, clock: C, address: u8) -> Result<Self, MdbError> {
        Self::with_config(
            transport,
            clock,
            Config {
                address,
                ..Config::default()
            },
        )
    }

    pub fn with_config(transport: T, clock: C, config: Config) -> Result<Self, MdbError> {
        let mut framing = Framing::with_ack_window(transport, clock, config.ack_window_ns);
        framing.open()?;
        Ok(Self {
            shared: Arc::new(Shared {
                state_lock: Mutex::new(StateCell {
                    state: State::Reset,
                    generation: 0,
                }),
                state_cv: Condvar::new(),
                state_snapshot: AtomicU8::new(encode_state(State::Reset)),
                queue_lock: Mutex::new(OutboundQueue::new()),
                vend_lock: Mutex::new(None),
                exit_flag: AtomicBool::new(false),
                address: config.address,
                default_display_ms: config.default_display_ms,
                default_vend_amount: config.default_vend_amount,
                observer: config.vend_observer,
            }),
            framing: Mutex::new(Some(framing)),
            thread: Mutex::new(None),
        })
    }

    /// Spawn the protocol thread. Calling this twice without an
    /// intervening `exit()` returns `MdbError::NotReady`.
    pub fn start(&self) -> Result<(), MdbError> {
        let framing = self
            .framing
            .lock()
            .unwrap()
            .take()
            .ok_or(MdbError::NotReady)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("mdb-protocol".into())
            .spawn(move || run(shared, framing))
            .map_err(|e| MdbError::Transport(e.to_string()))?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signal the protocol thread to shut down and wait for it to finish
    /// the reset handshake described in the concurrency design.
    pub fn exit(&self) {
        self.shared.exit_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Lock-free snapshot of the current state; may be one `publish` call
    /// stale relative to `wait_for_state_change`, which is exact.
    pub fn get_state(&self) -> State {
        decode_state(self.shared.state_snapshot.load(Ordering::Acquire))
    }

    pub fn get_vend_request(&self) -> Option<VendRequest> {
        *self.shared.vend_lock.lock().unwrap()
    }

    /// Park until the next state change, returning the new state. Guards
    /// against `Condvar` spurious wakeups by looping on the generation
    /// counter `publish` bumps under `state_lock`, rather than trusting a
    /// single `wait` to mean a change actually happened.
    pub fn wait_for_state_change(&self) -> State {
        let mut guard = self.shared.state_lock.lock().unwrap();
        let start_generation = guard.generation;
        while guard.generation == start_generation {
            guard = self.shared.state_cv.wait(guard).unwrap();
        }
        guard.state
    }

    /// As [`Self::wait_for_state_change`], but gives up after `timeout`.
    pub fn wait_for_state_change_timeout(&self, timeout: Duration) -> Option<State> {
        let mut guard = self.shared.state_lock.lock().unwrap();
        let start_generation = guard.generation;
        let deadline = Instant::now() + timeout;
        while guard.generation == start_generation {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next_guard, result) =
                self.shared.state_cv.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if result.timed_out() && guard.generation == start_generation {
                return None;
            }
        }
        Some(guard.state)
    }

    pub fn open_session(
        &self,
        display: Option<&[u8]>,
        display_ms: Option<u32>,
    ) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::open_session(
            state,
            &mut queue,
            display,
            display_ms.unwrap_or(self.shared.default_display_ms),
        )
    }

    pub fn update_display(
        &self,
        content: &[u8],
        display_ms: Option<u32>,
    ) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::update_display(
            state,
            &mut queue,
            content,
            display_ms.unwrap_or(self.shared.default_display_ms),
        )
    }

    pub fn approve_vend(&self, amount: Option<u16>) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::approve_vend(
            state,
            &mut queue,
            amount.unwrap_or(self.shared.default_vend_amount),
        )
    }

    pub fn deny_vend(&self) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::deny_vend(state, &mut queue)
    }

    pub fn cancel_session(&self) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::cancel_session(state, &mut queue)
    }

    pub fn close_session(&self) -> Result<(), MdbError> {
        let state = self.get_state();
        let mut queue = self.shared.queue_lock.lock().unwrap();
        state_machine::close_session(state, &mut queue)
    }
}

fn run<T: Transport, C: Clock>(shared: Arc<Shared>, mut framing: Framing<T, C>) {
    let mut state_machine = StateMachine::new(shared.address);
    loop {
        if shared.exit_flag.load(Ordering::Acquire) {
            break;
        }
        match framing.poll_frame() {
            Some(frame) => {
                let mut queue = shared.queue_lock.lock().unwrap();
                state_machine.handle_frame(
                    &frame,
                    &mut framing,
                    &mut queue,
                    shared.observer.as_ref(),
                );
                drop(queue);
                shared.publish(&state_machine);
            }
            None => thread::yield_now(),
        }
    }
    shutdown(&shared, &mut framing);
}

fn shutdown<T: Transport, C: Clock>(shared: &Shared, framing: &mut Framing<T, C>) {
    loop {
        if let Some(frame) = framing.poll_frame() {
            if frame[0] & 0xF8 == shared.address {
                break;
            }
        }
    }
    framing.send_data_and_confirm(crate::constants::JUST_RESET);
    framing.close();
}
