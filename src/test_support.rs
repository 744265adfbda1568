//! In-memory fake transport and clock for deterministic tests.
//!
//! Grounded in the "Bit-bang serial abstraction" design note: the real
//! GPIO-backed implementation is out of scope for this crate (left to the
//! embedding binary), but a fake is needed to exercise `Framing` and the
//! end-to-end scenarios without real time or hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::MdbError;
use crate::framing::{Clock, Symbol, Transport};

/// A transport backed by in-memory queues. `rx` holds symbols waiting to
/// be "received" by the device under test; `tx` accumulates everything
/// the device writes, for assertions.
#[derive(Default)]
pub struct FakeTransport {
    rx: RefCell<VecDeque<Symbol>>,
    pub tx: RefCell<Vec<Symbol>>,
    opened: RefCell<bool>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue symbols as if the VMC had just sent them.
    pub fn push_incoming(&self, symbols: &[Symbol]) {
        self.rx.borrow_mut().extend(symbols.iter().copied());
    }

    /// Drain and return everything transmitted so far.
    pub fn take_transmitted(&self) -> Vec<Symbol> {
        std::mem::take(&mut *self.tx.borrow_mut())
    }
}

impl Transport for FakeTransport {
    fn open(&mut self) -> Result<(), MdbError> {
        *self.opened.borrow_mut() = true;
        Ok(())
    }

    fn close(&mut self) {
        *self.opened.borrow_mut() = false;
    }

    fn read_symbols(&mut self) -> Vec<Symbol> {
        self.rx.borrow_mut().drain(..).collect()
    }

    fn write_symbols(&mut self, symbols: &[Symbol]) {
        self.tx.borrow_mut().extend_from_slice(symbols);
    }

    fn is_tx_busy(&self) -> bool {
        false
    }
}

/// A clock with virtual, manually-advanced time. `now_ns` starts at 0 and
/// only moves forward when the code under test calls `sleep` or the test
/// calls `advance`, so ACK-window timeouts are exercised deterministically.
pub struct FakeClock {
    now: RefCell<u64>,
    /// If set, every `sleep` call also advances `now` by this many
    /// nanoseconds, letting a handshake loop converge to a timeout.
    pub autoadvance_ns: u64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: RefCell::new(0),
            autoadvance_ns: 1_000_000, // 1 ms per spin, so a 5ms window times out in 5 iterations
        }
    }

    pub fn advance(&self, ns: u64) {
        *self.now.borrow_mut() += ns;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        *self.now.borrow()
    }

    fn sleep(&self, _duration: Duration) {
        self.advance(self.autoadvance_ns);
    }
}
