//! An MDB (MultiDrop Bus) Level-01 cashless peripheral.
//!
//! This crate plays the *peripheral* role (a cashless payment device)
//! rather than the VMC/master role: it answers POLL, SETUP, EXPANSION,
//! READER and VEND commands addressed to it, and gives the embedding
//! application a small thread-safe API to drive sessions and vends.
//!
//! [`CashlessPeripheral`] is the entry point. Construct it with a
//! [`Transport`] (a 9-bit bit-banged serial line) and a [`Clock`], call
//! [`CashlessPeripheral::start`], then drive sessions through
//! `open_session`/`approve_vend`/`deny_vend`/`close_session` and watch
//! `wait_for_state_change`. Implement [`VendObserver`] to be notified
//! when a vend is requested and when it resolves.

pub mod constants;
pub mod error;
pub mod framing;
pub mod peripheral;
pub mod state_machine;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::MdbError;
pub use framing::{Clock, Symbol, Transport};
pub use peripheral::{CashlessPeripheral, Config, DEFAULT_DISPLAY_MS, DEFAULT_VEND_AMOUNT};
pub use state_machine::{NullVendObserver, State, VendObserver, VendRequest};
