//! Transport abstraction, frame reassembly and the ACK/NACK/RET handshake.
//!
//! Grounded in `MDBCommunicator.py`'s `_send`/`_collect_frame`/`_process_received_frame_data`,
//! reshaped around a generic transport split (wire format decoupled from any
//! particular UART implementation) in the spirit of `mdb-async`'s `Mdb<T>`.

use std::collections::VecDeque;
use std::time::Duration;

use crate::constants::{
    fixed_frame_length, vend_frame_length, ACK_BYTE, ACK_WINDOW_NS, CMD_VEND, NACK_BYTE, RET_BYTE,
};
use crate::error::MdbError;

/// A single 9-bit symbol as delivered by a bit-banged UART: the 8 data
/// bits plus the mode bit (`true` marks an address/status byte).
pub type Symbol = (u8, bool);

/// The bit-banged serial transport this crate drives. Implementations are
/// expected to be non-blocking on `read_symbols` (returning an empty
/// vector when nothing is pending) so the protocol thread can interleave
/// reads with the ACK-window timeout.
pub trait Transport {
    /// Open the receive GPIO for 9600 baud / 9 data bits and arm the
    /// transmit side.
    fn open(&mut self) -> Result<(), MdbError>;

    /// Release the serial port.
    fn close(&mut self);

    /// Drain whatever symbols have arrived since the last call.
    fn read_symbols(&mut self) -> Vec<Symbol>;

    /// Emit a waveform carrying the given symbols.
    fn write_symbols(&mut self, symbols: &[Symbol]);

    /// Whether a previously started waveform is still transmitting.
    fn is_tx_busy(&self) -> bool;
}

/// Wall-clock source, injected so the ACK-window timeout is testable
/// without touching real time.
pub trait Clock {
    /// Monotonic nanosecond timestamp.
    fn now_ns(&self) -> u64;

    /// Yield the thread for roughly the given duration. Real
    /// implementations sleep; a fake clock used in tests may no-op or
    /// advance its own virtual time instead.
    fn sleep(&self, duration: Duration);
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode a payload as mode-bit-tagged symbols: every payload byte with
/// mode 0, followed by the checksum with mode 1.
pub fn encode_data(payload: &[u8]) -> Vec<Symbol> {
    let mut symbols = Vec::with_capacity(payload.len() + 1);
    for byte in payload {
        symbols.push((*byte, false));
    }
    symbols.push((checksum(payload), true));
    symbols
}

/// Reassembles mode-bit-delimited MDB frames from a stream of symbols.
///
/// One instance per bus; frames are discarded (not returned) on checksum
/// mismatch or unrecognised command/subcommand, matching the original
/// `_process_received_frame_data`'s "ignore and keep going" behaviour.
pub struct FrameReassembler {
    accum: Vec<u8>,
    has_pending: bool,
    checksum: u8,
    expected_len: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self {
            accum: Vec::with_capacity(32),
            has_pending: false,
            checksum: 0,
            expected_len: 2,
        }
    }

    /// Feed one received symbol. Returns a complete, checksum-verified
    /// frame (including its trailing checksum byte) when one closes.
    pub fn feed_symbol(&mut self, data: u8, mode_bit: bool) -> Option<Vec<u8>> {
        if mode_bit {
            self.accum.clear();
            self.has_pending = true;
            self.checksum = 0;
            self.expected_len = 2;
        }
        if !self.has_pending {
            return None;
        }
        if self.accum.len() >= self.expected_len {
            // Stray byte past a frame that should already have closed; drop it.
            return None;
        }
        self.accum.push(data);

        if self.accum.len() == 2 {
            let command = self.accum[0] & 0x07;
            let resolved = if command == CMD_VEND {
                vend_frame_length(self.accum[1])
            } else {
                fixed_frame_length(command)
            };
            match resolved {
                Some(len) => self.expected_len = len,
                None => {
                    log::debug!(
                        "dropping frame with unknown command/subcommand ({:#04x}, {:#04x})",
                        self.accum[0],
                        self.accum[1]
                    );
                    self.has_pending = false;
                    self.accum.clear();
                    return None;
                }
            }
        }

        if self.accum.len() < self.expected_len {
            self.checksum = self.checksum.wrapping_add(data);
            return None;
        }

        // This byte is the trailing checksum.
        self.has_pending = false;
        if data == self.checksum {
            Some(std::mem::take(&mut self.accum))
        } else {
            log::debug!("discarding frame with bad checksum");
            self.accum.clear();
            None
        }
    }
}

/// Owns the transport and clock, and drives the request/response exchange
/// with the VMC. Intended to be owned exclusively by the protocol thread —
/// see the "Concurrency" design note on replacing `send_lock` with
/// single-writer ownership.
pub struct Framing<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    reassembler: FrameReassembler,
    /// Symbols observed during an ACK-window read past the status byte
    /// itself; these are the start of the VMC's next command and must be
    /// fed back into the reassembler ahead of the next raw transport read.
    leftover: VecDeque<Symbol>,
    ack_window_ns: u64,
}

impl<T: Transport, C: Clock> Framing<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self::with_ack_window(transport, clock, ACK_WINDOW_NS)
    }

    /// As [`Self::new`], but overriding the 5 ms default ACK/NACK/RET
    /// response window — useful for unusual bus topologies or tests.
    pub fn with_ack_window(transport: T, clock: C, ack_window_ns: u64) -> Self {
        Self {
            transport,
            clock,
            reassembler: FrameReassembler::new(),
            leftover: VecDeque::new(),
            ack_window_ns,
        }
    }

    pub fn open(&mut self) -> Result<(), MdbError> {
        self.transport.open()
    }

    /// Borrow the underlying transport, e.g. to assert against a fake's
    /// recorded traffic in a test.
    #[cfg(any(test, feature = "test-support"))]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Pull the next complete, checksum-verified frame, if any is ready.
    /// Never blocks beyond a single non-blocking transport read.
    pub fn poll_frame(&mut self) -> Option<Vec<u8>> {
        while let Some((data, mode)) = self.leftover.pop_front() {
            if let Some(frame) = self.reassembler.feed_symbol(data, mode) {
                return Some(frame);
            }
        }
        let symbols = self.transport.read_symbols();
        let mut iter = symbols.into_iter();
        for (data, mode) in iter.by_ref() {
            if let Some(frame) = self.reassembler.feed_symbol(data, mode) {
                self.leftover.extend(iter);
                return Some(frame);
            }
        }
        None
    }

    pub fn send_ack(&mut self) {
        self.transport.write_symbols(&[(ACK_BYTE, true)]);
    }

    pub fn send_nack(&mut self) {
        self.transport.write_symbols(&[(NACK_BYTE, true)]);
    }

    /// Transmit `payload` with a trailing checksum and wait up to the 5 ms
    /// ACK window for the VMC's ACK/NACK/RET. Returns `true` when the VMC
    /// ACKed (after any number of RET-triggered retransmissions).
    pub fn send_data_and_confirm(&mut self, payload: &[u8]) -> bool {
        self.transport.write_symbols(&encode_data(payload));
        self.await_handshake(payload)
    }

    fn await_handshake(&mut self, payload: &[u8]) -> bool {
        let start = self.clock.now_ns();
        loop {
            let symbols = self.transport.read_symbols();
            if !symbols.is_empty() {
                let (status, _) = symbols[0];
                self.leftover.extend(symbols[1..].iter().copied());
                return match status {
                    ACK_BYTE => true,
                    NACK_BYTE => false,
                    RET_BYTE => {
                        log::debug!("RET received, retransmitting");
                        self.transport.write_symbols(&encode_data(payload));
                        self.await_handshake(payload)
                    }
                    other => {
                        log::debug!(
                            "unexpected status byte {:#04x} in ACK window, treating as NACK",
                            other
                        );
                        false
                    }
                };
            }
            if self.clock.now_ns().saturating_sub(start) >= self.ack_window_ns {
                log::debug!("ACK window timed out, treating as NACK");
                return false;
            }
            self.clock.sleep(Duration::from_micros(100));
        }
    }
}
