//! MDB wire-level constants: command/subcommand bytes, frame lengths and
//! the fixed reply payloads this peripheral sends.
//!
//! Grounded in `MDBCommands.py` / `MDBCommunicator.py` from the original
//! Python implementation, cross-checked against the MDB cashless-device
//! command tables used elsewhere in the crate.

/// Default device address for cashless device #1 (`0x10`).
pub const DEFAULT_ADDRESS: u8 = 0x10;

/// Largest response this peripheral may return to a single POLL.
pub const MAX_RESPONSE_LENGTH: usize = 36;

/// Upper bound on how long the VMC is allowed to take to ACK/NACK/RET a
/// data response, in nanoseconds (5 ms).
pub const ACK_WINDOW_NS: u64 = 5_000_000;

// --- Commands (low 3 bits of the first frame byte) -------------------------

pub const CMD_RESET: u8 = 0x00;
pub const CMD_SETUP: u8 = 0x01;
pub const CMD_POLL: u8 = 0x02;
pub const CMD_VEND: u8 = 0x03;
pub const CMD_READER: u8 = 0x04;
pub const CMD_EXPANSION: u8 = 0x07;

// --- Subcommands -------------------------------------------------------------

pub const SETUP_CONFIG_DATA: u8 = 0x00;
pub const SETUP_MAX_MIN_PRICES: u8 = 0x01;

pub const VEND_REQUEST: u8 = 0x00;
pub const VEND_CANCEL: u8 = 0x01;
pub const VEND_SUCCESS: u8 = 0x02;
pub const VEND_FAILURE: u8 = 0x03;
pub const VEND_SESSION_COMPLETE: u8 = 0x04;
pub const VEND_CASH_SALE: u8 = 0x05;

pub const READER_DISABLE: u8 = 0x00;
pub const READER_ENABLE: u8 = 0x01;
pub const READER_CANCEL: u8 = 0x02;

pub const EXPANSION_REQUEST_ID: u8 = 0x00;

// --- Status bytes (never carry a checksum or address bit) -------------------

pub const ACK_BYTE: u8 = 0x00;
pub const NACK_BYTE: u8 = 0xFF;
pub const RET_BYTE: u8 = 0xAA;

/// Fixed frame length by command, for commands that do not branch on a
/// subcommand byte.
pub fn fixed_frame_length(command: u8) -> Option<usize> {
    match command {
        CMD_RESET => Some(2),
        CMD_SETUP => Some(7),
        CMD_POLL => Some(2),
        CMD_READER => Some(3),
        CMD_EXPANSION => Some(32),
        _ => None,
    }
}

/// Frame length for a VEND command, keyed on its subcommand byte.
pub fn vend_frame_length(subcommand: u8) -> Option<usize> {
    match subcommand {
        VEND_REQUEST => Some(7),
        VEND_CANCEL => Some(3),
        VEND_SUCCESS => Some(5),
        VEND_FAILURE => Some(3),
        VEND_SESSION_COMPLETE => Some(3),
        VEND_CASH_SALE => Some(7),
        _ => None,
    }
}

// --- Fixed reply payloads (checksum appended by the framing layer) ---------

/// Reply to POLL while `Reset`.
pub const JUST_RESET: &[u8] = &[0x00];

/// Reply to SETUP/CONFIG_DATA: level 1, currency 0x01F4, scale 0x01,
/// 2 decimal places, country 0x0202.
pub const CONFIG_RESPONSE: &[u8] = &[0x01, 0x01, 0x02, 0xF4, 0x01, 0x02, 0x02, 0x02];

/// Reply to EXPANSION/REQUEST_ID: peripheral ID, all fields zeroed.
pub const EXPANSION_ID_RESPONSE: &[u8] = &[
    0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Session-start reply: available credit, 13.37 (currency minor units).
pub const SESSION_START: &[u8] = &[0x03, 0x05, 0x39];

/// Reply to READER/CANCEL.
pub const READER_CANCELLED: &[u8] = &[0x08];

/// Reply to VEND/CANCEL.
pub const VEND_DENIED: &[u8] = &[0x06];

/// Reply to VEND/SESSION_COMPLETE.
pub const END_SESSION: &[u8] = &[0x07];

/// Reply to an out-of-sequence command.
pub const OUT_OF_SEQUENCE: &[u8] = &[0x0B];
