//! Error taxonomy for the cashless peripheral engine.

use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Framing-level nuisances (bad checksum, unknown command, ACK-window
/// timeout) are *not* represented here — they are handled locally by the
/// protocol thread and only ever reach a log line, per the error handling
/// design: the bus is noisy by nature and a single malformed frame must
/// never abort anything.
#[derive(Debug, Error)]
pub enum MdbError {
    /// An enqueued message exceeds `MAX_RESPONSE_LENGTH` (36 bytes).
    #[error("message length {len} exceeds the {limit} byte response limit")]
    MessageTooLarge { len: usize, limit: usize },

    /// The transport could not be opened or a write to it failed outright.
    #[error("transport error: {0}")]
    Transport(String),

    /// An application operation was attempted from a state that does not
    /// permit it (e.g. `approve_vend` while not in `Vend`).
    #[error("operation not valid in current state")]
    NotReady,
}
