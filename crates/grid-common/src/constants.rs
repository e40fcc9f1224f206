//! System-wide constants.

/// Threshold above which broadcast actions are stripped.
///
/// An action whose row-id list exceeds this is broadcast with an empty
/// row-id list and empty column-value sequences (keys preserved);
/// listeners receiving a stripped action know to refetch.
pub const MAX_SMALL_ACTION_ROW_IDS: usize = 100;

/// Default high-water mark for transport drain bookkeeping (512 KiB).
///
/// While a transport's local send buffer sits at or above this, senders
/// of streaming tails wait for it to drain before producing more.
pub const DEFAULT_HIGH_WATER_MARK: usize = 512 * 1024;

/// Default poll interval for drain bookkeeping when the transport exposes
/// a buffered-byte count but no drain event (milliseconds).
pub const DEFAULT_BUFFER_TIMEOUT_MS: u64 = 250;
