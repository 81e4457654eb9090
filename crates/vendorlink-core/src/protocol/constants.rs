//! Protocol constants for the vendor peripheral link.

// ============================================================================
// Application Frame Layout
// ============================================================================

/// First start byte of every host -> device frame.
pub const FRAME_START: u8 = 0xFF;

/// Second start byte of every host -> device frame.
pub const FRAME_MARKER: u8 = 0x02;

/// Start bytes + 2-byte length + message id.
pub const HEADER_LEN: usize = 5;

/// Trailing checksum byte.
pub const CHECKSUM_LEN: usize = 1;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 50;

/// Largest complete frame on the wire.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + CHECKSUM_LEN;

// ============================================================================
// Init Handshake
// ============================================================================

/// Sequence the peripheral sends when it is ready to talk.
pub const HANDSHAKE_REQUEST: [u8; 6] = [0xFF, 0x55, 0x02, 0x00, 0xEE, 0x10];

/// Host answer to [`HANDSHAKE_REQUEST`].
pub const HANDSHAKE_RESPONSE: [u8; 6] = [0xFF, 0x02, 0x02, 0x00, 0xEE, 0xFF];

// ============================================================================
// USB Endpoint Addressing
// ============================================================================

/// Direction bit of an endpoint address (set = IN).
pub const USB_DIR_IN: u8 = 0x80;

/// Default endpoint for `bulk_transfer` when the caller gives none.
pub const DEFAULT_BULK_ENDPOINT: u8 = 0x02;

/// Default endpoint for `interrupt_transfer` when the caller gives none.
pub const DEFAULT_INTERRUPT_ENDPOINT: u8 = 0x81;

/// Max packet size assumed for stream-backed (accessory) endpoints.
pub const ACCESSORY_PACKET_SIZE: u16 = 512;

// ============================================================================
// Timing (milliseconds)
// ============================================================================

/// Opportunistic read in the background loop.
pub const READ_TIMEOUT_MS: u64 = 100;

/// Outbound bulk writes.
pub const WRITE_TIMEOUT_MS: u64 = 5000;

/// Default interrupt transfer.
pub const INTERRUPT_TIMEOUT_MS: u64 = 1000;

/// Bound on `AwaitingHandshake`.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Sleep after a failed read before retrying.
pub const ERROR_BACKOFF_MS: u64 = 200;

/// Consecutive read failures that force a disconnect.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Extra attempts for a failed protocol frame write.
pub const PROTOCOL_WRITE_RETRIES: u32 = 2;

/// Accessory reconnection attempts after an unexpected detach.
pub const RECONNECT_ATTEMPTS: u32 = 3;

/// Spacing between accessory reconnection attempts.
pub const RECONNECT_INTERVAL_MS: u64 = 2000;

/// Safety-net bound on waiting for the consumer to become ready.
pub const READY_WAIT_TIMEOUT_MS: u64 = 5000;

/// Spacing between network interface listings.
pub const NETWORK_POLL_MS: u64 = 2000;

// ============================================================================
// Accessory Session
// ============================================================================

/// Protocol string an accessory must advertise to be considered compatible.
pub const DEFAULT_ACCESSORY_PROTOCOL: &str = "com.zanis.vendor";

/// Placeholder used for descriptor strings the OS would not give us.
pub const UNKNOWN: &str = "Unknown";
