/// Wire protocol version carried in relay handshakes
pub const PROTOCOL_VERSION: &str = "/murmur/1.0.0";

/// Application name
pub const APP_NAME: &str = "Murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 / Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 detached signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Argon2id salt size in bytes
pub const SALT_SIZE: usize = 16;

/// Maximum serialized envelope size in bytes (256 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 262_144;

/// Presence announcement interval in seconds
pub const PRESENCE_INTERVAL_SECS: u64 = 5;

/// Peer time-to-live in seconds; must stay >= 3x the presence interval
pub const PEER_TTL_SECS: u64 = 30;

/// Peer expiry sweep interval in seconds
pub const EXPIRY_SWEEP_SECS: u64 = 10;

/// Inbound dedup window in seconds (5 minutes)
pub const DEDUP_WINDOW_SECS: u64 = 300;

/// Upper bound on remembered envelope ids
pub const DEDUP_CAPACITY: usize = 10_000;

/// Accepted clock skew for inbound envelopes in seconds (5 minutes)
pub const FRESHNESS_WINDOW_SECS: u64 = 300;

/// Channel open / reconnect attempt timeout in seconds
pub const CHANNEL_OPEN_TIMEOUT_SECS: u64 = 5;

/// Reconnect backoff: base delay, multiplier, cap and attempt budget
pub const RECONNECT_BASE_SECS: u64 = 1;
pub const RECONNECT_FACTOR: u32 = 2;
pub const RECONNECT_CAP_SECS: u64 = 30;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Ephemeral message sweep interval in seconds
pub const EPHEMERAL_SWEEP_SECS: u64 = 60;

/// Default relay TCP port
pub const DEFAULT_RELAY_PORT: u16 = 4040;

/// Default relay HTTP status port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DIRECT_KEY: &str = "murmur-direct-key-v1";
pub const KDF_CONTEXT_ENVELOPE_ID: &str = "murmur-envelope-id-v1";
