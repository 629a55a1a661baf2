//! Application-wide constants.

/// Score a freshly added pod starts with.
pub const POD_SCORE_INITIAL: i32 = 100;
/// Added to a pod's score after a successful delivery.
pub const POD_SCORE_BONUS: i32 = 10;
/// Subtracted from a pod's score after a failed delivery attempt.
pub const POD_SCORE_MALUS: i32 = 10;
pub const POD_SCORE_MAX: i32 = 1000;

/// Retries after the first attempt when the caller does not configure it.
pub const DEFAULT_TX_MAX_RETRIES: u32 = 5;

/// Extension transcoded records end up with.
pub const TRANSCODED_EXTNAME: &str = ".mp4";

pub const SIGNATURE_HEADER: &str = "X-Peerpod-Signature";
pub const ORIGIN_HEADER: &str = "X-Peerpod-Origin";
pub const SIGNATURE_VERSION: &str = "v1";

pub const FEDERATION_INBOX_PATH: &str = "/api/v1/federation/inbox";
