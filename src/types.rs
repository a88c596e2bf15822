/// Small shared helpers: identity tokens and wall-clock timestamps.
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of generated instance and storage tokens.
pub const TOKEN_LENGTH: usize = 10;

/// Generate a random alphanumeric token.
///
/// Used both for the per-process instance token and for the storage token
/// persisted in the internal store. Tokens are only compared for equality.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
