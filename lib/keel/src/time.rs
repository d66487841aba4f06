use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch. Wall-clock time only ever feeds stored
/// timestamps (join order, ban expiry); anything that measures elapsed time
/// uses `Instant` at the call site instead.
#[inline]
pub fn timestamp_secs() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        // A clock before 1970 is an operator problem; zero keeps every
        // comparison against stored timestamps well-defined.
        Err(_) => 0,
    }
}
