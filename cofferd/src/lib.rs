pub mod connection;
pub mod daemon;
pub mod restore;
pub mod sync;

use std::time::Duration;

#[cfg(test)]
mod test_store;

/// Wall-clock time in microseconds since the Unix epoch, the unit of every
/// modification time and marker exchanged with the store.
pub fn now_micros() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

pub fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}
