//! Protocol clocks.
//!
//! Everything in the crate runs on an explicit `time: f64` in seconds supplied by the
//! caller (the worker threads derive it from an `Instant`). Packets carry it modulated to
//! 16-bit milliseconds, or as a full 64-bit millisecond count when asked to.

pub type Timestamp = u16;
pub type FullTimestamp = u64;

pub fn full_timestamp(time: f64) -> FullTimestamp {
    (time.max(0.0) * 1000.0).round() as FullTimestamp
}

pub fn timestamp(time: f64) -> Timestamp {
    (full_timestamp(time) & 0xFFFF) as Timestamp
}

/// Milliseconds elapsed from `earlier` to `later`, tolerant of the 16-bit wrap.
pub fn elapsed(later: Timestamp, earlier: Timestamp) -> u16 {
    later.wrapping_sub(earlier)
}

/// Signed distance between two modulated timestamps.
pub fn offset(a: Timestamp, b: Timestamp) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}
