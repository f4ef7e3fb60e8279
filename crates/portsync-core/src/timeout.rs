//! Timeout values expressed in 100-nanosecond ticks.
//!
//! Every wait in portsync takes a duration counted in ticks of 100ns, with
//! `u64::MAX` reserved to mean "wait forever". The numeric contract is fixed:
//! callers may pass raw `u64` ticks across the dispatch boundary and get the
//! same behavior on every backend. This module converts ticks into the two
//! native forms the backends need: relative milliseconds (Windows) and an
//! absolute wall-clock deadline in seconds + nanoseconds (POSIX).

use std::time::Duration;

// ---------------------------------------------------------------------------
// Tick constants
// ---------------------------------------------------------------------------

/// Ticks per microsecond.
pub const HUNDREDS_OF_NANOS_IN_A_MICROSECOND: u64 = 10;
/// Ticks per millisecond.
pub const HUNDREDS_OF_NANOS_IN_A_MILLISECOND: u64 = 10_000;
/// Ticks per second.
pub const HUNDREDS_OF_NANOS_IN_A_SECOND: u64 = 10_000_000;
/// Length of one tick in nanoseconds.
pub const DEFAULT_TIME_UNIT_IN_NANOS: u64 = 100;
/// Reserved tick value meaning "wait indefinitely".
pub const INFINITE_TIME_VALUE: u64 = u64::MAX;

/// Win32 `INFINITE` wait value.
pub const WIN32_INFINITE_MILLIS: u32 = 0xFFFF_FFFF;

const NANOS_IN_A_SECOND: i64 = 1_000_000_000;
const MAX_FINITE_TICKS: u64 = INFINITE_TIME_VALUE - 1;

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

/// A wait duration in 100ns ticks, or the infinite sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeout(u64);

impl Timeout {
    /// Block until woken, with no deadline.
    pub const INFINITE: Self = Self(INFINITE_TIME_VALUE);
    /// Do not block past the current instant.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw tick count. `INFINITE_TIME_VALUE` is preserved as infinite.
    #[must_use]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Milliseconds to ticks, saturating at the largest finite timeout.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::saturating_finite(millis.checked_mul(HUNDREDS_OF_NANOS_IN_A_MILLISECOND))
    }

    /// `Duration` to ticks, truncating sub-tick precision and saturating at the
    /// largest finite timeout.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / u128::from(DEFAULT_TIME_UNIT_IN_NANOS);
        Self::saturating_finite(u64::try_from(ticks).ok())
    }

    const fn saturating_finite(ticks: Option<u64>) -> Self {
        match ticks {
            Some(t) if t <= MAX_FINITE_TICKS => Self(t),
            _ => Self(MAX_FINITE_TICKS),
        }
    }

    /// Raw tick count, bit-for-bit as passed across the dispatch boundary.
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// True for the "wait forever" sentinel.
    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.0 == INFINITE_TIME_VALUE
    }

    /// The finite duration, or `None` for the infinite sentinel.
    #[must_use]
    pub fn as_duration(self) -> Option<Duration> {
        if self.is_infinite() {
            return None;
        }
        let secs = self.0 / HUNDREDS_OF_NANOS_IN_A_SECOND;
        let sub_ticks = self.0 % HUNDREDS_OF_NANOS_IN_A_SECOND;
        Some(Duration::new(
            secs,
            (sub_ticks * DEFAULT_TIME_UNIT_IN_NANOS) as u32,
        ))
    }

    /// Relative milliseconds for Win32 waits.
    ///
    /// Infinite maps to `INFINITE`. Finite values truncate to whole
    /// milliseconds and clamp one below `INFINITE`, so no finite timeout can
    /// become an unbounded wait.
    #[must_use]
    pub const fn as_win32_millis(self) -> u32 {
        if self.is_infinite() {
            return WIN32_INFINITE_MILLIS;
        }
        let millis = self.0 / HUNDREDS_OF_NANOS_IN_A_MILLISECOND;
        if millis >= WIN32_INFINITE_MILLIS as u64 {
            WIN32_INFINITE_MILLIS - 1
        } else {
            millis as u32
        }
    }

    /// Absolute deadline `now + self` for POSIX timed waits.
    ///
    /// `now_secs`/`now_nanos` is the current wall-clock reading. Returns `None`
    /// for the infinite sentinel. Seconds saturate at `i64::MAX`.
    #[must_use]
    pub fn deadline_from(self, now_secs: i64, now_nanos: i64) -> Option<Deadline> {
        if self.is_infinite() {
            return None;
        }
        let add_secs = (self.0 / HUNDREDS_OF_NANOS_IN_A_SECOND) as i64;
        let add_nanos =
            ((self.0 % HUNDREDS_OF_NANOS_IN_A_SECOND) * DEFAULT_TIME_UNIT_IN_NANOS) as i64;

        let mut secs = now_secs.saturating_add(add_secs);
        let mut nanos = now_nanos.clamp(0, NANOS_IN_A_SECOND - 1) + add_nanos;
        if nanos >= NANOS_IN_A_SECOND {
            secs = secs.saturating_add(1);
            nanos -= NANOS_IN_A_SECOND;
        }
        Some(Deadline { secs, nanos })
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::INFINITE, Self::from_duration)
    }
}

/// Absolute wall-clock instant, split the way `struct timespec` is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Deadline {
    /// Whole seconds since the Unix epoch.
    pub secs: i64,
    /// Nanoseconds within the second, always in `0..1_000_000_000`.
    pub nanos: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
