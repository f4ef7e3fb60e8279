//! Fallback policy configuration.
//!
//! The policy is set via the `PORTSYNC_FALLBACK` environment variable:
//! - `shared` (default): when a new mutex or condition variable cannot be
//!   allocated or initialized, hand out a process-wide static fallback
//!   primitive instead. Creation never fails, but every call site that hit the
//!   fallback shares one lock.
//! - `strict`: creation panics instead of sharing a global primitive. Callers
//!   that want a recoverable error use the `try_create_*` operations.

use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted on first use.
pub const FALLBACK_POLICY_ENV: &str = "PORTSYNC_FALLBACK";

/// What `create_*` does when a dedicated primitive cannot be produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackPolicy {
    /// Substitute the shared static fallback primitive.
    #[default]
    Shared,
    /// Refuse to share: creation panics with the underlying error.
    Strict,
}

impl FallbackPolicy {
    /// Parse from string (case-insensitive). Unknown values select `Shared`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "error" | "abort" => Self::Strict,
            _ => Self::Shared,
        }
    }

    /// Canonical lowercase name, as accepted by [`Self::from_str_loose`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Strict => "strict",
        }
    }

    /// Returns true if fallback primitives may be handed out.
    #[must_use]
    pub const fn allows_fallback(self) -> bool {
        matches!(self, Self::Shared)
    }
}

// 0=unresolved, 1=Shared, 2=Strict, 255=resolving.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(POLICY_UNRESOLVED);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_SHARED: u8 = 1;
const POLICY_STRICT: u8 = 2;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: FallbackPolicy) -> u8 {
    match policy {
        FallbackPolicy::Shared => POLICY_SHARED,
        FallbackPolicy::Strict => POLICY_STRICT,
    }
}

fn u8_to_policy(v: u8) -> FallbackPolicy {
    match v {
        POLICY_STRICT => FallbackPolicy::Strict,
        _ => FallbackPolicy::Shared,
    }
}

/// Get the fallback policy (reads the environment on first call, caches after).
///
/// Resolution never blocks: a concurrent caller that observes another thread
/// mid-resolution gets `Shared`, the compatible default.
#[must_use]
pub fn fallback_policy() -> FallbackPolicy {
    let cached = CACHED_POLICY.load(Ordering::Acquire);
    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return u8_to_policy(cached);
    }
    if cached == POLICY_RESOLVING {
        return FallbackPolicy::Shared;
    }

    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_POLICY.load(Ordering::Acquire);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            u8_to_policy(v)
        } else {
            FallbackPolicy::Shared
        };
    }

    let policy = std::env::var(FALLBACK_POLICY_ENV)
        .map(|v| FallbackPolicy::from_str_loose(&v))
        .unwrap_or_default();
    // An explicit `set_fallback_policy` that raced with us wins.
    let _ = CACHED_POLICY.compare_exchange(
        POLICY_RESOLVING,
        policy_to_u8(policy),
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
    u8_to_policy(CACHED_POLICY.load(Ordering::Acquire))
}

/// Override the fallback policy for the rest of the process.
pub fn set_fallback_policy(policy: FallbackPolicy) {
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
}
