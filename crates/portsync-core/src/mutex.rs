//! Mutex categories and their transition contract.
//!
//! A portsync mutex is created either reentrant (recursive) or non-reentrant,
//! and the category is fixed for the lifetime of the handle. The category
//! selects the native primitive: a recursive pthread mutex or critical section
//! for reentrant locks, a normal pthread mutex or exclusive SRW lock otherwise.

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Lock category, chosen at creation and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MutexKind {
    /// Exclusive lock; relocking from the owning thread deadlocks.
    #[default]
    NonReentrant,
    /// Recursive lock; the owner may relock and must unlock as many times.
    Reentrant,
}

impl MutexKind {
    /// Category from the boolean `reentrant` flag used at the dispatch boundary.
    #[must_use]
    pub const fn from_reentrant(reentrant: bool) -> Self {
        if reentrant {
            Self::Reentrant
        } else {
            Self::NonReentrant
        }
    }

    /// Returns true for recursive locks.
    #[must_use]
    pub const fn is_reentrant(self) -> bool {
        matches!(self, Self::Reentrant)
    }

    /// Stable lowercase name for logs and reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NonReentrant => "non-reentrant",
            Self::Reentrant => "reentrant",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition contract
// ---------------------------------------------------------------------------

/// Abstract mutex state as observed from the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexContractState {
    /// Live handle, not held by anyone.
    Unlocked,
    /// Held by the calling thread `depth` times.
    HeldBySelf { depth: u32 },
    /// Held by a different thread.
    HeldByOther,
    /// Handle has been freed (or was never created).
    Freed,
}

/// Operations a caller can apply to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexContractOp {
    Lock,
    TryLock,
    Unlock,
    Free,
}

impl MutexContractOp {
    /// Every operation, in a stable order.
    pub const ALL: [Self; 4] = [Self::Lock, Self::TryLock, Self::Unlock, Self::Free];
}

/// Deterministic result of applying an operation in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    /// State after the operation completes (or the state the caller stays in
    /// while blocked).
    pub next: MutexContractState,
    /// Whether the calling thread gained a hold on the lock.
    pub acquired: bool,
    /// Whether the call blocks awaiting another thread. A non-reentrant
    /// self-relock blocks forever.
    pub blocks: bool,
    /// False when the operation is a caller contract violation whose native
    /// behavior is undefined.
    pub defined: bool,
}

impl MutexContractOutcome {
    const fn ok(next: MutexContractState, acquired: bool) -> Self {
        Self {
            next,
            acquired,
            blocks: false,
            defined: true,
        }
    }

    const fn blocked(next: MutexContractState) -> Self {
        Self {
            next,
            acquired: false,
            blocks: true,
            defined: true,
        }
    }

    const fn undefined(next: MutexContractState) -> Self {
        Self {
            next,
            acquired: false,
            blocks: false,
            defined: false,
        }
    }
}

/// Transition contract for reentrant and non-reentrant mutexes.
#[must_use]
pub const fn mutex_contract_transition(
    kind: MutexKind,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractState as S;

    match state {
        S::Unlocked => match op {
            MutexContractOp::Lock | MutexContractOp::TryLock => {
                MutexContractOutcome::ok(S::HeldBySelf { depth: 1 }, true)
            }
            MutexContractOp::Unlock => MutexContractOutcome::undefined(S::Unlocked),
            MutexContractOp::Free => MutexContractOutcome::ok(S::Freed, false),
        },
        S::HeldBySelf { depth } => match op {
            MutexContractOp::Lock => {
                if kind.is_reentrant() {
                    MutexContractOutcome::ok(
                        S::HeldBySelf {
                            depth: depth.saturating_add(1),
                        },
                        true,
                    )
                } else {
                    MutexContractOutcome::blocked(S::HeldBySelf { depth })
                }
            }
            MutexContractOp::TryLock => {
                if kind.is_reentrant() {
                    MutexContractOutcome::ok(
                        S::HeldBySelf {
                            depth: depth.saturating_add(1),
                        },
                        true,
                    )
                } else {
                    MutexContractOutcome::ok(S::HeldBySelf { depth }, false)
                }
            }
            MutexContractOp::Unlock => {
                if depth > 1 {
                    MutexContractOutcome::ok(S::HeldBySelf { depth: depth - 1 }, false)
                } else {
                    MutexContractOutcome::ok(S::Unlocked, false)
                }
            }
            MutexContractOp::Free => MutexContractOutcome::undefined(S::Freed),
        },
        S::HeldByOther => match op {
            MutexContractOp::Lock => MutexContractOutcome::blocked(S::HeldByOther),
            MutexContractOp::TryLock => MutexContractOutcome::ok(S::HeldByOther, false),
            MutexContractOp::Unlock => MutexContractOutcome::undefined(S::HeldByOther),
            MutexContractOp::Free => MutexContractOutcome::undefined(S::Freed),
        },
        S::Freed => match op {
            MutexContractOp::Free => MutexContractOutcome::ok(S::Freed, false),
            _ => MutexContractOutcome::undefined(S::Freed),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_flag() {
        assert_eq!(MutexKind::from_reentrant(true), MutexKind::Reentrant);
        assert_eq!(MutexKind::from_reentrant(false), MutexKind::NonReentrant);
        assert!(MutexKind::Reentrant.is_reentrant());
        assert!(!MutexKind::NonReentrant.is_reentrant());
        assert_eq!(MutexKind::Reentrant.name(), "reentrant");
    }

    #[test]
    fn non_reentrant_self_relock_blocks() {
        let out = mutex_contract_transition(
            MutexKind::NonReentrant,
            MutexContractState::HeldBySelf { depth: 1 },
            MutexContractOp::Lock,
        );
        assert!(out.blocks);
        assert!(!out.acquired);
        assert!(out.defined);
        assert_eq!(out.next, MutexContractState::HeldBySelf { depth: 1 });
    }

    #[test]
    fn reentrant_nesting_requires_matching_unlocks() {
        let kind = MutexKind::Reentrant;
        let mut state = MutexContractState::Unlocked;
        for _ in 0..3 {
            let out = mutex_contract_transition(kind, state, MutexContractOp::Lock);
            assert!(out.acquired && !out.blocks);
            state = out.next;
        }
        assert_eq!(state, MutexContractState::HeldBySelf { depth: 3 });
        for expected in [
            MutexContractState::HeldBySelf { depth: 2 },
            MutexContractState::HeldBySelf { depth: 1 },
            MutexContractState::Unlocked,
        ] {
            state = mutex_contract_transition(kind, state, MutexContractOp::Unlock).next;
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn try_lock_never_blocks() {
        for kind in [MutexKind::NonReentrant, MutexKind::Reentrant] {
            for state in [
                MutexContractState::Unlocked,
                MutexContractState::HeldBySelf { depth: 1 },
                MutexContractState::HeldByOther,
            ] {
                let out = mutex_contract_transition(kind, state, MutexContractOp::TryLock);
                assert!(!out.blocks, "{kind:?} {state:?}");
            }
        }
    }

    #[test]
    fn double_free_is_a_defined_no_op() {
        let out = mutex_contract_transition(
            MutexKind::NonReentrant,
            MutexContractState::Freed,
            MutexContractOp::Free,
        );
        assert_eq!(out, MutexContractOutcome::ok(MutexContractState::Freed, false));
    }

    #[test]
    fn unlock_not_held_is_undefined() {
        for state in [MutexContractState::Unlocked, MutexContractState::HeldByOther] {
            let out =
                mutex_contract_transition(MutexKind::Reentrant, state, MutexContractOp::Unlock);
            assert!(!out.defined);
        }
    }
}
