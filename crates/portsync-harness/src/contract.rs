//! Mutex transition contract, flattened for reporting.

use portsync_core::MutexKind;
use portsync_core::mutex::{MutexContractOp, MutexContractState, mutex_contract_transition};
use serde::Serialize;

/// Representative states reachable for `kind`. Deeper reentrant holds behave
/// like `depth: 2`.
fn states(kind: MutexKind) -> Vec<MutexContractState> {
    let mut states = vec![
        MutexContractState::Unlocked,
        MutexContractState::HeldBySelf { depth: 1 },
    ];
    if kind.is_reentrant() {
        states.push(MutexContractState::HeldBySelf { depth: 2 });
    }
    states.extend([MutexContractState::HeldByOther, MutexContractState::Freed]);
    states
}

/// One (kind, state, op) cell of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractRow {
    pub kind: &'static str,
    pub state: String,
    pub op: String,
    pub next: String,
    pub acquired: bool,
    pub blocks: bool,
    pub defined: bool,
}

/// Every cell for both mutex categories, in a stable order.
#[must_use]
pub fn contract_matrix() -> Vec<ContractRow> {
    let mut rows = Vec::new();
    for kind in [MutexKind::NonReentrant, MutexKind::Reentrant] {
        for state in states(kind) {
            for op in MutexContractOp::ALL {
                let out = mutex_contract_transition(kind, state, op);
                rows.push(ContractRow {
                    kind: kind.name(),
                    state: format!("{state:?}"),
                    op: format!("{op:?}"),
                    next: format!("{:?}", out.next),
                    acquired: out.acquired,
                    blocks: out.blocks,
                    defined: out.defined,
                });
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_covers_every_cell() {
        let rows = contract_matrix();
        assert_eq!(rows.len(), (4 + 5) * MutexContractOp::ALL.len());
        assert_eq!(rows[0].kind, "non-reentrant");
        assert_eq!(rows[0].state, "Unlocked");
        assert_eq!(rows[0].op, "Lock");
    }

    #[test]
    fn only_non_reentrant_self_relock_blocks_on_self() {
        let self_blocking: Vec<_> = contract_matrix()
            .into_iter()
            .filter(|r| r.blocks && r.state.starts_with("HeldBySelf"))
            .collect();
        assert_eq!(self_blocking.len(), 1);
        assert_eq!(self_blocking[0].kind, "non-reentrant");
        assert_eq!(self_blocking[0].op, "Lock");
    }
}
