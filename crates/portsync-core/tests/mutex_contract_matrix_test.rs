use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use portsync_core::mutex::{
    MutexContractOp, MutexContractState, MutexKind, mutex_contract_transition,
};

#[derive(Clone, Copy)]
struct Case {
    kind: MutexKind,
    old_state: MutexContractState,
    op: MutexContractOp,
    expected_state: MutexContractState,
    expected_acquired: bool,
    expected_blocks: bool,
    expected_defined: bool,
}

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().unwrap().parent().unwrap().to_path_buf()
}

fn state_name(state: MutexContractState) -> String {
    match state {
        MutexContractState::Unlocked => "Unlocked".to_string(),
        MutexContractState::HeldBySelf { depth } => format!("HeldBySelf({depth})"),
        MutexContractState::HeldByOther => "HeldByOther".to_string(),
        MutexContractState::Freed => "Freed".to_string(),
    }
}

fn op_name(op: MutexContractOp) -> &'static str {
    match op {
        MutexContractOp::Lock => "Lock",
        MutexContractOp::TryLock => "TryLock",
        MutexContractOp::Unlock => "Unlock",
        MutexContractOp::Free => "Free",
    }
}

const fn case(
    kind: MutexKind,
    old_state: MutexContractState,
    op: MutexContractOp,
    expected_state: MutexContractState,
    expected_acquired: bool,
    expected_blocks: bool,
    expected_defined: bool,
) -> Case {
    Case {
        kind,
        old_state,
        op,
        expected_state,
        expected_acquired,
        expected_blocks,
        expected_defined,
    }
}

fn matrix_cases() -> Vec<Case> {
    use MutexContractOp as Op;
    use MutexContractState as S;
    use MutexKind::{NonReentrant, Reentrant};

    let held1 = S::HeldBySelf { depth: 1 };
    let held2 = S::HeldBySelf { depth: 2 };
    vec![
        case(NonReentrant, S::Unlocked, Op::Lock, held1, true, false, true),
        case(NonReentrant, S::Unlocked, Op::TryLock, held1, true, false, true),
        case(NonReentrant, held1, Op::Lock, held1, false, true, true),
        case(NonReentrant, held1, Op::TryLock, held1, false, false, true),
        case(NonReentrant, held1, Op::Unlock, S::Unlocked, false, false, true),
        case(NonReentrant, S::HeldByOther, Op::Lock, S::HeldByOther, false, true, true),
        case(NonReentrant, S::HeldByOther, Op::TryLock, S::HeldByOther, false, false, true),
        case(NonReentrant, S::HeldByOther, Op::Unlock, S::HeldByOther, false, false, false),
        case(NonReentrant, S::Unlocked, Op::Free, S::Freed, false, false, true),
        case(NonReentrant, S::Freed, Op::Free, S::Freed, false, false, true),
        case(NonReentrant, S::Freed, Op::Lock, S::Freed, false, false, false),
        case(Reentrant, S::Unlocked, Op::Lock, held1, true, false, true),
        case(Reentrant, held1, Op::Lock, held2, true, false, true),
        case(Reentrant, held1, Op::TryLock, held2, true, false, true),
        case(Reentrant, held2, Op::Unlock, held1, false, false, true),
        case(Reentrant, held1, Op::Unlock, S::Unlocked, false, false, true),
        case(Reentrant, S::HeldByOther, Op::Lock, S::HeldByOther, false, true, true),
        case(Reentrant, S::HeldByOther, Op::TryLock, S::HeldByOther, false, false, true),
        case(Reentrant, held1, Op::Free, S::Freed, false, false, false),
        case(Reentrant, S::Freed, Op::Free, S::Freed, false, false, true),
    ]
}

#[test]
fn contract_matrix_matches_expected_and_emits_structured_logs() {
    let root = workspace_root();
    let out_dir = root.join("target/conformance");
    fs::create_dir_all(&out_dir).expect("create target/conformance");
    let log_path = out_dir.join("mutex_contract_matrix.log.jsonl");

    let mut log_lines = Vec::new();
    let mut mismatches = Vec::new();

    for case in matrix_cases() {
        let t0 = Instant::now();
        let got = mutex_contract_transition(case.kind, case.old_state, case.op);
        let timing_ns = t0.elapsed().as_nanos();

        let ok = got.next == case.expected_state
            && got.acquired == case.expected_acquired
            && got.blocks == case.expected_blocks
            && got.defined == case.expected_defined;
        if !ok {
            mismatches.push(format!(
                "{}:{}:{} expected(next={}, acquired={}, blocks={}, defined={}) got(next={}, acquired={}, blocks={}, defined={})",
                case.kind.name(),
                state_name(case.old_state),
                op_name(case.op),
                state_name(case.expected_state),
                case.expected_acquired,
                case.expected_blocks,
                case.expected_defined,
                state_name(got.next),
                got.acquired,
                got.blocks,
                got.defined
            ));
        }

        log_lines.push(format!(
            "{{\"trace_id\":\"mutex-contract:{}:{}:{}\",\"new_state\":\"{}\",\"acquired\":{},\"blocks\":{},\"defined\":{},\"timing_ns\":{},\"status\":\"{}\"}}",
            case.kind.name(),
            state_name(case.old_state),
            op_name(case.op),
            state_name(got.next),
            got.acquired,
            got.blocks,
            got.defined,
            timing_ns,
            if ok { "ok" } else { "mismatch" }
        ));
    }

    fs::write(&log_path, format!("{}\n", log_lines.join("\n"))).expect("write jsonl log");

    assert!(
        mismatches.is_empty(),
        "contract matrix mismatch(es): {:?}",
        mismatches
    );
}

#[test]
fn every_operation_on_a_live_unlocked_handle_is_defined_except_unlock() {
    for kind in [MutexKind::NonReentrant, MutexKind::Reentrant] {
        for op in MutexContractOp::ALL {
            let got = mutex_contract_transition(kind, MutexContractState::Unlocked, op);
            assert_eq!(got.defined, op != MutexContractOp::Unlock, "{kind:?} {op:?}");
        }
    }
}
