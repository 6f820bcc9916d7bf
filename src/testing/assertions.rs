//! Assertion functions for pipelines, execution results and logs.

use crate::ids::{ExecId, MachineId};
use crate::interpreter::ExecutionResult;
use crate::log::{ItemExec, Log};
use crate::pipeline::Pipeline;
use std::collections::HashSet;

/// Assert that two pipelines are structurally equal, ignoring ids.
///
/// # Panics
///
/// Panics with both pipelines printed if they differ.
///
/// # Example
///
/// ```
/// use vistrail::testing::{PipelineBuilder, assert_pipelines_equal_no_id};
///
/// let mut a = PipelineBuilder::new();
/// a.module("basic", "Integer");
/// let mut b = PipelineBuilder::with_begin_id(40);
/// b.module("basic", "Integer");
/// assert_pipelines_equal_no_id(&a.build().unwrap(), &b.build().unwrap());
/// ```
pub fn assert_pipelines_equal_no_id(actual: &Pipeline, expected: &Pipeline) {
    assert!(
        actual.equals_no_id(expected),
        "Pipelines differ (ignoring ids):\n  Expected: {expected:#?}\n  Actual: {actual:#?}"
    );
}

/// Assert that a run finished without module errors.
///
/// # Panics
///
/// Panics listing every recorded error.
pub fn assert_no_errors(result: &ExecutionResult) {
    assert!(
        result.errors.is_empty(),
        "Execution recorded errors:\n{}",
        result
            .errors
            .iter()
            .map(|(id, e)| format!("  module {id}: {}", e.message))
            .collect::<Vec<_>>()
            .join("\n")
    );
}

/// Assert the id invariants of a log:
///
/// - workflow execs have distinct ids;
/// - item execs have distinct ids at every nesting depth;
/// - machines have distinct ids;
/// - every item exec, nested ones included, names a machine of the log.
///
/// # Panics
///
/// Panics describing the first violation found.
pub fn assert_log_ids_consistent(log: &Log) {
    let mut machines: HashSet<MachineId> = HashSet::new();
    for m in &log.machine_list {
        assert!(machines.insert(m.id), "Duplicate machine id {}", m.id);
    }

    let mut workflows: HashSet<ExecId> = HashSet::new();
    let mut items: HashSet<ExecId> = HashSet::new();
    for w in &log.workflow_execs {
        assert!(workflows.insert(w.id), "Duplicate workflow exec id {}", w.id);
        for item in w.all_item_execs() {
            assert!(
                items.insert(item.id()),
                "Duplicate item exec id {} (module {})",
                item.id(),
                item.module_id()
            );
            assert!(
                machines.contains(&item.machine_id()),
                "Item exec {} refers to machine {} which is not in the log",
                item.id(),
                item.machine_id()
            );
        }
    }
}

/// Assert that `exec` and everything nested in it ran on `machine`.
///
/// # Panics
///
/// Panics naming the first exec recorded against another machine.
pub fn assert_machine_everywhere(exec: &ItemExec, machine: MachineId) {
    for item in exec.flatten() {
        assert_eq!(
            item.machine_id(),
            machine,
            "Exec {} of module {} has machine {} instead of {machine}",
            item.id(),
            item.module_id(),
            item.machine_id()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ModuleId;
    use crate::log::{Machine, ModuleExec, WorkflowExec};

    fn exec(id: u64, machine: u64) -> ItemExec {
        ItemExec::Module(ModuleExec {
            id: ExecId::new(id),
            module_id: ModuleId::new(1),
            module_name: "Integer".into(),
            machine_id: MachineId::new(machine),
            ts_start: 0,
            ts_end: 0,
            cached: false,
            completed: true,
            error: None,
            annotations: Vec::new(),
        })
    }

    fn log_with(items: Vec<ItemExec>) -> Log {
        let mut log = Log::new();
        log.machine_list.push(Machine {
            id: MachineId::new(1),
            ..Machine::current()
        });
        log.workflow_execs.push(WorkflowExec {
            id: ExecId::new(1),
            user: None,
            vt_version: crate::ids::VersionId::new(1),
            name: None,
            ts_start: 0,
            ts_end: 0,
            completed: true,
            annotations: Vec::new(),
            item_execs: items,
        });
        log
    }

    #[test]
    fn consistent_log_passes() {
        assert_log_ids_consistent(&log_with(vec![exec(1, 1), exec(2, 1)]));
    }

    #[test]
    #[should_panic(expected = "Duplicate item exec id")]
    fn duplicate_exec_ids_fail() {
        assert_log_ids_consistent(&log_with(vec![exec(1, 1), exec(1, 1)]));
    }

    #[test]
    #[should_panic(expected = "not in the log")]
    fn unknown_machine_fails() {
        assert_log_ids_consistent(&log_with(vec![exec(1, 7)]));
    }
}
