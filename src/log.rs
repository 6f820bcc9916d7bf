//! Provenance records of workflow executions.
//!
//! A [`Log`] holds the [`Machine`]s executions ran on and one [`WorkflowExec`]
//! per pipeline run. A workflow exec lists one [`ItemExec`] per executed
//! module; group executions nest the records of their inner pipeline.
//!
//! Ids of every record are drawn from the log's own [`IdScope`], so records
//! coming from another log (a worker's, for instance) must be renumbered
//! before they are added. Every `machine_id` refers to a machine in the same
//! log's `machine_list`.

use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{AnnotationId, ExecId, MachineId, ModuleId, VersionId};
use crate::module::Annotation;
use crate::value::Value;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Host an execution ran on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub os: String,
    pub architecture: String,
    pub processor: String,
    /// Total memory in bytes.
    pub ram: u64,
}

impl Machine {
    /// Describe the host this process runs on.
    #[cfg(feature = "machine-info")]
    #[must_use]
    pub fn current() -> Self {
        use sysinfo::System;

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        Self {
            id: MachineId::new(0),
            name: System::host_name().unwrap_or_else(|| "localhost".to_string()),
            os: System::long_os_version()
                .or_else(System::name)
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            architecture: System::cpu_arch().unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            processor: sys
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            ram: sys.total_memory(),
        }
    }

    /// Describe the host this process runs on.
    #[cfg(not(feature = "machine-info"))]
    #[must_use]
    pub fn current() -> Self {
        Self {
            id: MachineId::new(0),
            name: "localhost".to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            processor: String::new(),
            ram: 0,
        }
    }

    /// Same host description, ignoring the id.
    #[must_use]
    pub fn equals_no_id(&self, other: &Self) -> bool {
        self.name == other.name
            && self.os == other.os
            && self.architecture == other.architecture
            && self.processor == other.processor
            && self.ram == other.ram
    }
}

/// Execution record of one plain module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleExec {
    pub id: ExecId,
    pub module_id: ModuleId,
    pub module_name: String,
    pub machine_id: MachineId,
    pub ts_start: u64,
    pub ts_end: u64,
    pub cached: bool,
    pub completed: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Execution record of a group, with the records of its inner modules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupExec {
    pub id: ExecId,
    pub module_id: ModuleId,
    pub group_name: String,
    pub machine_id: MachineId,
    pub ts_start: u64,
    pub ts_end: u64,
    pub cached: bool,
    pub completed: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub item_execs: Vec<ItemExec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vt_type", rename_all = "snake_case")]
pub enum ItemExec {
    Module(ModuleExec),
    Group(GroupExec),
}

impl ItemExec {
    #[must_use]
    pub fn id(&self) -> ExecId {
        match self {
            Self::Module(e) => e.id,
            Self::Group(e) => e.id,
        }
    }

    #[must_use]
    pub fn module_id(&self) -> ModuleId {
        match self {
            Self::Module(e) => e.module_id,
            Self::Group(e) => e.module_id,
        }
    }

    #[must_use]
    pub fn machine_id(&self) -> MachineId {
        match self {
            Self::Module(e) => e.machine_id,
            Self::Group(e) => e.machine_id,
        }
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        match self {
            Self::Module(e) => e.completed,
            Self::Group(e) => e.completed,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Module(e) => e.error.as_deref(),
            Self::Group(e) => e.error.as_deref(),
        }
    }

    #[must_use]
    pub fn annotations(&self) -> &[Annotation] {
        match self {
            Self::Module(e) => &e.annotations,
            Self::Group(e) => &e.annotations,
        }
    }

    pub fn annotations_mut(&mut self) -> &mut Vec<Annotation> {
        match self {
            Self::Module(e) => &mut e.annotations,
            Self::Group(e) => &mut e.annotations,
        }
    }

    /// Records nested under this one; empty for plain modules.
    #[must_use]
    pub fn item_execs(&self) -> &[ItemExec] {
        match self {
            Self::Module(_) => &[],
            Self::Group(e) => &e.item_execs,
        }
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&Annotation> {
        self.annotations().iter().find(|a| a.key == key)
    }

    /// Point this record and every record nested in it, at any depth, to
    /// `machine_id`.
    pub fn set_machine_id(&mut self, machine_id: MachineId) {
        match self {
            Self::Module(e) => e.machine_id = machine_id,
            Self::Group(e) => {
                e.machine_id = machine_id;
                for child in &mut e.item_execs {
                    child.set_machine_id(machine_id);
                }
            }
        }
    }

    /// Give this record, its annotations and every nested record fresh ids
    /// from `id_scope`.
    pub fn renumber(&mut self, id_scope: &mut IdScope) {
        let new_id = ExecId::new(id_scope.get_new_id(EntityKind::ItemExec));
        match self {
            Self::Module(e) => e.id = new_id,
            Self::Group(e) => {
                e.id = new_id;
                for child in &mut e.item_execs {
                    child.renumber(id_scope);
                }
            }
        }
        for a in self.annotations_mut() {
            a.id = AnnotationId::new(id_scope.get_new_id(EntityKind::Annotation));
        }
    }

    /// This record followed by all nested records, depth first.
    #[must_use]
    pub fn flatten(&self) -> Vec<&ItemExec> {
        let mut out = vec![self];
        for child in self.item_execs() {
            out.extend(child.flatten());
        }
        out
    }
}

/// Record of one pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExec {
    pub id: ExecId,
    pub user: Option<String>,
    pub vt_version: VersionId,
    pub name: Option<String>,
    pub ts_start: u64,
    pub ts_end: u64,
    pub completed: bool,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub item_execs: Vec<ItemExec>,
}

impl WorkflowExec {
    /// All item records of this run, nested ones included.
    #[must_use]
    pub fn all_item_execs(&self) -> Vec<&ItemExec> {
        self.item_execs.iter().flat_map(ItemExec::flatten).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    id_scope: IdScope,
    pub machine_list: Vec<Machine>,
    pub workflow_execs: Vec<WorkflowExec>,
}

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a fresh id of `kind` from this log's scope.
    pub fn new_id(&mut self, kind: EntityKind) -> u64 {
        self.id_scope.get_new_id(kind)
    }

    pub fn id_scope_mut(&mut self) -> &mut IdScope {
        &mut self.id_scope
    }

    /// Raise the scope above every id already present, e.g. after loading.
    pub fn reserve_existing_ids(&mut self) {
        for m in &self.machine_list {
            self.id_scope.reserve(EntityKind::Machine, m.id.raw());
        }
        for w in &self.workflow_execs {
            self.id_scope.reserve(EntityKind::WorkflowExec, w.id.raw());
            for a in &w.annotations {
                self.id_scope.reserve(EntityKind::Annotation, a.id.raw());
            }
            for e in w.all_item_execs() {
                self.id_scope.reserve(EntityKind::ItemExec, e.id().raw());
                for a in e.annotations() {
                    self.id_scope.reserve(EntityKind::Annotation, a.id.raw());
                }
            }
        }
    }

    /// Add `machine` as is. Its id must come from this log's scope.
    pub fn add_machine(&mut self, machine: Machine) {
        self.id_scope.reserve(EntityKind::Machine, machine.id.raw());
        self.machine_list.push(machine);
    }

    /// Id of a machine equal to `machine`, adding it with a fresh id if absent.
    pub fn ensure_machine(&mut self, machine: &Machine) -> MachineId {
        if let Some(m) = self.machine_list.iter().find(|m| m.equals_no_id(machine)) {
            return m.id;
        }
        let id = MachineId::new(self.new_id(EntityKind::Machine));
        self.machine_list.push(Machine { id, ..machine.clone() });
        id
    }

    #[must_use]
    pub fn machine(&self, id: MachineId) -> Option<&Machine> {
        self.machine_list.iter().find(|m| m.id == id)
    }

    pub fn add_workflow_exec(&mut self, exec: WorkflowExec) {
        self.workflow_execs.push(exec);
    }

    /// A new annotation with an id from this log's scope.
    pub fn annotation(&mut self, key: &str, value: impl Into<Value>) -> Annotation {
        Annotation::new(self.new_id(EntityKind::Annotation), key, value)
    }
}

/// A log shared between threads. Every mutation, and so every id allocation,
/// happens under one lock.
#[derive(Clone, Debug, Default)]
pub struct SharedLog {
    inner: Arc<Mutex<Log>>,
}

impl SharedLog {
    #[must_use]
    pub fn new(log: Log) -> Self {
        Self {
            inner: Arc::new(Mutex::new(log)),
        }
    }

    /// Run `f` with exclusive access to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if another holder panicked while holding the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Log) -> R) -> Result<R> {
        let mut guard = self.inner.lock().map_err(|_| anyhow!("log lock poisoned"))?;
        Ok(f(&mut guard))
    }

    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Log> {
        self.with(|log| log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_exec(id: u64, machine: u64) -> ItemExec {
        ItemExec::Module(ModuleExec {
            id: ExecId::new(id),
            module_id: ModuleId::new(0),
            module_name: "Float".into(),
            machine_id: MachineId::new(machine),
            ts_start: 0,
            ts_end: 0,
            cached: false,
            completed: true,
            error: None,
            annotations: vec![Annotation::new(0, "k", "v")],
        })
    }

    fn group(id: u64, children: Vec<ItemExec>) -> ItemExec {
        ItemExec::Group(GroupExec {
            id: ExecId::new(id),
            module_id: ModuleId::new(1),
            group_name: "Group".into(),
            machine_id: MachineId::new(0),
            ts_start: 0,
            ts_end: 0,
            cached: false,
            completed: true,
            error: None,
            annotations: Vec::new(),
            item_execs: children,
        })
    }

    #[test]
    fn machine_id_reaches_every_depth() {
        let mut exec = group(0, vec![group(1, vec![group(2, vec![module_exec(3, 0)])])]);
        exec.set_machine_id(MachineId::new(9));
        assert!(exec.flatten().iter().all(|e| e.machine_id() == MachineId::new(9)));
        assert_eq!(exec.flatten().len(), 4);
    }

    #[test]
    fn renumber_gives_fresh_ids() {
        let mut scope = IdScope::with_begin_id(100);
        let mut exec = group(0, vec![module_exec(0, 0), module_exec(0, 0)]);
        exec.renumber(&mut scope);
        let ids: Vec<u64> = exec.flatten().iter().map(|e| e.id().raw()).collect();
        assert_eq!(ids, vec![100, 101, 102]);
    }

    #[test]
    fn ensure_machine_reuses_equal_hosts() {
        let mut log = Log::new();
        let m = Machine::current();
        let a = log.ensure_machine(&m);
        let b = log.ensure_machine(&m);
        assert_eq!(a, b);
        assert_eq!(log.machine_list.len(), 1);
    }
}
