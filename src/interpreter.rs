//! Executes one pipeline snapshot.
//!
//! Modules run in topological order. A module runs once every connection into
//! it delivered a value; if anything upstream failed or was skipped, the module
//! is skipped and gets no execution record. A failing module is recorded in
//! [`ExecutionResult::errors`] and does not stop independent branches.
//!
//! Cacheable modules reuse the outputs of an earlier run with the same
//! signature: a SHA-256 digest of the module type, its bound functions and the
//! signatures of everything upstream. The cache lives as long as the
//! [`Interpreter`]; [`Interpreter::flush`] empties it.
//!
//! A module whose outgoing connections all end on lazy input ports is not
//! computed at all. It is handed, together with the values its own inputs
//! received, to the receiving module as a [`FunctionTarget`].
//!
//! Groups run their nested pipeline in place: values arriving on a group port
//! are fed to the inner `InputPort` module of the same name, and the group's
//! outputs are read from the inner `OutputPort` modules.

use crate::compute::{ComputeContext, ExecutionServices, FunctionTarget, ModuleError};
use crate::connection::Connection;
use crate::id_scope::EntityKind;
use crate::ids::{ExecId, MachineId, ModuleId, VersionId};
use crate::log::{GroupExec, ItemExec, Log, Machine, ModuleExec, WorkflowExec, timestamp_ms};
use crate::metrics::{CACHE_HITS, MODULE_ERRORS, MODULE_TIME_MS, MODULES_COMPUTED};
use crate::module::{Annotation, Module};
use crate::output::OutputSession;
use crate::pipeline::{INPUT_PORT_MODULE, OUTPUT_PORT_MODULE, Pipeline, exposed_port_name};
use crate::port::PortKind;
use crate::registry::{ModuleRegistry, basic};
use crate::value::Value;
use anyhow::{Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

/// Key of the annotation that asks for a module's outputs to be logged.
pub const ANNOTATE_OUTPUT: &str = "annotate_output";
/// Key of the annotation holding the logged outputs.
pub const OUTPUT_ANNOTATION: &str = "output";

#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    pub use_cache: bool,
    pub user: Option<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            user: std::env::var("USER").ok(),
        }
    }
}

/// What one call to [`Interpreter::execute`] produced.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub outputs: BTreeMap<ModuleId, BTreeMap<String, Value>>,
    pub errors: BTreeMap<ModuleId, ModuleError>,
    /// Modules whose compute unit ran.
    pub executed: BTreeSet<ModuleId>,
    /// Modules served from the cache.
    pub cached: BTreeSet<ModuleId>,
    /// Modules not run because something upstream failed.
    pub skipped: BTreeSet<ModuleId>,
    /// Id of the workflow exec added to the log.
    pub workflow_exec: ExecId,
    /// Files written by output modules, in order.
    pub written: Vec<PathBuf>,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn output(&self, module_id: ModuleId, port: &str) -> Option<&Value> {
        self.outputs.get(&module_id).and_then(|o| o.get(port))
    }
}

#[derive(Debug)]
pub struct Interpreter {
    config: InterpreterConfig,
    services: ExecutionServices,
    cache: HashMap<String, BTreeMap<String, Value>>,
    machine: Machine,
}

impl Interpreter {
    #[must_use]
    pub fn new(config: InterpreterConfig, services: ExecutionServices) -> Self {
        Self {
            config,
            services,
            cache: HashMap::new(),
            machine: Machine::current(),
        }
    }

    /// An interpreter that records executions as running on `machine`.
    #[must_use]
    pub fn with_machine(config: InterpreterConfig, services: ExecutionServices, machine: Machine) -> Self {
        Self {
            config,
            services,
            cache: HashMap::new(),
            machine,
        }
    }

    #[must_use]
    pub fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ExecutionServices {
        &mut self.services
    }

    #[must_use]
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Number of cached module results.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Forget every cached module result.
    pub fn flush(&mut self) {
        self.cache.clear();
    }

    /// Run `pipeline` and append one workflow exec to `log`.
    ///
    /// Module failures end up in [`ExecutionResult::errors`], not in the
    /// returned `Result`.
    ///
    /// # Errors
    ///
    /// Returns a structural error if the pipeline does not validate against
    /// `registry` or contains a cycle.
    pub fn execute(
        &mut self,
        pipeline: &Pipeline,
        registry: &ModuleRegistry,
        log: &mut Log,
        vt_version: VersionId,
    ) -> Result<ExecutionResult> {
        pipeline.validate(registry).context("validating pipeline")?;
        let machine_id = log.ensure_machine(&self.machine);
        if let Some(m) = &self.services.metrics {
            m.record_start();
        }
        let ts_start = timestamp_ms();
        let mut session = OutputSession::new();
        let mut run = Run {
            registry,
            services: &self.services,
            cache: &mut self.cache,
            use_cache: self.config.use_cache,
            machine_id,
            log: &mut *log,
            session: &mut session,
        };
        let state = run.pipeline(pipeline, None)?;

        let id = ExecId::new(log.new_id(EntityKind::WorkflowExec));
        log.add_workflow_exec(WorkflowExec {
            id,
            user: self.config.user.clone(),
            vt_version,
            name: None,
            ts_start,
            ts_end: timestamp_ms(),
            completed: state.errors.is_empty(),
            annotations: Vec::new(),
            item_execs: state.item_execs,
        });
        if let Some(m) = &self.services.metrics {
            m.record_end();
        }
        debug!(
            "workflow exec {id}: {} executed, {} cached, {} failed, {} skipped",
            state.executed.len(),
            state.cached.len(),
            state.errors.len(),
            state.skipped.len()
        );
        Ok(ExecutionResult {
            outputs: state.outputs,
            errors: state.errors,
            executed: state.executed,
            cached: state.cached,
            skipped: state.skipped,
            workflow_exec: id,
            written: session.written().to_vec(),
        })
    }
}

/// Per-pipeline evaluation state; groups get their own.
#[derive(Default)]
struct RunState {
    outputs: BTreeMap<ModuleId, BTreeMap<String, Value>>,
    errors: BTreeMap<ModuleId, ModuleError>,
    executed: BTreeSet<ModuleId>,
    cached: BTreeSet<ModuleId>,
    skipped: BTreeSet<ModuleId>,
    item_execs: Vec<ItemExec>,
    signatures: HashMap<ModuleId, String>,
    uncacheable: HashSet<ModuleId>,
    /// Modules held back for lazy ports, with the inputs they received.
    targets: HashMap<ModuleId, BTreeMap<String, Vec<Value>>>,
}

impl RunState {
    fn blocked(&self, id: ModuleId) -> bool {
        self.errors.contains_key(&id) || self.skipped.contains(&id)
    }
}

enum Inputs {
    Ready {
        values: BTreeMap<String, Vec<Value>>,
        targets: BTreeMap<String, FunctionTarget>,
    },
    Blocked,
    Failed(ModuleError),
}

struct Run<'r> {
    registry: &'r ModuleRegistry,
    services: &'r ExecutionServices,
    cache: &'r mut HashMap<String, BTreeMap<String, Value>>,
    use_cache: bool,
    machine_id: MachineId,
    log: &'r mut Log,
    session: &'r mut OutputSession,
}

impl Run<'_> {
    fn pipeline(&mut self, pipeline: &Pipeline, external: Option<&BTreeMap<String, Vec<Value>>>) -> Result<RunState> {
        let order = pipeline.topological_order()?;
        let mut state = RunState::default();
        for id in order {
            let module = pipeline.get_module(id)?;
            self.module(pipeline, module, external, &mut state);
        }
        Ok(state)
    }

    fn is_lazy(&self, pipeline: &Pipeline, c: &Connection) -> bool {
        pipeline.module(c.destination.module_id).is_some_and(|dst| {
            Pipeline::port_spec_of(dst, &c.destination.port, PortKind::Input, self.registry)
                .is_some_and(|s| s.lazy)
        })
    }

    fn gather_inputs(&self, pipeline: &Pipeline, module: &Module, state: &RunState) -> Inputs {
        let mut values: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for c in pipeline.incoming(module.id) {
            let src_id = c.source.module_id;
            if state.blocked(src_id) {
                return Inputs::Blocked;
            }
            if self.is_lazy(pipeline, c) {
                let (Some(src), Some(inputs)) = (pipeline.module(src_id), state.targets.get(&src_id)) else {
                    return Inputs::Failed(ModuleError::new(
                        module.id,
                        format!("module {src_id} connected to lazy port '{}' was not resolved", c.destination.port),
                    ));
                };
                targets.insert(
                    c.destination.port.clone(),
                    FunctionTarget {
                        module: src.clone(),
                        inputs: inputs.clone(),
                    },
                );
                continue;
            }
            let Some(v) = state.outputs.get(&src_id).and_then(|o| o.get(&c.source.port)) else {
                return Inputs::Failed(ModuleError::new(
                    module.id,
                    format!("output port '{}' of module {src_id} produced no value", c.source.port),
                ));
            };
            values.entry(c.destination.port.clone()).or_default().push(v.clone());
        }
        Inputs::Ready { values, targets }
    }

    /// Bound functions first, then connected values, then declared defaults.
    fn bind_inputs(&self, module: &Module, connected: BTreeMap<String, Vec<Value>>) -> BTreeMap<String, Vec<Value>> {
        let mut inputs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for f in &module.functions {
            if let Some(v) = f.value() {
                inputs.entry(f.name.clone()).or_default().push(v);
            }
        }
        for (port, vs) in connected {
            inputs.entry(port).or_default().extend(vs);
        }
        for spec in self.registry.input_ports(module) {
            if let Some(d) = spec.default {
                inputs.entry(spec.name).or_insert_with(|| vec![d]);
            }
        }
        inputs
    }

    fn signature(&self, pipeline: &Pipeline, module: &Module, state: &RunState) -> String {
        let mut hasher = Sha256::new();
        hasher.update(module.identifier().as_bytes());
        for f in &module.functions {
            hasher.update(b"\0f");
            hasher.update(f.name.as_bytes());
            for p in &f.params {
                hasher.update(b"\0");
                hasher.update(p.value.to_literal().as_bytes());
            }
        }
        let mut upstream: Vec<&Connection> = pipeline.incoming(module.id).collect();
        upstream.sort_by(|a, b| (&a.destination.port, a.id).cmp(&(&b.destination.port, b.id)));
        for c in upstream {
            hasher.update(b"\0c");
            hasher.update(c.destination.port.as_bytes());
            hasher.update(c.source.port.as_bytes());
            if let Some(sig) = state.signatures.get(&c.source.module_id) {
                hasher.update(sig.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    fn cacheable(&self, pipeline: &Pipeline, module: &Module, state: &RunState) -> bool {
        // group inputs arrive from outside the signature
        let external = module.package == basic::PACKAGE && module.name == INPUT_PORT_MODULE;
        let own = module.cache
            && !external
            && module.inner_pipeline().is_none()
            && self
                .registry
                .get_descriptor(&module.identifier())
                .is_ok_and(|d| d.cacheable);
        own && pipeline
            .incoming(module.id)
            .all(|c| !state.uncacheable.contains(&c.source.module_id))
    }

    fn module(
        &mut self,
        pipeline: &Pipeline,
        module: &Module,
        external: Option<&BTreeMap<String, Vec<Value>>>,
        state: &mut RunState,
    ) {
        let (connected, targets) = match self.gather_inputs(pipeline, module, state) {
            Inputs::Ready { values, targets } => (values, targets),
            Inputs::Blocked => {
                warn!("skipping module {} ({}): upstream did not complete", module.id, module.identifier());
                state.skipped.insert(module.id);
                return;
            }
            Inputs::Failed(e) => {
                self.record_failure(module, e, state);
                return;
            }
        };

        let signature = self.signature(pipeline, module, state);
        state.signatures.insert(module.id, signature.clone());
        if !self.cacheable(pipeline, module, state) {
            state.uncacheable.insert(module.id);
        }

        let (lazy, eager): (Vec<&Connection>, Vec<&Connection>) =
            pipeline.outgoing(module.id).partition(|c| self.is_lazy(pipeline, c));
        if !lazy.is_empty() {
            state.targets.insert(module.id, connected.clone());
            if eager.is_empty() {
                debug!("module {} is a function target, not computing it", module.id);
                return;
            }
        }

        let mut inputs = self.bind_inputs(module, connected);
        if module.package == basic::PACKAGE && module.name == INPUT_PORT_MODULE {
            if let (Some(ext), Some(name)) = (external, exposed_port_name(module)) {
                if let Some(vs) = ext.get(&name) {
                    inputs.insert("ExternalPipe".to_string(), vs.clone());
                }
            }
        }

        let use_cache = self.use_cache && !state.uncacheable.contains(&module.id);
        if use_cache {
            if let Some(outputs) = self.cache.get(&signature).cloned() {
                debug!("module {} ({}) served from cache", module.id, module.identifier());
                self.services.count(CACHE_HITS, 1);
                let exec = self.module_exec(module, timestamp_ms(), true, None, Vec::new());
                state.item_execs.push(ItemExec::Module(exec));
                state.cached.insert(module.id);
                state.outputs.insert(module.id, outputs);
                return;
            }
        }

        if module.inner_pipeline().is_some() {
            self.group(module, &inputs, state);
            return;
        }

        let ts_start = timestamp_ms();
        let started = Instant::now();
        let descriptor = match self.registry.get_descriptor(&module.identifier()) {
            Ok(d) => d,
            Err(e) => {
                self.record_failure(module, ModuleError::new(module.id, format!("{e:#}")), state);
                return;
            }
        };
        let Some(unit) = descriptor.compute_unit() else {
            let e = ModuleError::new(
                module.id,
                format!("module type '{}' cannot be executed", module.identifier()),
            );
            self.record_failure(module, e, state);
            return;
        };

        let mut ctx = ComputeContext::new(module, self.registry, self.services, &mut *self.log, &mut *self.session)
            .with_inputs(inputs)
            .with_function_targets(targets);
        let result = unit.compute(&mut ctx);
        let outcome = ctx.into_outcome();
        if let Some(m) = &self.services.metrics {
            m.record_value(MODULE_TIME_MS, started.elapsed().as_secs_f64() * 1000.0);
        }

        let mut annotations: Vec<Annotation> = outcome
            .annotations
            .into_iter()
            .map(|(k, v)| self.log.annotation(&k, v))
            .collect();
        match result {
            Ok(()) => {
                debug!("computed module {} ({})", module.id, module.identifier());
                self.services.count(MODULES_COMPUTED, 1);
                if wants_output_annotation(module) {
                    let pairs = outcome
                        .outputs
                        .iter()
                        .map(|(port, v)| Value::Tuple(vec![Value::from(port.as_str()), v.clone()]))
                        .collect();
                    annotations.push(self.log.annotation(OUTPUT_ANNOTATION, Value::List(pairs)));
                }
                let exec = self.module_exec(module, ts_start, false, None, annotations);
                state.item_execs.push(ItemExec::Module(exec));
                state.item_execs.extend(outcome.merged_execs);
                state.executed.insert(module.id);
                if use_cache {
                    self.cache.insert(signature, outcome.outputs.clone());
                }
                state.outputs.insert(module.id, outcome.outputs);
            }
            Err(e) => {
                warn!("module {} ({}) failed: {e}", module.id, module.identifier());
                self.services.count(MODULE_ERRORS, 1);
                let exec = self.module_exec(module, ts_start, false, Some(e.message.clone()), annotations);
                state.item_execs.push(ItemExec::Module(exec));
                state.item_execs.extend(outcome.merged_execs);
                state.errors.insert(module.id, e);
            }
        }
    }

    fn group(&mut self, module: &Module, inputs: &BTreeMap<String, Vec<Value>>, state: &mut RunState) {
        let Some(inner) = module.inner_pipeline() else {
            return;
        };
        let ts_start = timestamp_ms();
        let inner_state = match self.pipeline(inner, Some(inputs)) {
            Ok(s) => s,
            Err(e) => {
                self.record_failure(module, ModuleError::new(module.id, format!("{e:#}")), state);
                return;
            }
        };
        let error = (!inner_state.errors.is_empty()).then(|| {
            let lines: Vec<String> = inner_state
                .errors
                .iter()
                .map(|(id, e)| format!("{id}: {}", e.message))
                .collect();
            format!("Error(s) inside group:\n{}", lines.join("\n"))
        });

        let mut outputs = BTreeMap::new();
        for m in inner.modules() {
            if m.package != basic::PACKAGE || m.name != OUTPUT_PORT_MODULE {
                continue;
            }
            let value = inner_state.outputs.get(&m.id).and_then(|o| o.get("ExternalPipe"));
            if let (Some(name), Some(v)) = (exposed_port_name(m), value) {
                outputs.insert(name, v.clone());
            }
        }

        let mut annotations = Vec::new();
        if error.is_none() && wants_output_annotation(module) {
            let pairs = outputs
                .iter()
                .map(|(port, v)| Value::Tuple(vec![Value::from(port.as_str()), v.clone()]))
                .collect();
            annotations.push(self.log.annotation(OUTPUT_ANNOTATION, Value::List(pairs)));
        }
        let exec = GroupExec {
            id: ExecId::new(self.log.new_id(EntityKind::ItemExec)),
            module_id: module.id,
            group_name: module.name.clone(),
            machine_id: self.machine_id,
            ts_start,
            ts_end: timestamp_ms(),
            cached: false,
            completed: error.is_none(),
            error: error.clone(),
            annotations,
            item_execs: inner_state.item_execs,
        };
        state.item_execs.push(ItemExec::Group(exec));
        match error {
            None => {
                state.executed.insert(module.id);
                state.outputs.insert(module.id, outputs);
            }
            Some(message) => {
                warn!("group {} failed", module.id);
                state.errors.insert(module.id, ModuleError::new(module.id, message));
            }
        }
    }

    fn record_failure(&mut self, module: &Module, e: ModuleError, state: &mut RunState) {
        warn!("module {} ({}) failed: {e}", module.id, module.identifier());
        self.services.count(MODULE_ERRORS, 1);
        let exec = self.module_exec(module, timestamp_ms(), false, Some(e.message.clone()), Vec::new());
        state.item_execs.push(ItemExec::Module(exec));
        state.errors.insert(module.id, e);
    }

    fn module_exec(
        &mut self,
        module: &Module,
        ts_start: u64,
        cached: bool,
        error: Option<String>,
        annotations: Vec<Annotation>,
    ) -> ModuleExec {
        ModuleExec {
            id: ExecId::new(self.log.new_id(EntityKind::ItemExec)),
            module_id: module.id,
            module_name: module.name.clone(),
            machine_id: self.machine_id,
            ts_start,
            ts_end: timestamp_ms(),
            cached,
            completed: error.is_none(),
            error,
            annotations,
        }
    }
}

/// True when `module` carries a truthy `annotate_output` annotation.
#[must_use]
pub fn wants_output_annotation(module: &Module) -> bool {
    module.annotation(ANNOTATE_OUTPUT).is_some_and(|a| match &a.value {
        Value::Boolean(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Decode an `output` annotation into `(port, value)` pairs.
#[must_use]
pub fn output_pairs(annotation: &Annotation) -> Vec<(String, Value)> {
    let Value::List(items) = &annotation.value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Tuple(pair) if pair.len() == 2 => {
                Some((pair[0].as_str()?.to_string(), pair[1].clone()))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleFunction;
    use crate::module::ModuleParam;

    #[test]
    fn annotate_output_flag_accepts_bool_and_text() {
        let mut m = Module::new(0, basic::PACKAGE, "Float");
        assert!(!wants_output_annotation(&m));
        m.add_annotation(Annotation::new(0, ANNOTATE_OUTPUT, "True"));
        assert!(wants_output_annotation(&m));
        m.annotations[0].value = Value::Boolean(false);
        assert!(!wants_output_annotation(&m));
    }

    #[test]
    fn output_pairs_skip_malformed_items() {
        let a = Annotation::new(
            1,
            OUTPUT_ANNOTATION,
            Value::List(vec![
                Value::Tuple(vec![Value::from("value"), Value::Integer(3)]),
                Value::Integer(4),
            ]),
        );
        assert_eq!(output_pairs(&a), vec![("value".to_string(), Value::Integer(3))]);
    }

    #[test]
    fn signature_changes_with_bound_values() {
        let registry = ModuleRegistry::default();
        let services = ExecutionServices::default();
        let mut cache = HashMap::new();
        let mut log = Log::new();
        let mut session = OutputSession::new();
        let run = Run {
            registry: &registry,
            services: &services,
            cache: &mut cache,
            use_cache: true,
            machine_id: MachineId::new(0),
            log: &mut log,
            session: &mut session,
        };
        let p = Pipeline::new();
        let state = RunState::default();
        let mut m = Module::new(0, basic::PACKAGE, "Float");
        let bare = run.signature(&p, &m, &state);
        let mut f = ModuleFunction::new(0, 0, "value");
        f.add_parameter(ModuleParam::new(0, 0, basic::FLOAT, Value::Float(1.5)));
        m.add_function(f);
        let bound = run.signature(&p, &m, &state);
        assert_ne!(bare, bound);
        assert_eq!(bound, run.signature(&p, &m, &state));
    }
}
