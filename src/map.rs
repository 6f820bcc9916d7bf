//! Parallel map: run one module once per element of a list.
//!
//! The `parallelflow:Map` module receives, through its lazy `FunctionPort`, a
//! module that was not evaluated locally (a [`FunctionTarget`]). For every
//! element of `InputList` the [`MapEngine`]:
//!
//! 1. checks the element's arity against the `InputPort` names and the type of
//!    every value against the target's declared input port, failing the whole
//!    map before anything is dispatched;
//! 2. clones the target, turns abstractions into groups, binds the element's
//!    values as new functions and marks the clone with `annotate_output`;
//! 3. ships the single-module pipelines to a [`WorkerPool`];
//! 4. fails with one aggregated error if any element failed, otherwise
//!    reorders each element's captured outputs into `OutputPort` order;
//! 5. merges the workers' execution records into the caller's log with fresh
//!    ids from the caller's scope.
//!
//! The `Result` output is a list with one tuple of outputs per element, in
//! input order.

use crate::compute::{ComputeContext, FunctionTarget, ModuleError};
use crate::errors::WorkflowError;
use crate::id_scope::{EntityKind, IdScope};
use crate::ids::{AnnotationId, ParamId};
use crate::interpreter::ANNOTATE_OUTPUT;
use crate::log::{ItemExec, Log, Machine};
use crate::metrics::MAP_ELEMENTS;
use crate::module::{Annotation, Module, ModuleFunction, ModuleKind, ModuleParam};
use crate::persistence::{serialize, unserialize};
use crate::pipeline::Pipeline;
use crate::port::{PortKind, PortSpec, Signature};
use crate::registry::{ModuleDescriptor, ModuleRegistry, basic};
use crate::value::Value;
use crate::worker::{WorkerPool, WorkerRequest, WorkerResponse};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use std::collections::BTreeSet;

pub const PACKAGE: &str = "parallelflow";
/// Marker annotation prepended to every merged worker record.
pub const PARALLEL_EXECUTION: &str = "parallel_execution";

#[derive(Clone, Debug)]
pub struct MapConfig {
    /// Merge the workers' execution records into the caller's log.
    pub merge_logs: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self { merge_logs: true }
    }
}

/// Outcome of one map call.
#[derive(Clone, Debug, Default)]
pub struct MapRun {
    /// One `Value::Tuple` of outputs per input element, in input order.
    pub results: Vec<Value>,
    /// Worker records, renumbered into the caller's log.
    pub execs: Vec<ItemExec>,
}

pub struct MapEngine<'a> {
    registry: &'a ModuleRegistry,
    pool: &'a dyn WorkerPool,
    config: &'a MapConfig,
}

impl<'a> MapEngine<'a> {
    #[must_use]
    pub fn new(registry: &'a ModuleRegistry, pool: &'a dyn WorkerPool, config: &'a MapConfig) -> Self {
        Self { registry, pool, config }
    }

    /// Build one worker request per element of `input_list`.
    ///
    /// # Errors
    ///
    /// Returns a structural error for an element of the wrong arity or an
    /// unknown input port, and a type mismatch for a value the target's port
    /// does not accept. No request is built in either case.
    pub fn prepare(
        &self,
        target: &FunctionTarget,
        input_ports: &[String],
        output_ports: &[String],
        input_list: &[Value],
    ) -> Result<Vec<WorkerRequest>> {
        if input_ports.is_empty() {
            bail!(WorkflowError::structure("map needs at least one input port"));
        }
        let specs = input_ports
            .iter()
            .map(|port| {
                Pipeline::port_spec_of(&target.module, port, PortKind::Input, self.registry).ok_or_else(|| {
                    WorkflowError::structure(format!(
                        "module {} ({}) has no input port '{port}'",
                        target.module.id,
                        target.module.identifier()
                    ))
                })
            })
            .collect::<Result<Vec<PortSpec>, _>>()?;

        // Check every element before building anything.
        let mut elements = Vec::with_capacity(input_list.len());
        for (i, element) in input_list.iter().enumerate() {
            let values = element_values(i, element, input_ports.len())?;
            for (value, spec) in values.iter().zip(&specs) {
                self.check_type(i, value, spec)?;
            }
            elements.push(values);
        }

        let base = flatten_abstractions(&target.module)?;
        elements
            .into_iter()
            .enumerate()
            .map(|(i, values)| -> Result<WorkerRequest> {
                let module = bind_element(&base, &specs, values, &target.inputs);
                let mut pipeline = Pipeline::new();
                pipeline.add_module(module)?;
                Ok(WorkerRequest {
                    element: i,
                    pipeline: serialize(&pipeline)?,
                    output_ports: output_ports.to_vec(),
                })
            })
            .collect()
    }

    fn check_type(&self, element: usize, value: &Value, spec: &PortSpec) -> Result<()> {
        let Some(sig) = value.infer_signature(&spec.signature) else {
            warn!(
                "element {element}: cannot infer the type of {value} for port '{}', not checking it",
                spec.name
            );
            return Ok(());
        };
        if !self.registry.are_specs_matched(&sig, &spec.signature) {
            bail!(WorkflowError::TypeMismatch {
                port: spec.name.clone(),
                message: format!(
                    "element {element}: value {value} of type {sig} does not match {}",
                    spec.signature
                ),
            });
        }
        Ok(())
    }

    /// Initialize every engine not yet initialized and run `requests`.
    ///
    /// # Errors
    ///
    /// Returns a worker error if the pool has no engines, an engine cannot be
    /// initialized, or the pool answers with the wrong number of responses.
    pub fn dispatch(&self, requests: Vec<WorkerRequest>) -> Result<Vec<WorkerResponse>> {
        let engines = self.pool.engines();
        if engines.is_empty() {
            bail!(WorkflowError::worker("no engines available"));
        }
        for engine in &engines {
            if !self.pool.is_initialized(*engine) {
                self.pool.initialize(*engine)?;
            }
        }
        let n = requests.len();
        info!("dispatching {n} map elements to {} engines", engines.len());
        let responses = self.pool.map_sync(requests)?;
        if responses.len() != n {
            bail!(WorkflowError::worker(format!(
                "sent {n} map elements but received {} results",
                responses.len()
            )));
        }
        Ok(responses)
    }

    /// Turn responses into one output tuple per element.
    ///
    /// # Errors
    ///
    /// Returns one aggregated error if any element failed, naming each failing
    /// engine; a missing-outputs error if a requested port was not captured.
    pub fn collect(&self, responses: &[WorkerResponse], output_ports: &[String]) -> Result<Vec<Value>> {
        let failures: Vec<String> = responses
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.errors.is_empty())
            .map(|(i, r)| format!("ModuleError in engine {i}: '{}'", r.errors.join(", ")))
            .collect();
        if !failures.is_empty() {
            bail!(WorkflowError::MapAggregate(failures.join("\n")));
        }

        let mut results = Vec::with_capacity(responses.len());
        for (i, r) in responses.iter().enumerate() {
            let mut found = Vec::with_capacity(output_ports.len());
            let mut missing = Vec::new();
            for port in output_ports {
                match r.ports.iter().position(|p| p == port) {
                    Some(idx) => found.push((port, idx)),
                    None => missing.push(port.clone()),
                }
            }
            if !missing.is_empty() {
                bail!(WorkflowError::MissingOutputs(missing));
            }
            let mut values = Vec::with_capacity(found.len());
            for (port, idx) in found {
                let Some(wire) = r.outputs.get(idx) else {
                    bail!(WorkflowError::worker(format!(
                        "engine {i} reported port '{port}' without a value"
                    )));
                };
                let value = wire
                    .clone()
                    .decode(self.registry)
                    .with_context(|| format!("decoding output '{port}' of engine {i}"))?;
                values.push(value);
            }
            results.push(Value::Tuple(values));
        }
        Ok(results)
    }

    /// Move the workers' execution records into `log`.
    ///
    /// Each record gets fresh ids from `log`'s scope at every nesting depth, a
    /// leading `parallel_execution` annotation, and the id of the worker's
    /// machine as recorded in `log`.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if a response carries an undecodable log
    /// or machine.
    pub fn merge_logs(&self, log: &mut Log, responses: &[WorkerResponse]) -> Result<Vec<ItemExec>> {
        let mut merged = Vec::new();
        for r in responses {
            let execs: Vec<ItemExec> = unserialize(&r.log)?;
            let machine: Machine = unserialize(&r.machine)?;
            let machine_id = log.ensure_machine(&machine);
            for mut exec in execs {
                exec.renumber(log.id_scope_mut());
                let marker = log.annotation(PARALLEL_EXECUTION, true);
                exec.annotations_mut().insert(0, marker);
                exec.set_machine_id(machine_id);
                merged.push(exec);
            }
        }
        debug!("merged {} worker execution records", merged.len());
        Ok(merged)
    }

    /// Prepare, dispatch, collect and merge.
    ///
    /// An empty `input_list` yields an empty result without touching the pool.
    ///
    /// # Errors
    ///
    /// See [`prepare`](Self::prepare), [`dispatch`](Self::dispatch),
    /// [`collect`](Self::collect) and [`merge_logs`](Self::merge_logs).
    pub fn run(
        &self,
        target: &FunctionTarget,
        input_ports: &[String],
        output_ports: &[String],
        input_list: &[Value],
        log: &mut Log,
    ) -> Result<MapRun> {
        let requests = self.prepare(target, input_ports, output_ports, input_list)?;
        if requests.is_empty() {
            return Ok(MapRun::default());
        }
        let responses = self.dispatch(requests)?;
        let results = self.collect(&responses, output_ports)?;
        let execs = if self.config.merge_logs {
            self.merge_logs(log, &responses)?
        } else {
            Vec::new()
        };
        Ok(MapRun { results, execs })
    }
}

/// Split one element into one value per input port.
fn element_values(index: usize, element: &Value, ports: usize) -> Result<Vec<Value>> {
    if ports == 1 {
        return Ok(vec![element.clone()]);
    }
    match element {
        Value::Tuple(items) | Value::List(items) if items.len() == ports => Ok(items.clone()),
        other => bail!(WorkflowError::structure(format!(
            "element {index} ({other}) does not provide one value for each of the {ports} input ports"
        ))),
    }
}

/// Copy of `module` with every abstraction, at any depth, turned into a group.
fn flatten_abstractions(module: &Module) -> Result<Module> {
    let mut out = module.clone();
    let inner = match &module.kind {
        ModuleKind::Module => return Ok(out),
        ModuleKind::Group(p) | ModuleKind::Abstraction(p) => p,
    };
    let mut flat = Pipeline::new();
    for m in inner.modules() {
        flat.add_module(flatten_abstractions(m)?)?;
    }
    for c in inner.connections() {
        flat.add_connection(c.clone())?;
    }
    if module.is_abstraction() {
        out.package = basic::PACKAGE.to_string();
        out.name = "Group".to_string();
    }
    out.kind = ModuleKind::Group(Box::new(flat));
    Ok(out)
}

/// Bind one element's values (and the target's upstream inputs) to a copy of
/// `base` and mark it for output capture.
fn bind_element(
    base: &Module,
    specs: &[PortSpec],
    values: Vec<Value>,
    upstream: &std::collections::BTreeMap<String, Vec<Value>>,
) -> Module {
    let mut module = base.clone();
    let mapped: BTreeSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    module.functions.retain(|f| !mapped.contains(f.name.as_str()));

    // Fresh ids come from a scope seeded above everything the module holds.
    let mut scope = IdScope::new();
    for f in &base.functions {
        scope.reserve(EntityKind::Function, f.id.raw());
        for p in &f.params {
            scope.reserve(EntityKind::Parameter, p.id.raw());
        }
    }
    for a in &base.annotations {
        scope.reserve(EntityKind::Annotation, a.id.raw());
    }

    let bound = upstream
        .iter()
        .filter(|(port, _)| !mapped.contains(port.as_str()))
        .flat_map(|(port, vs)| vs.first().map(|v| (port.clone(), v.clone(), None)))
        .chain(
            specs
                .iter()
                .zip(values)
                .map(|(spec, v)| (spec.name.clone(), v, Some(spec))),
        );
    for (port, value, spec) in bound {
        module.functions.retain(|f| f.name != port);
        let pos = u32::try_from(module.functions.len()).unwrap_or(u32::MAX);
        let mut function = ModuleFunction::new(scope.get_new_id(EntityKind::Function), pos, port);
        let components = match value {
            Value::Tuple(items) if spec.is_some_and(|s| s.signature.arity() > 1) => items,
            other => vec![other],
        };
        for (i, v) in components.into_iter().enumerate() {
            let type_name = spec
                .and_then(|s| s.signature.components().get(i).cloned())
                .or_else(|| v.infer_signature(&Signature::default()).and_then(|s| s.components().first().cloned()))
                .unwrap_or_else(|| basic::VARIANT.to_string());
            let param = ModuleParam {
                id: ParamId::new(scope.get_new_id(EntityKind::Parameter)),
                pos: u32::try_from(i).unwrap_or(u32::MAX),
                type_name,
                value: v,
            };
            function.add_parameter(param);
        }
        module.functions.push(function);
    }

    module.annotations.retain(|a| a.key != ANNOTATE_OUTPUT);
    module.annotations.push(Annotation {
        id: AnnotationId::new(scope.get_new_id(EntityKind::Annotation)),
        key: ANNOTATE_OUTPUT.to_string(),
        value: Value::Boolean(true),
    });
    module
}

/// Port names given as one string or a list of strings.
fn port_names(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::List(items) | Value::Tuple(items) => items.iter().map(|v| v.as_str().map(str::to_string)).collect(),
        _ => None,
    }
}

/// Compute unit of `parallelflow:Map`.
///
/// # Errors
///
/// Fails with the map's error text when anything in [`MapEngine::run`] fails.
pub fn compute_map(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let services = ctx.services();
    let Some(pool) = services.worker_pool.as_deref() else {
        return Err(ctx.error("no worker pool is available to run the map"));
    };
    let target = ctx
        .function_target("FunctionPort")
        .cloned()
        .ok_or_else(|| ctx.error("FunctionPort is not connected"))?;
    let input_ports =
        port_names(ctx.get_input("InputPort")?).ok_or_else(|| ctx.error("InputPort must name one or more ports"))?;
    let output_ports =
        port_names(ctx.get_input("OutputPort")?).ok_or_else(|| ctx.error("OutputPort must name one or more ports"))?;
    let input_list = ctx
        .get_input("InputList")?
        .as_list()
        .map(<[Value]>::to_vec)
        .ok_or_else(|| ctx.error("InputList must be a list"))?;

    let engine = MapEngine::new(ctx.registry(), pool, &services.map);
    let run = engine
        .run(&target, &input_ports, &output_ports, &input_list, ctx.log_mut())
        .map_err(|e| ctx.error(format!("{e:#}")))?;
    services.count(MAP_ELEMENTS, input_list.len() as u64);
    for exec in run.execs {
        ctx.add_exec(exec);
    }
    ctx.set_output("Result", Value::List(run.results));
    Ok(())
}

/// Descriptor of `parallelflow:Map`.
#[must_use]
pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(PACKAGE, "Map")
        .input(PortSpec::input("FunctionPort", basic::MODULE).lazy())
        .input(PortSpec::input("InputList", basic::LIST))
        .input(PortSpec::input("InputPort", basic::LIST))
        .input(PortSpec::input("OutputPort", basic::LIST))
        .output(PortSpec::output("Result", basic::LIST))
        .not_cacheable()
        .compute(compute_map)
}
