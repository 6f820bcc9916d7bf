//! The contract between the interpreter and module implementations.
//!
//! Every executable module type carries a [`Compute`] unit in its registry
//! descriptor. The interpreter gathers the module's inputs (bound functions,
//! values delivered by upstream connections, declared defaults) into a
//! [`ComputeContext`], runs the unit, and reads outputs and annotations back
//! out of the context.
//!
//! A failing compute unit returns a [`ModuleError`]. The interpreter records
//! it against the module and carries on with the independent parts of the
//! pipeline.

use crate::ids::ModuleId;
use crate::log::{ItemExec, Log};
use crate::metrics::MetricsCollector;
use crate::module::Module;
use crate::output::{OutputSession, OutputSettings};
use crate::registry::ModuleRegistry;
use crate::value::Value;
use crate::worker::WorkerPool;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "parallel-map")]
use crate::map::MapConfig;

/// Failure of one module's compute unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ModuleError {
    pub module_id: ModuleId,
    pub message: String,
}

impl ModuleError {
    pub fn new(module_id: ModuleId, message: impl Into<String>) -> Self {
        Self {
            module_id,
            message: message.into(),
        }
    }
}

/// A module implementation.
pub trait Compute: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ModuleError`] when the module cannot produce its outputs.
    fn compute(&self, ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError>;
}

impl<F> Compute for F
where
    F: Fn(&mut ComputeContext<'_>) -> Result<(), ModuleError> + Send + Sync,
{
    fn compute(&self, ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
        self(ctx)
    }
}

/// A module handed to a lazy input port instead of being evaluated.
///
/// `inputs` holds the values its connected upstream modules produced, so the
/// receiver can run the module later without evaluating that upstream again.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionTarget {
    pub module: Module,
    pub inputs: BTreeMap<String, Vec<Value>>,
}

/// Services available to compute units during one run.
#[derive(Clone, Default)]
pub struct ExecutionServices {
    pub worker_pool: Option<Arc<dyn WorkerPool>>,
    #[cfg(feature = "parallel-map")]
    pub map: MapConfig,
    pub output: OutputSettings,
    pub metrics: Option<MetricsCollector>,
}

impl Debug for ExecutionServices {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("ExecutionServices")
            .field("worker_pool", &self.worker_pool.as_ref().map(|p| p.engines().len()))
            .field("output", &self.output)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionServices {
    #[must_use]
    pub fn with_worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputSettings) -> Self {
        self.output = output;
        self
    }

    pub(crate) fn count(&self, name: &str, value: u64) {
        if let Some(m) = &self.metrics {
            m.increment_counter(name, value);
        }
    }
}

/// What a compute unit left behind.
#[derive(Debug, Default)]
pub struct ComputeOutcome {
    pub outputs: BTreeMap<String, Value>,
    pub annotations: Vec<(String, Value)>,
    /// Execution records produced elsewhere on this module's behalf.
    pub merged_execs: Vec<ItemExec>,
}

/// Inputs, outputs and services of one module execution.
pub struct ComputeContext<'a> {
    module: &'a Module,
    registry: &'a ModuleRegistry,
    services: &'a ExecutionServices,
    log: &'a mut Log,
    session: &'a mut OutputSession,
    inputs: BTreeMap<String, Vec<Value>>,
    function_targets: BTreeMap<String, FunctionTarget>,
    outcome: ComputeOutcome,
}

impl<'a> ComputeContext<'a> {
    pub fn new(
        module: &'a Module,
        registry: &'a ModuleRegistry,
        services: &'a ExecutionServices,
        log: &'a mut Log,
        session: &'a mut OutputSession,
    ) -> Self {
        Self {
            module,
            registry,
            services,
            log,
            session,
            inputs: BTreeMap::new(),
            function_targets: BTreeMap::new(),
            outcome: ComputeOutcome::default(),
        }
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: BTreeMap<String, Vec<Value>>) -> Self {
        self.inputs = inputs;
        self
    }

    #[must_use]
    pub fn with_function_targets(mut self, targets: BTreeMap<String, FunctionTarget>) -> Self {
        self.function_targets = targets;
        self
    }

    #[must_use]
    pub fn into_outcome(self) -> ComputeOutcome {
        self.outcome
    }

    #[must_use]
    pub fn module(&self) -> &Module {
        self.module
    }

    #[must_use]
    pub fn registry(&self) -> &'a ModuleRegistry {
        self.registry
    }

    #[must_use]
    pub fn services(&self) -> &'a ExecutionServices {
        self.services
    }

    #[must_use]
    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.get(port).is_some_and(|v| !v.is_empty())
    }

    /// First value delivered to `port`.
    ///
    /// # Errors
    ///
    /// Returns a module error if nothing was delivered.
    pub fn get_input(&self, port: &str) -> Result<&Value, ModuleError> {
        self.try_get_input(port)
            .ok_or_else(|| self.error(format!("Missing value from port {port}")))
    }

    #[must_use]
    pub fn try_get_input(&self, port: &str) -> Option<&Value> {
        self.inputs.get(port).and_then(|v| v.first())
    }

    /// Every value delivered to `port`, in connection order.
    #[must_use]
    pub fn get_input_list(&self, port: &str) -> &[Value] {
        self.inputs.get(port).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn force_get_input(&self, port: &str, default: Value) -> Value {
        self.try_get_input(port).cloned().unwrap_or(default)
    }

    /// The module connected to the lazy input `port`.
    #[must_use]
    pub fn function_target(&self, port: &str) -> Option<&FunctionTarget> {
        self.function_targets.get(port)
    }

    pub fn set_output(&mut self, port: impl Into<String>, value: Value) {
        self.outcome.outputs.insert(port.into(), value);
    }

    /// Attach an annotation to this module's execution record.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.outcome.annotations.push((key.into(), value.into()));
    }

    /// Add a record to the log after this module's own.
    pub fn add_exec(&mut self, exec: ItemExec) {
        self.outcome.merged_execs.push(exec);
    }

    pub fn log_mut(&mut self) -> &mut Log {
        self.log
    }

    #[must_use]
    pub fn output_settings(&self) -> &'a OutputSettings {
        &self.services.output
    }

    pub fn output_session(&mut self) -> &mut OutputSession {
        self.session
    }

    /// A [`ModuleError`] for this module.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> ModuleError {
        ModuleError::new(self.module.id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::basic;

    #[test]
    fn closures_are_compute_units() {
        let double = |ctx: &mut ComputeContext<'_>| -> Result<(), ModuleError> {
            let v = ctx
                .get_input("value")?
                .as_i64()
                .ok_or_else(|| ctx.error("not an integer"))?;
            ctx.set_output("value", Value::Integer(v * 2));
            Ok(())
        };
        let module = Module::new(4, basic::PACKAGE, "Integer");
        let registry = ModuleRegistry::default();
        let services = ExecutionServices::default();
        let mut log = Log::new();
        let mut session = OutputSession::new();
        let mut inputs = BTreeMap::new();
        inputs.insert("value".to_string(), vec![Value::Integer(21)]);
        let mut ctx =
            ComputeContext::new(&module, &registry, &services, &mut log, &mut session).with_inputs(inputs);
        double.compute(&mut ctx).unwrap();
        assert_eq!(ctx.into_outcome().outputs["value"], Value::Integer(42));
    }

    #[test]
    fn missing_input_names_port_and_module() {
        let module = Module::new(9, basic::PACKAGE, "String");
        let registry = ModuleRegistry::default();
        let services = ExecutionServices::default();
        let mut log = Log::new();
        let mut session = OutputSession::new();
        let ctx = ComputeContext::new(&module, &registry, &services, &mut log, &mut session);
        let err = ctx.get_input("value").unwrap_err();
        assert_eq!(err.module_id, ModuleId::new(9));
        assert_eq!(err.to_string(), "Missing value from port value");
    }
}
