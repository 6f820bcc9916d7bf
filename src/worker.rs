//! Worker transport and the in-process worker pool.
//!
//! A worker receives one [`WorkerRequest`]: a serialized single-module
//! pipeline plus the output ports the caller wants back. It runs the pipeline
//! as an independent workflow (a fresh vistrail with one action tagged
//! [`PARALLEL_FLOW_TAG`], saved to and reloaded from a scratch file, executed
//! through a [`VistrailController`]) and answers with a [`WorkerResponse`]
//! carrying errors, captured outputs, its execution records and the machine it
//! ran on.
//!
//! [`LocalPool`] runs engines on a dedicated rayon thread pool. Requests and
//! responses cross the engine boundary as JSON text, so nothing but data is
//! shared with the caller.

use crate::action::{ActionItem, DataObject, create_action};
use crate::compute::ExecutionServices;
use crate::controller::VistrailController;
use crate::errors::WorkflowError;
use crate::ids::VersionId;
use crate::interpreter::{Interpreter, InterpreterConfig, OUTPUT_ANNOTATION, output_pairs};
use crate::log::Machine;
use crate::persistence::{FileLocator, serialize, unserialize};
use crate::pipeline::Pipeline;
use crate::registry::ModuleRegistry;
use crate::value::Value;
use crate::vistrail::Vistrail;
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::{Arc, Mutex};

/// Tag of the single version a worker builds for its pipeline.
pub const PARALLEL_FLOW_TAG: &str = "parallel flow";

/// One unit of work: run `pipeline` and capture `output_ports`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Position of the element this request was built from.
    pub element: usize,
    /// Serialized [`Pipeline`].
    pub pipeline: String,
    pub output_ports: Vec<String>,
}

/// A value on the wire. Module-typed values travel as text tagged with the
/// sigstring of their descriptor and are rebuilt through the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "wire", rename_all = "snake_case")]
pub enum WireValue {
    Plain { value: Value },
    Tagged { sigstring: String, text: String },
}

impl WireValue {
    /// # Errors
    ///
    /// Returns an error if a module-typed value cannot be serialized.
    pub fn encode(value: &Value, registry: &ModuleRegistry) -> Result<Self> {
        Ok(match registry.serialize_value(value)? {
            Some((text, sigstring)) => Self::Tagged { sigstring, text },
            None => Self::Plain { value: value.clone() },
        })
    }

    /// # Errors
    ///
    /// Returns an error if a tagged value names an unknown type or its text
    /// is not valid state.
    pub fn decode(self, registry: &ModuleRegistry) -> Result<Value> {
        match self {
            Self::Plain { value } => Ok(value),
            Self::Tagged { sigstring, text } => registry.deserialize_value(&sigstring, &text),
        }
    }
}

/// What a worker reports back for one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// One `"{module name}: {message}"` line per failed module.
    pub errors: Vec<String>,
    /// Ports found in the captured outputs, parallel to `outputs`.
    pub ports: Vec<String>,
    pub outputs: Vec<WireValue>,
    /// Serialized item execution records of the run.
    pub log: String,
    /// Serialized [`Machine`] the run was recorded on.
    pub machine: String,
}

/// A pool of execution engines.
pub trait WorkerPool: Send + Sync {
    /// Ids of the available engines.
    fn engines(&self) -> Vec<usize>;

    fn is_initialized(&self, engine: usize) -> bool;

    /// Prepare `engine` for work. Initializing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a worker error for unknown engines.
    fn initialize(&self, engine: usize) -> Result<()>;

    /// Run every request and return the responses in request order.
    ///
    /// # Errors
    ///
    /// Returns a worker error if a request could not be run or its response
    /// could not be decoded. Module failures are reported in the responses.
    fn map_sync(&self, requests: Vec<WorkerRequest>) -> Result<Vec<WorkerResponse>>;
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of engines; defaults to the number of CPUs.
    pub engines: usize,
    /// Threads of the pool; defaults to one per engine.
    pub threads: Option<usize>,
    /// Services given to the controllers the engines run.
    pub services: ExecutionServices,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            engines: num_cpus::get().max(1),
            threads: None,
            services: ExecutionServices::default(),
        }
    }
}

/// Per-engine state, created once by [`WorkerPool::initialize`].
#[derive(Debug)]
struct EngineSession {
    engine: usize,
    machine: Machine,
}

/// Engines running in this process on a dedicated rayon pool.
pub struct LocalPool {
    config: PoolConfig,
    registry: Arc<ModuleRegistry>,
    pool: rayon::ThreadPool,
    sessions: Mutex<HashMap<usize, Arc<EngineSession>>>,
}

impl Debug for LocalPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("LocalPool")
            .field("engines", &self.config.engines)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl LocalPool {
    /// # Errors
    ///
    /// Returns a worker error if the thread pool cannot be built.
    pub fn new(registry: Arc<ModuleRegistry>, config: PoolConfig) -> Result<Self> {
        let threads = config.threads.unwrap_or(config.engines).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("vistrail-engine-{i}"))
            .build()
            .map_err(|e| WorkflowError::worker(format!("building engine pool: {e}")))?;
        Ok(Self {
            config,
            registry,
            pool,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn session(&self, engine: usize) -> Result<Arc<EngineSession>> {
        let sessions = self.sessions.lock().map_err(|_| anyhow!("engine sessions lock poisoned"))?;
        sessions
            .get(&engine)
            .cloned()
            .ok_or_else(|| WorkflowError::worker(format!("engine {engine} is not initialized")).into())
    }

    /// Run one request on `engine` and return the response as JSON text.
    fn execute(&self, engine: usize, request: &WorkerRequest) -> Result<String> {
        let session = self.session(engine)?;
        debug!("engine {} runs element {}", session.engine, request.element);
        let interpreter = Interpreter::with_machine(
            InterpreterConfig::default(),
            self.config.services.clone(),
            session.machine.clone(),
        );
        let response = execute_wf(request, Arc::clone(&self.registry), interpreter)?;
        serialize(&response)
    }
}

impl WorkerPool for LocalPool {
    fn engines(&self) -> Vec<usize> {
        (0..self.config.engines).collect()
    }

    fn is_initialized(&self, engine: usize) -> bool {
        self.sessions
            .lock()
            .is_ok_and(|sessions| sessions.contains_key(&engine))
    }

    fn initialize(&self, engine: usize) -> Result<()> {
        if engine >= self.config.engines {
            bail!(WorkflowError::worker(format!("no engine {engine}")));
        }
        let mut sessions = self.sessions.lock().map_err(|_| anyhow!("engine sessions lock poisoned"))?;
        sessions.entry(engine).or_insert_with(|| {
            info!("initializing engine {engine}");
            Arc::new(EngineSession {
                engine,
                machine: Machine::current(),
            })
        });
        Ok(())
    }

    fn map_sync(&self, requests: Vec<WorkerRequest>) -> Result<Vec<WorkerResponse>> {
        let engines = self.engines();
        if engines.is_empty() {
            bail!(WorkflowError::worker("no engines available"));
        }
        let texts: Vec<Result<String>> = self.pool.install(|| {
            requests
                .par_iter()
                .enumerate()
                .map(|(i, r)| self.execute(engines[i % engines.len()], r))
                .collect()
        });
        texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let text = text.map_err(|e| WorkflowError::worker(format!("engine {i}: {e:#}")))?;
                unserialize(&text).with_context(|| format!("decoding the response of engine {i}"))
            })
            .collect()
    }
}

/// Run a serialized pipeline as an independent workflow.
///
/// # Errors
///
/// Returns an error if the pipeline cannot be decoded or built into a
/// vistrail, or the scratch file cannot be written. Module failures are
/// reported in the response.
pub fn execute_wf(
    request: &WorkerRequest,
    registry: Arc<ModuleRegistry>,
    interpreter: Interpreter,
) -> Result<WorkerResponse> {
    let pipeline: Pipeline = unserialize(&request.pipeline)?;
    let items: Vec<ActionItem> = pipeline
        .modules()
        .map(|m| ActionItem::add(DataObject::Module(m.clone())))
        .chain(
            pipeline
                .connections()
                .map(|c| ActionItem::add(DataObject::Connection(c.clone()))),
        )
        .collect();
    let mut vistrail = Vistrail::new();
    let version = vistrail.add_action(create_action(items)?, VersionId::ROOT)?;
    vistrail.add_tag(version, PARALLEL_FLOW_TAG)?;

    let scratch = tempfile::tempdir().context("creating worker scratch directory")?;
    let locator = FileLocator::new(scratch.path().join("parallel_flow.vt"));
    locator.save(&vistrail)?;
    let mut controller = VistrailController::with_interpreter(locator.load()?, Arc::clone(&registry), interpreter);
    controller.change_selected_version(PARALLEL_FLOW_TAG)?;
    let result = controller.execute_current_workflow()?;

    let run_pipeline = controller.current_pipeline();
    let errors = result
        .errors
        .values()
        .map(|e| {
            let name = run_pipeline.module(e.module_id).map_or("unknown", |m| m.name.as_str());
            format!("{name}: {}", e.message)
        })
        .collect();

    let log = controller.log();
    let Some(exec) = log.workflow_execs.last() else {
        bail!(WorkflowError::worker("worker run left no execution record"));
    };
    let mut ports = Vec::new();
    let mut outputs = Vec::new();
    for item in &exec.item_execs {
        if let Some(a) = item.annotation(OUTPUT_ANNOTATION) {
            for (port, value) in output_pairs(a) {
                ports.push(port);
                outputs.push(WireValue::encode(&value, &registry)?);
            }
        }
    }
    let machine = exec
        .item_execs
        .first()
        .and_then(|e| log.machine(e.machine_id()))
        .or_else(|| log.machine_list.first())
        .ok_or_else(|| WorkflowError::worker("worker log has no machine"))?;
    Ok(WorkerResponse {
        errors,
        ports,
        outputs,
        log: serialize(&exec.item_execs)?,
        machine: serialize(machine)?,
    })
}
