//! # Vistrail
//!
//! A **versioned workflow engine** for Rust. Dataflow pipelines of typed
//! modules are built through recorded edits, executed by an interpreter, and
//! can fan a sub-pipeline out over a collection on a pool of parallel workers.
//!
//! ## Key Features
//!
//! - **Version tree** - every structural edit is an [`Action`] in a
//!   [`Vistrail`]; any past pipeline can be rebuilt, tagged, diffed and undone
//! - **Typed ports** - connections are checked against the registry's type
//!   hierarchy, with subtype matching and overloaded signatures
//! - **Interpreter** - topological evaluation with failure isolation, a
//!   signature-keyed result cache, nested groups and an execution [`Log`]
//! - **Parallel map** - clone a module once per input element, run the clones
//!   on a worker pool and merge their logs back with collision-free ids
//! - **Output modes** - stdout or numbered file series, configured through
//!   layered settings
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use vistrail::{ModuleRegistry, Value, Vistrail, VistrailController};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let mut ctl = VistrailController::new(Vistrail::new(), Arc::new(ModuleRegistry::standard()));
//!
//! let a = ctl.add_module("basic", "Float", 0.0, 0.0)?;
//! ctl.set_function(a, "value", vec![Value::Float(6.0)])?;
//! let calc = ctl.add_module("basic", "Calculator", 100.0, 0.0)?;
//! ctl.set_function(calc, "value2", vec![Value::Float(7.0)])?;
//! ctl.set_function(calc, "op", vec![Value::from("*")])?;
//! ctl.add_connection(a, "value", calc, "value1")?;
//! ctl.tag_version("product")?;
//!
//! let result = ctl.execute_current_workflow()?;
//! assert_eq!(result.output(calc, "value"), Some(&Value::Float(42.0)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Pipelines and modules
//!
//! A [`Pipeline`] owns [`Module`]s and [`Connection`]s keyed by id. Modules
//! carry bound literals ([`ModuleFunction`]s), annotations and optional
//! instance-level port specs; a module may wrap a whole nested pipeline as a
//! group.
//!
//! ### Actions and versions
//!
//! An [`Action`] is an ordered list of add/delete/change operations applied
//! atomically. Each action added to a [`Vistrail`] creates a version;
//! [`Vistrail::get_pipeline`] replays the chain of actions from the root.
//!
//! ### Ids
//!
//! Every entity kind draws ids from an [`IdScope`]. Copying pipeline
//! fragments (paste, map clones, merged worker logs) always draws from the
//! destination's scope.
//!
//! ### Execution
//!
//! The [`Interpreter`] runs one pipeline snapshot against a
//! [`ModuleRegistry`]. Module implementations are [`Compute`] units that read
//! and write values through a [`ComputeContext`].
//!
//! ### Parallel map
//!
//! With the `parallel-map` feature (on by default) the `parallelflow:Map`
//! module hands the module connected to its `FunctionPort` to the
//! [`MapEngine`], which ships one specialised copy per element to a
//! [`WorkerPool`] such as [`LocalPool`].
//!
//! ## Feature flags
//!
//! | Feature | Default | Enables |
//! |---|---|---|
//! | `parallel-map` | yes | the map engine and the `parallelflow:Map` module |
//! | `machine-info` | yes | host details in log machine records (via `sysinfo`) |
//!
//! ## Errors
//!
//! Fallible operations return [`anyhow::Result`]. Errors callers need to tell
//! apart carry a [`WorkflowError`] that can be recovered with
//! `downcast_ref`. Module failures during a run are not errors of the run;
//! they are recorded in the [`ExecutionResult`] and the log.

pub mod action;
pub mod compute;
pub mod connection;
pub mod controller;
pub mod errors;
pub mod id_scope;
pub mod ids;
pub mod interpreter;
pub mod library;
pub mod log;
#[cfg(feature = "parallel-map")]
pub mod map;
pub mod metrics;
pub mod module;
pub mod output;
pub mod persistence;
pub mod pipeline;
pub mod port;
pub mod registry;
pub mod testing;
pub mod value;
pub mod vistrail;
pub mod worker;

pub use action::{Action, ActionItem, DataObject, OpKind, Operation};
pub use compute::{Compute, ComputeContext, ExecutionServices, ModuleError};
pub use connection::Connection;
pub use controller::VistrailController;
pub use errors::WorkflowError;
pub use id_scope::{EntityKind, IdScope};
pub use ids::*;
pub use interpreter::{ExecutionResult, Interpreter, InterpreterConfig};
pub use log::{ItemExec, Log, Machine, SharedLog};
#[cfg(feature = "parallel-map")]
pub use map::{MapConfig, MapEngine};
pub use metrics::MetricsCollector;
pub use module::{Annotation, Module, ModuleFunction, ModuleParam};
pub use pipeline::Pipeline;
pub use port::{PortKind, PortSpec, Signature};
pub use registry::{ModuleDescriptor, ModuleRegistry};
pub use value::Value;
pub use vistrail::Vistrail;
pub use worker::{LocalPool, PoolConfig, WorkerPool};
