//! Test tooling for pipelines, vistrails and execution logs.
//!
//! - **Builders**: [`PipelineBuilder`] assembles pipelines without going
//!   through actions, handing out ids as it goes.
//! - **Fixtures**: a registry with a few small executable test modules, and
//!   sample pipelines (a linear chain, a nested group).
//! - **Assertions**: structural pipeline comparison and log id consistency.
//!
//! # Quick Start
//!
//! ```
//! use vistrail::testing::*;
//! use vistrail::value::Value;
//!
//! let mut b = PipelineBuilder::new();
//! let n = b.module("basic", "Integer");
//! b.function(n, "value", Value::Integer(3));
//! let sq = b.module(TEST_PACKAGE, "Square");
//! b.connect(n, "value", sq, "value");
//! let pipeline = b.build().unwrap();
//!
//! assert_eq!(pipeline.module_count(), 2);
//! assert_eq!(pipeline.connection_count(), 1);
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
