//! Registries and sample pipelines shared by tests.

use super::builders::PipelineBuilder;
use crate::compute::{ComputeContext, ModuleError};
use crate::ids::ModuleId;
use crate::interpreter::ANNOTATE_OUTPUT;
use crate::pipeline::Pipeline;
use crate::port::PortSpec;
use crate::registry::{ModuleDescriptor, ModuleRegistry, basic};
use crate::value::Value;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Package of the fixture modules.
pub const TEST_PACKAGE: &str = "test";

/// Message of every `test:Fail` error.
pub const FORCED_FAILURE: &str = "forced failure";

/// The standard registry plus:
///
/// - `test:Square`: `value: Float -> value: Float`, squares its input;
/// - `test:Fail`: takes an optional `value` and always fails;
/// - `test:Echo`: `value: Variant -> value: Variant`, not cacheable.
#[must_use]
pub fn test_registry() -> ModuleRegistry {
    counting_registry().0
}

/// [`test_registry`] with a counter bumped on every `test:Square` compute,
/// for observing the interpreter cache.
#[must_use]
pub fn counting_registry() -> (ModuleRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let square = move |ctx: &mut ComputeContext<'_>| -> Result<(), ModuleError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let input = ctx.get_input("value")?;
        let x = input
            .as_f64()
            .ok_or_else(|| ctx.error(format!("'{input}' is not a number")))?;
        ctx.set_output("value", Value::Float(x * x));
        Ok(())
    };
    let fail = |ctx: &mut ComputeContext<'_>| -> Result<(), ModuleError> { Err(ctx.error(FORCED_FAILURE)) };
    let echo = |ctx: &mut ComputeContext<'_>| -> Result<(), ModuleError> {
        let v = ctx.get_input("value")?.clone();
        ctx.set_output("value", v);
        Ok(())
    };

    let mut reg = ModuleRegistry::standard();
    for descriptor in [
        ModuleDescriptor::new(TEST_PACKAGE, "Square")
            .input(PortSpec::input("value", basic::FLOAT))
            .output(PortSpec::output("value", basic::FLOAT))
            .compute(square),
        ModuleDescriptor::new(TEST_PACKAGE, "Fail")
            .input(PortSpec::input("value", basic::VARIANT).optional())
            .output(PortSpec::output("value", basic::VARIANT))
            .compute(fail),
        ModuleDescriptor::new(TEST_PACKAGE, "Echo")
            .input(PortSpec::input("value", basic::VARIANT))
            .output(PortSpec::output("value", basic::VARIANT))
            .not_cacheable()
            .compute(echo),
    ] {
        reg.insert(descriptor);
    }
    (reg, calls)
}

/// `Integer(x) -> Square -> Square`, the last module annotated to report its
/// outputs. Returns the pipeline and the ids in chain order.
///
/// # Errors
///
/// Propagates builder errors.
pub fn square_chain(x: i64) -> Result<(Pipeline, [ModuleId; 3])> {
    let mut b = PipelineBuilder::new();
    let n = b.module(basic::PACKAGE, "Integer");
    b.function(n, "value", Value::Integer(x));
    let s1 = b.module(TEST_PACKAGE, "Square");
    let s2 = b.module(TEST_PACKAGE, "Square");
    b.annotate(s2, ANNOTATE_OUTPUT, true);
    b.connect(n, "value", s1, "value");
    b.connect(s1, "value", s2, "value");
    Ok((b.build()?, [n, s1, s2]))
}

/// A group nested two deep: `Integer(x)` feeds an outer group whose inner
/// group squares the value. Both groups expose input `x` and output `y`.
/// Returns the pipeline and the outer group's id.
///
/// # Errors
///
/// Propagates builder errors.
pub fn nested_group_pipeline(x: i64) -> Result<(Pipeline, ModuleId)> {
    let mut inner = PipelineBuilder::with_begin_id(100);
    let i = inner.input_port("x");
    let sq = inner.module(TEST_PACKAGE, "Square");
    let o = inner.output_port("y");
    inner.connect(i, "InternalPipe", sq, "value");
    inner.connect(sq, "value", o, "InternalPipe");

    let mut middle = PipelineBuilder::with_begin_id(50);
    let i = middle.input_port("x");
    let g = middle.group(inner.build()?);
    let o = middle.output_port("y");
    middle.connect(i, "InternalPipe", g, "x");
    middle.connect(g, "y", o, "InternalPipe");

    let mut outer = PipelineBuilder::new();
    let n = outer.module(basic::PACKAGE, "Integer");
    outer.function(n, "value", Value::Integer(x));
    let g = outer.group(middle.build()?);
    outer.annotate(g, ANNOTATE_OUTPUT, true);
    outer.connect(n, "value", g, "x");
    Ok((outer.build()?, g))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_registry_knows_test_modules() {
        let reg = test_registry();
        for name in ["Square", "Fail", "Echo"] {
            assert!(reg.get_descriptor_by_name(TEST_PACKAGE, name).is_ok());
        }
        assert!(!reg.get_descriptor_by_name(TEST_PACKAGE, "Echo").unwrap().cacheable);
    }

    #[test]
    fn samples_are_valid() {
        let reg = test_registry();
        let (p, _) = square_chain(3).unwrap();
        p.validate(&reg).unwrap();
        let (p, _) = nested_group_pipeline(2).unwrap();
        p.validate(&reg).unwrap();
    }
}
