//! Executable modules of the `basic` package.

use crate::compute::{ComputeContext, ModuleError};
use crate::output::compute_generic_output;
use crate::pipeline::{INPUT_PORT_MODULE, OUTPUT_PORT_MODULE};
use crate::port::PortSpec;
use crate::registry::{ModuleDescriptor, basic};
use crate::value::Value;
use std::path::PathBuf;

/// Descriptors of the `basic` package, parents before children.
#[must_use]
pub fn descriptors() -> Vec<ModuleDescriptor> {
    vec![
        constant("Boolean", basic::CONSTANT, basic::BOOLEAN, compute_boolean),
        constant("String", basic::CONSTANT, basic::STRING, compute_string),
        constant("Float", basic::CONSTANT, basic::FLOAT, compute_float),
        constant("Integer", basic::FLOAT, basic::INTEGER, compute_integer),
        list(),
        constant("File", basic::CONSTANT, basic::FILE, compute_file),
        ModuleDescriptor::new(basic::PACKAGE, "Calculator")
            .input(PortSpec::input("value1", basic::FLOAT))
            .input(PortSpec::input("value2", basic::FLOAT))
            .input(PortSpec::input("op", basic::STRING))
            .output(PortSpec::output("value", basic::FLOAT))
            .compute(compute_calculator),
        ModuleDescriptor::new(basic::PACKAGE, "ConcatenateString")
            .input(PortSpec::input("str1", basic::STRING).optional())
            .input(PortSpec::input("str2", basic::STRING).optional())
            .input(PortSpec::input("str3", basic::STRING).optional())
            .input(PortSpec::input("str4", basic::STRING).optional())
            .output(PortSpec::output("value", basic::STRING))
            .compute(compute_concatenate),
        ModuleDescriptor::new(basic::PACKAGE, INPUT_PORT_MODULE)
            .input(PortSpec::input("name", basic::STRING))
            .input(PortSpec::input("ExternalPipe", basic::VARIANT).optional())
            .output(PortSpec::output("InternalPipe", basic::VARIANT))
            .compute(compute_input_port),
        ModuleDescriptor::new(basic::PACKAGE, OUTPUT_PORT_MODULE)
            .input(PortSpec::input("name", basic::STRING))
            .input(PortSpec::input("InternalPipe", basic::VARIANT))
            .output(PortSpec::output("ExternalPipe", basic::VARIANT))
            .compute(compute_output_port),
        // executed by the interpreter itself
        ModuleDescriptor::new(basic::PACKAGE, "Group"),
        ModuleDescriptor::new(basic::PACKAGE, "GenericOutput")
            .input(PortSpec::input("value", basic::VARIANT))
            .input(PortSpec::input("mode_type", basic::STRING).optional())
            .input(PortSpec::input("configuration", basic::STRING).optional())
            .not_cacheable()
            .compute(compute_generic_output),
    ]
}

type ComputeFn = fn(&mut ComputeContext<'_>) -> Result<(), ModuleError>;

fn constant(name: &str, base: &str, ty: &str, compute: ComputeFn) -> ModuleDescriptor {
    ModuleDescriptor::new(basic::PACKAGE, name)
        .base(base)
        .input(PortSpec::input("value", ty))
        .output(PortSpec::output("value", ty))
        .compute(compute)
}

fn list() -> ModuleDescriptor {
    ModuleDescriptor::new(basic::PACKAGE, "List")
        .base(basic::CONSTANT)
        .input(PortSpec::input("value", basic::LIST).optional())
        .input(PortSpec::input("head", basic::VARIANT).optional())
        .input(PortSpec::input("tail", basic::LIST).optional())
        .output(PortSpec::output("value", basic::LIST))
        .compute(compute_list)
}

fn compute_boolean(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let v = match ctx.get_input("value")? {
        Value::Boolean(b) => *b,
        Value::String(s) if s.eq_ignore_ascii_case("true") => true,
        Value::String(s) if s.eq_ignore_ascii_case("false") => false,
        other => return Err(ctx.error(format!("'{other}' is not a boolean"))),
    };
    ctx.set_output("value", Value::Boolean(v));
    Ok(())
}

fn compute_string(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let v = match ctx.get_input("value")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ctx.set_output("value", Value::String(v));
    Ok(())
}

fn compute_float(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let input = ctx.get_input("value")?;
    let v = input
        .as_f64()
        .ok_or_else(|| ctx.error(format!("'{input}' is not a number")))?;
    ctx.set_output("value", Value::Float(v));
    Ok(())
}

fn compute_integer(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let input = ctx.get_input("value")?;
    let v = input
        .as_i64()
        .ok_or_else(|| ctx.error(format!("'{input}' is not an integer")))?;
    ctx.set_output("value", Value::Integer(v));
    Ok(())
}

fn compute_file(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let path = match ctx.get_input("value")? {
        Value::File(p) => p.clone(),
        Value::String(s) => PathBuf::from(s),
        other => return Err(ctx.error(format!("'{other}' is not a path"))),
    };
    ctx.set_output("value", Value::File(path));
    Ok(())
}

/// `head` values, then `value`, then `tail`.
fn compute_list(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let mut items: Vec<Value> = ctx.get_input_list("head").to_vec();
    for port in ["value", "tail"] {
        if let Some(v) = ctx.try_get_input(port) {
            let middle = v
                .as_list()
                .ok_or_else(|| ctx.error(format!("{port} must be a list, got '{v}'")))?;
            items.extend_from_slice(middle);
        }
    }
    ctx.set_output("value", Value::List(items));
    Ok(())
}

fn operand(ctx: &ComputeContext<'_>, port: &str) -> Result<f64, ModuleError> {
    let v = ctx.get_input(port)?;
    v.as_f64()
        .ok_or_else(|| ctx.error(format!("{port} is not a number: '{v}'")))
}

fn compute_calculator(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let a = operand(ctx, "value1")?;
    let b = operand(ctx, "value2")?;
    let op = ctx
        .get_input("op")?
        .as_str()
        .ok_or_else(|| ctx.error("op must be a string"))?;
    let v = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" if b == 0.0 => return Err(ctx.error("Division by zero")),
        "/" => a / b,
        other => return Err(ctx.error(format!("Invalid operation '{other}'"))),
    };
    ctx.set_output("value", Value::Float(v));
    Ok(())
}

fn compute_concatenate(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let mut out = String::new();
    for port in ["str1", "str2", "str3", "str4"] {
        match ctx.try_get_input(port) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => {}
        }
    }
    ctx.set_output("value", Value::String(out));
    Ok(())
}

fn compute_input_port(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let value = ctx.get_input("ExternalPipe")?.clone();
    ctx.set_output("InternalPipe", value);
    Ok(())
}

fn compute_output_port(ctx: &mut ComputeContext<'_>) -> Result<(), ModuleError> {
    let value = ctx.get_input("InternalPipe")?.clone();
    ctx.set_output("ExternalPipe", value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Compute, ExecutionServices};
    use crate::log::Log;
    use crate::module::Module;
    use crate::output::OutputSession;
    use crate::registry::ModuleRegistry;
    use std::collections::BTreeMap;

    fn run(name: &str, inputs: &[(&str, Value)]) -> Result<BTreeMap<String, Value>, ModuleError> {
        let registry = ModuleRegistry::standard();
        let descriptor = registry.get_descriptor_by_name(basic::PACKAGE, name).unwrap();
        let module = Module::new(1, basic::PACKAGE, name);
        let services = ExecutionServices::default();
        let mut log = Log::new();
        let mut session = OutputSession::new();
        let mut bound = BTreeMap::new();
        for (port, v) in inputs {
            bound.entry((*port).to_string()).or_insert_with(Vec::new).push(v.clone());
        }
        let mut ctx =
            ComputeContext::new(&module, &registry, &services, &mut log, &mut session).with_inputs(bound);
        descriptor.compute_unit().unwrap().compute(&mut ctx)?;
        Ok(ctx.into_outcome().outputs)
    }

    #[test]
    fn float_accepts_integers() {
        let out = run("Float", &[("value", Value::Integer(3))]).unwrap();
        assert_eq!(out["value"], Value::Float(3.0));
    }

    #[test]
    fn integer_rejects_floats() {
        let err = run("Integer", &[("value", Value::Float(1.5))]).unwrap_err();
        assert!(err.message.contains("not an integer"));
    }

    #[test]
    fn calculator_ops() {
        let calc = |op: &str| {
            run(
                "Calculator",
                &[("value1", Value::Float(6.0)), ("value2", Value::Integer(4)), ("op", Value::from(op))],
            )
        };
        assert_eq!(calc("+").unwrap()["value"], Value::Float(10.0));
        assert_eq!(calc("*").unwrap()["value"], Value::Float(24.0));
        assert_eq!(calc("/").unwrap()["value"], Value::Float(1.5));
        assert!(calc("%").unwrap_err().message.contains("Invalid operation"));
    }

    #[test]
    fn calculator_division_by_zero() {
        let err = run(
            "Calculator",
            &[("value1", Value::Float(1.0)), ("value2", Value::Float(0.0)), ("op", Value::from("/"))],
        )
        .unwrap_err();
        assert_eq!(err.message, "Division by zero");
    }

    #[test]
    fn concatenate_skips_missing_ports() {
        let out = run("ConcatenateString", &[("str1", Value::from("ab")), ("str3", Value::from("cd"))]).unwrap();
        assert_eq!(out["value"], Value::from("abcd"));
    }

    #[test]
    fn list_joins_head_value_tail() {
        let out = run(
            "List",
            &[
                ("head", Value::Integer(1)),
                ("head", Value::Integer(2)),
                ("value", Value::List(vec![Value::Integer(3)])),
                ("tail", Value::List(vec![Value::Integer(4)])),
            ],
        )
        .unwrap();
        assert_eq!(
            out["value"],
            Value::List((1..=4).map(Value::Integer).collect())
        );
    }

    #[test]
    fn file_from_string() {
        let out = run("File", &[("value", Value::from("/tmp/x.txt"))]).unwrap();
        assert_eq!(out["value"], Value::File(PathBuf::from("/tmp/x.txt")));
    }
}
