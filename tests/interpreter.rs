//! Tests for pipeline execution: failure isolation, caching, output
//! annotations and nested groups.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use vistrail::errors::WorkflowError;
use vistrail::interpreter::{OUTPUT_ANNOTATION, output_pairs};
use vistrail::log::ItemExec;
use vistrail::registry::basic;
use vistrail::testing::*;
use vistrail::{ExecutionServices, Interpreter, InterpreterConfig, Log, Value, VersionId};

fn interpreter() -> Interpreter {
    let _ = env_logger::builder().is_test(true).try_init();
    Interpreter::new(InterpreterConfig::default(), ExecutionServices::default())
}

#[test]
fn test_failure_skips_downstream_only() -> anyhow::Result<()> {
    let reg = test_registry();
    let mut b = PipelineBuilder::new();
    let a = b.module(basic::PACKAGE, "Integer");
    b.function(a, "value", Value::Integer(2));
    let fail = b.module(TEST_PACKAGE, "Fail");
    let after = b.module(TEST_PACKAGE, "Square");
    b.connect(a, "value", fail, "value");
    b.connect(fail, "value", after, "value");

    let c = b.module(basic::PACKAGE, "Integer");
    b.function(c, "value", Value::Integer(3));
    let independent = b.module(TEST_PACKAGE, "Square");
    b.connect(c, "value", independent, "value");
    let pipeline = b.build()?;

    let mut log = Log::new();
    let result = interpreter().execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;

    assert!(!result.is_success());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[&fail].message, FORCED_FAILURE);
    assert!(result.skipped.contains(&after));
    assert!(result.executed.contains(&independent));
    assert_eq!(result.output(independent, "value"), Some(&Value::Float(9.0)));

    let wf = &log.workflow_execs[0];
    assert!(!wf.completed);
    let failed = wf.item_execs.iter().find(|e| e.module_id() == fail).unwrap();
    assert_eq!(failed.error(), Some(FORCED_FAILURE));
    // skipped modules leave no record
    assert!(wf.item_execs.iter().all(|e| e.module_id() != after));
    Ok(())
}

#[test]
fn test_missing_required_input_is_a_module_error() -> anyhow::Result<()> {
    let reg = test_registry();
    let mut b = PipelineBuilder::new();
    let sq = b.module(TEST_PACKAGE, "Square");
    let pipeline = b.build()?;
    let result = interpreter().execute(&pipeline, &reg, &mut Log::new(), VersionId::ROOT)?;
    assert!(result.errors.contains_key(&sq));
    Ok(())
}

#[test]
fn test_ill_typed_pipeline_is_rejected_before_running() -> anyhow::Result<()> {
    let (reg, calls) = counting_registry();
    let mut b = PipelineBuilder::new();
    let s = b.module(basic::PACKAGE, "String");
    b.function(s, "value", Value::from("nope"));
    let sq = b.module(TEST_PACKAGE, "Square");
    b.connect(s, "value", sq, "value");
    let pipeline = b.build()?;

    let err = interpreter()
        .execute(&pipeline, &reg, &mut Log::new(), VersionId::ROOT)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Structure(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_second_run_is_served_from_cache() -> anyhow::Result<()> {
    let (reg, calls) = counting_registry();
    let (pipeline, [n, s1, s2]) = square_chain(3)?;
    let mut interp = interpreter();
    let mut log = Log::new();

    let first = interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    assert_no_errors(&first);
    assert_eq!(first.output(s2, "value"), Some(&Value::Float(81.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(first.cached.is_empty());

    let second = interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    assert_eq!(second.output(s2, "value"), Some(&Value::Float(81.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.cached, BTreeSet::from([n, s1, s2]));

    interp.flush();
    assert_eq!(interp.cache_len(), 0);
    interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    assert_eq!(log.workflow_execs.len(), 3);
    assert_log_ids_consistent(&log);
    Ok(())
}

#[test]
fn test_changed_parameter_misses_the_cache() -> anyhow::Result<()> {
    let (reg, calls) = counting_registry();
    let mut interp = interpreter();
    let mut log = Log::new();
    let (three, _) = square_chain(3)?;
    let (four, [_, _, last]) = square_chain(4)?;

    interp.execute(&three, &reg, &mut log, VersionId::ROOT)?;
    let result = interp.execute(&four, &reg, &mut log, VersionId::ROOT)?;
    assert_eq!(result.output(last, "value"), Some(&Value::Float(256.0)));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[test]
fn test_uncacheable_modules_taint_downstream() -> anyhow::Result<()> {
    let (reg, calls) = counting_registry();
    let mut b = PipelineBuilder::new();
    let n = b.module(basic::PACKAGE, "Integer");
    b.function(n, "value", Value::Integer(5));
    let echo = b.module(TEST_PACKAGE, "Echo");
    let sq = b.module(TEST_PACKAGE, "Square");
    b.connect(n, "value", echo, "value");
    b.connect(echo, "value", sq, "value");
    let pipeline = b.build()?;

    let mut interp = interpreter();
    let mut log = Log::new();
    interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    let again = interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;

    assert!(again.cached.contains(&n));
    assert!(again.executed.contains(&echo));
    assert!(again.executed.contains(&sq));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_cache_can_be_disabled() -> anyhow::Result<()> {
    let (reg, calls) = counting_registry();
    let (pipeline, _) = square_chain(2)?;
    let config = InterpreterConfig {
        use_cache: false,
        user: None,
    };
    let mut interp = Interpreter::new(config, ExecutionServices::default());
    let mut log = Log::new();
    interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    let result = interp.execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    assert!(result.cached.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(interp.cache_len(), 0);
    Ok(())
}

#[test]
fn test_annotated_outputs_are_logged() -> anyhow::Result<()> {
    let reg = test_registry();
    let (pipeline, [n, _, s2]) = square_chain(3)?;
    let mut log = Log::new();
    interpreter().execute(&pipeline, &reg, &mut log, VersionId::new(7))?;

    let wf = &log.workflow_execs[0];
    assert_eq!(wf.vt_version, VersionId::new(7));
    let exec = wf.item_execs.iter().find(|e| e.module_id() == s2).unwrap();
    let annotation = exec.annotation(OUTPUT_ANNOTATION).unwrap();
    assert_eq!(
        output_pairs(annotation),
        vec![("value".to_string(), Value::Float(81.0))]
    );

    let plain = wf.item_execs.iter().find(|e| e.module_id() == n).unwrap();
    assert!(plain.annotation(OUTPUT_ANNOTATION).is_none());
    Ok(())
}

#[test]
fn test_nested_groups_compute_and_nest_their_logs() -> anyhow::Result<()> {
    let reg = test_registry();
    let (pipeline, group) = nested_group_pipeline(4)?;
    let mut log = Log::new();
    let result = interpreter().execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    assert_no_errors(&result);
    assert_eq!(result.output(group, "y"), Some(&Value::Float(16.0)));

    let wf = &log.workflow_execs[0];
    let outer = wf.item_execs.iter().find(|e| e.module_id() == group).unwrap();
    let ItemExec::Group(outer_exec) = outer else {
        panic!("expected a group exec, got {outer:?}");
    };
    assert_eq!(outer_exec.item_execs.len(), 3);
    let inner = outer_exec
        .item_execs
        .iter()
        .find(|e| matches!(e, ItemExec::Group(_)))
        .unwrap();
    assert_eq!(inner.item_execs().len(), 3);
    assert!(inner.item_execs().iter().all(ItemExec::completed));

    let pairs = output_pairs(outer.annotation(OUTPUT_ANNOTATION).unwrap());
    assert_eq!(pairs, vec![("y".to_string(), Value::Float(16.0))]);
    assert_log_ids_consistent(&log);
    Ok(())
}

#[test]
fn test_group_inputs_are_not_served_stale() -> anyhow::Result<()> {
    let reg = test_registry();
    let mut interp = interpreter();
    let mut log = Log::new();
    let (two, g2) = nested_group_pipeline(2)?;
    let (five, g5) = nested_group_pipeline(5)?;

    let first = interp.execute(&two, &reg, &mut log, VersionId::ROOT)?;
    assert_eq!(first.output(g2, "y"), Some(&Value::Float(4.0)));
    let second = interp.execute(&five, &reg, &mut log, VersionId::ROOT)?;
    assert_eq!(second.output(g5, "y"), Some(&Value::Float(25.0)));
    Ok(())
}

#[test]
fn test_failure_inside_group_fails_the_group() -> anyhow::Result<()> {
    let reg = test_registry();
    let mut inner = PipelineBuilder::with_begin_id(100);
    let i = inner.input_port("x");
    let fail = inner.module(TEST_PACKAGE, "Fail");
    let o = inner.output_port("y");
    inner.connect(i, "InternalPipe", fail, "value");
    inner.connect(fail, "value", o, "InternalPipe");

    let mut outer = PipelineBuilder::new();
    let n = outer.module(basic::PACKAGE, "Integer");
    outer.function(n, "value", Value::Integer(1));
    let g = outer.group(inner.build()?);
    let echo = outer.module(TEST_PACKAGE, "Echo");
    outer.connect(n, "value", g, "x");
    outer.connect(g, "y", echo, "value");
    let pipeline = outer.build()?;

    let mut log = Log::new();
    let result = interpreter().execute(&pipeline, &reg, &mut log, VersionId::ROOT)?;
    let message = &result.errors[&g].message;
    assert!(message.starts_with("Error(s) inside group"));
    assert!(message.contains(FORCED_FAILURE));
    assert!(result.skipped.contains(&echo));

    let exec = log.workflow_execs[0]
        .item_execs
        .iter()
        .find(|e| e.module_id() == g)
        .unwrap();
    assert!(!exec.completed());
    Ok(())
}
