//! Tests for the parallel map: ordering, pre-dispatch checks, aggregated
//! failures and log merging.

#![cfg(feature = "parallel-map")]

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use vistrail::compute::FunctionTarget;
use vistrail::errors::WorkflowError;
use vistrail::log::ItemExec;
use vistrail::map::{self, MapConfig, MapEngine, PARALLEL_EXECUTION};
use vistrail::registry::basic;
use vistrail::testing::*;
use vistrail::worker::{WorkerRequest, WorkerResponse};
use vistrail::{
    ExecutionServices, Interpreter, InterpreterConfig, LocalPool, Log, Module, ModuleId, ModuleRegistry, PoolConfig,
    SharedLog, Value, Vistrail, VistrailController, WorkerPool,
};

/// Delegates to a [`LocalPool`] and counts `map_sync` calls.
struct CountingPool {
    inner: LocalPool,
    calls: AtomicUsize,
}

impl CountingPool {
    fn new(registry: Arc<ModuleRegistry>, engines: usize) -> Result<Self> {
        let config = PoolConfig {
            engines,
            threads: None,
            services: ExecutionServices::default(),
        };
        Ok(Self {
            inner: LocalPool::new(registry, config)?,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WorkerPool for CountingPool {
    fn engines(&self) -> Vec<usize> {
        self.inner.engines()
    }

    fn is_initialized(&self, engine: usize) -> bool {
        self.inner.is_initialized(engine)
    }

    fn initialize(&self, engine: usize) -> Result<()> {
        self.inner.initialize(engine)
    }

    fn map_sync(&self, requests: Vec<WorkerRequest>) -> Result<Vec<WorkerResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.map_sync(requests)
    }
}

fn setup(engines: usize) -> Result<(VistrailController, Arc<CountingPool>)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = Arc::new(test_registry());
    let pool = Arc::new(CountingPool::new(Arc::clone(&registry), engines)?);
    let services = ExecutionServices::default().with_worker_pool(Arc::clone(&pool) as Arc<dyn WorkerPool>);
    let interpreter = Interpreter::new(InterpreterConfig::default(), services);
    Ok((
        VistrailController::with_interpreter(Vistrail::new(), registry, interpreter),
        pool,
    ))
}

fn strings(names: &[&str]) -> Value {
    Value::List(names.iter().map(|n| Value::from(*n)).collect())
}

/// `Float(10) -> Calculator(op "/")` mapped over `value2`. Returns the map id.
fn divide_ten_by(ctl: &mut VistrailController, elements: Vec<Value>) -> Result<ModuleId> {
    let ten = ctl.add_module(basic::PACKAGE, "Float", 0.0, 0.0)?;
    ctl.set_function(ten, "value", vec![Value::Float(10.0)])?;
    let calc = ctl.add_module(basic::PACKAGE, "Calculator", 0.0, 80.0)?;
    ctl.set_function(calc, "op", vec![Value::from("/")])?;
    ctl.add_connection(ten, "value", calc, "value1")?;

    let map = ctl.add_module(map::PACKAGE, "Map", 0.0, 160.0)?;
    ctl.add_connection(calc, "self", map, "FunctionPort")?;
    ctl.set_function(map, "InputPort", vec![strings(&["value2"])])?;
    ctl.set_function(map, "OutputPort", vec![strings(&["value"])])?;
    ctl.set_function(map, "InputList", vec![Value::List(elements)])?;
    Ok(map)
}

fn singles(values: &[f64]) -> Value {
    Value::List(values.iter().map(|v| Value::Tuple(vec![Value::Float(*v)])).collect())
}

#[test]
fn test_results_keep_input_order() -> Result<()> {
    let (mut ctl, pool) = setup(3)?;
    let elements = [1.0, 2.0, 4.0, 5.0, 8.0, 10.0, 20.0]
        .into_iter()
        .map(Value::Float)
        .collect();
    let map = divide_ten_by(&mut ctl, elements)?;

    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    assert_eq!(
        result.output(map, "Result"),
        Some(&singles(&[10.0, 5.0, 2.5, 2.0, 1.25, 1.0, 0.5]))
    );
    assert_eq!(pool.calls(), 1);
    assert!(pool.engines().iter().all(|e| pool.is_initialized(*e)));
    Ok(())
}

#[test]
fn test_integers_are_accepted_for_float_ports() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, vec![Value::Integer(4), Value::Float(2.0)])?;
    let result = ctl.execute_current_workflow()?;
    assert_eq!(result.output(map, "Result"), Some(&singles(&[2.5, 5.0])));
    Ok(())
}

#[test]
fn test_type_mismatch_fails_before_dispatch() -> Result<()> {
    let (mut ctl, pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, vec![Value::Float(1.0), Value::from("two")])?;
    let result = ctl.execute_current_workflow()?;

    let message = &result.errors[&map].message;
    assert!(message.contains("type mismatch on port 'value2'"), "{message}");
    assert!(message.contains("element 1"), "{message}");
    assert_eq!(pool.calls(), 0);
    Ok(())
}

#[test]
fn test_failing_elements_are_aggregated() -> Result<()> {
    let (mut ctl, pool) = setup(3)?;
    let elements = [1.0, 2.0, 0.0, 5.0].into_iter().map(Value::Float).collect();
    let map = divide_ten_by(&mut ctl, elements)?;
    let result = ctl.execute_current_workflow()?;

    let message = &result.errors[&map].message;
    assert_eq!(message, "ModuleError in engine 2: 'Calculator: Division by zero'");
    assert!(result.output(map, "Result").is_none());
    assert_eq!(pool.calls(), 1);
    Ok(())
}

#[test]
fn test_missing_outputs_are_reported() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, vec![Value::Float(1.0)])?;
    ctl.set_function(map, "OutputPort", vec![strings(&["value", "remainder"])])?;
    let result = ctl.execute_current_workflow()?;
    assert_eq!(result.errors[&map].message, "Output ports not found: remainder");
    Ok(())
}

#[test]
fn test_empty_input_list_dispatches_nothing() -> Result<()> {
    let (mut ctl, pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, Vec::new())?;
    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    assert_eq!(result.output(map, "Result"), Some(&Value::List(Vec::new())));
    assert_eq!(pool.calls(), 0);
    Ok(())
}

#[test]
fn test_merged_records_join_the_callers_log() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, vec![Value::Float(1.0), Value::Float(2.0), Value::Float(5.0)])?;
    ctl.execute_current_workflow()?;
    // a second run merges again without colliding with the first
    ctl.flush_cache();
    ctl.execute_current_workflow()?;

    let log = ctl.log();
    assert_log_ids_consistent(log);
    for wf in &log.workflow_execs {
        let merged: Vec<&ItemExec> = wf
            .item_execs
            .iter()
            .filter(|e| e.annotation(PARALLEL_EXECUTION).is_some())
            .collect();
        assert_eq!(merged.len(), 3);
        for exec in merged {
            assert_eq!(exec.annotations()[0].key, PARALLEL_EXECUTION);
            assert_ne!(exec.module_id(), map);
        }
    }
    Ok(())
}

#[test]
fn test_log_merge_can_be_disabled() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    ctl.interpreter_mut().services_mut().map = MapConfig { merge_logs: false };
    let map = divide_ten_by(&mut ctl, vec![Value::Float(1.0)])?;
    let result = ctl.execute_current_workflow()?;
    assert_eq!(result.output(map, "Result"), Some(&singles(&[10.0])));
    let wf = &ctl.log().workflow_execs[0];
    assert!(wf.item_execs.iter().all(|e| e.annotation(PARALLEL_EXECUTION).is_none()));
    Ok(())
}

#[test]
fn test_nested_group_target_keeps_one_machine_at_every_depth() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let (fixture, g) = nested_group_pipeline(0)?;
    let group = ctl.insert_module(fixture.get_module(g)?)?;
    let map = ctl.add_module(map::PACKAGE, "Map", 0.0, 160.0)?;
    ctl.add_connection(group, "self", map, "FunctionPort")?;
    ctl.set_function(map, "InputPort", vec![strings(&["x"])])?;
    ctl.set_function(map, "OutputPort", vec![strings(&["y"])])?;
    ctl.set_function(
        map,
        "InputList",
        vec![Value::List(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])],
    )?;

    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    assert_eq!(result.output(map, "Result"), Some(&singles(&[1.0, 4.0, 9.0])));

    let log = ctl.log();
    assert_log_ids_consistent(log);
    let merged: Vec<&ItemExec> = log.workflow_execs[0]
        .item_execs
        .iter()
        .filter(|e| e.annotation(PARALLEL_EXECUTION).is_some())
        .collect();
    assert_eq!(merged.len(), 3);
    for exec in merged {
        assert!(exec.flatten().len() >= 7, "expected two nested levels in {exec:?}");
        assert_machine_everywhere(exec, exec.machine_id());
        assert!(log.machine(exec.machine_id()).is_some());
    }
    Ok(())
}

#[test]
fn test_engine_prepare_checks_arity() -> Result<()> {
    let registry = test_registry();
    let pool = CountingPool::new(Arc::new(test_registry()), 1)?;
    let config = MapConfig::default();
    let engine = MapEngine::new(&registry, &pool, &config);
    let target = FunctionTarget {
        module: Module::new(1, basic::PACKAGE, "Calculator"),
        inputs: Default::default(),
    };
    let ports = vec!["value1".to_string(), "value2".to_string()];
    let outputs = vec!["value".to_string()];

    let ok = engine.prepare(
        &target,
        &ports,
        &outputs,
        &[Value::Tuple(vec![Value::Float(1.0), Value::Float(2.0)])],
    )?;
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].element, 0);

    let err = engine
        .prepare(&target, &ports, &outputs, &[Value::Float(1.0)])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Structure(_))
    ));
    assert_eq!(pool.calls(), 0);
    Ok(())
}

#[test]
fn test_concurrent_merges_into_a_shared_log_do_not_collide() -> Result<()> {
    let registry = Arc::new(test_registry());
    let pool = CountingPool::new(Arc::clone(&registry), 2)?;
    let config = MapConfig::default();
    let engine = MapEngine::new(&registry, &pool, &config);
    let target = FunctionTarget {
        module: Module::new(1, TEST_PACKAGE, "Square"),
        inputs: Default::default(),
    };
    let ports = vec!["value".to_string()];
    let elements: Vec<Value> = (1..=4).map(|i| Value::Float(f64::from(i))).collect();
    let requests = engine.prepare(&target, &ports, &ports, &elements)?;
    let responses = engine.dispatch(requests)?;

    let shared = SharedLog::new(Log::new());
    let (log_ref, engine, responses) = (&shared, &engine, &responses);
    let merged: Vec<ItemExec> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(move || log_ref.with(|log| engine.merge_logs(log, responses))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("merge thread panicked"))
            .collect::<Result<Result<Vec<Vec<ItemExec>>>>>()
    })??
    .into_iter()
    .flatten()
    .collect();

    let log = shared.snapshot()?;
    assert_eq!(merged.len(), 16);
    assert_eq!(log.machine_list.len(), 1);
    let ids: BTreeSet<_> = merged.iter().map(ItemExec::id).collect();
    assert_eq!(ids.len(), merged.len());
    for exec in &merged {
        assert_eq!(exec.machine_id(), log.machine_list[0].id);
    }
    Ok(())
}

/// `test:Square` mapped over `value`. Returns the map id.
fn square_each(ctl: &mut VistrailController, elements: Vec<Value>) -> Result<ModuleId> {
    let sq = ctl.add_module(TEST_PACKAGE, "Square", 0.0, 0.0)?;
    let map = ctl.add_module(map::PACKAGE, "Map", 0.0, 80.0)?;
    ctl.add_connection(sq, "self", map, "FunctionPort")?;
    ctl.set_function(map, "InputPort", vec![strings(&["value"])])?;
    ctl.set_function(map, "OutputPort", vec![strings(&["value"])])?;
    ctl.set_function(map, "InputList", vec![Value::List(elements)])?;
    Ok(map)
}

fn single_floats(result: &Value) -> Vec<f64> {
    result
        .as_list()
        .expect("map result is a list")
        .iter()
        .map(|t| t.as_list().and_then(|v| v[0].as_f64()).expect("one float per element"))
        .collect()
}

#[test]
fn test_non_finite_floats_cross_the_worker_boundary() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let elements = vec![
        Value::Float(2.0),
        Value::Float(1e200),
        Value::Float(f64::NEG_INFINITY),
        Value::Float(f64::NAN),
    ];
    let map = square_each(&mut ctl, elements)?;

    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    let squares = single_floats(result.output(map, "Result").expect("map produced a result"));
    assert_eq!(squares[..3], [4.0, f64::INFINITY, f64::INFINITY]);
    assert!(squares[3].is_nan());
    Ok(())
}

#[test]
fn test_nested_lists_cross_the_worker_boundary() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let nested = Value::List(vec![
        Value::Integer(1),
        Value::List(vec![Value::Float(2.5), Value::from("x"), Value::Float(f64::INFINITY)]),
        Value::Boolean(true),
    ]);
    let elements = vec![nested.clone(), Value::List(Vec::new())];
    let echo = ctl.add_module(TEST_PACKAGE, "Echo", 0.0, 0.0)?;
    let map = ctl.add_module(map::PACKAGE, "Map", 0.0, 80.0)?;
    ctl.add_connection(echo, "self", map, "FunctionPort")?;
    ctl.set_function(map, "InputPort", vec![strings(&["value"])])?;
    ctl.set_function(map, "OutputPort", vec![strings(&["value"])])?;
    ctl.set_function(map, "InputList", vec![Value::List(elements)])?;

    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    assert_eq!(
        result.output(map, "Result"),
        Some(&Value::List(vec![
            Value::Tuple(vec![nested]),
            Value::Tuple(vec![Value::List(Vec::new())]),
        ]))
    );
    Ok(())
}

#[test]
fn test_target_also_feeding_a_regular_port_is_still_mapped() -> Result<()> {
    let (mut ctl, _pool) = setup(2)?;
    let map = divide_ten_by(&mut ctl, vec![Value::Float(4.0), Value::Float(5.0)])?;
    let calc = ctl
        .current_pipeline()
        .modules()
        .find(|m| m.name == "Calculator")
        .map(|m| m.id)
        .expect("calculator in the pipeline");
    ctl.set_function(calc, "value2", vec![Value::Float(2.0)])?;
    let echo = ctl.add_module(TEST_PACKAGE, "Echo", 200.0, 80.0)?;
    ctl.add_connection(calc, "value", echo, "value")?;

    let result = ctl.execute_current_workflow()?;
    assert_no_errors(&result);
    assert_eq!(result.output(echo, "value"), Some(&Value::Float(5.0)));
    assert_eq!(result.output(map, "Result"), Some(&singles(&[2.5, 2.0])));
    Ok(())
}
