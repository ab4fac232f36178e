use pretty_assertions::assert_eq;
use rand::RngCore;
use rex_core::{
    BranchStatus, Config, Executor, ExperimentError, Experiment, MemorySink, MonitorEvent,
    RecordingMonitor, RunReport, Schedule, UnitOptions,
};
use rex_expr::{Expr, Value};
use rex_test_utils::{configs, fail_if, sequential, sum, threaded, CallLog};
use std::sync::Arc;

fn sum_experiment() -> Experiment {
    Experiment::new()
        .add_callable("ten", |_| Ok(Value::from(10)), UnitOptions::new().root())
        .add_action(
            "sum",
            sum(),
            UnitOptions::new()
                .kwarg("a", Expr::config("x"))
                .kwarg("b", Expr::output("ten")),
        )
}

#[test]
fn test_end_to_end_sum_threads() {
    let mut executor = Executor::new(sum_experiment(), threaded(Some(1))).with_configs(configs(&[10, 20]));
    let report = executor.run().unwrap();

    assert_eq!(report.iterations, 1);
    assert_eq!(report.completed(), 2);
    assert_eq!(executor.branch(0).unwrap().output("sum"), Some(&Value::from(20)));
    assert_eq!(executor.branch(1).unwrap().output("sum"), Some(&Value::from(30)));
}

#[test]
fn test_end_to_end_sum_sequential() {
    let mut executor = Executor::new(sum_experiment(), sequential(Some(1))).with_configs(configs(&[10, 20]));
    executor.run().unwrap();

    let sums: Vec<_> = executor
        .branches()
        .iter()
        .map(|b| b.output("sum").cloned())
        .collect();
    assert_eq!(sums, vec![Some(Value::from(20)), Some(Value::from(30))]);
}

#[test]
fn test_branch_ids_come_from_config() {
    let mut executor = Executor::new(sum_experiment(), sequential(Some(1))).with_configs(configs(&[1, 2]));
    let report = executor.run().unwrap();
    let ids: Vec<_> = report.branches.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["b0", "b1"]);
}

#[test]
fn test_generated_ids_are_unique() {
    let mut executor = Executor::new(sum_experiment(), sequential(Some(1)))
        .with_configs(vec![Config::new().with("x", 1), Config::new().with("x", 2)]);
    let report = executor.run().unwrap();
    assert_ne!(report.branches[0].id, report.branches[1].id);
}

#[test]
fn test_rerun_starts_from_fresh_branches() {
    let mut executor = Executor::new(sum_experiment(), sequential(Some(2))).with_configs(configs(&[1]));
    let first = executor.run().unwrap();
    let second = executor.run().unwrap();
    assert_eq!(first.iterations, second.iterations);
    assert_eq!(executor.branch(0).unwrap().output("sum"), Some(&Value::from(11)));
}

#[test]
fn test_failure_is_contained_in_branch() {
    let log = CallLog::new();
    let experiment = Experiment::new()
        .add_action(
            "maybe",
            fail_if("diverged"),
            UnitOptions::new().kwarg("fail", Expr::config("fail")),
        )
        .add_action("after", log.probe("after"), log.options())
        .save(Expr::lit(1), "ticks", Schedule::always());
    let sink = Arc::new(MemorySink::new());
    let monitor = Arc::new(RecordingMonitor::new());
    let mut executor = Executor::new(experiment, threaded(Some(3)))
        .with_configs(vec![
            Config::new().with("id", "ok").with("fail", false),
            Config::new().with("id", "bad").with("fail", true),
        ])
        .with_sink(sink.clone())
        .with_monitor(monitor.clone());
    let report = executor.run().unwrap();

    assert_eq!(report.iterations, 3);
    assert_eq!(report.branches[0].status, BranchStatus::Completed);
    assert_eq!(report.branches[0].iterations, 3);
    match &report.branches[1].status {
        BranchStatus::Failed { unit, trace } => {
            assert_eq!(unit, "maybe");
            assert!(trace.contains("diverged"));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(report.branches[1].iterations, 1);
    assert!(!report.is_success());

    assert_eq!(log.for_branch(0).len(), 3);
    assert!(log.for_branch(1).is_empty());

    let ticks = sink.series("bad", "ticks").unwrap();
    assert_eq!(ticks.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

    assert_eq!(
        monitor.count(|e| matches!(e, MonitorEvent::UnitFailed { unit, .. } if unit == "maybe")),
        1
    );
    assert_eq!(monitor.count(|e| matches!(e, MonitorEvent::BranchStarted { .. })), 2);
    assert_eq!(monitor.count(|e| matches!(e, MonitorEvent::BranchFinished { .. })), 2);
}

#[test]
fn test_panicking_unit_is_contained() {
    let experiment = Experiment::new().add_callable(
        "explode",
        |args| {
            if args.require("fail")?.as_bool() == Some(true) {
                panic!("kaboom");
            }
            Ok(Value::from(1))
        },
        UnitOptions::new().kwarg("fail", Expr::config("fail")),
    );
    let mut executor = Executor::new(experiment, threaded(Some(2))).with_configs(vec![
        Config::new().with("fail", true),
        Config::new().with("fail", false),
    ]);
    let report = executor.run().unwrap();

    assert!(matches!(
        &report.branches[0].status,
        BranchStatus::Failed { trace, .. } if trace.contains("kaboom")
    ));
    assert_eq!(report.branches[1].status, BranchStatus::Completed);
}

#[test]
fn test_unresolved_reference_fails_branch() {
    let experiment = Experiment::new().add_action(
        "sum",
        sum(),
        UnitOptions::new()
            .kwarg("a", Expr::config("x"))
            .kwarg("b", Expr::output("missing")),
    );
    let mut executor = Executor::new(experiment, sequential(Some(2))).with_configs(configs(&[1]));
    let report = executor.run().unwrap();
    assert!(matches!(
        &report.branches[0].status,
        BranchStatus::Failed { trace, .. } if trace.contains("missing")
    ));
}

#[test]
fn test_unresolved_reference_escalates_in_debug() {
    let experiment = Experiment::new().add_action(
        "sum",
        sum(),
        UnitOptions::new().kwarg("a", Expr::config("nope")).kwarg("b", Expr::lit(1)),
    );
    let mut executor =
        Executor::new(experiment, sequential(Some(2)).with_debug(true)).with_configs(configs(&[1]));
    let err = executor.run().unwrap_err();
    assert!(matches!(err, ExperimentError::UnitExecution { ref unit, .. } if unit == "sum"));
}

#[test]
fn test_unit_executed_events_follow_schedule() {
    let monitor = Arc::new(RecordingMonitor::new());
    let experiment = Experiment::new()
        .add_callable("every", |_| Ok(Value::Null), UnitOptions::new())
        .add_callable("third", |_| Ok(Value::Null), UnitOptions::new().when(Schedule::every(3)));
    let mut executor = Executor::new(experiment, sequential(Some(7)))
        .with_configs(configs(&[1]))
        .with_monitor(monitor.clone());
    executor.run().unwrap();

    let executed = |name: &str| {
        monitor.count(|e| matches!(e, MonitorEvent::UnitExecuted { unit, .. } if unit == name))
    };
    assert_eq!(executed("every"), 7);
    assert_eq!(executed("third"), 3);
}

#[test]
fn test_results_are_flushed_once_per_branch() {
    let experiment = Experiment::new()
        .add_callable(
            "double",
            |args| Ok(Value::from(args.require("x")?.as_i64().unwrap_or_default() * 2)),
            UnitOptions::new().kwarg("x", Expr::config("x")).save_to("double"),
        );
    let sink = Arc::new(MemorySink::new());
    let mut executor = Executor::new(experiment, threaded(Some(3)))
        .with_configs(configs(&[1, 5]))
        .with_sink(sink.clone());
    executor.run().unwrap();

    assert_eq!(sink.branch_ids().len(), 2);
    let b1 = sink.branch("b1").unwrap();
    assert_eq!(b1.alias.get("x").map(String::as_str), Some("5"));
    let values: Vec<_> = b1.results["double"].values().cloned().collect();
    assert_eq!(values, vec![Value::from(10); 3]);
    assert!(executor.branch(1).unwrap().results().is_empty());
}

#[test]
fn test_dump_flushes_during_run() {
    let experiment = Experiment::new()
        .add_callable(
            "tick",
            |args| Ok(args.require("it")?.get("iteration").cloned().unwrap_or_default()),
            UnitOptions::new()
                .kwarg("it", Expr::branch())
                .save_to("tick")
                .dump(Schedule::every(2)),
        );
    let sink = Arc::new(MemorySink::new());
    let mut executor = Executor::new(experiment, sequential(Some(5)))
        .with_configs(configs(&[0]))
        .with_sink(sink.clone());
    executor.run().unwrap();

    let tick = sink.series("b0", "tick").unwrap();
    assert_eq!(tick.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_run_without_budget_stops_when_all_branches_fail() {
    let experiment = Experiment::new().add_action(
        "maybe",
        fail_if("stop"),
        UnitOptions::new().kwarg("fail", Expr::lit(true)),
    );
    let mut executor = Executor::new(experiment, threaded(None)).with_configs(configs(&[1, 2, 3]));
    let report = executor.run().unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(report.failed(), 3);
}

#[test]
fn test_root_failure_aborts_sibling_branches() {
    let experiment = Experiment::new()
        .add_callable("data", |_| anyhow::bail!("feed down"), UnitOptions::new().root())
        .add_callable("after", |_| Ok(Value::Null), UnitOptions::new());
    let sink = Arc::new(MemorySink::new());
    let mut executor = Executor::new(experiment, threaded(Some(3)))
        .with_configs(configs(&[1, 2]))
        .with_sink(sink.clone());
    let err = executor.run().unwrap_err();
    assert!(matches!(err, ExperimentError::RootUnit { ref unit, .. } if unit == "data"));

    let report = executor.report();
    assert!(matches!(
        &report.branches[0].status,
        BranchStatus::Failed { unit, trace } if unit == "data" && trace.contains("feed down")
    ));
    assert!(matches!(
        &report.branches[1].status,
        BranchStatus::Aborted { cause } if cause.contains("root unit 'data' failed")
    ));
    assert_eq!(report.aborted(), 1);
    assert_eq!(report.exhausted(), 0);
    assert!(!report.is_success());
    assert_eq!(sink.branch_ids().len(), 2);
}

#[test]
fn test_debug_escalation_aborts_healthy_branches() {
    let experiment = Experiment::new().add_action(
        "maybe",
        fail_if("diverged"),
        UnitOptions::new().kwarg("fail", Expr::config("fail")),
    );
    let mut executor = Executor::new(experiment, sequential(Some(3)).with_debug(true)).with_configs(vec![
        Config::new().with("id", "ok").with("fail", false),
        Config::new().with("id", "bad").with("fail", true),
    ]);
    let err = executor.run().unwrap_err();
    assert!(matches!(err, ExperimentError::UnitExecution { branch: 1, .. }));

    let report = executor.report();
    assert!(matches!(&report.branches[0].status, BranchStatus::Aborted { .. }));
    assert!(matches!(
        &report.branches[1].status,
        BranchStatus::Failed { unit, .. } if unit == "maybe"
    ));
    assert_eq!(report.completed(), 0);
}

#[test]
fn test_seeded_runs_repeat_branch_seeds() {
    let experiment = Experiment::new().add_callable(
        "seed",
        |args| Ok(args.require("branch")?.get("seed").cloned().unwrap_or_default()),
        UnitOptions::new().kwarg("branch", Expr::branch()),
    );
    let mut executor =
        Executor::new(experiment, sequential(Some(1)).with_seed(7)).with_configs(configs(&[1, 2]));
    let seeds = |report: &RunReport| report.branches.iter().map(|b| b.seed).collect::<Vec<_>>();
    let first = executor.run().unwrap();
    let second = executor.run().unwrap();

    assert_eq!(first.seed, 7);
    assert_eq!(seeds(&first), seeds(&second));
    assert_ne!(first.branches[0].seed, first.branches[1].seed);

    let branch = executor.branch(1).unwrap();
    assert_eq!(branch.seed(), first.branches[1].seed);
    assert_eq!(
        branch.output("seed").and_then(Value::as_i64),
        i64::try_from(branch.seed()).ok()
    );
    assert_eq!(branch.rng().next_u64(), branch.rng().next_u64());
}
