use proptest::prelude::*;
use rex_core::{Executor, Experiment, MemorySink, Schedule, Trigger};
use rex_expr::{Expr, Value};
use rex_test_utils::{configs, sequential, threaded, CallLog};
use std::sync::Arc;

const UNITS: [&str; 3] = ["load", "train", "evaluate"];

fn probed(log: &CallLog, root_first: bool) -> Experiment {
    UNITS.iter().enumerate().fold(Experiment::new(), |experiment, (i, name)| {
        let options = if root_first && i == 0 {
            log.options().root()
        } else {
            log.options()
        };
        experiment.add_action(*name, log.probe(name), options)
    })
}

fn position(unit: &str) -> usize {
    UNITS.iter().position(|u| *u == unit).unwrap_or(usize::MAX)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_branch_sees_canonical_order(
        n_branches in 1..6usize,
        n_iters in 1..5usize,
        parallel in any::<bool>(),
    ) {
        let log = CallLog::new();
        let settings = if parallel { threaded(Some(n_iters)) } else { sequential(Some(n_iters)) };
        let values: Vec<i64> = (0..n_branches as i64).collect();
        let mut executor = Executor::new(probed(&log, false), settings).with_configs(configs(&values));
        executor.run().unwrap();

        let expected: Vec<(String, usize)> = (0..n_iters)
            .flat_map(|it| UNITS.iter().map(move |u| (u.to_string(), it)))
            .collect();
        for branch in 0..n_branches {
            prop_assert_eq!(log.for_branch(branch), expected.clone());
        }
    }

    #[test]
    fn prop_unit_barrier_holds_across_branches(
        n_branches in 2..6usize,
        n_iters in 1..4usize,
    ) {
        let log = CallLog::new();
        let values: Vec<i64> = (0..n_branches as i64).collect();
        let mut executor = Executor::new(probed(&log, false), threaded(Some(n_iters)))
            .with_configs(configs(&values));
        executor.run().unwrap();

        let steps: Vec<(usize, usize)> = log
            .calls()
            .iter()
            .map(|call| (call.iteration, position(&call.unit)))
            .collect();
        prop_assert_eq!(steps.len(), n_branches * n_iters * UNITS.len());
        prop_assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn prop_root_unit_runs_once_per_iteration(
        n_branches in 1..6usize,
        n_iters in 1..5usize,
    ) {
        let log = CallLog::new();
        let values: Vec<i64> = (0..n_branches as i64).collect();
        let mut executor = Executor::new(probed(&log, true), threaded(Some(n_iters)))
            .with_configs(configs(&values));
        executor.run().unwrap();

        let root_calls = log.calls().into_iter().filter(|c| c.unit == "load").count();
        prop_assert_eq!(root_calls, n_iters);
        for branch in executor.branches() {
            prop_assert_eq!(branch.output("load"), executor.branch(0).and_then(|b| b.output("load")));
        }
    }
}

#[test]
fn test_schedules_fire_on_expected_iterations() {
    let log = CallLog::new();
    let experiment = Experiment::new()
        .add_action("every3", log.probe("every3"), log.options().when(Schedule::every(3)))
        .add_action("final", log.probe("final"), log.options().when(Schedule::last()))
        .add_action(
            "picked",
            log.probe("picked"),
            log.options().when(Schedule::at(5).or(Trigger::At(8))),
        )
        .add_action(
            "parsed",
            log.probe("parsed"),
            log.options().when("#1,4".parse::<Schedule>().unwrap()),
        );
    let mut executor = Executor::new(experiment, sequential(Some(10))).with_configs(configs(&[0]));
    executor.run().unwrap();

    let fired = |unit: &str| -> Vec<usize> {
        log.for_branch(0)
            .into_iter()
            .filter(|(u, _)| u == unit)
            .map(|(_, it)| it)
            .collect()
    };
    assert_eq!(fired("every3"), vec![0, 3, 6, 9]);
    assert_eq!(fired("final"), vec![9]);
    assert_eq!(fired("picked"), vec![5, 8]);
    assert_eq!(fired("parsed"), vec![0, 1, 4, 8]);
}

#[test]
fn test_branch_view_exposes_iteration_and_config() {
    let experiment = Experiment::new().save(Expr::branch(), "views", Schedule::last());
    let sink = Arc::new(MemorySink::new());
    let mut executor = Executor::new(experiment, sequential(Some(2)))
        .with_configs(configs(&[7]))
        .with_sink(sink.clone());
    executor.run().unwrap();

    let views = sink.series("b0", "views").unwrap();
    let view = &views[&1];
    assert_eq!(view.get("id"), Some(&Value::from("b0")));
    assert_eq!(view.get("index"), Some(&Value::from(0)));
    assert_eq!(view.get("iteration"), Some(&Value::from(1)));
    assert_eq!(view.get("config").and_then(|c| c.get("x")), Some(&Value::from(7)));
}
