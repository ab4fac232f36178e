use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rex_core::prelude::*;
use rex_core::telemetry::{init_json_tracing, init_tracing};
use rex_expr::{Expr, Value};
use std::sync::Arc;

fn main() {
    let cli = Command::new("rex")
        .version(rex_core::VERSION)
        .about("REX experiment runner")
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run the built-in running-sum experiment")
                .arg(
                    Arg::new("branches")
                        .long("branches")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Number of configurations to run"),
                )
                .arg(
                    Arg::new("length")
                        .long("length")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Number of items each branch stream yields"),
                )
                .arg(
                    Arg::new("iters")
                        .long("iters")
                        .value_parser(value_parser!(usize))
                        .help("Iteration budget; runs until the streams end when omitted"),
                )
                .arg(
                    Arg::new("target")
                        .long("target")
                        .value_parser(["threads", "for"])
                        .help("Dispatch branches on a thread pool or sequentially"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .help("Executor settings file (.toml, .yaml)"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Seed for the per-branch random generators"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output report and results as JSON"),
                ),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        );

    let matches = cli.get_matches();
    if matches.get_flag("json-logs") {
        init_json_tracing("info");
    } else {
        init_tracing("info");
    }

    let code = match matches.subcommand() {
        Some(("simulate", args)) => match simulate(args) {
            Ok(passed) => i32::from(!passed),
            Err(err) => {
                eprintln!("error: {err:#}");
                2
            }
        },
        _ => 2,
    };
    std::process::exit(code);
}

fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let branches = args.get_one::<usize>("branches").copied().unwrap_or(4);
    let length = args.get_one::<usize>("length").copied().unwrap_or(10);

    let mut settings = match args.get_one::<String>("config") {
        Some(path) => ExecutorConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => ExecutorConfig::new().with_name("simulate"),
    };
    if let Some(n_iters) = args.get_one::<usize>("iters") {
        settings = settings.with_n_iters(*n_iters);
    }
    if let Some(seed) = args.get_one::<u64>("seed") {
        settings = settings.with_seed(*seed);
    }
    match args.get_one::<String>("target").map(String::as_str) {
        Some("for") => settings = settings.with_target(Target::For),
        Some("threads") => settings = settings.with_target(Target::Threads),
        _ => {}
    }

    let configs = (0..branches)
        .map(|i| Config::new().with("id", format!("branch-{i}")).with("step", i + 1))
        .collect();
    let sink = Arc::new(MemorySink::new());
    let mut executor = Executor::new(running_sum(length), settings)
        .with_configs(configs)
        .with_sink(sink.clone());
    let report = executor.run()?;

    if args.get_flag("json") {
        let output = serde_json::json!({
            "report": report,
            "results": sink.to_json(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}: {} iterations", report.name, report.iterations);
        for branch in &report.branches {
            let total = sink
                .series(&branch.id, "total")
                .and_then(|series| series.values().last().cloned())
                .unwrap_or_default();
            println!(
                "  [{}] {} iterations={} status={:?} total={}",
                branch.index, branch.id, branch.iterations, branch.status, total
            );
        }
    }
    Ok(report.is_success())
}

/// Root offset, a per-branch running sum of `step` and a final save
fn running_sum(length: usize) -> Experiment {
    Experiment::new()
        .add_callable("offset", |_| Ok(Value::from(100)), UnitOptions::new().root())
        .add_generator(
            "sum",
            move |args| {
                let step = args.require("step")?.as_i64().context("step must be an integer")?;
                let offset = args.require("offset")?.as_i64().unwrap_or_default();
                let sums = (0..length).scan(offset, move |acc, _| {
                    *acc += step;
                    Some(Ok(Value::from(*acc)))
                });
                Ok(Box::new(sums) as UnitStream)
            },
            UnitOptions::new()
                .kwarg("step", Expr::config("step"))
                .kwarg("offset", Expr::output("offset")),
        )
        .save(Expr::output("sum"), "total", Schedule::last())
}
