//! Runs one Rust stage function on the thread backend and, by re-executing
//! this binary as a child, on the process backend, and compares the reports.
//!
//! Built with `harness = false` so the child's stdout carries nothing but
//! protocol lines.

use anyhow::bail;
use conveyor::errors::ItemErrorKind;
use conveyor::pipeline::{OrderPolicy, PipelineBuilder, PipelineReport, StageConfig};
use conveyor::worker::{serve_stdio, ProcessCommand};
use pretty_assertions::assert_eq;

const CHILD_ROLE: &str = "CONVEYOR_ROUNDTRIP_CHILD";

fn square(x: i64) -> anyhow::Result<i64> {
    if x < 0 {
        bail!("negative input {x}");
    }
    assert!(x != 13, "unlucky {x}");
    Ok(x * x)
}

fn summary(report: &PipelineReport<String>) -> (Vec<String>, Vec<(u64, ItemErrorKind, String)>) {
    let errors = report
        .errors
        .iter()
        .map(|err| (err.seq, err.kind, err.message.clone()))
        .collect();
    (report.outputs.clone(), errors)
}

fn same_function_on_both_backends() -> anyhow::Result<()> {
    let shift = |x: i64| x - 2;
    let render = |x: i64| x.to_string();

    let threaded = PipelineBuilder::new("in-process")
        .map(StageConfig::new("shift"), shift)
        .stage(StageConfig::new("square").with_workers(3), square)
        .map(StageConfig::new("render"), render)
        .order(OrderPolicy::Submission)
        .build()?;

    let command = ProcessCommand::current_exe()?.env(CHILD_ROLE, "square");
    let external = PipelineBuilder::new("out-of-process")
        .map(StageConfig::new("shift"), shift)
        .process_stage::<i64>(StageConfig::new("square").with_workers(3).with_capacity(4), command)
        .map(StageConfig::new("render"), render)
        .order(OrderPolicy::Submission)
        .build()?;

    let expected = threaded.run(0..20)?;
    let actual = external.run(0..20)?;

    assert_eq!(actual.processed, 20);
    assert_eq!(summary(&actual), summary(&expected));

    let kinds: Vec<ItemErrorKind> = actual.errors.iter().map(|err| err.kind).collect();
    assert_eq!(
        kinds,
        vec![ItemErrorKind::Failed, ItemErrorKind::Failed, ItemErrorKind::Panicked]
    );
    assert_eq!(actual.errors[2].message, "unlucky 13");
    assert_eq!(actual.stage("render").map(|stage| stage.forwarded), Some(3));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if std::env::var_os(CHILD_ROLE).is_some() {
        serve_stdio(square)?;
        return Ok(());
    }

    same_function_on_both_backends()?;
    eprintln!("process_roundtrip: ok");
    Ok(())
}
