//! Stage construction and execution for the memo binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde_json::{json, Value};
use tracing::info;

use memo_core::command::command_stage;
use memo_core::stage::Stage;

use crate::args::{Cli, DynamicArgs};

/// The command plus its declared dependents; the first entry is executed,
/// the rest only contribute to the digest.
fn scripts(cli: &Cli) -> Vec<String> {
    let mut scripts = vec![cli.command[0].clone()];
    scripts.extend(cli.dependents.iter().cloned());
    scripts
}

/// Build one memoized stage around the command and run it. Returns the
/// wrapped command's exit code (cached or fresh).
fn run_stage(
    scripts: &[String],
    arguments: &[String],
    outputs: &[String],
    name: Option<&str>,
    cache_dir: Option<&Path>,
) -> Result<i32> {
    let (code, worker) = command_stage(scripts, arguments.len(), outputs)?;

    let mut labels = vec!["output".to_string()];
    labels.extend((0..outputs.len()).map(|i| format!("output{i}")));

    let mut stage = Stage::new(code, worker).with_outputs(labels);
    if let Some(name) = name {
        stage = stage.with_name(name);
    }
    if let Some(dir) = cache_dir {
        stage = stage.with_cache_dir(dir);
    }

    let args: Vec<Value> = arguments.iter().map(|a| json!(a)).collect();
    let results = stage
        .run(&args)
        .with_context(|| format!("running {}", scripts[0]))?;

    let code = results.get("output").and_then(Value::as_i64).unwrap_or(1) as i32;
    info!("{} exited with {code}", scripts[0]);
    Ok(code)
}

/// Single-process mode: the command's own arguments feed the stage.
pub fn run_single(cli: &Cli) -> Result<i32> {
    run_stage(
        &scripts(cli),
        &cli.command[1..],
        &cli.outputs,
        cli.name.as_deref(),
        cli.cache_dir.as_deref(),
    )
}

/// Parallel mode: one stage per `--argX` group, each with its own cache
/// subdirectory so concurrent writers never share an entry. Returns 1 if
/// any branch failed.
pub fn run_parallel(cli: &Cli, dynamic: &DynamicArgs, workers: usize) -> Result<i32> {
    if dynamic.groups.is_empty() {
        bail!("no parallel argument groups specified (use --arg0 …)");
    }

    let scripts = scripts(cli);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .context("building parallel worker pool")?;

    let codes: Result<Vec<i32>> = pool.install(|| {
        dynamic
            .groups
            .par_iter()
            .map(|(index, arguments)| {
                let cache_dir: Option<PathBuf> = cli
                    .cache_dir
                    .as_ref()
                    .map(|dir| dir.join(format!("parallel{index}")));
                let outputs = dynamic.outputs.get(index).cloned().unwrap_or_default();
                run_stage(
                    &scripts,
                    arguments,
                    &outputs,
                    cli.name.as_deref(),
                    cache_dir.as_deref(),
                )
            })
            .collect()
    });

    let codes = codes?;
    Ok(if codes.iter().any(|code| *code != 0) {
        1
    } else {
        0
    })
}
