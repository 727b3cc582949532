use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "memo",
    version,
    about = "Command-line memoization. Wraps a command in a cached stage: \
             the command re-runs only when its binary, its declared \
             dependents, or its inputs/outputs changed (sha256). Use \
             -c to declare dependent scripts the command calls, -o to \
             declare expected output files, and -d to choose where the \
             cache entry is written."
)]
pub struct Cli {
    /// Other scripts/commands the wrapped command depends on.
    #[arg(short = 'c', long = "dependents", num_args = 1..)]
    pub dependents: Vec<String>,

    /// Expected file outputs of the command.
    #[arg(short = 'o', long = "outputs", num_args = 1..)]
    pub outputs: Vec<String>,

    /// Directory to write cache files to. Memoization is off without it.
    #[arg(short = 'd', long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// Alternative name for the cache files (default: command name).
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Number of parallel branches. Give per-branch arguments with
    /// --argX and expected outputs with --arg_outputX (X from 0).
    #[arg(short = 'p', long)]
    pub parallel: Option<usize>,

    /// Kill the parent process when the command fails.
    #[arg(short = 'k', long)]
    pub kill: bool,

    /// Write the log to this file as well as stdout.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log cache decisions and command output.
    #[arg(long)]
    pub verbose: bool,

    /// Command to run and any subsequent arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Per-branch argument groups collected before clap parsing.
#[derive(Debug, Default, Clone)]
pub struct DynamicArgs {
    /// `--argX …` groups, keyed by X.
    pub groups: BTreeMap<usize, Vec<String>>,
    /// `--arg_outputX …` groups, keyed by X.
    pub outputs: BTreeMap<usize, Vec<String>>,
}

/// Split the `--argX` / `--arg_outputX` families out of the raw argv.
///
/// clap cannot declare flags whose names depend on the invocation, so
/// these are collected in a pre-scan pass (values run until the next
/// dash-prefixed token) and the remaining argv goes to the derive parser.
pub fn split_dynamic_args(argv: Vec<String>) -> Result<(Vec<String>, DynamicArgs)> {
    let mut remaining = Vec::with_capacity(argv.len());
    let mut dynamic = DynamicArgs::default();

    let mut iter = argv.into_iter().peekable();
    while let Some(token) = iter.next() {
        let parsed = parse_dynamic_flag(&token)?;
        let Some((index, is_output, inline)) = parsed else {
            remaining.push(token);
            continue;
        };

        let mut values = Vec::new();
        if let Some(inline) = inline {
            values.push(inline);
        }
        while let Some(next) = iter.peek() {
            if next.starts_with('-') {
                break;
            }
            values.push(iter.next().unwrap());
        }
        if values.is_empty() {
            return Err(anyhow!("no values given for {token}"));
        }

        let store = if is_output {
            &mut dynamic.outputs
        } else {
            &mut dynamic.groups
        };
        store.entry(index).or_default().extend(values);
    }

    Ok((remaining, dynamic))
}

/// `--argX[=v]` / `--arg_outputX[=v]` recognizer. Returns
/// `(index, is_output, inline_value)`.
fn parse_dynamic_flag(token: &str) -> Result<Option<(usize, bool, Option<String>)>> {
    let Some(rest) = token.strip_prefix("--arg") else {
        return Ok(None);
    };
    let (body, is_output) = match rest.strip_prefix("_output") {
        Some(body) => (body, true),
        None => (rest, false),
    };
    if body.is_empty() || !body.chars().next().unwrap().is_ascii_digit() {
        return Ok(None); // e.g. --arguments, some unrelated flag
    }

    let (digits, inline) = match body.split_once('=') {
        Some((digits, value)) => (digits, Some(value.to_string())),
        None => (body, None),
    };
    let index: usize = digits
        .parse()
        .map_err(|_| anyhow!("malformed parallel argument flag: {token}"))?;
    Ok(Some((index, is_output, inline)))
}
