//! pathman: chained filename prefix/suffix manipulation.
//!
//! Commands take their parameters positionally and chain left to right:
//!
//! ```text
//! pathman ${file} get_prefix append_suffix ${suffix}
//! ```

use anyhow::{bail, Result};
use clap::Parser;

use memo_core::path::PathManager;

#[derive(Parser, Debug)]
#[command(
    name = "pathman",
    version,
    about = "Path manager. Chains path manipulation commands over a \
             starting path: get_prefix | get_path_and_prefix | \
             append_suffix <s> | replace_suffix <s> | delete_suffix | \
             repath <dir>."
)]
struct Cli {
    /// Path to manage.
    path: String,

    /// Path manipulation commands, chained left to right.
    #[arg(required = true)]
    command: Vec<String>,
}

fn apply(commands: &[String], start: PathManager) -> Result<PathManager> {
    let mut manager = start;
    let mut iter = commands.iter();
    while let Some(command) = iter.next() {
        manager = match command.as_str() {
            "get_prefix" => manager.get_prefix(),
            "get_path_and_prefix" => manager.get_path_and_prefix(),
            "delete_suffix" => manager.delete_suffix(),
            "append_suffix" | "replace_suffix" | "repath" => {
                let Some(parameter) = iter.next() else {
                    bail!("command {command} expects a parameter");
                };
                match command.as_str() {
                    "append_suffix" => manager.append_suffix(parameter),
                    "replace_suffix" => manager.replace_suffix(parameter),
                    _ => manager.repath(parameter),
                }
            }
            other => bail!("command {other} not recognized"),
        };
    }
    Ok(manager)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let result = apply(&cli.command, PathManager::new(cli.path))?;
    println!("{result}");
    Ok(())
}
