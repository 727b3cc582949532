//! External-command stage factory.
//!
//! Wraps an executable as a stage callable of fixed positional arity. The
//! synthesized code object embeds a literal digest over the bytes of the
//! executable *and* every declared co-dependency, so upgrading any of the
//! binaries changes the stage fingerprint and forces a re-run. The worker
//! spawns the first program with the positional arguments and returns
//! `[exit_code, output₁, …, outputₘ]`.

use std::env;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::{json, Value};
use tracing::info;

use crate::canonical::ValueMap;
use crate::digest::digest_files;
use crate::errors::{MemoError, MemoResult};
use crate::fingerprint::{compile, CodeObject};
use crate::path::get_prefix;
use crate::stage::Worker;

/// Locate a program: an existing path is taken as-is, anything else is
/// searched for on the executable PATH.
pub fn resolve_program(name: &str) -> MemoResult<PathBuf> {
    let direct = Path::new(name);
    if direct.exists() {
        return Ok(direct.to_path_buf());
    }

    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(MemoError::missing_resource(format!(
        "program not found: {name}"
    )))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Build the `(CodeObject, CommandWorker)` pair for an external command.
///
/// `programs[0]` is the executable to run; the rest are co-dependencies
/// folded into the digest only. `num_args` fixes the positional arity
/// (`arg0 … argN-1`); `expected_outputs` are the file paths the command is
/// expected to produce, returned after the exit code on every call.
pub fn command_stage(
    programs: &[String],
    num_args: usize,
    expected_outputs: &[String],
) -> MemoResult<(CodeObject, CommandWorker)> {
    let first = programs
        .first()
        .ok_or_else(|| MemoError::validation("no program given"))?;

    let mut resolved = Vec::with_capacity(programs.len());
    for program in programs {
        resolved.push(resolve_program(program)?);
    }
    let digest = digest_files(&resolved)?;

    let params: Vec<String> = (0..num_args).map(|i| format!("arg{i}")).collect();
    let source = synthesize_source(first, &digest, &params, expected_outputs);
    let code = compile(&source)?;

    let worker = CommandWorker {
        program: resolved.remove(0),
        params,
        expected_outputs: expected_outputs.to_vec(),
    };
    Ok((code, worker))
}

/// Generated source for the synthesized callable. The digest literal is
/// what ties the fingerprint to the binaries' bytes.
fn synthesize_source(
    program: &str,
    digest: &str,
    params: &[String],
    expected_outputs: &[String],
) -> String {
    let name = identifier_for(program);
    let mut src = format!("fn {name}({}) {{\n", params.join(", "));
    src.push_str(&format!("    let digest = {};\n", quote(digest)));
    src.push_str(&format!("    let status = exec({}", quote(program)));
    for param in params {
        src.push_str(", ");
        src.push_str(param);
    }
    src.push_str(");\n    return status");
    for output in expected_outputs {
        src.push_str(", ");
        src.push_str(&quote(output));
    }
    src.push_str(";\n}\n");
    src
}

fn quote(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Derive a symbol name from the program's filename stem.
fn identifier_for(program: &str) -> String {
    let stem = get_prefix(program);
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Worker that spawns the external program.
pub struct CommandWorker {
    program: PathBuf,
    params: Vec<String>,
    expected_outputs: Vec<String>,
}

impl Worker for CommandWorker {
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        let mut command = Command::new(&self.program);
        for param in &self.params {
            let value = args.get(param).ok_or_else(|| {
                MemoError::validation(format!("missing command argument `{param}`"))
            })?;
            command.arg(argument_text(value));
        }

        let status = run_logged(&mut command)?;

        let mut out = vec![json!(status)];
        out.extend(self.expected_outputs.iter().map(|o| json!(o)));
        Ok(Value::Array(out))
    }
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Spawn a command, streaming each stdout line to the log, and return its
/// exit code.
pub fn run_logged(command: &mut Command) -> MemoResult<i32> {
    let mut child = command.stdout(Stdio::piped()).spawn()?;

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            info!("{line}");
        }
    }

    let status = child.wait()?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn missing_program_is_a_missing_resource_error() {
        assert_matches!(
            resolve_program("definitely-not-installed-anywhere"),
            Err(MemoError::MissingResource(_))
        );
    }

    #[cfg(unix)]
    #[test]
    fn path_search_finds_sh() {
        let path = resolve_program("sh").unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn synthesized_source_compiles_and_embeds_the_digest() {
        let params = vec!["arg0".to_string(), "arg1".to_string()];
        let outputs = vec!["out.txt".to_string()];
        let src = synthesize_source("tools/convert.sh", "feedbead", &params, &outputs);
        let code = compile(&src).unwrap();
        assert_eq!(code.name, "convert");
        assert_eq!(code.params, params);
        assert!(code.consts.contains(&json!("feedbead")));
        assert!(code.consts.contains(&json!("out.txt")));
        assert_eq!(code.symbols, vec!["exec"]);
    }

    #[test]
    fn different_binaries_give_different_code_objects() {
        let a = synthesize_source("t.sh", "digest-a", &[], &[]);
        let b = synthesize_source("t.sh", "digest-b", &[], &[]);
        assert_ne!(compile(&a).unwrap().consts, compile(&b).unwrap().consts);
    }

    #[test]
    fn identifiers_are_sanitized() {
        assert_eq!(identifier_for("my-tool.v2.sh"), "my_tool");
        assert_eq!(identifier_for("2fast"), "_2fast");
    }
}
