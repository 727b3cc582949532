//! Working-directory scoping, symlink shims, and worker adapters.
//!
//! Stage workers that shell out to batch tools often need their inputs
//! staged next to them and their outputs written from a known working
//! directory. The adapters here wrap a [`Worker`] the way decorators
//! wrapped callables in older pipelines: each one rewrites the input map
//! or the process state around the inner call.
//!
//! The process working directory is global state, so [`working_directory`]
//! hands out a guard that restores the previous directory on every exit
//! path, including panics.

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::canonical::{self, ValueMap};
use crate::errors::{MemoError, MemoResult};
use crate::fingerprint::CodeObject;
use crate::stage::Worker;

/// Guard returned by [`working_directory`]. Dropping it restores the
/// directory that was current when it was created.
pub struct WorkingDir {
    previous: PathBuf,
}

/// Switch the process working directory until the guard is dropped.
pub fn working_directory(path: impl AsRef<Path>) -> MemoResult<WorkingDir> {
    let previous = env::current_dir()?;
    env::set_current_dir(path.as_ref())?;
    debug!("changed working directory to {}", path.as_ref().display());
    Ok(WorkingDir { previous })
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if env::set_current_dir(&self.previous).is_ok() {
            debug!("changed working directory to {}", self.previous.display());
        }
    }
}

/// Relative path from `from` to `to`, both taken as-is (no resolution).
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Create a relative symlink to `filename` inside `dir`, replacing any
/// existing link or file of the same name. Returns the link path.
pub fn symlink_to_path(filename: &str, dir: &str) -> MemoResult<String> {
    let target = fs::canonicalize(filename)?;
    let dir_abs = fs::canonicalize(dir)?;

    let parent = target
        .parent()
        .ok_or_else(|| MemoError::validation(format!("no parent directory for {filename}")))?;
    let name = target
        .file_name()
        .ok_or_else(|| MemoError::validation(format!("no file name in {filename}")))?;

    let link = Path::new(dir).join(name);
    let relative = relative_path(&dir_abs, parent).join(name);

    remove_existing(&link)?;
    std::os::unix::fs::symlink(&relative, &link)?;

    Ok(link.to_string_lossy().into_owned())
}

/// Create a relative symlink named `name` under `root` pointing at the
/// `target` directory.
pub fn symlink_to_folder(target: &Path, root: &Path, name: &str) -> MemoResult<PathBuf> {
    let target_abs = fs::canonicalize(target)?;
    let root_abs = fs::canonicalize(root)?;
    let relative = relative_path(&root_abs, &target_abs);

    let link = root.join(name);
    remove_existing(&link)?;
    std::os::unix::fs::symlink(&relative, &link)?;

    Ok(link)
}

fn remove_existing(link: &Path) -> MemoResult<()> {
    match fs::symlink_metadata(link) {
        Ok(_) => {
            fs::remove_file(link)?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn require_output_path_param(code: &CodeObject) -> MemoResult<()> {
    if code.params.iter().any(|p| p == "output_path") {
        Ok(())
    } else {
        Err(MemoError::validation(format!(
            "output_path not found in `{}`",
            code.name
        )))
    }
}

fn output_path_arg(args: &ValueMap) -> MemoResult<&str> {
    args.get("output_path")
        .and_then(Value::as_str)
        .ok_or_else(|| MemoError::validation("output_path argument missing or not a string"))
}

/// Adapter that creates the `output_path` directory before each call.
pub struct EnsureOutputPath<W> {
    inner: W,
}

impl<W: Worker> EnsureOutputPath<W> {
    /// Fails unless the wrapped code declares an `output_path` parameter.
    pub fn new(code: &CodeObject, inner: W) -> MemoResult<Self> {
        require_output_path_param(code)?;
        Ok(Self { inner })
    }
}

impl<W: Worker> Worker for EnsureOutputPath<W> {
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        fs::create_dir_all(output_path_arg(args)?)?;
        self.inner.call(args)
    }
}

/// Adapter that switches the working directory to `output_path` for the
/// duration of each call.
pub struct InOutputPathDir<W> {
    inner: W,
}

impl<W: Worker> InOutputPathDir<W> {
    pub fn new(code: &CodeObject, inner: W) -> MemoResult<Self> {
        require_output_path_param(code)?;
        Ok(Self { inner })
    }
}

impl<W: Worker> Worker for InOutputPathDir<W> {
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        let _guard = working_directory(output_path_arg(args)?)?;
        self.inner.call(args)
    }
}

/// Adapter that rewrites existing-file arguments to absolute paths.
pub struct AbsPaths<W> {
    inner: W,
}

impl<W: Worker> AbsPaths<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Worker> Worker for AbsPaths<W> {
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        let mut rewritten = ValueMap::new();
        for (key, value) in args {
            rewritten.insert(key.clone(), canonical::rewrite_abspaths(value));
        }
        self.inner.call(&rewritten)
    }
}

/// Adapter that stages existing-file arguments as relative symlinks in a
/// named directory and hands the link paths to the inner worker.
pub struct SymlinkInputs<W> {
    dir: String,
    inner: W,
}

impl<W: Worker> SymlinkInputs<W> {
    pub fn new(dir: impl Into<String>, inner: W) -> Self {
        Self {
            dir: dir.into(),
            inner,
        }
    }
}

impl<W: Worker> Worker for SymlinkInputs<W> {
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        fs::create_dir_all(&self.dir)?;
        let mut rewritten = ValueMap::new();
        for (key, value) in args {
            let staged = match value {
                Value::String(s) if Path::new(s).is_file() => {
                    Value::String(symlink_to_path(s, &self.dir)?)
                }
                other => other.clone(),
            };
            rewritten.insert(key.clone(), staged);
        }
        self.inner.call(&rewritten)
    }
}
