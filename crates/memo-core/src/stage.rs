//! Stage: one memoized unit of work.
//!
//! A stage wraps a [`Worker`] together with the compiled representation of
//! its code. `run` assembles the effective input map, decides hit or miss
//! against the on-disk cache entry, and either invokes the worker or
//! replays the cached output map.
//!
//! A cache hit requires all three of:
//! - the persisted stage bytes equal the current code fingerprint
//! - the persisted input map matches the canonicalized effective inputs
//! - the persisted output map exists, carries every declared output label,
//!   and still matches itself after re-digesting the files it references
//!
//! Unparseable cache JSON and files that vanished since the last run are
//! misses, never errors: the entry is rewritten on the next successful
//! run. Errors raised by the worker itself propagate verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::canonical::{self, Projection, ValueMap};
use crate::config::{CacheEntryPaths, CacheLayout};
use crate::errors::{MemoError, MemoResult};
use crate::fingerprint::{fingerprint, CallableRegistry, CodeObject};

/// The callable seam. Workers consume the effective input map (values
/// bound by parameter name) and return either a single JSON value or an
/// array of positional outputs.
pub trait Worker: Send + Sync {
    fn call(&self, args: &ValueMap) -> MemoResult<Value>;
}

impl<F> Worker for F
where
    F: Fn(&ValueMap) -> MemoResult<Value> + Send + Sync,
{
    fn call(&self, args: &ValueMap) -> MemoResult<Value> {
        self(args)
    }
}

/// Per-call overrides of the hit/miss decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Force a hit: results come from the output cache even when the
    /// checks fail, so they may be stale relative to the inputs.
    pub force_skip: bool,
    /// Force a miss; wins over `force_skip`.
    pub force_run: bool,
    /// Write the cache entry even when the stage did not run.
    pub force_write_hash: bool,
}

/// One memoized unit of work.
pub struct Stage {
    worker: Box<dyn Worker>,
    code: CodeObject,
    registry: Arc<CallableRegistry>,
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    pinned: ValueMap,
    aliases: BTreeMap<String, String>,
    cache_dir: Option<PathBuf>,
    layout: CacheLayout,
    results: ValueMap,
    ran_this_call: bool,
    loaded_from_cache: bool,
}

impl Stage {
    /// Wrap a worker with its compiled code. Input parameter names come
    /// from the code object; the stage name defaults to its symbolic name
    /// and the output labels to `["output"]`.
    pub fn new<W: Worker + 'static>(code: CodeObject, worker: W) -> Self {
        Self {
            name: code.name.clone(),
            inputs: code.params.clone(),
            worker: Box::new(worker),
            code,
            registry: Arc::new(CallableRegistry::new()),
            outputs: vec!["output".to_string()],
            pinned: ValueMap::new(),
            aliases: BTreeMap::new(),
            cache_dir: None,
            layout: CacheLayout::default(),
            results: ValueMap::new(),
            ran_this_call: false,
            loaded_from_cache: false,
        }
    }

    /// Label the positional return values of the worker.
    pub fn with_outputs<S: Into<String>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Enable memoization under this directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Override the stage name (the filename stem of cache artifacts).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Publish `alias` as a second name for the output key `target` when
    /// results are read.
    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), target.into());
        self
    }

    /// Pin an input to a fixed value, overriding anything supplied at
    /// call time. Construction-time pins are unvalidated, like any other
    /// keyword the worker may reject; use [`Stage::pin`] for the checked
    /// mutation.
    pub fn with_pinned(mut self, name: impl Into<String>, value: Value) -> Self {
        self.pinned.insert(name.into(), value);
        self
    }

    /// Resolve referenced symbols against this registry when
    /// fingerprinting.
    pub fn with_registry(mut self, registry: Arc<CallableRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Override the cache filename layout.
    pub fn with_layout(mut self, layout: CacheLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared input parameter names.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output labels.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Pinned input values.
    pub fn pinned(&self) -> &ValueMap {
        &self.pinned
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// True when the worker executed on the last `run`.
    pub fn ran_this_call(&self) -> bool {
        self.ran_this_call
    }

    /// True when the last `run` replayed the cached outputs.
    pub fn loaded_from_cache(&self) -> bool {
        self.loaded_from_cache
    }

    /// The last invocation's output map with the alias overlay applied.
    /// An alias whose target key is absent, or which shadows a real
    /// output key, is a validation error.
    pub fn results(&self) -> MemoResult<ValueMap> {
        let mut view = self.results.clone();
        for (alias, target) in &self.aliases {
            if self.results.contains_key(alias) {
                return Err(MemoError::validation(format!(
                    "alias `{alias}` shadows an output key of stage `{}`",
                    self.name
                )));
            }
            let value = self.results.get(target).ok_or_else(|| {
                MemoError::validation(format!(
                    "alias `{alias}` points at missing output `{target}` of stage `{}`",
                    self.name
                ))
            })?;
            view.insert(alias.clone(), value.clone());
        }
        Ok(view)
    }

    /// Pin an input to a fixed value. The name must be a declared
    /// parameter.
    pub fn pin(&mut self, name: &str, value: Value) -> MemoResult<()> {
        if !self.inputs.iter().any(|p| p == name) {
            return Err(MemoError::validation(format!(
                "`{name}` is not a declared parameter of stage `{}`",
                self.name
            )));
        }
        self.pinned.insert(name.to_string(), value);
        Ok(())
    }

    /// Remove a pinned input. The name must be declared and currently
    /// pinned.
    pub fn unpin(&mut self, name: &str) -> MemoResult<()> {
        if !self.inputs.iter().any(|p| p == name) {
            return Err(MemoError::validation(format!(
                "`{name}` is not a declared parameter of stage `{}`",
                self.name
            )));
        }
        self.pinned.remove(name).map(|_| ()).ok_or_else(|| {
            MemoError::validation(format!(
                "`{name}` is not pinned on stage `{}`",
                self.name
            ))
        })
    }

    /// Run with positional arguments only and default flags.
    pub fn run(&mut self, args: &[Value]) -> MemoResult<ValueMap> {
        self.run_with(args, &ValueMap::new(), RunFlags::default())
    }

    /// Run the stage: decide hit or miss, invoke or replay, persist.
    pub fn run_with(
        &mut self,
        args: &[Value],
        named: &ValueMap,
        flags: RunFlags,
    ) -> MemoResult<ValueMap> {
        self.ran_this_call = false;
        self.loaded_from_cache = false;

        let inputs = self.effective_inputs(args, named);
        info!(
            stage = %self.name,
            "using arguments {}",
            serde_json::Value::Object(inputs.clone())
        );

        let mut should_run = true;
        let mut cached = None;
        if self.cache_dir.is_some() {
            if let Some(hit) = self.check_hashes(&inputs)? {
                should_run = false;
                cached = Some(hit);
            }
        }
        if flags.force_skip {
            info!(stage = %self.name, "force skip");
            should_run = false;
        }
        if flags.force_run {
            info!(stage = %self.name, "force run");
            should_run = true;
        }

        if should_run {
            info!(stage = %self.name, "running");
            self.results.clear();
            let returned = self.worker.call(&inputs)?;
            let outputs = match returned {
                Value::Array(items) => items,
                single => vec![single],
            };
            // truncate or pad to the declared arity
            for (i, label) in self.outputs.iter().enumerate() {
                self.results
                    .insert(label.clone(), outputs.get(i).cloned().unwrap_or(Value::Null));
            }
            self.ran_this_call = true;
        } else {
            info!(stage = %self.name, "skipping execution");
            let replayed = match cached {
                Some(results) => results,
                None => self.load_cached_outputs()?,
            };
            self.results = replayed;
            self.loaded_from_cache = true;
        }

        if self.cache_dir.is_some() && (self.ran_this_call || flags.force_write_hash) {
            self.write_hashes(&inputs)?;
        }

        self.results()
    }

    fn effective_inputs(&self, args: &[Value], named: &ValueMap) -> ValueMap {
        let mut map = ValueMap::new();
        for (name, value) in self.inputs.iter().zip(args.iter()) {
            map.insert(name.clone(), value.clone());
        }
        for (key, value) in named {
            map.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.pinned {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    fn entry(&self) -> MemoResult<CacheEntryPaths> {
        let dir = self.cache_dir.as_ref().ok_or_else(|| {
            MemoError::validation(format!(
                "stage `{}` has no cache directory to read results from",
                self.name
            ))
        })?;
        Ok(self.layout.entry(dir, &self.name))
    }

    fn fingerprint_bytes(&self) -> MemoResult<Vec<u8>> {
        fingerprint(&self.code, &self.registry)
    }

    /// Compare the cache entry against the current code and inputs.
    /// `Ok(Some(results))` is a hit carrying the replayable output map.
    /// Integrity problems (unreadable files, bad JSON, vanished inputs)
    /// degrade to a miss.
    fn check_hashes(&self, inputs: &ValueMap) -> MemoResult<Option<ValueMap>> {
        let entry = self.entry()?;

        let stage_match = match fs::read(&entry.stage) {
            Ok(on_disk) => on_disk == self.fingerprint_bytes()?,
            Err(_) => false,
        };
        if !stage_match {
            info!(stage = %self.name, "stage hash did not match");
        }

        let input_match = self.check_io_hash(&entry.inputs, inputs);
        if !input_match {
            info!(stage = %self.name, "input hash did not match");
        }

        let replayable = self.check_output_hash(&entry.outputs);
        if replayable.is_none() {
            info!(stage = %self.name, "output hash did not match");
        }

        if stage_match && input_match {
            Ok(replayable)
        } else {
            Ok(None)
        }
    }

    /// True when the persisted map at `path` matches the canonicalized
    /// form of `current`.
    fn check_io_hash(&self, path: &Path, current: &ValueMap) -> bool {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return false,
        };
        let cached: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => return false, // corrupted JSON heals as a miss
        };
        let current_canonical = match canonical::canonicalize_map(current) {
            Ok(map) => map,
            Err(_) => return false, // input vanished mid-digest
        };
        canonical::matches(&cached, &Value::Object(current_canonical))
    }

    /// Validate the output cache against the files currently on disk and
    /// return the replayable (paths-only) output map when consistent.
    fn check_output_hash(&self, path: &Path) -> Option<ValueMap> {
        let text = fs::read_to_string(path).ok()?;
        let cached: Value = serde_json::from_str(&text).ok()?;
        let cached_map = cached.as_object()?.clone();

        // Rehash what is actually on disk: outputs the user deleted,
        // moved, or modified since the last run must not count as a hit.
        let candidate = canonical::project_map(&cached_map, Projection::Paths);
        let recanonical = canonical::canonicalize_map(&candidate).ok()?;
        if !canonical::matches(&Value::Object(cached_map), &Value::Object(recanonical)) {
            return None;
        }

        // a freshly declared output label has no cached counterpart yet
        for label in &self.outputs {
            if !candidate.contains_key(label) {
                return None;
            }
        }

        Some(candidate)
    }

    fn load_cached_outputs(&self) -> MemoResult<ValueMap> {
        let entry = self.entry()?;
        debug!(stage = %self.name, "loading cached results");
        let text = fs::read_to_string(&entry.outputs)?;
        let cached: Value = serde_json::from_str(&text)
            .map_err(|e| MemoError::integrity(format!("unparseable output cache: {e}")))?;
        let map = cached
            .as_object()
            .ok_or_else(|| MemoError::integrity("output cache is not a JSON object"))?;
        Ok(canonical::project_map(map, Projection::Paths))
    }

    fn write_hashes(&self, inputs: &ValueMap) -> MemoResult<()> {
        let entry = self.entry()?;
        if let Some(parent) = entry.stage.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&entry.stage, self.fingerprint_bytes()?)?;
        fs::write(
            &entry.inputs,
            canonical::to_pretty_json(&canonical::canonicalize_map(inputs)?)?,
        )?;
        fs::write(
            &entry.outputs,
            canonical::to_pretty_json(&canonical::canonicalize_map(&self.results)?)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compile;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn adder() -> Stage {
        let code = compile("fn add(x, y) { return x + y; }").unwrap();
        Stage::new(code, |args: &ValueMap| {
            let x = args["x"].as_i64().unwrap();
            let y = args["y"].as_i64().unwrap();
            Ok(json!(x + y))
        })
        .with_outputs(["z"])
    }

    #[test]
    fn inputs_and_name_come_from_the_code_object() {
        let stage = adder();
        assert_eq!(stage.name(), "add");
        assert_eq!(stage.inputs(), ["x", "y"]);
        assert_eq!(stage.outputs(), ["z"]);
    }

    #[test]
    fn positional_named_and_pinned_precedence() {
        let mut stage = adder();
        assert_eq!(stage.run(&[json!(1), json!(2)]).unwrap()["z"], json!(3));

        let mut named = ValueMap::new();
        named.insert("y".into(), json!(10));
        let out = stage
            .run_with(&[json!(1), json!(2)], &named, RunFlags::default())
            .unwrap();
        assert_eq!(out["z"], json!(11));

        let mut pinned = adder().with_pinned("x", json!(4)).with_pinned("y", json!(5));
        assert_eq!(pinned.run(&[]).unwrap()["z"], json!(9));
        assert_eq!(pinned.run(&[json!(1), json!(2)]).unwrap()["z"], json!(9));
    }

    #[test]
    fn single_return_is_wrapped_and_extra_labels_pad_with_null() {
        let code = compile("fn pair(x) { return x; }").unwrap();
        let mut stage = Stage::new(code, |args: &ValueMap| Ok(args["x"].clone()))
            .with_outputs(["a", "b"]);
        let out = stage.run(&[json!(7)]).unwrap();
        assert_eq!(out["a"], json!(7));
        assert_eq!(out["b"], Value::Null);
    }

    #[test]
    fn surplus_return_values_are_truncated() {
        let code = compile("fn triple() { return many(); }").unwrap();
        let mut stage =
            Stage::new(code, |_: &ValueMap| Ok(json!([1, 2, 3]))).with_outputs(["only"]);
        let out = stage.run(&[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["only"], json!(1));
    }

    #[test]
    fn pin_and_unpin_validate_parameter_names() {
        let mut stage = adder();
        assert_matches!(stage.pin("nope", json!(1)), Err(MemoError::Validation(_)));
        stage.pin("x", json!(1)).unwrap();
        stage.unpin("x").unwrap();
        assert_matches!(stage.unpin("x"), Err(MemoError::Validation(_)));
        assert_matches!(stage.unpin("nope"), Err(MemoError::Validation(_)));
    }

    #[test]
    fn aliases_are_published_on_read() {
        let mut stage = adder().with_alias("sum", "z");
        let out = stage.run(&[json!(2), json!(3)]).unwrap();
        assert_eq!(out["sum"], out["z"]);
    }

    #[test]
    fn alias_with_missing_target_fails_at_read_time() {
        let mut stage = adder().with_alias("sum", "missing");
        assert_matches!(
            stage.run(&[json!(1), json!(2)]),
            Err(MemoError::Validation(_))
        );
    }

    #[test]
    fn worker_errors_propagate_verbatim() {
        let code = compile("fn boom() { return explode(); }").unwrap();
        let mut stage = Stage::new(code, |_: &ValueMap| -> MemoResult<Value> {
            Err(MemoError::callable("user code failed"))
        });
        assert_matches!(stage.run(&[]), Err(MemoError::Callable(_)));
    }

    #[test]
    fn force_skip_without_cache_dir_is_a_validation_error() {
        let mut stage = adder();
        let flags = RunFlags {
            force_skip: true,
            ..RunFlags::default()
        };
        assert_matches!(
            stage.run_with(&[json!(1), json!(2)], &ValueMap::new(), flags),
            Err(MemoError::Validation(_))
        );
    }
}
