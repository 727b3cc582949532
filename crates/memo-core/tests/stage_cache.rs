//! Stage-level caching behaviour against a real cache directory.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use memo_core::canonical::ValueMap;
use memo_core::digest::digest_file;
use memo_core::fingerprint::compile;
use memo_core::stage::{RunFlags, Stage};
use memo_core::MemoResult;

fn adder_code() -> memo_core::fingerprint::CodeObject {
    compile("fn add(x, y) { return x + y; }").unwrap()
}

fn adder_worker(calls: Arc<AtomicUsize>) -> impl Fn(&ValueMap) -> MemoResult<Value> + Send + Sync {
    move |args: &ValueMap| {
        calls.fetch_add(1, Ordering::SeqCst);
        let x = args["x"].as_i64().unwrap();
        let y = args["y"].as_i64().unwrap();
        Ok(json!(x + y))
    }
}

#[test]
fn cached_rerun_replays_without_invoking_the_worker() {
    let cache = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stage = Stage::new(adder_code(), adder_worker(calls.clone()))
        .with_outputs(["z"])
        .with_cache_dir(cache.path());

    let first = stage.run(&[json!(1), json!(2)]).unwrap();
    assert_eq!(first["z"], json!(3));
    assert!(stage.ran_this_call());
    assert!(!stage.loaded_from_cache());

    let second = stage.run(&[json!(1), json!(2)]).unwrap();
    assert_eq!(second["z"], json!(3));
    assert!(!stage.ran_this_call());
    assert!(stage.loaded_from_cache());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // changed inputs invalidate
    let third = stage.run(&[json!(1), json!(3)]).unwrap();
    assert_eq!(third["z"], json!(4));
    assert!(stage.ran_this_call());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn force_skip_replays_stale_results_and_a_normal_run_recovers() {
    let cache = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stage = Stage::new(adder_code(), adder_worker(calls))
        .with_outputs(["z"])
        .with_cache_dir(cache.path());

    assert_eq!(stage.run(&[json!(1), json!(2)]).unwrap()["z"], json!(3));
    assert_eq!(stage.run(&[json!(1), json!(3)]).unwrap()["z"], json!(4));

    // the cache still holds the (1, 3) outputs
    let skip = RunFlags {
        force_skip: true,
        ..RunFlags::default()
    };
    let stale = stage
        .run_with(&[json!(1), json!(2)], &ValueMap::new(), skip)
        .unwrap();
    assert_eq!(stale["z"], json!(4));
    assert!(stage.loaded_from_cache());

    // a normal run notices the input mismatch and restores correctness
    let fixed = stage.run(&[json!(1), json!(2)]).unwrap();
    assert_eq!(fixed["z"], json!(3));
    assert!(stage.ran_this_call());
}

#[test]
fn force_run_and_force_write_refresh_the_entry() {
    let cache = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stage = Stage::new(adder_code(), adder_worker(calls.clone()))
        .with_outputs(["z"])
        .with_cache_dir(cache.path());

    stage.run(&[json!(1), json!(2)]).unwrap();
    let flags = RunFlags {
        force_run: true,
        force_write_hash: true,
        ..RunFlags::default()
    };
    let out = stage
        .run_with(&[json!(1), json!(2)], &ValueMap::new(), flags)
        .unwrap();
    assert_eq!(out["z"], json!(3));
    assert!(stage.ran_this_call());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn file_arguments_are_recorded_as_file_records() {
    let cache = tempfile::tempdir().unwrap();
    let data = tempfile::NamedTempFile::new().unwrap();
    fs::write(data.path(), b"input bytes").unwrap();
    let path = data.path().to_string_lossy().into_owned();

    let code = compile("fn identity(a) { return a; }").unwrap();
    let mut stage = Stage::new(code, |args: &ValueMap| Ok(args["a"].clone()))
        .with_outputs(["a"])
        .with_cache_dir(cache.path());

    let out = stage.run(&[json!(path.clone())]).unwrap();
    assert_eq!(out["a"], json!(path));

    let expected_hash = digest_file(data.path()).unwrap();
    for cache_file in ["identity.inputs", "identity.outputs"] {
        let text = fs::read_to_string(cache.path().join(cache_file)).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["a"]["file"], json!(path));
        assert_eq!(parsed["a"]["hash"], json!(expected_hash));
    }

    // replay projects the record back to the bare path
    let replayed = stage.run(&[json!(path.clone())]).unwrap();
    assert!(stage.loaded_from_cache());
    assert_eq!(replayed["a"], json!(path));
}

#[test]
fn files_nested_in_lists_are_recorded_too() {
    let cache = tempfile::tempdir().unwrap();
    let f1 = tempfile::NamedTempFile::new().unwrap();
    let f2 = tempfile::NamedTempFile::new().unwrap();
    fs::write(f1.path(), b"one").unwrap();
    fs::write(f2.path(), b"two").unwrap();
    let p1 = f1.path().to_string_lossy().into_owned();
    let p2 = f2.path().to_string_lossy().into_owned();

    let code = compile("fn bundle(a, b) { return wrap(a, b); }").unwrap();
    let mut stage = Stage::new(code, |args: &ValueMap| {
        Ok(json!([[args["a"], args["b"], 1]]))
    })
    .with_outputs(["a"])
    .with_cache_dir(cache.path());

    let out = stage.run(&[json!(p1.clone()), json!(p2.clone())]).unwrap();
    assert_eq!(out["a"], json!([p1, p2, 1]));

    let text = fs::read_to_string(cache.path().join("bundle.outputs")).unwrap();
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert!(parsed["a"][0]["hash"].is_string());
    assert!(parsed["a"][1]["hash"].is_string());
    assert_eq!(parsed["a"][2], json!(1));
}

#[test]
fn modified_output_file_forces_a_rerun() {
    let cache = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let produced = scratch.path().join("out.txt");
    let produced_str = produced.to_string_lossy().into_owned();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let target = produced_str.clone();
    let code = compile("fn produce(tag) { return emit(tag); }").unwrap();
    let mut stage = Stage::new(code, move |args: &ValueMap| -> memo_core::MemoResult<Value> {
        counter.fetch_add(1, Ordering::SeqCst);
        fs::write(&target, args["tag"].to_string())?;
        Ok(json!(target))
    })
    .with_outputs(["f"])
    .with_cache_dir(cache.path());

    stage.run(&[json!("v1")]).unwrap();
    stage.run(&[json!("v1")]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the user tampers with the produced file: integrity check re-runs
    fs::write(&produced, b"tampered").unwrap();
    stage.run(&[json!("v1")]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(stage.ran_this_call());
}

#[test]
fn corrupted_cache_json_heals_as_a_miss() {
    let cache = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stage = Stage::new(adder_code(), adder_worker(calls.clone()))
        .with_outputs(["z"])
        .with_cache_dir(cache.path());

    stage.run(&[json!(1), json!(2)]).unwrap();
    fs::write(cache.path().join("add.inputs"), b"{ not json").unwrap();

    let out = stage.run(&[json!(1), json!(2)]).unwrap();
    assert_eq!(out["z"], json!(3));
    assert!(stage.ran_this_call());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the entry was rewritten and hits again
    stage.run(&[json!(1), json!(2)]).unwrap();
    assert!(stage.loaded_from_cache());
}

#[test]
fn code_changes_invalidate_while_docstrings_do_not() {
    let cache = tempfile::tempdir().unwrap();

    let run_with_code = |source: &str, expect_ran: bool| {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stage = Stage::new(compile(source).unwrap(), adder_worker(calls))
            .with_outputs(["z"])
            .with_name("add")
            .with_cache_dir(cache.path());
        stage.run(&[json!(1), json!(2)]).unwrap();
        assert_eq!(stage.ran_this_call(), expect_ran, "source: {source}");
    };

    run_with_code("fn add(x, y) { return x + y; }", true);
    // docstring and whitespace churn: still a hit
    run_with_code("fn add(x, y) { \"sums the inputs\";  return x + y ; }", false);
    // behavioural change: miss
    run_with_code("fn add(x, y) { return x + y + 0; }", true);
}

#[test]
fn newly_declared_output_label_invalidates_the_entry() {
    let cache = tempfile::tempdir().unwrap();
    let code = compile("fn pair(x) { return dup(x); }").unwrap();
    let mut stage = Stage::new(code.clone(), |args: &ValueMap| {
        Ok(json!([args["x"], args["x"]]))
    })
    .with_outputs(["a"])
    .with_cache_dir(cache.path());
    stage.run(&[json!(5)]).unwrap();

    // same code, same inputs, but the schema grew a label
    let mut extended = Stage::new(code, |args: &ValueMap| Ok(json!([args["x"], args["x"]])))
        .with_outputs(["a", "b"])
        .with_cache_dir(cache.path());
    extended.run(&[json!(5)]).unwrap();
    assert!(extended.ran_this_call());
}
