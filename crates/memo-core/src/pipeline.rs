//! Pipeline: a DAG of stages evaluated in declared order.
//!
//! The pipeline does not derive a topological order; the edge list *is*
//! the execution order. Each edge names the stages whose results feed the
//! downstream stage, or the start sentinel for stages fed from the
//! pipeline's own arguments.
//!
//! Routing is by parameter name: the union of the predecessors' result
//! maps (later predecessors win on key collision), overridden by the
//! downstream stage's pinned values, filtered down to the stage's
//! declared input names. Declared parameters with no matching key are
//! left for the worker to default or reject.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;

use crate::canonical::{self, ValueMap};
use crate::errors::{MemoError, MemoResult};
use crate::stage::{RunFlags, Stage};

/// Shared handle to a stage. Stages appear in several edges (as producer
/// and consumer), so the pipeline and the caller share them.
pub type StageRef = Arc<Mutex<Stage>>;

/// Wrap a stage for use in a pipeline definition.
pub fn stage_ref(stage: Stage) -> StageRef {
    Arc::new(Mutex::new(stage))
}

/// Where a stage's inputs come from.
pub enum Feed {
    /// The start sentinel: inputs are the pipeline's own run arguments.
    Start,
    /// Results of one or more upstream stages, in override order.
    From(Vec<StageRef>),
}

/// One pipeline edge: the feed and the stage it runs.
pub struct Edge {
    pub feed: Feed,
    pub stage: StageRef,
}

impl Edge {
    /// An entry-point stage fed from the pipeline arguments.
    pub fn start(stage: &StageRef) -> Self {
        Self {
            feed: Feed::Start,
            stage: Arc::clone(stage),
        }
    }

    /// A stage fed from the results of `predecessors`.
    pub fn after(predecessors: &[&StageRef], stage: &StageRef) -> Self {
        Self {
            feed: Feed::From(predecessors.iter().map(|s| Arc::clone(*s)).collect()),
            stage: Arc::clone(stage),
        }
    }
}

/// A pipeline definition plus the accumulated results of its last run.
pub struct Pipeline {
    edges: Vec<Edge>,
    results: ValueMap,
}

impl Pipeline {
    /// Validate and store a definition. A stage-fed edge must name at
    /// least one predecessor.
    pub fn new(edges: Vec<Edge>) -> MemoResult<Self> {
        for (i, edge) in edges.iter().enumerate() {
            if let Feed::From(predecessors) = &edge.feed {
                if predecessors.is_empty() {
                    return Err(MemoError::validation(format!(
                        "pipeline edge {i} declares no predecessor stages"
                    )));
                }
            }
        }
        Ok(Self {
            edges,
            results: ValueMap::new(),
        })
    }

    /// Run with positional arguments only.
    pub fn run(&mut self, args: &[Value]) -> MemoResult<ValueMap> {
        self.run_with(args, &ValueMap::new())
    }

    /// Evaluate every edge in order. Start-fed stages receive `args` and
    /// `named` verbatim; stage-fed stages receive routed predecessor
    /// results.
    pub fn run_with(&mut self, args: &[Value], named: &ValueMap) -> MemoResult<ValueMap> {
        for edge in &self.edges {
            let stage_results = match &edge.feed {
                Feed::Start => edge
                    .stage
                    .lock()
                    .run_with(args, named, RunFlags::default())?,
                Feed::From(predecessors) => {
                    let mut combined = ValueMap::new();
                    for predecessor in predecessors {
                        for (key, value) in predecessor.lock().results()? {
                            combined.insert(key, value);
                        }
                    }

                    let mut stage = edge.stage.lock();
                    for (key, value) in stage.pinned().clone() {
                        combined.insert(key, value);
                    }

                    let mut routed = ValueMap::new();
                    for input in stage.inputs() {
                        if let Some(value) = combined.get(input) {
                            routed.insert(input.clone(), value.clone());
                        }
                    }

                    match stage.run_with(&[], &routed, RunFlags::default()) {
                        Ok(results) => results,
                        Err(err) => {
                            error!(
                                stage = %stage.name(),
                                "stage failed; assembled inputs {} from upstream results {}",
                                serde_json::Value::Object(routed),
                                serde_json::Value::Object(combined)
                            );
                            return Err(err);
                        }
                    }
                }
            };

            for (key, value) in stage_results {
                self.results.insert(key, value);
            }
        }

        Ok(self.results.clone())
    }

    /// Accumulated union of every stage's results, with bare strings that
    /// name existing files rewritten to absolute paths. Presentation
    /// only; cache JSON keeps the original strings inside file-records.
    pub fn results(&self) -> ValueMap {
        let mut out = ValueMap::new();
        for (key, value) in &self.results {
            out.insert(key.clone(), canonical::rewrite_abspaths(value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compile;
    use crate::stage::Stage;
    use serde_json::json;

    fn doubler() -> Stage {
        let code = compile("fn double(z) { return z + z; }").unwrap();
        Stage::new(code, |args: &ValueMap| {
            Ok(json!(args["z"].as_i64().unwrap() * 2))
        })
        .with_outputs(["d"])
    }

    #[test]
    fn empty_predecessor_list_is_rejected() {
        let s = stage_ref(doubler());
        let err = Pipeline::new(vec![Edge {
            feed: Feed::From(vec![]),
            stage: s,
        }]);
        assert!(err.is_err());
    }

    #[test]
    fn later_predecessors_override_earlier_on_collision() {
        let first = compile("fn first() { return one(); }").unwrap();
        let s0 = stage_ref(
            Stage::new(first, |_: &ValueMap| Ok(json!(1))).with_outputs(["z"]),
        );
        let second = compile("fn second() { return two(); }").unwrap();
        let s1 = stage_ref(
            Stage::new(second, |_: &ValueMap| Ok(json!(5))).with_outputs(["z"]),
        );
        let sink = stage_ref(doubler());

        let mut pipeline = Pipeline::new(vec![
            Edge::start(&s0),
            Edge::start(&s1),
            Edge::after(&[&s0, &s1], &sink),
        ])
        .unwrap();

        let results = pipeline.run(&[]).unwrap();
        assert_eq!(results["d"], json!(10));
    }

    #[test]
    fn pinned_values_override_routed_results() {
        let src = compile("fn src() { return val(); }").unwrap();
        let s0 = stage_ref(Stage::new(src, |_: &ValueMap| Ok(json!(3))).with_outputs(["z"]));
        let sink = stage_ref(doubler().with_pinned("z", json!(100)));

        let mut pipeline =
            Pipeline::new(vec![Edge::start(&s0), Edge::after(&[&s0], &sink)]).unwrap();
        let results = pipeline.run(&[]).unwrap();
        assert_eq!(results["d"], json!(200));
    }
}
