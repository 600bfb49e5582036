//! The step-client interface and the output-aggregation logic the
//! orchestrator uses once a step's work items all resolve (spec §4.6, §6).

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{Args, FlowId, Step, StepId, Token};

/// The metadata passed alongside a work item's inputs to the step client.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub token: Token,
    /// A per-dispatch-attempt idempotency key; stable across retries would
    /// defeat dedup, so this is regenerated each time `WorkStarted` fires.
    pub receipt_token: String,
    /// Present for `Async` steps: the callee reports its outcome later by
    /// posting to this URL instead of returning synchronously.
    pub webhook_url: Option<String>,
}

/// The result of dispatching one work item.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success(Args),
    Failure(String),
    /// The sentinel "accepted, will report later" outcome (`ErrWorkNotCompleted`).
    NotCompleted(String),
}

/// The external collaborator that actually performs a step's side effect.
/// Real implementations call out over HTTP, invoke a script environment, or
/// start a child flow, depending on [`crate::model::StepType`].
#[async_trait]
pub trait StepClient: Send + Sync {
    async fn invoke(&self, step: &Step, inputs: &Args, invocation: &StepInvocation) -> StepOutcome;
}

/// A step client that always resolves synchronously from a fixed table of
/// outcomes, for tests.
pub struct MockStepClient {
    outcomes: dashmap::DashMap<StepId, Box<dyn Fn(&Args) -> StepOutcome + Send + Sync>>,
}

impl Default for MockStepClient {
    fn default() -> Self {
        Self {
            outcomes: dashmap::DashMap::new(),
        }
    }
}

impl MockStepClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(self, step_id: impl Into<StepId>, f: F) -> Self
    where
        F: Fn(&Args) -> StepOutcome + Send + Sync + 'static,
    {
        self.outcomes.insert(step_id.into(), Box::new(f));
        self
    }
}

#[async_trait]
impl StepClient for MockStepClient {
    async fn invoke(&self, step: &Step, inputs: &Args, _invocation: &StepInvocation) -> StepOutcome {
        match self.outcomes.get(&step.id) {
            Some(f) => f(inputs),
            None => StepOutcome::Failure(format!("no mock outcome registered for step {}", step.id)),
        }
    }
}

/// Aggregate the outputs of a step's resolved work items into the
/// attribute values it will write to the flow.
///
/// For a non-`ForEach` step there is exactly one item; its declared
/// `Output` attributes are returned directly. For a `ForEach` step, each
/// output is aggregated into an array of `{<for_each name>: <item input>,
/// value: <item output>}` entries so consumers retain per-item provenance.
/// `items` carries each item's inputs alongside its outputs since the
/// for-each value being provenanced came from the input, not the output.
pub fn aggregate_outputs(step: &Step, items: &[(&Token, &Args, &Args)]) -> Args {
    let outputs: Vec<&str> = step.outputs().map(|(name, _)| name.as_str()).collect();
    let Some(for_each_name) = step.for_each_attribute() else {
        let mut result = Args::new();
        if let Some((_, _, item_outputs)) = items.first() {
            for name in &outputs {
                if let Some(value) = item_outputs.get(*name) {
                    result.insert(name.to_string(), value.clone());
                }
            }
        }
        return result;
    };

    let mut result = Args::new();
    for name in &outputs {
        let mut entries = Vec::new();
        for (_, item_inputs, item_outputs) in items {
            let item_input = item_inputs
                .get(for_each_name.as_str())
                .cloned()
                .unwrap_or(Value::Null);
            let value = item_outputs.get(*name).cloned().unwrap_or(Value::Null);
            let mut entry = serde_json::Map::new();
            entry.insert(for_each_name.as_str().to_string(), item_input);
            entry.insert("value".to_string(), value);
            entries.push(Value::Object(entry));
        }
        result.insert(name.to_string(), Value::Array(entries));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeSpec, AttributeType, StepType, WorkConfig};
    use serde_json::json;

    fn simple_step() -> Step {
        Step {
            id: StepId::new("s"),
            name: "s".into(),
            step_type: StepType::Sync,
            attributes: [("out".into(), AttributeSpec::output(AttributeType::String))]
                .into_iter()
                .collect(),
            http: None,
            script: None,
            predicate: None,
            flow: None,
            work: WorkConfig::default(),
            memoizable: false,
        }
    }

    #[test]
    fn single_item_aggregation_passes_outputs_through() {
        let step = simple_step();
        let inputs = Args::new();
        let mut outputs = Args::new();
        outputs.insert("out".to_string(), json!("hi"));
        let token = Token::new("t1");
        let aggregated = aggregate_outputs(&step, &[(&token, &inputs, &outputs)]);
        assert_eq!(aggregated["out"], json!("hi"));
    }

    #[test]
    fn for_each_aggregation_preserves_provenance() {
        let mut step = simple_step();
        step.attributes.insert(
            "item".into(),
            AttributeSpec::required(AttributeType::Any).with_for_each(),
        );

        let token1 = Token::new("t1");
        let mut in1 = Args::new();
        in1.insert("item".to_string(), json!(1));
        let mut out1 = Args::new();
        out1.insert("out".to_string(), json!("a"));

        let token2 = Token::new("t2");
        let mut in2 = Args::new();
        in2.insert("item".to_string(), json!(2));
        let mut out2 = Args::new();
        out2.insert("out".to_string(), json!("b"));

        let aggregated = aggregate_outputs(
            &step,
            &[(&token1, &in1, &out1), (&token2, &in2, &out2)],
        );
        let arr = aggregated["out"].as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["item"], json!(1));
        assert_eq!(arr[0]["value"], json!("a"));
    }
}
