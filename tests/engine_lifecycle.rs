//! End-to-end tests driving the full `Engine` facade: register -> start ->
//! run a flow to completion -> stop, plus the crash-recovery round trip.

use std::sync::Arc;

use flowctl_engine::config::EngineConfig;
use flowctl_engine::engine::{Engine, FlowOptions};
use flowctl_engine::model::{
    AttributeSpec, AttributeType, FlowId, FlowStatus, Name, Step, StepId, StepType, WorkConfig,
};
use flowctl_engine::store::memory::InMemoryEventStore;
use flowctl_engine::work_executor::{MockStepClient, StepClient, StepOutcome};

fn step(id: &str, attributes: Vec<(&str, AttributeSpec)>) -> Step {
    Step {
        id: StepId::new(id),
        name: id.to_string(),
        step_type: StepType::Sync,
        attributes: attributes
            .into_iter()
            .map(|(name, spec)| (Name::new(name), spec))
            .collect(),
        http: None,
        script: None,
        predicate: None,
        flow: None,
        work: WorkConfig::default(),
        memoizable: false,
    }
}

fn two_step_pipeline() -> (Step, Step) {
    let producer = step(
        "producer",
        vec![("produced", AttributeSpec::output(AttributeType::String))],
    );
    let consumer = step(
        "consumer",
        vec![
            ("produced", AttributeSpec::required(AttributeType::String)),
            ("consumed", AttributeSpec::output(AttributeType::String)),
        ],
    );
    (producer, consumer)
}

async fn run_until<F: Fn(&flowctl_engine::model::FlowState) -> bool>(
    engine: &Engine<InMemoryEventStore>,
    flow_id: &FlowId,
    predicate: F,
) -> flowctl_engine::model::FlowState {
    for _ in 0..200 {
        if let Some(state) = engine.get_flow_state(flow_id).await.unwrap() {
            if predicate(&state) {
                return state;
            }
        }
        tokio::task::yield_now().await;
    }
    panic!("flow {flow_id} did not reach the expected state in time");
}

#[tokio::test]
async fn a_two_step_pipeline_runs_to_completion_through_the_engine() {
    let (producer, consumer) = two_step_pipeline();
    let step_client: Arc<dyn StepClient> = Arc::new(
        MockStepClient::new()
            .on("producer", |_inputs| {
                let mut out = flowctl_engine::model::Args::new();
                out.insert("produced".to_string(), serde_json::json!("hello"));
                StepOutcome::Success(out)
            })
            .on("consumer", |inputs| {
                let mut out = flowctl_engine::model::Args::new();
                out.insert(
                    "consumed".to_string(),
                    serde_json::json!(format!("got: {}", inputs["produced"])),
                );
                StepOutcome::Success(out)
            }),
    );

    let engine = Engine::new(InMemoryEventStore::new(), step_client, EngineConfig::default());
    engine.register_step(producer).await.unwrap();
    engine.register_step(consumer).await.unwrap();
    engine.start().await.unwrap();

    let flow_id = FlowId::new("pipeline-1");
    engine
        .start_flow(
            flow_id.clone(),
            vec![StepId::new("consumer")],
            FlowOptions::new(),
        )
        .await
        .unwrap();

    let state = run_until(&engine, &flow_id, |s| s.status.is_terminal()).await;
    assert_eq!(state.status, FlowStatus::Completed);
    let consumed = &state.attributes[&Name::new("consumed")];
    assert_eq!(consumed.value, serde_json::json!("got: \"hello\""));
    assert_eq!(consumed.step_id, StepId::new("consumer"));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn start_recover_flow_start_is_idempotent() {
    let (producer, consumer) = two_step_pipeline();
    let step_client: Arc<dyn StepClient> = Arc::new(
        MockStepClient::new()
            .on("producer", |_inputs| {
                let mut out = flowctl_engine::model::Args::new();
                out.insert("produced".to_string(), serde_json::json!("v"));
                StepOutcome::Success(out)
            })
            .on("consumer", |_inputs| {
                let mut out = flowctl_engine::model::Args::new();
                out.insert("consumed".to_string(), serde_json::json!("done"));
                StepOutcome::Success(out)
            }),
    );

    let engine = Engine::new(InMemoryEventStore::new(), step_client, EngineConfig::default());
    engine.register_step(producer).await.unwrap();
    engine.register_step(consumer).await.unwrap();

    // Start, recover, start again: the second start must not clobber
    // already-completed work or error out on the repeated call.
    let first = engine.start().await.unwrap();
    assert_eq!(first.candidates, 0);

    let flow_id = FlowId::new("idempotent-1");
    engine
        .start_flow(
            flow_id.clone(),
            vec![StepId::new("consumer")],
            FlowOptions::new(),
        )
        .await
        .unwrap();
    run_until(&engine, &flow_id, |s| s.status.is_terminal()).await;

    engine.recover_flow(flow_id.clone()).await.unwrap();
    let report = engine.start().await.unwrap();
    assert_eq!(report, flowctl_engine::recovery::RecoveryReport::default());

    let state = engine.get_flow_state(&flow_id).await.unwrap().unwrap();
    assert_eq!(state.status, FlowStatus::Completed);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn a_failing_step_fails_the_flow() {
    let mut failing = step(
        "failing",
        vec![("out", AttributeSpec::output(AttributeType::String))],
    );
    failing.work = WorkConfig {
        max_retries: 0,
        ..WorkConfig::default()
    };

    let step_client: Arc<dyn StepClient> = Arc::new(
        MockStepClient::new().on("failing", |_inputs| StepOutcome::Failure("boom".to_string())),
    );

    let engine = Engine::new(InMemoryEventStore::new(), step_client, EngineConfig::default());
    engine.register_step(failing).await.unwrap();
    engine.start().await.unwrap();

    let flow_id = FlowId::new("failure-1");
    engine
        .start_flow(flow_id.clone(), vec![StepId::new("failing")], FlowOptions::new())
        .await
        .unwrap();

    let state = run_until(&engine, &flow_id, |s| s.status.is_terminal()).await;
    assert_eq!(state.status, FlowStatus::Failed);

    engine.stop().await.unwrap();
}
