//! Latency of the work-item round trip: `begin_step` dispatch through
//! `complete_work` reporting the outcome back, bypassing flow plumbing by
//! driving the orchestrator directly against a single always-ready step.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use flowctl_engine::config::EngineConfig;
use flowctl_engine::engine::{Engine, FlowOptions};
use flowctl_engine::model::{AttributeSpec, AttributeType, FlowId, Name, Step, StepId, StepType, WorkConfig};
use flowctl_engine::store::memory::InMemoryEventStore;
use flowctl_engine::work_executor::{MockStepClient, StepClient, StepOutcome};

fn echo_step() -> Step {
    Step {
        id: StepId::new("echo"),
        name: "echo".to_string(),
        step_type: StepType::Sync,
        attributes: [(Name::new("out"), AttributeSpec::output(AttributeType::String))]
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

async fn build_engine() -> Engine<InMemoryEventStore> {
    let step_client: Arc<dyn StepClient> = Arc::new(MockStepClient::new().on("echo", |_inputs| {
        let mut out = flowctl_engine::model::Args::new();
        out.insert("out".to_string(), serde_json::json!("done"));
        StepOutcome::Success(out)
    }));
    let engine = Engine::new(InMemoryEventStore::new(), step_client, EngineConfig::default());
    engine.register_step(echo_step()).await.unwrap();
    engine.start().await.unwrap();
    engine
}

fn bench_work_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("work_dispatch");
    group.throughput(Throughput::Elements(1));

    for batch in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("sequential_flows", batch), &batch, |b, &batch| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    let engine = build_engine().await;
                    let start = std::time::Instant::now();
                    for i in 0..batch {
                        let flow_id = FlowId::new(format!("dispatch-{i}"));
                        engine
                            .start_flow(flow_id.clone(), vec![StepId::new("echo")], FlowOptions::new())
                            .await
                            .unwrap();
                        loop {
                            let state = engine.get_flow_state(&flow_id).await.unwrap().unwrap();
                            if state.status.is_terminal() {
                                break;
                            }
                            tokio::task::yield_now().await;
                        }
                    }
                    total += start.elapsed();
                    engine.stop().await.unwrap();
                }
                total
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_work_dispatch);
criterion_main!(benches);
