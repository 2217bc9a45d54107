/// End-to-end tests for the trace runner and the adaptive sampling loop,
/// driven by a scripted in-memory provider adapter.
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;

use deepconf::provider::{Message, ProviderAdapter, Role, StreamEvent, TraceEventStream};
use deepconf::runner::TraceRunner;
use deepconf::settings::{EngineSettings, OnlineSettings};
use deepconf::OnlineEngine;

const EPS: f64 = 1e-9;

/// One scripted streaming step: `Ok` carries a chunk with a single-candidate
/// logprob payload whose derived confidence equals `conf`; `Err` simulates a
/// mid-stream transport failure.
type ScriptedItem = Result<StreamEvent, String>;

fn ev(text: &str, conf: f64) -> ScriptedItem {
    Ok(StreamEvent {
        chunk: text.to_string(),
        logprobs: Some(json!({
            "top_logprobs": [ { "token": text, "logprob": -conf } ]
        })),
    })
}

/// Adapter that replays pre-scripted event streams, one per trace request,
/// and records the threshold published by the engine.  Requests beyond the
/// script are an error, so a test fails loudly if the engine samples more
/// traces than expected.
struct ScriptedAdapter {
    scripts: std::sync::Mutex<VecDeque<Vec<ScriptedItem>>>,
    published: tokio::sync::Mutex<Option<f64>>,
    model: String,
}

impl ScriptedAdapter {
    fn new(scripts: Vec<Vec<ScriptedItem>>) -> Self {
        ScriptedAdapter {
            scripts: std::sync::Mutex::new(scripts.into()),
            published: tokio::sync::Mutex::new(None),
            model: "scripted-test-model".to_string(),
        }
    }

    fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn stream_chat(
        &self,
        _messages: &[Message],
    ) -> Result<TraceEventStream, Box<dyn Error>> {
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(events) => {
                let items: Vec<Result<StreamEvent, Box<dyn Error + Send + Sync>>> = events
                    .into_iter()
                    .map(|item| item.map_err(|msg| Box::<dyn Error + Send + Sync>::from(msg)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            None => Err("scripted adapter ran out of traces".into()),
        }
    }

    async fn publish_threshold(&self, threshold: f64) {
        *self.published.lock().await = Some(threshold);
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn question() -> Vec<Message> {
    vec![Message {
        role: Role::User,
        content: "What is 17 * 23?".into(),
    }]
}

fn snapshot(settings: &EngineSettings) -> OnlineSettings {
    OnlineSettings::from_engine(settings).unwrap()
}

#[tokio::test]
async fn test_warmup_only_consensus() {
    deepconf::init_logger();

    // Four agreeing warmup traces reach consensus before any adaptive
    // trace is sampled; a fifth request would error out.
    let settings = EngineSettings {
        warmup_traces: 4,
        max_budget: 10,
        eta_percent: 100,
        consensus_threshold: 0.5,
        min_effective_window: 2,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let scripts = (0..4)
        .map(|_| vec![ev("A", 1.0), ev("A", 1.0), ev("A", 1.0), ev("A", 1.0)])
        .collect();
    let adapter = Arc::new(ScriptedAdapter::new(scripts));
    let engine = OnlineEngine::new(adapter.clone(), settings).unwrap();

    let result = engine.solve(&question()).await.unwrap();
    assert_eq!(result.winner, "AAAA");
    assert!((result.weight_of("AAAA") - 4.0).abs() < EPS);
    assert!((result.consensus() - 1.0).abs() < EPS);
    assert_eq!(adapter.remaining(), 0, "no adaptive trace should have run");
    // η = 100 keeps every warmup score, so the gate is their minimum.
    assert_eq!(*adapter.published.lock().await, Some(1.0));
}

#[tokio::test]
async fn test_threshold_is_min_of_top_eta_scores() {
    deepconf::init_logger();

    // Warmup scores are [10, 8, 6, 4]; with η = 50 the top half is kept
    // and the gate is its minimum, 8.
    let settings = EngineSettings {
        warmup_traces: 4,
        max_budget: 5,
        eta_percent: 50,
        consensus_threshold: 1.0,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let scripts = vec![
        vec![ev("a", 10.0)],
        vec![ev("b", 8.0)],
        vec![ev("c", 6.0)],
        vec![ev("d", 4.0)],
        vec![ev("a", 10.0)],
    ];
    let adapter = Arc::new(ScriptedAdapter::new(scripts));
    let engine = OnlineEngine::new(adapter.clone(), settings).unwrap();

    let result = engine.solve(&question()).await.unwrap();
    assert_eq!(*adapter.published.lock().await, Some(8.0));
    // Budget of 5 exhausted; the two kept traces both answer "a".
    assert_eq!(result.winner, "a");
    assert!((result.weight_of("a") - 20.0).abs() < EPS);
    assert_eq!(adapter.remaining(), 0);
}

#[tokio::test]
async fn test_budget_bounds_total_traces() {
    deepconf::init_logger();

    // τ = 1.0 is unreachable with split answers, so the loop must stop at
    // max_budget; the scripted adapter would error on any extra request.
    let settings = EngineSettings {
        warmup_traces: 2,
        max_budget: 4,
        eta_percent: 100,
        consensus_threshold: 1.0,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let scripts = vec![
        vec![ev("A", 1.0)],
        vec![ev("B", 1.0)],
        vec![ev("A", 1.0)],
        vec![ev("B", 1.0)],
    ];
    let adapter = Arc::new(ScriptedAdapter::new(scripts));
    let engine = OnlineEngine::new(adapter.clone(), settings).unwrap();

    let result = engine.solve(&question()).await.unwrap();
    assert_eq!(adapter.remaining(), 0);
    assert_eq!(result.winner, "A");
    assert!((result.weight_of("A") - 2.0).abs() < EPS);
    assert!((result.weight_of("B") - 2.0).abs() < EPS);
}

#[tokio::test]
async fn test_all_empty_warmup_falls_back_to_single_vote() {
    deepconf::init_logger();

    let settings = EngineSettings {
        warmup_traces: 2,
        max_budget: 4,
        eta_percent: 10,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let adapter = Arc::new(ScriptedAdapter::new(vec![vec![], vec![]]));
    let engine = OnlineEngine::new(adapter.clone(), settings).unwrap();

    let result = engine.solve(&question()).await.unwrap();
    assert_eq!(result.winner, "");
    assert!(result.weights.is_empty());
    // No signal, so no threshold was ever calibrated or published.
    assert_eq!(*adapter.published.lock().await, None);
    assert_eq!(adapter.remaining(), 0);
}

#[tokio::test]
async fn test_early_stop_cuts_trace_after_window_warmup() {
    deepconf::init_logger();

    // Confidences [1,1,1,0.1,0.1,0.1] with a window of 3 give group
    // confidences [1,1,1,0.7,0.4,0.1]; the first index below 0.5 with at
    // least 3 scored tokens is the fifth token, so the sixth never runs.
    let settings = EngineSettings {
        warmup_traces: 1,
        max_budget: 1,
        eta_percent: 100,
        consensus_threshold: 0.5,
        min_effective_window: 3,
        absolute_window_cap: 16,
        group_window_target: 3,
        ..EngineSettings::default()
    };
    let online = snapshot(&settings);
    let adapter = ScriptedAdapter::new(vec![vec![
        ev("t1", 1.0),
        ev("t2", 1.0),
        ev("t3", 1.0),
        ev("t4", 0.1),
        ev("t5", 0.1),
        ev("t6", 0.1),
    ]]);
    let runner = TraceRunner::new(&adapter, &online);

    let trace = runner.run(&question(), Some(0.5)).await.unwrap();
    assert_eq!(trace.token_confs.len(), 5);
    assert_eq!(trace.group_confs.len(), 5);
    assert_eq!(trace.answer, "t1t2t3t4t5");
    let expected_groups = [1.0, 1.0, 1.0, 0.7, 0.4];
    for (got, want) in trace.group_confs.iter().zip(expected_groups.iter()) {
        assert!((got - want).abs() < EPS, "groups {:?}", trace.group_confs);
    }
}

#[tokio::test]
async fn test_no_threshold_consumes_full_stream() {
    let settings = EngineSettings {
        warmup_traces: 1,
        max_budget: 1,
        eta_percent: 100,
        min_effective_window: 3,
        absolute_window_cap: 16,
        group_window_target: 3,
        ..EngineSettings::default()
    };
    let online = snapshot(&settings);
    let adapter = ScriptedAdapter::new(vec![vec![
        ev("t1", 1.0),
        ev("t2", 1.0),
        ev("t3", 1.0),
        ev("t4", 0.1),
        ev("t5", 0.1),
        ev("t6", 0.1),
    ]]);
    let runner = TraceRunner::new(&adapter, &online);

    let trace = runner.run(&question(), None).await.unwrap();
    assert_eq!(trace.token_confs.len(), 6);
    assert_eq!(trace.answer, "t1t2t3t4t5t6");
}

#[tokio::test]
async fn test_transport_error_seals_partial_trace() {
    deepconf::init_logger();

    let settings = EngineSettings {
        warmup_traces: 1,
        max_budget: 1,
        eta_percent: 100,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let online = snapshot(&settings);
    let adapter = ScriptedAdapter::new(vec![vec![
        ev("partial", 2.0),
        Err("connection reset by peer".to_string()),
        ev("never-seen", 2.0),
    ]]);
    let runner = TraceRunner::new(&adapter, &online);

    let trace = runner.run(&question(), None).await.unwrap();
    assert_eq!(trace.answer, "partial");
    assert_eq!(trace.token_confs.len(), 1);
    assert_eq!(trace.group_confs.len(), 1);
}

#[tokio::test]
async fn test_events_without_logprobs_score_zero() {
    let settings = EngineSettings {
        warmup_traces: 1,
        max_budget: 1,
        eta_percent: 100,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let online = snapshot(&settings);
    let adapter = ScriptedAdapter::new(vec![vec![
        Ok(StreamEvent {
            chunk: "no-logprobs".to_string(),
            logprobs: None,
        }),
        Ok(StreamEvent {
            chunk: String::new(),
            logprobs: None,
        }),
        ev("scored", 3.0),
    ]]);
    let runner = TraceRunner::new(&adapter, &online);

    let trace = runner.run(&question(), None).await.unwrap();
    // Empty chunks are skipped outright; the payload-less chunk scores 0.
    assert_eq!(trace.answer, "no-logprobsscored");
    assert_eq!(trace.token_confs.len(), trace.group_confs.len());
    assert_eq!(trace.token_confs, vec![0.0, 3.0]);
}

#[tokio::test]
async fn test_open_failure_propagates() {
    let settings = EngineSettings {
        warmup_traces: 1,
        max_budget: 1,
        eta_percent: 100,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 4,
        ..EngineSettings::default()
    };
    let adapter = Arc::new(ScriptedAdapter::new(vec![]));
    let engine = OnlineEngine::new(adapter, settings).unwrap();
    assert!(engine.solve(&question()).await.is_err());
}

#[tokio::test]
async fn test_solve_scores_with_bottom10_group_confidence() {
    deepconf::init_logger();

    // With a window of 1, trace [4, 0] has group confidences [4, 0] and a
    // bottom-10 score of 0; the steadier [1, 1] trace must win the vote
    // even though its average confidence is lower.
    let settings = EngineSettings {
        warmup_traces: 2,
        max_budget: 2,
        eta_percent: 100,
        consensus_threshold: 1.0,
        min_effective_window: 1,
        absolute_window_cap: 16,
        group_window_target: 1,
        ..EngineSettings::default()
    };
    let scripts = vec![
        vec![ev("X", 4.0), ev("X", 0.0)],
        vec![ev("Y", 1.0), ev("Y", 1.0)],
    ];
    let adapter = Arc::new(ScriptedAdapter::new(scripts));
    let engine = OnlineEngine::new(adapter.clone(), settings).unwrap();

    let result = engine.solve(&question()).await.unwrap();
    assert_eq!(result.winner, "YY");
    assert!((result.weight_of("XX") - 0.0).abs() < EPS);
    assert!((result.weight_of("YY") - 1.0).abs() < EPS);
    // Gate = min of the kept bottom-10 scores = 0.
    assert_eq!(*adapter.published.lock().await, Some(0.0));
}

#[test]
fn test_engine_construction_rejects_bad_settings() {
    let settings = EngineSettings {
        warmup_traces: 8,
        max_budget: 4,
        ..EngineSettings::default()
    };
    let adapter = Arc::new(ScriptedAdapter::new(vec![]));
    assert!(OnlineEngine::new(adapter, settings).is_err());
}

#[test]
fn test_for_model_resolves_against_adapter_model_name() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![]));
    let engine = OnlineEngine::for_model(adapter, None).unwrap();
    // "scripted-test-model" matches no override; defaults stand.
    assert_eq!(engine.settings().eta_percent, 10);
    assert_eq!(engine.settings().warmup_traces, 16);
}
