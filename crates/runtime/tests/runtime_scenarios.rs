//! End-to-end runtime scenarios
//!
//! Each scenario runs a DSL definition through a `WorkflowService` backed by
//! the in-memory store and a `ManualClock`, so durable timers fire only when a
//! test moves time forward. Actions come from a counting in-memory registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use warden_durable::{ExecutorError, ManualClock, UpdateRejected, WorkflowEvent, WorkflowStatus};
use warden_runtime::{
    ActionOutcome, InMemoryActionRegistry, InvocationContext, InvocationError, RunInput,
    RuntimeConfig, ServiceError, StaticSecretsProvider, WorkflowDefinition, WorkflowService,
};

// ============================================================================
// Harness
// ============================================================================

#[derive(Debug, Clone)]
#[allow(dead_code)]
struct Call {
    action: String,
    stream: String,
    action_ref: String,
    args: Value,
}

/// Every invocation the registry saw
#[derive(Default)]
struct Calls {
    log: Mutex<Vec<Call>>,
}

impl Calls {
    /// Record a call and return how often this stream-qualified ref has run
    fn record(&self, action: &str, args: &Value, ctx: &InvocationContext) -> usize {
        let mut log = self.log.lock();
        log.push(Call {
            action: action.to_string(),
            stream: ctx.stream.clone(),
            action_ref: ctx.action_ref.clone(),
            args: args.clone(),
        });
        log.iter()
            .filter(|c| c.stream == ctx.stream && c.action_ref == ctx.action_ref)
            .count()
    }

    fn count(&self, action_ref: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| c.action_ref == action_ref)
            .count()
    }

    fn total(&self) -> usize {
        self.log.lock().len()
    }
}

fn delay_of(args: &Value) -> Duration {
    Duration::from_millis(args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0))
}

fn registry(calls: Arc<Calls>) -> InMemoryActionRegistry {
    let mut registry = InMemoryActionRegistry::with_builtins();

    let c = calls.clone();
    registry.register("test.echo", move |args: Value, ctx: InvocationContext| {
        c.record("test.echo", &args, &ctx);
        async move {
            tokio::time::sleep(delay_of(&args)).await;
            Ok(args.get("value").cloned().unwrap_or(Value::Null))
        }
    });

    let c = calls.clone();
    registry.register("test.counter", move |args: Value, ctx: InvocationContext| {
        let n = c.record("test.counter", &args, &ctx);
        async move { Ok(json!(n)) }
    });

    let c = calls.clone();
    registry.register("test.flaky", move |args: Value, ctx: InvocationContext| {
        let n = c.record("test.flaky", &args, &ctx) as u64;
        let succeed_on = args.get("succeed_on").and_then(Value::as_u64).unwrap_or(1);
        async move {
            if n >= succeed_on {
                Ok(json!(n))
            } else {
                Err(InvocationError::retryable("Unavailable", format!("attempt {} refused", n)))
            }
        }
    });

    let c = calls.clone();
    registry.register("test.status", move |args: Value, ctx: InvocationContext| {
        let n = c.record("test.status", &args, &ctx) as u64;
        let ready_on = args.get("ready_on").and_then(Value::as_u64).unwrap_or(1);
        let status = if n >= ready_on { "success" } else { "loading" };
        async move { Ok(json!({ "status": status })) }
    });

    let c = calls.clone();
    registry.register("test.ping", move |args: Value, ctx: InvocationContext| {
        c.record("test.ping", &args, &ctx);
        async move {
            tokio::time::sleep(delay_of(&args)).await;
            let host = args.get("host").and_then(Value::as_str).unwrap_or_default().to_string();
            if host.starts_with("bad") {
                Err(InvocationError::new("PingFailed", format!("ping of {} failed", host)))
            } else {
                Ok(json!({ "host": host, "open": [22, 443] }))
            }
        }
    });

    let c = calls;
    registry.register("test.auth", move |args: Value, ctx: InvocationContext| {
        c.record("test.auth", &args, &ctx);
        let secrets = ctx.credentials.len();
        async move {
            let authorized = args.get("key") == Some(&json!("k-123"));
            Ok(json!({ "authorized": authorized, "secrets": secrets }))
        }
    });

    registry
}

fn t0() -> DateTime<Utc> {
    "2024-05-01T15:00:00Z".parse().unwrap()
}

struct Harness {
    service: WorkflowService,
    clock: Arc<ManualClock>,
    calls: Arc<Calls>,
}

impl Harness {
    fn new() -> Self {
        Self::with(RuntimeConfig::default(), StaticSecretsProvider::new())
    }

    fn with(config: RuntimeConfig, secrets: StaticSecretsProvider) -> Self {
        let clock = Arc::new(ManualClock::at(t0()));
        let calls = Arc::new(Calls::default());
        let service = WorkflowService::builder()
            .config(config)
            .registry(Arc::new(registry(calls.clone())))
            .secrets(Arc::new(secrets))
            .clock(clock.clone())
            .build();
        Self {
            service,
            clock,
            calls,
        }
    }

    async fn start_with(&self, yaml: &str, input: RunInput) -> Uuid {
        let definition = WorkflowDefinition::parse(yaml).unwrap();
        let id = self.service.start(definition, input).await.unwrap();
        self.service.run_until_idle().await.unwrap();
        id
    }

    async fn start(&self, yaml: &str, trigger: Value) -> Uuid {
        let input = RunInput {
            trigger,
            ..Default::default()
        };
        self.start_with(yaml, input).await
    }

    async fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.service.run_until_idle().await.unwrap();
    }

    async fn status(&self, id: Uuid) -> WorkflowStatus {
        self.service.status(id).await.unwrap()
    }

    async fn outcome(&self, id: Uuid, action_ref: &str) -> Value {
        let context = self.service.context(id).await.unwrap();
        context["ACTIONS"][action_ref].clone()
    }
}

// ============================================================================
// Timer Scheduler
// ============================================================================

#[tokio::test]
async fn wait_until_nine_am_tomorrow_fires_once() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: report
    action: test.echo
    wait_until: 9am tomorrow
    args:
      value: sent
  - ref: notify
    action: test.echo
    depends_on: [report]
    args:
      value: ${{ ACTIONS.report.result }}
"#,
            json!({}),
        )
        .await;

    assert_eq!(h.calls.total(), 0);
    assert_eq!(h.status(id).await, WorkflowStatus::Running);

    let history = h.service.history(id).await.unwrap();
    let timers: Vec<DateTime<Utc>> = history
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::TimerStarted { fire_at, .. } => Some(*fire_at),
            _ => None,
        })
        .collect();
    assert_eq!(timers, vec!["2024-05-02T09:00:00Z".parse::<DateTime<Utc>>().unwrap()]);

    h.advance(Duration::from_secs(17 * 3600 + 59 * 60)).await;
    assert_eq!(h.calls.total(), 0);

    h.advance(Duration::from_secs(60)).await;
    assert_eq!(h.calls.count("report"), 1);
    assert_eq!(h.calls.count("notify"), 1);
    assert_eq!(h.outcome(id, "notify").await["result"], "sent");
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn past_wait_until_runs_immediately() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: report
    action: test.echo
    wait_until: "2024-01-01T00:00:00Z"
"#,
            json!({}),
        )
        .await;

    assert_eq!(h.calls.count("report"), 1);
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    let history = h.service.history(id).await.unwrap();
    assert!(!history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerStarted { .. })));
}

// ============================================================================
// Retry Controller
// ============================================================================

#[tokio::test]
async fn retry_until_reinvokes_until_condition_holds() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: check
    action: test.counter
    retry_policy:
      retry_until: ${{ ACTIONS.check.result >= 3 }}
      max_attempts: 5
returns: ${{ ACTIONS.check.result }}
"#,
            json!({}),
        )
        .await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.result, Some(json!(3)));
    assert_eq!(h.calls.count("check"), 3);
}

#[tokio::test]
async fn retry_until_polls_until_status_success() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: poll
    action: test.status
    args:
      ready_on: 3
    retry_policy:
      retry_until: ${{ ACTIONS.poll.result.status == 'success' }}
      max_attempts: 5
"#,
            json!({}),
        )
        .await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.calls.count("poll"), 3);
    let poll = h.outcome(id, "poll").await;
    assert_eq!(poll["status"], "success");
    assert_eq!(poll["result"], json!({ "status": "success" }));
}

#[tokio::test]
async fn retry_until_exhaustion_fails_run() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: check
    action: test.counter
    retry_policy:
      retry_until: ${{ ACTIONS.check.result >= 10 }}
      max_attempts: 2
"#,
            json!({}),
        )
        .await;

    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.code.as_deref(), Some("RetryExhausted"));
    let details = error.details.unwrap();
    assert_eq!(details["action_ref"], "check");
    assert_eq!(details["error"]["last"]["result"], 2);
    assert_eq!(h.calls.count("check"), 2);
}

#[tokio::test]
async fn retryable_errors_back_off_on_durable_timers() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: fetch
    action: test.flaky
    args:
      succeed_on: 3
    retry_policy:
      max_attempts: 3
      backoff:
        initial_interval: 10000
"#,
            json!({}),
        )
        .await;

    assert_eq!(h.calls.count("fetch"), 1);
    h.advance(Duration::from_secs(10)).await;
    assert_eq!(h.calls.count("fetch"), 2);
    assert_eq!(h.status(id).await, WorkflowStatus::Running);

    h.advance(Duration::from_secs(10)).await;
    assert_eq!(h.calls.count("fetch"), 3);
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    assert_eq!(h.outcome(id, "fetch").await["result"], 3);
}

#[test_log::test(tokio::test)]
async fn retry_timeout_is_enforced_by_the_durable_clock() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: poll
    action: test.counter
    retry_policy:
      retry_until: ${{ ACTIONS.poll.result >= 100 }}
      timeout: 60
      backoff:
        initial_interval: 30000
"#,
            json!({}),
        )
        .await;

    h.advance(Duration::from_secs(30)).await;
    assert_eq!(h.calls.count("poll"), 2);
    h.advance(Duration::from_secs(30)).await;

    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error.unwrap().code.as_deref(), Some("RetryTimeout"));
    assert_eq!(h.calls.count("poll"), 2);
}

#[test_log::test(tokio::test)]
async fn retry_timeout_fires_while_slow_attempt_runs() {
    let calls = Arc::new(Calls::default());
    let service = WorkflowService::builder()
        .registry(Arc::new(registry(calls.clone())))
        .build();
    let definition = WorkflowDefinition::parse(
        r#"
actions:
  - ref: slow
    action: test.echo
    args:
      delay_ms: 5000
      value:
        status: loading
    retry_policy:
      retry_until: ${{ ACTIONS.slow.result.status == 'success' }}
      timeout: 1
"#,
    )
    .unwrap();
    let id = service.start(definition, RunInput::default()).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(4), service.run_to_completion(id))
        .await
        .expect("deadline fired before the attempt finished")
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error.unwrap().code.as_deref(), Some("RetryTimeout"));
    assert_eq!(calls.count("slow"), 1);
}

// ============================================================================
// Scatter / Gather
// ============================================================================

const PING_HOSTS: &str = r#"
actions:
  - ref: hosts
    action: core.transform.scatter
    for_each: ${{ TRIGGER.hosts }}
  - ref: ping
    action: test.ping
    depends_on: [hosts]
    args:
      host: ${{ ACTIONS.hosts.result.name }}
      delay_ms: ${{ ACTIONS.hosts.result.delay_ms }}
  - ref: collect
    action: core.transform.gather
    depends_on: [ping]
    gather:
      items: ${{ ACTIONS.ping.result.host }}
      error_strategy: partition
  - ref: summarize
    action: test.echo
    depends_on: [collect]
    args:
      value: ${{ ACTIONS.collect.result }}
returns:
  hosts: ${{ ACTIONS.summarize.result }}
  errors: ${{ ACTIONS.collect.error }}
"#;

#[tokio::test]
async fn scatter_over_empty_collection_gathers_empty_list() {
    let h = Harness::new();
    let id = h.start(PING_HOSTS, json!({ "hosts": [] })).await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.result.unwrap()["hosts"], json!([]));
    assert_eq!(h.calls.count("ping"), 0);

    let hosts = h.outcome(id, "hosts").await;
    assert_eq!(hosts["status"], "scatter");
    assert_eq!(hosts["count"], 0);
}

#[test_log::test(tokio::test)]
async fn partition_gathers_in_scatter_order() {
    let h = Harness::new();
    let hosts = json!([
        { "name": "alpha", "delay_ms": 40 },
        { "name": "bad-beta", "delay_ms": 0 },
        { "name": "gamma", "delay_ms": 20 },
        { "name": "delta", "delay_ms": 0 },
    ]);
    let id = h.start(PING_HOSTS, json!({ "hosts": hosts })).await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    let result = result.result.unwrap();
    assert_eq!(result["hosts"], json!(["alpha", "gamma", "delta"]));
    assert_eq!(result["errors"].as_array().unwrap().len(), 1);
    assert_eq!(result["errors"][0]["type"], "PingFailed");
    assert_eq!(h.calls.count("ping"), 4);

    let collect: ActionOutcome = serde_json::from_value(h.outcome(id, "collect").await).unwrap();
    let legacy = collect.to_legacy();
    assert_eq!(legacy.result, json!(["alpha", "gamma", "delta"]));
    assert_eq!(legacy.error_typename.as_deref(), Some("array"));
    assert_eq!(legacy.error.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn halt_strategy_fails_the_run() {
    let h = Harness::new();
    let definition = PING_HOSTS.replace("error_strategy: partition", "error_strategy: halt");
    let hosts = json!([
        { "name": "alpha", "delay_ms": 30 },
        { "name": "bad-beta", "delay_ms": 0 },
    ]);
    let id = h.start(&definition, json!({ "hosts": hosts })).await;

    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.code.as_deref(), Some("PingFailed"));
    assert_eq!(error.details.unwrap()["action_ref"], "collect");
    assert_eq!(h.calls.count("summarize"), 0);
}

#[tokio::test]
async fn large_collections_are_externalized() {
    let config = RuntimeConfig::default()
        .with_scatter_inline_limit(2)
        .with_gather_inline_limit(2);
    let h = Harness::with(config, StaticSecretsProvider::new());
    let hosts = json!([{ "name": "a" }, { "name": "b" }, { "name": "c" }]);
    let id = h.start(PING_HOSTS, json!({ "hosts": hosts })).await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.result.unwrap()["hosts"], json!(["a", "b", "c"]));

    let scatter = h.outcome(id, "hosts").await;
    assert!(scatter["manifest_ref"]["key"].is_string());
    let gather = h.outcome(id, "collect").await;
    assert!(gather["result"].is_null());
    assert!(gather["result_ref"]["key"].is_string());
}

#[tokio::test]
async fn nested_scatter_streams_are_independent() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: hosts
    action: core.transform.scatter
    for_each: ${{ TRIGGER.hosts }}
  - ref: ports
    action: core.transform.scatter
    depends_on: [hosts]
    for_each: ${{ ACTIONS.hosts.result.ports }}
  - ref: check
    action: test.echo
    depends_on: [ports]
    args:
      value: ${{ ACTIONS.hosts.result.name + ":" + ACTIONS.ports.result }}
  - ref: per_host
    action: core.transform.gather
    depends_on: [check]
    gather:
      items: ${{ ACTIONS.check.result }}
  - ref: all
    action: core.transform.gather
    depends_on: [per_host]
    gather:
      items: ${{ ACTIONS.per_host.result }}
returns: ${{ ACTIONS.all.result }}
"#,
            json!({ "hosts": [
                { "name": "a", "ports": ["22", "80"] },
                { "name": "b", "ports": ["443"] },
            ]}),
        )
        .await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.result, Some(json!([["a:22", "a:80"], ["b:443"]])));
    assert_eq!(h.calls.count("check"), 3);
}

// ============================================================================
// Dependencies
// ============================================================================

#[tokio::test]
async fn skip_propagates_and_join_any_recovers() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: gate
    action: test.echo
    run_if: ${{ TRIGGER.enabled }}
  - ref: after_gate
    action: test.echo
    depends_on: [gate]
  - ref: fallback
    action: test.echo
    args:
      value: fallback
  - ref: either
    action: test.echo
    depends_on: [after_gate, fallback]
    join_strategy: any
    args:
      value: ${{ ACTIONS.fallback.result }}
"#,
            json!({ "enabled": false }),
        )
        .await;

    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    let gate = h.outcome(id, "gate").await;
    assert_eq!(gate["status"], "skipped");
    assert_eq!(gate["reason"], "run_if evaluated to false");
    let after = h.outcome(id, "after_gate").await;
    assert_eq!(after["reason"], "dependency 'gate' was skipped");
    assert_eq!(h.outcome(id, "either").await["result"], "fallback");
    assert_eq!(h.calls.total(), 2);
}

#[tokio::test]
async fn error_edge_handles_failure() {
    let h = Harness::new();
    let id = h
        .start(
            r#"
actions:
  - ref: ping
    action: test.ping
    args:
      host: bad-host
  - ref: cleanup
    action: test.echo
    depends_on: [ping.error]
    args:
      value: ${{ ACTIONS.ping.error.message }}
returns: ${{ ACTIONS.cleanup.result }}
"#,
            json!({}),
        )
        .await;

    let result = h.service.result(id).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.result, Some(json!("ping of bad-host failed")));
}

// ============================================================================
// Interactions
// ============================================================================

const APPROVAL: &str = r#"
actions:
  - ref: approve
    action: test.echo
    args:
      value: isolate host?
    interaction:
      type: approval
      timeout: 3600
  - ref: isolate
    action: test.echo
    depends_on: [approve]
    run_if: ${{ ACTIONS.approve.interaction.approved }}
    args:
      value: isolated
"#;

async fn pending_interaction(h: &Harness, id: Uuid) -> Uuid {
    let view = h.service.query_interactions(id).await.unwrap();
    assert_eq!(view["approve"]["status"], "pending");
    serde_json::from_value(view["approve"]["interaction_id"].clone()).unwrap()
}

#[tokio::test]
async fn duplicate_interaction_update_is_rejected() {
    let h = Harness::new();
    let id = h.start(APPROVAL, json!({})).await;
    assert_eq!(h.calls.count("approve"), 1);
    assert_eq!(h.status(id).await, WorkflowStatus::Running);
    let interaction = pending_interaction(&h, id).await;

    let ack = h
        .service
        .submit_interaction_once(id, "req-1", interaction, json!({ "approved": true }))
        .await
        .unwrap();
    assert_eq!(ack["status"], "accepted");

    // Same request id: the recorded ack, not a second application
    let again = h
        .service
        .submit_interaction_once(id, "req-1", interaction, json!({ "approved": false }))
        .await
        .unwrap();
    assert_eq!(again, ack);

    let err = h
        .service
        .submit_interaction(id, interaction, json!({ "approved": false }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Executor(ExecutorError::UpdateRejected(UpdateRejected::Rejected(_)))
    ));

    h.service.run_until_idle().await.unwrap();
    assert_eq!(h.status(id).await, WorkflowStatus::Completed);
    let approve = h.outcome(id, "approve").await;
    assert_eq!(approve["interaction"], json!({ "approved": true }));
    assert_eq!(approve["interaction_type"], "approval");
    assert_eq!(h.calls.count("isolate"), 1);
}

#[tokio::test]
async fn unknown_interaction_is_rejected() {
    let h = Harness::new();
    let id = h.start(APPROVAL, json!({})).await;
    let err = h
        .service
        .submit_interaction(id, Uuid::now_v7(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Executor(ExecutorError::UpdateRejected(_))
    ));
}

#[test_log::test(tokio::test)]
async fn cancel_abandons_pending_interactions() {
    let h = Harness::new();
    let id = h.start(APPROVAL, json!({})).await;
    let interaction = pending_interaction(&h, id).await;

    h.service.cancel(id, "analyst aborted").await.unwrap();
    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Cancelled);
    let error = result.error.unwrap();
    assert_eq!(error.message, "analyst aborted");
    assert_eq!(error.details.unwrap()["ACTIONS"]["approve"], Value::Null);

    let view = h.service.query_interactions(id).await.unwrap();
    assert_eq!(view["approve"]["status"], "abandoned");

    let err = h
        .service
        .submit_interaction(id, interaction, json!({ "approved": true }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Executor(ExecutorError::WorkflowCompleted(_))
    ));

    h.advance(Duration::from_secs(7200)).await;
    assert_eq!(h.calls.count("isolate"), 0);
}

#[tokio::test]
async fn interaction_timeout_fails_the_statement() {
    let h = Harness::new();
    let id = h.start(APPROVAL, json!({})).await;

    h.advance(Duration::from_secs(3601)).await;
    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error.unwrap().code.as_deref(), Some("InteractionTimeout"));

    let view = h.service.query_interactions(id).await.unwrap();
    assert_eq!(view["approve"]["status"], "abandoned");
}

// ============================================================================
// Credentials
// ============================================================================

const AUTHORIZED_LOOKUP: &str = r#"
actions:
  - ref: lookup
    action: test.auth
    args:
      key: ${{ SECRETS.vt.api_key }}
returns: ${{ ACTIONS.lookup.result }}
"#;

fn vt_secrets() -> StaticSecretsProvider {
    StaticSecretsProvider::new()
        .with_secret("vt", json!({ "api_key": "k-123" }))
        .grant("analyst", ["vt"])
}

#[tokio::test]
async fn secrets_resolved_per_invocation_and_kept_out_of_history() {
    let h = Harness::with(RuntimeConfig::default(), vt_secrets());
    let input = RunInput {
        role: Some("analyst".into()),
        ..Default::default()
    };
    let id = h.start_with(AUTHORIZED_LOOKUP, input).await;

    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.result, Some(json!({ "authorized": true, "secrets": 1 })));

    let history = serde_json::to_string(&h.service.history(id).await.unwrap()).unwrap();
    assert!(!history.contains("k-123"));
    assert!(history.contains("SECRETS.vt.api_key"));
}

#[tokio::test]
async fn secrets_are_scoped_to_the_role() {
    let h = Harness::with(RuntimeConfig::default(), vt_secrets());
    let input = RunInput {
        role: Some("intern".into()),
        ..Default::default()
    };
    let id = h.start_with(AUTHORIZED_LOOKUP, input).await;

    let result = h.service.result(id).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.error.unwrap().code.as_deref(), Some("SecretAccessDenied"));
    assert_eq!(h.calls.total(), 0);
}
