//! Behavior dispatch
//!
//! Turns one inbound message into at most one handler execution:
//!
//! 1. decode the envelope (undecodable messages are dropped with an error,
//!    since there is no task id to record against)
//! 2. pass the idempotency gate; replays are answered from the task record
//! 3. resolve the behavior in the [`HandlerRegistry`]; unknown behaviors fail
//!    the task without ever entering in-progress
//! 4. run the handler on its own task so a panic becomes a failure record
//! 5. record the terminal status and emit a [`BehaviorResponse`]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

#[cfg(test)]
use mockall::automock;

use cse_common::metrics::{record_dispatch, record_duration};
use cse_common::{Error, Result, DEFAULT_API_VERSION};

use crate::message::{BehaviorKind, BehaviorMessage, BehaviorResponse, OperationContext};
use crate::tracker::{NewTask, OperationTask, TaskResult, TaskTracker};

/// Handler for one behavior kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BehaviorHandler: Send + Sync {
    /// Behavior this handler serves
    fn kind(&self) -> BehaviorKind;

    /// Execute the behavior
    ///
    /// Must be safe to run again for the same task after a crash.
    async fn handle(&self, ctx: &OperationContext) -> Result<TaskResult>;
}

/// Behavior kind to handler mapping, built once at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<BehaviorKind, Arc<dyn BehaviorHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the kind it reports
    ///
    /// Fails if a handler for that kind is already registered.
    pub fn register(&mut self, handler: Arc<dyn BehaviorHandler>) -> Result<()> {
        let kind = handler.kind();
        if self.handlers.contains_key(&kind) {
            return Err(Error::fatal_with_context(
                "handler-registry",
                format!("a handler for {} is already registered", kind),
            ));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Find the handler for a behavior id
    pub fn resolve(&self, behavior_id: &str) -> Result<(BehaviorKind, Arc<dyn BehaviorHandler>)> {
        BehaviorKind::from_behavior_id(behavior_id)
            .and_then(|kind| self.handlers.get(&kind).map(|h| (kind, h.clone())))
            .ok_or_else(|| Error::unsupported_behavior(behavior_id))
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<BehaviorKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Dispatcher settings
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// API version assumed when a message does not name one
    pub api_version: String,
    /// How often a queued delete re-checks for in-flight work
    pub queue_poll_interval: Duration,
    /// How long a delete waits for in-flight work before giving up
    pub queue_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            queue_poll_interval: Duration::from_millis(250),
            queue_timeout: Duration::from_secs(300),
        }
    }
}

/// What a dispatch did
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// The task reached a terminal status in this dispatch
    Completed(OperationTask),
    /// The task was already terminal; answered from the record
    Replayed(OperationTask),
    /// Another dispatch is executing the task
    AlreadyActive(OperationTask),
    /// A delete gave up waiting for in-flight work; redelivery will retry it
    Deferred(OperationTask),
}

impl DispatchOutcome {
    /// Task record after the dispatch
    pub fn task(&self) -> &OperationTask {
        match self {
            Self::Completed(t) | Self::Replayed(t) | Self::AlreadyActive(t) | Self::Deferred(t) => t,
        }
    }
}

/// Routes behavior messages to handlers, exactly once per task id
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    tracker: Arc<dyn TaskTracker>,
    responses: Option<mpsc::Sender<BehaviorResponse>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: Arc<HandlerRegistry>,
        tracker: Arc<dyn TaskTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            tracker,
            responses: None,
            config,
        }
    }

    /// Send a response for every terminal or replayed task to `tx`
    pub fn with_responses(mut self, tx: mpsc::Sender<BehaviorResponse>) -> Self {
        self.responses = Some(tx);
        self
    }

    /// Task tracker used by this dispatcher
    pub fn tracker(&self) -> &Arc<dyn TaskTracker> {
        &self.tracker
    }

    /// Dispatch one raw message
    ///
    /// Handler failures are recorded on the task and reported through the
    /// returned outcome. An `Err` means the message could not be decoded or
    /// the tracker itself failed.
    #[instrument(
        skip(self, raw),
        fields(task_id = tracing::field::Empty, entity_id = tracing::field::Empty)
    )]
    pub async fn dispatch(&self, raw: &[u8]) -> Result<DispatchOutcome> {
        let message = BehaviorMessage::decode(raw).inspect_err(|e| {
            warn!(error = %e, "dropping undecodable behavior message");
            record_dispatch("unknown", "malformed");
        })?;
        let headers = &message.headers;
        Span::current().record("task_id", headers.task_id.as_str());
        Span::current().record("entity_id", headers.entity_id.as_str());

        let begin = self
            .tracker
            .begin_or_get_existing(NewTask {
                task_id: headers.task_id.clone(),
                behavior_id: headers.behavior_id.clone(),
                entity_id: headers.entity_id.clone(),
            })
            .await?;

        if !begin.fresh {
            let task = begin.task;
            if task.is_terminal() {
                debug!(status = %task.status, "task already finished, replaying result");
                record_dispatch(behavior_label(&task.behavior_id), "replayed");
                self.respond(&task).await;
                return Ok(DispatchOutcome::Replayed(task));
            }
            debug!(status = %task.status, "task is being executed by another dispatch");
            record_dispatch(behavior_label(&task.behavior_id), "active");
            return Ok(DispatchOutcome::AlreadyActive(task));
        }

        let task_id = headers.task_id.clone();
        match self.execute(&message).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Hand the claim back so a redelivery can run the task
                if let Err(release_err) = self.tracker.release(&task_id).await {
                    warn!(error = %release_err, "failed to release task claim");
                }
                Err(e)
            }
        }
    }

    /// Everything after winning the idempotency gate
    async fn execute(&self, message: &BehaviorMessage) -> Result<DispatchOutcome> {
        let headers = &message.headers;
        let (kind, handler) = match self.registry.resolve(&headers.behavior_id) {
            Ok(resolved) => resolved,
            Err(e) => return self.reject(&headers.task_id, "unknown", e).await,
        };
        let ctx = match message.decode_payload() {
            Ok(payload) => OperationContext::new(message, kind, payload, &self.config.api_version),
            Err(e) => return self.reject(&headers.task_id, kind.as_str(), e).await,
        };

        if kind == BehaviorKind::DeleteCluster && !self.wait_for_entity_idle(&ctx).await? {
            self.tracker.release(&ctx.task_id).await?;
            record_dispatch(kind.as_str(), "deferred");
            let task = self.tracker.lookup(&ctx.task_id).await?;
            return Ok(DispatchOutcome::Deferred(task));
        }

        self.tracker.mark_in_progress(&ctx.task_id).await?;
        info!(behavior = %kind, user = %ctx.user.user_name, "executing behavior");

        let started = Instant::now();
        let outcome = run_contained(handler, ctx.clone()).await;
        record_duration(kind.as_str(), started.elapsed().as_secs_f64());

        let task = match outcome {
            Ok(result) => {
                let label = if result.is_degraded() {
                    warn!(behavior = %kind, "behavior completed with errors");
                    "degraded"
                } else {
                    info!(behavior = %kind, "behavior succeeded");
                    "succeeded"
                };
                record_dispatch(kind.as_str(), label);
                self.tracker.mark_succeeded(&ctx.task_id, result).await?
            }
            Err(e) => {
                warn!(behavior = %kind, error = %e, "behavior failed");
                record_dispatch(kind.as_str(), "failed");
                self.tracker.mark_failed(&ctx.task_id, e.detail()).await?
            }
        };

        self.respond(&task).await;
        Ok(DispatchOutcome::Completed(task))
    }

    /// Consume messages until the inbox closes or `cancel` fires
    ///
    /// Each message is dispatched on its own task. Cancellation stops intake
    /// only; handlers already running are awaited, never aborted.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher stopping intake");
                    break;
                }
                message = inbox.recv() => {
                    let Some(raw) = message else {
                        debug!("inbox closed");
                        break;
                    };
                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        if let Err(e) = dispatcher.dispatch(&raw).await {
                            error!(error = %e, "dispatch failed");
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for running behaviors");
        }
        while in_flight.join_next().await.is_some() {}
    }

    /// Fail a task before its handler ran
    async fn reject(&self, task_id: &str, behavior: &str, e: Error) -> Result<DispatchOutcome> {
        warn!(error = %e, "rejecting behavior message");
        record_dispatch(behavior, "failed");
        let task = self.tracker.mark_failed(task_id, e.detail()).await?;
        self.respond(&task).await;
        Ok(DispatchOutcome::Completed(task))
    }

    /// Wait until no other non-delete task is executing on the entity
    ///
    /// Returns false if the wait timed out.
    async fn wait_for_entity_idle(&self, ctx: &OperationContext) -> Result<bool> {
        let deadline = Instant::now() + self.config.queue_timeout;
        loop {
            let blocking: Vec<String> = self
                .tracker
                .active_for_entity(&ctx.entity_id)
                .await?
                .into_iter()
                .filter(|t| {
                    t.task_id != ctx.task_id
                        && BehaviorKind::from_behavior_id(&t.behavior_id)
                            != Some(BehaviorKind::DeleteCluster)
                })
                .map(|t| t.task_id)
                .collect();

            if blocking.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(blocking = ?blocking, "delete still queued behind in-flight tasks, deferring");
                return Ok(false);
            }
            debug!(blocking = ?blocking, "delete queued behind in-flight tasks");
            tokio::time::sleep(self.config.queue_poll_interval).await;
        }
    }

    async fn respond(&self, task: &OperationTask) {
        if let Some(tx) = &self.responses {
            if tx.send(BehaviorResponse::from(task)).await.is_err() {
                warn!(task_id = %task.task_id, "response channel closed, dropping response");
            }
        }
    }
}

fn behavior_label(behavior_id: &str) -> &'static str {
    BehaviorKind::from_behavior_id(behavior_id)
        .map(|k| k.as_str())
        .unwrap_or("unknown")
}

/// Run a handler on its own task so a panic is converted into an error
async fn run_contained(
    handler: Arc<dyn BehaviorHandler>,
    ctx: OperationContext,
) -> Result<TaskResult> {
    let behavior = ctx.behavior;
    let execution = tokio::spawn(
        async move { handler.handle(&ctx).await }.instrument(Span::current()),
    );
    match execution.await {
        Ok(result) => result,
        Err(e) => {
            error!(behavior = %behavior, error = %e, "behavior handler aborted");
            Err(Error::fatal_with_context(
                "dispatcher",
                format!("{} handler aborted: {}", behavior, e),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{BeginOutcome, InMemoryTaskTracker, MockTaskTracker, TaskStatus};
    use cse_common::{ErrorDetail, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    const ENTITY: &str = "urn:vcloud:entity:cse:nativeCluster:abc";

    fn message(task_id: &str, behavior: &str) -> Vec<u8> {
        message_with_payload(task_id, behavior, r#"{"entity": null, "typeId": "t", "arguments": {}}"#)
    }

    fn message_with_payload(task_id: &str, behavior: &str, payload: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "headers": {
                "taskId": task_id,
                "entityId": ENTITY,
                "behaviorId": behavior,
                "context": {"userName": "alice"}
            },
            "payload": payload
        }))
        .unwrap()
    }

    /// Handler that counts calls and answers with a fixed result
    struct CountingHandler {
        kind: BehaviorKind,
        calls: Arc<AtomicU32>,
        reply: fn() -> Result<TaskResult>,
    }

    #[async_trait]
    impl BehaviorHandler for CountingHandler {
        fn kind(&self) -> BehaviorKind {
            self.kind
        }

        async fn handle(&self, _ctx: &OperationContext) -> Result<TaskResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    /// Handler that blocks until released and logs when it finishes
    struct GatedHandler {
        kind: BehaviorKind,
        gate: Arc<Notify>,
        log: Arc<parking_lot::Mutex<Vec<BehaviorKind>>>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BehaviorHandler for GatedHandler {
        fn kind(&self) -> BehaviorKind {
            self.kind
        }

        async fn handle(&self, _ctx: &OperationContext) -> Result<TaskResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.log.lock().push(self.kind);
            Ok(TaskResult::ok(serde_json::json!({"done": self.kind.as_str()})))
        }
    }

    fn ok_reply() -> Result<TaskResult> {
        Ok(TaskResult::ok(serde_json::json!({"phase": "ready"})))
    }

    fn counting(kind: BehaviorKind, reply: fn() -> Result<TaskResult>) -> (Arc<dyn BehaviorHandler>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(CountingHandler {
            kind,
            calls: calls.clone(),
            reply,
        });
        (handler, calls)
    }

    fn dispatcher_with(handlers: Vec<Arc<dyn BehaviorHandler>>) -> Dispatcher {
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(InMemoryTaskTracker::new()),
            DispatcherConfig {
                queue_poll_interval: Duration::from_millis(2),
                queue_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
    }

    // ==========================================================================
    // Story Tests: exactly-once execution per task id
    // ==========================================================================

    /// Story: a message redelivered after completion is answered from the record
    #[tokio::test]
    async fn story_redelivery_after_completion_replays_result() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = dispatcher_with(vec![handler]).with_responses(tx);
        let raw = message("task-1", "createCluster");

        let first = dispatcher.dispatch(&raw).await.unwrap();
        let second = dispatcher.dispatch(&raw).await.unwrap();

        assert!(matches!(first, DispatchOutcome::Completed(_)));
        assert!(matches!(second, DispatchOutcome::Replayed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.task(), second.task());

        let original = rx.recv().await.unwrap();
        let replayed = rx.recv().await.unwrap();
        assert_eq!(original, replayed);
        assert_eq!(original.status, TaskStatus::Succeeded);
        assert_eq!(original.payload.unwrap()["phase"], "ready");
    }

    /// Story: two deliveries racing for the same task run the handler once
    #[tokio::test]
    async fn story_concurrent_deliveries_execute_once() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(GatedHandler {
            kind: BehaviorKind::UpdateCluster,
            gate: gate.clone(),
            log: Arc::default(),
            calls: calls.clone(),
        });
        let dispatcher = Arc::new(dispatcher_with(vec![handler]));
        let raw = message("task-1", "updateCluster");

        let running = {
            let dispatcher = dispatcher.clone();
            let raw = raw.clone();
            tokio::spawn(async move { dispatcher.dispatch(&raw).await })
        };
        wait_for_status(&dispatcher, "task-1", TaskStatus::InProgress).await;

        let duplicate = dispatcher.dispatch(&raw).await.unwrap();
        assert!(matches!(duplicate, DispatchOutcome::AlreadyActive(_)));

        gate.notify_one();
        let finished = running.await.unwrap().unwrap();
        assert_eq!(finished.task().status, TaskStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Story: an unknown behavior never reaches a handler or in-progress
    #[tokio::test]
    async fn story_unknown_behavior_is_rejected() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher.dispatch(&message("task-x", "xyz")).await.unwrap();

        let task = outcome.task();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::UnsupportedBehavior);
        assert!(!task.passed_through(TaskStatus::InProgress));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_known_but_unregistered_behavior_is_unsupported() {
        let (handler, _) = counting(BehaviorKind::CreateCluster, ok_reply);
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher
            .dispatch(&message("task-1", "getKubeConfig"))
            .await
            .unwrap();
        assert_eq!(
            outcome.task().error.as_ref().unwrap().kind,
            ErrorKind::UnsupportedBehavior
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_record() {
        let (handler, _) = counting(BehaviorKind::GetKubeConfig, || {
            Err(Error::not_ready(ENTITY, "provisioning"))
        });
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher
            .dispatch(&message("task-1", "getKubeConfig"))
            .await
            .unwrap();

        let task = outcome.task();
        assert_eq!(
            task.history,
            vec![TaskStatus::Received, TaskStatus::InProgress, TaskStatus::Failed]
        );
        let detail = task.error.as_ref().unwrap();
        assert_eq!(detail.kind, ErrorKind::NotReady);
        assert_eq!(detail.minor_code, 425);
    }

    #[tokio::test]
    async fn test_degraded_result_is_a_success() {
        let (handler, _) = counting(BehaviorKind::CreateCluster, || {
            Ok(TaskResult::degraded(
                serde_json::json!({"phase": "ready-with-error"}),
                &Error::partial_failure("1 node failed", vec!["node-3".into()]),
            ))
        });
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher
            .dispatch(&message("task-1", "createCluster"))
            .await
            .unwrap();

        let task = outcome.task();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.error.is_none());
        let result = task.result.as_ref().unwrap();
        assert_eq!(result.degraded.as_ref().unwrap().kind, ErrorKind::PartialFailure);
    }

    /// Story: a panicking handler cannot take the dispatcher down with it
    #[tokio::test]
    async fn story_handler_panic_is_contained() {
        let (handler, _) = counting(BehaviorKind::DeleteCluster, || panic!("backend exploded"));
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher
            .dispatch(&message("task-1", "deleteCluster"))
            .await
            .unwrap();

        let detail = outcome.task().error.clone().unwrap();
        assert_eq!(detail.kind, ErrorKind::Fatal);
        assert!(detail.description.contains("aborted"));
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_task_without_running_handler() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let dispatcher = dispatcher_with(vec![handler]);

        let outcome = dispatcher
            .dispatch(&message_with_payload("task-1", "createCluster", "not json"))
            .await
            .unwrap();

        let task = outcome.task();
        assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Malformed);
        assert!(!task.passed_through(TaskStatus::InProgress));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_an_error() {
        let dispatcher = dispatcher_with(vec![]);
        let err = dispatcher.dispatch(b"{}").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_tracker_failure_propagates() {
        let mut tracker = MockTaskTracker::new();
        tracker
            .expect_begin_or_get_existing()
            .returning(|_| Err(Error::transient("task store down")));
        let dispatcher = Dispatcher::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(tracker),
            DispatcherConfig::default(),
        );

        let err = dispatcher
            .dispatch(&message("task-1", "createCluster"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    /// Story: the tracker fails right after the gate; the claim is given up so
    /// a redelivery can run the task instead of seeing it as active forever
    #[tokio::test]
    async fn story_claim_is_released_when_tracker_fails_after_gate() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        let mut tracker = MockTaskTracker::new();
        tracker.expect_begin_or_get_existing().times(1).returning(|new| {
            Ok(BeginOutcome {
                fresh: true,
                task: OperationTask::received(new),
            })
        });
        tracker
            .expect_mark_in_progress()
            .times(1)
            .returning(|_| Err(Error::transient("task store down")));
        tracker
            .expect_release()
            .withf(|id| id == "task-1")
            .times(1)
            .returning(|_| Ok(()));
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(tracker), DispatcherConfig::default());

        let err = dispatcher
            .dispatch(&message("task-1", "createCluster"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// In-memory tracker whose first in-progress write fails
    struct FlakyTracker {
        inner: InMemoryTaskTracker,
        fail_in_progress: AtomicU32,
    }

    #[async_trait]
    impl TaskTracker for FlakyTracker {
        async fn begin_or_get_existing(&self, task: NewTask) -> Result<BeginOutcome> {
            self.inner.begin_or_get_existing(task).await
        }

        async fn mark_in_progress(&self, task_id: &str) -> Result<OperationTask> {
            if self.fail_in_progress.swap(0, Ordering::SeqCst) > 0 {
                return Err(Error::transient("task store down"));
            }
            self.inner.mark_in_progress(task_id).await
        }

        async fn mark_succeeded(&self, task_id: &str, result: TaskResult) -> Result<OperationTask> {
            self.inner.mark_succeeded(task_id, result).await
        }

        async fn mark_failed(&self, task_id: &str, error: ErrorDetail) -> Result<OperationTask> {
            self.inner.mark_failed(task_id, error).await
        }

        async fn release(&self, task_id: &str) -> Result<()> {
            self.inner.release(task_id).await
        }

        async fn lookup(&self, task_id: &str) -> Result<OperationTask> {
            self.inner.lookup(task_id).await
        }

        async fn active_for_entity(&self, entity_id: &str) -> Result<Vec<OperationTask>> {
            self.inner.active_for_entity(entity_id).await
        }
    }

    #[tokio::test]
    async fn test_redelivery_runs_after_failed_in_progress_write() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        let tracker = Arc::new(FlakyTracker {
            inner: InMemoryTaskTracker::new(),
            fail_in_progress: AtomicU32::new(1),
        });
        let dispatcher = Dispatcher::new(Arc::new(registry), tracker, DispatcherConfig::default());

        assert!(dispatcher.dispatch(&message("task-1", "createCluster")).await.is_err());
        let outcome = dispatcher
            .dispatch(&message("task-1", "createCluster"))
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(outcome.task().status, TaskStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // Delete queueing
    // ==========================================================================

    async fn wait_for_status(dispatcher: &Dispatcher, task_id: &str, status: TaskStatus) {
        for _ in 0..500 {
            if let Ok(task) = dispatcher.tracker().lookup(task_id).await {
                if task.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("task {} never reached {}", task_id, status);
    }

    /// Story: deleting a cluster whose create is still running waits for the create
    #[tokio::test]
    async fn story_delete_queues_behind_running_create() {
        let gate = Arc::new(Notify::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let create = Arc::new(GatedHandler {
            kind: BehaviorKind::CreateCluster,
            gate: gate.clone(),
            log: log.clone(),
            calls: Arc::default(),
        });
        let delete_gate = Arc::new(Notify::new());
        delete_gate.notify_one();
        let delete = Arc::new(GatedHandler {
            kind: BehaviorKind::DeleteCluster,
            gate: delete_gate,
            log: log.clone(),
            calls: Arc::default(),
        });
        let dispatcher = Arc::new(dispatcher_with(vec![create, delete]));

        let creating = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&message("create-1", "createCluster")).await })
        };
        wait_for_status(&dispatcher, "create-1", TaskStatus::InProgress).await;

        let deleting = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&message("delete-1", "deleteCluster")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!deleting.is_finished());
        assert_eq!(
            dispatcher.tracker().lookup("delete-1").await.unwrap().status,
            TaskStatus::Received
        );

        gate.notify_one();
        creating.await.unwrap().unwrap();
        let deleted = deleting.await.unwrap().unwrap();

        assert_eq!(deleted.task().status, TaskStatus::Succeeded);
        assert_eq!(
            *log.lock(),
            vec![BehaviorKind::CreateCluster, BehaviorKind::DeleteCluster]
        );
    }

    #[tokio::test]
    async fn test_delete_is_deferred_when_queue_times_out() {
        let gate = Arc::new(Notify::new());
        let create = Arc::new(GatedHandler {
            kind: BehaviorKind::CreateCluster,
            gate: gate.clone(),
            log: Arc::default(),
            calls: Arc::default(),
        });
        let (delete, delete_calls) = counting(BehaviorKind::DeleteCluster, ok_reply);
        let mut registry = HandlerRegistry::new();
        registry.register(create).unwrap();
        registry.register(delete).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::new(InMemoryTaskTracker::new()),
            DispatcherConfig {
                queue_poll_interval: Duration::from_millis(1),
                queue_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        ));

        let creating = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&message("create-1", "createCluster")).await })
        };
        wait_for_status(&dispatcher, "create-1", TaskStatus::InProgress).await;

        let outcome = dispatcher
            .dispatch(&message("delete-1", "deleteCluster"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deferred(_)));
        assert_eq!(outcome.task().status, TaskStatus::Received);
        assert_eq!(delete_calls.load(Ordering::SeqCst), 0);

        gate.notify_one();
        creating.await.unwrap().unwrap();

        let retried = dispatcher
            .dispatch(&message("delete-1", "deleteCluster"))
            .await
            .unwrap();
        assert!(matches!(retried, DispatchOutcome::Completed(_)));
        assert_eq!(delete_calls.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // Registry and run loop
    // ==========================================================================

    #[test]
    fn test_registry_rejects_duplicate_kinds() {
        let mut registry = HandlerRegistry::new();
        let (first, _) = counting(BehaviorKind::CreateCluster, ok_reply);
        let (second, _) = counting(BehaviorKind::CreateCluster, ok_reply);

        registry.register(first).unwrap();
        assert!(registry.register(second).is_err());
        assert_eq!(registry.kinds(), vec![BehaviorKind::CreateCluster]);
    }

    #[tokio::test]
    async fn test_registry_uses_reported_kind() {
        let mut handler = MockBehaviorHandler::new();
        handler.expect_kind().return_const(BehaviorKind::GetKubeConfig);
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(handler)).unwrap();

        let (kind, _) = registry
            .resolve(&BehaviorKind::GetKubeConfig.behavior_id())
            .unwrap();
        assert_eq!(kind, BehaviorKind::GetKubeConfig);
        assert!(registry.resolve("createCluster").is_err());
    }

    #[tokio::test]
    async fn test_run_loop_answers_every_message() {
        let (handler, calls) = counting(BehaviorKind::CreateCluster, ok_reply);
        let (response_tx, mut responses) = mpsc::channel(8);
        let dispatcher = Arc::new(dispatcher_with(vec![handler]).with_responses(response_tx));
        let (inbox_tx, inbox) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let running = tokio::spawn(dispatcher.clone().run(inbox, cancel.clone()));
        inbox_tx.send(message("t1", "createCluster")).await.unwrap();
        inbox_tx.send(message("t2", "createCluster")).await.unwrap();
        inbox_tx.send(message("t3", "xyz")).await.unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = responses.recv().await.unwrap();
            statuses.push((response.task_id, response.status));
        }
        statuses.sort_by(|a, b| a.0.cmp(&b.0));

        cancel.cancel();
        running.await.unwrap();

        assert_eq!(
            statuses,
            vec![
                ("t1".to_string(), TaskStatus::Succeeded),
                ("t2".to_string(), TaskStatus::Succeeded),
                ("t3".to_string(), TaskStatus::Failed),
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
