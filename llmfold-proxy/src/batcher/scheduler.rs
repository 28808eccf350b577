//! Batch scheduler: admission, windowing, dispatch and fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use llmfold_core::assembler::individual_prompt;
use llmfold_core::{
    BatchAssembler, BatchItem, BatchJob, BatchState, ChatRequest, ChatResponse,
    CompatibilityClassifier, CompatibilityKey, Fingerprint, Prompt, PromptBudgeter, RequestId,
    ResponseSource,
};
use tokio::sync::Semaphore;

use super::config::BatcherConfig;
use super::metrics::BatcherMetrics;
use super::pending::{self, Completer, PendingResult};
use super::queue::{advance, lock, ClosedJob, KeyQueue, KeyQueueState};
use crate::cache::ResponseCache;
use crate::downstream::DownstreamClient;
use crate::error::{DownstreamError, SchedulerError};
use crate::metrics::prometheus;

type SharedQueue = Arc<Mutex<KeyQueue>>;

/// Groups compatible requests into merged downstream calls
pub struct BatchScheduler {
    config: BatcherConfig,
    downstream: Arc<dyn DownstreamClient>,
    cache: Arc<ResponseCache>,
    budgeter: PromptBudgeter,
    classifier: CompatibilityClassifier,
    assembler: BatchAssembler,
    queues: DashMap<CompatibilityKey, SharedQueue>,
    fallback_permits: Semaphore,
    metrics: Arc<BatcherMetrics>,
    next_job_id: AtomicU64,
}

impl BatchScheduler {
    pub fn new(
        config: BatcherConfig,
        downstream: Arc<dyn DownstreamClient>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        let budgeter = config.budgeter();
        let assembler = BatchAssembler::new(config.estimator());
        let fallback_permits = Semaphore::new(config.fallback_concurrency.max(1));

        Self {
            config,
            downstream,
            cache,
            budgeter,
            classifier: CompatibilityClassifier,
            assembler,
            queues: DashMap::new(),
            fallback_permits,
            metrics: Arc::new(BatcherMetrics::new()),
            next_job_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BatcherMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Number of keys with an open job or jobs in flight
    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    /// State of the queue for `key`; unknown keys are idle
    pub fn queue_state(&self, key: &CompatibilityKey) -> KeyQueueState {
        self.queues
            .get(key)
            .map(|queue| lock(queue.value()).state())
            .unwrap_or(KeyQueueState::Idle)
    }

    /// Submit a request and wait for its answer
    pub async fn complete(self: &Arc<Self>, request: ChatRequest) -> Result<ChatResponse, SchedulerError> {
        self.submit(request).await?.wait().await
    }

    /// Admit a request, returning a handle that resolves exactly once
    ///
    /// Request ids must be unique among queued requests: a request whose id
    /// is already waiting in the open batch for its key is rejected.
    pub async fn submit(self: &Arc<Self>, mut request: ChatRequest) -> Result<PendingResult, SchedulerError> {
        if let Err(err) = request.validate() {
            self.metrics.record_rejected();
            tracing::debug!(request_id = %request.id, error = %err, "Rejected request");
            return Err(err.into());
        }

        request.arrival_time = Some(Instant::now());
        self.metrics.record_received();

        let (completer, pending) = pending::channel(request.id);
        let fingerprint = Fingerprint::of(&request);
        // Budgeting is deterministic, so a cached answer reports the same
        // truncation as the call that produced it.
        let budget = self.budgeter.fit(&request, self.config.context_budget, self.config.meta_overhead);

        if let Some(text) = self.cache.get(&fingerprint).await {
            tracing::debug!(request_id = %request.id, fingerprint = %fingerprint, "Answered from cache");
            let response = ChatResponse {
                id: request.id,
                model: request.model,
                text,
                truncated: budget.truncated,
                source: ResponseSource::Cache,
            };
            self.answer(completer, Ok(response));
            return Ok(pending);
        }

        let output_reserve = self.budgeter.output_reserve(&request);
        let key = self.classifier.classify(&request);

        if budget.truncated {
            self.metrics.record_truncated();
            prometheus::record_truncation();
            tracing::warn!(
                request_id = %request.id,
                original_tokens = budget.report.original_tokens,
                estimated_tokens = budget.estimated_tokens,
                available = budget.available,
                messages_dropped = budget.report.messages_dropped,
                chars_truncated = budget.report.chars_truncated,
                "Prompt truncated to fit the context budget"
            );
        }

        let request_id = request.id;
        let item = BatchItem::new(request, budget, output_reserve);
        let ready = match self.admit(key, item, completer) {
            Ok(ready) => ready,
            Err(err) => {
                self.metrics.record_rejected();
                tracing::debug!(request_id = %request_id, error = %err, "Rejected request");
                return Err(err);
            }
        };
        for (queue, closed) in ready {
            self.launch(queue, closed);
        }

        Ok(pending)
    }

    /// Close every open job and dispatch it now
    ///
    /// Returns the number of jobs flushed.
    pub fn flush_all(self: &Arc<Self>) -> usize {
        let queues: Vec<SharedQueue> = self.queues.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut flushed = 0;
        for queue in queues {
            let closed = lock(&queue).close();
            if let Some(closed) = closed {
                flushed += 1;
                self.launch(queue, closed);
            }
        }

        if flushed > 0 {
            tracing::info!(jobs = flushed, "Flushed open batches");
        }
        flushed
    }

    /// Place an item into its key's open job
    ///
    /// Returns the jobs that closed as a result and must be dispatched.
    fn admit(
        self: &Arc<Self>,
        key: CompatibilityKey,
        item: BatchItem,
        completer: Completer,
    ) -> Result<Vec<(SharedQueue, ClosedJob)>, SchedulerError> {
        let entry = self.queues.entry(key.clone()).or_default();
        let queue = Arc::clone(entry.value());
        let mut guard = lock(&queue);
        let mut ready = Vec::new();

        // A cut-down prompt already fills the context and may carry its own
        // system prompt, so it never shares a call.
        if item.budget.truncated {
            let mut job = BatchJob::new(self.next_job_id(), key, 1);
            let request_id = item.id();
            if let Err(err) = job.push(item) {
                tracing::error!(request_id = %request_id, error = %err, "Could not stage truncated request");
                completer.fulfill(Err(err.into()));
                return Ok(ready);
            }
            ready.push((Arc::clone(&queue), guard.close_alone(job, completer)));
            return Ok(ready);
        }

        let request_id = item.id();
        let duplicate = guard
            .open_job()
            .map_or(false, |job| job.items().iter().any(|queued| queued.id() == request_id));
        if duplicate {
            return Err(SchedulerError::InvalidRequest(format!(
                "request {} is already queued",
                request_id
            )));
        }

        let over_budget = guard.open_job().map_or(false, |job| {
            !job.is_empty()
                && self.assembler.projected_tokens(job, &item, self.config.meta_overhead)
                    > self.config.context_budget
        });
        if over_budget {
            if let Some(closed) = guard.close() {
                tracing::debug!(key = %key, batch_id = closed.job.id(), "Batch closed on token budget");
                ready.push((Arc::clone(&queue), closed));
            }
        }

        if guard.open_job().is_none() {
            let job = BatchJob::new(self.next_job_id(), key.clone(), self.config.max_batch_size);
            let job_id = job.id();
            guard.open(job);
            guard.set_timer(self.spawn_window_timer(Arc::clone(&queue), job_id));
            tracing::debug!(key = %key, batch_id = job_id, "Opened batch");
        }

        if guard.push(item, completer).is_err() {
            return Ok(ready);
        }
        tracing::debug!(request_id = %request_id, key = %key, "Request enqueued");

        if guard.open_job().map_or(false, BatchJob::is_full) {
            if let Some(closed) = guard.close() {
                tracing::debug!(key = %key, batch_id = closed.job.id(), "Batch closed on size");
                ready.push((Arc::clone(&queue), closed));
            }
        }

        drop(guard);
        drop(entry);
        Ok(ready)
    }

    fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Close job `job_id` once the window elapses, unless it already left
    fn spawn_window_timer(self: &Arc<Self>, queue: SharedQueue, job_id: u64) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let window = self.config.batch_window;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let closed = {
                let mut guard = lock(&queue);
                if guard.open_job_id() == Some(job_id) {
                    guard.close()
                } else {
                    None
                }
            };
            if let Some(closed) = closed {
                tracing::debug!(batch_id = job_id, items = closed.job.len(), "Batch window elapsed");
                scheduler.launch(queue, closed);
            }
        })
    }

    fn launch(self: &Arc<Self>, queue: SharedQueue, closed: ClosedJob) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let key = closed.job.key().clone();
            scheduler.dispatch(closed).await;

            lock(&queue).finish();
            scheduler
                .queues
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &queue) && lock(current).is_idle());
        });
    }

    async fn dispatch(&self, closed: ClosedJob) {
        let ClosedJob { mut job, mut completers } = closed;
        advance(&mut job, BatchState::Dispatched);

        let waited = job.opened_at().elapsed();
        self.metrics.record_job(job.len());
        prometheus::record_batch(job.len(), waited.as_secs_f64());

        if job.len() == 1 {
            let failed = self.dispatch_single(&mut job, &mut completers).await;
            advance(&mut job, if failed { BatchState::Failed } else { BatchState::Completed });
            return;
        }

        let prompt = self.assembler.build_prompt(&job);
        tracing::info!(
            batch_id = job.id(),
            key = %job.key(),
            items = job.len(),
            waited_ms = waited.as_millis() as u64,
            "Dispatching batch"
        );

        let unresolved = match self.call(&prompt, "batch").await {
            Ok(text) => {
                let (mut answers, failed) = self.assembler.parse(&text, &job).into_parts();
                advance(&mut job, BatchState::Completed);

                if !failed.is_empty() {
                    self.metrics.record_parse_failures(failed.len());
                    prometheus::record_parse_failures(failed.len());
                    tracing::warn!(
                        batch_id = job.id(),
                        items = job.len(),
                        failed = failed.len(),
                        "Batch response partially parsed, falling back for unanswered items"
                    );
                }

                let mut unresolved = Vec::new();
                for item in job.take_items() {
                    match answers.remove(&item.id()) {
                        Some(text) => {
                            self.cache.insert(item.fingerprint, text.clone()).await;
                            let response = respond(&item, text, ResponseSource::Batch);
                            if let Some(completer) = completers.remove(&item.id()) {
                                self.answer(completer, Ok(response));
                            }
                        }
                        None => unresolved.push(item),
                    }
                }
                unresolved
            }
            Err(err) => {
                advance(&mut job, BatchState::Failed);
                tracing::warn!(
                    batch_id = job.id(),
                    items = job.len(),
                    error = %err,
                    "Batch call failed, falling back to individual calls"
                );
                job.take_items()
            }
        };

        self.fall_back(unresolved, &mut completers).await;
    }

    /// Send a one-item job as a plain call; `true` when it failed
    async fn dispatch_single(&self, job: &mut BatchJob, completers: &mut HashMap<RequestId, Completer>) -> bool {
        let mut failed = false;
        for item in job.take_items() {
            let result = self.call(&individual_prompt(&item), "single").await;
            failed |= result.is_err();
            let outcome = self.settle(&item, result, ResponseSource::Single).await;
            if let Some(completer) = completers.remove(&item.id()) {
                self.answer(completer, outcome);
            }
        }
        failed
    }

    /// One individual call per item, bounded by the fallback semaphore
    async fn fall_back(&self, items: Vec<BatchItem>, completers: &mut HashMap<RequestId, Completer>) {
        if items.is_empty() {
            return;
        }

        let calls = items.into_iter().map(|item| {
            let completer = completers.remove(&item.id());
            async move {
                let _permit = self.fallback_permits.acquire().await.ok();
                self.metrics.record_fallback_call();
                let result = self.call(&individual_prompt(&item), "fallback").await;
                let outcome = self.settle(&item, result, ResponseSource::Fallback).await;
                if let Some(completer) = completer {
                    self.answer(completer, outcome);
                }
            }
        });

        join_all(calls).await;
    }

    /// Turn a downstream result into the caller's outcome, caching answers
    async fn settle(
        &self,
        item: &BatchItem,
        result: Result<String, DownstreamError>,
        source: ResponseSource,
    ) -> Result<ChatResponse, SchedulerError> {
        match result {
            Ok(text) => {
                self.cache.insert(item.fingerprint, text.clone()).await;
                Ok(respond(item, text, source))
            }
            Err(err) => {
                tracing::warn!(request_id = %item.id(), source = %source, error = %err, "Individual call failed");
                Err(SchedulerError::Downstream(err))
            }
        }
    }

    /// Run one downstream call under the configured deadline
    async fn call(&self, prompt: &Prompt, kind: &'static str) -> Result<String, DownstreamError> {
        prometheus::record_downstream_call(kind);
        let deadline = self.config.downstream_timeout;

        let result = match tokio::time::timeout(deadline, self.downstream.complete(prompt, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout(deadline)),
        };

        if let Err(err) = &result {
            self.metrics.record_downstream_error(err.is_timeout());
            prometheus::record_downstream_error(err.kind());
            tracing::warn!(kind, error = %err, "Downstream call failed");
        }
        result
    }

    fn answer(&self, completer: Completer, outcome: Result<ChatResponse, SchedulerError>) {
        match &outcome {
            Ok(response) => self.metrics.record_answered(response.source),
            Err(_) => self.metrics.record_failed(),
        }
        completer.fulfill(outcome);
    }
}

fn respond(item: &BatchItem, text: String, source: ResponseSource) -> ChatResponse {
    ChatResponse {
        id: item.id(),
        model: item.request.model.clone(),
        text,
        truncated: item.budget.truncated,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use llmfold_core::{classify, Message, Role};

    use crate::cache::CacheConfig;
    use crate::downstream::mock::{self, ScriptedDownstream};

    fn config() -> BatcherConfig {
        BatcherConfig::default()
    }

    fn scheduler_with(config: BatcherConfig, downstream: Arc<ScriptedDownstream>) -> Arc<BatchScheduler> {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        Arc::new(BatchScheduler::new(config, downstream, cache))
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest::new("m", vec![Message::system("S"), Message::user(text)])
            .with_temperature(0.2)
            .with_top_p(1.0)
    }

    async fn submit_all(scheduler: &Arc<BatchScheduler>, requests: Vec<ChatRequest>) -> Vec<PendingResult> {
        let mut pending = Vec::new();
        for request in requests {
            pending.push(scheduler.submit(request).await.unwrap());
        }
        pending
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_compatible_requests_share_one_call() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let requests: Vec<ChatRequest> = ["alpha", "beta", "gamma"].iter().map(|t| request(t)).collect();
        let ids: Vec<RequestId> = requests.iter().map(|r| r.id).collect();

        let first = scheduler.submit(requests[0].clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        let second = scheduler.submit(requests[1].clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        let third = scheduler.submit(requests[2].clone()).await.unwrap();

        let answers = vec![
            first.wait().await.unwrap(),
            second.wait().await.unwrap(),
            third.wait().await.unwrap(),
        ];

        assert_eq!(downstream.call_count(), 1);
        let call = &downstream.calls()[0];
        let items = mock::items(call);
        assert_eq!(items.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);

        for (answer, text) in answers.iter().zip(["alpha", "beta", "gamma"]) {
            assert_eq!(answer.text, mock::echo_of(text));
            assert_eq!(answer.source, ResponseSource::Batch);
            assert!(!answer.truncated);
        }
        let distinct: HashSet<&str> = answers.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(distinct.len(), 3);

        // The merged call carries the shared system prompt and sampling parameters
        assert!(call.messages[0].content.starts_with("S\n\n"));
        assert_eq!(call.temperature, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_answer_falls_back_for_that_item_only() {
        let downstream = ScriptedDownstream::with_script(|prompt| {
            if mock::is_batched(prompt) {
                let mut items = mock::items(prompt);
                items.remove(2);
                Ok(mock::answer_blocks(&items))
            } else {
                Ok(mock::echo_of(&mock::last_user(prompt)))
            }
        });
        let scheduler = scheduler_with(config(), downstream.clone());

        let texts = ["one", "two", "three", "four", "five"];
        let requests: Vec<ChatRequest> = texts.iter().map(|t| request(t)).collect();
        let pending = submit_all(&scheduler, requests).await;

        let mut answers = Vec::new();
        for handle in pending {
            answers.push(handle.wait().await.unwrap());
        }

        assert_eq!(downstream.batched_calls().len(), 1);
        let singles = downstream.single_calls();
        assert_eq!(singles.len(), 1);
        assert_eq!(mock::last_user(&singles[0]), "three");

        for (i, (answer, text)) in answers.iter().zip(texts).enumerate() {
            assert_eq!(answer.text, mock::echo_of(text));
            let expected = if i == 2 { ResponseSource::Fallback } else { ResponseSource::Batch };
            assert_eq!(answer.source, expected);
        }
        assert_eq!(scheduler.metrics().snapshot().parse_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_degrades_to_individual_calls() {
        let downstream = ScriptedDownstream::with_script(|prompt| {
            if mock::is_batched(prompt) {
                Err(DownstreamError::transport("connection reset"))
            } else {
                Ok(mock::echo_of(&mock::last_user(prompt)))
            }
        });
        let scheduler = scheduler_with(config(), downstream.clone());

        let texts = ["a", "b", "c", "d"];
        let pending = submit_all(&scheduler, texts.iter().map(|t| request(t)).collect()).await;

        for (handle, text) in pending.into_iter().zip(texts) {
            let answer = handle.wait().await.unwrap();
            assert_eq!(answer.text, mock::echo_of(text));
            assert_eq!(answer.source, ResponseSource::Fallback);
        }

        assert_eq!(downstream.batched_calls().len(), 1);
        assert_eq!(downstream.single_calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_falls_back() {
        let config = BatcherConfig { downstream_timeout: Duration::from_secs(1), ..config() };
        let downstream = ScriptedDownstream::slow_batches(Duration::from_secs(5));
        let scheduler = scheduler_with(config, downstream.clone());

        let pending = submit_all(&scheduler, vec![request("x"), request("y")]).await;
        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Fallback);
        }

        let snapshot = scheduler.metrics().snapshot();
        assert_eq!(snapshot.downstream_timeouts, 1);
        assert_eq!(snapshot.fallback_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fallback_reports_downstream_error() {
        let downstream = ScriptedDownstream::with_script(|prompt| {
            if mock::last_user(prompt) == "bad" {
                Err(DownstreamError::Provider { status: 500, body: "boom".to_string() })
            } else if mock::is_batched(prompt) {
                Err(DownstreamError::transport("reset"))
            } else {
                Ok(mock::echo_of(&mock::last_user(prompt)))
            }
        });
        let scheduler = scheduler_with(config(), downstream.clone());

        let pending = submit_all(&scheduler, vec![request("good"), request("bad")]).await;
        let mut results = Vec::new();
        for handle in pending {
            results.push(handle.wait().await);
        }

        assert_eq!(results[0].as_ref().unwrap().text, mock::echo_of("good"));
        assert!(matches!(
            results[1],
            Err(SchedulerError::Downstream(DownstreamError::Provider { status: 500, .. }))
        ));
        // One fallback call per item, never retried
        assert_eq!(downstream.single_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_temperatures_never_share_a_job() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let cold = request("same").with_temperature(0.0);
        let warm = request("same").with_temperature(0.9);
        assert_ne!(classify(&cold), classify(&warm));

        let pending = submit_all(&scheduler, vec![cold, warm]).await;
        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Single);
        }

        let calls = downstream.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| !mock::is_batched(call)));
        let temperatures: HashSet<u32> = calls.iter().map(|c| c.temperature.to_bits()).collect();
        assert_eq!(temperatures.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_item_job_is_sent_untagged() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let answer = scheduler.complete(request("solo")).await.unwrap();

        assert_eq!(answer.source, ResponseSource::Single);
        assert_eq!(answer.text, mock::echo_of("solo"));
        let call = &downstream.calls()[0];
        assert!(!mock::is_batched(call));
        assert_eq!(call.messages[0], Message::system("S"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_once_under_concurrency() {
        let downstream = ScriptedDownstream::with_script(|prompt| {
            if mock::is_batched(prompt) {
                // Drop every third item to exercise the fallback path too
                let items: Vec<_> = mock::items(prompt)
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| i % 3 != 2)
                    .map(|(_, item)| item)
                    .collect();
                Ok(mock::answer_blocks(&items))
            } else {
                Ok(mock::echo_of(&mock::last_user(prompt)))
            }
        });
        let config = BatcherConfig { batch_window: Duration::from_millis(20), ..config() };
        let scheduler = scheduler_with(config, downstream.clone());

        let mut handles = Vec::new();
        for n in 0..64 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                let request = request(&format!("question {}", n));
                let id = request.id;
                (id, n, scheduler.complete(request).await)
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let (id, n, result) = handle.await.unwrap();
            let answer = result.unwrap();
            assert_eq!(answer.id, id);
            assert_eq!(answer.text, mock::echo_of(&format!("question {}", n)));
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 64);

        let snapshot = scheduler.metrics().snapshot();
        let answered = snapshot.answered;
        assert_eq!(answered.single + answered.batch + answered.fallback, 64);
        assert_eq!(snapshot.requests_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_is_truncated_to_budget() {
        let config = BatcherConfig { context_budget: 4000, meta_overhead: 0, ..config() };
        let estimator = config.estimator();
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config, downstream.clone());

        // About 10,000 tokens at 4 chars per token
        let huge = "lorem ipsum dolor sit amet consectetur ".repeat(1026);
        let big = ChatRequest::new("m", vec![Message::user(huge)]);
        assert!(estimator.estimate(&big.messages[0].content) >= 10_000);
        let small = ChatRequest::new("m", vec![Message::user("short")]);

        let pending = submit_all(&scheduler, vec![big, small]).await;
        let answers: Vec<ChatResponse> = {
            let mut out = Vec::new();
            for handle in pending {
                out.push(handle.wait().await.unwrap());
            }
            out
        };

        assert!(answers[0].truncated);
        assert_eq!(answers[0].source, ResponseSource::Single);
        assert!(!answers[1].truncated);

        let truncated_call = downstream
            .calls()
            .into_iter()
            .find(|call| call.messages.iter().any(|m| m.content.len() > 1000))
            .unwrap();
        assert!(!mock::is_batched(&truncated_call));
        let prompt_tokens = estimator.estimate_messages(&truncated_call.messages);
        assert!(prompt_tokens <= 4000, "prompt is {} tokens", prompt_tokens);
        assert_eq!(scheduler.metrics().snapshot().requests_truncated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_bypasses_batching() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let first = scheduler.complete(request("repeat me")).await.unwrap();
        assert_eq!(first.source, ResponseSource::Single);

        let second = scheduler.complete(request("repeat me")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.text, first.text);
        assert_ne!(second.id, first.id);
        assert_eq!(downstream.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_keeps_truncation_flag() {
        let config = BatcherConfig { context_budget: 600, meta_overhead: 0, ..config() };
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config, downstream.clone());

        let long = || ChatRequest::new("m", vec![Message::user("too long to fit ".repeat(400))]);

        let first = scheduler.complete(long()).await.unwrap();
        assert!(first.truncated);
        assert_eq!(first.source, ResponseSource::Single);

        let second = scheduler.complete(long()).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert!(second.truncated);
        assert_eq!(downstream.call_count(), 1);

        let short = scheduler.complete(request("fits")).await.unwrap();
        let repeat = scheduler.complete(request("fits")).await.unwrap();
        assert_eq!(repeat.source, ResponseSource::Cache);
        assert!(!short.truncated && !repeat.truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_queued_id_is_rejected() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let original = request("once");
        let first = scheduler.submit(original.clone()).await.unwrap();
        let err = scheduler.submit(original.clone()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));

        let answer = first.wait().await.unwrap();
        assert_eq!(answer.id, original.id);
        assert_eq!(answer.source, ResponseSource::Single);
        assert_eq!(downstream.call_count(), 1);
        assert_eq!(scheduler.metrics().snapshot().requests_rejected, 1);

        // Once the first copy has left the queue the id may be reused
        let again = scheduler.complete(original.clone()).await.unwrap();
        assert_eq!(again.source, ResponseSource::Cache);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_closes_job_without_waiting() {
        let config = BatcherConfig {
            max_batch_size: 2,
            batch_window: Duration::from_secs(3600),
            ..config()
        };
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config, downstream.clone());

        let pending = submit_all(&scheduler, vec![request("p"), request("q")]).await;
        let started = tokio::time::Instant::now();
        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Batch);
        }

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(downstream.batched_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cap_starts_a_new_job() {
        // Header, system prompt and one 100-token item with its reserve fit,
        // a second item does not.
        let config = BatcherConfig {
            context_budget: 400,
            meta_overhead: 8,
            default_output_tokens: 64,
            ..config()
        };
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config, downstream.clone());

        let body = "x".repeat(400);
        let requests: Vec<ChatRequest> = (0..3).map(|n| request(&format!("{}{}", n, body))).collect();
        let pending = submit_all(&scheduler, requests).await;

        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Single);
        }
        assert_eq!(downstream.call_count(), 3);
        assert!(downstream.batched_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_is_rejected() {
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config(), downstream.clone());

        let empty = ChatRequest::new("m", Vec::new());
        let err = scheduler.submit(empty).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));

        let bad_top_p = request("x").with_top_p(1.5);
        assert!(scheduler.complete(bad_top_p).await.is_err());

        assert_eq!(downstream.call_count(), 0);
        assert_eq!(scheduler.metrics().snapshot().requests_rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_dispatches_open_jobs() {
        let config = BatcherConfig { batch_window: Duration::from_secs(3600), ..config() };
        let downstream = ScriptedDownstream::echo();
        let scheduler = scheduler_with(config, downstream.clone());

        let pending = submit_all(&scheduler, vec![request("f1"), request("f2")]).await;
        let key = classify(&request("any"));
        assert_eq!(scheduler.queue_state(&key), KeyQueueState::Accumulating);

        assert_eq!(scheduler.flush_all(), 1);
        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Batch);
        }
        assert_eq!(downstream.batched_calls().len(), 1);
        assert_eq!(scheduler.flush_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_job_opens_while_previous_dispatches() {
        let config = BatcherConfig { max_batch_size: 2, ..config() };
        let downstream = ScriptedDownstream::slow_batches(Duration::from_secs(2));
        let scheduler = scheduler_with(config, downstream.clone());

        let first = submit_all(&scheduler, vec![request("a1"), request("a2")]).await;
        let key = classify(&request("any"));
        tokio::task::yield_now().await;
        assert_eq!(scheduler.queue_state(&key), KeyQueueState::Dispatching);

        let second = submit_all(&scheduler, vec![request("b1")]).await;
        assert_eq!(scheduler.queue_state(&key), KeyQueueState::Accumulating);

        for handle in first.into_iter().chain(second) {
            handle.wait().await.unwrap();
        }

        // Queues are dropped once idle
        tokio::task::yield_now().await;
        assert_eq!(scheduler.queue_state(&key), KeyQueueState::Idle);
        assert_eq!(scheduler.active_queues(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_response_falls_back_for_every_item() {
        let config = BatcherConfig { fallback_concurrency: 2, ..config() };
        let downstream = ScriptedDownstream::with_script(|prompt| {
            if mock::is_batched(prompt) {
                Ok("no tags at all".to_string())
            } else {
                Ok(mock::echo_of(&mock::last_user(prompt)))
            }
        });
        let scheduler = scheduler_with(config, downstream.clone());

        let pending = submit_all(&scheduler, (0..4).map(|n| request(&n.to_string())).collect()).await;
        for handle in pending {
            assert_eq!(handle.wait().await.unwrap().source, ResponseSource::Fallback);
        }
        assert_eq!(downstream.single_calls().len(), 4);
        assert!(downstream
            .single_calls()
            .iter()
            .all(|call| call.messages.iter().any(|m| m.role == Role::System)));
    }
}
