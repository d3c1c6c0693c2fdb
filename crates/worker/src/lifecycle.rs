//! Per-request lifecycle
//!
//! A [`GenerationRequest`] is created once an admission slot is held and owns
//! everything the request touches: the slot, the engine output stream and its
//! cancellation handle. Every terminal transition runs through one cleanup
//! path that stops consumption, aborts the engine request when needed and
//! releases the slot. Dropping an unfinished request (a client hang-up drops
//! the response body) takes the same path.

use crate::admission::AdmissionPermit;
use crate::engine::{EngineOutput, EngineStream, InferenceEngine};
use crate::sampling::SamplingConfig;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use llmops_common::{LlmOpsError, Result, METRICS};
use llmops_proto::{encode_frame, ErrorCode, RequestId, StreamUnit, Usage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Admitted,
    Submitted,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Aborted
        )
    }
}

/// Who asked for a request to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The client disconnected or called abort itself
    Client,
    /// The worker is shutting down
    Shutdown,
    /// The request deadline elapsed
    Deadline,
}

/// Cancellation entry point shared between a request and whoever may stop it
///
/// Only the first reason is kept.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; returns false if already cancelled
    pub fn cancel(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Cancel handles of in-flight requests, keyed by request id
#[derive(Debug, Default)]
pub struct ActiveRequests {
    handles: Mutex<HashMap<RequestId, CancelHandle>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str, handle: CancelHandle) {
        self.handles.lock().insert(request_id.to_string(), handle);
    }

    pub fn remove(&self, request_id: &str) {
        self.handles.lock().remove(request_id);
    }

    /// Cancel one request; false when the id is not in flight
    pub fn cancel(&self, request_id: &str, reason: AbortReason) -> bool {
        let handle = self.handles.lock().get(request_id).cloned();
        match handle {
            Some(handle) => handle.cancel(reason),
            None => false,
        }
    }

    /// Cancel everything in flight, returning how many were signalled
    pub fn cancel_all(&self, reason: AbortReason) -> usize {
        let handles: Vec<CancelHandle> = self.handles.lock().values().cloned().collect();
        handles.iter().filter(|h| h.cancel(reason)).count()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// Outcome of waiting on the engine while watching cancellation
enum Step<T> {
    Cancelled,
    DeadlineElapsed,
    Ready(T),
}

/// An admitted request and its engine submission
pub struct GenerationRequest {
    id: RequestId,
    prompt: String,
    config: SamplingConfig,
    engine: Arc<dyn InferenceEngine>,
    permit: Option<AdmissionPermit>,
    cancel: CancelHandle,
    active: Arc<ActiveRequests>,
    state: RequestState,
    outputs: Option<EngineStream>,
    deadline: Option<tokio::time::Instant>,
    started: Instant,
    last: Option<StreamUnit>,
}

impl GenerationRequest {
    /// Wrap a held slot into a request with a fresh id
    pub fn admit(
        engine: Arc<dyn InferenceEngine>,
        prompt: String,
        config: SamplingConfig,
        permit: AdmissionPermit,
        active: Arc<ActiveRequests>,
    ) -> Self {
        // An unrepresentable deadline is as good as none
        let deadline = config
            .deadline
            .and_then(|d| tokio::time::Instant::now().checked_add(d));

        let id = Uuid::new_v4().to_string();
        let cancel = CancelHandle::new();
        active.register(&id, cancel.clone());
        METRICS.worker.requests_total.inc();

        debug!(request_id = %id, "Request admitted");

        Self {
            id,
            prompt,
            config,
            engine,
            permit: Some(permit),
            cancel,
            active,
            state: RequestState::Admitted,
            outputs: None,
            deadline,
            started: Instant::now(),
            last: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Next unit to deliver, in generation order
    ///
    /// `None` means the request ended without anything further for the
    /// caller: normal completion, or a cancellation the client asked for.
    /// Server-initiated cancellation and engine failures come back as a final
    /// `Err`.
    pub async fn next_unit(&mut self) -> Option<Result<StreamUnit>> {
        if self.state.is_terminal() {
            return None;
        }

        if self.outputs.is_none() {
            if let Some(reason) = self.cancel.reason() {
                return self.abort_with(reason);
            }
            self.state = RequestState::Submitted;

            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(self.deadline) => Step::DeadlineElapsed,
                submitted = self.engine.submit(&self.id, &self.prompt, &self.config) => {
                    Step::Ready(submitted)
                }
            };

            match step {
                Step::Cancelled => return self.interrupted(false),
                Step::DeadlineElapsed => return self.interrupted(true),
                Step::Ready(Ok(stream)) => self.outputs = Some(stream),
                Step::Ready(Err(e)) => {
                    warn!(request_id = %self.id, "Engine submission failed: {}", e);
                    self.finish(RequestState::Failed);
                    return Some(Err(e));
                }
            }
        }

        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let outputs = self.outputs.as_mut()?;

        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            _ = sleep_until(deadline) => Step::DeadlineElapsed,
            item = outputs.next() => Step::Ready(item),
        };

        match step {
            Step::Cancelled => self.interrupted(false),
            Step::DeadlineElapsed => self.interrupted(true),
            Step::Ready(Some(Ok(output))) => {
                self.state = RequestState::Streaming;
                METRICS.worker.partial_outputs_total.inc();
                let unit = self.unit_for(output);
                self.last = Some(unit.clone());
                Some(Ok(unit))
            }
            Step::Ready(Some(Err(e))) => {
                warn!(request_id = %self.id, "Engine failed mid-stream: {}", e);
                self.finish(RequestState::Failed);
                Some(Err(e))
            }
            Step::Ready(None) => {
                self.finish(RequestState::Completed);
                None
            }
        }
    }

    /// Consume every output and return only the final one
    pub async fn run_to_completion(mut self) -> Result<StreamUnit> {
        while let Some(unit) = self.next_unit().await {
            unit?;
        }

        match self.state {
            RequestState::Completed => Ok(self.last.take().unwrap_or_else(|| {
                let text = if self.config.echo { self.prompt.clone() } else { String::new() };
                StreamUnit::ok(text, Usage::default())
            })),
            RequestState::Aborted => Err(LlmOpsError::Cancelled(format!(
                "request {} cancelled by client",
                self.id
            ))),
            state => Err(LlmOpsError::internal(format!(
                "request {} ended in state {:?}",
                self.id, state
            ))),
        }
    }

    /// Sentinel-framed body for streaming transports
    ///
    /// A failure ends the stream with one error-coded frame. Dropping the
    /// stream aborts the request.
    pub fn into_frames(self) -> BoxStream<'static, std::result::Result<Bytes, Infallible>> {
        let mut request = self;
        let stream = async_stream::stream! {
            while let Some(item) = request.next_unit().await {
                let unit = match item {
                    Ok(unit) => unit,
                    Err(e) => e.to_unit(),
                };
                match encode_frame(&unit) {
                    Ok(frame) => yield Ok(frame),
                    Err(e) => {
                        warn!(request_id = %request.id, "Dropping unencodable unit: {}", e);
                        request.finish(RequestState::Failed);
                        if let Ok(frame) = encode_frame(&StreamUnit::error(
                            ErrorCode::InternalError,
                            "failed to encode output",
                        )) {
                            yield Ok(frame);
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }

    fn unit_for(&self, output: EngineOutput) -> StreamUnit {
        let text = if self.config.echo {
            format!("{}{}", self.prompt, output.text)
        } else {
            output.text
        };
        let total_tokens = match (output.prompt_tokens, output.completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        };
        StreamUnit::ok(
            text,
            Usage {
                prompt_tokens: output.prompt_tokens,
                completion_tokens: output.completion_tokens,
                total_tokens,
            },
        )
    }

    /// Stop on a cancel signal or an elapsed deadline
    ///
    /// A deadline loses to a reason recorded earlier.
    fn interrupted(&mut self, deadline_elapsed: bool) -> Option<Result<StreamUnit>> {
        let fallback = if deadline_elapsed {
            self.cancel.cancel(AbortReason::Deadline);
            AbortReason::Deadline
        } else {
            AbortReason::Client
        };
        let reason = self.cancel.reason().unwrap_or(fallback);
        self.abort_with(reason)
    }

    fn abort_with(&mut self, reason: AbortReason) -> Option<Result<StreamUnit>> {
        self.finish(RequestState::Aborted);
        match reason {
            AbortReason::Client => None,
            AbortReason::Shutdown => Some(Err(LlmOpsError::aborted("worker is shutting down"))),
            AbortReason::Deadline => Some(Err(LlmOpsError::timeout(format!(
                "request {} exceeded its deadline",
                self.id
            )))),
        }
    }

    /// Single cleanup path for every terminal state
    fn finish(&mut self, state: RequestState) {
        if self.state.is_terminal() {
            return;
        }
        let submitted = self.state != RequestState::Admitted;
        self.state = state;

        self.outputs = None;
        if submitted && state != RequestState::Completed {
            self.engine.abort(&self.id);
        }
        self.permit.take();
        self.active.remove(&self.id);

        let elapsed = self.started.elapsed();
        METRICS.worker.request_duration.observe(elapsed.as_secs_f64());
        match state {
            RequestState::Completed => METRICS.worker.requests_completed.inc(),
            RequestState::Failed => METRICS.worker.requests_failed.inc(),
            _ => METRICS.worker.requests_aborted.inc(),
        }

        info!(
            request_id = %self.id,
            reason = ?self.cancel.reason(),
            "Request finished as {:?} after {:?}",
            state,
            elapsed
        );
    }
}

impl Drop for GenerationRequest {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.cancel.cancel(AbortReason::Client);
            self.finish(RequestState::Aborted);
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cancel_reason_wins() {
        let handle = CancelHandle::new();
        assert!(handle.cancel(AbortReason::Deadline));
        assert!(!handle.cancel(AbortReason::Client));

        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), Some(AbortReason::Deadline));
    }

    #[test]
    fn test_active_requests_cancel() {
        let active = ActiveRequests::new();
        let first = CancelHandle::new();
        let second = CancelHandle::new();
        active.register("a", first.clone());
        active.register("b", second.clone());

        assert!(active.cancel("a", AbortReason::Client));
        assert!(!active.cancel("missing", AbortReason::Client));
        assert_eq!(first.reason(), Some(AbortReason::Client));

        // "a" is already cancelled, only "b" is newly signalled
        assert_eq!(active.cancel_all(AbortReason::Shutdown), 1);
        assert_eq!(second.reason(), Some(AbortReason::Shutdown));

        active.remove("a");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestState::Admitted.is_terminal());
        assert!(!RequestState::Streaming.is_terminal());
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Aborted.is_terminal());
    }
}
