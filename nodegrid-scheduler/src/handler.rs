//! Outstanding-request correlation table, grounded in
//! `examples/original_source/libs/grd/include/grd/RpcClient.h`'s
//! request-handler-box pattern and spec §4.4 "Handler correlation":
//! posting an envelope with a handler records `request_id -> handler`;
//! a matching response (or a timeout sweep) invokes it exactly once.

use async_trait::async_trait;
use dashmap::DashMap;
use nodegrid_protocol::Envelope;
use std::time::{Duration, Instant};

/// Which leg of the correlation mechanism itself failed, as opposed to
/// an ordinary error response arriving over `handle_error` (spec §4.6
/// "A request handler is a continuation object with three entry
/// points"). `Post` is a local queuing failure before the envelope ever
/// left the scheduler; `Send` is a transport-level send failure; `Wait`
/// is used when the owning task is destroyed while the request is still
/// outstanding (spec §5 "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommErrorPhase {
    Post,
    Send,
    Wait,
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_result(&self, response: &Envelope);
    async fn handle_error(&self, response: &Envelope);

    /// Called instead of `handle_error` when the failure is in the
    /// correlation mechanism rather than in an application-level
    /// response. Default forwards to `handle_error` so handlers that
    /// don't care about the distinction need not implement it.
    async fn handle_comm_error(&self, response: &Envelope, _phase: CommErrorPhase) {
        self.handle_error(response).await;
    }
}

struct PendingRequest {
    handler: Box<dyn RequestHandler>,
    original: Envelope,
    deadline: Option<Instant>,
    owner_task: Option<String>,
}

/// Table of in-flight requests keyed by request id. Entries with a
/// timeout are swept by [`HandlerTable::sweep_expired`] once the
/// deadline has passed and no response has arrived.
#[derive(Default)]
pub struct HandlerTable {
    pending: DashMap<i64, PendingRequest>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable { pending: DashMap::new() }
    }

    pub fn register(&self, request_id: i64, original: Envelope, handler: Box<dyn RequestHandler>) {
        self.register_owned(request_id, original, handler, None)
    }

    /// Same as [`HandlerTable::register`], but tagging the handler with
    /// the name of the task that owns it, so [`HandlerTable::release_for_task`]
    /// can find it again if that task is destroyed first.
    pub fn register_owned(
        &self,
        request_id: i64,
        original: Envelope,
        handler: Box<dyn RequestHandler>,
        owner_task: Option<String>,
    ) {
        let deadline = if original.timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(original.timeout_ms as u64))
        } else {
            None
        };
        self.pending.insert(
            request_id,
            PendingRequest { handler, original, deadline, owner_task },
        );
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Deliver `response` to its registered handler, if any. Returns
    /// `true` if a handler was found and invoked (and removed).
    pub async fn deliver(&self, response: &Envelope) -> bool {
        let Some((_, entry)) = self.pending.remove(&response.request_id()) else {
            return false;
        };
        match response.event.status() {
            Some(status) if status.is_error() => entry.handler.handle_error(response).await,
            _ => entry.handler.handle_result(response).await,
        }
        true
    }

    /// Synthesize and deliver a `TIMEOUT` response for every pending
    /// request whose deadline has passed, per spec §4.4's "Envelope-level
    /// timeout expiry synthesises an error response of kind `TIMEOUT`".
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|e| e.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|e| *e.key())
            .collect();

        for request_id in &expired {
            if let Some((_, entry)) = self.pending.remove(request_id) {
                let response = entry.original.timeout_response();
                entry.handler.handle_error(&response).await;
            }
        }
        expired.len()
    }

    /// Remove the handler for `request_id` and deliver a synthetic
    /// `USR_ABORT` response upward (spec §4.6 "Cancellation"). Returns
    /// `false` if no such request was outstanding.
    pub async fn cancel_request(&self, request_id: i64) -> bool {
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return false;
        };
        let response = entry.original.reply_error(nodegrid_shared::StatusCode::UsrAbort, "request cancelled");
        entry.handler.handle_error(&response).await;
        true
    }

    /// Release every handler owned by `task_name` with a comm-error of
    /// phase `Wait` (spec §4.6/§5: "Tasks that are destroyed while
    /// owning handlers cause their handlers to be released with a
    /// comm-error"). Called by the scheduler when it drops a finished
    /// task that still has outstanding requests.
    pub async fn release_for_task(&self, task_name: &str) -> usize {
        let owned: Vec<i64> = self
            .pending
            .iter()
            .filter(|e| e.owner_task.as_deref() == Some(task_name))
            .map(|e| *e.key())
            .collect();
        for request_id in &owned {
            if let Some((_, entry)) = self.pending.remove(request_id) {
                let response = entry.original.reply_error(nodegrid_shared::StatusCode::UsrAbort, "owning task destroyed");
                entry.handler.handle_comm_error(&response, CommErrorPhase::Wait).await;
            }
        }
        owned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_address::Address;
    use nodegrid_shared::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingHandler {
        got_result: Arc<AtomicBool>,
        got_error: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RequestHandler for RecordingHandler {
        async fn handle_result(&self, _response: &Envelope) {
            self.got_result.store(true, Ordering::SeqCst);
        }
        async fn handle_error(&self, _response: &Envelope) {
            self.got_error.store(true, Ordering::SeqCst);
        }
    }

    fn req(timeout_ms: u32) -> Envelope {
        Envelope::request(Address::raw("A"), Address::raw("B"), 1, "core.echo", Value::Null, timeout_ms)
    }

    #[tokio::test]
    async fn delivers_matching_response_to_handler() {
        let table = HandlerTable::new();
        let got_result = Arc::new(AtomicBool::new(false));
        let got_error = Arc::new(AtomicBool::new(false));
        table.register(
            1,
            req(0),
            Box::new(RecordingHandler { got_result: got_result.clone(), got_error: got_error.clone() }),
        );
        let response = req(0).reply(nodegrid_shared::StatusCode::Ok, Value::from("pong"));
        assert!(table.deliver(&response).await);
        assert!(got_result.load(Ordering::SeqCst));
        assert!(!got_error.load(Ordering::SeqCst));
        assert!(!table.contains(1));
    }

    #[tokio::test]
    async fn sweep_synthesizes_timeout_for_expired_entries() {
        let table = HandlerTable::new();
        let got_error = Arc::new(AtomicBool::new(false));
        table.register(
            1,
            req(1),
            Box::new(RecordingHandler {
                got_result: Arc::new(AtomicBool::new(false)),
                got_error: got_error.clone(),
            }),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = table.sweep_expired().await;
        assert_eq!(swept, 1);
        assert!(got_error.load(Ordering::SeqCst));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unmatched_response_is_not_delivered() {
        let table = HandlerTable::new();
        let response = req(0).reply(nodegrid_shared::StatusCode::Ok, Value::Null);
        assert!(!table.deliver(&response).await);
    }

    #[tokio::test]
    async fn cancel_request_synthesizes_usr_abort_via_handle_error() {
        let table = HandlerTable::new();
        let got_error = Arc::new(AtomicBool::new(false));
        table.register(
            1,
            req(0),
            Box::new(RecordingHandler { got_result: Arc::new(AtomicBool::new(false)), got_error: got_error.clone() }),
        );
        assert!(table.cancel_request(1).await);
        assert!(got_error.load(Ordering::SeqCst));
        assert!(!table.contains(1));
    }

    #[tokio::test]
    async fn release_for_task_only_touches_matching_owner() {
        struct CommErrorHandler {
            phase: Arc<std::sync::Mutex<Option<CommErrorPhase>>>,
        }
        #[async_trait]
        impl RequestHandler for CommErrorHandler {
            async fn handle_result(&self, _response: &Envelope) {}
            async fn handle_error(&self, _response: &Envelope) {}
            async fn handle_comm_error(&self, _response: &Envelope, phase: CommErrorPhase) {
                *self.phase.lock().unwrap() = Some(phase);
            }
        }

        let table = HandlerTable::new();
        let phase = Arc::new(std::sync::Mutex::new(None));
        table.register_owned(1, req(0), Box::new(CommErrorHandler { phase: phase.clone() }), Some("task-a".into()));
        table.register_owned(
            2,
            req(0),
            Box::new(RecordingHandler { got_result: Arc::new(AtomicBool::new(false)), got_error: Arc::new(AtomicBool::new(false)) }),
            Some("task-b".into()),
        );

        let released = table.release_for_task("task-a").await;
        assert_eq!(released, 1);
        assert_eq!(*phase.lock().unwrap(), Some(CommErrorPhase::Wait));
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }
}
