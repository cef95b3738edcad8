//! Request/response correlation.
//!
//! Every issued command gets a UUID request id and a pending slot. The slot
//! is removed exactly once: by the matching response, by a rejection, or by
//! the timeout. Responses for ids that have no slot are dropped.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::client::ClientError;
use crate::protocol::{Action, Command};

/// Default round-trip timeout for one command.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where issued commands are written.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, command: Value) -> Result<(), ClientError>;
}

type Slot = oneshot::Sender<Result<Value, ClientError>>;

/// Tracks in-flight requests by id.
pub struct Correlator {
    pending: DashMap<String, Slot>,
    timeout: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Whether a request with this id is still waiting.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Issue a query action and wait for its result.
    pub async fn issue(&self, sink: &dyn CommandSink, action: Action) -> Result<Value, ClientError> {
        self.issue_command(sink, Command::with_new_id(action)).await
    }

    /// Issue an untyped command object, validated locally first.
    ///
    /// Any `request_id` already present is replaced.
    pub async fn issue_object(
        &self,
        sink: &dyn CommandSink,
        mut object: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        object.insert(
            "request_id".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        let command = Command::from_value(Value::Object(object))?;
        self.issue_command(sink, command).await
    }

    async fn issue_command(
        &self,
        sink: &dyn CommandSink,
        command: Command,
    ) -> Result<Value, ClientError> {
        let id = command
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut command = command;
        command.request_id = Some(id.clone());

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = sink.send_command(command.to_value()).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match timeout(self.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(ClientError::ConnectionClosed),
            Err(_elapsed) => {
                if self.pending.remove(&id).is_some() {
                    warn!(request_id = %id, action = command.action.name(), "Request timed out");
                    Err(ClientError::Timeout)
                } else {
                    // A resolver took the slot as the timer fired; its value is on the way.
                    rx.await.unwrap_or(Err(ClientError::ConnectionClosed))
                }
            }
        }
    }

    /// Deliver a result. Returns false if nobody was waiting for `request_id`.
    pub fn resolve(&self, request_id: &str, result: Value) -> bool {
        self.complete(request_id, Ok(result))
    }

    /// Fail a pending request. Returns false if nobody was waiting.
    pub fn reject(&self, request_id: &str, error: ClientError) -> bool {
        self.complete(request_id, Err(error))
    }

    /// Fail every pending request, e.g. when the connection drops.
    pub fn fail_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.complete(&id, Err(ClientError::ConnectionClosed));
        }
    }

    fn complete(&self, request_id: &str, result: Result<Value, ClientError>) -> bool {
        match self.pending.remove(request_id) {
            Some((_, slot)) => {
                let _ = slot.send(result);
                true
            }
            None => {
                debug!(request_id, "Dropping response with no pending request");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&self, command: Value) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl CommandSink for ClosedSink {
        async fn send_command(&self, _command: Value) -> Result<(), ClientError> {
            Err(ClientError::ConnectionClosed)
        }
    }

    async fn wait_for_request_id(sink: &RecordingSink) -> String {
        loop {
            if let Some(cmd) = sink.sent.lock().unwrap().last() {
                return cmd["request_id"].as_str().unwrap().to_string();
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let correlator = Arc::new(Correlator::default());
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let correlator = correlator.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                correlator
                    .issue(sink.as_ref(), Action::GetObjectsInPatch {})
                    .await
            })
        };

        let id = wait_for_request_id(&sink).await;
        assert_eq!(correlator.in_flight(), 1);
        assert!(correlator.resolve(&id, json!({"boxes": [], "lines": []})));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"boxes": [], "lines": []}));
        assert_eq!(correlator.in_flight(), 0);
        assert_eq!(
            sink.sent.lock().unwrap()[0]["action"],
            json!("get_objects_in_patch")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_once() {
        let correlator = Arc::new(Correlator::new(Duration::from_secs(30)));
        let sink = Arc::new(RecordingSink::default());
        let started = tokio::time::Instant::now();

        let result = correlator
            .issue(sink.as_ref(), Action::GetAvoidRectPosition {})
            .await;

        assert!(matches!(result, Err(ClientError::Timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_millis(30_010));
        assert_eq!(correlator.in_flight(), 0);

        // The late response finds no slot and is dropped.
        let id = sink.sent.lock().unwrap()[0]["request_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(!correlator.resolve(&id, json!(null)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let correlator = Correlator::default();
        assert!(!correlator.resolve("nope", json!(1)));
        assert!(!correlator.reject("nope", ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_reject_and_second_resolution_ignored() {
        let correlator = Arc::new(Correlator::default());
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let correlator = correlator.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                correlator
                    .issue(
                        sink.as_ref(),
                        Action::GetObjectAttributes {
                            varname: "osc".into(),
                        },
                    )
                    .await
            })
        };

        let id = wait_for_request_id(&sink).await;
        assert!(correlator.reject(
            &id,
            ClientError::Rejected {
                code: "UNKNOWN_ACTION".into(),
                message: "nope".into()
            }
        ));
        assert!(!correlator.resolve(&id, json!({})));

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ClientError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_send_failure_clears_slot() {
        let correlator = Correlator::default();
        let result = correlator
            .issue(&ClosedSink, Action::GetObjectsInSelected {})
            .await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        assert_eq!(correlator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_issue_object_validates_locally() {
        let correlator = Correlator::default();
        let sink = RecordingSink::default();
        let mut object = Map::new();
        object.insert("action".into(), json!("get_object_attributes"));

        let result = correlator.issue_object(&sink, object).await;
        assert!(matches!(result, Err(ClientError::InvalidCommand(_))));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_rejects_pending() {
        let correlator = Arc::new(Correlator::default());
        let sink = Arc::new(RecordingSink::default());

        let task = {
            let correlator = correlator.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                correlator
                    .issue(sink.as_ref(), Action::GetObjectsInPatch {})
                    .await
            })
        };

        wait_for_request_id(&sink).await;
        correlator.fail_all();
        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }
}
