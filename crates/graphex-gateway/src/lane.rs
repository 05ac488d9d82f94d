use tokio::sync::{mpsc, oneshot};

use crate::api::ApiError;

pub type LaneResult = Result<serde_json::Value, ApiError>;

/// A request queued in a connection lane.
pub struct LaneItem {
    pub method: String,
    pub params: serde_json::Value,
    pub respond: oneshot::Sender<LaneResult>,
}

/// Per-connection FIFO queue ensuring serial execution of requests.
pub struct LaneQueue {
    tx: mpsc::Sender<LaneItem>,
}

impl LaneQueue {
    /// Create a new lane and return (queue_handle, receiver).
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<LaneItem>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Enqueue a request and wait for the result. `None` if the processor is gone.
    pub async fn send(&self, method: String, params: serde_json::Value) -> Option<LaneResult> {
        let (respond, rx) = oneshot::channel();
        let item = LaneItem {
            method,
            params,
            respond,
        };
        self.tx.send(item).await.ok()?;
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_requests_are_answered_in_order() {
        let (lane, mut rx) = LaneQueue::new(4);
        let processor = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(item) = rx.recv().await {
                seen.push(item.method.clone());
                let _ = item.respond.send(Ok(json!(seen.len())));
            }
            seen
        });

        assert_eq!(lane.send("a".into(), json!({})).await, Some(Ok(json!(1))));
        assert_eq!(lane.send("b".into(), json!({})).await, Some(Ok(json!(2))));
        drop(lane);
        assert_eq!(processor.await.unwrap(), vec!["a", "b"]);
    }
}
