//! Server-sent-events adapter over the event hub.
//!
//! New subscribers receive the hub's history first, then the live tail.
//! A keep-alive comment goes out periodically so intermediaries keep the
//! stream open.

use hyper::body::Bytes;
use hyper::{Body, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use flowk_core::{EventHub, FlowEvent};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Encode one event in SSE framing.
pub fn format_event(event: &FlowEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.kind.as_str(), data)
}

/// Build the streaming response for `GET /api/run/events`.
pub fn event_stream_response(hub: &Arc<EventHub>) -> Response<Body> {
    let (history, receiver) = hub.subscribe();
    let (sender, body) = Body::channel();

    tokio::spawn(stream_events(history, receiver, sender));

    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .unwrap()
}

async fn stream_events(
    history: Vec<FlowEvent>,
    mut receiver: broadcast::Receiver<FlowEvent>,
    mut sender: hyper::body::Sender,
) {
    debug!("SSE subscriber attached, replaying {} events", history.len());
    for event in &history {
        if sender
            .send_data(Bytes::from(format_event(event)))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(event) => {
                    if sender
                        .send_data(Bytes::from(format_event(&event)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber lagged, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = keep_alive.tick() => {
                if sender
                    .send_data(Bytes::from(": keep-alive\n\n"))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowk_core::EventKind;

    #[test]
    fn test_sse_framing() {
        let event = FlowEvent::new(EventKind::TaskStarted, "f1");
        let framed = format_event(&event);
        assert!(framed.starts_with("event: task_started\ndata: {"));
        assert!(framed.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_history_replay_reaches_body() {
        let hub = Arc::new(EventHub::new());
        hub.publish(FlowEvent::new(EventKind::FlowStarted, "f1"));

        let response = event_stream_response(&hub);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body();
        let chunk = hyper::body::HttpBody::data(&mut body).await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("flow_started"));
    }
}
