//! Realtime progress channel over WebSocket.
//!
//! On connect the client receives a `progress_snapshot`. It may then send
//! `{"action":"subscribe","job_id":..}` to also receive that job's scoped
//! events; the job's current record is replayed immediately as a
//! `job_record` event. Global events are always delivered.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use mf_core::events::{Event, EventPayload, EventScope};
use mf_core::UploadId;

use crate::context::AppContext;

/// Messages accepted from the client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { job_id: UploadId },
    Unsubscribe { job_id: UploadId },
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> Response {
    // Subscribe before the snapshot is taken so nothing published in between
    // is lost.
    let rx = ctx.event_bus.subscribe();
    let close = ctx.lifecycle.close_token();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, rx, close))
}

async fn handle_socket(
    mut socket: WebSocket,
    ctx: AppContext,
    mut rx: broadcast::Receiver<Event>,
    close: CancellationToken,
) {
    let snapshot = Event::global(EventPayload::ProgressSnapshot(ctx.progress.snapshot()));
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }

    let mut subscriptions: HashSet<UploadId> = HashSet::new();
    tracing::debug!("Realtime client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event.is_visible_to(&subscriptions) {
                            continue;
                        }
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Realtime client lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Subscribe { job_id }) => {
                                subscriptions.insert(job_id);
                                let replay = Event::new(
                                    EventScope::Job(job_id),
                                    EventPayload::JobRecord(ctx.progress.get(job_id)),
                                );
                                if send_event(&mut socket, &replay).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Unsubscribe { job_id }) => {
                                subscriptions.remove(&job_id);
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring malformed realtime message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Realtime socket error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = close.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!("Realtime client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|e| {
        tracing::warn!(error = %e, "Failed to serialize realtime event");
    })?;
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_messages() {
        let id = UploadId::new();
        let sub: ClientMessage =
            serde_json::from_str(&format!(r#"{{"action":"subscribe","job_id":"{id}"}}"#)).unwrap();
        assert_eq!(sub, ClientMessage::Subscribe { job_id: id });

        let unsub: ClientMessage =
            serde_json::from_str(&format!(r#"{{"action":"unsubscribe","job_id":"{id}"}}"#)).unwrap();
        assert_eq!(unsub, ClientMessage::Unsubscribe { job_id: id });

        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"subscribe","job_id":"x"}"#).is_err());
    }
}
