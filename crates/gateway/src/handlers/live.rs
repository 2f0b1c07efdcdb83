//! Live extraction status over WebSocket
//!
//! On connect the channel starts an extraction if the document has none,
//! sends the current status and then relays every event published on the
//! document topic. Clients may send `{"action": "get_status"}` or
//! `{"action": "retry_ocr"}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use intake_common::{
    errors::Result,
    extraction::{ExtractionService, StatusView},
    notify::{topic, ChannelMessage, ProgressEvent},
};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    GetStatus,
    RetryOcr,
}

pub async fn live_status(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve(socket, state, document_id))
}

async fn serve(socket: WebSocket, state: AppState, document_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading state so no event falls in between
    let mut events = match state.services.publisher.subscribe(&topic(document_id)).await {
        Ok(events) => events,
        Err(e) => {
            warn!(document_id = %document_id, error = %e, "Failed to subscribe to progress");
            let _ = send(&mut sender, &error_message(e.to_string())).await;
            return;
        }
    };

    let greeting = match state.extraction.ensure_started(document_id).await {
        Ok(view) => status_message(&view),
        Err(e) => {
            let _ = send(&mut sender, &error_message(e.to_string())).await;
            let _ = sender.close().await;
            return;
        }
    };
    if send(&mut sender, &greeting).await.is_err() {
        return;
    }
    info!(document_id = %document_id, "Live status connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                };
                let reply = handle_action(&state.extraction, document_id, text.as_str()).await;
                if send(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                if send(&mut sender, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(document_id = %document_id, "Live status disconnected");
}

/// Answer one client message
pub async fn handle_action(
    extraction: &ExtractionService,
    document_id: Uuid,
    text: &str,
) -> ChannelMessage {
    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => return error_message(format!("invalid message: {e}")),
    };

    let answer: Result<ChannelMessage> = match action {
        ClientAction::GetStatus => extraction
            .get_status(document_id)
            .await
            .map(|view| status_message(&view)),
        ClientAction::RetryOcr => extraction.request_retry(document_id).await.map(|decision| {
            let message = match (&decision.job_id, &decision.reason) {
                (_, Some(reason)) => reason.clone(),
                (Some(job_id), None) => format!("extraction restarted as job {job_id}"),
                (None, None) => String::new(),
            };
            ChannelMessage::ActionResult {
                action: "retry_ocr".to_string(),
                accepted: decision.accepted,
                message: Some(message),
            }
        }),
    };

    answer.unwrap_or_else(|e| error_message(e.to_string()))
}

fn status_message(view: &StatusView) -> ChannelMessage {
    ChannelMessage::Status(ProgressEvent {
        document_id: view.document_id,
        complete: view.complete,
        progress: view.progress,
        status: view.status,
        message: view.error.clone(),
        retry_count: view.retry_count,
    })
}

fn error_message(message: String) -> ChannelMessage {
    ChannelMessage::Error { message }
}

async fn send<S>(sender: &mut S, message: &ChannelMessage) -> std::result::Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode channel message");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gateway;
    use intake_common::extraction::store::TaskStore;
    use intake_common::extraction::{DocumentCategory, TaskStatus};

    #[tokio::test]
    async fn test_get_status_action() {
        let (_, fixture) = gateway();
        let id = fixture.add_document(DocumentCategory::TaxId);
        fixture.extraction.ensure_started(id).await.unwrap();

        match handle_action(&fixture.extraction, id, r#"{"action":"get_status"}"#).await {
            ChannelMessage::Status(event) => {
                assert_eq!(event.status, TaskStatus::Pending);
                assert!(!event.complete);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_action_reports_decision() {
        let (_, fixture) = gateway();
        let id = fixture.add_document(DocumentCategory::TaxId);

        match handle_action(&fixture.extraction, id, r#"{"action":"retry_ocr"}"#).await {
            ChannelMessage::ActionResult {
                action, accepted, ..
            } => {
                assert_eq!(action, "retry_ocr");
                assert!(accepted);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_message_is_error() {
        let (_, fixture) = gateway();
        let id = fixture.add_document(DocumentCategory::TaxId);

        for text in ["not json", r#"{"action":"dance"}"#, r#"{"noaction":1}"#] {
            assert!(matches!(
                handle_action(&fixture.extraction, id, text).await,
                ChannelMessage::Error { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_ensure_started_on_connect() {
        let (_, fixture) = gateway();
        let id = fixture.add_document(DocumentCategory::IncomeProof);
        let view = fixture.extraction.ensure_started(id).await.unwrap();
        match status_message(&view) {
            ChannelMessage::Status(event) => assert_eq!(event.progress, 0),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(fixture.services.tasks.find(id).await.unwrap().is_some());
    }
}
