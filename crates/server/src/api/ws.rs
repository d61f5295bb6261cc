//! WebSocket control surface.
//!
//! A client drives a booking run over a single socket: it submits the
//! run configuration, receives the ordered status event stream and may
//! cancel at any point. The socket is the run's lifeline; if the client
//! drops, the run is cancelled rather than left booking unattended.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use chetak_core::{RunConfig, RunHandle, StatusEvent, Supervisor};

use crate::metrics::{
    ATTEMPT_OUTCOMES_TOTAL, RUNS_FINISHED_TOTAL, RUNS_STARTED_TOTAL, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_EVENTS_SENT_TOTAL,
};
use crate::state::AppState;

/// Commands a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    StartRun { config: RunConfig },
    CancelRun,
}

/// Messages sent to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RunStarted { run_id: String },
    Status { event: StatusEvent },
    Error { message: String },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("failed to serialize server message: {e}");
            true
        }
    }
}

/// Next event of the live run, or park forever when there is none.
async fn next_run_event(run: &mut Option<RunHandle>) -> Option<StatusEvent> {
    match run {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!("WebSocket client connected");

    let mut run: Option<RunHandle> = None;

    loop {
        tokio::select! {
            event = next_run_event(&mut run) => {
                match event {
                    Some(event) => {
                        WS_EVENTS_SENT_TOTAL.inc();
                        if event.is_attempt_terminal() {
                            let class = event.failure_class.unwrap_or("booked");
                            ATTEMPT_OUTCOMES_TOTAL.with_label_values(&[class]).inc();
                        }
                        if event.is_run_terminal() {
                            RUNS_FINISHED_TOTAL
                                .with_label_values(&[event.message.as_str()])
                                .inc();
                        }
                        if !send_json(&mut sender, &ServerMessage::Status { event }).await {
                            debug!("WebSocket send failed, client disconnected");
                            break;
                        }
                    }
                    None => {
                        // Stream drained: the run-scope terminal event
                        // has already been forwarded and counted.
                        if let Some(handle) = run.take() {
                            state.release_run(handle.run_id());
                        }
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&text, &state, &mut run, &mut sender).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // The client is gone; never leave a run booking unattended.
    if let Some(handle) = run.take() {
        warn!(run_id = %handle.run_id(), "client disconnected with a live run, cancelling");
        handle.cancel();
        let state = state.clone();
        tokio::spawn(async move {
            let run_id = handle.run_id();
            // Events never forwarded still count; each event reaches
            // exactly one of the two counting sites.
            for event in handle.join().await {
                if event.is_attempt_terminal() {
                    let class = event.failure_class.unwrap_or("booked");
                    ATTEMPT_OUTCOMES_TOTAL.with_label_values(&[class]).inc();
                }
                if event.is_run_terminal() {
                    RUNS_FINISHED_TOTAL
                        .with_label_values(&[event.message.as_str()])
                        .inc();
                }
            }
            state.release_run(run_id);
        });
    }

    WS_CONNECTIONS_ACTIVE.dec();
    info!("WebSocket client disconnected");
}

async fn handle_command(
    text: &str,
    state: &Arc<AppState>,
    run: &mut Option<RunHandle>,
    sender: &mut SplitSink<WebSocket, Message>,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            let message = format!("unrecognized command: {e}");
            send_json(sender, &ServerMessage::Error { message }).await;
            return;
        }
    };

    match command {
        ClientCommand::StartRun { config } => {
            if run.is_some() || state.active_run().is_some() {
                send_json(
                    sender,
                    &ServerMessage::Error {
                        message: "a booking run is already active".to_string(),
                    },
                )
                .await;
                return;
            }

            let launched = state
                .solver_for(&config)
                .map_err(|e| e.to_string())
                .and_then(|solver| {
                    let factory = state.session_factory(solver.clone());
                    Supervisor::start(
                        config,
                        factory,
                        solver,
                        state.config().recovery,
                        state.config().timing.clone(),
                    )
                    .map_err(|e| e.to_string())
                });

            match launched {
                Ok(handle) => {
                    let run_id = handle.run_id();
                    if !state.try_claim_run(run_id) {
                        // Lost the race against another socket.
                        handle.cancel();
                        tokio::spawn(handle.join());
                        send_json(
                            sender,
                            &ServerMessage::Error {
                                message: "a booking run is already active".to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    RUNS_STARTED_TOTAL.inc();
                    info!(%run_id, "booking run started");
                    send_json(
                        sender,
                        &ServerMessage::RunStarted {
                            run_id: run_id.to_string(),
                        },
                    )
                    .await;
                    *run = Some(handle);
                }
                Err(message) => {
                    warn!("run rejected: {message}");
                    send_json(sender, &ServerMessage::Error { message }).await;
                }
            }
        }
        ClientCommand::CancelRun => match run {
            Some(handle) => {
                info!(run_id = %handle.run_id(), "cancellation requested");
                handle.cancel();
            }
            None => {
                send_json(
                    sender,
                    &ServerMessage::Error {
                        message: "no active run to cancel".to_string(),
                    },
                )
                .await;
            }
        },
    }
}
