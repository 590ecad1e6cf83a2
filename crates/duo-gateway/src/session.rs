//! Per-connection actor.
//!
//! A dedicated read task decodes inbound frames and forwards them over a
//! channel. The session loop owns the write half and is the only writer, so
//! responses, notifications and pings never interleave on the wire.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use duo_types::api::{SEND_MESSAGE, SendMessageParams, error_code};
use duo_types::protocol::{CodecError, Envelope, Notification, Request, Response, decode_request, encode};

use crate::config::GatewayConfig;
use crate::error::{RelayError, TransportError};
use crate::registry::{Registry, SessionHandle};

const INBOUND_BUFFER: usize = 32;

/// Why a session ended without a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    Shutdown,
}

/// What the session loop has to write next.
enum Outgoing {
    Reply(Request),
    Notify(Notification),
    Ping,
}

enum Inbound {
    Request(Request),
    Pong,
    Closed,
    Failed(TransportError),
}

pub struct Session {
    handle: SessionHandle,
    notifications: mpsc::UnboundedReceiver<Notification>,
    registry: Registry,
    config: GatewayConfig,
}

impl Session {
    pub fn new(
        handle: SessionHandle,
        notifications: mpsc::UnboundedReceiver<Notification>,
        registry: Registry,
        config: GatewayConfig,
    ) -> Self {
        Self {
            handle,
            notifications,
            registry,
            config,
        }
    }

    /// Runs until the peer closes, `shutdown` fires, or a transport error
    /// occurs. Deregistration and the close frame are the caller's job.
    ///
    /// Every write is bounded by the ping timeout, and the work done for each
    /// event is abandoned as soon as `shutdown` fires.
    pub async fn run<Tx, Rx, E>(
        mut self,
        sender: &mut Tx,
        receiver: Rx,
        shutdown: CancellationToken,
    ) -> Result<SessionEnd, TransportError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let reader_cancel = shutdown.child_token();
        // Stops the read task on every exit path.
        let _reader_guard = reader_cancel.clone().drop_guard();
        tokio::spawn(read_loop(receiver, inbound_tx, reader_cancel));

        let heartbeat = time::sleep(self.config.heartbeat_interval);
        tokio::pin!(heartbeat);
        let mut awaiting_pong = false;

        loop {
            let outgoing = tokio::select! {
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),

                inbound = inbound_rx.recv() => match inbound {
                    Some(Inbound::Request(request)) => Outgoing::Reply(request),
                    Some(Inbound::Pong) => {
                        awaiting_pong = false;
                        heartbeat
                            .as_mut()
                            .reset(Instant::now() + self.config.heartbeat_interval);
                        continue;
                    }
                    Some(Inbound::Closed) | None => return Ok(SessionEnd::PeerClosed),
                    Some(Inbound::Failed(e)) => return Err(e),
                },

                notification = self.notifications.recv() => match notification {
                    Some(notification) => Outgoing::Notify(notification),
                    None => return Ok(SessionEnd::Shutdown),
                },

                _ = &mut heartbeat => {
                    if awaiting_pong {
                        return Err(TransportError::HeartbeatTimeout);
                    }
                    Outgoing::Ping
                }
            };

            let is_ping = matches!(outgoing, Outgoing::Ping);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                sent = self.emit(sender, outgoing) => sent?,
            }

            if is_ping {
                awaiting_pong = true;
                heartbeat.as_mut().reset(Instant::now() + self.config.ping_timeout);
            } else if !awaiting_pong {
                // Any serviced event counts as activity, unless a ping is
                // still outstanding; that deadline stands.
                heartbeat
                    .as_mut()
                    .reset(Instant::now() + self.config.heartbeat_interval);
            }
        }
    }

    /// Produces and writes the frame for one event.
    async fn emit<Tx>(&self, sender: &mut Tx, outgoing: Outgoing) -> Result<(), TransportError>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: Display,
    {
        let deadline = self.config.ping_timeout;
        match outgoing {
            Outgoing::Reply(request) => {
                let response = self.dispatch(request).await;
                send_envelope(sender, &Envelope::Response(response), deadline).await
            }
            Outgoing::Notify(notification) => {
                send_envelope(sender, &Envelope::Notification(notification), deadline).await
            }
            Outgoing::Ping => match time::timeout(deadline, sender.send(Message::Ping(Bytes::new()))).await {
                Ok(sent) => sent.map_err(|e| TransportError::Write(e.to_string())),
                Err(_) => Err(TransportError::HeartbeatTimeout),
            },
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        match request.method.as_str() {
            SEND_MESSAGE => {
                let params: SendMessageParams = match serde_json::from_value(request.data) {
                    Ok(params) => params,
                    Err(e) => {
                        return Response::error(
                            id,
                            error_code::INVALID_PARAMS,
                            format!("Invalid sendMessage params: {}", e),
                        );
                    }
                };
                self.send_message(id, params).await
            }
            other => {
                debug!("{} sent unknown method '{}'", self.handle.user.username, other);
                Response::error(
                    id,
                    error_code::METHOD_NOT_FOUND,
                    "WebSocket request method not found.",
                )
            }
        }
    }

    async fn send_message(&self, id: i64, params: SendMessageParams) -> Response {
        match self
            .registry
            .relay(&self.handle, &params.recipient, &params.body)
            .await
        {
            Ok(relayed) => match serde_json::to_value(&relayed.event) {
                Ok(data) => Response::success(id, data),
                Err(e) => {
                    error!("Failed to encode relay result: {}", e);
                    Response::error(id, error_code::INTERNAL, "Internal server error.")
                }
            },
            Err(e) => {
                if !matches!(e, RelayError::Store(_)) {
                    debug!(
                        "{} relay to {} rejected: {}",
                        self.handle.user.username, params.recipient, e
                    );
                }
                Response::error(id, e.code(), e.to_string())
            }
        }
    }
}

async fn send_envelope<Tx>(
    sender: &mut Tx,
    envelope: &Envelope,
    deadline: Duration,
) -> Result<(), TransportError>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let text = encode(envelope)?;
    match time::timeout(deadline, sender.send(Message::Text(text.into()))).await {
        Ok(sent) => sent.map_err(|e| TransportError::Write(e.to_string())),
        Err(_) => Err(TransportError::Write(format!("peer not reading for {:?}", deadline))),
    }
}

/// Decodes frames until the stream ends, a frame is bad, or `cancel` fires.
/// The first terminal event is forwarded and ends the task.
async fn read_loop<Rx, E>(mut receiver: Rx, inbound: mpsc::Sender<Inbound>, cancel: CancellationToken)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = receiver.next() => frame,
        };

        let event = match frame {
            Some(Ok(Message::Text(text))) => match decode_request(text.as_str()) {
                Ok(request) => Inbound::Request(request),
                Err(e) => {
                    warn!("Dropping connection on bad frame: {}", e);
                    Inbound::Failed(e.into())
                }
            },
            Some(Ok(Message::Binary(_))) => Inbound::Failed(CodecError::Binary.into()),
            Some(Ok(Message::Pong(_))) => Inbound::Pong,
            // Answered by the WebSocket layer.
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) | None => Inbound::Closed,
            Some(Err(e)) => Inbound::Failed(TransportError::Read(e.to_string())),
        };
        let terminal = !matches!(event, Inbound::Request(_) | Inbound::Pong);

        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = inbound.send(event) => sent,
        };
        if terminal || sent.is_err() {
            return;
        }
    }
}
