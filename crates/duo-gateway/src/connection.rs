use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use duo_types::api::{AUTHENTICATE, AuthenticateParams, AuthenticateResult};
use duo_types::events::UserSummary;
use duo_types::models::User;
use duo_types::protocol::{Envelope, Response, decode_request, encode};

use crate::config::GatewayConfig;
use crate::error::HandshakeError;
use crate::registry::{Registry, SessionHandle};
use crate::session::Session;
use crate::store::IdentityResolver;

/// Everything a new connection needs from the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Registry,
    pub resolver: Arc<dyn IdentityResolver>,
    pub config: GatewayConfig,
    pub shutdown: CancellationToken,
}

/// Drives one WebSocket connection from handshake to close.
///
/// The first frame must be an `authenticate` request. A rejected handshake
/// closes with 4003 and never touches the registry. Otherwise the session is
/// registered for its whole lifetime and removed before the close frame goes
/// out.
pub async fn handle_connection<Tx, Rx, E>(mut sender: Tx, mut receiver: Rx, ctx: ConnectionContext)
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (request_id, user) = match authenticate(&mut receiver, &ctx).await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            warn!("WebSocket client failed to authenticate: {}", e);
            let reason = match e.close_code() {
                close_code::NORMAL => "",
                close_code::ERROR => "Internal server error.",
                _ => "Authorization failed.",
            };
            close(&mut sender, e.close_code(), reason, ctx.config.ping_timeout).await;
            return;
        }
    };

    // Register before acknowledging, so a client that has seen the success
    // response is already reachable by fan-out.
    let (handle, notifications) = SessionHandle::new(user);
    ctx.registry.add_session(&handle).await;

    if let Err(e) = acknowledge(&mut sender, request_id, &handle.user, ctx.config.ping_timeout).await {
        warn!("{} ({}) lost during handshake: {}", handle.user.username, handle.user.id, e);
        ctx.registry.remove_session(&handle).await;
        close(&mut sender, close_code::ERROR, "Internal server error.", ctx.config.ping_timeout).await;
        return;
    }

    info!("{} ({}) connected to gateway", handle.user.username, handle.user.id);

    let session = Session::new(
        handle.clone(),
        notifications,
        ctx.registry.clone(),
        ctx.config.clone(),
    );
    let outcome = session.run(&mut sender, receiver, ctx.shutdown.clone()).await;

    ctx.registry.remove_session(&handle).await;

    match outcome {
        Ok(end) => {
            info!(
                "{} ({}) disconnected from gateway: {:?}",
                handle.user.username, handle.user.id, end
            );
            close(&mut sender, close_code::NORMAL, "", ctx.config.ping_timeout).await;
        }
        Err(e) => {
            warn!(
                "{} ({}) dropped from gateway: {}",
                handle.user.username, handle.user.id, e
            );
            close(&mut sender, close_code::ERROR, "Internal server error.", ctx.config.ping_timeout).await;
        }
    }
}

/// Reads the authenticate request and resolves its token. Returns the request
/// id to acknowledge and the authenticated user.
async fn authenticate<Rx, E>(
    receiver: &mut Rx,
    ctx: &ConnectionContext,
) -> Result<(i64, User), HandshakeError>
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let first = tokio::select! {
        _ = ctx.shutdown.cancelled() => return Err(HandshakeError::Closed),
        first = tokio::time::timeout(ctx.config.handshake_timeout, first_text_frame(receiver)) => {
            first.map_err(|_| HandshakeError::Timeout)??
        }
    };

    let request = decode_request(&first).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    if request.method != AUTHENTICATE {
        return Err(HandshakeError::Malformed(format!(
            "expected '{}', got '{}'",
            AUTHENTICATE, request.method
        )));
    }
    let params: AuthenticateParams = serde_json::from_value(request.data)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let resolver = ctx.resolver.clone();
    let user = tokio::task::spawn_blocking(move || resolver.resolve_identity(&params.auth_key))
        .await
        .map_err(|e| HandshakeError::Store(e.into()))?
        .map_err(HandshakeError::Store)?
        .ok_or(HandshakeError::Unauthorized)?;

    Ok((request.id, user))
}

async fn acknowledge<Tx>(
    sender: &mut Tx,
    request_id: i64,
    user: &User,
    deadline: Duration,
) -> anyhow::Result<()>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let result = AuthenticateResult {
        user: UserSummary::from(user),
    };
    let data = serde_json::to_value(&result)?;
    let text = encode(&Envelope::Response(Response::success(request_id, data)))?;
    tokio::time::timeout(deadline, sender.send(Message::Text(text.into())))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out after {:?}", deadline))?
        .map_err(|e| anyhow::anyhow!("write failed: {}", e))
}

/// Waits for the first data frame, skipping control frames.
async fn first_text_frame<Rx, E>(receiver: &mut Rx) -> Result<String, HandshakeError>
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Ok(text.as_str().to_owned()),
            Ok(Message::Binary(_)) => {
                return Err(HandshakeError::Malformed("binary frame".into()));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Err(HandshakeError::Closed),
            Err(e) => return Err(HandshakeError::Transport(e.to_string())),
        }
    }
    Err(HandshakeError::Closed)
}

/// Best-effort close frame, given up on after `deadline`. Called exactly
/// once per connection.
async fn close<Tx>(sender: &mut Tx, code: u16, reason: &'static str, deadline: Duration)
where
    Tx: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = tokio::time::timeout(deadline, async {
        let _ = sender.send(Message::Close(Some(frame))).await;
        let _ = sender.close().await;
    })
    .await;
}
