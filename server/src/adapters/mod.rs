use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::application::{AppState, Applied, Joined};
use crate::domain::{ChannelId, ConnectionId};
use crate::infrastructure::gateway::Received;
use crate::infrastructure::RegistryError;

pub const CHANNEL_COOKIE: &str = "channelId";
const COOKIE_MAX_AGE_DAYS: i64 = 30;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct ChannelQuery {
    #[serde(rename = "channelId")]
    pub channel_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(bootstrap))
        .fallback(not_found)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true),
        )
        .layer(TraceLayer::new_for_http())
}

fn channel_cookie(channel: &ChannelId) -> Cookie<'static> {
    Cookie::build((CHANNEL_COOKIE, channel.to_string()))
        .path("/")
        .max_age(time::Duration::days(COOKIE_MAX_AGE_DAYS))
        .same_site(SameSite::Lax)
        .http_only(false)
        .secure(false)
        .build()
}

fn rejected(e: RegistryError) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

/// Upgrades to the channel protocol, or returns the document as JSON.
#[instrument(skip_all, fields(channel))]
pub async fn bootstrap(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<ChannelQuery>,
    jar: CookieJar,
    State(state): State<AppState>,
) -> Response {
    let channel = ChannelId::from_query(query.channel_id.as_deref());
    tracing::Span::current().record("channel", tracing::field::display(&channel));

    let document = match state.open_channel(&channel).await {
        Ok(channel_state) => channel_state,
        Err(e) => return rejected(e),
    };
    let jar = jar.add(channel_cookie(&channel));

    match ws {
        Ok(ws) => {
            let connection = ConnectionId::new();
            let upgrade = ws.on_upgrade(move |socket| handle_socket(socket, channel, connection, state));
            (jar, upgrade).into_response()
        }
        Err(_) => (jar, Json(document.get_all())).into_response(),
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "try /")
}

fn handle_inbound(state: &AppState, channel: &ChannelId, connection: ConnectionId, raw: &str) {
    match state.apply_message(channel, connection, raw) {
        Ok(Applied::Broadcast { receivers }) => debug!(receivers, "write applied"),
        Ok(Applied::Dropped) => {}
        Err(e) => warn!(error = %e, payload_len = raw.len(), "dropping malformed message"),
    }
}

#[instrument(skip_all, fields(channel = %channel, connection = %connection))]
async fn handle_socket(socket: WebSocket, channel: ChannelId, connection: ConnectionId, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Joined {
        snapshot,
        mut subscription,
    } = match state.join(&channel, connection).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(error = %e, "join rejected");
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static("channel capacity reached"),
            };
            let _ = ws_tx.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    info!("connection opened");

    if ws_tx.send(Message::Text(snapshot.into())).await.is_err() {
        error!("failed to send join snapshot");
        state.leave(subscription);
        return;
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(txt))) => {
                        handle_inbound(&state, &channel, connection, txt.as_str());
                    }
                    Some(Ok(Message::Binary(bin))) => match std::str::from_utf8(bin.as_ref()) {
                        Ok(txt) => handle_inbound(&state, &channel, connection, txt),
                        Err(_) => warn!(bytes = bin.len(), "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Ping(p))) => {
                        let _ = ws_tx.send(Message::Pong(p)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "connection error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
            frame = subscription.recv() => {
                let outbound = match frame {
                    Some(Received::Frame(payload)) => Some(payload.to_string()),
                    Some(Received::Resync) => state.resync(&channel, &mut subscription),
                    None => break,
                };
                if let Some(text) = outbound {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        error!("broadcast send failed");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    error!("ping failed");
                    break;
                }
            }
        }
    }

    state.leave(subscription);
}
