//! WebSocket connection handler
//!
//! Handles one client connection end to end: the upgrade handshake with
//! identity extraction from the connect URL, registration with the hub,
//! and the two pump tasks. The reader parses and stamps inbound frames;
//! the writer drains the outbound queue and emits keepalive pings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::client::{room_cell, ClientHandle, Registration, RoomCell};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::hub::HubEvent;
use crate::message::{Envelope, MessageType};
use crate::types::ConnectionId;

/// Time allowed for the hub to accept a registration before the
/// connection is abandoned.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity extracted from the connect URL's query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Authenticated username (`username` query parameter)
    pub username: String,
    /// Room to join on connect (`roomID` query parameter), if any
    pub initial_room: Option<String>,
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake (rejecting connects without a
/// username), registers the connection with the hub, then runs the
/// reader and writer tasks until either exits and finally posts the
/// unregister event.
pub async fn handle_connection(
    stream: TcpStream,
    events: mpsc::Sender<HubEvent>,
    config: Arc<ServerConfig>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_bytes);
    ws_config.max_frame_size = Some(config.max_frame_bytes);

    // The handshake callback is the seam where an external
    // authenticator would hand over the identity; here it is read
    // straight from the query string.
    let mut params: Option<ConnectParams> = None;
    let callback = |request: &Request, response: Response| match parse_connect_params(
        request.uri().query(),
    ) {
        Some(parsed) => {
            params = Some(parsed);
            Ok(response)
        }
        None => Err(reject_handshake("Query parameter 'username' is required.")),
    };

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let params = params.ok_or_else(|| {
        AppError::Handshake("connect URL carried no usable identity".to_string())
    })?;

    let id = ConnectionId::new();
    info!(
        "Client '{}' connected from {} (room: {:?})",
        params.username, peer_addr, params.initial_room
    );

    // Outbound queue: hub produces, the writer task consumes. The hub
    // closing this queue is the writer's only shutdown signal.
    let (msg_tx, msg_rx) = mpsc::channel::<Envelope>(config.outbound_queue);
    let room = room_cell(params.initial_room.clone());
    let handle = ClientHandle::new(id, params.username.clone(), msg_tx, room.clone());

    let registration = Registration {
        handle,
        initial_room: params.initial_room.clone(),
    };
    if events
        .send_timeout(HubEvent::Register(registration), REGISTER_TIMEOUT)
        .await
        .is_err()
    {
        error!(
            "Failed to register client '{}' - hub busy or gone",
            params.username
        );
        return Err(AppError::RegistrationTimeout);
    }

    let (ws_sender, ws_receiver) = ws_stream.split();

    let read_task = tokio::spawn(read_pump(
        ws_receiver,
        events.clone(),
        params.username.clone(),
        room,
        config.clone(),
    ));
    let write_task = tokio::spawn(write_pump(ws_sender, msg_rx, config));

    // Whichever pump exits first, the connection is done; the hub will
    // close the outbound queue during unregistration, which stops the
    // other pump.
    tokio::select! {
        _ = read_task => {
            debug!("Read pump completed for '{}'", params.username);
        }
        _ = write_task => {
            debug!("Write pump completed for '{}'", params.username);
        }
    }

    let _ = events.send(HubEvent::Unregister(id)).await;
    info!("Client '{}' disconnected", params.username);

    Ok(())
}

/// Pump inbound frames into the hub
///
/// Applies the read deadline, parses each text frame as a wire
/// envelope, stamps it with the authenticated identity, and forwards it
/// without blocking. Exits on any read error, close frame, or deadline.
async fn read_pump(
    mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
    events: mpsc::Sender<HubEvent>,
    username: String,
    room: RoomCell,
    config: Arc<ServerConfig>,
) {
    loop {
        // Any inbound frame (pongs included) resets the deadline.
        let frame = match timeout(config.pong_wait, ws_receiver.next()).await {
            Err(_) => {
                warn!("Read deadline exceeded for '{}'", username);
                break;
            }
            Ok(None) => {
                debug!("Connection stream ended for '{}'", username);
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("Read error for '{}': {}", username, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let mut msg: Envelope = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Invalid JSON from '{}': {}", username, e);
                        continue;
                    }
                };

                prepare_inbound(&mut msg, &username, Utc::now(), current_room(&room));

                match events.try_send(HubEvent::Inbound(msg)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Hub inbound queue full; dropping frame from '{}'", username);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Hub gone; ending read pump for '{}'", username);
                        break;
                    }
                }
            }
            Message::Close(_) => {
                debug!("Client '{}' sent close frame", username);
                break;
            }
            // Pongs answer our keepalive; pings are answered by the
            // protocol layer.
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }
}

/// Pump outbound messages to the peer
///
/// Serialises each queued envelope as a JSON text frame under the write
/// deadline and sends a keepalive ping between frames. Queue closure
/// sends a close frame and exits.
async fn write_pump(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Envelope>,
    config: Arc<ServerConfig>,
) {
    let period = config.ping_period();
    let mut keepalive = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(msg) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize outbound message: {}", e);
                            continue;
                        }
                    };
                    match timeout(config.write_wait, ws_sender.send(Message::Text(json))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("Write failed, ending write pump: {}", e);
                            break;
                        }
                        Err(_) => {
                            warn!("Write deadline exceeded, ending write pump");
                            break;
                        }
                    }
                }
                None => {
                    // The hub closed the queue: orderly shutdown.
                    let _ = timeout(config.write_wait, ws_sender.close()).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                match timeout(config.write_wait, ws_sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!("Keepalive ping failed, ending write pump");
                        break;
                    }
                }
            }
        }
    }
}

/// Stamp an inbound envelope with server-authoritative fields
///
/// The username and timestamp are always overwritten, so a client
/// cannot speak as someone else. Types that implicitly target the
/// current room get their room id filled in; join requests carry their
/// target in the payload and are left alone.
fn prepare_inbound(
    msg: &mut Envelope,
    username: &str,
    now: DateTime<Utc>,
    current_room: Option<String>,
) {
    msg.username = Some(username.to_string());
    msg.timestamp = Some(now);

    let room_missing = msg.room_id.as_deref().map_or(true, str::is_empty);
    if room_missing
        && matches!(
            msg.kind,
            MessageType::TextMessage | MessageType::UserTyping | MessageType::RequestRoomStats
        )
    {
        msg.room_id = current_room.filter(|room| !room.is_empty());
    }
}

fn current_room(cell: &RoomCell) -> Option<String> {
    cell.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn reject_handshake(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Extract the connect identity from a query string
///
/// Returns `None` when the username is missing or empty; the initial
/// room is optional.
fn parse_connect_params(query: Option<&str>) -> Option<ConnectParams> {
    let query = query?;
    let username = query_param(query, "username").filter(|name| !name.is_empty())?;
    let initial_room = query_param(query, "roomID").filter(|room| !room.is_empty());
    Some(ConnectParams {
        username,
        initial_room,
    })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| percent_decode(value))
    })
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
