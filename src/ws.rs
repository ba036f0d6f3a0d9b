//! WebSocket plumbing for log and stats streams
//!
//! Connections are upgraded in place on the hyper server. Once upgraded, a
//! stream is driven by [`pump`], which forwards outgoing messages, pings the
//! client every 30 seconds and stops at the first failed write.

use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type ApiBody = BoxBody<Bytes, hyper::Error>;

/// Server side of an upgraded connection
pub type ServerSocket = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_token = |name, token: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    };
    has_token(CONNECTION, "upgrade") && has_token(UPGRADE, "websocket")
}

/// Whether the request's Origin may open a socket
///
/// A missing Origin (non-browser client) is accepted. Otherwise the origin
/// must be the request's own scheme and host, or appear in the comma
/// separated allow-list.
pub fn origin_allowed(headers: &HeaderMap, allowed_origins: &str) -> bool {
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let origin = origin.trim().trim_end_matches('/');

    if let Some(host) = headers.get(HOST).and_then(|v| v.to_str().ok()) {
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_else(|| "http".to_string());
        if origin.eq_ignore_ascii_case(&format!("{}://{}", proto, host.trim())) {
            return true;
        }
    }

    allowed_origins
        .split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .any(|o| o.eq_ignore_ascii_case(origin))
}

/// Answer the handshake and hand the upgraded socket to `handler`
pub fn upgrade<F, Fut>(mut req: Request<Incoming>, handler: F) -> Response<ApiBody>
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|k| derive_accept_key(k.as_bytes()));
    let Some(accept) = key else {
        return crate::error::json_error_response(
            crate::error::ErrorCode::ValidationError,
            "missing Sec-WebSocket-Key",
        );
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let socket =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                handler(socket).await;
            }
            Err(e) => warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut response = Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, hyper::header::HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, hyper::header::HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_VERSION, hyper::header::HeaderValue::from_static("13"));
    if let Ok(value) = hyper::header::HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

/// Forward `outgoing` to the client until it ends, the client leaves, a
/// write fails or `cancel` fires; `cancel` is triggered on the way out so the
/// producer stops too
pub async fn pump(socket: ServerSocket, mut outgoing: mpsc::Receiver<Message>, cancel: CancellationToken) {
    pump_with_interval(socket, &mut outgoing, &cancel, PING_INTERVAL).await;
    cancel.cancel();
}

async fn pump_with_interval(
    socket: ServerSocket,
    outgoing: &mut mpsc::Receiver<Message>,
    cancel: &CancellationToken,
    ping_every: Duration,
) {
    let (mut sink, mut incoming) = socket.split();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    debug!(error = %e, "WebSocket ping failed");
                    return;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.close().await;
}

/// `{type, timestamp, data}` envelope used by container streams
#[derive(Debug, Serialize)]
pub struct Frame<T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub data: T,
}

impl<T: Serialize> Frame<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Self {
            kind,
            timestamp: crate::db::now_timestamp(),
            data,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::text(serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"{}","timestamp":"{}","data":null}}"#, self.kind, self.timestamp)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_origin_matches_host() {
        assert!(origin_allowed(&headers(&[("host", "mist.example.com")]), ""));
        assert!(origin_allowed(
            &headers(&[("host", "mist.example.com"), ("origin", "http://mist.example.com")]),
            ""
        ));
        assert!(origin_allowed(
            &headers(&[
                ("host", "mist.example.com"),
                ("origin", "https://mist.example.com"),
                ("x-forwarded-proto", "https"),
            ]),
            ""
        ));
        // Scheme must match the request's
        assert!(!origin_allowed(
            &headers(&[("host", "mist.example.com"), ("origin", "https://mist.example.com")]),
            ""
        ));
        assert!(!origin_allowed(
            &headers(&[("host", "mist.example.com"), ("origin", "http://evil.example.com")]),
            ""
        ));
    }

    #[test]
    fn test_origin_allow_list() {
        let h = headers(&[("host", "10.0.0.5:8080"), ("origin", "http://localhost:5173")]);
        assert!(!origin_allowed(&h, ""));
        assert!(origin_allowed(&h, "https://mist.example.com, http://localhost:5173/"));
        assert!(!origin_allowed(&h, "http://localhost:3000"));
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header(CONNECTION, "keep-alive").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_frame_json() {
        #[derive(Serialize)]
        struct Line {
            line: String,
        }
        let frame = Frame::new(
            "log",
            Line {
                line: "listening on :3000".to_string(),
            },
        );
        let text = frame.to_message().into_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["data"]["line"], "listening on :3000");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
