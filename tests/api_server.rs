//! HTTP and WebSocket surface against a live server on a random port

mod common;

use common::Harness;
use futures::StreamExt;
use mist::api::{ApiServer, ApiState};
use mist::auth::{AuthConfig, AuthManager};
use mist::db::GitHubAppRecord;
use mist::docker::container_name;
use mist::engine::SUCCESS_TRAILER;
use mist::state::SetupState;
use mist::webhooks::WebhookIngest;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

struct Running {
    addr: SocketAddr,
    token: String,
    _shutdown: watch::Sender<bool>,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws_request(&self, path: &str) -> Request {
        let mut request = format!("ws://{}{}", self.addr, path).into_client_request().unwrap();
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {}", self.token).parse().unwrap(),
        );
        request
    }
}

async fn start_api(h: &Harness) -> Running {
    let auth = AuthManager::new(AuthConfig {
        secret: "api-test-secret".to_string(),
        ..AuthConfig::default()
    });
    let token = auth.create_token(h.owner, "owner").unwrap();

    let state = Arc::new(ApiState {
        db: h.db.clone(),
        config: Arc::clone(&h.config),
        layout: h.layout.clone(),
        auth,
        setup: SetupState::load(&h.db).unwrap(),
        intake: Arc::clone(&h.intake),
        queue: Arc::clone(&h.queue),
        webhooks: WebhookIngest::new(h.db.clone(), Arc::clone(&h.intake)),
        driver: h.driver.clone(),
    });

    let server = ApiServer::bind(state, "127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    Running {
        addr,
        token,
        _shutdown: shutdown_tx,
    }
}

/// Text frames until the server closes the stream
async fn collect_text<S>(mut socket: S) -> Vec<String>
where
    S: futures::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut texts = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(text @ Message::Text(_)) => texts.push(text.to_text().unwrap().to_string()),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("stream did not end");
    texts
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {}", other),
    }
}

#[tokio::test]
async fn test_health_and_setup_status() {
    let h = Harness::new(5, 1);
    let api = start_api(&h).await;
    let client = http_client();

    let health: Value = client.get(api.url("/api/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let setup: Value = client
        .get(api.url("/api/auth/setup-status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(setup["data"]["setupRequired"], false);

    let denied = client.get(api.url("/api/deployments?appId=1")).send().await.unwrap();
    assert_eq!(denied.status().as_u16(), 401);
}

#[tokio::test]
async fn test_create_list_and_read_logs() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let api = start_api(&h).await;
    let client = http_client();

    let created = client
        .post(api.url("/api/deployments/create"))
        .bearer_auth(&api.token)
        .json(&json!({ "appId": app.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status().as_u16(), 200);
    let created: Value = created.json().await.unwrap();
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["commitHash"], "abc123");
    let id = created["data"]["id"].as_i64().unwrap();

    h.wait_terminal(id).await;

    let listed: Value = client
        .get(api.url(&format!("/api/deployments?appId={}", app.id)))
        .bearer_auth(&api.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = listed["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "success");
    assert_eq!(rows[0]["isActive"], true);

    let logs: Value = client
        .get(api.url(&format!("/api/deployments/logs?id={}", id)))
        .bearer_auth(&api.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs["data"]["logs"].as_str().unwrap().contains(SUCCESS_TRAILER));

    let missing = client
        .post(api.url("/api/deployments/create"))
        .bearer_auth(&api.token)
        .json(&json!({ "appId": 9999 }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn test_in_progress_logs_and_cancel_over_http() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    h.driver.hold_builds();
    let api = start_api(&h).await;
    let client = http_client();

    let queued = h.intake.deploy_latest(app.id, h.owner).await.unwrap();
    h.wait_until(|| h.driver.builds_started() == 1).await;

    let busy = client
        .get(api.url(&format!("/api/deployments/logs?id={}", queued.id)))
        .bearer_auth(&api.token)
        .send()
        .await
        .unwrap();
    assert_eq!(busy.status().as_u16(), 409);

    let cancelled: Value = client
        .post(api.url("/api/deployments/cancel"))
        .bearer_auth(&api.token)
        .json(&json!({ "deploymentId": queued.id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancelled["data"]["cancelled"], "running");

    let deployment = h.wait_terminal(queued.id).await;
    assert_eq!(deployment.error_message.as_deref(), Some("cancelled"));

    let again = client
        .post(api.url("/api/deployments/cancel"))
        .bearer_auth(&api.token)
        .json(&json!({ "deploymentId": queued.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status().as_u16(), 409);
}

#[tokio::test]
async fn test_webhook_endpoint_checks_signature() {
    let h = Harness::new(5, 1);
    h.create_app("web", "acme/site");
    h.db.save_github_app(&GitHubAppRecord {
        app_id: 1,
        webhook_secret: "whsec".to_string(),
        ..Default::default()
    })
    .unwrap();
    let api = start_api(&h).await;
    let client = http_client();

    let body = json!({
        "ref": "refs/heads/main",
        "after": "ghi789",
        "repository": { "full_name": "acme/site" }
    })
    .to_string();

    let rejected = client
        .post(api.url("/api/github/webhook"))
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", "sha256=00")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status().as_u16(), 401);

    let signature = mist::webhooks::sign("whsec", body.as_bytes()).unwrap();
    let accepted: Value = client
        .post(api.url("/api/github/webhook"))
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted["success"], true);
    assert!(accepted["message"].as_str().unwrap().contains("queued"));

    let missing_event = client
        .post(api.url("/api/github/webhook"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(missing_event.status().as_u16(), 400);
}

#[tokio::test]
async fn test_two_build_log_sockets_follow_until_success() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let build_lines = ["#1 load build definition", "#2 npm ci", "#3 npm run build"];
    h.driver.build_output(&build_lines, Duration::from_millis(50));
    h.driver.hold_builds();
    let api = start_api(&h).await;

    let queued = h.intake.deploy_latest(app.id, h.owner).await.unwrap();
    h.wait_until(|| h.driver.builds_started() == 1).await;

    let path = format!("/api/ws/logs?id={}", queued.id);
    let (first, _) = tokio_tungstenite::connect_async(api.ws_request(&path)).await.unwrap();
    let (second, _) = tokio_tungstenite::connect_async(api.ws_request(&path)).await.unwrap();

    h.driver.release_builds();
    let (a, b) = tokio::join!(collect_text(first), collect_text(second));

    assert_eq!(a, b);
    let positions: Vec<usize> = build_lines
        .iter()
        .map(|l| a.iter().position(|x| x == l).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(a.last().map(String::as_str), Some(SUCCESS_TRAILER));
}

#[tokio::test]
async fn test_build_log_socket_rejections() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let queued = h.intake.deploy_latest(app.id, h.owner).await.unwrap();
    h.wait_terminal(queued.id).await;
    let api = start_api(&h).await;

    let err = tokio_tungstenite::connect_async(api.ws_request("/api/ws/logs?id=424242"))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 404);

    let anonymous = format!("ws://{}/api/ws/logs?id={}", api.addr, queued.id);
    let err = tokio_tungstenite::connect_async(anonymous).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    let mut foreign = api.ws_request(&format!("/api/ws/logs?id={}", queued.id));
    foreign
        .headers_mut()
        .insert(ORIGIN, "https://evil.example.com".parse().unwrap());
    let err = tokio_tungstenite::connect_async(foreign).await.unwrap_err();
    assert_eq!(http_status(err), 403);

    // A finished deployment replays its log and closes
    let (socket, _) = tokio_tungstenite::connect_async(api.ws_request(&format!("/api/ws/logs?id={}", queued.id)))
        .await
        .unwrap();
    let lines = collect_text(socket).await;
    assert_eq!(lines.last().map(String::as_str), Some(SUCCESS_TRAILER));
}

#[tokio::test]
async fn test_container_log_and_stats_frames() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let api = start_api(&h).await;

    let path = format!("/api/ws/container-logs?appId={}", app.id);
    let (socket, _) = tokio_tungstenite::connect_async(api.ws_request(&path)).await.unwrap();
    let frames: Vec<Value> = collect_text(socket)
        .await
        .iter()
        .map(|t| serde_json::from_str(t).unwrap())
        .collect();
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["error", "end"]);

    h.driver.seed_running(&container_name(app.id), "abc123");

    let (socket, _) = tokio_tungstenite::connect_async(api.ws_request(&path)).await.unwrap();
    let frames: Vec<Value> = collect_text(socket)
        .await
        .iter()
        .map(|t| serde_json::from_str(t).unwrap())
        .collect();
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["status", "log", "end"]);
    assert_eq!(frames[0]["data"]["state"], "running");
    assert_eq!(frames[1]["data"]["line"], "listening on :3000");

    let path = format!("/api/ws/container-stats?appId={}", app.id);
    let (socket, _) = tokio_tungstenite::connect_async(api.ws_request(&path)).await.unwrap();
    let frames: Vec<Value> = collect_text(socket)
        .await
        .iter()
        .map(|t| serde_json::from_str(t).unwrap())
        .collect();
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["status", "stats", "end"]);
    assert_eq!(frames[1]["data"]["cpuPercent"], 12.5);
}
