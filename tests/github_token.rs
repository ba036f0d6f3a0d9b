//! Installation token refresh against a stand-in GitHub API

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mist::config::{Config, SharedConfig};
use mist::db::{Database, GitHubAppRecord, GitHubInstallationRecord};
use mist::github::{GitHubClient, TokenCache};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

const TEST_KEY: &str = include_str!("fixtures/github_app_key.pem");
const INSTALLATION: i64 = 77;
const USER: i64 = 5;

#[derive(Default)]
struct MockGitHub {
    refreshes: AtomicUsize,
    commit_auth: Mutex<Vec<String>>,
}

async fn serve(mock: Arc<MockGitHub>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (status, body) = match (req.method().clone(), path.as_str()) {
        (Method::POST, p) if p == format!("/app/installations/{}/access_tokens", INSTALLATION) => {
            let n = mock.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            let expires_at = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
            (
                StatusCode::CREATED,
                json!({ "token": format!("ghs_refreshed_{}", n), "expires_at": expires_at }),
            )
        }
        (Method::GET, "/repos/acme/site/commits/main") => {
            mock.commit_auth.lock().push(auth);
            (
                StatusCode::OK,
                json!({
                    "sha": "abc123",
                    "html_url": "https://github.com/acme/site/commit/abc123",
                    "commit": { "message": "Initial commit", "author": { "name": "Mona" } }
                }),
            )
        }
        _ => (StatusCode::NOT_FOUND, json!({ "message": "Not Found" })),
    };

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    Ok(response)
}

async fn start_mock() -> (SocketAddr, Arc<MockGitHub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mock = Arc::new(MockGitHub::default());
    let shared = Arc::clone(&mock);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let mock = Arc::clone(&shared);
            tokio::spawn(async move {
                let service = service_fn(move |req| serve(Arc::clone(&mock), req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, mock)
}

fn store_with_expiring_token(expires_in: ChronoDuration) -> (Database, String) {
    let db = Database::open_in_memory().unwrap();
    db.save_github_app(&GitHubAppRecord {
        app_id: 4242,
        private_key_pem: TEST_KEY.to_string(),
        webhook_secret: "whsec".to_string(),
        name: "mist".to_string(),
        ..Default::default()
    })
    .unwrap();
    let expires_at = (Utc::now() + expires_in).to_rfc3339_opts(SecondsFormat::Secs, true);
    db.save_github_installation(&GitHubInstallationRecord {
        installation_id: INSTALLATION,
        user_id: USER,
        account_login: "acme".to_string(),
        account_type: "Organization".to_string(),
        access_token: Some("ghs_old".to_string()),
        token_expires_at: Some(expires_at.clone()),
    })
    .unwrap();
    (db, expires_at)
}

fn config_for(addr: SocketAddr) -> SharedConfig {
    let mut config = Config::default();
    config.github.api_base_url = format!("http://{}", addr);
    Arc::new(RwLock::new(config))
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_once() {
    let (addr, mock) = start_mock().await;
    let (db, old_expiry) = store_with_expiring_token(ChronoDuration::minutes(4));
    let config = config_for(addr);
    let client = GitHubClient::new(db.clone(), Arc::clone(&config), Arc::new(TokenCache::new())).unwrap();

    let token = client.installation_token(USER).await.unwrap().unwrap();
    assert_eq!(token, "ghs_refreshed_1");
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);

    let row = db.get_installation_by_user(USER).unwrap().unwrap();
    assert_eq!(row.access_token.as_deref(), Some("ghs_refreshed_1"));
    assert_ne!(row.token_expires_at.as_deref(), Some(old_expiry.as_str()));

    let commit = client
        .latest_commit("acme/site", "main", Some(&token))
        .await
        .unwrap();
    assert_eq!(commit.sha, "abc123");
    assert_eq!(commit.author_name, "Mona");
    assert_eq!(mock.commit_auth.lock().clone(), vec!["Bearer ghs_refreshed_1".to_string()]);

    // Still fresh: served from the cache
    let again = client.installation_token(USER).await.unwrap().unwrap();
    assert_eq!(again, token);
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);

    // A new process reads the stored token instead of refreshing
    let restarted = GitHubClient::new(db, config, Arc::new(TokenCache::new())).unwrap();
    assert_eq!(restarted.installation_token(USER).await.unwrap().unwrap(), token);
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let (addr, mock) = start_mock().await;
    let (db, _) = store_with_expiring_token(ChronoDuration::minutes(-10));
    let client = Arc::new(GitHubClient::new(db, config_for(addr), Arc::new(TokenCache::new())).unwrap());

    let calls: Vec<_> = (0..4)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.installation_token(USER).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().as_deref(), Some("ghs_refreshed_1"));
    }
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_branch_is_an_api_error() {
    let (addr, _mock) = start_mock().await;
    let db = Database::open_in_memory().unwrap();
    let client = GitHubClient::new(db, config_for(addr), Arc::new(TokenCache::new())).unwrap();

    let err = client.latest_commit("acme/site", "nope", None).await.unwrap_err();
    assert_eq!(err.kind, mist::error::GitErrorKind::Api);
    assert_eq!(err.status, Some(404));
}
