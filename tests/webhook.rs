//! Push webhooks turned into deployments

mod common;

use common::Harness;
use mist::db::GitHubAppRecord;
use mist::webhooks::{sign, WebhookError, WebhookIngest, WebhookOutcome};
use serde_json::json;
use std::sync::Arc;

const SECRET: &str = "whsec_test";

fn push_body(repository: &str, git_ref: &str, after: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": git_ref,
        "before": "def456",
        "after": after,
        "repository": { "full_name": repository },
        "pusher": { "name": "octocat" },
        "head_commit": {
            "id": after,
            "message": "Update landing page",
            "author": { "name": "Mona" }
        }
    }))
    .unwrap()
}

fn ingest(h: &Harness, secret: Option<&str>) -> WebhookIngest {
    if let Some(secret) = secret {
        h.db.save_github_app(&GitHubAppRecord {
            app_id: 1,
            webhook_secret: secret.to_string(),
            name: "mist".to_string(),
            ..Default::default()
        })
        .unwrap();
    }
    WebhookIngest::new(h.db.clone(), Arc::clone(&h.intake))
}

#[tokio::test]
async fn test_push_creates_one_webhook_deployment() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let webhooks = ingest(&h, Some(SECRET));

    let body = push_body("acme/site", "refs/heads/main", "ghi789");
    let signature = sign(SECRET, &body).unwrap();
    let outcome = webhooks.handle(Some("push"), Some(&signature), &body).unwrap();

    let WebhookOutcome::Deployed { deployment_id, app_id } = outcome else {
        panic!("expected a deployment, got {:?}", outcome);
    };
    assert_eq!(app_id, app.id);

    let deployments = h.db.list_deployments(app.id, 10).unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].id, deployment_id);
    assert_eq!(deployments[0].commit_hash, "ghi789");
    assert_eq!(deployments[0].triggered_by, None);
    assert_eq!(deployments[0].commit_message.as_deref(), Some("Update landing page"));
    assert_eq!(deployments[0].commit_author.as_deref(), Some("Mona"));

    let audit = h.db.list_audit_logs(10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].trigger_type.as_str(), "webhook");
    assert_eq!(audit[0].action, "create");
    assert_eq!(audit[0].resource_type, "deployment");
    assert_eq!(audit[0].user_id, None);
    assert_eq!(audit[0].details["repository"], "acme/site");
    assert_eq!(audit[0].details["branch"], "main");
    assert_eq!(audit[0].details["pusher"], "octocat");

    let deployment = h.wait_terminal(deployment_id).await;
    assert_eq!(deployment.status, "success");
    assert_eq!(deployment.image_tag.as_deref(), Some("ghi789"));
}

#[tokio::test]
async fn test_bad_or_missing_signature_is_rejected() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let webhooks = ingest(&h, Some(SECRET));
    let body = push_body("acme/site", "refs/heads/main", "ghi789");

    let forged = sign("not-the-secret", &body).unwrap();
    assert!(matches!(
        webhooks.handle(Some("push"), Some(&forged), &body),
        Err(WebhookError::InvalidSignature)
    ));
    assert!(matches!(
        webhooks.handle(Some("push"), None, &body),
        Err(WebhookError::InvalidSignature)
    ));

    assert!(h.db.list_deployments(app.id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_unsigned_delivery_accepted_without_secret() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let webhooks = ingest(&h, None);

    let body = push_body("acme/site", "refs/heads/main", "ghi789");
    let outcome = webhooks.handle(Some("push"), None, &body).unwrap();
    assert!(matches!(outcome, WebhookOutcome::Deployed { .. }));
    assert_eq!(h.db.list_deployments(app.id, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_non_deploying_deliveries() {
    let h = Harness::new(5, 1);
    let app = h.create_app("web", "acme/site");
    let webhooks = ingest(&h, Some(SECRET));
    let signed = |body: &[u8]| sign(SECRET, body).unwrap();

    let ping = br#"{"zen":"Design for failure."}"#;
    assert_eq!(
        webhooks.handle(Some("ping"), Some(&signed(ping)), ping).unwrap(),
        WebhookOutcome::Pong
    );

    let issues = br#"{"action":"opened"}"#;
    assert!(matches!(
        webhooks.handle(Some("issues"), Some(&signed(issues)), issues).unwrap(),
        WebhookOutcome::Ignored(_)
    ));

    let other_branch = push_body("acme/site", "refs/heads/feature", "ghi789");
    assert_eq!(
        webhooks
            .handle(Some("push"), Some(&signed(&other_branch)), &other_branch)
            .unwrap(),
        WebhookOutcome::NoMatchingApplication
    );

    let deletion = push_body("acme/site", "refs/heads/main", "0000000000000000000000000000000000000000");
    assert!(matches!(
        webhooks.handle(Some("push"), Some(&signed(&deletion)), &deletion).unwrap(),
        WebhookOutcome::Ignored(_)
    ));

    let garbage = b"not json";
    assert!(matches!(
        webhooks.handle(Some("push"), Some(&signed(garbage)), garbage),
        Err(WebhookError::Malformed(_))
    ));

    assert!(matches!(
        webhooks.handle(None, None, ping),
        Err(WebhookError::MissingEvent)
    ));

    assert!(h.db.list_deployments(app.id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_strategy_ignores_pushes() {
    let h = Harness::new(5, 1);
    let mut app = mist::db::ApplicationRecord::new(h.project, h.owner, "api");
    app.git_repository = Some("acme/api".to_string());
    app.deployment_strategy = "manual".to_string();
    let app_id = h.db.create_application(&app).unwrap();
    let webhooks = ingest(&h, None);

    let body = push_body("acme/api", "refs/heads/main", "ghi789");
    assert_eq!(
        webhooks.handle(Some("push"), None, &body).unwrap(),
        WebhookOutcome::Ignored("application deploys manually".to_string())
    );
    assert!(h.db.list_deployments(app_id, 10).unwrap().is_empty());
}
