//! Traefik integration
//!
//! Traefik is not managed here. It discovers application containers through
//! the labels produced by [`container_labels`] and reads one file provider
//! fragment, `<root>/traefik/dynamic.yml`, which routes the dashboard's own
//! hostname back to this process.

use crate::config::{Config, DataLayout};
use crate::db::Database;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// Entry point every application router listens on
pub const ENTRYPOINT: &str = "web";

/// Name of the generated dashboard router and service
pub const DASHBOARD_ROUTER: &str = "mist-dashboard";

const DYNAMIC_FILE: &str = "dynamic.yml";

/// `apps.example.com` from `*.apps.example.com`, `.apps.example.com` or itself
pub fn wildcard_base(wildcard: &str) -> &str {
    let trimmed = wildcard.trim();
    trimmed
        .strip_prefix("*.")
        .or_else(|| trimmed.strip_prefix('.'))
        .unwrap_or(trimmed)
}

fn hostname_label(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Hostname synthesized for an application without domains
pub fn wildcard_app_domain(project_name: &str, app_name: &str, wildcard: &str) -> Option<String> {
    let base = wildcard_base(wildcard);
    if base.is_empty() {
        return None;
    }
    Some(format!(
        "{}-{}.{}",
        hostname_label(project_name),
        hostname_label(app_name),
        base
    ))
}

/// `Host(`a`) || Host(`b`)` for the given domains
pub fn host_rule(domains: &[String]) -> String {
    domains
        .iter()
        .map(|d| format!("Host(`{}`)", d))
        .collect::<Vec<_>>()
        .join(" || ")
}

/// Labels attached to an application container at run time
///
/// `name` is both the router and the service name. Without domains the
/// container is explicitly excluded from routing.
pub fn container_labels(name: &str, app_id: i64, domains: &[String], port: u16) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("mist.managed".to_string(), "true".to_string());
    labels.insert("mist.app_id".to_string(), app_id.to_string());

    if domains.is_empty() {
        labels.insert("traefik.enable".to_string(), "false".to_string());
        return labels;
    }

    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        format!("traefik.http.routers.{}.rule", name),
        host_rule(domains),
    );
    labels.insert(
        format!("traefik.http.routers.{}.entrypoints", name),
        ENTRYPOINT.to_string(),
    );
    labels.insert(
        format!("traefik.http.routers.{}.service", name),
        name.to_string(),
    );
    labels.insert(
        format!("traefik.http.services.{}.loadbalancer.server.port", name),
        port.to_string(),
    );
    labels
}

#[derive(Debug, Serialize)]
struct DynamicConfig {
    http: HttpSection,
}

#[derive(Debug, Serialize)]
struct HttpSection {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Router {
    rule: String,
    entry_points: Vec<String>,
    service: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Service {
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize)]
struct Server {
    url: String,
}

/// Render the dashboard route fragment
pub fn render_dashboard_route(wildcard: &str, mist_app_name: &str, api_port: u16) -> anyhow::Result<String> {
    let host = format!("{}.{}", mist_app_name.trim(), wildcard_base(wildcard));
    let mut routers = BTreeMap::new();
    routers.insert(
        DASHBOARD_ROUTER.to_string(),
        Router {
            rule: host_rule(&[host]),
            entry_points: vec![ENTRYPOINT.to_string()],
            service: DASHBOARD_ROUTER.to_string(),
        },
    );
    let mut services = BTreeMap::new();
    services.insert(
        DASHBOARD_ROUTER.to_string(),
        Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://host.docker.internal:{}", api_port),
                }],
            },
        },
    );

    Ok(serde_yaml::to_string(&DynamicConfig {
        http: HttpSection { routers, services },
    })?)
}

/// Write or remove `<dir>/dynamic.yml`; returns true if a file was written
pub fn write_dashboard_route(
    traefik_dir: &Path,
    wildcard: &str,
    mist_app_name: &str,
    api_port: u16,
) -> anyhow::Result<bool> {
    let path = traefik_dir.join(DYNAMIC_FILE);

    if wildcard_base(wildcard).is_empty() || mist_app_name.trim().is_empty() {
        match std::fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "Removed dashboard route"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(false);
    }

    let content = render_dashboard_route(wildcard, mist_app_name, api_port)?;
    if std::fs::read_to_string(&path).ok().as_deref() == Some(content.as_str()) {
        debug!(path = %path.display(), "Dashboard route unchanged");
        return Ok(true);
    }

    std::fs::create_dir_all(traefik_dir)?;
    let tmp = traefik_dir.join(format!(".{}.tmp", DYNAMIC_FILE));
    std::fs::write(&tmp, &content)?;
    std::fs::rename(&tmp, &path)?;
    info!(path = %path.display(), "Wrote dashboard route");
    Ok(true)
}

/// Regenerate the dashboard route from current settings
///
/// System settings win; the config file's network section is the fallback.
pub fn sync_dashboard_route(db: &Database, layout: &DataLayout, config: &Config) -> anyhow::Result<bool> {
    let settings = db.get_system_settings()?;
    let wildcard = if settings.wildcard_domain.is_empty() {
        config.network.wildcard_domain.clone()
    } else {
        settings.wildcard_domain
    };
    let app_name = if settings.mist_app_name.is_empty() {
        config.network.mist_app_name.clone()
    } else {
        settings.mist_app_name
    };
    write_dashboard_route(&layout.traefik_dir(), &wildcard, &app_name, config.server.port)
}
