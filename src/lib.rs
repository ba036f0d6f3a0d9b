//! Mist - deployment core for a self-hosted Git-to-container platform
//!
//! This library turns a request to deploy an application into a running
//! container:
//! - Accepts deployments from users and GitHub push webhooks
//! - Serializes them through a bounded queue worked by background tasks
//! - Clones the repository, builds an image and replaces the app's container
//! - Records every stage and streams build logs to WebSocket subscribers
//! - Labels containers so Traefik routes the app's domains to them

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod docker;
pub mod engine;
pub mod error;
pub mod exec;
pub mod git;
pub mod github;
pub mod intake;
pub mod logs;
pub mod queue;
pub mod state;
pub mod traefik;
pub mod webhooks;
pub mod ws;
