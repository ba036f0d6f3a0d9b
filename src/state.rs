//! Process-wide setup flag
//!
//! The API reports "setup required" until the first user exists. The flag is
//! loaded once at startup and flipped when the user count crosses zero.

use crate::db::Database;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct SetupState {
    required: Arc<RwLock<bool>>,
}

impl SetupState {
    /// Initialize from the current user count
    pub fn load(db: &Database) -> anyhow::Result<Self> {
        let required = db.count_users()? == 0;
        if required {
            info!("No users yet, setup required");
        }
        Ok(Self {
            required: Arc::new(RwLock::new(required)),
        })
    }

    pub fn is_required(&self) -> bool {
        *self.required.read()
    }

    /// Re-evaluate after users were created or deleted
    pub fn refresh(&self, db: &Database) -> anyhow::Result<bool> {
        let required = db.count_users()? == 0;
        let mut guard = self.required.write();
        if *guard != required {
            info!(setup_required = required, "Setup state changed");
            *guard = required;
        }
        Ok(required)
    }
}
