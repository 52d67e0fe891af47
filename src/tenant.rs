use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::engine::{Collaborators, Engine};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-tenant engines. Each tenant gets its own Engine, WAL, reaper and
/// compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
    reaper_interval: Duration,
}

struct Tenant {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
}

fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    // Only characters that are safe in a file name survive.
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, reaper_interval: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            reaper_interval,
        }
    }

    /// Get or lazily create the engine for a tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(t) = self.engines.get(tenant) {
            return Ok(t.engine.clone());
        }
        let safe_name = sanitize(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Entry lock: two first connections to the same database must not
        // open the WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().engine.clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let hub = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, Collaborators::with_hub(hub.clone()))?);

                tokio::spawn(reaper::run_reaper(engine.clone(), self.reaper_interval));
                tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

                slot.insert(Tenant {
                    engine: engine.clone(),
                    hub,
                });
                engine
            }
        };

        info!(tenant = %safe_name, "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Notification hub of a loaded tenant.
    pub fn notifications(&self, tenant: &str) -> Option<Arc<NotifyHub>> {
        self.engines.get(tenant).map(|t| t.hub.clone())
    }
}
