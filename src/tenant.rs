use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;
use crate::stats::{self, StatsRegistry};

#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub stats: Arc<StatsRegistry>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL,
/// no-show sweeper, compactor and stats dispatcher.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
    qr_base_url: String,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, qr_base_url: String) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            qr_base_url,
        }
    }

    /// Get or lazily create the tenant for the given database name.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Tenant> {
        if let Some(existing) = self.tenants.get(tenant) {
            return Ok(existing.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let firehose = notify.subscribe_all();
        let engine = Arc::new(Engine::new(wal_path, notify, self.qr_base_url.clone())?);
        let registry = Arc::new(StatsRegistry::new());

        // Spawn the per-tenant background tasks
        let sweeper_engine = engine.clone();
        tokio::spawn(async move {
            reaper::run_no_show_sweeper(sweeper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });
        let stats_engine = engine.clone();
        let stats_registry = registry.clone();
        tokio::spawn(async move {
            stats::run_dispatcher(stats_engine, stats_registry, firehose).await;
        });

        let tenant_handle = Tenant {
            engine,
            stats: registry,
        };
        self.tenants.insert(tenant.to_string(), tenant_handle.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant_handle)
    }
}
