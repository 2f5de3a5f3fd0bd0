//! Per-tenant database pools.
//!
//! Each tenant gets its own SQLite database at
//! `{data_dir}/tenants/{tenant}/cadence.db`. Open pools are held in a bounded
//! [`TenantCache`]; a pool that is evicted, expires or is torn down explicitly
//! is closed in the background.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_core::tenant::TenantCache;
use cadence_types::config::TenantCacheConfig;
use cadence_types::run::TenantId;

use crate::sqlite::pool::DatabasePool;

#[derive(Debug, thiserror::Error)]
pub enum TenantPoolError {
    #[error("invalid tenant id '{0}'")]
    InvalidTenant(String),

    #[error("failed to create tenant directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Lazily opened, bounded set of per-tenant database pools.
pub struct TenantPoolRegistry {
    data_dir: PathBuf,
    pools: TenantCache<DatabasePool>,
}

impl TenantPoolRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, config: &TenantCacheConfig) -> Self {
        Self::with_cache(data_dir, TenantCache::from_config(config))
    }

    pub fn with_bounds(data_dir: impl Into<PathBuf>, capacity: usize, ttl: Duration) -> Self {
        Self::with_cache(data_dir, TenantCache::new(capacity, ttl))
    }

    fn with_cache(data_dir: impl Into<PathBuf>, cache: TenantCache<DatabasePool>) -> Self {
        let pools = cache.with_teardown(|tenant, pool: DatabasePool| {
            tracing::debug!(tenant = %tenant, "closing tenant database pool");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { pool.close().await });
                }
                // Without a runtime the pool is dropped, which closes idle connections.
                Err(_) => drop(pool),
            }
        });
        Self {
            data_dir: data_dir.into(),
            pools,
        }
    }

    /// Database file of a tenant.
    pub fn database_path(&self, tenant: &TenantId) -> Result<PathBuf, TenantPoolError> {
        validate_tenant(tenant)?;
        Ok(self
            .data_dir
            .join("tenants")
            .join(tenant.as_str())
            .join("cadence.db"))
    }

    /// Pool for `tenant`, opening (and migrating) its database on first use.
    pub async fn pool(&self, tenant: &TenantId) -> Result<DatabasePool, TenantPoolError> {
        let path = self.database_path(tenant)?;
        self.pools
            .get_or_try_insert_with(tenant, || open_pool(tenant, path))
            .await
    }

    /// Close a tenant's pool now. Returns `true` if one was open.
    pub fn release(&self, tenant: &TenantId) -> bool {
        self.pools.teardown(tenant)
    }

    /// Close pools idle past the TTL. Returns how many were closed.
    pub fn purge_idle(&self) -> usize {
        self.pools.purge_expired()
    }

    /// Close every open pool.
    pub fn shutdown(&self) {
        self.pools.clear();
    }

    pub fn open_pools(&self) -> usize {
        self.pools.len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

async fn open_pool(tenant: &TenantId, path: PathBuf) -> Result<DatabasePool, TenantPoolError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| TenantPoolError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
    }
    let pool = DatabasePool::open(&path).await?;
    tracing::info!(tenant = %tenant, path = %path.display(), "opened tenant database");
    Ok(pool)
}

fn validate_tenant(tenant: &TenantId) -> Result<(), TenantPoolError> {
    let id = tenant.as_str();
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TenantPoolError::InvalidTenant(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn opens_one_database_per_tenant() {
        let tmp = TempDir::new().unwrap();
        let registry = TenantPoolRegistry::with_bounds(tmp.path(), 4, Duration::from_secs(60));

        let acme = TenantId::new("acme");
        registry.pool(&acme).await.unwrap();
        registry.pool(&acme).await.unwrap();
        registry.pool(&TenantId::new("globex")).await.unwrap();

        assert_eq!(registry.open_pools(), 2);
        assert!(tmp.path().join("tenants/acme/cadence.db").exists());
        assert!(tmp.path().join("tenants/globex/cadence.db").exists());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let tmp = TempDir::new().unwrap();
        let registry = TenantPoolRegistry::with_bounds(tmp.path(), 1, Duration::from_secs(60));

        registry.pool(&TenantId::new("acme")).await.unwrap();
        registry.pool(&TenantId::new("globex")).await.unwrap();
        assert_eq!(registry.open_pools(), 1);

        assert!(registry.release(&TenantId::new("globex")));
        assert!(!registry.release(&TenantId::new("acme")));
        assert_eq!(registry.open_pools(), 0);
    }

    #[tokio::test]
    async fn rejects_unsafe_tenant_ids() {
        let tmp = TempDir::new().unwrap();
        let registry = TenantPoolRegistry::with_bounds(tmp.path(), 4, Duration::from_secs(60));
        for id in ["", "..", "a/b", "a b"] {
            assert!(matches!(
                registry.pool(&TenantId::new(id)).await,
                Err(TenantPoolError::InvalidTenant(_))
            ));
        }
    }
}
