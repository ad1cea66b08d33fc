// =============================================================================
// ADMIN PERMISSIONS
// =============================================================================
// Explicit permission grants for admin accounts, cached in Redis for five
// minutes. The cache only ever holds permission sets, never quantities, and a
// cache failure falls through to the store.
// =============================================================================

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::error::AppResult;
use crate::metrics;
use crate::store::Store;

/// Unmasked receiver data on privacy-protected orders. Must be granted
/// explicitly; `super_admin` does not imply it.
pub const VIEW_PRIVACY: &str = "order.view_privacy";

const CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminRole::Admin => "admin",
            AdminRole::SuperAdmin => "super_admin",
        }
    }
}

impl FromStr for AdminRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(AdminRole::Admin),
            "super_admin" => Ok(AdminRole::SuperAdmin),
            other => Err(format!("unknown admin role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminPermissions {
    pub user_id: i64,
    pub role: AdminRole,
    pub permissions: Vec<String>,
}

impl AdminPermissions {
    /// Special permissions are only held when granted by name. Everything
    /// else is implied by `super_admin`.
    pub fn has(&self, permission: &str) -> bool {
        if self.permissions.iter().any(|p| p == permission) {
            return true;
        }
        self.role == AdminRole::SuperAdmin && !is_special(permission)
    }
}

fn is_special(permission: &str) -> bool {
    permission == VIEW_PRIVACY
}

// -----------------------------------------------------------------------------
// CACHE
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct PermissionCache {
    redis: Option<ConnectionManager>,
    store: Arc<dyn Store>,
}

impl PermissionCache {
    pub fn new(redis: Option<ConnectionManager>, store: Arc<dyn Store>) -> Self {
        Self { redis, store }
    }

    fn key(user_id: i64) -> String {
        format!("perm:user:{user_id}")
    }

    pub async fn permissions_for(&self, user_id: i64) -> AppResult<Option<AdminPermissions>> {
        if let Some(cached) = self.cached(user_id).await {
            return Ok(Some(cached));
        }

        let perms = self.store.admin_permissions(user_id).await?;
        if let Some(perms) = &perms {
            self.remember(perms).await;
        }
        Ok(perms)
    }

    pub async fn has(&self, user_id: i64, permission: &str) -> AppResult<bool> {
        Ok(self
            .permissions_for(user_id)
            .await?
            .map_or(false, |p| p.has(permission)))
    }

    /// Persist new grants and drop the cached copy.
    pub async fn update(&self, perms: AdminPermissions) -> AppResult<AdminPermissions> {
        let saved = self.store.upsert_admin_permissions(perms).await?;
        self.invalidate(saved.user_id).await;
        Ok(saved)
    }

    async fn cached(&self, user_id: i64) -> Option<AdminPermissions> {
        let mut conn = self.redis.clone()?;
        let start = Instant::now();
        let raw: Result<Option<String>, _> = redis::cmd("GET")
            .arg(Self::key(user_id))
            .query_async(&mut conn)
            .await;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        match raw {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(user_id, error = %e, "Permission cache read failed");
                None
            }
        }
    }

    async fn remember(&self, perms: &AdminPermissions) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let Ok(json) = serde_json::to_string(perms) else {
            return;
        };
        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(Self::key(perms.user_id))
            .arg(CACHE_TTL_SECS)
            .arg(json)
            .query_async(&mut conn)
            .await;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());
        if let Err(e) = result {
            warn!(user_id = perms.user_id, error = %e, "Permission cache write failed");
        }
    }

    async fn invalidate(&self, user_id: i64) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(Self::key(user_id))
            .query_async(&mut conn)
            .await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());
        if let Err(e) = result {
            warn!(user_id, error = %e, "Permission cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn perms(role: AdminRole, grants: &[&str]) -> AdminPermissions {
        AdminPermissions {
            user_id: 1,
            role,
            permissions: grants.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn super_admin_does_not_imply_privacy() {
        let root = perms(AdminRole::SuperAdmin, &[]);
        assert!(root.has("order.refund"));
        assert!(!root.has(VIEW_PRIVACY));

        let auditor = perms(AdminRole::Admin, &[VIEW_PRIVACY]);
        assert!(auditor.has(VIEW_PRIVACY));
        assert!(!auditor.has("order.refund"));
    }

    #[tokio::test]
    async fn falls_through_to_the_store_without_redis() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cache = PermissionCache::new(None, store);

        assert!(!cache.has(1, VIEW_PRIVACY).await.unwrap());
        cache.update(perms(AdminRole::Admin, &[VIEW_PRIVACY])).await.unwrap();
        assert!(cache.has(1, VIEW_PRIVACY).await.unwrap());
    }
}
