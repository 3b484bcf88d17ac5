//! Server-side leases replacing vendor "on-disconnect" cleanup hooks.
//!
//! Each connection holds a lease renewed by any inbound frame and by
//! explicit heartbeats (clients send them at TTL/3). A periodic sweep
//! expires leases that were not renewed within the TTL window; expiry
//! removes the owner's presence record and releases all locks held by
//! the owner. A crashed client may therefore appear to hold a lock for
//! a bounded grace period; locks are advisory, so this is a liveness
//! gap rather than a correctness violation.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// A live connection lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: Uuid,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub ttl: Duration,
    expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct LeaseRegistry {
    leases: RwLock<HashMap<Uuid, Lease>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Register a lease for a connection. Returns the lease id.
    pub async fn register(&self, user_id: Uuid, project_id: Uuid, ttl: Duration) -> Uuid {
        let lease_id = Uuid::new_v4();
        let lease = Lease {
            lease_id,
            user_id,
            project_id,
            ttl,
            expires_at: Instant::now() + ttl,
        };
        self.leases.write().await.insert(lease_id, lease);
        log::debug!("Lease {lease_id} registered for user {user_id} on project {project_id}");
        lease_id
    }

    /// Push the expiry forward by the lease's TTL. Any inbound frame
    /// renews; false if the lease is unknown (already expired and swept).
    pub async fn renew(&self, lease_id: Uuid) -> bool {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + lease.ttl;
                true
            }
            None => false,
        }
    }

    /// Explicit release on clean disconnect.
    pub async fn release(&self, lease_id: Uuid) -> Option<Lease> {
        self.leases.write().await.remove(&lease_id)
    }

    /// Remove and return every expired lease.
    pub async fn sweep(&self) -> Vec<Lease> {
        let now = Instant::now();
        let mut leases = self.leases.write().await;
        let expired: Vec<Uuid> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.lease_id)
            .collect();
        expired
            .iter()
            .filter_map(|id| leases.remove(id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.leases.read().await.len()
    }

    pub async fn contains(&self, lease_id: Uuid) -> bool {
        self.leases.read().await.contains_key(&lease_id)
    }
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_release() {
        let registry = LeaseRegistry::new();
        let id = registry
            .register(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(10))
            .await;

        assert!(registry.contains(id).await);
        let lease = registry.release(id).await.unwrap();
        assert_eq!(lease.lease_id, id);
        assert!(!registry.contains(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_unrenewed_leases() {
        let registry = LeaseRegistry::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();
        let id = registry.register(user, project, Duration::from_millis(100)).await;

        assert!(registry.sweep().await.is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        let expired = registry.sweep().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].lease_id, id);
        assert_eq!(expired[0].user_id, user);
        assert_eq!(expired[0].project_id, project);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let registry = LeaseRegistry::new();
        let id = registry
            .register(Uuid::new_v4(), Uuid::new_v4(), Duration::from_millis(100))
            .await;

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(registry.renew(id).await);

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(registry.sweep().await.is_empty(), "renewed lease must survive");

        tokio::time::advance(Duration::from_millis(120)).await;
        assert_eq!(registry.sweep().await.len(), 1);
    }

    #[tokio::test]
    async fn test_renew_unknown_lease() {
        let registry = LeaseRegistry::new();
        assert!(!registry.renew(Uuid::new_v4()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_leaves_live_leases() {
        let registry = LeaseRegistry::new();
        let short = registry
            .register(Uuid::new_v4(), Uuid::new_v4(), Duration::from_millis(50))
            .await;
        let long = registry
            .register(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(60))
            .await;

        tokio::time::advance(Duration::from_millis(100)).await;
        let expired = registry.sweep().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].lease_id, short);
        assert!(registry.contains(long).await);
    }
}
