//! Cross-replica job ownership.
//!
//! Each replica has a [`ClientIdentity`] whose liveness key is refreshed with
//! a TTL while it enqueues or services work. A replica claims a job by writing
//! its identity under the job's ownership key; the first claim wins, and a
//! claim whose owner's liveness key has expired may be superseded.

use std::time::Duration;

use crate::error::Result;
use crate::store::{KvStore, SharedStore, StoreKeys};

/// Identity of one queue-owning process: `{host}-{pid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Identity of the current process.
    pub fn current() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self(format!("{}-{}", host, std::process::id()))
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job ownership tracking for one replica.
#[derive(Debug, Clone)]
pub struct Ownership {
    store: SharedStore,
    keys: StoreKeys,
    identity: ClientIdentity,
    liveness_ttl: Duration,
    claim_ttl: Duration,
}

impl Ownership {
    /// Create ownership tracking for `identity` in `namespace`.
    pub fn new(
        store: SharedStore,
        namespace: impl Into<String>,
        identity: ClientIdentity,
        liveness_ttl: Duration,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys: StoreKeys::new(namespace),
            identity,
            liveness_ttl,
            claim_ttl,
        }
    }

    /// This replica's identity.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Refresh this replica's liveness key.
    pub async fn refresh(&self) -> Result<()> {
        self.store
            .set_ex(&self.keys.client(self.identity.as_str()), "1", self.liveness_ttl)
            .await?;
        tracing::trace!(identity = %self.identity, "Liveness refreshed");
        Ok(())
    }

    /// Whether `identity` has refreshed its liveness key within the TTL.
    pub async fn is_client_alive(&self, identity: &ClientIdentity) -> Result<bool> {
        Ok(self
            .store
            .get(&self.keys.client(identity.as_str()))
            .await?
            .is_some())
    }

    /// Current owner of a job, if any.
    pub async fn owner_of(&self, job_id: &str) -> Result<Option<ClientIdentity>> {
        Ok(self
            .store
            .get(&self.keys.job_owner(job_id))
            .await?
            .map(ClientIdentity))
    }

    /// Whether a live replica other than this one owns `job_id`.
    pub async fn owned_elsewhere(&self, job_id: &str) -> Result<bool> {
        match self.owner_of(job_id).await? {
            Some(owner) if owner != self.identity => self.is_client_alive(&owner).await,
            _ => Ok(false),
        }
    }

    /// Claim `job_id` for this replica.
    ///
    /// Returns `false` when a live replica other than this one holds the claim.
    pub async fn claim(&self, job_id: &str) -> Result<bool> {
        let key = self.keys.job_owner(job_id);
        if self
            .store
            .set_nx_ex(&key, self.identity.as_str(), self.claim_ttl)
            .await?
        {
            return Ok(true);
        }

        if self.owned_elsewhere(job_id).await? {
            return Ok(false);
        }

        // Held by us already, or by a replica whose liveness lapsed.
        self.store
            .set_ex(&key, self.identity.as_str(), self.claim_ttl)
            .await?;
        Ok(true)
    }

    /// Drop this replica's claim on `job_id`; claims held by others are kept.
    pub async fn release(&self, job_id: &str) -> Result<()> {
        if self.owner_of(job_id).await?.as_ref() == Some(&self.identity) {
            self.store.delete(&self.keys.job_owner(job_id)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn replica(store: &SharedStore, name: &str) -> Ownership {
        Ownership::new(
            store.clone(),
            "test",
            ClientIdentity::from(name),
            Duration::from_secs(10),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_current_identity() {
        let identity = ClientIdentity::current();
        assert!(identity
            .as_str()
            .ends_with(&format!("-{}", std::process::id())));
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let store = SharedStore::new(MemoryStore::new());
        let a = replica(&store, "host-a-1");
        let b = replica(&store, "host-b-2");
        a.refresh().await.unwrap();
        b.refresh().await.unwrap();

        assert!(a.claim("job").await.unwrap());
        assert!(!b.claim("job").await.unwrap());
        assert!(b.owned_elsewhere("job").await.unwrap());
        assert!(!a.owned_elsewhere("job").await.unwrap());

        // Re-claiming our own job succeeds.
        assert!(a.claim("job").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_owner_is_superseded() {
        let store = SharedStore::new(MemoryStore::new());
        let a = replica(&store, "host-a-1");
        let b = replica(&store, "host-b-2");
        a.refresh().await.unwrap();
        assert!(a.claim("job").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        b.refresh().await.unwrap();

        assert!(!b.owned_elsewhere("job").await.unwrap());
        assert!(b.claim("job").await.unwrap());
        assert_eq!(
            b.owner_of("job").await.unwrap(),
            Some(ClientIdentity::from("host-b-2"))
        );
    }

    #[tokio::test]
    async fn test_release_only_own_claim() {
        let store = SharedStore::new(MemoryStore::new());
        let a = replica(&store, "host-a-1");
        let b = replica(&store, "host-b-2");
        a.refresh().await.unwrap();
        a.claim("job").await.unwrap();

        b.release("job").await.unwrap();
        assert!(a.owner_of("job").await.unwrap().is_some());

        a.release("job").await.unwrap();
        assert!(a.owner_of("job").await.unwrap().is_none());
    }
}
