//! Presence tracking
//!
//! A user's presence in a workspace is one status entry plus the set of
//! instances holding a live connection for them. Each instance membership
//! carries its own expiry, so a user goes offline only when the last instance
//! leaves, and a crashed instance's membership simply lapses. Connected users
//! are kept alive by the heartbeat task.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use teamhub_shared::{ChatError, ChatResult, PresenceStatus, UserId, WorkspaceId};
use time::OffsetDateTime;
use uuid::Uuid;

const SCAN_BATCH: usize = 200;

/// Drops this instance's membership, prunes lapsed ones and deletes the status
/// entry once no instance is left. Returns 1 when the user went offline.
const LEAVE_SCRIPT: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
if redis.call('ZCARD', KEYS[1]) == 0 then
    redis.call('DEL', KEYS[1], KEYS[2])
    return 1
end
return 0
";

/// Presence of one user within a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Shared storage for status entries and instance memberships
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Write the status entry, replacing any previous one
    async fn put(&self, workspace_id: WorkspaceId, entry: &PresenceEntry, ttl: Duration) -> ChatResult<()>;

    /// Extend the TTL of the status entry. Returns false if it no longer exists.
    async fn touch(&self, workspace_id: WorkspaceId, user_id: UserId, ttl: Duration) -> ChatResult<bool>;

    /// Record (or extend) `instance`'s membership for the user
    async fn join(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        instance: Uuid,
        ttl: Duration,
    ) -> ChatResult<()>;

    /// Drop `instance`'s membership. When no live membership is left the status
    /// entry is deleted as well and true is returned.
    async fn leave(&self, workspace_id: WorkspaceId, user_id: UserId, instance: Uuid) -> ChatResult<bool>;

    async fn list(&self, workspace_id: WorkspaceId) -> ChatResult<Vec<PresenceEntry>>;
}

fn presence_key(workspace_id: WorkspaceId, user_id: UserId) -> String {
    format!("presence:{workspace_id}:{user_id}")
}

fn instances_key(workspace_id: WorkspaceId, user_id: UserId) -> String {
    format!("presence-instances:{workspace_id}:{user_id}")
}

fn presence_store_error(e: redis::RedisError) -> ChatError {
    ChatError::BusUnavailable(format!("presence store: {e}"))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis().max(1)).unwrap_or(i64::MAX)
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

// =============================================================================
// Redis
// =============================================================================

/// Status entries are JSON strings under `presence:{workspace}:{user}`;
/// memberships are a sorted set under `presence-instances:{workspace}:{user}`
/// scored by expiry in unix milliseconds.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    leave_script: redis::Script,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            leave_script: redis::Script::new(LEAVE_SCRIPT),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn put(&self, workspace_id: WorkspaceId, entry: &PresenceEntry, ttl: Duration) -> ChatResult<()> {
        let value = serde_json::to_string(entry)
            .map_err(|e| ChatError::Validation(format!("presence entry: {e}")))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(presence_key(workspace_id, entry.user_id), value, ttl.as_secs().max(1))
            .await
            .map_err(presence_store_error)
    }

    async fn touch(&self, workspace_id: WorkspaceId, user_id: UserId, ttl: Duration) -> ChatResult<bool> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        conn.expire::<_, bool>(presence_key(workspace_id, user_id), secs)
            .await
            .map_err(presence_store_error)
    }

    async fn join(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        instance: Uuid,
        ttl: Duration,
    ) -> ChatResult<()> {
        let key = instances_key(workspace_id, user_id);
        let expires_at = unix_millis(OffsetDateTime::now_utc()).saturating_add(millis(ttl));
        let mut conn = self.conn.clone();

        let () = redis::pipe()
            .atomic()
            .zadd(&key, instance.to_string(), expires_at)
            .ignore()
            .pexpire(&key, millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(presence_store_error)?;
        Ok(())
    }

    async fn leave(&self, workspace_id: WorkspaceId, user_id: UserId, instance: Uuid) -> ChatResult<bool> {
        let mut conn = self.conn.clone();
        let gone: i64 = self
            .leave_script
            .key(instances_key(workspace_id, user_id))
            .key(presence_key(workspace_id, user_id))
            .arg(instance.to_string())
            .arg(unix_millis(OffsetDateTime::now_utc()))
            .invoke_async(&mut conn)
            .await
            .map_err(presence_store_error)?;
        Ok(gone == 1)
    }

    async fn list(&self, workspace_id: WorkspaceId) -> ChatResult<Vec<PresenceEntry>> {
        let mut conn = self.conn.clone();
        let pattern = format!("presence:{workspace_id}:*");

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(presence_store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(presence_store_error)?;

        // Keys can expire between SCAN and MGET
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|raw| match serde_json::from_str::<PresenceEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable presence entry");
                    None
                }
            })
            .collect())
    }
}

// =============================================================================
// In-memory
// =============================================================================

type PresenceKey = (WorkspaceId, UserId);

#[derive(Default)]
struct MemoryPresence {
    entries: HashMap<PresenceKey, (PresenceEntry, Instant)>,
    instances: HashMap<PresenceKey, HashMap<Uuid, Instant>>,
}

/// Single-node presence store used when no Redis is configured. Managers
/// sharing one store behave like separate instances.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<MemoryPresence>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ChatResult<std::sync::MutexGuard<'_, MemoryPresence>> {
        self.state
            .lock()
            .map_err(|_| ChatError::BusUnavailable("presence store lock poisoned".to_string()))
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn put(&self, workspace_id: WorkspaceId, entry: &PresenceEntry, ttl: Duration) -> ChatResult<()> {
        self.lock()?
            .entries
            .insert((workspace_id, entry.user_id), (entry.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn touch(&self, workspace_id: WorkspaceId, user_id: UserId, ttl: Duration) -> ChatResult<bool> {
        let mut state = self.lock()?;
        let now = Instant::now();
        match state.entries.get_mut(&(workspace_id, user_id)) {
            Some((_, expires_at)) if *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => {
                state.entries.remove(&(workspace_id, user_id));
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn join(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        instance: Uuid,
        ttl: Duration,
    ) -> ChatResult<()> {
        self.lock()?
            .instances
            .entry((workspace_id, user_id))
            .or_default()
            .insert(instance, Instant::now() + ttl);
        Ok(())
    }

    async fn leave(&self, workspace_id: WorkspaceId, user_id: UserId, instance: Uuid) -> ChatResult<bool> {
        let mut state = self.lock()?;
        let key = (workspace_id, user_id);
        let now = Instant::now();

        let remaining = match state.instances.get_mut(&key) {
            Some(members) => {
                members.remove(&instance);
                members.retain(|_, expires_at| *expires_at > now);
                members.len()
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(false);
        }

        state.instances.remove(&key);
        state.entries.remove(&key);
        Ok(true)
    }

    async fn list(&self, workspace_id: WorkspaceId) -> ChatResult<Vec<PresenceEntry>> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.entries.retain(|_, (_, expires_at)| *expires_at > now);

        Ok(state
            .entries
            .iter()
            .filter(|((ws, _), _)| *ws == workspace_id)
            .map(|(_, (entry, _))| entry.clone())
            .collect())
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Presence operations used by the connection manager and the REST surface.
///
/// Each tracker is one instance: its memberships are what `set_online` adds
/// and `set_offline` removes.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
    instance_id: Uuid,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            instance_id: Uuid::new_v4(),
        }
    }

    /// Write the user's status without touching instance memberships
    pub async fn update_status(
        &self,
        user_id: UserId,
        workspace_id: WorkspaceId,
        status: PresenceStatus,
    ) -> ChatResult<()> {
        let entry = PresenceEntry {
            user_id,
            status,
            last_seen: OffsetDateTime::now_utc(),
        };
        self.store.put(workspace_id, &entry, self.ttl).await?;

        tracing::debug!(
            user_id = %user_id,
            workspace_id = %workspace_id,
            status = status.as_str(),
            "Presence updated"
        );
        Ok(())
    }

    /// This instance now holds a connection for the user
    pub async fn set_online(&self, user_id: UserId, workspace_id: WorkspaceId) -> ChatResult<()> {
        self.store
            .join(workspace_id, user_id, self.instance_id, self.ttl)
            .await?;
        self.update_status(user_id, workspace_id, PresenceStatus::Online).await
    }

    pub async fn set_away(&self, user_id: UserId, workspace_id: WorkspaceId) -> ChatResult<()> {
        self.update_status(user_id, workspace_id, PresenceStatus::Away).await
    }

    /// This instance holds no connection for the user any more. Returns true
    /// when no other instance does either and the entry was cleared.
    pub async fn set_offline(&self, user_id: UserId, workspace_id: WorkspaceId) -> ChatResult<bool> {
        let offline = self
            .store
            .leave(workspace_id, user_id, self.instance_id)
            .await?;
        tracing::debug!(
            user_id = %user_id,
            workspace_id = %workspace_id,
            offline,
            "Presence membership released"
        );
        Ok(offline)
    }

    /// Users currently ONLINE or AWAY in the workspace
    pub async fn list_online(&self, workspace_id: WorkspaceId) -> ChatResult<Vec<PresenceEntry>> {
        let mut entries: Vec<PresenceEntry> = self
            .store
            .list(workspace_id)
            .await?
            .into_iter()
            .filter(|e| matches!(e.status, PresenceStatus::Online | PresenceStatus::Away))
            .collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(entries)
    }

    /// Extend this instance's membership and the entry's TTL, recreating the
    /// entry as ONLINE if it already expired
    pub async fn refresh(&self, user_id: UserId, workspace_id: WorkspaceId) -> ChatResult<()> {
        self.store
            .join(workspace_id, user_id, self.instance_id, self.ttl)
            .await?;
        if !self.store.touch(workspace_id, user_id, self.ttl).await? {
            self.update_status(user_id, workspace_id, PresenceStatus::Online).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tracker(ttl: Duration) -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryPresenceStore::new()), ttl)
    }

    #[tokio::test]
    async fn test_online_and_away_are_listed() {
        let tracker = tracker(Duration::from_secs(60));
        let workspace = WorkspaceId::new();
        let (ada, bob, eve) = (UserId::new(), UserId::new(), UserId::new());

        tracker.set_online(ada, workspace).await.unwrap();
        tracker.set_online(bob, workspace).await.unwrap();
        tracker.set_away(bob, workspace).await.unwrap();
        tracker.set_online(eve, workspace).await.unwrap();
        tracker.set_offline(eve, workspace).await.unwrap();

        let listed = tracker.list_online(workspace).await.unwrap();
        assert_eq!(listed.len(), 2);
        let bob_entry = listed.iter().find(|e| e.user_id == bob).unwrap();
        assert_eq!(bob_entry.status, PresenceStatus::Away);
        assert!(listed.iter().all(|e| e.user_id != eve));
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let tracker = tracker(Duration::from_secs(60));
        let (ws_a, ws_b) = (WorkspaceId::new(), WorkspaceId::new());
        let user = UserId::new();

        tracker.set_online(user, ws_a).await.unwrap();

        assert_eq!(tracker.list_online(ws_a).await.unwrap().len(), 1);
        assert!(tracker.list_online(ws_b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_expire_without_heartbeat() {
        let tracker = tracker(Duration::from_millis(50));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        tracker.set_online(user, workspace).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(tracker.list_online(workspace).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_entry_alive() {
        let tracker = tracker(Duration::from_millis(150));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        tracker.set_away(user, workspace).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tracker.refresh(user, workspace).await.unwrap();
        }

        let listed = tracker.list_online(workspace).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn test_refresh_recreates_expired_entry() {
        let tracker = tracker(Duration::from_millis(30));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        tracker.set_online(user, workspace).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        tracker.refresh(user, workspace).await.unwrap();

        let listed = tracker.list_online(workspace).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_offline_only_after_every_instance_leaves() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let phone_node = PresenceTracker::new(Arc::clone(&store), Duration::from_secs(60));
        let laptop_node = PresenceTracker::new(Arc::clone(&store), Duration::from_secs(60));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        phone_node.set_online(user, workspace).await.unwrap();
        laptop_node.set_online(user, workspace).await.unwrap();

        assert!(!phone_node.set_offline(user, workspace).await.unwrap());
        assert_eq!(laptop_node.list_online(workspace).await.unwrap().len(), 1);

        assert!(laptop_node.set_offline(user, workspace).await.unwrap());
        assert!(phone_node.list_online(workspace).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lapsed_instance_does_not_keep_user_online() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let crashed = PresenceTracker::new(Arc::clone(&store), Duration::from_millis(30));
        let alive = PresenceTracker::new(Arc::clone(&store), Duration::from_secs(60));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        crashed.set_online(user, workspace).await.unwrap();
        alive.set_online(user, workspace).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(alive.set_offline(user, workspace).await.unwrap());
        assert!(alive.list_online(workspace).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_update_keeps_memberships() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node = PresenceTracker::new(Arc::clone(&store), Duration::from_secs(60));
        let rest_node = PresenceTracker::new(Arc::clone(&store), Duration::from_secs(60));
        let workspace = WorkspaceId::new();
        let user = UserId::new();

        node.set_online(user, workspace).await.unwrap();
        rest_node.update_status(user, workspace, PresenceStatus::Away).await.unwrap();

        // The REST node never held a connection, so leaving there changes nothing
        assert!(!rest_node.set_offline(user, workspace).await.unwrap());
        let listed = node.list_online(workspace).await.unwrap();
        assert_eq!(listed[0].status, PresenceStatus::Away);

        assert!(node.set_offline(user, workspace).await.unwrap());
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = PresenceEntry {
            user_id: UserId::new(),
            status: PresenceStatus::Online,
            last_seen: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "ONLINE");
        assert_eq!(json["lastSeen"], "1970-01-01T00:00:00Z");
    }
}
