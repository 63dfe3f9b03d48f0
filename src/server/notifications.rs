//! Membership change notifications for group conversations.
//!
//! Delivery is best-effort: callers dispatch through [`dispatch`], which runs
//! the notifier on a background task and only logs failures.

use crate::common::models::{MembershipChange, MembershipEvent};
use async_trait::async_trait;
use log::{info, warn};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait MembershipNotifier: Send + Sync {
    async fn notify_membership_change(
        &self,
        group_id: &str,
        kind: MembershipChange,
        actor_name: &str,
    ) -> anyhow::Result<()>;
}

pub fn event(group_id: &str, kind: MembershipChange, actor_name: &str) -> MembershipEvent {
    MembershipEvent {
        group_id: group_id.to_string(),
        kind,
        actor_name: actor_name.to_string(),
        text: kind.describe(actor_name),
        timestamp: chrono::Utc::now().timestamp(),
    }
}

/// Fire-and-forget delivery. Must be called from within a Tokio runtime.
pub fn dispatch(notifier: &Arc<dyn MembershipNotifier>, group_id: &str, kind: MembershipChange, actor_name: &str) {
    let notifier = notifier.clone();
    let group_id = group_id.to_string();
    let actor_name = actor_name.to_string();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_membership_change(&group_id, kind, &actor_name).await {
            warn!(
                "[NOTIFY] Could not deliver '{}' for group {}: {}",
                kind.as_str(),
                group_id,
                e
            );
        }
    });
}

/// Publishes events as JSON on the Redis channel `group:<group_id>`.
pub struct RedisNotifier {
    redis_manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisNotifier {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        info!("[NOTIFY] Connected to Redis at {}", redis_url);
        Ok(Self {
            redis_manager: Arc::new(Mutex::new(redis_manager)),
        })
    }
}

#[async_trait]
impl MembershipNotifier for RedisNotifier {
    async fn notify_membership_change(
        &self,
        group_id: &str,
        kind: MembershipChange,
        actor_name: &str,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event(group_id, kind, actor_name))?;
        let channel = format!("group:{}", group_id);
        let mut conn = self.redis_manager.lock().await;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(&payload)
            .query_async(&mut *conn)
            .await?;
        info!("[NOTIFY] Published '{}' on {} ({} receivers)", kind.as_str(), channel, receivers);
        Ok(())
    }
}

/// Used when no Redis instance is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl MembershipNotifier for LogNotifier {
    async fn notify_membership_change(
        &self,
        group_id: &str,
        kind: MembershipChange,
        actor_name: &str,
    ) -> anyhow::Result<()> {
        info!("[NOTIFY] [group {}] {}", group_id, kind.describe(actor_name));
        Ok(())
    }
}
