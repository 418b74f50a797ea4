//! Event broker (C4): subscription bookkeeping and fan-out of domain
//! events to exactly the clients subscribed to their category.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::events::DomainEvent;

use super::server::RpcServer;

struct Subscription {
    client_id: String,
    categories: HashSet<String>,
}

const VALID_CATEGORIES: [&str; 3] = ["ssh", "forward", "metrics"];

struct Inner {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    by_client: RwLock<HashMap<String, HashSet<String>>>,
    next_sub_id: AtomicU64,
    server: Arc<RpcServer>,
}

#[derive(Clone)]
pub struct EventBroker(Arc<Inner>);

impl EventBroker {
    pub fn new(server: Arc<RpcServer>) -> Self {
        EventBroker(Arc::new(Inner {
            subscriptions: RwLock::new(HashMap::new()),
            by_client: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            server,
        }))
    }

    /// Validates `types` against `{ssh, forward, metrics}` and registers a
    /// new subscription for `client_id`.
    pub async fn subscribe(&self, client_id: &str, types: Vec<String>) -> DomainResult<String> {
        for t in &types {
            if !VALID_CATEGORIES.contains(&t.as_str()) {
                return Err(DomainError::InvalidRule(format!(
                    "unknown event type: {t}"
                )));
            }
        }
        let sub_id = format!("sub-{}", self.0.next_sub_id.fetch_add(1, Ordering::SeqCst));
        let categories: HashSet<String> = types.into_iter().collect();

        self.0.subscriptions.write().await.insert(
            sub_id.clone(),
            Subscription {
                client_id: client_id.to_string(),
                categories,
            },
        );
        self.0
            .by_client
            .write()
            .await
            .entry(client_id.to_string())
            .or_default()
            .insert(sub_id.clone());
        Ok(sub_id)
    }

    pub async fn unsubscribe(&self, sub_id: &str) -> DomainResult<()> {
        let removed = self.0.subscriptions.write().await.remove(sub_id);
        if let Some(sub) = removed {
            if let Some(ids) = self.0.by_client.write().await.get_mut(&sub.client_id) {
                ids.remove(sub_id);
            }
            Ok(())
        } else {
            Err(DomainError::Internal(format!(
                "unknown subscription: {sub_id}"
            )))
        }
    }

    /// Drops every subscription belonging to a disconnecting client,
    /// atomically with respect to concurrent `subscribe` calls.
    pub async fn remove_client(&self, client_id: &str) {
        let sub_ids = self
            .0
            .by_client
            .write()
            .await
            .remove(client_id)
            .unwrap_or_default();
        let mut subs = self.0.subscriptions.write().await;
        for id in sub_ids {
            subs.remove(&id);
        }
    }

    /// Fans an event out to the distinct set of clients subscribed to its
    /// category. A client subscribed via more than one matching
    /// subscription receives the notification exactly once. Sends happen
    /// outside the broker's lock so one slow client can't block the rest.
    pub async fn publish(&self, event: DomainEvent) {
        let category = event.category();
        let targets: HashSet<String> = {
            let subs = self.0.subscriptions.read().await;
            subs.values()
                .filter(|s| s.categories.contains(category))
                .map(|s| s.client_id.clone())
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let notif = match &event {
            DomainEvent::Ssh(e) => moleport_protocol::Notification::new(
                "event.ssh",
                serde_json::to_value(e).ok(),
            ),
            DomainEvent::Forward(e) => moleport_protocol::Notification::new(
                "event.forward",
                serde_json::to_value(e).ok(),
            ),
        };

        for client_id in targets {
            let server = self.0.server.clone();
            let notif = notif.clone();
            tokio::spawn(async move {
                if server.send_notification(&client_id, notif).await.is_err() {
                    debug!(client = %client_id, "dropped event: client not found");
                }
            });
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.0.subscriptions.read().await.len()
    }
}

#[async_trait::async_trait]
impl super::server::ClientLifecycle for EventBroker {
    async fn on_connect(&self, _client_id: &str) {}

    async fn on_disconnect(&self, client_id: &str) {
        self.remove_client(client_id).await;
    }
}
