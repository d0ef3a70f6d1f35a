//! In-process fan-out of approval events to live subscriber connections.
//!
//! Each connection owns a bounded `tokio::sync::mpsc` channel. Events are
//! serialized once and pushed with `try_send`; a connection whose channel is
//! full or closed is evicted on the spot, so one slow client can never stall
//! delivery to anyone else. Connections are keyed by user and capped per
//! user, evicting the oldest first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatekeep_types::config::HubConfig;
use gatekeep_types::event::ApprovalEvent;
use gatekeep_types::ids::{CompanyId, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::EventPublisher;

/// Serialized event frame shared by every connection it is sent to.
pub type Frame = Arc<str>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Connection {
    id: Uuid,
    company_id: CompanyId,
    sender: mpsc::Sender<Frame>,
    opened_at: DateTime<Utc>,
}

/// Receiving end of one registered connection.
///
/// Dropping it closes the channel; the hub notices on the next send and
/// forgets the connection. Call [`NotificationHub::unregister`] to release
/// the slot immediately.
pub struct Subscription {
    pub user_id: UserId,
    pub connection_id: Uuid,
    receiver: mpsc::Receiver<Frame>,
}

impl Subscription {
    /// Wait for the next frame. `None` once the hub has dropped this connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Take a frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("user_id", &self.user_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

pub struct NotificationHub {
    connections: DashMap<UserId, Vec<Connection>>,
    config: HubConfig,
}

impl NotificationHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config,
        }
    }

    /// Open a new connection for `user_id`.
    ///
    /// The `connected` frame is queued before the subscription is returned.
    /// If the user already holds `max_connections_per_user` connections the
    /// oldest ones are closed to make room.
    pub fn register(&self, user_id: UserId, company_id: CompanyId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let connection_id = Uuid::now_v7();

        match serialize(&ApprovalEvent::connected(user_id, connection_id)) {
            Ok(frame) => {
                let _ = sender.try_send(frame);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize connected event"),
        }

        let cap = self.config.max_connections_per_user.max(1);
        let mut conns = self.connections.entry(user_id).or_default();
        while conns.len() >= cap {
            let evicted = conns.remove(0);
            tracing::info!(
                user_id = %user_id,
                connection_id = %evicted.id,
                opened_at = %evicted.opened_at,
                "connection cap reached, closing oldest connection"
            );
        }
        conns.push(Connection {
            id: connection_id,
            company_id,
            sender,
            opened_at: Utc::now(),
        });
        let open = conns.len();
        drop(conns);

        tracing::debug!(user_id = %user_id, connection_id = %connection_id, open, "connection registered");

        Subscription {
            user_id,
            connection_id,
            receiver,
        }
    }

    /// Forget one connection. Returns whether it was still registered.
    pub fn unregister(&self, user_id: &UserId, connection_id: Uuid) -> bool {
        let removed = match self.connections.get_mut(user_id) {
            Some(mut conns) => {
                let before = conns.len();
                conns.retain(|c| c.id != connection_id);
                before != conns.len()
            }
            None => false,
        };
        self.connections.remove_if(user_id, |_, conns| conns.is_empty());
        if removed {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "connection unregistered");
        }
        removed
    }

    /// Deliver `event` to the company's connections, or only to `targets`.
    ///
    /// Returns the number of connections the frame was queued on.
    pub fn broadcast(
        &self,
        event: &ApprovalEvent,
        company_id: CompanyId,
        targets: Option<&[UserId]>,
    ) -> Result<usize, HubError> {
        let frame = serialize(event)?;
        Ok(self.fan_out(&frame, Some(company_id), targets))
    }

    /// Send a heartbeat frame to every open connection.
    pub fn heartbeat(&self) -> usize {
        match serialize(&ApprovalEvent::heartbeat()) {
            Ok(frame) => self.fan_out(&frame, None, None),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize heartbeat");
                0
            }
        }
    }

    /// Run [`heartbeat`](Self::heartbeat) every `interval` until `cancel` fires.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let delivered = hub.heartbeat();
                        tracing::trace!(delivered, "heartbeat sent");
                    }
                }
            }
            tracing::debug!("heartbeat task stopped");
        })
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let open = self.total_connections();
        self.connections.clear();
        tracing::info!(closed = open, "notification hub shut down");
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.connections.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn connected_users(&self) -> usize {
        self.connections.len()
    }

    fn fan_out(&self, frame: &Frame, company: Option<CompanyId>, targets: Option<&[UserId]>) -> usize {
        let mut delivered = 0;
        match targets {
            Some(users) => {
                let mut seen = HashSet::new();
                for user_id in users {
                    if !seen.insert(*user_id) {
                        continue;
                    }
                    let emptied = match self.connections.get_mut(user_id) {
                        Some(mut conns) => {
                            delivered += deliver(user_id, &mut conns, company, frame);
                            conns.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        self.connections.remove_if(user_id, |_, conns| conns.is_empty());
                    }
                }
            }
            None => {
                for mut entry in self.connections.iter_mut() {
                    let user_id = *entry.key();
                    delivered += deliver(&user_id, entry.value_mut(), company, frame);
                }
                self.connections.retain(|_, conns| !conns.is_empty());
            }
        }
        delivered
    }
}

impl EventPublisher for NotificationHub {
    fn publish(&self, event: &ApprovalEvent, company_id: CompanyId, targets: Option<&[UserId]>) {
        match self.broadcast(event, company_id, targets) {
            Ok(delivered) => {
                tracing::debug!(kind = event.kind(), delivered, "event published");
            }
            Err(e) => {
                tracing::warn!(kind = event.kind(), error = %e, "failed to publish event");
            }
        }
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("users", &self.connections.len())
            .field("max_connections_per_user", &self.config.max_connections_per_user)
            .finish()
    }
}

fn serialize(event: &ApprovalEvent) -> Result<Frame, HubError> {
    Ok(Arc::from(serde_json::to_string(event)?))
}

/// Queue `frame` on every matching connection, evicting the ones that
/// cannot take it.
fn deliver(
    user_id: &UserId,
    conns: &mut Vec<Connection>,
    company: Option<CompanyId>,
    frame: &Frame,
) -> usize {
    let mut delivered = 0;
    conns.retain(|conn| {
        if company.is_some_and(|c| c != conn.company_id) {
            return true;
        }
        match conn.sender.try_send(Arc::clone(frame)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id = %conn.id,
                    "subscriber channel full, evicting slow connection"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %user_id, connection_id = %conn.id, "subscriber went away");
                false
            }
        }
    });
    delivered
}
