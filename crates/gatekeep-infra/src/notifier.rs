//! Notifier that resolves recipient addresses and logs the outbound message.
//!
//! Stands in for an email/push gateway. Delivery runs on a spawned task so
//! the engine never waits on it.

use std::sync::Arc;

use gatekeep_core::directory::{IdentityDirectory, Notifier, OutboundNotification};

pub struct LogNotifier<D> {
    directory: Arc<D>,
}

impl<D: IdentityDirectory + 'static> LogNotifier<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }
}

impl<D: IdentityDirectory + 'static> Notifier for LogNotifier<D> {
    fn publish(&self, notification: OutboundNotification) {
        let directory = Arc::clone(&self.directory);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    deliver(directory.as_ref(), &notification).await;
                });
            }
            Err(_) => tracing::warn!(
                subject = %notification.subject,
                "no async runtime, dropping notification"
            ),
        }
    }
}

/// Log one line per recipient with an address. Returns how many were addressed.
pub(crate) async fn deliver<D: IdentityDirectory>(
    directory: &D,
    notification: &OutboundNotification,
) -> usize {
    let mut delivered = 0;
    for recipient in &notification.recipients {
        match directory.get_user(recipient).await {
            Ok(Some(user)) if user.is_active => match user.email {
                Some(email) => {
                    tracing::info!(
                        to = %email,
                        subject = %notification.subject,
                        instance_id = %notification.workflow_instance_id,
                        "notification sent"
                    );
                    delivered += 1;
                }
                None => tracing::debug!(user_id = %recipient, "recipient has no email address"),
            },
            Ok(_) => tracing::debug!(user_id = %recipient, "recipient missing or inactive"),
            Err(e) => tracing::warn!(user_id = %recipient, error = %e, "recipient lookup failed"),
        }
    }
    delivered
}
