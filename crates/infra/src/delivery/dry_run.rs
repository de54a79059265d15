//! Client used when no gateway credentials are configured.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use super::{DeliveryClient, DeliveryOutcome};

/// Logs each message instead of sending it, and reports it delivered.
#[derive(Debug, Default)]
pub struct DryRunClient {
    sent: AtomicU64,
}

impl DryRunClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl DeliveryClient for DryRunClient {
    fn send(&self, recipient: &str, payload: &str) -> DeliveryOutcome {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        info!(recipient, chars = payload.chars().count(), "dry run: message not sent");
        DeliveryOutcome::Delivered {
            message_id: format!("dry-run-{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_each_message() {
        let client = DryRunClient::new();
        assert_eq!(
            client.send("+254700000000", "a"),
            DeliveryOutcome::Delivered {
                message_id: "dry-run-1".into()
            }
        );
        client.send("+254700000000", "b");
        assert_eq!(client.sent(), 2);
    }
}
