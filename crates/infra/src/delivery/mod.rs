//! Outbound delivery: the SMS gateway seam.
//!
//! Gateway failures are values (`DeliveryOutcome`), never errors: the dispatch
//! worker decides what each outcome means for the job.

pub mod dry_run;
pub mod gateway;

use std::sync::Arc;

use courier_observability::DeliveryResult;

pub use dry_run::DryRunClient;
pub use gateway::{GatewayConfig, HttpGatewayClient, classify_response, normalize_phone};

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Gateway accepted the message.
    Delivered { message_id: String },
    /// Gateway refused the message (bad number, blacklisted, ...).
    Rejected(String),
    /// Attempt failed for a reason that may not recur.
    TransientError(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// Failure reason, None when delivered.
    pub fn reason(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Rejected(r) | DeliveryOutcome::TransientError(r) => Some(r),
        }
    }

    pub fn result(&self) -> DeliveryResult {
        match self {
            DeliveryOutcome::Delivered { .. } => DeliveryResult::Delivered,
            DeliveryOutcome::Rejected(_) => DeliveryResult::Rejected,
            DeliveryOutcome::TransientError(_) => DeliveryResult::Transient,
        }
    }
}

/// Sends one message to one recipient.
///
/// Implementations must bound the call with a timeout: a dispatch worker
/// cannot be cancelled while a send is in flight.
pub trait DeliveryClient: Send + Sync {
    fn send(&self, recipient: &str, payload: &str) -> DeliveryOutcome;
}

impl<C: DeliveryClient + ?Sized> DeliveryClient for Arc<C> {
    fn send(&self, recipient: &str, payload: &str) -> DeliveryOutcome {
        (**self).send(recipient, payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("gateway client configuration error: {0}")]
    Config(String),
}
