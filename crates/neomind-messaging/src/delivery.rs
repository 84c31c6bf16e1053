//! Delivery settlement.
//!
//! Every transferred message is paired with a [`Delivery`] on the receiving
//! side and a [`DeliveryReceipt`] on the sending side. The receiver settles
//! the delivery exactly once; the sender learns the outcome through the
//! receipt. Settling releases flow-control credit, so a delivery must never
//! be left unsettled.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::error::{MessagingError, Result};

static NEXT_DELIVERY_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome applied to a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Message processed successfully
    Accepted,
    /// Message is invalid and must not be redelivered
    Rejected {
        /// Error condition description
        condition: Option<String>,
    },
    /// Message was not processed and may be redelivered elsewhere
    Released,
    /// Message was not processed, with delivery annotations
    Modified {
        /// Whether the delivery attempt counts as failed
        delivery_failed: bool,
        /// Whether the message must not be redelivered to the same receiver
        undeliverable_here: bool,
    },
}

impl DeliveryOutcome {
    /// Create a rejected outcome with an error condition.
    pub fn rejected(condition: impl Into<String>) -> Self {
        DeliveryOutcome::Rejected {
            condition: Some(condition.into()),
        }
    }

    /// Check if the outcome is accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted)
    }

    /// Get the outcome name.
    pub fn type_name(&self) -> &'static str {
        match self {
            DeliveryOutcome::Accepted => "accepted",
            DeliveryOutcome::Rejected { .. } => "rejected",
            DeliveryOutcome::Released => "released",
            DeliveryOutcome::Modified { .. } => "modified",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Rejected {
                condition: Some(condition),
            } => write!(f, "rejected ({})", condition),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

struct SettleState {
    tx: Option<oneshot::Sender<DeliveryOutcome>>,
    outcome: Option<DeliveryOutcome>,
}

/// Receiving side of a transfer.
pub struct Delivery {
    id: u64,
    state: Mutex<SettleState>,
}

impl Delivery {
    /// Create a delivery and the receipt its sender waits on.
    pub fn channel() -> (Self, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            id: NEXT_DELIVERY_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SettleState {
                tx: Some(tx),
                outcome: None,
            }),
        };
        (delivery, DeliveryReceipt { rx })
    }

    /// Get the delivery ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Settle the delivery.
    ///
    /// Fails with [`MessagingError::AlreadySettled`] on any call after the
    /// first; the first outcome stays in effect.
    pub fn settle(&self, outcome: DeliveryOutcome) -> Result<()> {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return Err(MessagingError::AlreadySettled);
        }
        state.outcome = Some(outcome.clone());
        if let Some(tx) = state.tx.take() {
            // The sender may have given up waiting
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    /// Accept the delivery.
    pub fn accept(&self) -> Result<()> {
        self.settle(DeliveryOutcome::Accepted)
    }

    /// Reject the delivery with an error condition.
    pub fn reject(&self, condition: impl Into<String>) -> Result<()> {
        self.settle(DeliveryOutcome::rejected(condition))
    }

    /// Release the delivery.
    pub fn release(&self) -> Result<()> {
        self.settle(DeliveryOutcome::Released)
    }

    /// Check if the delivery has been settled.
    pub fn is_settled(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Get the outcome the delivery was settled with.
    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        self.state.lock().outcome.clone()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Sending side of a transfer.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    /// Wait for the receiver to settle the delivery.
    ///
    /// A delivery dropped without being settled yields a send failure.
    pub async fn outcome(self) -> Result<DeliveryOutcome> {
        self.rx.await.map_err(|_| {
            MessagingError::SendFailed("delivery dropped without settlement".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settle_once() {
        let (delivery, receipt) = Delivery::channel();
        assert!(!delivery.is_settled());

        delivery.accept().unwrap();
        assert!(matches!(
            delivery.release(),
            Err(MessagingError::AlreadySettled)
        ));

        assert_eq!(delivery.outcome(), Some(DeliveryOutcome::Accepted));
        assert_eq!(receipt.outcome().await.unwrap(), DeliveryOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_dropped_delivery_fails_receipt() {
        let (delivery, receipt) = Delivery::channel();
        drop(delivery);

        assert!(matches!(
            receipt.outcome().await,
            Err(MessagingError::SendFailed(_))
        ));
    }

    #[test]
    fn test_settle_after_receipt_dropped() {
        let (delivery, receipt) = Delivery::channel();
        drop(receipt);

        assert!(delivery.reject("malformed").is_ok());
        assert_eq!(
            delivery.outcome().unwrap().to_string(),
            "rejected (malformed)"
        );
    }
}
