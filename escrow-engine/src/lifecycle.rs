//! Escrow state machine
//!
//! ```text
//! pending --payment_confirmed--> funded --transfer_started--> transfer_pending
//! transfer_pending --ownership_verified--> verifying --funds_released--> released
//! (any non-terminal) --dispute_opened--> disputed
//! disputed --payment_confirmed--> disputed (records funding once)
//! disputed --admin_decision--> released | refunded | resolved_partial
//! funded | transfer_pending --deadline_exceeded--> refunded
//! funded --listing_unavailable--> refunded
//! ```

use chrono::{DateTime, Utc};
use std::fmt;

use crate::{
    error::EscrowError,
    models::{Ruling, Transaction, TransactionStatus},
    EscrowResult,
};

/// Something that can move a transaction between states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Gateway reported a confirmed payment
    PaymentConfirmed,
    /// Seller began handing over the group
    TransferStarted,
    /// Oracle confirmed the buyer owns the group
    OwnershipVerified,
    /// Settlement rail paid out the seller
    FundsReleased,
    /// Either party (or the system) opened a dispute
    DisputeOpened,
    /// Arbitrator ruling
    AdminDecision(Ruling),
    /// Sweeper found the transfer deadline passed
    DeadlineExceeded,
    /// Another purchase already holds the listing
    ListingUnavailable,
}

impl Trigger {
    /// Stable name, used for dedup keys and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::PaymentConfirmed => "payment_confirmed",
            Self::TransferStarted => "transfer_started",
            Self::OwnershipVerified => "ownership_verified",
            Self::FundsReleased => "funds_released",
            Self::DisputeOpened => "dispute_opened",
            Self::AdminDecision(_) => "admin_decision",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ListingUnavailable => "listing_unavailable",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transition table. `None` means the trigger is illegal in `from`.
pub fn next_status(from: TransactionStatus, trigger: &Trigger) -> Option<TransactionStatus> {
    use TransactionStatus::*;

    match (from, trigger) {
        (Pending, Trigger::PaymentConfirmed) => Some(Funded),
        (Funded, Trigger::TransferStarted) => Some(TransferPending),
        (TransferPending, Trigger::OwnershipVerified) => Some(Verifying),
        (Verifying, Trigger::FundsReleased) => Some(Released),
        (Pending | Funded | TransferPending | Verifying, Trigger::DisputeOpened) => Some(Disputed),
        (Disputed, Trigger::PaymentConfirmed) => Some(Disputed),
        (Disputed, Trigger::AdminDecision(ruling)) => Some(match ruling {
            Ruling::FavorSeller => Released,
            Ruling::FavorBuyer => Refunded,
            Ruling::PartialRefund { .. } => ResolvedPartial,
        }),
        (Funded | TransferPending, Trigger::DeadlineExceeded) => Some(Refunded),
        (Funded, Trigger::ListingUnavailable) => Some(Refunded),
        _ => None,
    }
}

impl Transaction {
    /// Apply a trigger, returning the previous status.
    ///
    /// Terminal transactions are immutable. Rulings that pay the seller are
    /// refused for transactions that were never funded, and a payment is
    /// only recorded once.
    pub fn apply(&mut self, trigger: &Trigger, now: DateTime<Utc>) -> EscrowResult<TransactionStatus> {
        let from = self.status;

        if from.is_terminal() {
            return Err(EscrowError::state_conflict(
                from.to_string(),
                trigger.to_string(),
                "transaction is terminal".to_string(),
            ));
        }

        if matches!(trigger, Trigger::PaymentConfirmed) && self.funded_at.is_some() {
            return Err(EscrowError::state_conflict(
                from.to_string(),
                trigger.to_string(),
                "payment already recorded".to_string(),
            ));
        }

        if let Trigger::AdminDecision(ruling) = trigger {
            if self.funded_at.is_none() && !matches!(ruling, Ruling::FavorBuyer) {
                return Err(EscrowError::state_conflict(
                    from.to_string(),
                    trigger.to_string(),
                    format!("ruling {} requires a funded transaction", ruling),
                ));
            }
        }

        let to = next_status(from, trigger).ok_or_else(|| {
            EscrowError::state_conflict(
                from.to_string(),
                trigger.to_string(),
                "transition not in lifecycle graph".to_string(),
            )
        })?;

        self.status = to;
        self.updated_at = now;

        if matches!(trigger, Trigger::PaymentConfirmed) {
            self.funded_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }

        Ok(from)
    }
}
