//! Core data models for the escrow system
//!
//! Ledger entries, listings, users, disputes and the audit trail.
//! Transition rules for [`TransactionStatus`] live in [`crate::lifecycle`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EscrowError;

/// Telegram user id
pub type TelegramId = i64;

/// Supported payment currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usdt,
    Eth,
    Btc,
    Ton,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Usdt => "USDT",
            Self::Eth => "ETH",
            Self::Btc => "BTC",
            Self::Ton => "TON",
        };
        f.write_str(code)
    }
}

impl FromStr for Currency {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USDT" => Ok(Self::Usdt),
            "ETH" => Ok(Self::Eth),
            "BTC" => Ok(Self::Btc),
            "TON" => Ok(Self::Ton),
            other => Err(EscrowError::validation(format!(
                "Unsupported currency: {}",
                other
            ))),
        }
    }
}

/// Escrow transaction state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, awaiting payment
    Pending,
    /// Payment confirmed and held in escrow
    Funded,
    /// Seller has started handing over the group
    TransferPending,
    /// Oracle confirmed the buyer, release in progress
    Verifying,
    /// Under arbitration
    Disputed,
    /// Funds released to seller
    Released,
    /// Funds returned to buyer
    Refunded,
    /// Funds split by an arbitrator
    ResolvedPartial,
}

impl TransactionStatus {
    /// All states, in lifecycle order
    pub const ALL: [TransactionStatus; 8] = [
        Self::Pending,
        Self::Funded,
        Self::TransferPending,
        Self::Verifying,
        Self::Disputed,
        Self::Released,
        Self::Refunded,
        Self::ResolvedPartial,
    ];

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::ResolvedPartial)
    }

    /// Check if the transfer deadline applies in this state
    pub fn is_deadline_bound(&self) -> bool {
        matches!(self, Self::Funded | Self::TransferPending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for TransactionStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "funded" => Ok(Self::Funded),
            "transfer_pending" => Ok(Self::TransferPending),
            "verifying" => Ok(Self::Verifying),
            "disputed" => Ok(Self::Disputed),
            "released" => Ok(Self::Released),
            "refunded" => Ok(Self::Refunded),
            "resolved_partial" => Ok(Self::ResolvedPartial),
            other => Err(EscrowError::validation(format!("Unknown status: {}", other))),
        }
    }
}

/// Escrow ledger entry: one per purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,

    // Parties
    pub buyer_id: TelegramId,
    pub seller_id: TelegramId,
    pub listing_id: Uuid,

    // Payment
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub payment_ref: Option<String>,
    /// Hosted charge id at the gateway
    pub charge_id: Option<String>,
    pub charge_url: Option<String>,

    // Dispute
    pub dispute_reason: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a new pending transaction
    pub fn new(
        buyer_id: TelegramId,
        seller_id: TelegramId,
        listing_id: Uuid,
        amount: Decimal,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            seller_id,
            listing_id,
            amount,
            currency,
            status: TransactionStatus::Pending,
            payment_ref: None,
            charge_id: None,
            charge_url: None,
            dispute_reason: None,
            created_at: now,
            updated_at: now,
            funded_at: None,
            deadline: None,
            completed_at: None,
        }
    }

    /// Whether the given user is buyer or seller
    pub fn is_party(&self, telegram_id: TelegramId) -> bool {
        self.buyer_id == telegram_id || self.seller_id == telegram_id
    }

    /// Whether the transfer deadline has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now > d).unwrap_or(false)
    }
}

/// Listing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Active,
    Sold,
    Suspended,
}

/// Listing category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Crypto,
    Trading,
    Tech,
    Business,
    Education,
    Entertainment,
    Other,
}

impl Default for Category {
    fn default() -> Self {
        Self::Other
    }
}

/// A Telegram group offered for sale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub owner_id: TelegramId,

    // Group
    pub group_id: i64,
    pub group_username: Option<String>,
    pub title: String,
    pub description: String,
    pub member_count: u32,

    // Offer
    pub price: Decimal,
    pub currency: Currency,
    pub category: Category,

    // Status
    pub verified_ownership: bool,
    pub active: bool,
    pub status: ListingStatus,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

/// User registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Registered,
    Suspended,
}

/// Reputation counters and score for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationStats {
    // Scores (0-1000)
    pub score: i32,
    pub tier: String,

    // As buyer
    pub purchases_completed: u32,
    pub purchases_refunded: u32,
    pub volume_bought: Decimal,

    // As seller
    pub sales_completed: u32,
    pub sales_refunded: u32,
    pub volume_sold: Decimal,

    // Disputes
    pub disputes_opened: u32,
    pub disputes_won: u32,
    pub disputes_lost: u32,
}

impl Default for ReputationStats {
    fn default() -> Self {
        let mut stats = Self {
            score: 500, // Start at intermediate level
            tier: String::new(),
            purchases_completed: 0,
            purchases_refunded: 0,
            volume_bought: Decimal::ZERO,
            sales_completed: 0,
            sales_refunded: 0,
            volume_sold: Decimal::ZERO,
            disputes_opened: 0,
            disputes_won: 0,
            disputes_lost: 0,
        };
        stats.calculate_tier();
        stats
    }
}

impl ReputationStats {
    /// Calculate tier based on score
    pub fn calculate_tier(&mut self) {
        self.tier = match self.score {
            0..=99 => "New",
            100..=299 => "Beginner",
            300..=599 => "Intermediate",
            600..=799 => "Advanced",
            800..=949 => "Trusted",
            950..=1000 => "Elite",
            _ => "New",
        }
        .to_string();
    }

    /// Adjust score, clamped to 0..=1000
    pub fn adjust_score(&mut self, delta: i32) {
        self.score = (self.score + delta).clamp(0, 1000);
        self.calculate_tier();
    }
}

/// Telegram user known to the marketplace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub telegram_id: TelegramId,
    pub username: Option<String>,
    pub registration_status: RegistrationStatus,
    pub reputation_stats: ReputationStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Dispute case status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// Who opened a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "telegram_id")]
pub enum DisputeOpener {
    Party(TelegramId),
    /// Opened automatically after verification escalation
    System,
}

/// Arbitrator ruling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Ruling {
    /// Release funds to seller
    FavorSeller,
    /// Refund buyer in full
    FavorBuyer,
    /// Split: buyer receives `buyer_amount`, seller the rest
    PartialRefund { buyer_amount: Decimal },
}

impl fmt::Display for Ruling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FavorSeller => f.write_str("FavorSeller"),
            Self::FavorBuyer => f.write_str("FavorBuyer"),
            Self::PartialRefund { buyer_amount } => write!(f, "PartialRefund({})", buyer_amount),
        }
    }
}

/// Dispute model for arbitration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub opened_by: DisputeOpener,
    pub reason: String,
    pub evidence: Vec<String>,
    pub status: DisputeStatus,

    // Arbitration
    pub ruling: Option<Ruling>,
    pub arbitrator: Option<String>,
    pub resolution_notes: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// Create new dispute
    pub fn new(
        transaction_id: Uuid,
        opened_by: DisputeOpener,
        reason: String,
        evidence: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            opened_by,
            reason,
            evidence,
            status: DisputeStatus::Open,
            ruling: None,
            arbitrator: None,
            resolution_notes: None,
            created_at: now,
            resolved_at: None,
        }
    }
}

/// Audit trail actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    PaymentEvent,
    PaymentReceived,
    TransferStarted,
    OwnershipVerified,
    VerificationFailed,
    FundsReleased,
    FundsRefunded,
    DisputeOpened,
    DisputeResolved,
    DeadlineExceeded,
}

/// Escrow event for audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub transaction_id: Uuid,
    pub action: AuditAction,
    pub actor: Option<String>,
    pub details: serde_json::Value,

    // Timestamp (immutable)
    pub created_at: DateTime<Utc>,
}

/// Reasons an item lands in the admin queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAlertKind {
    StateConflict,
    VerificationEscalated,
    SettlementFailed,
}

/// Item awaiting manual review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAlert {
    pub id: u64,
    pub transaction_id: Uuid,
    pub kind: AdminAlertKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parsing() {
        assert_eq!("usdt".parse::<Currency>().unwrap(), Currency::Usdt);
        assert_eq!(Currency::Ton.to_string(), "TON");
        assert!("DOGE".parse::<Currency>().is_err());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TransactionStatus::TransferPending).unwrap();
        assert_eq!(json, "\"transfer_pending\"");
        assert_eq!(
            "resolved_partial".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::ResolvedPartial
        );
    }

    #[test]
    fn test_deadline_unset_until_funding() {
        let now = Utc::now();
        let tx = Transaction::new(1, 2, Uuid::new_v4(), Decimal::new(100, 0), Currency::Usdt, now);
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.deadline.is_none());
        assert!(!tx.is_expired(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_reputation_tier_clamped() {
        let mut stats = ReputationStats::default();
        assert_eq!(stats.tier, "Intermediate");
        stats.adjust_score(2_000);
        assert_eq!(stats.score, 1000);
        assert_eq!(stats.tier, "Elite");
        stats.adjust_score(-5_000);
        assert_eq!(stats.score, 0);
        assert_eq!(stats.tier, "New");
    }
}
