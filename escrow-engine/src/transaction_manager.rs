//! Transaction Manager - Coordinates escrow lifecycle and state transitions
//!
//! This module owns the escrow ledger. Every transaction lives behind its own
//! lock; gateway events, seller actions, oracle results, arbitrator rulings
//! and the deadline sweep all funnel through [`Transaction::apply`] here, and
//! each accepted change is written to the audit trail. Rejected transitions
//! and escalations land in the admin queue.
//!
//! A listing is claimed by the first purchase that gets funded. Any other
//! purchase of the same listing that is paid afterwards is refunded.

use crate::EscrowResult;
use crate::{
    clock::Clock,
    error::EscrowError,
    lifecycle::{next_status, Trigger},
    listing_registry::ListingRegistry,
    models::{
        AdminAlert, AdminAlertKind, AuditAction, AuditEntry, Currency, Dispute, DisputeOpener,
        DisputeStatus, Ruling, TelegramId, Transaction, TransactionStatus,
    },
    ownership::{GroupRef, OwnershipVerifier, RetryPolicy, VerifierConfig},
    payment_gateway::{GatewayEvent, PaymentGateway},
    settlement::{Payout, PayoutKind, SettlementConfig, SettlementRail},
    user_registry::UserRegistry,
};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

/// Configuration for the transaction manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Hours the seller has to hand over the group once funded
    pub transfer_window_hours: i64,
    /// Largest amount accepted for a single transaction
    pub max_amount: Decimal,
    /// Only ownership-verified listings can be purchased
    pub require_verified_listings: bool,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            transfer_window_hours: 168, // 1 week
            max_amount: Decimal::from(1_000_000),
            require_verified_listings: true,
        }
    }
}

/// How transfer confirmation consults the oracle
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    pub require_creator: bool,
    pub retry: RetryPolicy,
}

impl From<&VerifierConfig> for VerificationPolicy {
    fn from(config: &VerifierConfig) -> Self {
        Self {
            require_creator: config.require_creator,
            retry: config.retry.clone(),
        }
    }
}

/// Collaborators the manager drives
#[derive(Clone)]
pub struct EscrowServices {
    pub listings: Arc<ListingRegistry>,
    pub users: Arc<UserRegistry>,
    pub verifier: Arc<dyn OwnershipVerifier>,
    pub settlement: Arc<dyn SettlementRail>,
    /// Charges are only created when a gateway client is present
    pub gateway: Option<Arc<PaymentGateway>>,
    pub clock: Arc<dyn Clock>,
}

/// Transaction creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub buyer_id: TelegramId,
    pub listing_id: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
}

/// Filter for listing transactions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionQuery {
    /// Buyer or seller
    pub party: Option<TelegramId>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<usize>,
}

/// Outcome of an arbitrator ruling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub transaction: Transaction,
    pub dispute: Dispute,
    pub payouts: Vec<Payout>,
}

/// Ledger entry plus the bookkeeping that must change atomically with it
struct LedgerEntry {
    tx: Transaction,
    dispute: Option<Dispute>,
    /// Gateway event ids already processed
    seen_events: HashSet<String>,
    /// Gateway event ids delivered at least once, processed or not
    delivered_events: HashSet<String>,
    /// Gateway triggers already applied (transaction id + event type)
    applied_events: HashSet<String>,
    /// Payouts already executed at the rail
    paid: HashSet<PayoutKind>,
}

impl LedgerEntry {
    fn new(tx: Transaction) -> Self {
        Self {
            tx,
            dispute: None,
            seen_events: HashSet::new(),
            delivered_events: HashSet::new(),
            applied_events: HashSet::new(),
            paid: HashSet::new(),
        }
    }
}

/// Main transaction manager that coordinates the escrow lifecycle
pub struct TransactionManager {
    config: TransactionManagerConfig,
    fees: SettlementConfig,
    policy: VerificationPolicy,
    services: EscrowServices,
    /// The map lock is only held to look up or insert entries
    ledger: RwLock<HashMap<Uuid, Arc<Mutex<LedgerEntry>>>>,
    /// Listing id to the funded transaction holding it. Taken while an
    /// entry lock is held; never held while waiting for one.
    claims: RwLock<HashMap<Uuid, Uuid>>,
    audit: RwLock<Vec<AuditEntry>>,
    alerts: RwLock<Vec<AdminAlert>>,
    next_audit_id: AtomicU64,
    next_alert_id: AtomicU64,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(
        config: TransactionManagerConfig,
        fees: SettlementConfig,
        policy: VerificationPolicy,
        services: EscrowServices,
    ) -> Self {
        Self {
            config,
            fees,
            policy,
            services,
            ledger: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            audit: RwLock::new(Vec::new()),
            alerts: RwLock::new(Vec::new()),
            next_audit_id: AtomicU64::new(1),
            next_alert_id: AtomicU64::new(1),
        }
    }

    /// Open a purchase of a listing
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> EscrowResult<Transaction> {
        info!(
            "Creating transaction for listing {} by buyer {}",
            request.listing_id, request.buyer_id
        );

        self.validate_create_request(&request)?;

        let listing = self.services.listings.get_listing(request.listing_id).await?;
        if !listing.active {
            return Err(EscrowError::validation(format!(
                "Listing {} is not available",
                listing.id
            )));
        }
        if self.config.require_verified_listings && !listing.verified_ownership {
            return Err(EscrowError::validation(format!(
                "Listing {} has not been ownership-verified",
                listing.id
            )));
        }
        if request.currency != listing.currency {
            return Err(EscrowError::validation(format!(
                "Listing {} is priced in {}, not {}",
                listing.id, listing.currency, request.currency
            )));
        }
        if request.buyer_id == listing.owner_id {
            return Err(EscrowError::validation("Buyer and seller must be different users"));
        }

        self.services.users.require_registered(request.buyer_id).await?;
        self.services.users.require_registered(listing.owner_id).await?;

        if self.listing_claimed(listing.id).await {
            return Err(EscrowError::validation(format!(
                "Listing {} already has a funded purchase in progress",
                listing.id
            )));
        }

        let mut tx = Transaction::new(
            request.buyer_id,
            listing.owner_id,
            listing.id,
            request.amount,
            request.currency,
            self.services.clock.now(),
        );

        if let Some(gateway) = &self.services.gateway {
            if let Some(charge) = gateway.create_charge(&tx, &listing).await? {
                tx.charge_id = Some(charge.id);
                tx.charge_url = Some(charge.hosted_url);
            }
        }

        self.ledger
            .write()
            .await
            .insert(tx.id, Arc::new(Mutex::new(LedgerEntry::new(tx.clone()))));

        self.record_audit(
            tx.id,
            AuditAction::Created,
            Some(format!("buyer:{}", tx.buyer_id)),
            serde_json::json!({
                "listing_id": tx.listing_id,
                "amount": tx.amount,
                "currency": tx.currency,
            }),
        )
        .await;

        info!("Created transaction {}", tx.id);

        Ok(tx)
    }

    /// Apply an authenticated gateway event.
    ///
    /// Repeated deliveries (same event id, or the same trigger for the same
    /// transaction) leave the ledger untouched and report `DuplicateEvent`.
    /// A payment for a transaction that already closed unfunded is sent
    /// back to the buyer. A payment during an unfunded dispute funds the
    /// dispute. A payment for a listing another purchase holds is refunded.
    pub async fn apply_gateway_event(&self, event: GatewayEvent) -> EscrowResult<Transaction> {
        let entry = self.entry(event.transaction_id).await?;
        let mut entry = entry.lock().await;

        let key = event.dedup_key();
        if entry.seen_events.contains(&event.event_id) || entry.applied_events.contains(&key) {
            info!(
                "Ignoring duplicate {} event {} for transaction {}",
                key, event.event_id, event.transaction_id
            );
            return Err(EscrowError::duplicate_event(
                event.transaction_id.to_string(),
                key,
            ));
        }

        // Retried deliveries are audited once
        if entry.delivered_events.insert(event.event_id.clone()) {
            self.record_audit(
                entry.tx.id,
                AuditAction::PaymentEvent,
                Some("gateway".to_string()),
                serde_json::json!({
                    "event_id": event.event_id,
                    "type": event.kind.name(),
                }),
            )
            .await;
        }

        let Some(trigger) = event.trigger() else {
            entry.seen_events.insert(event.event_id);
            return Ok(entry.tx.clone());
        };

        // Not marked as seen on failure so the sender can retry
        if entry.tx.status.is_terminal() && entry.tx.funded_at.is_none() {
            self.refund_late_payment(&mut entry, &event).await?;
        } else if entry.tx.status == TransactionStatus::Disputed {
            self.fund_dispute(&mut entry, &event, &trigger).await?;
        } else {
            self.fund(&mut entry, &event, &trigger).await?;
        }

        entry.seen_events.insert(event.event_id);
        entry.applied_events.insert(key);

        Ok(entry.tx.clone())
    }

    /// Seller reports the group handover has begun
    pub async fn start_transfer(
        &self,
        transaction_id: Uuid,
        seller_id: TelegramId,
    ) -> EscrowResult<Transaction> {
        let entry = self.entry(transaction_id).await?;
        let mut entry = entry.lock().await;

        if entry.tx.seller_id != seller_id {
            return Err(EscrowError::unauthorized(
                "Only the seller can start the transfer",
            ));
        }
        self.ensure_before_deadline(&entry.tx)?;

        if entry.tx.status == TransactionStatus::Funded && !self.holds_claim(&entry.tx).await {
            return Err(EscrowError::state_conflict(
                entry.tx.status.to_string(),
                Trigger::TransferStarted.to_string(),
                format!("listing {} is held by another purchase", entry.tx.listing_id),
            ));
        }

        self.transition(&mut entry.tx, &Trigger::TransferStarted).await?;

        self.record_audit(
            transaction_id,
            AuditAction::TransferStarted,
            Some(format!("seller:{}", seller_id)),
            serde_json::Value::Null,
        )
        .await;

        Ok(entry.tx.clone())
    }

    /// Ask the oracle whether the buyer now owns the group, then release.
    ///
    /// The oracle is consulted without holding the transaction lock. If it
    /// cannot answer after retries, the transaction escalates to a
    /// system-opened dispute and is returned in `disputed`.
    pub async fn confirm_transfer(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        let entry = self.entry(transaction_id).await?;

        let tx = {
            let guard = entry.lock().await;
            if next_status(guard.tx.status, &Trigger::OwnershipVerified).is_none() {
                return Err(EscrowError::state_conflict(
                    guard.tx.status.to_string(),
                    Trigger::OwnershipVerified.to_string(),
                    "transfer has not been started".to_string(),
                ));
            }
            self.ensure_before_deadline(&guard.tx)?;
            guard.tx.clone()
        };

        let listing = self.services.listings.get_listing(tx.listing_id).await?;
        let group = GroupRef {
            chat_id: listing.group_id,
            username: listing.group_username,
        };

        let verifier = self.services.verifier.clone();
        let outcome = self
            .policy
            .retry
            .run("ownership check", || verifier.check(&group, tx.buyer_id))
            .await;

        let mut entry = entry.lock().await;
        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                error!(
                    "Ownership verification for transaction {} failed: {}",
                    transaction_id, e
                );
                self.escalate(&mut entry, &e).await?;
                return Ok(entry.tx.clone());
            }
        };

        if !status.confers_ownership(self.policy.require_creator) {
            self.record_audit(
                transaction_id,
                AuditAction::VerificationFailed,
                Some("oracle".to_string()),
                serde_json::json!({
                    "is_admin": status.is_admin,
                    "is_creator": status.is_creator,
                }),
            )
            .await;
            return Err(EscrowError::ownership_unverified(format!(
                "Buyer {} does not own group {} yet",
                tx.buyer_id, listing.group_id
            )));
        }

        // Someone else may have moved the transaction meanwhile
        self.transition(&mut entry.tx, &Trigger::OwnershipVerified)
            .await?;
        self.record_audit(
            transaction_id,
            AuditAction::OwnershipVerified,
            Some("oracle".to_string()),
            serde_json::json!({ "is_creator": status.is_creator }),
        )
        .await;

        self.release_verified(&mut entry).await?;

        Ok(entry.tx.clone())
    }

    /// Open a dispute. A transaction already in dispute returns its dispute.
    pub async fn open_dispute(
        &self,
        transaction_id: Uuid,
        opened_by: DisputeOpener,
        reason: String,
        evidence: Vec<String>,
    ) -> EscrowResult<Dispute> {
        if reason.trim().is_empty() {
            return Err(EscrowError::validation("Dispute reason cannot be empty"));
        }

        let entry = self.entry(transaction_id).await?;
        let mut entry = entry.lock().await;

        if let DisputeOpener::Party(id) = opened_by {
            if !entry.tx.is_party(id) {
                return Err(EscrowError::unauthorized(
                    "Only the buyer or seller can open a dispute",
                ));
            }
        }

        self.open_dispute_locked(&mut entry, opened_by, reason, evidence)
            .await
    }

    /// Apply an arbitrator ruling and execute the resulting payouts
    pub async fn resolve_dispute(
        &self,
        transaction_id: Uuid,
        ruling: Ruling,
        arbitrator: String,
        notes: Option<String>,
    ) -> EscrowResult<Resolution> {
        let entry = self.entry(transaction_id).await?;
        let mut entry = entry.lock().await;

        // Dry run first so nothing is paid for an illegal ruling
        let mut candidate = entry.tx.clone();
        self.transition(&mut candidate, &Trigger::AdminDecision(ruling.clone()))
            .await?;

        let payouts = if entry.tx.funded_at.is_some() {
            self.fees.ruling_payouts(&entry.tx, &ruling)?
        } else {
            Vec::new()
        };

        if !payouts.is_empty() {
            if let Err(e) = self
                .services
                .settlement
                .resolve(transaction_id, &ruling)
                .await
            {
                warn!("Rail did not record ruling for {}: {}", transaction_id, e);
            }
        }
        for payout in &payouts {
            self.pay(&mut entry, payout).await?;
        }

        let now = self.services.clock.now();
        entry.tx = candidate;
        let dispute = entry
            .dispute
            .as_mut()
            .ok_or_else(|| EscrowError::internal("Disputed transaction has no dispute"))?;
        dispute.status = DisputeStatus::Resolved;
        dispute.ruling = Some(ruling.clone());
        dispute.arbitrator = Some(arbitrator.clone());
        dispute.resolution_notes = notes;
        dispute.resolved_at = Some(now);
        let dispute = dispute.clone();

        self.record_audit(
            transaction_id,
            AuditAction::DisputeResolved,
            Some(format!("admin:{}", arbitrator)),
            serde_json::json!({
                "ruling": ruling,
                "status": entry.tx.status,
            }),
        )
        .await;
        for payout in &payouts {
            let action = match payout.kind {
                PayoutKind::SellerRelease => AuditAction::FundsReleased,
                PayoutKind::BuyerRefund => AuditAction::FundsRefunded,
            };
            self.record_audit(
                transaction_id,
                action,
                Some(format!("admin:{}", arbitrator)),
                serde_json::to_value(payout)?,
            )
            .await;
        }

        let users = &self.services.users;
        users.record_dispute_outcome(&entry.tx, &ruling).await?;
        match ruling {
            Ruling::FavorSeller => {
                users.record_completion(&entry.tx).await?;
                if let Err(e) = self.services.listings.mark_sold(entry.tx.listing_id).await {
                    warn!("Could not mark listing {} sold: {}", entry.tx.listing_id, e);
                }
            }
            Ruling::FavorBuyer if entry.tx.funded_at.is_some() => {
                users.record_refund(&entry.tx).await?
            }
            _ => {}
        }
        if entry.tx.status != TransactionStatus::Released {
            self.release_claim(&entry.tx).await;
        }

        info!(
            "Resolved dispute on transaction {} with {}",
            transaction_id, ruling
        );

        let resolution = Resolution {
            transaction: entry.tx.clone(),
            dispute,
            payouts,
        };
        drop(entry);

        // Close the hosted checkout so the buyer cannot pay a closed transaction
        if resolution.transaction.funded_at.is_none() {
            self.cancel_open_charge(&resolution.transaction).await;
        }

        Ok(resolution)
    }

    /// Refund every funded transaction whose transfer deadline has passed
    pub async fn sweep_expired(&self) -> EscrowResult<Vec<Transaction>> {
        let now = self.services.clock.now();
        let mut refunded = Vec::new();

        for entry in self.snapshot().await {
            let mut entry = entry.lock().await;
            if !entry.tx.status.is_deadline_bound() || !entry.tx.is_expired(now) {
                continue;
            }

            let transaction_id = entry.tx.id;
            warn!(
                "Transaction {} passed its transfer deadline {:?}",
                transaction_id, entry.tx.deadline
            );

            let payout = self.fees.refund_payout(&entry.tx, entry.tx.amount);
            if let Err(e) = self.pay(&mut entry, &payout).await {
                error!("Refund for expired transaction {} failed: {}", transaction_id, e);
                continue;
            }

            self.transition(&mut entry.tx, &Trigger::DeadlineExceeded)
                .await?;

            self.record_audit(
                transaction_id,
                AuditAction::DeadlineExceeded,
                Some("system".to_string()),
                serde_json::json!({ "deadline": entry.tx.deadline }),
            )
            .await;
            self.record_audit(
                transaction_id,
                AuditAction::FundsRefunded,
                Some("system".to_string()),
                serde_json::to_value(&payout)?,
            )
            .await;

            self.services.users.record_refund(&entry.tx).await?;
            self.release_claim(&entry.tx).await;
            refunded.push(entry.tx.clone());
        }

        if !refunded.is_empty() {
            info!("Refunded {} expired transactions", refunded.len());
        }

        Ok(refunded)
    }

    /// Refund funded purchases whose listing is held by another purchase.
    ///
    /// Picks up refunds that failed when the payment arrived. A purchase
    /// whose competitor has since been refunded takes over the listing.
    pub async fn refund_superseded_purchases(&self) -> EscrowResult<Vec<Transaction>> {
        let mut refunded = Vec::new();

        for entry in self.snapshot().await {
            let mut entry = entry.lock().await;
            if entry.tx.status != TransactionStatus::Funded || self.claim_listing(&entry.tx).await {
                continue;
            }

            match self.refund_superseded(&mut entry).await {
                Ok(()) => refunded.push(entry.tx.clone()),
                Err(e) => warn!("Refund for superseded {} still failing: {}", entry.tx.id, e),
            }
        }

        Ok(refunded)
    }

    /// Retry seller payouts that failed after ownership was verified
    pub async fn resume_stalled_releases(&self) -> EscrowResult<Vec<Transaction>> {
        let mut released = Vec::new();

        for entry in self.snapshot().await {
            let mut entry = entry.lock().await;
            if entry.tx.status != TransactionStatus::Verifying {
                continue;
            }

            match self.release_verified(&mut entry).await {
                Ok(()) => released.push(entry.tx.clone()),
                Err(e) => warn!("Release for {} still failing: {}", entry.tx.id, e),
            }
        }

        Ok(released)
    }

    /// Get a transaction
    pub async fn get_transaction(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        let entry = self.entry(transaction_id).await?;
        let tx = entry.lock().await.tx.clone();
        Ok(tx)
    }

    /// Transactions matching a filter, newest first
    pub async fn list_transactions(&self, query: &TransactionQuery) -> Vec<Transaction> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let mut transactions = Vec::new();

        for entry in self.snapshot().await {
            let tx = entry.lock().await.tx.clone();
            if query.party.map_or(true, |p| tx.is_party(p))
                && query.status.map_or(true, |s| tx.status == s)
            {
                transactions.push(tx);
            }
        }

        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        transactions.truncate(limit);
        transactions
    }

    /// The dispute attached to a transaction
    pub async fn get_dispute(&self, transaction_id: Uuid) -> EscrowResult<Dispute> {
        let entry = self.entry(transaction_id).await?;
        let dispute = entry.lock().await.dispute.clone();
        dispute.ok_or_else(|| {
            EscrowError::not_found(format!("No dispute for transaction {}", transaction_id))
        })
    }

    /// Audit trail for a transaction, oldest first
    pub async fn transaction_audit(&self, transaction_id: Uuid) -> Vec<AuditEntry> {
        self.audit
            .read()
            .await
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    /// Items awaiting manual review, oldest first
    pub async fn admin_alerts(&self) -> Vec<AdminAlert> {
        self.alerts.read().await.clone()
    }

    async fn entry(&self, transaction_id: Uuid) -> EscrowResult<Arc<Mutex<LedgerEntry>>> {
        self.ledger
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| {
                EscrowError::not_found(format!("Transaction {} not found", transaction_id))
            })
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<LedgerEntry>>> {
        self.ledger.read().await.values().cloned().collect()
    }

    /// Whether a funded purchase currently holds the listing
    pub async fn listing_claimed(&self, listing_id: Uuid) -> bool {
        self.claims.read().await.contains_key(&listing_id)
    }

    /// Reserve the listing for `tx`; false when another purchase holds it
    async fn claim_listing(&self, tx: &Transaction) -> bool {
        let mut claims = self.claims.write().await;
        *claims.entry(tx.listing_id).or_insert(tx.id) == tx.id
    }

    async fn holds_claim(&self, tx: &Transaction) -> bool {
        self.claims.read().await.get(&tx.listing_id) == Some(&tx.id)
    }

    /// Free the listing after `tx` closed without a sale
    async fn release_claim(&self, tx: &Transaction) {
        let mut claims = self.claims.write().await;
        if claims.get(&tx.listing_id) == Some(&tx.id) {
            claims.remove(&tx.listing_id);
        }
    }

    /// Apply a trigger; rejected transitions go to the admin queue
    async fn transition(&self, tx: &mut Transaction, trigger: &Trigger) -> EscrowResult<()> {
        match tx.apply(trigger, self.services.clock.now()) {
            Ok(from) => {
                info!("Transaction {}: {} --{}--> {}", tx.id, from, trigger, tx.status);
                Ok(())
            }
            Err(e) => {
                if matches!(e, EscrowError::StateConflict { .. }) {
                    warn!("Rejected transition for {}: {}", tx.id, e);
                    self.raise_alert(tx.id, AdminAlertKind::StateConflict, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    fn ensure_before_deadline(&self, tx: &Transaction) -> EscrowResult<()> {
        if tx.is_expired(self.services.clock.now()) {
            return Err(EscrowError::deadline_exceeded(format!(
                "Transfer deadline for transaction {} has passed",
                tx.id
            )));
        }
        Ok(())
    }

    async fn open_dispute_locked(
        &self,
        entry: &mut LedgerEntry,
        opened_by: DisputeOpener,
        reason: String,
        evidence: Vec<String>,
    ) -> EscrowResult<Dispute> {
        if entry.tx.status == TransactionStatus::Disputed {
            if let Some(dispute) = &entry.dispute {
                return Ok(dispute.clone());
            }
        }
        self.ensure_before_deadline(&entry.tx)?;

        self.transition(&mut entry.tx, &Trigger::DisputeOpened).await?;

        let now = self.services.clock.now();
        let dispute = Dispute::new(entry.tx.id, opened_by, reason.clone(), evidence, now);
        entry.tx.dispute_reason = Some(reason);
        entry.dispute = Some(dispute.clone());

        if entry.tx.funded_at.is_some() {
            if let Err(e) = self.services.settlement.dispute(entry.tx.id).await {
                warn!("Rail did not freeze funds for {}: {}", entry.tx.id, e);
            }
        }

        let actor = match opened_by {
            DisputeOpener::Party(id) => {
                self.services.users.record_dispute_opened(id).await?;
                format!("party:{}", id)
            }
            DisputeOpener::System => "system".to_string(),
        };
        self.record_audit(
            entry.tx.id,
            AuditAction::DisputeOpened,
            Some(actor),
            serde_json::json!({ "dispute_id": dispute.id, "reason": dispute.reason }),
        )
        .await;

        warn!("Dispute {} opened on transaction {}", dispute.id, entry.tx.id);

        Ok(dispute)
    }

    /// Oracle could not answer: hand the transaction to an arbitrator
    async fn escalate(&self, entry: &mut LedgerEntry, cause: &EscrowError) -> EscrowResult<()> {
        self.record_audit(
            entry.tx.id,
            AuditAction::VerificationFailed,
            Some("oracle".to_string()),
            serde_json::json!({ "error": cause.to_string() }),
        )
        .await;

        if entry.tx.status != TransactionStatus::TransferPending {
            return Ok(());
        }

        let reason = format!("Ownership verification failed: {}", cause);
        self.transition(&mut entry.tx, &Trigger::DisputeOpened).await?;

        let dispute = Dispute::new(
            entry.tx.id,
            DisputeOpener::System,
            reason.clone(),
            Vec::new(),
            self.services.clock.now(),
        );
        entry.tx.dispute_reason = Some(reason.clone());
        entry.dispute = Some(dispute.clone());

        if let Err(e) = self.services.settlement.dispute(entry.tx.id).await {
            warn!("Rail did not freeze funds for {}: {}", entry.tx.id, e);
        }

        self.record_audit(
            entry.tx.id,
            AuditAction::DisputeOpened,
            Some("system".to_string()),
            serde_json::json!({ "dispute_id": dispute.id, "reason": reason }),
        )
        .await;
        self.raise_alert(entry.tx.id, AdminAlertKind::VerificationEscalated, reason)
            .await;

        Ok(())
    }

    /// Record a confirmed payment on a pending transaction
    async fn fund(
        &self,
        entry: &mut LedgerEntry,
        event: &GatewayEvent,
        trigger: &Trigger,
    ) -> EscrowResult<()> {
        self.transition(&mut entry.tx, trigger).await?;

        let now = self.services.clock.now();
        entry.tx.deadline = Some(now + Duration::hours(self.config.transfer_window_hours));
        entry.tx.payment_ref = event.payment_ref.clone();

        self.record_audit(
            entry.tx.id,
            AuditAction::PaymentReceived,
            Some("gateway".to_string()),
            serde_json::json!({
                "payment_ref": entry.tx.payment_ref,
                "deadline": entry.tx.deadline,
            }),
        )
        .await;

        info!(
            "Transaction {} funded, transfer due by {:?}",
            entry.tx.id, entry.tx.deadline
        );

        if !self.claim_listing(&entry.tx).await {
            warn!(
                "Listing {} already has a funded purchase; refunding {}",
                entry.tx.listing_id, entry.tx.id
            );
            // Retried by the sweeper when the rail is down
            if let Err(e) = self.refund_superseded(entry).await {
                error!("Refund for superseded transaction {} failed: {}", entry.tx.id, e);
            }
        }

        Ok(())
    }

    /// Record a payment that arrived after an unfunded dispute was opened
    async fn fund_dispute(
        &self,
        entry: &mut LedgerEntry,
        event: &GatewayEvent,
        trigger: &Trigger,
    ) -> EscrowResult<()> {
        self.transition(&mut entry.tx, trigger).await?;
        entry.tx.payment_ref = event.payment_ref.clone();

        if let Err(e) = self.services.settlement.dispute(entry.tx.id).await {
            warn!("Rail did not freeze funds for {}: {}", entry.tx.id, e);
        }

        self.record_audit(
            entry.tx.id,
            AuditAction::PaymentReceived,
            Some("gateway".to_string()),
            serde_json::json!({
                "payment_ref": entry.tx.payment_ref,
                "in_dispute": true,
            }),
        )
        .await;

        if !self.claim_listing(&entry.tx).await {
            self.raise_alert(
                entry.tx.id,
                AdminAlertKind::StateConflict,
                format!(
                    "Disputed transaction paid while listing {} is held by another purchase",
                    entry.tx.listing_id
                ),
            )
            .await;
        }

        warn!("Transaction {} funded while in dispute", entry.tx.id);
        Ok(())
    }

    /// Send back a payment for a transaction that closed unfunded.
    /// The transaction itself stays as it is.
    async fn refund_late_payment(
        &self,
        entry: &mut LedgerEntry,
        event: &GatewayEvent,
    ) -> EscrowResult<()> {
        let payout = self.fees.refund_payout(&entry.tx, entry.tx.amount);
        self.pay(entry, &payout).await?;

        self.record_audit(
            entry.tx.id,
            AuditAction::FundsRefunded,
            Some("system".to_string()),
            serde_json::json!({
                "late_payment": true,
                "payment_ref": event.payment_ref,
                "payout": serde_json::to_value(&payout)?,
            }),
        )
        .await;

        warn!(
            "Refunded late payment {:?} for {} transaction {}",
            event.payment_ref, entry.tx.status, entry.tx.id
        );
        Ok(())
    }

    /// Refund a funded purchase that lost its listing to another buyer
    async fn refund_superseded(&self, entry: &mut LedgerEntry) -> EscrowResult<()> {
        let payout = self.fees.refund_payout(&entry.tx, entry.tx.amount);
        self.pay(entry, &payout).await?;

        self.transition(&mut entry.tx, &Trigger::ListingUnavailable)
            .await?;
        self.record_audit(
            entry.tx.id,
            AuditAction::FundsRefunded,
            Some("system".to_string()),
            serde_json::json!({
                "reason": Trigger::ListingUnavailable.name(),
                "payout": serde_json::to_value(&payout)?,
            }),
        )
        .await;

        info!("Refunded superseded transaction {}", entry.tx.id);
        Ok(())
    }

    async fn cancel_open_charge(&self, tx: &Transaction) {
        let (Some(gateway), Some(charge_id)) = (&self.services.gateway, &tx.charge_id) else {
            return;
        };
        match gateway.cancel_charge(charge_id).await {
            Ok(status) => info!(
                "Charge {} for transaction {} is now {:?}",
                charge_id,
                tx.id,
                status.current()
            ),
            Err(e) => warn!("Could not cancel charge {} for {}: {}", charge_id, tx.id, e),
        }
    }

    /// Pay the seller for a verified transfer and close the transaction
    async fn release_verified(&self, entry: &mut LedgerEntry) -> EscrowResult<()> {
        let payout = self.fees.release_payout(&entry.tx, entry.tx.amount);
        self.pay(entry, &payout).await?;

        self.transition(&mut entry.tx, &Trigger::FundsReleased).await?;
        self.record_audit(
            entry.tx.id,
            AuditAction::FundsReleased,
            Some("system".to_string()),
            serde_json::to_value(&payout)?,
        )
        .await;

        if let Err(e) = self.services.listings.mark_sold(entry.tx.listing_id).await {
            warn!("Could not mark listing {} sold: {}", entry.tx.listing_id, e);
        }
        self.services.users.record_completion(&entry.tx).await?;

        info!(
            "Released {} {} to seller {} for transaction {}",
            payout.net, payout.currency, payout.recipient, entry.tx.id
        );

        Ok(())
    }

    /// Execute a payout once; failures go to the admin queue
    async fn pay(&self, entry: &mut LedgerEntry, payout: &Payout) -> EscrowResult<()> {
        if entry.paid.contains(&payout.kind) {
            return Ok(());
        }

        let result = match payout.kind {
            PayoutKind::SellerRelease => self.services.settlement.release(payout).await,
            PayoutKind::BuyerRefund => self.services.settlement.refund(payout).await,
        };

        match result {
            Ok(receipt) => {
                info!("Settlement receipt {} for {}", receipt.id, entry.tx.id);
                entry.paid.insert(payout.kind);
                Ok(())
            }
            Err(e) => {
                self.raise_alert(
                    entry.tx.id,
                    AdminAlertKind::SettlementFailed,
                    format!("{:?} failed: {}", payout.kind, e),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn record_audit(
        &self,
        transaction_id: Uuid,
        action: AuditAction,
        actor: Option<String>,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            id: self.next_audit_id.fetch_add(1, Ordering::SeqCst),
            transaction_id,
            action,
            actor,
            details,
            created_at: self.services.clock.now(),
        };
        self.audit.write().await.push(entry);
    }

    /// Queue an alert unless the same one is already waiting
    async fn raise_alert(&self, transaction_id: Uuid, kind: AdminAlertKind, detail: String) {
        let mut alerts = self.alerts.write().await;
        if alerts
            .iter()
            .any(|a| a.transaction_id == transaction_id && a.kind == kind && a.detail == detail)
        {
            return;
        }

        error!("Admin alert {:?} for {}: {}", kind, transaction_id, detail);
        alerts.push(AdminAlert {
            id: self.next_alert_id.fetch_add(1, Ordering::SeqCst),
            transaction_id,
            kind,
            detail,
            created_at: self.services.clock.now(),
        });
    }

    fn validate_create_request(&self, request: &CreateTransactionRequest) -> EscrowResult<()> {
        if request.amount <= Decimal::ZERO {
            return Err(EscrowError::validation("Amount must be positive"));
        }
        if request.amount > self.config.max_amount {
            return Err(EscrowError::validation(format!(
                "Amount exceeds maximum of {}",
                self.config.max_amount
            )));
        }
        Ok(())
    }
}
