//! Settlement - fee splits and payout execution
//!
//! Turns finished transactions into payouts and hands them to a
//! [`SettlementRail`]. The rail mirrors the escrow contract interface
//! (`deposit`, `release`, `refund`, `dispute`, `resolve`); [`LedgerSettlement`]
//! is the custodial implementation that records every operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Currency, Ruling, TelegramId, Transaction},
    EscrowResult,
};

/// Configuration for settlement fees
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Platform fee in basis points of the seller's gross
    pub platform_fee_bps: u32,
    /// Flat network fee deducted from each seller payout
    pub gas_fee: Decimal,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 500,       // 5%
            gas_fee: Decimal::new(2, 2), // 0.02
        }
    }
}

/// Escrow contract operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractOp {
    Deposit,
    Release,
    Refund,
    Dispute,
    Resolve,
}

/// Direction of a payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    SellerRelease,
    BuyerRefund,
}

/// Funds leaving escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub transaction_id: Uuid,
    pub recipient: TelegramId,
    pub kind: PayoutKind,
    pub currency: Currency,
    pub gross: Decimal,
    pub platform_fee: Decimal,
    pub gas_fee: Decimal,
    pub net: Decimal,
}

/// Record of a contract operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub op: ContractOp,
    pub payout: Option<Payout>,
    pub settled_at: DateTime<Utc>,
}

impl SettlementConfig {
    /// Platform fee and seller net for `gross`
    pub fn seller_split(&self, gross: Decimal) -> (Decimal, Decimal) {
        let platform_fee =
            (gross * Decimal::from(self.platform_fee_bps) / Decimal::from(10_000u32)).round_dp(8);
        let net = (gross - platform_fee - self.gas_fee).max(Decimal::ZERO);
        (platform_fee, net)
    }

    /// Payout to the seller for `gross`, after platform fee and gas
    pub fn release_payout(&self, tx: &Transaction, gross: Decimal) -> Payout {
        let (platform_fee, net) = self.seller_split(gross);

        Payout {
            transaction_id: tx.id,
            recipient: tx.seller_id,
            kind: PayoutKind::SellerRelease,
            currency: tx.currency,
            gross,
            platform_fee,
            gas_fee: self.gas_fee,
            net,
        }
    }

    /// Refund to the buyer; fees are absorbed by the platform
    pub fn refund_payout(&self, tx: &Transaction, gross: Decimal) -> Payout {
        Payout {
            transaction_id: tx.id,
            recipient: tx.buyer_id,
            kind: PayoutKind::BuyerRefund,
            currency: tx.currency,
            gross,
            platform_fee: Decimal::ZERO,
            gas_fee: Decimal::ZERO,
            net: gross,
        }
    }

    /// Payouts implied by an arbitrator ruling
    pub fn ruling_payouts(&self, tx: &Transaction, ruling: &Ruling) -> EscrowResult<Vec<Payout>> {
        match ruling {
            Ruling::FavorSeller => Ok(vec![self.release_payout(tx, tx.amount)]),
            Ruling::FavorBuyer => Ok(vec![self.refund_payout(tx, tx.amount)]),
            Ruling::PartialRefund { buyer_amount } => {
                if *buyer_amount <= Decimal::ZERO || *buyer_amount >= tx.amount {
                    return Err(EscrowError::validation(format!(
                        "Partial refund {} must be between 0 and {} exclusive",
                        buyer_amount, tx.amount
                    )));
                }
                Ok(vec![
                    self.refund_payout(tx, *buyer_amount),
                    self.release_payout(tx, tx.amount - *buyer_amount),
                ])
            }
        }
    }
}

/// Moves funds out of escrow
#[async_trait]
pub trait SettlementRail: Send + Sync {
    /// Pay the seller
    async fn release(&self, payout: &Payout) -> EscrowResult<SettlementReceipt>;

    /// Return funds to the buyer
    async fn refund(&self, payout: &Payout) -> EscrowResult<SettlementReceipt>;

    /// Freeze funds while a dispute is open
    async fn dispute(&self, _transaction_id: Uuid) -> EscrowResult<()> {
        Ok(())
    }

    /// Record the arbitrator ruling before payouts
    async fn resolve(&self, _transaction_id: Uuid, _ruling: &Ruling) -> EscrowResult<()> {
        Ok(())
    }
}

/// Custodial rail that keeps an in-memory ledger of contract operations
#[derive(Default)]
pub struct LedgerSettlement {
    receipts: Arc<RwLock<Vec<SettlementReceipt>>>,
    /// (transaction, kind) pairs already paid out
    paid: Arc<RwLock<HashSet<(Uuid, PayoutKind)>>>,
}

impl LedgerSettlement {
    pub fn new() -> Self {
        Self::default()
    }

    /// All receipts for a transaction, oldest first
    pub async fn receipts_for(&self, transaction_id: Uuid) -> Vec<SettlementReceipt> {
        self.receipts
            .read()
            .await
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    async fn pay_out(&self, payout: &Payout, op: ContractOp) -> EscrowResult<SettlementReceipt> {
        if !self.paid.write().await.insert((payout.transaction_id, payout.kind)) {
            warn!(
                "Rejected repeated {:?} for transaction {}",
                payout.kind, payout.transaction_id
            );
            return Err(EscrowError::settlement(format!(
                "{:?} already executed for transaction {}",
                payout.kind, payout.transaction_id
            )));
        }

        let receipt = self.record(payout.transaction_id, op, Some(payout.clone())).await;

        info!(
            "Settled {:?} of {} {} (net {}) to {} for transaction {}",
            op, payout.gross, payout.currency, payout.net, payout.recipient, payout.transaction_id
        );

        Ok(receipt)
    }

    async fn record(
        &self,
        transaction_id: Uuid,
        op: ContractOp,
        payout: Option<Payout>,
    ) -> SettlementReceipt {
        let receipt = SettlementReceipt {
            id: Uuid::new_v4(),
            transaction_id,
            op,
            payout,
            settled_at: Utc::now(),
        };
        self.receipts.write().await.push(receipt.clone());
        receipt
    }
}

#[async_trait]
impl SettlementRail for LedgerSettlement {
    async fn release(&self, payout: &Payout) -> EscrowResult<SettlementReceipt> {
        self.pay_out(payout, ContractOp::Release).await
    }

    async fn refund(&self, payout: &Payout) -> EscrowResult<SettlementReceipt> {
        self.pay_out(payout, ContractOp::Refund).await
    }

    async fn dispute(&self, transaction_id: Uuid) -> EscrowResult<()> {
        self.record(transaction_id, ContractOp::Dispute, None).await;
        Ok(())
    }

    async fn resolve(&self, transaction_id: Uuid, _ruling: &Ruling) -> EscrowResult<()> {
        self.record(transaction_id, ContractOp::Resolve, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn transaction(amount: &str) -> Transaction {
        Transaction::new(
            10,
            20,
            Uuid::new_v4(),
            Decimal::from_str(amount).unwrap(),
            Currency::Usdt,
            Utc::now(),
        )
    }

    #[test]
    fn test_release_fee_split() {
        let config = SettlementConfig::default();
        let tx = transaction("100");
        let payout = config.release_payout(&tx, tx.amount);

        assert_eq!(payout.recipient, 20);
        assert_eq!(payout.platform_fee, Decimal::from(5));
        assert_eq!(payout.net, Decimal::from_str("94.98").unwrap());
    }

    #[test]
    fn test_net_never_negative() {
        let config = SettlementConfig::default();
        let tx = transaction("0.01");
        assert_eq!(config.release_payout(&tx, tx.amount).net, Decimal::ZERO);
    }

    #[test]
    fn test_partial_ruling_bounds() {
        let config = SettlementConfig::default();
        let tx = transaction("100");

        let payouts = config
            .ruling_payouts(
                &tx,
                &Ruling::PartialRefund {
                    buyer_amount: Decimal::from(40),
                },
            )
            .unwrap();
        assert_eq!(payouts[0].kind, PayoutKind::BuyerRefund);
        assert_eq!(payouts[0].net, Decimal::from(40));
        assert_eq!(payouts[1].gross, Decimal::from(60));
        assert_eq!(payouts[1].net, Decimal::from_str("56.98").unwrap());

        assert!(config
            .ruling_payouts(
                &tx,
                &Ruling::PartialRefund {
                    buyer_amount: Decimal::from(100),
                },
            )
            .is_err());
    }

    #[tokio::test]
    async fn test_ledger_refuses_double_release() {
        let rail = LedgerSettlement::new();
        let config = SettlementConfig::default();
        let tx = transaction("100");
        let payout = config.release_payout(&tx, tx.amount);

        rail.release(&payout).await.unwrap();
        let err = rail.release(&payout).await.unwrap_err();
        assert!(matches!(err, EscrowError::Settlement(_)));

        let receipts = rail.receipts_for(tx.id).await;
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].op, ContractOp::Release);
    }
}
