//! User Registry - Telegram users and their marketplace reputation
//!
//! Tracks registration status and reputation counters for buyers and sellers.
//! Scores move on completed sales, refunds and dispute outcomes; the tier is
//! always derived from the score.

use crate::{
    error::EscrowError,
    models::{RegistrationStatus, ReputationStats, Ruling, TelegramId, Transaction, User},
    EscrowResult,
};
use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Configuration for the user registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRegistryConfig {
    /// Points awarded to the seller for a completed sale
    pub sale_points: i32,
    /// Points awarded to the buyer for a completed purchase
    pub purchase_points: i32,
    /// Points removed from the seller when a sale is refunded
    pub refund_penalty: i32,
    /// Points awarded to the winning side of a dispute
    pub dispute_win_points: i32,
    /// Points removed from the losing side of a dispute
    pub dispute_loss_penalty: i32,
}

impl Default for UserRegistryConfig {
    fn default() -> Self {
        Self {
            sale_points: 50,
            purchase_points: 10,
            refund_penalty: 25,
            dispute_win_points: 10,
            dispute_loss_penalty: 30,
        }
    }
}

/// Main user registry
pub struct UserRegistry {
    config: UserRegistryConfig,
    users: Arc<RwLock<HashMap<TelegramId, User>>>,
}

impl UserRegistry {
    /// Create a new user registry
    pub fn new(config: UserRegistryConfig) -> Self {
        Self {
            config,
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a user, or refresh the username of a known one
    pub async fn register(
        &self,
        telegram_id: TelegramId,
        username: Option<String>,
    ) -> EscrowResult<User> {
        if telegram_id <= 0 {
            return Err(EscrowError::validation("telegram_id must be positive"));
        }

        let now = Utc::now();
        let mut users = self.users.write().await;
        let user = users.entry(telegram_id).or_insert_with(|| {
            info!("Registering user {}", telegram_id);
            User {
                telegram_id,
                username: None,
                registration_status: RegistrationStatus::Pending,
                reputation_stats: ReputationStats::default(),
                created_at: now,
                updated_at: now,
            }
        });

        if username.is_some() {
            user.username = username;
        }
        if user.registration_status == RegistrationStatus::Pending {
            user.registration_status = RegistrationStatus::Registered;
        }
        user.updated_at = now;

        Ok(user.clone())
    }

    /// Get a user
    pub async fn get_user(&self, telegram_id: TelegramId) -> EscrowResult<User> {
        self.users
            .read()
            .await
            .get(&telegram_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("User {} not found", telegram_id)))
    }

    /// Get a user who may trade right now
    pub async fn require_registered(&self, telegram_id: TelegramId) -> EscrowResult<User> {
        let user = self.get_user(telegram_id).await?;
        match user.registration_status {
            RegistrationStatus::Registered => Ok(user),
            RegistrationStatus::Suspended => Err(EscrowError::unauthorized(format!(
                "User {} is suspended",
                telegram_id
            ))),
            RegistrationStatus::Pending => Err(EscrowError::validation(format!(
                "User {} has not completed registration",
                telegram_id
            ))),
        }
    }

    /// Suspend a user
    pub async fn suspend(&self, telegram_id: TelegramId) -> EscrowResult<User> {
        let user = self
            .update(telegram_id, |user| {
                user.registration_status = RegistrationStatus::Suspended;
            })
            .await?;
        warn!("Suspended user {}", telegram_id);
        Ok(user)
    }

    /// Credit both parties for a released sale
    pub async fn record_completion(&self, tx: &Transaction) -> EscrowResult<()> {
        let sale_points = self.config.sale_points + volume_bonus(tx.amount);
        let purchase_points = self.config.purchase_points;
        let amount = tx.amount;

        self.update_party(tx.seller_id, move |stats| {
            stats.sales_completed += 1;
            stats.volume_sold += amount;
            stats.adjust_score(sale_points);
        })
        .await;
        self.update_party(tx.buyer_id, move |stats| {
            stats.purchases_completed += 1;
            stats.volume_bought += amount;
            stats.adjust_score(purchase_points);
        })
        .await;

        Ok(())
    }

    /// Record a refunded sale; the seller takes the penalty
    pub async fn record_refund(&self, tx: &Transaction) -> EscrowResult<()> {
        let penalty = self.config.refund_penalty;

        self.update_party(tx.seller_id, move |stats| {
            stats.sales_refunded += 1;
            stats.adjust_score(-penalty);
        })
        .await;
        self.update_party(tx.buyer_id, |stats| {
            stats.purchases_refunded += 1;
        })
        .await;

        Ok(())
    }

    /// Count a dispute against the party that opened it
    pub async fn record_dispute_opened(&self, opener: TelegramId) -> EscrowResult<()> {
        self.update_party(opener, |stats| stats.disputes_opened += 1)
            .await;
        Ok(())
    }

    /// Apply an arbitrator ruling to both parties. Split rulings name no winner.
    pub async fn record_dispute_outcome(&self, tx: &Transaction, ruling: &Ruling) -> EscrowResult<()> {
        let (winner, loser) = match ruling {
            Ruling::FavorBuyer => (tx.buyer_id, tx.seller_id),
            Ruling::FavorSeller => (tx.seller_id, tx.buyer_id),
            Ruling::PartialRefund { .. } => return Ok(()),
        };

        let win = self.config.dispute_win_points;
        let loss = self.config.dispute_loss_penalty;

        self.update_party(winner, move |stats| {
            stats.disputes_won += 1;
            stats.adjust_score(win);
        })
        .await;
        self.update_party(loser, move |stats| {
            stats.disputes_lost += 1;
            stats.adjust_score(-loss);
        })
        .await;

        Ok(())
    }

    async fn update<F>(&self, telegram_id: TelegramId, update_fn: F) -> EscrowResult<User>
    where
        F: FnOnce(&mut User),
    {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&telegram_id)
            .ok_or_else(|| EscrowError::not_found(format!("User {} not found", telegram_id)))?;

        update_fn(user);
        user.updated_at = Utc::now();

        Ok(user.clone())
    }

    /// Reputation bookkeeping never blocks a money movement
    async fn update_party<F>(&self, telegram_id: TelegramId, update_fn: F)
    where
        F: FnOnce(&mut ReputationStats),
    {
        if let Err(e) = self
            .update(telegram_id, |user| update_fn(&mut user.reputation_stats))
            .await
        {
            warn!("Skipping reputation update for {}: {}", telegram_id, e);
        }
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new(UserRegistryConfig::default())
    }
}

/// Up to 50 bonus points for large sales
fn volume_bonus(amount: Decimal) -> i32 {
    (amount / Decimal::from(100))
        .floor()
        .to_i32()
        .unwrap_or(i32::MAX)
        .clamp(0, 50)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;
    use uuid::Uuid;

    fn sale(buyer: TelegramId, seller: TelegramId, amount: i64) -> Transaction {
        Transaction::new(
            buyer,
            seller,
            Uuid::new_v4(),
            Decimal::from(amount),
            Currency::Usdt,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = UserRegistry::default();
        let first = registry.register(42, Some("alice".to_string())).await.unwrap();
        assert_eq!(first.registration_status, RegistrationStatus::Registered);
        assert_eq!(first.reputation_stats.score, 500);

        let again = registry.register(42, None).await.unwrap();
        assert_eq!(again.username.as_deref(), Some("alice"));
        assert_eq!(again.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_suspended_user_cannot_trade() {
        let registry = UserRegistry::default();
        registry.register(7, None).await.unwrap();
        registry.suspend(7).await.unwrap();

        // Re-registering does not lift a suspension
        registry.register(7, None).await.unwrap();
        assert!(matches!(
            registry.require_registered(7).await,
            Err(EscrowError::Unauthorized(_))
        ));
        assert!(matches!(
            registry.require_registered(8).await,
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_updates_both_parties() {
        let registry = UserRegistry::default();
        registry.register(1, None).await.unwrap();
        registry.register(2, None).await.unwrap();

        registry.record_completion(&sale(1, 2, 1_000)).await.unwrap();

        let seller = registry.get_user(2).await.unwrap().reputation_stats;
        assert_eq!(seller.sales_completed, 1);
        assert_eq!(seller.volume_sold, Decimal::from(1_000));
        assert_eq!(seller.score, 500 + 50 + 10);

        let buyer = registry.get_user(1).await.unwrap().reputation_stats;
        assert_eq!(buyer.purchases_completed, 1);
        assert_eq!(buyer.score, 510);
    }

    #[tokio::test]
    async fn test_dispute_outcome() {
        let registry = UserRegistry::default();
        registry.register(1, None).await.unwrap();
        registry.register(2, None).await.unwrap();
        let tx = sale(1, 2, 100);

        registry
            .record_dispute_outcome(&tx, &Ruling::FavorBuyer)
            .await
            .unwrap();
        let buyer = registry.get_user(1).await.unwrap().reputation_stats;
        let seller = registry.get_user(2).await.unwrap().reputation_stats;
        assert_eq!(buyer.disputes_won, 1);
        assert_eq!(seller.disputes_lost, 1);
        assert_eq!(seller.score, 470);

        registry
            .record_dispute_outcome(
                &tx,
                &Ruling::PartialRefund {
                    buyer_amount: Decimal::from(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.get_user(1).await.unwrap().reputation_stats.disputes_won, 1);
    }

    #[test]
    fn test_volume_bonus_capped() {
        assert_eq!(volume_bonus(Decimal::from(99)), 0);
        assert_eq!(volume_bonus(Decimal::from(250)), 2);
        assert_eq!(volume_bonus(Decimal::from(1_000_000)), 50);
    }
}
