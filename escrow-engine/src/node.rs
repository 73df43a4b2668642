//! Main Escrow Node - High-level API for the escrow system
//!
//! This module wires the components together (registries, oracle, gateway,
//! settlement rail, transaction manager, group monitor) and exposes them to
//! the API server and the CLI.

use crate::{
    clock::{Clock, SystemClock},
    error::EscrowError,
    group_monitor::{GroupInspector, GroupMonitor, MonitorConfig},
    listing_registry::ListingRegistry,
    models::Transaction,
    ownership::{OwnershipVerifier, TelegramOwnershipVerifier, VerifierConfig},
    payment_gateway::{ChargeStatus, GatewayConfig, PaymentGateway},
    settlement::{LedgerSettlement, SettlementConfig, SettlementRail},
    sweeper::{Sweeper, SweeperConfig},
    transaction_manager::{
        EscrowServices, TransactionManager, TransactionManagerConfig, VerificationPolicy,
    },
    user_registry::{UserRegistry, UserRegistryConfig},
    EscrowResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Configuration for the escrow node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscrowNodeConfig {
    /// Transaction manager configuration
    pub escrow: TransactionManagerConfig,
    /// Fee schedule
    pub settlement: SettlementConfig,
    /// Ownership oracle configuration
    pub verifier: VerifierConfig,
    /// Payment gateway configuration
    pub gateway: GatewayConfig,
    /// Reputation scoring
    pub users: UserRegistryConfig,
    /// Deadline sweeper
    pub sweeper: SweeperConfig,
    /// Listed group monitoring
    pub monitor: MonitorConfig,
}

/// Liveness summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealth {
    pub status: String,
    pub open_alerts: usize,
    pub charges_enabled: bool,
    pub monitoring: bool,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    config: EscrowNodeConfig,
    manager: Arc<TransactionManager>,
    listings: Arc<ListingRegistry>,
    users: Arc<UserRegistry>,
    gateway: Arc<PaymentGateway>,
    clock: Arc<dyn Clock>,
    monitor: Option<Arc<GroupMonitor>>,
    charges_enabled: bool,
}

impl EscrowNode {
    /// Create a node backed by the Telegram oracle and the custodial ledger
    pub fn new(config: EscrowNodeConfig) -> EscrowResult<Self> {
        let telegram = Arc::new(TelegramOwnershipVerifier::new(config.verifier.clone())?);
        let monitored = config.monitor.enabled && !config.verifier.bot_token.trim().is_empty();

        let node = Self::with_components(
            config,
            telegram.clone(),
            Arc::new(LedgerSettlement::new()),
            Arc::new(SystemClock),
        )?;

        Ok(if monitored {
            node.with_group_monitor(telegram)
        } else {
            node
        })
    }

    /// Create a node with explicit oracle, rail and clock
    pub fn with_components(
        config: EscrowNodeConfig,
        verifier: Arc<dyn OwnershipVerifier>,
        settlement: Arc<dyn SettlementRail>,
        clock: Arc<dyn Clock>,
    ) -> EscrowResult<Self> {
        info!("Initializing escrow node");

        let policy = VerificationPolicy::from(&config.verifier);
        let gateway = Arc::new(PaymentGateway::new(config.gateway.clone())?);
        let users = Arc::new(UserRegistry::new(config.users.clone()));
        let listings = Arc::new(ListingRegistry::new(
            verifier.clone(),
            policy.retry.clone(),
            clock.clone(),
        ));

        let charges_enabled = config
            .gateway
            .api_key
            .as_ref()
            .map_or(false, |k| !k.trim().is_empty());

        let manager = Arc::new(TransactionManager::new(
            config.escrow.clone(),
            config.settlement.clone(),
            policy,
            EscrowServices {
                listings: listings.clone(),
                users: users.clone(),
                verifier,
                settlement,
                gateway: charges_enabled.then(|| gateway.clone()),
                clock: clock.clone(),
            },
        ));

        info!("Escrow node initialized successfully");

        Ok(Self {
            config,
            manager,
            listings,
            users,
            gateway,
            clock,
            monitor: None,
            charges_enabled,
        })
    }

    /// Watch listed groups through `inspector` on every sweep
    pub fn with_group_monitor(mut self, inspector: Arc<dyn GroupInspector>) -> Self {
        info!("Group monitoring enabled");
        self.monitor = Some(Arc::new(GroupMonitor::new(
            inspector,
            self.listings.clone(),
            self.manager.clone(),
            self.clock.clone(),
            &self.config.monitor,
        )));
        self
    }

    pub fn manager(&self) -> Arc<TransactionManager> {
        self.manager.clone()
    }

    pub fn listings(&self) -> Arc<ListingRegistry> {
        self.listings.clone()
    }

    pub fn users(&self) -> Arc<UserRegistry> {
        self.users.clone()
    }

    pub fn monitor(&self) -> Option<Arc<GroupMonitor>> {
        self.monitor.clone()
    }

    /// Live state of a transaction's hosted charge at the gateway
    pub async fn charge_status(&self, transaction_id: Uuid) -> EscrowResult<ChargeStatus> {
        let tx = self.manager.get_transaction(transaction_id).await?;
        let charge_id = tx.charge_id.ok_or_else(|| {
            EscrowError::not_found(format!("Transaction {} has no hosted charge", transaction_id))
        })?;
        self.gateway.charge_status(&charge_id).await
    }

    /// Authenticate a gateway webhook and apply it to the ledger
    pub async fn ingest_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> EscrowResult<Transaction> {
        let event = self.gateway.parse_webhook(body, signature)?;
        info!(
            "Webhook {} ({}) for transaction {}",
            event.event_id,
            event.kind.name(),
            event.transaction_id
        );
        self.manager.apply_gateway_event(event).await
    }

    /// Deadline sweeper bound to this node's ledger
    pub fn sweeper(&self) -> Sweeper {
        let sweeper = Sweeper::new(self.manager.clone(), &self.config.sweeper);
        match &self.monitor {
            Some(monitor) => sweeper.with_monitor(monitor.clone()),
            None => sweeper,
        }
    }

    pub fn sweeper_enabled(&self) -> bool {
        self.config.sweeper.enabled
    }

    /// Health check
    pub async fn health_check(&self) -> NodeHealth {
        NodeHealth {
            status: "ok".to_string(),
            open_alerts: self.manager.admin_alerts().await.len(),
            charges_enabled: self.charges_enabled,
            monitoring: self.monitor.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        listing_registry::CreateListingRequest,
        models::{Category, Currency, TelegramId},
        ownership::{GroupRef, OwnershipStatus},
        payment_gateway::WebhookVerifier,
        transaction_manager::CreateTransactionRequest,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn config_with_secret(secret: &str) -> EscrowNodeConfig {
        EscrowNodeConfig {
            gateway: GatewayConfig {
                webhook_secret: secret.to_string(),
                ..GatewayConfig::default()
            },
            ..EscrowNodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_node_starts_without_external_credentials() {
        let node = EscrowNode::new(EscrowNodeConfig::default()).unwrap();
        let health = node.health_check().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.open_alerts, 0);
        assert!(!health.charges_enabled);
        assert!(!health.monitoring);
        assert!(node.monitor().is_none());
        assert!(node.sweeper_enabled());
    }

    #[tokio::test]
    async fn test_bot_token_enables_monitoring() {
        let mut config = EscrowNodeConfig::default();
        config.verifier.bot_token = "900:secret".to_string();
        let node = EscrowNode::new(config.clone()).unwrap();
        assert!(node.health_check().await.monitoring);

        config.monitor.enabled = false;
        let node = EscrowNode::new(config).unwrap();
        assert!(node.monitor().is_none());
    }

    struct CreatorVerifier;

    #[async_trait]
    impl OwnershipVerifier for CreatorVerifier {
        async fn check(&self, _group: &GroupRef, _user_id: TelegramId) -> EscrowResult<OwnershipStatus> {
            Ok(OwnershipStatus::from_member_status("creator"))
        }
    }

    #[tokio::test]
    async fn test_charge_status_needs_hosted_charge() {
        let node = EscrowNode::with_components(
            EscrowNodeConfig::default(),
            Arc::new(CreatorVerifier),
            Arc::new(LedgerSettlement::new()),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap();
        node.users().register(1, None).await.unwrap();
        node.users().register(2, None).await.unwrap();
        let listing = node
            .listings()
            .create_listing(CreateListingRequest {
                owner_id: 2,
                group_id: -42,
                group_username: None,
                title: "Group".to_string(),
                description: String::new(),
                member_count: 10,
                price: Decimal::from(50),
                currency: Currency::Ton,
                category: Category::Other,
            })
            .await
            .unwrap();
        node.listings().verify_listing(listing.id, 2).await.unwrap();
        let tx = node
            .manager()
            .create_transaction(CreateTransactionRequest {
                buyer_id: 1,
                listing_id: listing.id,
                amount: Decimal::from(50),
                currency: Currency::Ton,
            })
            .await
            .unwrap();

        // Charges are disabled, so nothing was opened at the gateway
        assert!(matches!(
            node.charge_status(tx.id).await,
            Err(EscrowError::NotFound(_))
        ));
        assert!(matches!(
            node.charge_status(Uuid::new_v4()).await,
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_signature_checked_before_ledger() {
        let node = EscrowNode::new(config_with_secret("whsec")).unwrap();
        let body = serde_json::to_vec(&serde_json::json!({
            "event": {
                "id": "evt-1",
                "type": "charge:confirmed",
                "data": {
                    "metadata": { "transaction_id": uuid::Uuid::new_v4().to_string() },
                    "payments": [{ "transaction_id": "0xabc" }]
                }
            }
        }))
        .unwrap();

        assert!(matches!(
            node.ingest_webhook(&body, Some("deadbeef")).await,
            Err(EscrowError::InvalidSignature(_))
        ));

        let signature = WebhookVerifier::new("whsec").sign(&body).unwrap();
        assert!(matches!(
            node.ingest_webhook(&body, Some(&signature)).await,
            Err(EscrowError::NotFound(_))
        ));
    }
}
