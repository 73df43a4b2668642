//! Group Monitor - watches listed groups for changes
//!
//! Each pass snapshots every active, unclaimed listing's group (title,
//! description hash, member count, administrators) and compares it with the
//! previous snapshot. A listing whose group dropped the bot or no longer
//! belongs to the seller is suspended; other changes are only flagged.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    listing_registry::ListingRegistry,
    models::{Listing, TelegramId},
    ownership::GroupRef,
    transaction_manager::TransactionManager,
    EscrowResult,
};

/// Configuration for the group monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Minimum minutes between two checks of the same group
    pub recheck_minutes: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recheck_minutes: 30,
        }
    }
}

/// Chat details from the Bot API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub title: String,
    pub description: Option<String>,
    pub invite_link: Option<String>,
    pub member_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAdmin {
    pub user_id: TelegramId,
    pub username: Option<String>,
    pub is_creator: bool,
}

/// Read access to a group's live state
#[async_trait]
pub trait GroupInspector: Send + Sync {
    async fn group_info(&self, group: &GroupRef) -> EscrowResult<GroupInfo>;

    async fn administrators(&self, group: &GroupRef) -> EscrowResult<Vec<GroupAdmin>>;

    /// User id of the bot itself, when known
    fn bot_id(&self) -> Option<TelegramId>;
}

/// Group state recorded at one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub listing_id: Uuid,
    pub group_id: i64,
    pub title: String,
    /// Hex SHA-256 of the description
    pub description_hash: String,
    pub invite_link: Option<String>,
    pub member_count: u32,
    pub admins: BTreeMap<TelegramId, Option<String>>,
    pub creator: Option<TelegramId>,
    pub taken_at: DateTime<Utc>,
}

/// Difference noticed between two checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum GroupChange {
    TitleChanged { from: String, to: String },
    DescriptionChanged,
    MemberCountChanged { from: u32, to: u32 },
    AdminAdded { user_id: TelegramId, username: Option<String> },
    AdminRemoved { user_id: TelegramId, username: Option<String> },
    /// The bot cannot read the group or is no longer an administrator
    BotRemoved { reason: String },
    /// The group creator is not the listing owner
    OwnerChanged { expected: TelegramId, found: Option<TelegramId> },
}

impl GroupChange {
    /// Changes that make the listing unsafe to sell
    pub fn requires_suspension(&self) -> bool {
        matches!(self, Self::BotRemoved { .. } | Self::OwnerChanged { .. })
    }
}

/// A check that found changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorFlag {
    pub listing_id: Uuid,
    pub group_id: i64,
    pub changes: Vec<GroupChange>,
    pub suspended: bool,
    pub flagged_at: DateTime<Utc>,
}

/// What a single pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub flagged: usize,
    pub suspended: usize,
}

pub struct GroupMonitor {
    inspector: Arc<dyn GroupInspector>,
    listings: Arc<ListingRegistry>,
    manager: Arc<TransactionManager>,
    clock: Arc<dyn Clock>,
    recheck: Duration,
    snapshots: RwLock<HashMap<Uuid, GroupSnapshot>>,
    flags: RwLock<Vec<MonitorFlag>>,
}

impl GroupMonitor {
    pub fn new(
        inspector: Arc<dyn GroupInspector>,
        listings: Arc<ListingRegistry>,
        manager: Arc<TransactionManager>,
        clock: Arc<dyn Clock>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            inspector,
            listings,
            manager,
            clock,
            recheck: Duration::minutes(config.recheck_minutes.max(0)),
            snapshots: RwLock::new(HashMap::new()),
            flags: RwLock::new(Vec::new()),
        }
    }

    /// Check every active listing that is due.
    ///
    /// Listings held by a funded purchase are skipped: their ownership is
    /// expected to change hands.
    pub async fn run_once(&self) -> MonitorReport {
        let now = self.clock.now();
        let mut report = MonitorReport::default();

        for listing in self.listings.monitored().await {
            if self.manager.listing_claimed(listing.id).await {
                continue;
            }
            let due = self
                .snapshots
                .read()
                .await
                .get(&listing.id)
                .map_or(true, |s| now - s.taken_at >= self.recheck);
            if !due {
                continue;
            }

            match self.check_listing(&listing).await {
                Ok(flag) => {
                    report.checked += 1;
                    if let Some(flag) = flag {
                        report.flagged += 1;
                        if flag.suspended {
                            report.suspended += 1;
                        }
                    }
                }
                Err(e) => warn!("Could not check group {}: {}", listing.group_id, e),
            }
        }

        report
    }

    /// Snapshot one listing's group and act on what changed
    pub async fn check_listing(&self, listing: &Listing) -> EscrowResult<Option<MonitorFlag>> {
        let group = GroupRef {
            chat_id: listing.group_id,
            username: listing.group_username.clone(),
        };
        let now = self.clock.now();

        let fetched = tokio::try_join!(
            self.inspector.group_info(&group),
            self.inspector.administrators(&group)
        );

        let changes = match fetched {
            Ok((info, admins)) => {
                let snapshot = self.snapshot_of(listing, info, &admins, now);
                let mut changes = match self.snapshots.read().await.get(&listing.id) {
                    Some(previous) => diff(previous, &snapshot),
                    None => Vec::new(),
                };

                if let Some(bot) = self.inspector.bot_id() {
                    if !snapshot.admins.contains_key(&bot) {
                        changes.push(GroupChange::BotRemoved {
                            reason: "bot is no longer an administrator".to_string(),
                        });
                    }
                }
                if snapshot.creator != Some(listing.owner_id) {
                    changes.push(GroupChange::OwnerChanged {
                        expected: listing.owner_id,
                        found: snapshot.creator,
                    });
                }

                if let Err(e) = self
                    .listings
                    .refresh_member_count(listing.id, snapshot.member_count)
                    .await
                {
                    warn!("Could not update listing {}: {}", listing.id, e);
                }
                self.snapshots.write().await.insert(listing.id, snapshot);
                changes
            }
            Err(e) if e.is_transient() => return Err(e),
            // Kicked bots get "chat not found" or "forbidden"
            Err(e) => vec![GroupChange::BotRemoved {
                reason: e.to_string(),
            }],
        };

        if changes.is_empty() {
            return Ok(None);
        }

        let suspended = if changes.iter().any(GroupChange::requires_suspension) {
            match self.listings.suspend(listing.id).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Could not suspend listing {}: {}", listing.id, e);
                    false
                }
            }
        } else {
            false
        };

        warn!(
            "Group {} for listing {} changed: {:?}",
            listing.group_id, listing.id, changes
        );

        let flag = MonitorFlag {
            listing_id: listing.id,
            group_id: listing.group_id,
            changes,
            suspended,
            flagged_at: now,
        };
        self.flags.write().await.push(flag.clone());

        Ok(Some(flag))
    }

    /// Latest snapshot for a listing
    pub async fn snapshot(&self, listing_id: Uuid) -> Option<GroupSnapshot> {
        self.snapshots.read().await.get(&listing_id).cloned()
    }

    /// Flags raised so far, oldest first
    pub async fn flags(&self) -> Vec<MonitorFlag> {
        self.flags.read().await.clone()
    }

    fn snapshot_of(
        &self,
        listing: &Listing,
        info: GroupInfo,
        admins: &[GroupAdmin],
        now: DateTime<Utc>,
    ) -> GroupSnapshot {
        GroupSnapshot {
            listing_id: listing.id,
            group_id: listing.group_id,
            title: info.title,
            description_hash: description_hash(info.description.as_deref()),
            invite_link: info.invite_link,
            member_count: info.member_count,
            admins: admins
                .iter()
                .map(|a| (a.user_id, a.username.clone()))
                .collect(),
            creator: admins.iter().find(|a| a.is_creator).map(|a| a.user_id),
            taken_at: now,
        }
    }
}

fn description_hash(description: Option<&str>) -> String {
    hex::encode(Sha256::digest(description.unwrap_or_default().as_bytes()))
}

fn diff(previous: &GroupSnapshot, current: &GroupSnapshot) -> Vec<GroupChange> {
    let mut changes = Vec::new();

    if previous.title != current.title {
        changes.push(GroupChange::TitleChanged {
            from: previous.title.clone(),
            to: current.title.clone(),
        });
    }
    if previous.description_hash != current.description_hash {
        changes.push(GroupChange::DescriptionChanged);
    }
    if previous.member_count != current.member_count {
        changes.push(GroupChange::MemberCountChanged {
            from: previous.member_count,
            to: current.member_count,
        });
    }

    for (user_id, username) in &current.admins {
        if !previous.admins.contains_key(user_id) {
            changes.push(GroupChange::AdminAdded {
                user_id: *user_id,
                username: username.clone(),
            });
        }
    }
    for (user_id, username) in &previous.admins {
        if !current.admins.contains_key(user_id) {
            changes.push(GroupChange::AdminRemoved {
                user_id: *user_id,
                username: username.clone(),
            });
        }
    }

    if !changes.is_empty() {
        info!(
            "Group {} changed since {}",
            current.group_id, previous.taken_at
        );
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        error::EscrowError,
        listing_registry::CreateListingRequest,
        models::{Category, Currency, ListingStatus},
        node::{EscrowNode, EscrowNodeConfig},
        ownership::{OwnershipStatus, OwnershipVerifier},
        payment_gateway::{GatewayEvent, GatewayEventKind},
        settlement::LedgerSettlement,
        transaction_manager::CreateTransactionRequest,
    };
    use rust_decimal::Decimal;

    const SELLER: TelegramId = 2;
    const BOT: TelegramId = 900;

    /// Group whose state the test edits between passes
    struct FakeGroup {
        info: std::sync::Mutex<GroupInfo>,
        admins: std::sync::Mutex<Vec<GroupAdmin>>,
        /// `(transient, message)` returned instead of the chat
        failure: std::sync::Mutex<Option<(bool, String)>>,
    }

    impl FakeGroup {
        fn new() -> Self {
            Self {
                info: std::sync::Mutex::new(GroupInfo {
                    title: "Group".to_string(),
                    description: Some("About".to_string()),
                    invite_link: None,
                    member_count: 10,
                }),
                admins: std::sync::Mutex::new(vec![admin(SELLER, true), admin(BOT, false)]),
                failure: std::sync::Mutex::new(None),
            }
        }

        fn fail(&self, transient: bool, message: &str) {
            *self.failure.lock().unwrap() = Some((transient, message.to_string()));
        }
    }

    fn admin(user_id: TelegramId, is_creator: bool) -> GroupAdmin {
        GroupAdmin {
            user_id,
            username: None,
            is_creator,
        }
    }

    #[async_trait]
    impl GroupInspector for FakeGroup {
        async fn group_info(&self, _group: &GroupRef) -> EscrowResult<GroupInfo> {
            match self.failure.lock().unwrap().clone() {
                Some((true, message)) => Err(EscrowError::transient(message)),
                Some((false, message)) => Err(EscrowError::external_api(message)),
                None => Ok(self.info.lock().unwrap().clone()),
            }
        }

        async fn administrators(&self, _group: &GroupRef) -> EscrowResult<Vec<GroupAdmin>> {
            Ok(self.admins.lock().unwrap().clone())
        }

        fn bot_id(&self) -> Option<TelegramId> {
            Some(BOT)
        }
    }

    #[async_trait]
    impl OwnershipVerifier for FakeGroup {
        async fn check(&self, _group: &GroupRef, user_id: TelegramId) -> EscrowResult<OwnershipStatus> {
            let admins = self.admins.lock().unwrap();
            Ok(match admins.iter().find(|a| a.user_id == user_id) {
                Some(a) if a.is_creator => OwnershipStatus::from_member_status("creator"),
                Some(_) => OwnershipStatus::from_member_status("administrator"),
                None => OwnershipStatus::default(),
            })
        }
    }

    async fn monitored_node(clock: &ManualClock) -> (EscrowNode, Arc<FakeGroup>, Listing) {
        let group = Arc::new(FakeGroup::new());
        let node = EscrowNode::with_components(
            EscrowNodeConfig::default(),
            group.clone(),
            Arc::new(LedgerSettlement::new()),
            Arc::new(clock.clone()),
        )
        .unwrap()
        .with_group_monitor(group.clone());

        node.users().register(1, None).await.unwrap();
        node.users().register(SELLER, None).await.unwrap();
        let listing = node
            .listings()
            .create_listing(CreateListingRequest {
                owner_id: SELLER,
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
        let listing = node.listings().verify_listing(listing.id, SELLER).await.unwrap();

        (node, group, listing)
    }

    #[tokio::test]
    async fn test_first_pass_records_baseline() {
        let clock = ManualClock::new(Utc::now());
        let (node, _group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();

        let report = monitor.run_once().await;
        assert_eq!(report, MonitorReport { checked: 1, flagged: 0, suspended: 0 });

        let snapshot = monitor.snapshot(listing.id).await.unwrap();
        assert_eq!(snapshot.creator, Some(SELLER));
        assert_eq!(snapshot.description_hash, description_hash(Some("About")));

        // Not due again until the recheck interval passes
        assert_eq!(monitor.run_once().await.checked, 0);
    }

    #[tokio::test]
    async fn test_admin_and_member_changes_are_flagged() {
        let clock = ManualClock::new(Utc::now());
        let (node, group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();
        monitor.run_once().await;

        group.admins.lock().unwrap().push(admin(77, false));
        group.info.lock().unwrap().member_count = 25;
        clock.advance(Duration::minutes(31));

        let report = monitor.run_once().await;
        assert_eq!(report.flagged, 1);
        assert_eq!(report.suspended, 0);

        let flags = monitor.flags().await;
        assert!(flags[0].changes.contains(&GroupChange::MemberCountChanged { from: 10, to: 25 }));
        assert!(flags[0].changes.contains(&GroupChange::AdminAdded {
            user_id: 77,
            username: None
        }));

        let listing = node.listings().get_listing(listing.id).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.member_count, 25);
    }

    #[tokio::test]
    async fn test_lost_bot_suspends_listing() {
        let clock = ManualClock::new(Utc::now());
        let (node, group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();

        group.admins.lock().unwrap().retain(|a| a.user_id != BOT);
        let report = monitor.run_once().await;
        assert_eq!(report.suspended, 1);

        let listing = node.listings().get_listing(listing.id).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Suspended);
        assert!(!listing.active);

        // Suspended listings drop out of later passes
        clock.advance(Duration::hours(1));
        assert_eq!(monitor.run_once().await.checked, 0);
    }

    #[tokio::test]
    async fn test_unreadable_group_suspends_but_outage_does_not() {
        let clock = ManualClock::new(Utc::now());
        let (node, group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();

        group.fail(true, "Telegram error 502");
        assert_eq!(monitor.run_once().await, MonitorReport::default());
        assert!(monitor.snapshot(listing.id).await.is_none());

        group.fail(false, "Bad Request: chat not found");
        let report = monitor.run_once().await;
        assert_eq!(report.suspended, 1);
        assert!(matches!(
            monitor.flags().await[0].changes[0],
            GroupChange::BotRemoved { .. }
        ));
    }

    #[tokio::test]
    async fn test_new_creator_suspends_unclaimed_listing() {
        let clock = ManualClock::new(Utc::now());
        let (node, group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();

        *group.admins.lock().unwrap() = vec![admin(31337, true), admin(BOT, false)];
        let flag = monitor.check_listing(&listing).await.unwrap().unwrap();
        assert!(flag.suspended);
        assert!(flag.changes.contains(&GroupChange::OwnerChanged {
            expected: SELLER,
            found: Some(31337)
        }));
    }

    #[tokio::test]
    async fn test_claimed_listing_is_left_alone() {
        let clock = ManualClock::new(Utc::now());
        let (node, group, listing) = monitored_node(&clock).await;
        let monitor = node.monitor().unwrap();

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
        node.manager()
            .apply_gateway_event(GatewayEvent {
                event_id: "evt-1".to_string(),
                transaction_id: tx.id,
                kind: GatewayEventKind::ChargeConfirmed,
                payment_ref: None,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        // Handover in progress: the buyer is taking over
        *group.admins.lock().unwrap() = vec![admin(1, true), admin(BOT, false)];
        assert_eq!(monitor.run_once().await, MonitorReport::default());
        assert_eq!(
            node.listings().get_listing(listing.id).await.unwrap().status,
            ListingStatus::Active
        );
    }
}
