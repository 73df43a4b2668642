//! Listing Registry - Telegram groups offered for sale
//!
//! A listing starts as a draft and only becomes purchasable after the
//! ownership oracle confirms the seller created the group.

use crate::{
    clock::Clock,
    error::EscrowError,
    models::{Category, Currency, Listing, ListingStatus, TelegramId},
    ownership::{GroupRef, OwnershipVerifier, RetryPolicy},
    EscrowResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

/// Listing creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateListingRequest {
    pub owner_id: TelegramId,
    pub group_id: i64,
    pub group_username: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub member_count: u32,
    pub price: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub category: Category,
}

/// Filter for browsing listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingQuery {
    pub category: Option<Category>,
    /// Case-insensitive match on title or description
    pub search: Option<String>,
    pub limit: Option<usize>,
}

/// Main listing registry
pub struct ListingRegistry {
    listings: Arc<RwLock<HashMap<Uuid, Listing>>>,
    verifier: Arc<dyn OwnershipVerifier>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ListingRegistry {
    /// Create a new listing registry
    pub fn new(verifier: Arc<dyn OwnershipVerifier>, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            listings: Arc::new(RwLock::new(HashMap::new())),
            verifier,
            retry,
            clock,
        }
    }

    /// Create a draft listing
    pub async fn create_listing(&self, request: CreateListingRequest) -> EscrowResult<Listing> {
        if request.title.trim().is_empty() {
            return Err(EscrowError::validation("Listing title cannot be empty"));
        }
        if request.price <= Decimal::ZERO {
            return Err(EscrowError::validation("Listing price must be positive"));
        }

        let mut listings = self.listings.write().await;
        let duplicate = listings.values().any(|l| {
            l.group_id == request.group_id
                && matches!(l.status, ListingStatus::Draft | ListingStatus::Active)
        });
        if duplicate {
            return Err(EscrowError::validation(format!(
                "Group {} already has an open listing",
                request.group_id
            )));
        }

        let now = self.clock.now();
        let listing = Listing {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            group_id: request.group_id,
            group_username: request.group_username,
            title: request.title,
            description: request.description,
            member_count: request.member_count,
            price: request.price,
            currency: request.currency,
            category: request.category,
            verified_ownership: false,
            active: false,
            status: ListingStatus::Draft,
            created_at: now,
            updated_at: now,
            last_verified: None,
        };

        listings.insert(listing.id, listing.clone());
        info!("Created listing {} for group {}", listing.id, listing.group_id);

        Ok(listing)
    }

    /// Confirm the owner created the group and activate the listing
    pub async fn verify_listing(&self, listing_id: Uuid, requester: TelegramId) -> EscrowResult<Listing> {
        let listing = self.get_listing(listing_id).await?;

        if listing.owner_id != requester {
            return Err(EscrowError::unauthorized("Only the listing owner can verify it"));
        }
        if matches!(listing.status, ListingStatus::Sold | ListingStatus::Suspended) {
            return Err(EscrowError::validation(format!(
                "Listing {} cannot be verified while {:?}",
                listing_id, listing.status
            )));
        }

        let group = GroupRef {
            chat_id: listing.group_id,
            username: listing.group_username.clone(),
        };
        let status = self
            .retry
            .run("listing ownership check", || {
                self.verifier.check(&group, listing.owner_id)
            })
            .await?;

        if !status.is_creator {
            warn!(
                "Listing {} owner {} is not the creator of group {}",
                listing_id, listing.owner_id, listing.group_id
            );
            return Err(EscrowError::ownership_unverified(format!(
                "User {} is not the creator of group {}",
                listing.owner_id, listing.group_id
            )));
        }

        let now = self.clock.now();
        let updated = self
            .update(listing_id, |l| {
                // Status may have moved while the oracle was consulted
                if l.status == ListingStatus::Suspended {
                    return Err(EscrowError::validation("Listing was suspended"));
                }
                l.verified_ownership = true;
                l.last_verified = Some(now);
                if l.status == ListingStatus::Draft {
                    l.status = ListingStatus::Active;
                    l.active = true;
                }
                Ok(())
            })
            .await?;

        info!("Verified ownership for listing {}", listing_id);
        Ok(updated)
    }

    /// Get a listing
    pub async fn get_listing(&self, listing_id: Uuid) -> EscrowResult<Listing> {
        self.listings
            .read()
            .await
            .get(&listing_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))
    }

    /// Active listings, newest first
    pub async fn list_active(&self, query: &ListingQuery) -> Vec<Listing> {
        let needle = query
            .search
            .as_ref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

        let mut listings: Vec<Listing> = self
            .listings
            .read()
            .await
            .values()
            .filter(|l| l.active && l.status == ListingStatus::Active)
            .filter(|l| query.category.map_or(true, |c| l.category == c))
            .filter(|l| {
                needle.as_ref().map_or(true, |n| {
                    l.title.to_lowercase().contains(n) || l.description.to_lowercase().contains(n)
                })
            })
            .cloned()
            .collect();

        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listings.truncate(limit);
        listings
    }

    /// Every active listing, for the group monitor
    pub async fn monitored(&self) -> Vec<Listing> {
        self.listings
            .read()
            .await
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .cloned()
            .collect()
    }

    /// Record the member count seen by the group monitor
    pub async fn refresh_member_count(&self, listing_id: Uuid, member_count: u32) -> EscrowResult<Listing> {
        let now = self.clock.now();
        self.update(listing_id, |l| {
            l.member_count = member_count;
            l.last_verified = Some(now);
            Ok(())
        })
        .await
    }

    /// Take a listing off the market after a completed sale
    pub async fn mark_sold(&self, listing_id: Uuid) -> EscrowResult<Listing> {
        let listing = self
            .update(listing_id, |l| {
                l.status = ListingStatus::Sold;
                l.active = false;
                Ok(())
            })
            .await?;
        info!("Listing {} sold", listing_id);
        Ok(listing)
    }

    /// Suspend a listing
    pub async fn suspend(&self, listing_id: Uuid) -> EscrowResult<Listing> {
        let listing = self
            .update(listing_id, |l| {
                if l.status == ListingStatus::Sold {
                    return Err(EscrowError::validation("Sold listings cannot be suspended"));
                }
                l.status = ListingStatus::Suspended;
                l.active = false;
                Ok(())
            })
            .await?;
        warn!("Suspended listing {}", listing_id);
        Ok(listing)
    }

    async fn update<F>(&self, listing_id: Uuid, update_fn: F) -> EscrowResult<Listing>
    where
        F: FnOnce(&mut Listing) -> EscrowResult<()>,
    {
        let mut listings = self.listings.write().await;
        let listing = listings
            .get_mut(&listing_id)
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))?;

        update_fn(listing)?;
        listing.updated_at = self.clock.now();

        Ok(listing.clone())
    }
}
