//! Escrow backend for a Telegram group marketplace
//!
//! This crate holds a buyer's payment until the buyer is verified as the new
//! owner of the purchased group:
//! - an explicit state machine for each escrow transaction
//! - Coinbase Commerce webhooks as the funding signal
//! - the Telegram Bot API as the ownership oracle
//! - a settlement rail mirroring the escrow contract interface
//! - a group monitor that suspends listings whose group changed hands

pub mod clock;
pub mod error;
pub mod group_monitor;
pub mod lifecycle;
pub mod listing_registry;
pub mod models;
pub mod node;
pub mod ownership;
pub mod payment_gateway;
pub mod settings;
pub mod settlement;
pub mod sweeper;
pub mod transaction_manager;
pub mod user_registry;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
