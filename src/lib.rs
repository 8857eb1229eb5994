//! # Kirppu - escrow marketplace core
//!
//! The state machines and fund accounting behind a second-hand marketplace
//! with escrow-style settlement.
//!
//! ## Architecture
//!
//! - **Listing Lifecycle**: moderation + physical logistics state machine,
//!   with one-time deposit/withdrawal codes scanned at the store counter
//! - **Negotiation Protocol**: offer/counter-offer state machine layered on
//!   a two-party chat thread per listing
//! - **Ledger**: commission splits, escrow transactions, wallet balances
//!   and payout requests
//! - **Settlement Orchestrator**: direct purchase, accepted-offer payment
//!   and withdrawal-triggered fund release
//! - **Store**: SQLite persistence; every guarded transition is a
//!   conditional update so concurrent callers get exactly one winner
//! - **Notifier**: fire-and-forget broadcast of row changes to push
//!   subscribers after a successful commit

pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod listing;
pub mod model;
pub mod negotiation;
pub mod notify;
pub mod settlement;

pub use config::AppConfig;
pub use database::Database;
pub use error::{MarketError, Result};
pub use ledger::{CommissionSplit, Ledger, PayoutDecision, COMMISSION_RATE};
pub use listing::{ConformityVerdict, ListingService, ModerationDecision};
pub use model::{Listing, Offer, PayoutRequest, Transaction};
pub use negotiation::{NegotiationService, OfferAction};
pub use notify::{ChangeEvent, Notifier, Topic};
pub use settlement::{ScanMode, SettlementService};

pub type UserId = uuid::Uuid;
pub type ListingId = uuid::Uuid;
pub type ConversationId = uuid::Uuid;
pub type MessageId = uuid::Uuid;
pub type OfferId = uuid::Uuid;
pub type TransactionId = uuid::Uuid;
pub type PayoutId = uuid::Uuid;
