//! # Yield Router
//!
//! Pooled vault that routes deposited capital across pluggable yield
//! strategies, weighting each by yield against risk and keeping an idle
//! buffer for withdrawals.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `backend`: Strategy capability contract, call timeouts, funds rails
//! - `strategy`: Registry, allocation, rebalancing and emergency exits
//! - `risk`: Risk oracle boundary and impairment monitoring
//! - `vault`: Share accounting, event ledger and the operator surface
//! - `persistence`: SQLite event store for replay across restarts
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backend;
pub mod config;
pub mod error;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use error::{VaultError, VaultResult};
pub use vault::Vault;
