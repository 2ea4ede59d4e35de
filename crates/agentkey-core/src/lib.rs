//! Core library for Agent Key.
//!
//! Contains the credential vault (envelope encryption behind a key
//! management boundary), policy store and engine, quota tracker, checkout
//! lifecycle, append-only audit ledger, and the bearer-token registry. The
//! [`broker::Broker`] facade ties them together. This crate depends on
//! `agentkey-storage` for the storage backend trait and knows nothing about
//! HTTP.

pub mod audit;
pub mod audit_file;
pub mod broker;
pub mod checkout;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod ids;
pub mod kms;
pub mod policy;
pub mod policy_engine;
pub mod quota;
pub mod records;
pub mod vault;
