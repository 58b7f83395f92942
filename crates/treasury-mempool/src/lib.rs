// SPDX-License-Identifier: MIT

//! A multisig treasury proposal pool for Bitcoin-derived nodes.
//!
//! This crate implements the treasury proposal transaction engine: a bounded,
//! persisted pool of governance proposals, each carrying a partially-built
//! funding transaction that several signers cooperatively assemble, vote on,
//! sign and broadcast.
//!
//! # Overview
//!
//! The pool serves as a shared staging area for treasury spending:
//!
//! - **Proposal tracking**: Versioned proposals with headline, description,
//!   expiry and an embedded mutable transaction
//! - **Input allocation**: Keeps every proposal transaction within the
//!   per-transaction input cap, pruning spent inputs and redistributing
//!   displaced ones as change
//! - **Cooperative signing**: Builds a temporary key/script store from
//!   supplied private keys and the registered redeem scripts, and partially
//!   signs every agreed proposal
//! - **Broadcast**: Verifies, submits and relays finished transactions with
//!   exactly-once semantics
//!
//! Chain state, transaction acceptance and peer relay are consumed through
//! the narrow traits in [`chain`], never owned by this crate.

pub mod allocator;
pub mod broadcast;
pub mod chain;
pub mod error;
pub mod mempool;
pub mod proposal;
pub mod registry;
pub mod signer;

pub use broadcast::BroadcastOutcome;
pub use broadcast::POST_BROADCAST_LIFETIME;
pub use chain::ChainView;
pub use chain::TxBroadcaster;
pub use error::TreasuryError;
pub use mempool::TreasuryMempool;
pub use mempool::TREASURY_FILE_MAGIC;
pub use proposal::ProposalId;
pub use proposal::TreasuryProposal;
pub use proposal::MAX_TX_INPUTS;
pub use registry::RedeemScriptRegistry;
pub use signer::SigningKeystore;
pub use signer::SigningReport;
