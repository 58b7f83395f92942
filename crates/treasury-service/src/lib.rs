// SPDX-License-Identifier: MIT

//! # Treasury Service
//!
//! The control surface over the treasury proposal pool. A single
//! [`TreasuryService`] owns the zero-or-one loaded pool, serializes all
//! access behind one lock, and exposes the full operation set: pool
//! lifecycle (create/open/save/close/abort), redeem script and change
//! address management, proposal lifecycle, transaction assembly, input
//! allocation, cooperative signing and broadcast.
//!
//! Chain access and persistence are injected, so the same service runs
//! against a live node or against fixtures in tests.

pub mod requests;
pub mod service;
pub mod store;

pub use requests::BroadcastReport;
pub use requests::BuildTxRequest;
pub use requests::CreateProposalRequest;
pub use requests::ProposalInfo;
pub use requests::Recipient;
pub use requests::RecipientInfo;
pub use requests::ScriptInfo;
pub use requests::SignRequest;
pub use requests::TreasuryInfo;
pub use requests::TxInfo;
pub use requests::TxInputRequest;
pub use service::TreasuryService;
pub use store::FileStore;
pub use store::TreasuryStore;
