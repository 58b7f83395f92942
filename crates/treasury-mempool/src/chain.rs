//! Seams between the treasury engine and the node.
//!
//! The engine never owns chain state. It sees unspent coins, script
//! verification and transaction acceptance through these two traits, which a
//! node wires to its chainstate and relay layers. Tests wire them to fixtures.

use std::collections::HashMap;

use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use bitcoin::Txid;
use bitcoin::TxOut;
use tokio::sync::oneshot;

use crate::error::TreasuryError;

/// Read-only view of the active chainstate.
pub trait ChainView {
    /// Whether the node is in a state to serve coin queries and accept
    /// transactions.
    ///
    /// Returns [`TreasuryError::NoPeers`] with no connections and
    /// [`TreasuryError::InitialBlockDownload`] while still syncing.
    fn ready(&self) -> Result<(), TreasuryError>;

    /// Resolves the given outpoints against the UTXO set in one batch.
    /// Spent or unknown outpoints are simply absent from the result.
    fn fetch_coins(&self, outpoints: &[OutPoint]) -> HashMap<OutPoint, TxOut>;

    /// Runs full script verification of one input against the coin it
    /// spends.
    fn verify_input(&self, tx: &Transaction, index: usize, spent: &TxOut) -> bool;
}

/// Transaction acceptance and relay, backed by the node's mempool and its
/// peer connections.
pub trait TxBroadcaster {
    /// Whether the node mempool already holds this transaction.
    fn have_transaction(&self, txid: &Txid) -> bool;

    /// Submits a transaction for mempool acceptance.
    ///
    /// Acceptance is asynchronous on the node side; the returned channel
    /// fires once the transaction has been fully processed. Outright
    /// rejections surface as [`TreasuryError::Rejected`] or
    /// [`TreasuryError::MissingInputs`].
    fn accept(
        &self,
        tx: Transaction,
        max_fee: Option<Amount>,
    ) -> Result<oneshot::Receiver<()>, TreasuryError>;

    /// Announces the transaction to all connected peers.
    fn relay(&self, txid: Txid);
}
