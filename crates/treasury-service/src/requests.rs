//! Typed requests and summaries crossing the service boundary.
//!
//! Every mutating operation takes a concrete request struct, validated
//! before it touches the pool. Summaries are plain serializable snapshots,
//! never live references into the locked state.

use std::path::PathBuf;

use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Txid;
use serde::Serialize;
use treasury_mempool::ProposalId;

/// Arguments for creating a proposal.
#[derive(Debug, Clone)]
pub struct CreateProposalRequest {
    pub headline: String,
    pub description: String,
}

/// One payment a proposal transaction should make.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
}

/// One previous output a proposal transaction should spend.
#[derive(Debug, Clone)]
pub struct TxInputRequest {
    pub outpoint: OutPoint,
    /// Explicit sequence number; defaults follow the locktime/replaceable
    /// flags when absent.
    pub sequence: Option<u32>,
}

/// Arguments for (re)building a proposal's transaction from scratch.
#[derive(Debug, Clone, Default)]
pub struct BuildTxRequest {
    pub inputs: Vec<TxInputRequest>,
    pub recipients: Vec<Recipient>,
    pub locktime: u32,
    /// Whether the transaction should signal BIP125 replaceability.
    pub replaceable: bool,
}

/// Arguments for a signing round over all agreed proposals.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// WIF-encoded private keys.
    pub keys: Vec<String>,
    /// Signature hash mode, `SIGHASH_ALL` when absent.
    pub sighash_type: Option<bitcoin::EcdsaSighashType>,
}

/// Snapshot of the loaded pool.
#[derive(Debug, Clone, Serialize)]
pub struct TreasuryInfo {
    pub version: u32,
    pub last_saved: u32,
    pub proposal_count: usize,
    pub redeem_script_count: usize,
    pub change_script: Option<ScriptBuf>,
    pub path: Option<PathBuf>,
    /// Size of the full file image, in bytes.
    pub serialized_size: usize,
}

/// Snapshot of one proposal's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalInfo {
    pub id: ProposalId,
    pub version: u32,
    pub creation_time: u32,
    pub last_edited: u32,
    pub expire_time: u32,
    pub headline: String,
    pub description: String,
    pub agreed: bool,
    pub txid: Txid,
    /// Size of the proposal's consensus encoding, in bytes.
    pub serialized_size: usize,
}

/// One output of a proposal's transaction, listed by position.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientInfo {
    pub index: usize,
    pub script_pubkey: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

/// Result of one proposal's attempt during a broadcast sweep.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub id: ProposalId,
    pub txid: Option<Txid>,
    /// Whether the transaction was handed to the network by this attempt.
    pub sent: bool,
    /// Whether the node mempool already carried the transaction.
    pub already_known: bool,
    pub error: Option<String>,
}

/// One registered redeem script and its positional id.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptInfo {
    pub id: usize,
    pub script: ScriptBuf,
    /// The script-hash output form the script is spent through.
    pub p2sh: ScriptBuf,
}

/// Snapshot of a proposal's transaction, with chain-resolved amounts where
/// the previous outputs could be found.
#[derive(Debug, Clone, Serialize)]
pub struct TxInfo {
    pub txid: Txid,
    pub version: i32,
    pub locktime: u32,
    pub replaceable: bool,
    pub input_count: usize,
    pub output_count: usize,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub output_value: Amount,
    /// Total value of the spent coins, when every input resolved.
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub input_value: Option<Amount>,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub fee: Option<Amount>,
    /// Serialized size in bytes, with the zero-input placeholder applied.
    pub size: usize,
    /// Whether every input passes script verification right now.
    pub fully_signed: bool,
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    #[test]
    fn test_tx_info_serializes_amounts_as_sats() {
        let info = TxInfo {
            txid: Txid::all_zeros(),
            version: 2,
            locktime: 0,
            replaceable: false,
            input_count: 1,
            output_count: 1,
            output_value: Amount::from_sat(90_000),
            input_value: Some(Amount::from_sat(100_000)),
            fee: Some(Amount::from_sat(10_000)),
            size: 250,
            fully_signed: false,
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["output_value"], 90_000);
        assert_eq!(json["input_value"], 100_000);
        assert_eq!(json["fee"], 10_000);
        assert_eq!(json["txid"], Txid::all_zeros().to_string());
    }
}
