//! Submission and relay of finished proposal transactions.
//!
//! Broadcast never trusts the pool's idea of "signed": every input is
//! re-verified against its live previous output before submission, and a
//! transaction already present in the chain or the node mempool is never
//! resubmitted. On success the proposal's expiry is pulled in to a short
//! horizon so the reaper collects it soon after, leaving observers a grace
//! window instead of deleting it synchronously.

use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Txid;
use serde::Serialize;
use tracing::info;

use crate::chain::ChainView;
use crate::chain::TxBroadcaster;
use crate::error::TreasuryError;
use crate::proposal::ProposalId;
use crate::proposal::TreasuryProposal;

/// How long a proposal lives after a successful broadcast, in seconds.
pub const POST_BROADCAST_LIFETIME: u32 = 30 * 60;

/// A successful broadcast, one way or the other.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastOutcome {
    pub id: ProposalId,
    pub txid: Txid,
    /// The node mempool already held the transaction, so submission was
    /// skipped and only the relay step ran.
    pub already_known: bool,
}

/// Verifies, submits and relays one proposal's transaction.
///
/// Blocks until the acceptance service has fully processed the submission,
/// then relays and shortens the proposal's expiry. Failure paths return
/// without mutating the proposal.
pub fn broadcast_proposal<Chain: ChainView, Relay: TxBroadcaster>(
    chain: &Chain,
    broadcaster: &Relay,
    proposal: &mut TreasuryProposal,
    max_fee: Option<Amount>,
    now: u32,
) -> Result<BroadcastOutcome, TreasuryError> {
    let txid = proposal.tx.compute_txid();

    // A transaction whose outputs are already spendable coins has been
    // mined; resubmission is pointless and the proposal is left untouched.
    let own_outputs: Vec<OutPoint> = (0..proposal.tx.output.len() as u32)
        .map(|vout| OutPoint::new(txid, vout))
        .collect();
    if !chain.fetch_coins(&own_outputs).is_empty() {
        return Err(TreasuryError::AlreadyInChain);
    }

    if broadcaster.have_transaction(&txid) {
        broadcaster.relay(txid);
        proposal.expire_time = now + POST_BROADCAST_LIFETIME;
        info!("proposal {} was already in the node mempool, relayed {txid}", proposal.id);
        return Ok(BroadcastOutcome {
            id: proposal.id,
            txid,
            already_known: true,
        });
    }

    verify_fully_signed(chain, proposal)?;

    let accepted = broadcaster.accept(proposal.tx.clone(), max_fee)?;
    accepted
        .blocking_recv()
        .map_err(|_| TreasuryError::Rejected("transaction acceptance was abandoned".into()))?;

    broadcaster.relay(txid);
    proposal.expire_time = now + POST_BROADCAST_LIFETIME;
    info!("broadcast proposal {} as {txid}", proposal.id);

    Ok(BroadcastOutcome {
        id: proposal.id,
        txid,
        already_known: false,
    })
}

/// Re-runs script verification of every input against its live previous
/// output. Anything short of full validity refuses the broadcast; a
/// partially signed transaction must never reach the network.
pub fn verify_fully_signed<Chain: ChainView>(
    chain: &Chain,
    proposal: &TreasuryProposal,
) -> Result<(), TreasuryError> {
    if proposal.tx.input.is_empty() {
        return Err(TreasuryError::NotSigned);
    }

    let outpoints: Vec<OutPoint> = proposal.tx.input.iter().map(|i| i.previous_output).collect();
    let coins = chain.fetch_coins(&outpoints);

    for (index, input) in proposal.tx.input.iter().enumerate() {
        let Some(coin) = coins.get(&input.previous_output) else {
            return Err(TreasuryError::NotSigned);
        };

        if !chain.verify_input(&proposal.tx, index, coin) {
            return Err(TreasuryError::NotSigned);
        }
    }

    Ok(())
}
