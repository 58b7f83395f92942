//! Input allocation: keeps every proposal transaction within the hard input
//! cap while salvaging displaced value instead of discarding it.
//!
//! Spent inputs are pruned as routine maintenance, inputs beyond the cap are
//! stripped of their unlock scripts and parked in an overflow pool, and
//! proposals with spare capacity refill from that pool. Value pulled in
//! during a refill is paid back to the shared change address as one output.
//!
//! Two entry points exist: [`rebalance_inputs`] sweeps every proposal, and
//! [`move_overflow`] shifts overflow from one explicit proposal to another.
//! Both uphold the same invariants: no duplicate previous-output reference
//! anywhere in the pool, no proposal above [`MAX_TX_INPUTS`], no spent input
//! retained.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Witness;
use tracing::debug;
use tracing::warn;

use crate::chain::ChainView;
use crate::error::TreasuryError;
use crate::proposal::TreasuryProposal;
use crate::proposal::MAX_TX_INPUTS;

/// Rebalances every proposal in the pool, returning how many were modified.
///
/// Coin lookups are batched up front so the chain view is touched once,
/// before any mutation starts. Only proposals whose transaction actually
/// changed get their timestamps bumped, so a second run with no intervening
/// chain activity is a no-op.
pub fn rebalance_inputs<Chain: ChainView>(
    chain: &Chain,
    proposals: &mut [TreasuryProposal],
    change_script: &ScriptBuf,
    now: u32,
) -> usize {
    let outpoints: Vec<OutPoint> = proposals
        .iter()
        .flat_map(|p| p.tx.input.iter().map(|i| i.previous_output))
        .collect();
    let coins = chain.fetch_coins(&outpoints);

    let mut changed = vec![false; proposals.len()];
    let mut pool = VecDeque::new();

    for (i, proposal) in proposals.iter_mut().enumerate() {
        changed[i] |= prune_spent(proposal, &coins);

        let stripped = strip_overflow(proposal);
        if !stripped.is_empty() {
            changed[i] = true;
            pool.extend(stripped);
        }
    }

    dedup_pool(&mut pool);

    // An input backs at most one proposal: the first proposal holding a
    // previous-output keeps it, later holders lose it. Pool entries already
    // claimed by any proposal are dropped as well.
    let mut claimed = HashSet::new();
    for (i, proposal) in proposals.iter_mut().enumerate() {
        for j in (0..proposal.tx.input.len()).rev() {
            if !claimed.insert(proposal.tx.input[j].previous_output) {
                proposal.tx.input.remove(j);
                changed[i] = true;
            }
        }
    }
    pool.retain(|input| !claimed.contains(&input.previous_output));

    for (i, proposal) in proposals.iter_mut().enumerate() {
        changed[i] |= refill(proposal, &mut pool, &coins, change_script);
    }

    if !pool.is_empty() {
        warn!(
            "{} overflow inputs could not be placed, every proposal is full",
            pool.len()
        );
    }

    let mut touched = 0;
    for (i, proposal) in proposals.iter_mut().enumerate() {
        if changed[i] {
            proposal.update_timestamps(now);
            touched += 1;
        }
    }

    debug!("input rebalance touched {touched} proposals");
    touched
}

/// Moves overflow inputs from one proposal into another.
///
/// Fails fast if `from` is not actually overflowed, `to` is already at the
/// cap, or both indices name the same proposal.
pub fn move_overflow<Chain: ChainView>(
    chain: &Chain,
    proposals: &mut [TreasuryProposal],
    from: usize,
    to: usize,
    change_script: &ScriptBuf,
    now: u32,
) -> Result<(), TreasuryError> {
    if from == to {
        return Err(TreasuryError::SameProposal);
    }

    if proposals[from].tx.input.len() <= MAX_TX_INPUTS {
        return Err(TreasuryError::NotOverflowed);
    }

    if proposals[to].tx.input.len() >= MAX_TX_INPUTS {
        return Err(TreasuryError::AlreadyOverflowed);
    }

    let outpoints: Vec<OutPoint> = proposals[from]
        .tx
        .input
        .iter()
        .map(|i| i.previous_output)
        .collect();
    let coins = chain.fetch_coins(&outpoints);

    let (source, destination) = pair_mut(proposals, from, to);

    let mut source_changed = prune_spent(source, &coins);

    let mut pool: VecDeque<TxIn> = strip_overflow(source).into();
    source_changed |= !pool.is_empty();

    dedup_pool(&mut pool);

    let held: HashSet<OutPoint> = destination
        .tx
        .input
        .iter()
        .map(|i| i.previous_output)
        .collect();
    pool.retain(|input| !held.contains(&input.previous_output));

    let destination_changed = refill(destination, &mut pool, &coins, change_script);

    if !pool.is_empty() {
        warn!(
            "{} overflow inputs could not be placed, destination proposal is full",
            pool.len()
        );
    }

    if source_changed {
        source.update_timestamps(now);
    }
    if destination_changed {
        destination.update_timestamps(now);
    }

    Ok(())
}

/// Drops every input whose previous output no longer exists in the resolved
/// coin set. A spent input is routine pruning, never an error.
fn prune_spent(proposal: &mut TreasuryProposal, coins: &HashMap<OutPoint, TxOut>) -> bool {
    let before = proposal.tx.input.len();
    for i in (0..proposal.tx.input.len()).rev() {
        if !coins.contains_key(&proposal.tx.input[i].previous_output) {
            proposal.tx.input.remove(i);
        }
    }

    proposal.tx.input.len() != before
}

/// Splits off every input beyond the cap, blanking the unlock scripts since
/// displaced inputs must be re-signed wherever they land.
fn strip_overflow(proposal: &mut TreasuryProposal) -> Vec<TxIn> {
    if proposal.tx.input.len() <= MAX_TX_INPUTS {
        return Vec::new();
    }

    let mut stripped = proposal.tx.input.split_off(MAX_TX_INPUTS);
    for input in stripped.iter_mut() {
        input.script_sig = ScriptBuf::new();
        input.witness = Witness::new();
    }

    stripped
}

/// Removes every copy of a previous output that appears more than once in
/// the pool. Ownership of a duplicated input is ambiguous, so all copies are
/// conservatively dropped rather than guessing which one is canonical.
fn dedup_pool(pool: &mut VecDeque<TxIn>) {
    let mut seen: HashMap<OutPoint, usize> = HashMap::new();
    for input in pool.iter() {
        *seen.entry(input.previous_output).or_default() += 1;
    }

    pool.retain(|input| seen[&input.previous_output] == 1);
}

/// Pulls inputs from the front of the pool until the proposal is full or the
/// pool runs dry, paying the pulled value to the change script as one
/// output.
fn refill(
    proposal: &mut TreasuryProposal,
    pool: &mut VecDeque<TxIn>,
    coins: &HashMap<OutPoint, TxOut>,
    change_script: &ScriptBuf,
) -> bool {
    let mut pulled = Amount::ZERO;
    let mut changed = false;

    while proposal.tx.input.len() < MAX_TX_INPUTS {
        let Some(input) = pool.pop_front() else {
            break;
        };

        if let Some(coin) = coins.get(&input.previous_output) {
            pulled += coin.value;
        }

        proposal.tx.input.push(input);
        changed = true;
    }

    if pulled > Amount::ZERO {
        proposal.tx.output.push(TxOut {
            value: pulled,
            script_pubkey: change_script.clone(),
        });
    }

    changed
}

/// Mutable references to two distinct slice elements.
fn pair_mut(
    proposals: &mut [TreasuryProposal],
    a: usize,
    b: usize,
) -> (&mut TreasuryProposal, &mut TreasuryProposal) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = proposals.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = proposals.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}
