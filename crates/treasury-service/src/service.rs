//! The treasury service: single owner of the active pool.
//!
//! The process holds exactly zero or one loaded [`TreasuryMempool`]. One
//! exclusive lock serializes every operation for its whole duration,
//! including the submit-relay sequence of a broadcast, so callers never
//! observe a half-applied mutation. Chain state is only touched through the
//! injected [`ChainView`], and persistence through the injected
//! [`TreasuryStore`]; the service owns no globals.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::deserialize;
use bitcoin::transaction::Version;
use bitcoin::Amount;
use bitcoin::EcdsaSighashType;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Witness;
use tracing::debug;
use tracing::info;
use treasury_common::unix_now;
use treasury_mempool::allocator;
use treasury_mempool::broadcast::broadcast_proposal;
use treasury_mempool::broadcast::verify_fully_signed;
use treasury_mempool::proposal::empty_tx;
use treasury_mempool::proposal::EXTEND_THRESHOLD;
use treasury_mempool::signer::sign_agreed_proposals;
use treasury_mempool::signer::SigningKeystore;
use treasury_mempool::signer::SigningReport;
use treasury_mempool::BroadcastOutcome;
use treasury_mempool::ChainView;
use treasury_mempool::ProposalId;
use treasury_mempool::TreasuryError;
use treasury_mempool::TreasuryMempool;
use treasury_mempool::TreasuryProposal;
use treasury_mempool::TxBroadcaster;

use crate::requests::BroadcastReport;
use crate::requests::BuildTxRequest;
use crate::requests::CreateProposalRequest;
use crate::requests::ProposalInfo;
use crate::requests::Recipient;
use crate::requests::RecipientInfo;
use crate::requests::ScriptInfo;
use crate::requests::SignRequest;
use crate::requests::TreasuryInfo;
use crate::requests::TxInfo;
use crate::store::TreasuryStore;

/// Fee ceiling applied to broadcasts unless the caller opts out.
pub const DEFAULT_MAX_BROADCAST_FEE: Amount = Amount::from_sat(10_000_000);

struct State {
    pool: Option<TreasuryMempool>,
    path: Option<PathBuf>,
}

/// The process-wide treasury engine. Construct one at the composition root
/// and hand references to every entry point.
pub struct TreasuryService<Chain, Relay, Store> {
    chain: Chain,
    broadcaster: Relay,
    store: Store,
    state: Mutex<State>,
}

impl<Chain, Relay, Store> TreasuryService<Chain, Relay, Store>
where
    Chain: ChainView,
    Relay: TxBroadcaster,
    Store: TreasuryStore,
{
    pub fn new(chain: Chain, broadcaster: Relay, store: Store) -> Self {
        TreasuryService {
            chain,
            broadcaster,
            store,
            state: Mutex::new(State {
                pool: None,
                path: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("treasury lock poisoned")
    }

    // ---- pool lifecycle ----

    /// Creates a fresh pool and writes its file immediately.
    pub fn create(&self, path: PathBuf) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        if state.pool.is_some() {
            return Err(TreasuryError::AlreadyLoaded);
        }

        let mut pool = TreasuryMempool::new();
        pool.last_saved = unix_now();
        self.store.dump(&path, &pool)?;

        info!("created treasury mempool at {}", path.display());
        state.pool = Some(pool);
        state.path = Some(path);
        Ok(())
    }

    /// Loads an existing pool from disk.
    pub fn open(&self, path: PathBuf) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        if state.pool.is_some() {
            return Err(TreasuryError::AlreadyLoaded);
        }

        let pool = self.store.load(&path)?;
        info!(
            "opened treasury mempool at {} with {} proposals",
            path.display(),
            pool.proposals.len()
        );
        state.pool = Some(pool);
        state.path = Some(path);
        Ok(())
    }

    /// Persists the pool to its current path.
    pub fn save(&self) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        self.save_locked(&mut state)
    }

    /// Persists the pool to a new path, which becomes the current one.
    pub fn save_as(&self, path: PathBuf) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let previous = pool.last_saved;
        pool.last_saved = unix_now();
        if let Err(err) = self.store.dump(&path, pool) {
            pool.last_saved = previous;
            return Err(err);
        }

        state.path = Some(path);
        Ok(())
    }

    /// Saves and unloads the pool.
    pub fn close(&self) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        self.save_locked(&mut state)?;

        state.pool = None;
        state.path = None;
        info!("closed treasury mempool");
        Ok(())
    }

    /// Unloads the pool without saving, discarding unsaved changes.
    pub fn abort(&self) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        if state.pool.is_none() {
            return Err(TreasuryError::NotLoaded);
        }

        state.pool = None;
        state.path = None;
        info!("aborted treasury mempool, unsaved changes discarded");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().pool.is_some()
    }

    pub fn info(&self) -> Result<TreasuryInfo, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;

        Ok(TreasuryInfo {
            version: pool.version,
            last_saved: pool.last_saved,
            proposal_count: pool.proposals.len(),
            redeem_script_count: pool.scripts.len(),
            change_script: pool.change_script().cloned(),
            path: state.path.clone(),
            serialized_size: pool.to_file_bytes().len(),
        })
    }

    /// Saves with the timestamp staged first: a failed write leaves the
    /// in-memory pool exactly as it was.
    fn save_locked(&self, state: &mut MutexGuard<'_, State>) -> Result<(), TreasuryError> {
        let path = state.path.clone().ok_or(TreasuryError::NotLoaded)?;
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let previous = pool.last_saved;
        pool.last_saved = unix_now();
        if let Err(err) = self.store.dump(&path, pool) {
            pool.last_saved = previous;
            return Err(err);
        }

        debug!("saved treasury mempool to {}", path.display());
        Ok(())
    }

    // ---- redeem scripts ----

    pub fn add_redeem_script(&self, script: ScriptBuf) -> Result<usize, TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        pool.add_redeem_script(script)
    }

    pub fn remove_redeem_script(&self, id: usize) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        pool.scripts.remove(id)?;
        Ok(())
    }

    pub fn clear_redeem_scripts(&self) -> Result<usize, TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        if pool.scripts.is_empty() {
            return Err(TreasuryError::NoRedeemScripts);
        }

        let count = pool.scripts.len();
        pool.scripts.clear();
        Ok(count)
    }

    pub fn get_redeem_script(&self, id: usize) -> Result<ScriptInfo, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        Ok(script_info(id, pool.scripts.get(id)?))
    }

    pub fn list_redeem_scripts(&self) -> Result<Vec<ScriptInfo>, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;

        Ok(pool
            .scripts
            .iter()
            .enumerate()
            .map(|(id, script)| script_info(id, script))
            .collect())
    }

    // ---- change address ----

    pub fn set_change_script(&self, script: ScriptBuf) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        pool.set_change_script(script)
    }

    pub fn clear_change_script(&self) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        pool.clear_change_script()
    }

    pub fn change_script(&self) -> Result<ScriptBuf, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        pool.change_script()
            .cloned()
            .ok_or(TreasuryError::NoChangeAddress)
    }

    // ---- proposals ----

    pub fn create_proposal(&self, req: CreateProposalRequest) -> Result<ProposalId, TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = TreasuryProposal::new(req.headline, req.description, unix_now())?;
        let id = proposal.id;
        pool.insert_proposal(proposal);

        info!("created treasury proposal {id}");
        Ok(id)
    }

    /// Marks the proposal expired right now and reaps it together with any
    /// other proposal that has lapsed in the meantime.
    pub fn delete_proposal(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let now = unix_now();
        pool.proposal_mut(id)?.expire_time = now;
        pool.delete_expired_proposals(now);

        info!("deleted treasury proposal {id}");
        Ok(())
    }

    /// Reaps every expired proposal, returning how many were removed.
    pub fn reap_expired(&self) -> Result<usize, TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        Ok(pool.delete_expired_proposals(unix_now()))
    }

    /// Renews a proposal's lifetime, but only once it is actually about to
    /// expire. Extending one with over a week left is refused.
    pub fn extend_proposal(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let now = unix_now();
        let proposal = pool.proposal_mut(id)?;
        if proposal.expire_time > now && proposal.expire_time - now >= EXTEND_THRESHOLD {
            return Err(TreasuryError::NotAboutToExpire);
        }

        proposal.update_timestamps(now);
        Ok(())
    }

    pub fn vote_proposal(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        proposal.set_agreed()?;
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn unvote_proposal(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        proposal.unset_agreed()?;
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn get_proposal(&self, id: &ProposalId) -> Result<ProposalInfo, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        Ok(proposal_info(pool.proposal(id)?))
    }

    pub fn list_proposals(&self) -> Result<Vec<ProposalInfo>, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        Ok(pool.proposals.iter().map(proposal_info).collect())
    }

    pub fn clear_proposals(&self) -> Result<usize, TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        if pool.proposals.is_empty() {
            return Err(TreasuryError::NoProposals);
        }

        let count = pool.proposals.len();
        pool.proposals.clear();
        Ok(count)
    }

    // ---- proposal transactions ----

    /// Replaces the proposal's transaction with one built from the request.
    /// Rebuilding an identical transaction is reported, not silently
    /// re-stored.
    pub fn build_tx(&self, id: &ProposalId, req: BuildTxRequest) -> Result<(), TreasuryError> {
        let tx = build_transaction(&req)?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        if proposal.tx == tx {
            return Err(TreasuryError::TxUpToDate);
        }

        proposal.tx = tx;
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    /// Replaces the proposal's transaction with an externally assembled one,
    /// as exchanged between signers in raw form.
    pub fn set_tx_from_bytes(&self, id: &ProposalId, bytes: &[u8]) -> Result<(), TreasuryError> {
        let tx: Transaction = deserialize(bytes)?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        if proposal.tx.compute_txid() == tx.compute_txid() {
            return Err(TreasuryError::TxUpToDate);
        }

        proposal.tx = tx;
        proposal.remove_dummy_input_if_needed();
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    /// The raw transaction for hand-off to other signers.
    pub fn tx_bytes(&self, id: &ProposalId) -> Result<Vec<u8>, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        Ok(pool.proposal(id)?.tx_bytes())
    }

    pub fn clear_tx(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        proposal.tx = empty_tx();
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn add_recipients(
        &self,
        id: &ProposalId,
        recipients: Vec<Recipient>,
    ) -> Result<(), TreasuryError> {
        if recipients.iter().any(|r| r.amount == Amount::ZERO) {
            return Err(TreasuryError::InvalidAmount);
        }

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        proposal.tx.output.extend(recipients.into_iter().map(|r| TxOut {
            value: r.amount,
            script_pubkey: r.script_pubkey,
        }));
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn remove_recipient(&self, id: &ProposalId, index: usize) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        if index >= proposal.tx.output.len() {
            return Err(TreasuryError::RecipientOutOfRange);
        }

        proposal.tx.output.remove(index);
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn clear_recipients(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        proposal.tx.output.clear();
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    pub fn set_recipient_amount(
        &self,
        id: &ProposalId,
        index: usize,
        amount: Amount,
    ) -> Result<(), TreasuryError> {
        if amount == Amount::ZERO {
            return Err(TreasuryError::InvalidAmount);
        }

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        let proposal = pool.proposal_mut(id)?;
        if index >= proposal.tx.output.len() {
            return Err(TreasuryError::RecipientOutOfRange);
        }

        proposal.tx.output[index].value = amount;
        proposal.update_timestamps(unix_now());
        Ok(())
    }

    /// Normalizes a proposal's transaction for a signing round: prunes spent
    /// inputs, enforces the input cap, blanks stale signatures and rebuilds
    /// the outputs as a single full-value payment to the change address.
    pub fn prepare_tx(&self, id: &ProposalId) -> Result<(), TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        let change_script = pool
            .change_script()
            .cloned()
            .ok_or(TreasuryError::NoChangeAddress)?;

        let index = pool
            .find_proposal_index(id)
            .ok_or(TreasuryError::ProposalNotFound(*id))?;
        let proposal = &mut pool.proposals[index];

        let outpoints: Vec<_> = proposal.tx.input.iter().map(|i| i.previous_output).collect();
        let coins = self.chain.fetch_coins(&outpoints);

        proposal
            .tx
            .input
            .retain(|input| coins.contains_key(&input.previous_output));
        proposal.remove_overflowed_inputs();
        proposal.clear_input_signatures();

        let total = proposal
            .tx
            .input
            .iter()
            .filter_map(|input| coins.get(&input.previous_output))
            .map(|coin| coin.value)
            .sum::<Amount>();

        // Recipients stay in place but carry no value until the signers
        // split the change output up again.
        for output in proposal.tx.output.iter_mut() {
            output.value = Amount::ZERO;
        }
        if total > Amount::ZERO {
            proposal.tx.output.push(TxOut {
                value: total,
                script_pubkey: change_script,
            });
        }

        proposal.update_timestamps(unix_now());
        Ok(())
    }

    /// Chain-resolved summary of a proposal's transaction.
    pub fn tx_info(&self, id: &ProposalId) -> Result<TxInfo, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        let proposal = pool.proposal(id)?;

        let outpoints: Vec<_> = proposal.tx.input.iter().map(|i| i.previous_output).collect();
        let coins = self.chain.fetch_coins(&outpoints);

        let output_value = proposal.tx.output.iter().map(|o| o.value).sum::<Amount>();

        // Summed per input so a coin spent twice counts twice; any input
        // without a live coin leaves the total unknown.
        let input_value = (!outpoints.is_empty())
            .then(|| {
                proposal
                    .tx
                    .input
                    .iter()
                    .map(|input| coins.get(&input.previous_output).map(|coin| coin.value))
                    .sum::<Option<Amount>>()
            })
            .flatten();
        let fee = input_value.and_then(|total| total.checked_sub(output_value));

        Ok(TxInfo {
            txid: proposal.tx.compute_txid(),
            version: proposal.tx.version.0,
            locktime: proposal.tx.lock_time.to_consensus_u32(),
            replaceable: proposal.tx.is_explicitly_rbf(),
            input_count: proposal.tx.input.len(),
            output_count: proposal.tx.output.len(),
            output_value,
            input_value,
            fee,
            size: proposal.tx_bytes().len(),
            fully_signed: verify_fully_signed(&self.chain, proposal).is_ok(),
        })
    }

    /// Lists a proposal transaction's outputs, change included.
    pub fn tx_recipients(&self, id: &ProposalId) -> Result<Vec<RecipientInfo>, TreasuryError> {
        let state = self.lock();
        let pool = state.pool.as_ref().ok_or(TreasuryError::NotLoaded)?;
        let proposal = pool.proposal(id)?;

        Ok(proposal
            .tx
            .output
            .iter()
            .enumerate()
            .map(|(index, output)| RecipientInfo {
                index,
                script_pubkey: output.script_pubkey.clone(),
                amount: output.value,
            })
            .collect())
    }

    // ---- allocation ----

    /// Sweeps every proposal through the input allocator. Returns how many
    /// proposals were modified.
    pub fn rebalance_inputs(&self) -> Result<usize, TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        if pool.proposals.is_empty() {
            return Err(TreasuryError::NoProposals);
        }
        let change_script = pool
            .change_script()
            .cloned()
            .ok_or(TreasuryError::NoChangeAddress)?;

        Ok(allocator::rebalance_inputs(
            &self.chain,
            &mut pool.proposals,
            &change_script,
            unix_now(),
        ))
    }

    /// Moves overflow inputs from one proposal into another.
    pub fn move_overflow(
        &self,
        from: &ProposalId,
        to: &ProposalId,
    ) -> Result<(), TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        let change_script = pool
            .change_script()
            .cloned()
            .ok_or(TreasuryError::NoChangeAddress)?;

        let from_index = pool
            .find_proposal_index(from)
            .ok_or(TreasuryError::ProposalNotFound(*from))?;
        let to_index = pool
            .find_proposal_index(to)
            .ok_or(TreasuryError::ProposalNotFound(*to))?;

        allocator::move_overflow(
            &self.chain,
            &mut pool.proposals,
            from_index,
            to_index,
            &change_script,
            unix_now(),
        )
    }

    // ---- signing and broadcast ----

    /// Runs one signing round over every agreed proposal.
    pub fn sign_agreed(&self, req: SignRequest) -> Result<Vec<SigningReport>, TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        if pool.proposals.is_empty() {
            return Err(TreasuryError::NoProposals);
        }

        let keystore = SigningKeystore::build(&req.keys, &pool.scripts)?;
        let sighash_type = req.sighash_type.unwrap_or(EcdsaSighashType::All);

        Ok(sign_agreed_proposals(
            &self.chain,
            &keystore,
            &mut pool.proposals,
            sighash_type,
            unix_now(),
        ))
    }

    /// Broadcasts one proposal's transaction.
    pub fn broadcast(
        &self,
        id: &ProposalId,
        allow_high_fees: bool,
    ) -> Result<BroadcastOutcome, TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;
        let proposal = pool.proposal_mut(id)?;

        let max_fee = (!allow_high_fees).then_some(DEFAULT_MAX_BROADCAST_FEE);
        broadcast_proposal(&self.chain, &self.broadcaster, proposal, max_fee, unix_now())
    }

    /// Broadcasts every fully signed proposal. Unsigned proposals are
    /// skipped; every attempted proposal gets a report, failed ones with the
    /// error attached, so a failure never hides what was already sent.
    pub fn broadcast_all(
        &self,
        allow_high_fees: bool,
    ) -> Result<Vec<BroadcastReport>, TreasuryError> {
        self.chain.ready()?;

        let mut state = self.lock();
        let pool = state.pool.as_mut().ok_or(TreasuryError::NotLoaded)?;

        if pool.proposals.is_empty() {
            return Err(TreasuryError::NoProposals);
        }

        let max_fee = (!allow_high_fees).then_some(DEFAULT_MAX_BROADCAST_FEE);
        let now = unix_now();

        let mut reports = Vec::new();
        for proposal in pool.proposals.iter_mut() {
            let id = proposal.id;
            match broadcast_proposal(&self.chain, &self.broadcaster, proposal, max_fee, now) {
                Ok(outcome) => reports.push(BroadcastReport {
                    id,
                    txid: Some(outcome.txid),
                    sent: !outcome.already_known,
                    already_known: outcome.already_known,
                    error: None,
                }),
                Err(TreasuryError::NotSigned) => {
                    debug!("skipping unsigned proposal {id} in broadcast sweep");
                }
                Err(err) => reports.push(BroadcastReport {
                    id,
                    txid: None,
                    sent: false,
                    already_known: false,
                    error: Some(err.to_string()),
                }),
            }
        }

        if reports.is_empty() {
            return Err(TreasuryError::NotSigned);
        }

        Ok(reports)
    }
}

fn script_info(id: usize, script: &ScriptBuf) -> ScriptInfo {
    ScriptInfo {
        id,
        script: script.clone(),
        p2sh: ScriptBuf::new_p2sh(&script.script_hash()),
    }
}

fn proposal_info(proposal: &TreasuryProposal) -> ProposalInfo {
    ProposalInfo {
        id: proposal.id,
        version: proposal.version,
        creation_time: proposal.creation_time,
        last_edited: proposal.last_edited,
        expire_time: proposal.expire_time,
        headline: proposal.headline.clone(),
        description: proposal.description.clone(),
        agreed: proposal.is_agreed(),
        txid: proposal.tx.compute_txid(),
        serialized_size: proposal.serialized_size(),
    }
}

/// Assembles a transaction from a build request, deriving sequence numbers
/// from the locktime and replaceable flags where none are given.
fn build_transaction(req: &BuildTxRequest) -> Result<Transaction, TreasuryError> {
    if req.recipients.iter().any(|r| r.amount == Amount::ZERO) {
        return Err(TreasuryError::InvalidAmount);
    }

    let default_sequence = if req.replaceable {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    } else if req.locktime > 0 {
        Sequence::from_consensus(u32::MAX - 1)
    } else {
        Sequence::MAX
    };

    let input = req
        .inputs
        .iter()
        .map(|i| TxIn {
            previous_output: i.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: i.sequence.map(Sequence::from_consensus).unwrap_or(default_sequence),
            witness: Witness::new(),
        })
        .collect();

    let output = req
        .recipients
        .iter()
        .map(|r| TxOut {
            value: r.amount,
            script_pubkey: r.script_pubkey.clone(),
        })
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(req.locktime),
        input,
        output,
    };

    // Explicit sequences may contradict the replaceable flag; refuse the
    // ambiguity instead of guessing.
    if !req.inputs.is_empty() && req.replaceable != tx.is_explicitly_rbf() {
        return Err(TreasuryError::RbfMismatch);
    }

    Ok(tx)
}
