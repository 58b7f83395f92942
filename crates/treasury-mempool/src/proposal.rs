//! A single treasury governance item: identity, timestamps, text, and an
//! embedded mutable funding transaction.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::io;
use bitcoin::transaction::Version;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::VarInt;
use bitcoin::Witness;
use treasury_common::read_bounded_string;
use treasury_common::serialize_hash;

use crate::error::TreasuryError;

/// Content-derived identifier of a proposal, the sole external lookup key.
pub type ProposalId = sha256d::Hash;

/// Maximum accepted headline length, in chars.
pub const MAX_HEADLINE_LENGTH: usize = 512;

/// Maximum accepted description length, in chars.
pub const MAX_DESCRIPTION_LENGTH: usize = 32_768;

/// Hard cap on the number of inputs a proposal transaction may carry once
/// prepared. Inputs beyond this are "overflowed" and get redistributed by the
/// allocator.
pub const MAX_TX_INPUTS: usize = 1_200;

/// How long a proposal lives after its last edit: 31 days, in seconds.
pub const PROPOSAL_LIFETIME: u32 = 60 * 60 * 24 * 31;

/// A proposal may only be extended once it has less than this much life
/// left: 7 days, in seconds.
pub const EXTEND_THRESHOLD: u32 = 60 * 60 * 24 * 7;

/// A single treasury proposal.
///
/// The `agreed` vote flag is memory-only; every other field is persisted and
/// covered by [`TreasuryProposal::compute_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryProposal {
    /// Version of this proposal, currently 1.
    pub version: u32,

    /// The content-derived id, finalized to [`TreasuryProposal::compute_id`]
    /// before the proposal is stored and stable from then on.
    pub id: ProposalId,

    /// Unix timestamp of creation.
    pub creation_time: u32,

    /// Unix timestamp of the last edit. Bumped by every mutating operation.
    pub last_edited: u32,

    /// Unix timestamp after which the proposal is expired and will be reaped.
    pub expire_time: u32,

    /// Short title, at most [`MAX_HEADLINE_LENGTH`] chars.
    pub headline: String,

    /// Free-form text, at most [`MAX_DESCRIPTION_LENGTH`] chars.
    pub description: String,

    /// The funding transaction this proposal is assembling. The sole payload
    /// subject to allocation and signing.
    pub tx: Transaction,

    /// Whether the local signer has voted for this proposal. Never persisted.
    agreed: bool,
}

/// An empty version-2 transaction, the state of a proposal tx before funding.
pub fn empty_tx() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    }
}

impl TreasuryProposal {
    /// Creates a new proposal with validated text fields.
    ///
    /// The returned proposal already carries its permanent id, the content
    /// hash of all persisted fields.
    pub fn new(headline: String, description: String, now: u32) -> Result<Self, TreasuryError> {
        let mut proposal = TreasuryProposal {
            version: 1,
            id: ProposalId::all_zeros(),
            creation_time: now,
            last_edited: now,
            expire_time: now + PROPOSAL_LIFETIME,
            headline,
            description,
            tx: empty_tx(),
            agreed: false,
        };

        if !proposal.is_headline_valid() {
            return Err(TreasuryError::HeadlineTooLong(
                proposal.headline.chars().count(),
            ));
        }

        if !proposal.is_description_valid() {
            return Err(TreasuryError::DescriptionTooLong(
                proposal.description.chars().count(),
            ));
        }

        proposal.id = proposal.compute_id();
        Ok(proposal)
    }

    /// The deterministic hash over all persisted fields, with the id field
    /// itself nulled during hashing.
    ///
    /// The stored id must always equal this hash, so ids arriving from
    /// untrusted input can be recomputed and compared instead of trusted.
    pub fn compute_id(&self) -> ProposalId {
        let mut content = self.clone();
        content.id = ProposalId::all_zeros();
        serialize_hash(&content)
    }

    pub fn is_expired(&self, now: u32) -> bool {
        now >= self.expire_time
    }

    pub fn is_headline_valid(&self) -> bool {
        self.headline.chars().count() <= MAX_HEADLINE_LENGTH
    }

    pub fn is_description_valid(&self) -> bool {
        self.description.chars().count() <= MAX_DESCRIPTION_LENGTH
    }

    pub fn is_agreed(&self) -> bool {
        self.agreed
    }

    /// Records the local vote. Voting twice is an error, not a no-op.
    pub fn set_agreed(&mut self) -> Result<(), TreasuryError> {
        if self.agreed {
            return Err(TreasuryError::AlreadyAgreed);
        }

        self.agreed = true;
        Ok(())
    }

    /// Withdraws the local vote. Un-voting an unvoted proposal is an error.
    pub fn unset_agreed(&mut self) -> Result<(), TreasuryError> {
        if !self.agreed {
            return Err(TreasuryError::NotAgreed);
        }

        self.agreed = false;
        Ok(())
    }

    /// Bumps `last_edited` to `now` and pushes the expiry out to
    /// `now + 31 days`. Called by every operation that mutates the proposal.
    pub fn update_timestamps(&mut self, now: u32) {
        self.last_edited = now;
        self.expire_time = now + PROPOSAL_LIFETIME;
    }

    /// Truncates the transaction's inputs to the first [`MAX_TX_INPUTS`]
    /// entries, discarding from the highest index down.
    pub fn remove_overflowed_inputs(&mut self) {
        self.tx.input.truncate(MAX_TX_INPUTS);
    }

    /// Blanks every input's unlock script, both the legacy signature script
    /// and the witness, so the transaction can be re-signed from scratch.
    pub fn clear_input_signatures(&mut self) {
        for input in self.tx.input.iter_mut() {
            input.script_sig = ScriptBuf::new();
            input.witness = Witness::new();
        }
    }

    /// Inserts a single null-reference placeholder input when the transaction
    /// has outputs but no inputs.
    ///
    /// A zero-input transaction with outputs is ambiguous under segwit
    /// serialization, so size estimation and raw export treat it as if funded
    /// by one canonical dummy. Must be undone with
    /// [`TreasuryProposal::remove_dummy_input_if_needed`] afterwards.
    pub fn insert_dummy_input_if_needed(&mut self) {
        if self.tx.input.is_empty() && !self.tx.output.is_empty() {
            self.tx.input.push(TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }
    }

    /// Removes the placeholder input inserted by
    /// [`TreasuryProposal::insert_dummy_input_if_needed`], if present.
    pub fn remove_dummy_input_if_needed(&mut self) {
        if self.tx.input.len() == 1 && self.tx.input[0].previous_output == OutPoint::null() {
            self.tx.input.clear();
        }
    }

    /// The size of this proposal's consensus encoding, in bytes.
    pub fn serialized_size(&self) -> usize {
        let mut bytes = Vec::new();
        self.consensus_encode(&mut bytes)
            .expect("writing to a Vec never fails");
        bytes.len()
    }

    /// The raw consensus encoding of the embedded transaction, with the
    /// dummy-input workaround applied for the zero-input case.
    pub fn tx_bytes(&self) -> Vec<u8> {
        let mut proposal = self.clone();
        proposal.insert_dummy_input_if_needed();

        let mut bytes = Vec::new();
        proposal
            .tx
            .consensus_encode(&mut bytes)
            .expect("writing to a Vec never fails");
        bytes
    }
}

fn encode_string<W: io::Write + ?Sized>(s: &str, writer: &mut W) -> Result<usize, io::Error> {
    let bytes = s.as_bytes();
    let mut len = VarInt(bytes.len() as u64).consensus_encode(writer)?;
    writer.write_all(bytes)?;
    len += bytes.len();
    Ok(len)
}

impl Encodable for TreasuryProposal {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.version.consensus_encode(writer)?;
        len += self.id.consensus_encode(writer)?;
        len += self.creation_time.consensus_encode(writer)?;
        len += self.last_edited.consensus_encode(writer)?;
        len += self.expire_time.consensus_encode(writer)?;
        len += encode_string(&self.headline, writer)?;
        len += encode_string(&self.description, writer)?;
        len += self.tx.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for TreasuryProposal {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        Ok(TreasuryProposal {
            version: u32::consensus_decode(reader)?,
            id: ProposalId::consensus_decode(reader)?,
            creation_time: u32::consensus_decode(reader)?,
            last_edited: u32::consensus_decode(reader)?,
            expire_time: u32::consensus_decode(reader)?,
            headline: read_bounded_string(reader, MAX_HEADLINE_LENGTH)?,
            description: read_bounded_string(reader, MAX_DESCRIPTION_LENGTH)?,
            tx: Transaction::consensus_decode(reader)?,
            agreed: false,
        })
    }
}
