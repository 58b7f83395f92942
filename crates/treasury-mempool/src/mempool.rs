//! The treasury mempool itself: a persisted pool of proposals, the redeem
//! script registry and the shared change address.
//!
//! The on-disk form is `[marker][version][lastSaved][proposals][scripts]
//! [changeAddressScript]`, all consensus-encoded after the fixed marker. A
//! stream that does not start with the marker is rejected outright, nothing
//! is partially loaded.

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io;
use bitcoin::ScriptBuf;
use bitcoin::VarInt;
use tracing::debug;

use crate::error::TreasuryError;
use crate::proposal::ProposalId;
use crate::proposal::TreasuryProposal;
use crate::registry::validate_redeem_script;
use crate::registry::RedeemScriptRegistry;

/// Fixed marker every treasury file starts with.
pub const TREASURY_FILE_MAGIC: &[u8; 36] = b"GlobalTokenTreasuryProposalFileMagic";

/// The in-memory treasury pool. One instance is loaded at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreasuryMempool {
    /// Version of the pool format, currently 1.
    pub version: u32,

    /// Unix timestamp of the last successful save, 0 if never saved.
    pub last_saved: u32,

    /// All live proposals, in insertion order.
    pub proposals: Vec<TreasuryProposal>,

    /// The registered multisig redeem scripts.
    pub scripts: RedeemScriptRegistry,

    /// Script of the shared change address, once configured.
    change_script: Option<ScriptBuf>,
}

impl Default for TreasuryMempool {
    fn default() -> Self {
        Self::new()
    }
}

impl TreasuryMempool {
    pub fn new() -> Self {
        TreasuryMempool {
            version: 1,
            last_saved: 0,
            proposals: Vec::new(),
            scripts: RedeemScriptRegistry::new(),
            change_script: None,
        }
    }

    /// Position of the proposal with the given id, if present.
    pub fn find_proposal_index(&self, id: &ProposalId) -> Option<usize> {
        self.proposals.iter().position(|p| p.id == *id)
    }

    pub fn proposal(&self, id: &ProposalId) -> Result<&TreasuryProposal, TreasuryError> {
        self.find_proposal_index(id)
            .map(|i| &self.proposals[i])
            .ok_or(TreasuryError::ProposalNotFound(*id))
    }

    pub fn proposal_mut(&mut self, id: &ProposalId) -> Result<&mut TreasuryProposal, TreasuryError> {
        let index = self
            .find_proposal_index(id)
            .ok_or(TreasuryError::ProposalNotFound(*id))?;
        Ok(&mut self.proposals[index])
    }

    pub fn insert_proposal(&mut self, proposal: TreasuryProposal) {
        self.proposals.push(proposal);
    }

    pub fn remove_proposal(&mut self, id: &ProposalId) -> Result<TreasuryProposal, TreasuryError> {
        let index = self
            .find_proposal_index(id)
            .ok_or(TreasuryError::ProposalNotFound(*id))?;
        Ok(self.proposals.remove(index))
    }

    /// Reaps every proposal whose expiry has passed. Iterates back-to-front
    /// so erasing by index stays correct. Returns how many were removed.
    pub fn delete_expired_proposals(&mut self, now: u32) -> usize {
        let mut removed = 0;
        for i in (0..self.proposals.len()).rev() {
            if self.proposals[i].is_expired(now) {
                let gone = self.proposals.remove(i);
                debug!("reaping expired treasury proposal {}", gone.id);
                removed += 1;
            }
        }

        removed
    }

    /// Validates and registers a redeem script, returning the id it got.
    pub fn add_redeem_script(&mut self, script: ScriptBuf) -> Result<usize, TreasuryError> {
        validate_redeem_script(&script)?;

        if self.scripts.find(&script).is_some() {
            return Err(TreasuryError::DuplicateScript);
        }

        Ok(self.scripts.insert(script))
    }

    /// Configures the shared change address script. Only script-hash
    /// destinations are accepted, and reconfiguring requires an explicit
    /// clear first.
    pub fn set_change_script(&mut self, script: ScriptBuf) -> Result<(), TreasuryError> {
        if !script.is_p2sh() {
            return Err(TreasuryError::ChangeAddressNotScriptHash);
        }

        if self.change_script.is_some() {
            return Err(TreasuryError::ChangeAddressAlreadySet);
        }

        self.change_script = Some(script);
        Ok(())
    }

    pub fn clear_change_script(&mut self) -> Result<(), TreasuryError> {
        if self.change_script.is_none() {
            return Err(TreasuryError::NoChangeAddress);
        }

        self.change_script = None;
        Ok(())
    }

    pub fn change_script(&self) -> Option<&ScriptBuf> {
        self.change_script.as_ref()
    }

    /// The full file image: marker followed by the consensus encoding.
    pub fn to_file_bytes(&self) -> Vec<u8> {
        let mut bytes = TREASURY_FILE_MAGIC.to_vec();
        self.consensus_encode(&mut bytes)
            .expect("writing to a Vec never fails");
        bytes
    }

    /// Parses a full file image, rejecting anything without the marker.
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self, TreasuryError> {
        let Some(payload) = bytes.strip_prefix(TREASURY_FILE_MAGIC.as_slice()) else {
            return Err(TreasuryError::CorruptFile);
        };

        let mut reader = payload;
        Ok(TreasuryMempool::consensus_decode(&mut reader)?)
    }
}

impl Encodable for TreasuryMempool {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.version.consensus_encode(writer)?;
        len += self.last_saved.consensus_encode(writer)?;

        len += VarInt(self.proposals.len() as u64).consensus_encode(writer)?;
        for proposal in &self.proposals {
            len += proposal.consensus_encode(writer)?;
        }

        len += VarInt(self.scripts.len() as u64).consensus_encode(writer)?;
        for script in self.scripts.iter() {
            len += script.consensus_encode(writer)?;
        }

        // The unset change address encodes as the empty script.
        let change = self.change_script.clone().unwrap_or_default();
        len += change.consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for TreasuryMempool {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let version = u32::consensus_decode(reader)?;
        let last_saved = u32::consensus_decode(reader)?;

        let proposal_count = VarInt::consensus_decode(reader)?.0;
        let mut proposals = Vec::new();
        for _ in 0..proposal_count {
            proposals.push(TreasuryProposal::consensus_decode(reader)?);
        }

        let script_count = VarInt::consensus_decode(reader)?.0;
        let mut scripts = Vec::new();
        for _ in 0..script_count {
            scripts.push(ScriptBuf::consensus_decode(reader)?);
        }

        let change = ScriptBuf::consensus_decode(reader)?;
        let change_script = if change.is_empty() { None } else { Some(change) };

        Ok(TreasuryMempool {
            version,
            last_saved,
            proposals,
            scripts: RedeemScriptRegistry::from_scripts(scripts),
            change_script,
        })
    }
}
