//! Index-addressed collection of the multisig redeem scripts the treasury
//! spends from.
//!
//! Scripts are kept in insertion order and addressed by position, so removing
//! one shifts every later id down by one. Callers that cache ids must refresh
//! them after a removal.
//!
//! The registry stores whatever it is handed; admission checks live in
//! [`validate_redeem_script`] and run before insertion.

use bitcoin::Script;
use bitcoin::ScriptBuf;

use crate::error::TreasuryError;

/// Consensus limit on script size, in bytes. Anything larger can never be
/// spent.
const MAX_SCRIPT_SIZE: usize = 10_000;

/// Checks a candidate redeem script: it must be non-empty, parse as a
/// script, and be spendable at all.
pub fn validate_redeem_script(script: &Script) -> Result<(), TreasuryError> {
    if script.is_empty() {
        return Err(TreasuryError::EmptyScript);
    }

    if script.instructions().any(|ins| ins.is_err()) {
        return Err(TreasuryError::MalformedScript);
    }

    if script.is_op_return() || script.len() > MAX_SCRIPT_SIZE {
        return Err(TreasuryError::UnspendableScript);
    }

    Ok(())
}

/// The ordered set of registered redeem scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedeemScriptRegistry {
    scripts: Vec<ScriptBuf>,
}

impl RedeemScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing script list, as read from disk.
    pub fn from_scripts(scripts: Vec<ScriptBuf>) -> Self {
        RedeemScriptRegistry { scripts }
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Appends a script and returns the id it got. The caller is expected to
    /// have run [`validate_redeem_script`] and a duplicate check first.
    pub fn insert(&mut self, script: ScriptBuf) -> usize {
        self.scripts.push(script);
        self.scripts.len() - 1
    }

    /// Position of an exact-match script, if registered.
    pub fn find(&self, script: &Script) -> Option<usize> {
        self.scripts.iter().position(|s| s.as_script() == script)
    }

    /// Removes the script at `id`. Later scripts shift down by one.
    pub fn remove(&mut self, id: usize) -> Result<ScriptBuf, TreasuryError> {
        if id >= self.scripts.len() {
            return Err(TreasuryError::ScriptNotFound(id));
        }

        Ok(self.scripts.remove(id))
    }

    pub fn get(&self, id: usize) -> Result<&ScriptBuf, TreasuryError> {
        self.scripts.get(id).ok_or(TreasuryError::ScriptNotFound(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptBuf> {
        self.scripts.iter()
    }

    pub fn as_slice(&self) -> &[ScriptBuf] {
        &self.scripts
    }

    pub fn clear(&mut self) {
        self.scripts.clear();
    }
}
