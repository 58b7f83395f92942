//! Cooperative multisig signing of agreed proposals.
//!
//! Callers hand over private keys in WIF form. A temporary keystore is built
//! from those keys plus every registered redeem script in its legacy,
//! native-segwit and nested-segwit spending forms, and each agreed
//! proposal's inputs are signed against their resolved previous outputs.
//!
//! Signing is expected to be partial: a signer holding one of three keys
//! writes its signature back and reports the input as incomplete. Already
//! present signatures from other signers are preserved and merged in public
//! key order, so repeated rounds converge on a fully signed transaction.
//! Per-input failures are reported, never escalated to a batch failure.

use std::collections::HashMap;

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::blockdata::script::Builder;
use bitcoin::blockdata::script::Instruction;
use bitcoin::blockdata::script::PushBytesBuf;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::All;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::sighash::SighashCache;
use bitcoin::PrivateKey;
use bitcoin::PublicKey;
use bitcoin::Script;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::TxOut;
use serde::Serialize;
use tracing::debug;

use crate::chain::ChainView;
use crate::error::TreasuryError;
use crate::proposal::ProposalId;
use crate::proposal::TreasuryProposal;
use crate::registry::RedeemScriptRegistry;

/// How a spend script pubkey maps back onto a registered redeem script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpendPath {
    /// Pay-to-script-hash of the redeem script itself.
    Legacy,
    /// Native pay-to-witness-script-hash.
    Segwit,
    /// P2wsh wrapped inside p2sh.
    Nested,
}

#[derive(Debug, Clone)]
struct ScriptEntry {
    redeem: ScriptBuf,
    path: SpendPath,
}

/// An `m`-of-`n` bare multisig script, decomposed.
#[derive(Debug, Clone)]
pub struct ParsedMultisig {
    pub required: usize,
    pub pubkeys: Vec<PublicKey>,
}

/// Decomposes a script of the form `m <pubkey>... n OP_CHECKMULTISIG`.
pub fn parse_multisig(script: &Script) -> Result<ParsedMultisig, TreasuryError> {
    let mut instructions = script.instructions();

    let required = match instructions.next() {
        Some(Ok(Instruction::Op(op))) => pushnum(op.to_u8()).ok_or(TreasuryError::NotMultisig)?,
        _ => return Err(TreasuryError::NotMultisig),
    };

    let mut pubkeys = Vec::new();
    let total = loop {
        match instructions.next() {
            Some(Ok(Instruction::PushBytes(bytes))) => {
                let key = PublicKey::from_slice(bytes.as_bytes())
                    .map_err(|_| TreasuryError::NotMultisig)?;
                pubkeys.push(key);
            }
            Some(Ok(Instruction::Op(op))) => {
                break pushnum(op.to_u8()).ok_or(TreasuryError::NotMultisig)?
            }
            _ => return Err(TreasuryError::NotMultisig),
        }
    };

    match instructions.next() {
        Some(Ok(Instruction::Op(OP_CHECKMULTISIG))) => {}
        _ => return Err(TreasuryError::NotMultisig),
    }

    if instructions.next().is_some()
        || total != pubkeys.len()
        || required == 0
        || required > total
    {
        return Err(TreasuryError::NotMultisig);
    }

    Ok(ParsedMultisig { required, pubkeys })
}

/// Decodes OP_1 through OP_16 into its small integer, if the byte is one.
fn pushnum(op: u8) -> Option<usize> {
    // OP_PUSHNUM_1 is 0x51, OP_PUSHNUM_16 is 0x60.
    (0x51..=0x60).contains(&op).then(|| (op - 0x50) as usize)
}

/// Temporary key/script store assembled for one signing round and discarded
/// afterwards. Keys never persist.
pub struct SigningKeystore {
    secp: Secp256k1<All>,
    keys: HashMap<PublicKey, PrivateKey>,
    scripts: HashMap<ScriptBuf, ScriptEntry>,
}

impl SigningKeystore {
    /// Builds the store from WIF-encoded keys and the registered scripts.
    ///
    /// Fails if any key does not decode, if no scripts are registered, or if
    /// none of the keys belongs to any registered script. Signing with
    /// unrelated keys would only produce useless signatures, so it is
    /// rejected up front.
    pub fn build(
        wif_keys: &[String],
        registry: &RedeemScriptRegistry,
    ) -> Result<Self, TreasuryError> {
        if registry.is_empty() {
            return Err(TreasuryError::NoRedeemScripts);
        }

        let secp = Secp256k1::new();
        let mut keys = HashMap::new();
        for wif in wif_keys {
            let key = PrivateKey::from_wif(wif).map_err(|_| TreasuryError::InvalidKey)?;
            keys.insert(key.public_key(&secp), key);
        }

        let mut scripts = HashMap::new();
        let mut related = false;
        for redeem in registry.iter() {
            if let Ok(multisig) = parse_multisig(redeem) {
                related |= multisig.pubkeys.iter().any(|pk| keys.contains_key(pk));
            }

            scripts.insert(
                ScriptBuf::new_p2sh(&redeem.script_hash()),
                ScriptEntry {
                    redeem: redeem.clone(),
                    path: SpendPath::Legacy,
                },
            );
            scripts.insert(
                redeem.to_p2wsh(),
                ScriptEntry {
                    redeem: redeem.clone(),
                    path: SpendPath::Segwit,
                },
            );
            scripts.insert(
                ScriptBuf::new_p2sh(&redeem.to_p2wsh().script_hash()),
                ScriptEntry {
                    redeem: redeem.clone(),
                    path: SpendPath::Nested,
                },
            );
        }

        if !related {
            return Err(TreasuryError::UnrelatedKeys);
        }

        Ok(SigningKeystore { secp, keys, scripts })
    }

    /// Signs one input against the coin it spends. Returns whether the input
    /// reached its multisig threshold, or a per-input error message.
    pub fn sign_input(
        &self,
        tx: &mut Transaction,
        index: usize,
        coin: &TxOut,
        sighash_type: EcdsaSighashType,
    ) -> Result<bool, String> {
        let entry = self
            .scripts
            .get(&coin.script_pubkey)
            .ok_or_else(|| "no registered redeem script matches this input".to_string())?;

        let multisig =
            parse_multisig(&entry.redeem).map_err(|_| "redeem script is not multisig".to_string())?;

        let candidates = match entry.path {
            SpendPath::Legacy => script_sig_pushes(&tx.input[index].script_sig, &entry.redeem),
            SpendPath::Segwit | SpendPath::Nested => witness_pushes(tx, index, &entry.redeem),
        };

        let mut signatures: HashMap<PublicKey, Vec<u8>> = HashMap::new();
        {
            // The cache owns a snapshot of the transaction so the segwit
            // midstate can be computed while `tx` stays writable for
            // `write_back` below.
            let mut cache = SighashCache::new(tx.clone());

            // Keep signatures other signers already contributed, keyed by
            // the pubkey they verify against.
            for candidate in candidates {
                let Some((der, flag)) = candidate.split_last_chunk::<1>() else {
                    continue;
                };
                let Ok(signature) = bitcoin::secp256k1::ecdsa::Signature::from_der(der) else {
                    continue;
                };

                let Ok(message) = self.sighash(&mut cache, index, entry, coin, flag[0] as u32)
                else {
                    continue;
                };

                for pubkey in &multisig.pubkeys {
                    if self.secp.verify_ecdsa(&message, &signature, &pubkey.inner).is_ok() {
                        signatures.insert(*pubkey, candidate.clone());
                        break;
                    }
                }
            }

            let message = self
                .sighash(&mut cache, index, entry, coin, sighash_type.to_u32())
                .map_err(|e| e.to_string())?;

            for pubkey in &multisig.pubkeys {
                if signatures.contains_key(pubkey) {
                    continue;
                }
                let Some(key) = self.keys.get(pubkey) else {
                    continue;
                };

                let signature = self.secp.sign_ecdsa(&message, &key.inner);
                let mut bytes = signature.serialize_der().to_vec();
                bytes.push(sighash_type.to_u32() as u8);
                signatures.insert(*pubkey, bytes);
            }
        }

        // Merge in public key order, capped at the threshold.
        let ordered: Vec<Vec<u8>> = multisig
            .pubkeys
            .iter()
            .filter_map(|pk| signatures.get(pk).cloned())
            .take(multisig.required)
            .collect();

        let complete = ordered.len() >= multisig.required;
        self.write_back(tx, index, entry, &ordered)?;
        Ok(complete)
    }

    fn sighash(
        &self,
        cache: &mut SighashCache<Transaction>,
        index: usize,
        entry: &ScriptEntry,
        coin: &TxOut,
        flag: u32,
    ) -> Result<Message, String> {
        let digest = match entry.path {
            SpendPath::Legacy => cache
                .legacy_signature_hash(index, &entry.redeem, flag)
                .map_err(|e| e.to_string())?
                .to_byte_array(),
            SpendPath::Segwit | SpendPath::Nested => cache
                .p2wsh_signature_hash(
                    index,
                    &entry.redeem,
                    coin.value,
                    EcdsaSighashType::from_consensus(flag),
                )
                .map_err(|e| e.to_string())?
                .to_byte_array(),
        };

        Ok(Message::from_digest(digest))
    }

    /// Rebuilds the input's unlock script as `OP_0 <sig>... <redeem>` in the
    /// shape its spend path requires.
    fn write_back(
        &self,
        tx: &mut Transaction,
        index: usize,
        entry: &ScriptEntry,
        signatures: &[Vec<u8>],
    ) -> Result<(), String> {
        let input = &mut tx.input[index];

        match entry.path {
            SpendPath::Legacy => {
                // The leading OP_0 absorbs the historical CHECKMULTISIG
                // off-by-one.
                let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
                for signature in signatures {
                    let push = PushBytesBuf::try_from(signature.clone())
                        .map_err(|_| "signature exceeds push limit".to_string())?;
                    builder = builder.push_slice(push);
                }
                let redeem = PushBytesBuf::try_from(entry.redeem.to_bytes())
                    .map_err(|_| "redeem script exceeds push limit".to_string())?;

                input.script_sig = builder.push_slice(redeem).into_script();
                input.witness.clear();
            }
            SpendPath::Segwit | SpendPath::Nested => {
                input.witness.clear();
                input.witness.push(Vec::<u8>::new());
                for signature in signatures {
                    input.witness.push(signature);
                }
                input.witness.push(entry.redeem.to_bytes());

                input.script_sig = if entry.path == SpendPath::Nested {
                    let program = PushBytesBuf::try_from(entry.redeem.to_p2wsh().to_bytes())
                        .map_err(|_| "witness program exceeds push limit".to_string())?;
                    Builder::new().push_slice(program).into_script()
                } else {
                    ScriptBuf::new()
                };
            }
        }

        Ok(())
    }
}

/// Signature-shaped pushes in a legacy script sig, excluding the trailing
/// redeem script.
fn script_sig_pushes(script_sig: &Script, redeem: &Script) -> Vec<Vec<u8>> {
    script_sig
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .filter(|bytes| bytes.len() >= 9 && bytes.as_slice() != redeem.as_bytes())
        .collect()
}

fn witness_pushes(tx: &Transaction, index: usize, redeem: &Script) -> Vec<Vec<u8>> {
    tx.input[index]
        .witness
        .iter()
        .map(|element| element.to_vec())
        .filter(|bytes| bytes.len() >= 9 && bytes.as_slice() != redeem.as_bytes())
        .collect()
}

/// Outcome of one signing round for one proposal.
#[derive(Debug, Clone, Serialize)]
pub struct SigningReport {
    pub id: ProposalId,
    /// Whether every input reached its multisig threshold.
    pub complete: bool,
    pub input_errors: Vec<InputSignError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputSignError {
    pub index: usize,
    pub message: String,
}

/// Signs every proposal currently marked agreed, one report per proposal.
///
/// Inputs whose previous output cannot be resolved are reported and
/// skipped. Proposals whose transaction gained signatures get their
/// timestamps bumped.
pub fn sign_agreed_proposals<Chain: ChainView>(
    chain: &Chain,
    keystore: &SigningKeystore,
    proposals: &mut [TreasuryProposal],
    sighash_type: EcdsaSighashType,
    now: u32,
) -> Vec<SigningReport> {
    let mut reports = Vec::new();

    for proposal in proposals.iter_mut().filter(|p| p.is_agreed()) {
        let outpoints: Vec<_> = proposal.tx.input.iter().map(|i| i.previous_output).collect();
        let coins = chain.fetch_coins(&outpoints);

        let before = proposal.tx.clone();
        let mut complete = !proposal.tx.input.is_empty();
        let mut input_errors = Vec::new();

        for index in 0..proposal.tx.input.len() {
            let outpoint = proposal.tx.input[index].previous_output;
            let Some(coin) = coins.get(&outpoint) else {
                complete = false;
                input_errors.push(InputSignError {
                    index,
                    message: "previous output not found or already spent".into(),
                });
                continue;
            };

            match keystore.sign_input(&mut proposal.tx, index, coin, sighash_type) {
                Ok(reached_threshold) => complete &= reached_threshold,
                Err(message) => {
                    complete = false;
                    input_errors.push(InputSignError { index, message });
                }
            }
        }

        if proposal.tx != before {
            proposal.update_timestamps(now);
        }

        debug!(
            "signed proposal {}: complete={complete}, {} input errors",
            proposal.id,
            input_errors.len()
        );
        reports.push(SigningReport {
            id: proposal.id,
            complete,
            input_errors,
        });
    }

    reports
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::CompressedPublicKey;
    use bitcoin::Network;
    use bitcoin::OutPoint;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::Txid;
    use bitcoin::Witness;

    use super::*;

    fn key(n: u8) -> PrivateKey {
        let secret = bitcoin::secp256k1::SecretKey::from_slice(&[n; 32]).unwrap();
        PrivateKey::new(secret, Network::Bitcoin)
    }

    fn two_of_three() -> (ScriptBuf, Vec<PrivateKey>) {
        let secp = Secp256k1::new();
        let keys = vec![key(1), key(2), key(3)];

        let mut builder = Builder::new().push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_2);
        for k in &keys {
            let pk = CompressedPublicKey::from_private_key(&secp, k).unwrap();
            builder = builder.push_slice(pk.to_bytes());
        }
        let script = builder
            .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_3)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();

        (script, keys)
    }

    fn registry_with(script: &ScriptBuf) -> RedeemScriptRegistry {
        let mut registry = RedeemScriptRegistry::new();
        registry.insert(script.clone());
        registry
    }

    fn spend_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([7; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: Vec::new(),
        }
    }

    #[test]
    fn test_parse_multisig() {
        let (script, _) = two_of_three();
        let parsed = parse_multisig(&script).unwrap();
        assert_eq!(parsed.required, 2);
        assert_eq!(parsed.pubkeys.len(), 3);

        // OP_TRUE is not multisig.
        let not_multisig = ScriptBuf::from_bytes(vec![0x51]);
        assert!(matches!(
            parse_multisig(&not_multisig),
            Err(TreasuryError::NotMultisig)
        ));
    }

    #[test]
    fn test_build_rejects_bad_or_unrelated_keys() {
        let (script, _) = two_of_three();
        let registry = registry_with(&script);

        assert!(matches!(
            SigningKeystore::build(&["not a wif".into()], &registry),
            Err(TreasuryError::InvalidKey)
        ));

        // A perfectly valid key that signs for nothing registered.
        let stranger = key(99).to_wif();
        assert!(matches!(
            SigningKeystore::build(&[stranger], &registry),
            Err(TreasuryError::UnrelatedKeys)
        ));

        assert!(matches!(
            SigningKeystore::build(&[key(1).to_wif()], &RedeemScriptRegistry::new()),
            Err(TreasuryError::NoRedeemScripts)
        ));
    }

    #[test]
    fn test_partial_then_complete_p2sh_signing() {
        let (script, keys) = two_of_three();
        let registry = registry_with(&script);
        let coin = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&script.script_hash()),
        };

        let mut tx = spend_tx();

        // First signer alone cannot reach the 2-of-3 threshold.
        let keystore = SigningKeystore::build(&[keys[0].to_wif()], &registry).unwrap();
        let complete = keystore
            .sign_input(&mut tx, 0, &coin, EcdsaSighashType::All)
            .unwrap();
        assert!(!complete);
        assert!(!tx.input[0].script_sig.is_empty());

        // Second signer merges on top of the first signature.
        let keystore = SigningKeystore::build(&[keys[2].to_wif()], &registry).unwrap();
        let complete = keystore
            .sign_input(&mut tx, 0, &coin, EcdsaSighashType::All)
            .unwrap();
        assert!(complete, "two signatures must reach the threshold");

        // Final shape: OP_0, two signatures, the redeem script.
        let pushes: Vec<_> = tx.input[0]
            .script_sig
            .instructions()
            .map(|i| i.unwrap())
            .collect();
        assert_eq!(pushes.len(), 4);
        match pushes.last() {
            Some(Instruction::PushBytes(bytes)) => {
                assert_eq!(bytes.as_bytes(), script.as_bytes())
            }
            other => panic!("expected redeem script push, got {other:?}"),
        }
    }

    #[test]
    fn test_p2wsh_signing_builds_witness() {
        let (script, keys) = two_of_three();
        let registry = registry_with(&script);
        let coin = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: script.to_p2wsh(),
        };

        let mut tx = spend_tx();
        let wifs: Vec<String> = keys.iter().map(|k| k.to_wif()).collect();
        let keystore = SigningKeystore::build(&wifs, &registry).unwrap();

        let complete = keystore
            .sign_input(&mut tx, 0, &coin, EcdsaSighashType::All)
            .unwrap();
        assert!(complete);

        // Dummy element, exactly two signatures (capped at threshold), and
        // the witness script.
        let witness = &tx.input[0].witness;
        assert_eq!(witness.len(), 4);
        assert_eq!(witness.iter().next().unwrap().len(), 0);
        assert_eq!(witness.iter().last().unwrap(), script.as_bytes());
        assert!(tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn test_nested_segwit_signing_sets_program_and_witness() {
        let (script, keys) = two_of_three();
        let registry = registry_with(&script);
        let coin = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&script.to_p2wsh().script_hash()),
        };

        let mut tx = spend_tx();
        let wifs: Vec<String> = keys.iter().map(|k| k.to_wif()).collect();
        let keystore = SigningKeystore::build(&wifs, &registry).unwrap();

        let complete = keystore
            .sign_input(&mut tx, 0, &coin, EcdsaSighashType::All)
            .unwrap();
        assert!(complete);

        // The script sig carries only the witness program push.
        let pushes: Vec<_> = tx.input[0]
            .script_sig
            .instructions()
            .map(|i| i.unwrap())
            .collect();
        assert_eq!(pushes.len(), 1);
        match &pushes[0] {
            Instruction::PushBytes(bytes) => {
                assert_eq!(bytes.as_bytes(), script.to_p2wsh().as_bytes())
            }
            other => panic!("expected witness program push, got {other:?}"),
        }

        assert_eq!(tx.input[0].witness.len(), 4);
        assert_eq!(tx.input[0].witness.iter().last().unwrap(), script.as_bytes());
    }

    #[test]
    fn test_report_serializes_with_hex_id() {
        let report = SigningReport {
            id: ProposalId::all_zeros(),
            complete: false,
            input_errors: vec![InputSignError {
                index: 3,
                message: "previous output not found or already spent".into(),
            }],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["id"], ProposalId::all_zeros().to_string());
        assert_eq!(json["complete"], false);
        assert_eq!(json["input_errors"][0]["index"], 3);
    }

    #[test]
    fn test_sign_agreed_skips_unvoted() {
        let (script, keys) = two_of_three();
        let registry = registry_with(&script);

        let coin_out = TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2sh(&script.script_hash()),
        };
        let outpoint = OutPoint::new(Txid::from_byte_array([7; 32]), 0);

        struct OneCoin(OutPoint, TxOut);
        impl ChainView for OneCoin {
            fn ready(&self) -> Result<(), TreasuryError> {
                Ok(())
            }
            fn fetch_coins(
                &self,
                outpoints: &[OutPoint],
            ) -> std::collections::HashMap<OutPoint, TxOut> {
                outpoints
                    .iter()
                    .filter(|o| **o == self.0)
                    .map(|o| (*o, self.1.clone()))
                    .collect()
            }
            fn verify_input(&self, _: &Transaction, _: usize, _: &TxOut) -> bool {
                true
            }
        }

        let mut voted = TreasuryProposal::new("a".into(), "d".into(), 1_000).unwrap();
        voted.tx = spend_tx();
        voted.set_agreed().unwrap();
        let unvoted = TreasuryProposal::new("b".into(), "d".into(), 1_000).unwrap();

        let mut proposals = vec![voted, unvoted];
        let wifs: Vec<String> = keys.iter().map(|k| k.to_wif()).collect();
        let keystore = SigningKeystore::build(&wifs, &registry).unwrap();
        let chain = OneCoin(outpoint, coin_out);

        let reports =
            sign_agreed_proposals(&chain, &keystore, &mut proposals, EcdsaSighashType::All, 2_000);

        assert_eq!(reports.len(), 1, "only the agreed proposal is signed");
        assert!(reports[0].complete);
        assert!(reports[0].input_errors.is_empty());
        assert_eq!(proposals[0].last_edited, 2_000);
        assert!(proposals[1].tx.input.is_empty());
    }
}
