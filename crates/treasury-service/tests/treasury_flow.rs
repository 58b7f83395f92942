//! End-to-end exercises of the treasury service against in-memory fixtures:
//! pool lifecycle, proposal management, and the full build-vote-sign-
//! broadcast flow over a 2-of-3 multisig.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::opcodes::all::OP_PUSHNUM_2;
use bitcoin::blockdata::opcodes::all::OP_PUSHNUM_3;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::Amount;
use bitcoin::CompressedPublicKey;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::PrivateKey;
use bitcoin::ScriptBuf;
use bitcoin::ScriptHash;
use bitcoin::Transaction;
use bitcoin::TxOut;
use bitcoin::Txid;
use tokio::sync::oneshot;
use treasury_mempool::ChainView;
use treasury_mempool::TreasuryError;
use treasury_mempool::TreasuryMempool;
use treasury_mempool::TxBroadcaster;
use treasury_service::store::TreasuryStore;
use treasury_service::BuildTxRequest;
use treasury_service::CreateProposalRequest;
use treasury_service::Recipient;
use treasury_service::SignRequest;
use treasury_service::TreasuryService;
use treasury_service::TxInputRequest;

#[derive(Clone, Default)]
struct MemoryStore {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    fail_dump: Arc<AtomicBool>,
}

impl TreasuryStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<TreasuryMempool, TreasuryError> {
        let files = self.files.lock().unwrap();
        let bytes = files.get(path).ok_or_else(|| {
            TreasuryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file",
            ))
        })?;
        TreasuryMempool::from_file_bytes(bytes)
    }

    fn dump(&self, path: &Path, pool: &TreasuryMempool) -> Result<(), TreasuryError> {
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(TreasuryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }

        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), pool.to_file_bytes());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MockChain {
    coins: HashMap<OutPoint, TxOut>,
    offline: bool,
}

impl ChainView for MockChain {
    fn ready(&self) -> Result<(), TreasuryError> {
        if self.offline {
            return Err(TreasuryError::NoPeers);
        }
        Ok(())
    }

    fn fetch_coins(&self, outpoints: &[OutPoint]) -> HashMap<OutPoint, TxOut> {
        outpoints
            .iter()
            .filter_map(|o| self.coins.get(o).map(|coin| (*o, coin.clone())))
            .collect()
    }

    fn verify_input(&self, tx: &Transaction, index: usize, _spent: &TxOut) -> bool {
        // Stand-in for script execution: an input counts as signed once it
        // carries an unlock script.
        !tx.input[index].script_sig.is_empty() || !tx.input[index].witness.is_empty()
    }
}

#[derive(Clone, Default)]
struct MockRelay {
    in_mempool: Arc<Mutex<HashSet<Txid>>>,
    relayed: Arc<Mutex<Vec<Txid>>>,
    rejected: Arc<Mutex<HashSet<Txid>>>,
}

impl TxBroadcaster for MockRelay {
    fn have_transaction(&self, txid: &Txid) -> bool {
        self.in_mempool.lock().unwrap().contains(txid)
    }

    fn accept(
        &self,
        tx: Transaction,
        _max_fee: Option<Amount>,
    ) -> Result<oneshot::Receiver<()>, TreasuryError> {
        if self.rejected.lock().unwrap().contains(&tx.compute_txid()) {
            return Err(TreasuryError::Rejected("tx-mempool-policy".into()));
        }

        self.in_mempool.lock().unwrap().insert(tx.compute_txid());
        let (sender, receiver) = oneshot::channel();
        sender.send(()).unwrap();
        Ok(receiver)
    }

    fn relay(&self, txid: Txid) {
        self.relayed.lock().unwrap().push(txid);
    }
}

fn key(n: u8) -> PrivateKey {
    let secret = bitcoin::secp256k1::SecretKey::from_slice(&[n; 32]).unwrap();
    PrivateKey::new(secret, Network::Bitcoin)
}

fn two_of_three() -> (ScriptBuf, Vec<PrivateKey>) {
    let secp = Secp256k1::new();
    let keys = vec![key(1), key(2), key(3)];

    let mut builder = Builder::new().push_opcode(OP_PUSHNUM_2);
    for k in &keys {
        let pk = CompressedPublicKey::from_private_key(&secp, k).unwrap();
        builder = builder.push_slice(pk.to_bytes());
    }
    let script = builder
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();

    (script, keys)
}

fn change_script() -> ScriptBuf {
    ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([0xcc; 20]))
}

fn pool_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/pool/{name}.dat"))
}

fn service_with(chain: MockChain) -> TreasuryService<MockChain, MockRelay, MemoryStore> {
    TreasuryService::new(chain, MockRelay::default(), MemoryStore::default())
}

#[test]
fn test_pool_lifecycle() {
    let store = MemoryStore::default();
    let service = TreasuryService::new(MockChain::default(), MockRelay::default(), store.clone());
    let path = pool_path("lifecycle");

    assert!(matches!(service.save(), Err(TreasuryError::NotLoaded)));
    assert!(matches!(
        service.info(),
        Err(TreasuryError::NotLoaded)
    ));

    service.create(path.clone()).unwrap();
    assert!(service.is_loaded());
    assert!(matches!(
        service.create(pool_path("other")),
        Err(TreasuryError::AlreadyLoaded)
    ));
    assert!(matches!(
        service.open(path.clone()),
        Err(TreasuryError::AlreadyLoaded)
    ));

    // A proposal created and saved survives close/open.
    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "fund the relay".into(),
            description: "details".into(),
        })
        .unwrap();
    service.close().unwrap();
    assert!(!service.is_loaded());

    service.open(path.clone()).unwrap();
    assert_eq!(service.get_proposal(&id).unwrap().headline, "fund the relay");

    // Unsaved changes die with abort.
    service
        .create_proposal(CreateProposalRequest {
            headline: "short lived".into(),
            description: String::new(),
        })
        .unwrap();
    service.abort().unwrap();
    service.open(path).unwrap();
    assert_eq!(service.list_proposals().unwrap().len(), 1);
}

#[test]
fn test_failed_save_leaves_pool_intact() {
    let store = MemoryStore::default();
    let service = TreasuryService::new(MockChain::default(), MockRelay::default(), store.clone());
    service.create(pool_path("failing")).unwrap();

    let saved_at = service.info().unwrap().last_saved;
    store.fail_dump.store(true, Ordering::SeqCst);

    assert!(matches!(service.save(), Err(TreasuryError::Io(_))));
    assert!(service.is_loaded());
    assert_eq!(service.info().unwrap().last_saved, saved_at);

    // Close refuses too, nothing is lost.
    assert!(matches!(service.close(), Err(TreasuryError::Io(_))));
    assert!(service.is_loaded());
}

#[test]
fn test_script_and_change_management() {
    let service = service_with(MockChain::default());
    service.create(pool_path("scripts")).unwrap();

    let (redeem, _) = two_of_three();
    let id = service.add_redeem_script(redeem.clone()).unwrap();
    assert_eq!(id, 0);
    assert!(matches!(
        service.add_redeem_script(redeem.clone()),
        Err(TreasuryError::DuplicateScript)
    ));
    assert_eq!(service.list_redeem_scripts().unwrap().len(), 1);
    assert_eq!(service.get_redeem_script(0).unwrap().script, redeem);

    service.remove_redeem_script(0).unwrap();
    assert!(matches!(
        service.remove_redeem_script(0),
        Err(TreasuryError::ScriptNotFound(0))
    ));
    assert!(matches!(
        service.clear_redeem_scripts(),
        Err(TreasuryError::NoRedeemScripts)
    ));

    assert!(matches!(
        service.change_script(),
        Err(TreasuryError::NoChangeAddress)
    ));
    service.set_change_script(change_script()).unwrap();
    assert_eq!(service.change_script().unwrap(), change_script());
}

#[test]
fn test_proposal_lifecycle() {
    let service = service_with(MockChain::default());
    service.create(pool_path("proposals")).unwrap();

    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "h".into(),
            description: "d".into(),
        })
        .unwrap();

    // Fresh proposals have a month of life, extension is refused.
    assert!(matches!(
        service.extend_proposal(&id),
        Err(TreasuryError::NotAboutToExpire)
    ));

    service.vote_proposal(&id).unwrap();
    assert!(service.get_proposal(&id).unwrap().agreed);
    assert!(matches!(
        service.vote_proposal(&id),
        Err(TreasuryError::AlreadyAgreed)
    ));
    service.unvote_proposal(&id).unwrap();
    assert!(matches!(
        service.unvote_proposal(&id),
        Err(TreasuryError::NotAgreed)
    ));

    service.delete_proposal(&id).unwrap();
    assert!(matches!(
        service.get_proposal(&id),
        Err(TreasuryError::ProposalNotFound(_))
    ));
    assert!(matches!(
        service.clear_proposals(),
        Err(TreasuryError::NoProposals)
    ));
}

#[test]
fn test_offline_node_blocks_chain_operations() {
    let chain = MockChain {
        offline: true,
        ..Default::default()
    };
    let service = service_with(chain);
    service.create(pool_path("offline")).unwrap();

    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "h".into(),
            description: "d".into(),
        })
        .unwrap();

    assert!(matches!(
        service.rebalance_inputs(),
        Err(TreasuryError::NoPeers)
    ));
    assert!(matches!(
        service.sign_agreed(SignRequest {
            keys: vec![],
            sighash_type: None
        }),
        Err(TreasuryError::NoPeers)
    ));
    assert!(matches!(
        service.broadcast(&id, false),
        Err(TreasuryError::NoPeers)
    ));
}

#[test]
fn test_full_multisig_flow() {
    let (redeem, keys) = two_of_three();
    let funding = OutPoint::new(Txid::from_byte_array([9; 32]), 0);
    let chain = MockChain {
        coins: HashMap::from([(
            funding,
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
            },
        )]),
        offline: false,
    };
    let relay = MockRelay::default();
    let service = TreasuryService::new(chain, relay.clone(), MemoryStore::default());

    service.create(pool_path("flow")).unwrap();
    service.add_redeem_script(redeem).unwrap();
    service.set_change_script(change_script()).unwrap();

    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "pay the auditors".into(),
            description: "quarterly audit invoice".into(),
        })
        .unwrap();

    service
        .build_tx(
            &id,
            BuildTxRequest {
                inputs: vec![TxInputRequest {
                    outpoint: funding,
                    sequence: None,
                }],
                recipients: vec![Recipient {
                    script_pubkey: change_script(),
                    amount: Amount::from_sat(90_000),
                }],
                locktime: 0,
                replaceable: false,
            },
        )
        .unwrap();

    // Rebuilding the identical transaction is a state conflict.
    assert!(matches!(
        service.build_tx(
            &id,
            BuildTxRequest {
                inputs: vec![TxInputRequest {
                    outpoint: funding,
                    sequence: None,
                }],
                recipients: vec![Recipient {
                    script_pubkey: change_script(),
                    amount: Amount::from_sat(90_000),
                }],
                locktime: 0,
                replaceable: false,
            }
        ),
        Err(TreasuryError::TxUpToDate)
    ));

    let info = service.tx_info(&id).unwrap();
    assert_eq!(info.input_value, Some(Amount::from_sat(100_000)));
    assert_eq!(info.fee, Some(Amount::from_sat(10_000)));
    assert!(!info.fully_signed);

    // Unsigned transactions never reach the network.
    assert!(matches!(
        service.broadcast(&id, false),
        Err(TreasuryError::NotSigned)
    ));

    service.vote_proposal(&id).unwrap();

    // First key alone cannot meet the 2-of-3 threshold.
    let reports = service
        .sign_agreed(SignRequest {
            keys: vec![keys[0].to_wif()],
            sighash_type: None,
        })
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].complete);

    // The second signer completes the transaction.
    let reports = service
        .sign_agreed(SignRequest {
            keys: vec![keys[1].to_wif()],
            sighash_type: None,
        })
        .unwrap();
    assert!(reports[0].complete);
    assert!(service.tx_info(&id).unwrap().fully_signed);

    let outcome = service.broadcast(&id, false).unwrap();
    assert!(!outcome.already_known);
    assert_eq!(*relay.relayed.lock().unwrap(), vec![outcome.txid]);

    // Post-broadcast the proposal is on a short fuse.
    let expire = service.get_proposal(&id).unwrap().expire_time;
    assert!(expire <= treasury_common::unix_now() + 30 * 60);

    // Broadcasting again short-circuits on the node mempool.
    let outcome = service.broadcast(&id, false).unwrap();
    assert!(outcome.already_known);
}

#[test]
fn test_broadcast_all_skips_unsigned() {
    let (redeem, keys) = two_of_three();
    let funding = OutPoint::new(Txid::from_byte_array([9; 32]), 0);
    let chain = MockChain {
        coins: HashMap::from([(
            funding,
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
            },
        )]),
        offline: false,
    };
    let service = TreasuryService::new(chain, MockRelay::default(), MemoryStore::default());

    service.create(pool_path("broadcast-all")).unwrap();
    service.add_redeem_script(redeem).unwrap();
    service.set_change_script(change_script()).unwrap();

    let signed = service
        .create_proposal(CreateProposalRequest {
            headline: "signed".into(),
            description: String::new(),
        })
        .unwrap();
    let unsigned = service
        .create_proposal(CreateProposalRequest {
            headline: "unsigned".into(),
            description: String::new(),
        })
        .unwrap();

    service
        .build_tx(
            &signed,
            BuildTxRequest {
                inputs: vec![TxInputRequest {
                    outpoint: funding,
                    sequence: None,
                }],
                recipients: vec![Recipient {
                    script_pubkey: change_script(),
                    amount: Amount::from_sat(90_000),
                }],
                locktime: 0,
                replaceable: false,
            },
        )
        .unwrap();

    service.vote_proposal(&signed).unwrap();
    service
        .sign_agreed(SignRequest {
            keys: vec![keys[0].to_wif(), keys[1].to_wif()],
            sighash_type: None,
        })
        .unwrap();

    let reports = service.broadcast_all(false).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].id, signed);
    assert!(reports[0].sent);
    assert!(reports[0].error.is_none());

    // The unsigned proposal is still there, untouched.
    assert!(service.get_proposal(&unsigned).is_ok());
}

#[test]
fn test_broadcast_all_reports_failures_without_discarding_sent() {
    let (redeem, keys) = two_of_three();
    let funding_a = OutPoint::new(Txid::from_byte_array([9; 32]), 0);
    let funding_b = OutPoint::new(Txid::from_byte_array([9; 32]), 1);
    let coin = TxOut {
        value: Amount::from_sat(100_000),
        script_pubkey: ScriptBuf::new_p2sh(&redeem.script_hash()),
    };
    let chain = MockChain {
        coins: HashMap::from([(funding_a, coin.clone()), (funding_b, coin)]),
        offline: false,
    };
    let relay = MockRelay::default();
    let service = TreasuryService::new(chain, relay.clone(), MemoryStore::default());

    service.create(pool_path("broadcast-all-partial")).unwrap();
    service.add_redeem_script(redeem).unwrap();
    service.set_change_script(change_script()).unwrap();

    let mut ids = Vec::new();
    for (headline, funding) in [("first", funding_a), ("second", funding_b)] {
        let id = service
            .create_proposal(CreateProposalRequest {
                headline: headline.into(),
                description: String::new(),
            })
            .unwrap();
        service
            .build_tx(
                &id,
                BuildTxRequest {
                    inputs: vec![TxInputRequest {
                        outpoint: funding,
                        sequence: None,
                    }],
                    recipients: vec![Recipient {
                        script_pubkey: change_script(),
                        amount: Amount::from_sat(90_000),
                    }],
                    locktime: 0,
                    replaceable: false,
                },
            )
            .unwrap();
        service.vote_proposal(&id).unwrap();
        ids.push(id);
    }

    service
        .sign_agreed(SignRequest {
            keys: vec![keys[0].to_wif(), keys[1].to_wif()],
            sighash_type: None,
        })
        .unwrap();

    // The relay turns down the second transaction only.
    let doomed = service.tx_info(&ids[1]).unwrap().txid;
    relay.rejected.lock().unwrap().insert(doomed);

    let reports = service.broadcast_all(false).unwrap();
    assert_eq!(reports.len(), 2);

    assert_eq!(reports[0].id, ids[0]);
    assert!(reports[0].sent);
    assert!(reports[0].error.is_none());
    assert_eq!(relay.relayed.lock().unwrap().len(), 1);

    assert_eq!(reports[1].id, ids[1]);
    assert!(!reports[1].sent);
    assert!(reports[1].txid.is_none());
    assert!(reports[1].error.as_deref().unwrap().contains("tx-mempool-policy"));
}

#[test]
fn test_tx_recipients_listing() {
    let service = service_with(MockChain::default());
    service.create(pool_path("recipients")).unwrap();

    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "payouts".into(),
            description: String::new(),
        })
        .unwrap();

    let pay_to = ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([0xaa; 20]));
    service
        .build_tx(
            &id,
            BuildTxRequest {
                inputs: Vec::new(),
                recipients: vec![
                    Recipient {
                        script_pubkey: pay_to.clone(),
                        amount: Amount::from_sat(70_000),
                    },
                    Recipient {
                        script_pubkey: change_script(),
                        amount: Amount::from_sat(20_000),
                    },
                ],
                locktime: 0,
                replaceable: false,
            },
        )
        .unwrap();

    let recipients = service.tx_recipients(&id).unwrap();
    assert_eq!(recipients.len(), 2);
    assert_eq!(recipients[0].index, 0);
    assert_eq!(recipients[0].script_pubkey, pay_to);
    assert_eq!(recipients[0].amount, Amount::from_sat(70_000));
    assert_eq!(recipients[1].script_pubkey, change_script());
}

#[test]
fn test_tx_info_counts_duplicate_outpoints_per_input() {
    let funding = OutPoint::new(Txid::from_byte_array([4; 32]), 0);
    let chain = MockChain {
        coins: HashMap::from([(
            funding,
            TxOut {
                value: Amount::from_sat(25_000),
                script_pubkey: change_script(),
            },
        )]),
        offline: false,
    };
    let service = service_with(chain);
    service.create(pool_path("dup-inputs")).unwrap();

    let id = service
        .create_proposal(CreateProposalRequest {
            headline: "dup".into(),
            description: String::new(),
        })
        .unwrap();

    // The same outpoint listed twice still resolves, once per input.
    service
        .build_tx(
            &id,
            BuildTxRequest {
                inputs: vec![
                    TxInputRequest {
                        outpoint: funding,
                        sequence: None,
                    },
                    TxInputRequest {
                        outpoint: funding,
                        sequence: None,
                    },
                ],
                recipients: vec![Recipient {
                    script_pubkey: change_script(),
                    amount: Amount::from_sat(40_000),
                }],
                locktime: 0,
                replaceable: false,
            },
        )
        .unwrap();

    let info = service.tx_info(&id).unwrap();
    assert_eq!(info.input_count, 2);
    assert_eq!(info.input_value, Some(Amount::from_sat(50_000)));
    assert_eq!(info.fee, Some(Amount::from_sat(10_000)));
}
