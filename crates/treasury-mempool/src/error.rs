use bitcoin::consensus::encode;
use thiserror::Error;

use crate::proposal::ProposalId;

/// Everything that can go wrong inside the treasury engine.
///
/// Every error is surfaced synchronously to the caller; none are swallowed.
/// The variants group into the kinds the control surface distinguishes:
/// lifecycle (`NotLoaded`/`AlreadyLoaded`), lookup failures, validation,
/// state conflicts, chain availability and transaction acceptance.
#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error("no treasury mempool loaded")]
    NotLoaded,

    #[error("a treasury mempool is already loaded; close, abort or save it first")]
    AlreadyLoaded,

    #[error("treasury proposal {0} not found")]
    ProposalNotFound(ProposalId),

    #[error("redeem script id {0} not found (out of range)")]
    ScriptNotFound(usize),

    #[error("headline exceeds max length with {0} chars")]
    HeadlineTooLong(usize),

    #[error("description exceeds max length with {0} chars")]
    DescriptionTooLong(usize),

    #[error("empty scripts cannot be added")]
    EmptyScript,

    #[error("redeem script includes unknown or malformed op codes")]
    MalformedScript,

    #[error("the treasury script is unspendable")]
    UnspendableScript,

    #[error("treasury redeem script already exists in treasury mempool")]
    DuplicateScript,

    #[error("treasury change address is not a script address")]
    ChangeAddressNotScriptHash,

    #[error("there is already a change address configured")]
    ChangeAddressAlreadySet,

    #[error("no treasury change address set")]
    NoChangeAddress,

    #[error("already agreed with this proposal")]
    AlreadyAgreed,

    #[error("this proposal is unvoted")]
    NotAgreed,

    #[error("the transaction is already up to date")]
    TxUpToDate,

    #[error("proposal is not about to expire, so it cannot be extended")]
    NotAboutToExpire,

    #[error("no treasury proposals in mempool")]
    NoProposals,

    #[error("no redeem scripts saved in treasury mempool")]
    NoRedeemScripts,

    #[error("source proposal transaction is not overflowed")]
    NotOverflowed,

    #[error("destination proposal transaction is already overflowed")]
    AlreadyOverflowed,

    #[error("treasury proposals must be different")]
    SameProposal,

    #[error("recipient index out of range")]
    RecipientOutOfRange,

    #[error("invalid amount")]
    InvalidAmount,

    #[error("sequence numbers contradict the replaceable option")]
    RbfMismatch,

    #[error("invalid private key")]
    InvalidKey,

    #[error("none of the signing keys belong to any registered redeem script")]
    UnrelatedKeys,

    #[error("could not decode redeem script as multisig")]
    NotMultisig,

    #[error("node has no peers connected")]
    NoPeers,

    #[error("node is still downloading blocks")]
    InitialBlockDownload,

    #[error("treasury proposal transaction not signed yet")]
    NotSigned,

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("missing inputs")]
    MissingInputs,

    #[error("transaction already in block chain")]
    AlreadyInChain,

    #[error("treasury file is corrupt: missing file marker")]
    CorruptFile,

    #[error("encoding error: {0}")]
    Encode(#[from] encode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
