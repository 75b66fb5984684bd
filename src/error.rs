//! Consensus error kinds.

use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Errors surfaced by the Rota consensus engine.
///
/// Header verification returns these verbatim to the chain driver, which
/// decides between rejecting the block and disconnecting the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotaError {
    /// The requested block is not part of the local chain.
    #[error("unknown block")]
    UnknownBlock,

    /// Block timestamp is ahead of the local wall clock.
    #[error("block in the future: block time {block_time}, current time {current_time}")]
    FutureBlock {
        block_time: u64,
        current_time: u64,
    },

    /// The parent of a header being verified is not known.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Extra-data is shorter than the 32 byte vanity prefix.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Extra-data does not contain the 65 byte seal suffix.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// Non-epoch block carries validator data in its extra-data.
    #[error("non-epoch block contains extra validator list")]
    ExtraValidators,

    /// Epoch block carries a validator list that is empty or not a
    /// multiple of 20 bytes.
    #[error("invalid validator list on epoch block")]
    InvalidSpanValidators,

    /// Validator list exceeds the one-byte index arithmetic bound.
    #[error("validator list too large: {count} > 255")]
    TooManyValidators { count: usize },

    /// A snapshot would be created with no validators at all.
    #[error("validator set is empty")]
    EmptyValidatorSet,

    /// Non-zero mix digest.
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Uncle hash is not the hash of the empty list.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// A block carries uncles, which are meaningless in PoA.
    #[error("uncles not allowed")]
    UnclesNotAllowed,

    /// Difficulty is neither the in-turn nor the out-of-turn value.
    #[error("invalid difficulty: expected 1 or 2, got {difficulty}")]
    InvalidDifficulty { difficulty: u64 },

    /// Difficulty does not match the signer's turn.
    #[error(
        "wrong difficulty: signer {signer} at block {block}, expected {expected}, got {actual}"
    )]
    WrongDifficulty {
        signer: Address,
        block: u64,
        expected: u64,
        actual: u64,
    },

    /// Timestamp is earlier than the parent time plus period and back-off.
    #[error("invalid timestamp: minimum {minimum} (parent {parent_time}), got {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        minimum: u64,
        block_time: u64,
    },

    /// Snapshot advance was attempted over a non-contiguous header run.
    #[error("out of range or non-contiguous chain")]
    OutOfRangeChain,

    /// Snapshot advance was attempted over headers whose hashes do not link.
    #[error("the block hash is inconsistent")]
    BlockHashInconsistent,

    /// Header signed by an address outside the validator set.
    #[error("unauthorized validator: {validator}")]
    UnauthorizedValidator { validator: Address },

    /// Recovered signer does not match the header coinbase.
    #[error("coinbase {coinbase} does not match signature signer {signer}")]
    CoinbaseMismatch { signer: Address, coinbase: Address },

    /// Signer already sealed a block inside the anti-double-sign window.
    #[error("validator {signer} recently signed at block {recent_block}")]
    RecentlySigned { signer: Address, recent_block: u64 },

    /// Epoch block validator list differs from the contract-reported set.
    #[error("mismatching validator list on epoch block")]
    MismatchingEpochValidators,

    /// Withdrawals are not part of the protocol.
    #[error("withdrawals hash present but not supported")]
    WithdrawalsNotSupported,

    /// Gas limit above the 2^63-1 cap.
    #[error("invalid gasLimit: have {gas_limit}, max {cap}")]
    GasLimitTooHigh { gas_limit: u64, cap: u64 },

    /// Gas used above the block gas limit.
    #[error("invalid gasUsed: have {gas_used}, gasLimit {gas_limit}")]
    GasUsedExceedsLimit { gas_used: u64, gas_limit: u64 },

    /// Gas limit moved too far from the parent gas limit.
    #[error("invalid gas limit: have {have}, want {parent} +-= {bound}")]
    GasLimitOutOfBounds { have: u64, parent: u64, bound: u64 },

    /// Gas limit under the protocol minimum.
    #[error("invalid gas limit: have {gas_limit}, minimum {minimum}")]
    GasLimitBelowMinimum { gas_limit: u64, minimum: u64 },

    /// System transactions pushed the block over its gas limit.
    #[error("gas consumption of system txs exceeds the gas limit: used {gas_used}, limit {gas_limit}")]
    SystemTxGasOverflow { gas_used: u64, gas_limit: u64 },

    /// Expected a system transaction in the received tail but none was left.
    #[error("supposed to get a system transaction, but got none")]
    SystemTxMissing,

    /// Received system transaction does not match the expected one.
    #[error("system tx mismatch: expected hash {expected}, got {got}")]
    SystemTxMismatch { expected: B256, got: B256 },

    /// Received system transactions remain after the expected tail.
    #[error("{count} unexpected system transactions remain")]
    SystemTxLeftover { count: usize },

    /// secp256k1 recovery failed.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// A signer callback refused or failed to sign.
    #[error("signing failed: {message}")]
    SigningFailed { message: String },

    /// A read-only system contract query failed or returned garbage.
    #[error("system contract call failed: {message}")]
    ContractCall { message: String },

    /// Snapshot persistence failed.
    #[error("snapshot store error: {message}")]
    Store { message: String },

    /// Malformed input handed to the header attestation precompile.
    #[error("invalid attestation input: {message}")]
    InvalidAttestationInput { message: String },

    /// Converted internal panic; carries no protocol meaning.
    #[error("internal error: {message}")]
    Internal { message: String },
}
