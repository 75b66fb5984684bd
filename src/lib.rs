//! Rota proof-of-authority consensus engine.
//!
//! A rotating set of validators, maintained by on-chain system contracts,
//! takes turns proposing blocks. The engine verifies headers proposed by
//! others, proposes and seals blocks when the local node is authorized,
//! tracks the validator set through a replayable snapshot over the header
//! stream, and orchestrates the system transactions that pay rewards, slash
//! missed turns, and rotate the set at epoch boundaries.
//!
//! # Modules
//!
//! - [`engine`]: the [`Rota`](engine::Rota) engine surface consumed by the
//!   block producer and importer
//! - [`snapshot`]: the authorization snapshot (validator set + recent
//!   signers ring)
//! - [`seal`]: seal-hash codec and signer recovery
//! - [`system_tx`]: the deterministic system-transaction tail
//! - [`sealer`]: the seal scheduling state machine
//! - [`attestor`]: the light-client header attestation precompile
//! - [`store`]: snapshot persistence over the shared key-value database
//!
//! The transaction execution VM, state database, networking, and key
//! management stay outside; [`traits`] is the whole surface the engine
//! consumes them by.

pub mod attestor;
pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod seal;
pub mod sealer;
pub mod snapshot;
pub mod store;
pub mod system_tx;
pub mod traits;
pub mod types;

pub use attestor::{HeaderAttestor, HEADER_ATTEST_GAS};
pub use backoff::back_off_time;
pub use config::{RotaConfig, SystemContracts, MAX_SYSTEM_BALANCE, SYSTEM_ADDRESS};
pub use engine::{AbortHandle, Rota};
pub use error::RotaError;
pub use seal::{seal_hash, SignatureCache};
pub use sealer::SealState;
pub use snapshot::Snapshot;
pub use store::{MemorySnapshotStore, SnapshotStore};
pub use system_tx::{is_system_transaction, Orchestrator};
pub use traits::{
    CallOutcome, ChainHeaderReader, ContractCaller, EvmHost, SignerFn, SignerTxFn, StateDb,
    SystemMessage,
};
pub use types::{parse_validators, Block, Header, Receipt, Transaction, EMPTY_UNCLE_HASH};

/// Fixed number of extra-data prefix bytes reserved for proposer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the seal.
pub const EXTRA_SEAL: usize = 65;

/// Bytes of the vanity tail carrying the fork-id hint on prepared blocks.
pub const NEXT_FORK_HASH_SIZE: usize = 4;

/// Packed length of one validator address in epoch extra-data.
pub const VALIDATOR_BYTES_LENGTH: usize = 20;

/// Validator indices must fit one byte.
pub const MAX_VALIDATORS: usize = 255;

/// Default number of blocks between validator-set rotations.
pub const DEFAULT_EPOCH_LENGTH: u64 = 30_000;

/// Number of blocks after which a snapshot is persisted to the database.
pub const CHECKPOINT_INTERVAL: u64 = 1024;

/// Number of recent snapshots kept in memory.
pub const IN_MEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures kept in memory.
pub const IN_MEMORY_SIGNATURES: usize = 4096;

/// Block difficulty for in-turn seals.
pub const DIFF_IN_TURN: u64 = 2;

/// Block difficulty for out-of-turn seals.
pub const DIFF_NO_TURN: u64 = 1;

/// Seconds of per-step divergence between out-of-turn proposers.
pub const WIGGLE_TIME: u64 = 1;

/// Base seconds every out-of-turn proposer waits.
pub const INITIAL_BACK_OFF_TIME: u64 = 1;

/// Seconds an out-of-turn sealer yields to a peer block mid-import.
pub const PROCESS_BACK_OFF_TIME: u64 = 1;

/// Right-shift applied to incoming fees for the system-reward siphon.
pub const SYSTEM_REWARD_PERCENT: usize = 4;

/// Gas allowance of one synthetic system call.
pub const SYSTEM_TX_GAS: u64 = u64::MAX / 2;

/// Reorgs never reach past this many blocks; epoch checkpoints beyond it
/// are trusted without replay.
pub const FULL_IMMUTABILITY_THRESHOLD: usize = 90_000;

/// Bound divisor for per-block gas limit drift.
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// Minimum block gas limit.
pub const MIN_GAS_LIMIT: u64 = 5_000;

/// Maximum block gas limit (2^63 - 1).
pub const MAX_GAS_LIMIT: u64 = 0x7fff_ffff_ffff_ffff;
