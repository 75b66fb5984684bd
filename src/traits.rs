//! Interfaces to the engine's external collaborators.
//!
//! The chain driver, state database, and key management stay outside the
//! engine; these traits are the whole surface the engine consumes them by.

use alloy_primitives::{Address, Bytes, Log, B256, U256};
use std::sync::Arc;

use crate::{
    error::RotaError,
    types::{Header, Transaction},
};

/// Read access to the header chain.
pub trait ChainHeaderReader: Send + Sync {
    /// The current canonical head.
    fn current_header(&self) -> Option<Header>;

    /// Header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Canonical header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;

    /// The highest header that passed full verification, which may sit ahead
    /// of the canonical head while a block is still being imported.
    fn highest_verified_header(&self) -> Option<Header>;
}

/// Read-only contract execution against historical state, used to ask the
/// validator controller for the next validator set.
pub trait ContractCaller: Send + Sync {
    /// Execute an eth-call of `data` against `to` at the state of
    /// `block_hash`.
    fn static_call(&self, block_hash: B256, to: Address, data: Bytes)
        -> Result<Bytes, RotaError>;
}

/// A synthetic zero-gas-price message from the coinbase to a system
/// contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas: u64,
}

/// Result of executing a system message.
#[derive(Debug, Clone, Default)]
pub struct CallOutcome {
    pub gas_used: u64,
    pub output: Bytes,
    pub logs: Vec<Log>,
}

/// Account-level access to the state the block executes against.
pub trait StateDb {
    fn balance(&self, address: Address) -> U256;

    fn set_balance(&mut self, address: Address, balance: U256);

    fn add_balance(&mut self, address: Address, amount: U256);

    fn nonce(&self, address: Address) -> u64;

    fn set_nonce(&mut self, address: Address, nonce: u64);

    /// Current state root with all pending changes folded in.
    fn intermediate_root(&mut self) -> B256;
}

/// The host VM: executes system messages against the same state the user
/// transactions ran on.
pub trait EvmHost: StateDb {
    fn execute(&mut self, header: &Header, msg: &SystemMessage) -> Result<CallOutcome, RotaError>;
}

/// Callback signing a raw digest on behalf of the authorized validator.
pub type SignerFn =
    Arc<dyn Fn(Address, &[u8]) -> Result<[u8; 65], RotaError> + Send + Sync>;

/// Callback signing a system transaction on behalf of the authorized
/// validator; returns the transaction with its signature attached.
pub type SignerTxFn =
    Arc<dyn Fn(Address, Transaction, u64) -> Result<Transaction, RotaError> + Send + Sync>;
