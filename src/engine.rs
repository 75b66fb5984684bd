//! The Rota consensus engine.
//!
//! Validates headers proposed by others, proposes and seals blocks when the
//! local node is an authorized validator, and threads the authorization
//! snapshot and system-transaction tail through block processing.

use alloy_primitives::{keccak256, Address, B256, B64};
use lru::LruCache;
use parking_lot::RwLock;
use secp256k1::{All, Secp256k1};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, SystemTime},
};
use tracing::{error, info, trace, warn};

use crate::{
    backoff::back_off_time,
    config::{RotaConfig, SystemContracts},
    error::RotaError,
    seal::{self, SignatureCache},
    sealer::SealTask,
    snapshot::Snapshot,
    store::SnapshotStore,
    system_tx::{query_validators, Orchestrator},
    traits::{ChainHeaderReader, ContractCaller, EvmHost, SignerFn, SignerTxFn},
    types::{ordered_list_root, Block, Header, Receipt, Transaction, EMPTY_UNCLE_HASH},
    CHECKPOINT_INTERVAL, DIFF_IN_TURN, DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY,
    FULL_IMMUTABILITY_THRESHOLD, GAS_LIMIT_BOUND_DIVISOR, IN_MEMORY_SIGNATURES,
    IN_MEMORY_SNAPSHOTS, MAX_GAS_LIMIT, MIN_GAS_LIMIT, NEXT_FORK_HASH_SIZE,
    VALIDATOR_BYTES_LENGTH,
};

/// The locally authorized signer and its callbacks.
#[derive(Clone)]
struct SignerEntry {
    val: Address,
    sign_fn: SignerFn,
    sign_tx_fn: SignerTxFn,
}

/// Cooperative cancellation for a batch verification run.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop; verifications already in flight finish, no
    /// further results are emitted.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// Rota proof-of-authority consensus engine.
pub struct Rota<S: SnapshotStore> {
    /// Engine configuration.
    config: RotaConfig,
    /// Well-known system contract addresses.
    contracts: SystemContracts,
    /// Genesis hash, folded into the fork-id hint stamped on new blocks.
    genesis_hash: B256,
    /// Shared key-value database holding snapshot checkpoints.
    store: Arc<S>,
    /// Read-only contract execution, for validator-set queries.
    caller: Arc<dyn ContractCaller>,
    /// Snapshots for recent blocks to speed up reorgs.
    recent_snaps: RwLock<LruCache<B256, Snapshot>>,
    /// Recovered signers of recent blocks.
    signatures: SignatureCache,
    /// The locally authorized validator, if any.
    signer: RwLock<Option<SignerEntry>>,
    /// Secp256k1 context for signature operations.
    secp: Secp256k1<All>,
    /// Skip difficulty verification (testing only).
    fake_diff: bool,
}

impl<S: SnapshotStore> Rota<S> {
    /// Create a new engine.
    pub fn new(
        config: RotaConfig,
        contracts: SystemContracts,
        store: Arc<S>,
        caller: Arc<dyn ContractCaller>,
        genesis_hash: B256,
    ) -> Self {
        Self {
            config,
            contracts,
            genesis_hash,
            store,
            caller,
            recent_snaps: RwLock::new(LruCache::new(
                NonZeroUsize::new(IN_MEMORY_SNAPSHOTS).unwrap(),
            )),
            signatures: SignatureCache::new(IN_MEMORY_SIGNATURES),
            signer: RwLock::new(None),
            secp: Secp256k1::new(),
            fake_diff: false,
        }
    }

    /// Engine with difficulty verification disabled (testing only).
    pub fn new_fake_diff(
        config: RotaConfig,
        contracts: SystemContracts,
        store: Arc<S>,
        caller: Arc<dyn ContractCaller>,
        genesis_hash: B256,
    ) -> Self {
        let mut engine = Self::new(config, contracts, store, caller, genesis_hash);
        engine.fake_diff = true;
        engine
    }

    pub fn config(&self) -> &RotaConfig {
        &self.config
    }

    pub fn contracts(&self) -> &SystemContracts {
        &self.contracts
    }

    /// Inject the local validator credentials used to seal blocks and sign
    /// system transactions.
    pub fn authorize(&self, val: Address, sign_fn: SignerFn, sign_tx_fn: SignerTxFn) {
        *self.signer.write() = Some(SignerEntry { val, sign_fn, sign_tx_fn });
    }

    /// The locally authorized validator address, if any.
    pub fn val(&self) -> Option<Address> {
        self.signer.read().as_ref().map(|entry| entry.val)
    }

    /// The account that proposed the block: always the coinbase.
    pub fn author(&self, header: &Header) -> Address {
        header.coinbase
    }

    /// Whether the block was proposed by the locally authorized validator.
    pub fn is_local_block(&self, header: &Header) -> bool {
        self.val() == Some(header.coinbase)
    }

    /// Hash of a header prior to sealing, chain-id domain separated.
    pub fn seal_hash(&self, header: &Header) -> Result<B256, RotaError> {
        seal::seal_hash(header, self.config.chain_id)
    }

    /// Extract the sealing validator from a header, cached.
    pub fn ecrecover(&self, header: &Header) -> Result<Address, RotaError> {
        seal::recover_signer(&self.secp, header, &self.signatures, self.config.chain_id)
    }

    /// No background threads to wind down.
    pub fn close(&self) -> Result<(), RotaError> {
        Ok(())
    }

    // ======================== verification ========================

    /// Check a single header against the consensus rules.
    pub fn verify_header<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &Header,
    ) -> Result<(), RotaError> {
        self.verify_header_with_parents(chain, header, None)
    }

    /// Verify a batch of headers concurrently with the caller. Results are
    /// emitted in input order; the abort handle stops the worker between
    /// headers.
    pub fn verify_headers<C>(
        self: &Arc<Self>,
        chain: Arc<C>,
        headers: Vec<Header>,
    ) -> (AbortHandle, mpsc::Receiver<Result<(), RotaError>>)
    where
        C: ChainHeaderReader + 'static,
        S: 'static,
    {
        let abort = AbortHandle::new();
        let worker_abort = abort.clone();
        let (results, receiver) = mpsc::sync_channel(headers.len().max(1));
        let engine = Arc::clone(self);

        thread::spawn(move || {
            for i in 0..headers.len() {
                if worker_abort.is_aborted() {
                    return;
                }
                let result =
                    engine.verify_header_with_parents(chain.as_ref(), &headers[i], Some(&headers[..i]));
                if results.send(result).is_err() {
                    return;
                }
            }
        });

        (abort, receiver)
    }

    /// Uncles carry no meaning in PoA; any at all is an error.
    pub fn verify_uncles(&self, block: &Block) -> Result<(), RotaError> {
        if !block.uncles.is_empty() {
            return Err(RotaError::UnclesNotAllowed);
        }
        Ok(())
    }

    /// Check the seal of a header against the snapshot of its parent.
    pub fn verify_seal<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &Header,
    ) -> Result<(), RotaError> {
        let number = header.number;
        if number == 0 {
            return Err(RotaError::UnknownBlock);
        }
        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;
        self.verify_seal_against(&snap, header)
    }

    fn verify_header_with_parents<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &Header,
        parents: Option<&[Header]>,
    ) -> Result<(), RotaError> {
        let number = header.number;

        // Don't waste time on blocks from the future.
        let now = unix_now();
        if header.timestamp > now {
            return Err(RotaError::FutureBlock { block_time: header.timestamp, current_time: now });
        }

        // Extra-data holds the vanity, the seal, and on epoch blocks the
        // validator list in between.
        if header.extra.len() < EXTRA_VANITY {
            return Err(RotaError::MissingVanity);
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(RotaError::MissingSignature);
        }
        let validator_bytes = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        let is_epoch = header.is_epoch(self.config.epoch);
        if !is_epoch && validator_bytes != 0 {
            return Err(RotaError::ExtraValidators);
        }
        if is_epoch && (validator_bytes == 0 || validator_bytes % VALIDATOR_BYTES_LENGTH != 0) {
            return Err(RotaError::InvalidSpanValidators);
        }

        if header.mix_digest != B256::ZERO {
            return Err(RotaError::InvalidMixDigest);
        }
        if header.uncle_hash != EMPTY_UNCLE_HASH {
            return Err(RotaError::InvalidUncleHash);
        }
        if number > 0 && header.difficulty != DIFF_IN_TURN && header.difficulty != DIFF_NO_TURN {
            return Err(RotaError::InvalidDifficulty { difficulty: header.difficulty });
        }
        if header.withdrawals_hash.is_some() {
            return Err(RotaError::WithdrawalsNotSupported);
        }

        self.verify_cascading_fields(chain, header, parents)
    }

    fn verify_cascading_fields<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &Header,
        parents: Option<&[Header]>,
    ) -> Result<(), RotaError> {
        let number = header.number;

        // The genesis block is the always valid dead-end.
        if number == 0 {
            return Ok(());
        }

        let parent = self.get_parent(chain, header, parents)?;
        let snap = self.snapshot(chain, number - 1, header.parent_hash, parents)?;

        // The proposer owes the period plus its personal back-off.
        let minimum =
            parent.timestamp + self.config.period + back_off_time(&snap, header.coinbase);
        if header.timestamp < minimum {
            return Err(RotaError::InvalidTimestamp {
                parent_time: parent.timestamp,
                minimum,
                block_time: header.timestamp,
            });
        }

        // Gas envelope. Base-fee attributes are checked by the fee module
        // once the fee market activates.
        if header.gas_limit > MAX_GAS_LIMIT {
            return Err(RotaError::GasLimitTooHigh {
                gas_limit: header.gas_limit,
                cap: MAX_GAS_LIMIT,
            });
        }
        if header.gas_used > header.gas_limit {
            return Err(RotaError::GasUsedExceedsLimit {
                gas_used: header.gas_used,
                gas_limit: header.gas_limit,
            });
        }
        let bound = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        if parent.gas_limit.abs_diff(header.gas_limit) >= bound {
            return Err(RotaError::GasLimitOutOfBounds {
                have: header.gas_limit,
                parent: parent.gas_limit,
                bound,
            });
        }
        if header.gas_limit < MIN_GAS_LIMIT {
            return Err(RotaError::GasLimitBelowMinimum {
                gas_limit: header.gas_limit,
                minimum: MIN_GAS_LIMIT,
            });
        }

        self.verify_seal_against(&snap, header)
    }

    fn verify_seal_against(&self, snap: &Snapshot, header: &Header) -> Result<(), RotaError> {
        let number = header.number;
        if number == 0 {
            return Err(RotaError::UnknownBlock);
        }

        let signer = self.ecrecover(header)?;
        if signer != header.coinbase {
            return Err(RotaError::CoinbaseMismatch { signer, coinbase: header.coinbase });
        }
        if !snap.is_validator(signer) {
            return Err(RotaError::UnauthorizedValidator { validator: signer });
        }

        // Among the recents, only fail when this block does not shift the
        // earlier seal out of the window.
        for (&recent_block, &recent) in &snap.recents {
            if recent == signer && recent_block > number.saturating_sub(snap.recents_window()) {
                return Err(RotaError::RecentlySigned { signer, recent_block });
            }
        }

        if !self.fake_diff {
            let expected = if snap.inturn(signer) { DIFF_IN_TURN } else { DIFF_NO_TURN };
            if header.difficulty != expected {
                return Err(RotaError::WrongDifficulty {
                    signer,
                    block: number,
                    expected,
                    actual: header.difficulty,
                });
            }
        }

        Ok(())
    }

    fn get_parent<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &Header,
        parents: Option<&[Header]>,
    ) -> Result<Header, RotaError> {
        let number = header.number;
        let parent = match parents {
            Some(hint) if !hint.is_empty() => hint.last().cloned(),
            _ => chain.get_header(header.parent_hash, number - 1),
        };
        let parent = parent.ok_or(RotaError::UnknownAncestor)?;
        if parent.number != number - 1 || parent.hash() != header.parent_hash {
            return Err(RotaError::UnknownAncestor);
        }
        Ok(parent)
    }

    // ======================== snapshots ========================

    /// Retrieve the authorization snapshot for the given point of the chain,
    /// replaying headers forward from the nearest cached, checkpointed, or
    /// trusted ancestor.
    pub fn snapshot<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        number: u64,
        hash: B256,
        parents: Option<&[Header]>,
    ) -> Result<Snapshot, RotaError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut number = number;
        let mut hash = hash;
        let mut parents = parents.unwrap_or(&[]);
        let mut snap: Option<Snapshot> = None;

        while snap.is_none() {
            if let Some(cached) = self.recent_snaps.write().get(&hash) {
                snap = Some(cached.clone());
                break;
            }

            if number % CHECKPOINT_INTERVAL == 0 {
                // A broken checkpoint blob is not fatal; replay covers it.
                match Snapshot::load(self.store.as_ref(), hash) {
                    Ok(Some(loaded)) => {
                        trace!(target: "rota::engine", number, %hash, "loaded snapshot from disk");
                        snap = Some(loaded);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(target: "rota::engine", number, %hash, %e, "snapshot load failed, replaying headers");
                    }
                }
            }

            // At genesis, or at an epoch boundary buried deeper than any
            // possible reorg, trust the embedded validator list.
            if number == 0
                || (number % self.config.epoch == 0 && headers.len() > FULL_IMMUTABILITY_THRESHOLD)
            {
                if let Some(checkpoint) = chain.get_header_by_number(number) {
                    let checkpoint_hash = checkpoint.hash();
                    let validators = checkpoint.epoch_validators()?;
                    let created =
                        Snapshot::new(self.config.epoch, number, checkpoint_hash, validators);
                    created.store(self.store.as_ref())?;
                    info!(target: "rota::engine", number, hash = %checkpoint_hash, "stored checkpoint snapshot to disk");
                    snap = Some(created);
                    break;
                }
            }

            // No snapshot yet: collect this header and walk backwards,
            // consuming the explicit parents first.
            let header = if let Some((last, rest)) = parents.split_last() {
                if last.hash() != hash || last.number != number {
                    return Err(RotaError::UnknownAncestor);
                }
                parents = rest;
                last.clone()
            } else {
                chain.get_header(hash, number).ok_or(RotaError::UnknownAncestor)?
            };
            hash = header.parent_hash;
            number = number.saturating_sub(1);
            headers.push(header);
        }

        let snap = snap.ok_or(RotaError::UnknownBlock)?;

        // Found an ancestor snapshot: apply the pending headers on top.
        headers.reverse();
        let snap = snap.apply(&headers, |h| self.ecrecover(h))?;
        self.recent_snaps.write().put(snap.hash, snap.clone());

        if snap.number % CHECKPOINT_INTERVAL == 0 && !headers.is_empty() {
            snap.store(self.store.as_ref())?;
            trace!(target: "rota::engine", number = snap.number, hash = %snap.hash, "stored snapshot to disk");
        }

        Ok(snap)
    }

    // ======================== proposing ========================

    /// Prepare the consensus fields of a header for a block to be proposed
    /// on top of `parent_hash`.
    pub fn prepare<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        header: &mut Header,
    ) -> Result<(), RotaError> {
        let val = self
            .val()
            .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
        header.coinbase = val;
        header.nonce = B64::ZERO;
        header.mix_digest = B256::ZERO;

        let number = header.number;
        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;
        header.difficulty = if snap.inturn(val) { DIFF_IN_TURN } else { DIFF_NO_TURN };

        // Vanity, with the fork-id hint in its trailing four bytes.
        let mut extra = header.extra.to_vec();
        extra.resize(EXTRA_VANITY - NEXT_FORK_HASH_SIZE, 0);
        extra.extend_from_slice(&self.next_fork_hash());

        let parent = chain
            .get_header(header.parent_hash, number - 1)
            .ok_or(RotaError::UnknownAncestor)?;
        header.timestamp = parent.timestamp + self.config.period + back_off_time(&snap, val);
        let now = unix_now();
        if header.timestamp < now {
            header.timestamp = now;
        }

        // Epoch blocks embed the next validator set, ascending.
        if header.is_epoch(self.config.epoch) {
            let validators =
                query_validators(self.caller.as_ref(), &self.contracts, header.parent_hash)?;
            for validator in &validators {
                extra.extend_from_slice(validator.as_slice());
            }
        }

        // Leave room for the seal.
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        header.extra = extra.into();

        Ok(())
    }

    /// Expected difficulty for a block the local validator would propose on
    /// top of `parent`.
    pub fn calc_difficulty<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        _time: u64,
        parent: &Header,
    ) -> Result<u64, RotaError> {
        let val = self
            .val()
            .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
        let snap = self.snapshot(chain, parent.number, parent.hash(), None)?;
        Ok(if snap.inturn(val) { DIFF_IN_TURN } else { DIFF_NO_TURN })
    }

    // ======================== finalization ========================

    /// Epoch-rotation hook, run by the driver ahead of the regular
    /// finalization tail on epoch blocks: rotate the staking round and
    /// distribute delegator rewards. A no-op off the boundary.
    ///
    /// Pass the received system-transaction tail to verify an imported
    /// block, or `None` when producing (the calls are then signed locally).
    #[allow(clippy::too_many_arguments)]
    pub fn apply_epoch_calls<C, H>(
        &self,
        chain: &C,
        header: &Header,
        state: &mut H,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        mut system_txs: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError>
    where
        C: ChainHeaderReader + ?Sized,
        H: EvmHost + ?Sized,
    {
        if header.number == 0 || !header.is_epoch(self.config.epoch) {
            return Ok(());
        }

        let snap = self.snapshot(chain, header.number - 1, header.parent_hash, None)?;
        let orchestrator = if system_txs.is_some() {
            Orchestrator::verifying(self.config, self.contracts)
        } else {
            let entry = self
                .signer
                .read()
                .clone()
                .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
            Orchestrator::mining(
                self.config,
                self.contracts,
                entry.val,
                Arc::clone(&entry.sign_tx_fn),
            )
        };

        orchestrator.set_new_round(
            state,
            header,
            txs,
            receipts,
            system_txs.as_deref_mut(),
            used_gas,
        )?;
        orchestrator.distribute_delegator_reward(
            snap.validators_list(),
            state,
            header,
            txs,
            receipts,
            system_txs,
            used_gas,
        )
    }

    /// Verifier-side finalization: replay the expected system-transaction
    /// tail against the received one. `system_txs` must be drained exactly.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize<C, H>(
        &self,
        chain: &C,
        header: &Header,
        state: &mut H,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        system_txs: &mut Vec<Transaction>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError>
    where
        C: ChainHeaderReader + ?Sized,
        H: EvmHost + ?Sized,
    {
        let number = header.number;
        let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;

        // Epoch blocks must embed exactly the contract-reported set.
        if header.is_epoch(self.config.epoch) {
            self.verify_epoch_validators(header)?;
        }

        let orchestrator = Orchestrator::verifying(self.config, self.contracts);

        if number == 1 {
            if let Err(e) = orchestrator.init_contracts(
                state,
                header,
                txs,
                receipts,
                Some(system_txs),
                used_gas,
            ) {
                error!(target: "rota::engine", %e, "init contract failed");
            }
        }

        if header.difficulty != DIFF_IN_TURN {
            let spoiled = snap.suppose_validator();
            if !snap.sign_recently(spoiled) {
                trace!(target: "rota::engine", block = number, validator = %spoiled, "slash validator");
                if let Err(e) = orchestrator.slash(
                    spoiled,
                    state,
                    header,
                    txs,
                    receipts,
                    Some(system_txs),
                    used_gas,
                ) {
                    // The slash channel may be disabled on this chain.
                    error!(target: "rota::engine", block = number, validator = %spoiled, %e, "slash validator failed");
                }
            }
        }

        orchestrator.distribute_incoming(state, header, txs, receipts, Some(system_txs), used_gas)?;

        if !system_txs.is_empty() {
            return Err(RotaError::SystemTxLeftover { count: system_txs.len() });
        }
        Ok(())
    }

    /// Producer-side finalization: emit the system-transaction tail, settle
    /// the header roots, and assemble the block.
    pub fn finalize_and_assemble<C, H>(
        &self,
        chain: &C,
        header: &mut Header,
        state: &mut H,
        mut txs: Vec<Transaction>,
        mut receipts: Vec<Receipt>,
    ) -> Result<(Block, Vec<Receipt>), RotaError>
    where
        C: ChainHeaderReader + ?Sized,
        H: EvmHost + Send + ?Sized,
    {
        let entry = self
            .signer
            .read()
            .clone()
            .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
        let orchestrator = Orchestrator::mining(
            self.config,
            self.contracts,
            entry.val,
            Arc::clone(&entry.sign_tx_fn),
        );

        let number = header.number;
        let mut used_gas = header.gas_used;

        if number == 1 {
            if let Err(e) =
                orchestrator.init_contracts(state, header, &mut txs, &mut receipts, None, &mut used_gas)
            {
                error!(target: "rota::engine", %e, "init contract failed");
            }
        }

        if header.difficulty != DIFF_IN_TURN {
            let snap = self.snapshot(chain, number - 1, header.parent_hash, None)?;
            let spoiled = snap.suppose_validator();
            if !snap.sign_recently(spoiled) {
                if let Err(e) = orchestrator.slash(
                    spoiled,
                    state,
                    header,
                    &mut txs,
                    &mut receipts,
                    None,
                    &mut used_gas,
                ) {
                    error!(target: "rota::engine", block = number, validator = %spoiled, %e, "slash validator failed");
                }
            }
        }

        orchestrator.distribute_incoming(state, header, &mut txs, &mut receipts, None, &mut used_gas)?;

        header.gas_used = used_gas;
        if header.gas_limit < header.gas_used {
            return Err(RotaError::SystemTxGasOverflow {
                gas_used: header.gas_used,
                gas_limit: header.gas_limit,
            });
        }

        header.uncle_hash = EMPTY_UNCLE_HASH;

        // State root and block commitments computed side by side, joined
        // before sealing.
        let (root, transactions_root, receipts_root) = thread::scope(|scope| {
            let root = scope.spawn(|| state.intermediate_root());
            let transactions_root = ordered_list_root(&txs);
            let receipts_root = ordered_list_root(&receipts);
            (root.join(), transactions_root, receipts_root)
        });
        header.state_root = root
            .map_err(|_| RotaError::Internal { message: "state root computation panicked".into() })?;
        header.transactions_root = transactions_root;
        header.receipts_root = receipts_root;

        let mut logs_bloom = header.logs_bloom;
        for receipt in &receipts {
            logs_bloom |= receipt.logs_bloom;
        }
        header.logs_bloom = logs_bloom;

        Ok((Block::new(header.clone(), txs), receipts))
    }

    // ======================== sealing ========================

    /// Attempt to seal the block with the local validator credentials. The
    /// signed block is delivered through `results` once the slot delay (and
    /// any peer back-off) has passed; any change or close of `stop` aborts
    /// the attempt without emitting.
    pub fn seal<C>(
        &self,
        chain: Arc<C>,
        block: Block,
        results: tokio::sync::mpsc::Sender<Block>,
        stop: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), RotaError>
    where
        C: ChainHeaderReader + 'static,
    {
        let mut header = block.header.clone();
        let number = header.number;

        // Sealing the genesis block is not supported.
        if number == 0 {
            return Err(RotaError::UnknownBlock);
        }
        // For 0-period chains, refuse to seal empty blocks.
        if self.config.period == 0 && block.transactions.is_empty() {
            info!(target: "rota::seal", "sealing paused, waiting for transactions");
            return Ok(());
        }

        // Don't hold the signer fields for the whole sealing procedure.
        let entry = self
            .signer
            .read()
            .clone()
            .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
        let (val, sign_fn) = (entry.val, entry.sign_fn);

        let snap = self.snapshot(chain.as_ref(), number - 1, header.parent_hash, None)?;
        if !snap.is_validator(val) {
            return Err(RotaError::UnauthorizedValidator { validator: val });
        }
        if snap.sign_recently(val) {
            info!(target: "rota::seal", "signed recently, must wait for others");
            return Ok(());
        }

        let delay = delay_until(header.timestamp);
        info!(
            target: "rota::seal",
            number,
            delay = ?delay,
            difficulty = header.difficulty,
            validator = %val,
            "sealing block"
        );

        // Sign everything up front; the wait only defers publication.
        let digest = seal::seal_hash(&header, self.config.chain_id)?;
        let signature = sign_fn(val, digest.as_slice())?;
        let mut extra = header.extra.to_vec();
        let seal_start = extra.len() - EXTRA_SEAL;
        extra[seal_start..].copy_from_slice(&signature);
        header.extra = extra.into();

        let task = SealTask::new(chain, block.with_seal(header), delay, results, stop);
        tokio::spawn(task.run());
        Ok(())
    }

    /// Time the producer should wait before sealing, reserving `left_over`
    /// for block finalization and never blocking longer than half a period.
    pub fn delay(&self, header: &Header, left_over: Duration) -> Duration {
        let mut delay = delay_until(header.timestamp);
        let period = Duration::from_secs(self.config.period);

        if left_over >= period {
            error!(target: "rota::seal", ?left_over, period = self.config.period, "invalid finalize reserve");
        } else if left_over >= delay {
            return Duration::ZERO;
        } else {
            delay -= left_over;
        }

        delay.min(period / 2)
    }

    /// Whether the local validator signed within the current window on top
    /// of `parent`.
    pub fn signed_recently<C: ChainHeaderReader + ?Sized>(
        &self,
        chain: &C,
        parent: &Header,
    ) -> Result<bool, RotaError> {
        let val = self
            .val()
            .ok_or(RotaError::UnauthorizedValidator { validator: Address::ZERO })?;
        let snap = self.snapshot(chain, parent.number, parent.hash(), None)?;
        if !snap.is_validator(val) {
            return Err(RotaError::UnauthorizedValidator { validator: val });
        }
        Ok(snap.sign_recently(val))
    }

    // ======================== helpers ========================

    fn verify_epoch_validators(&self, header: &Header) -> Result<(), RotaError> {
        let validators =
            query_validators(self.caller.as_ref(), &self.contracts, header.parent_hash)?;
        let mut expected = Vec::with_capacity(validators.len() * VALIDATOR_BYTES_LENGTH);
        for validator in &validators {
            expected.extend_from_slice(validator.as_slice());
        }
        if header.validator_bytes()? != expected.as_slice() {
            return Err(RotaError::MismatchingEpochValidators);
        }
        Ok(())
    }

    /// Four-byte hint of the chain's fork identity, stamped into the vanity
    /// tail of prepared headers. Advisory only; never verified.
    fn next_fork_hash(&self) -> [u8; NEXT_FORK_HASH_SIZE] {
        let digest = keccak256(self.genesis_hash);
        [digest[0], digest[1], digest[2], digest[3]]
    }
}

impl<S: SnapshotStore> std::fmt::Debug for Rota<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rota")
            .field("config", &self.config)
            .field("genesis_hash", &self.genesis_hash)
            .field("val", &self.val())
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn delay_until(timestamp: u64) -> Duration {
    Duration::from_secs(timestamp.saturating_sub(unix_now()))
}
