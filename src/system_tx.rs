//! System-transaction orchestration.
//!
//! At fixed points in block finalization the engine injects (when producing)
//! or verifies (when importing) a deterministic tail of zero-gas-price
//! transactions from the coinbase to the system contracts: contract
//! initialization at block 1, slashing of missed turns, and reward
//! distribution. Producer and verifier must agree on the tail byte for byte;
//! matching is by EIP-155 signing hash.

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};
use tracing::{debug, error, trace};

use crate::{
    config::{RotaConfig, SystemContracts, MAX_SYSTEM_BALANCE, SYSTEM_ADDRESS},
    error::RotaError,
    traits::{ContractCaller, EvmHost, SignerTxFn, SystemMessage},
    types::{Header, Receipt, Transaction},
    SYSTEM_REWARD_PERCENT, SYSTEM_TX_GAS,
};

sol! {
    function init() external;
    function deposit(address validator) external payable;
    function getValidators() external view returns (address[] memory);
    function slash(address validator) external;
    function distributeReward(address[] calldata validators) external;
    function setNewRound() external;
}

/// Whether a transaction is a system transaction: a zero-gas-price call
/// from the block's coinbase to a known system contract.
pub fn is_system_transaction(
    tx: &Transaction,
    sender: Address,
    coinbase: Address,
    contracts: &SystemContracts,
) -> bool {
    sender == coinbase && contracts.contains(tx.to) && tx.gas_price.is_zero()
}

/// Ask the validator controller for the validator set effective at the state
/// of `block_hash`, ascending order.
pub fn query_validators<C: ContractCaller + ?Sized>(
    caller: &C,
    contracts: &SystemContracts,
    block_hash: B256,
) -> Result<Vec<Address>, RotaError> {
    let data = Bytes::from(getValidatorsCall {}.abi_encode());
    let output = caller.static_call(block_hash, contracts.validator_controller, data)?;

    let mut validators = getValidatorsCall::abi_decode_returns(&output)
        .map_err(|e| RotaError::ContractCall { message: format!("getValidators: {e}") })?;
    if validators.is_empty() {
        return Err(RotaError::EmptyValidatorSet);
    }
    validators.sort_unstable();
    Ok(validators)
}

/// Builds (mining) or replays (verifying) the system-transaction tail of a
/// block, one synthetic call at a time.
pub struct Orchestrator {
    config: RotaConfig,
    contracts: SystemContracts,
    /// The locally authorized validator; only relevant when mining.
    val: Address,
    sign_tx_fn: Option<SignerTxFn>,
    mining: bool,
}

impl Orchestrator {
    /// Producer-side orchestrator: expected transactions are signed with the
    /// validator's key and appended to the block.
    pub fn mining(
        config: RotaConfig,
        contracts: SystemContracts,
        val: Address,
        sign_tx_fn: SignerTxFn,
    ) -> Self {
        Self { config, contracts, val, sign_tx_fn: Some(sign_tx_fn), mining: true }
    }

    /// Verifier-side orchestrator: expected transactions are matched against
    /// the received tail in order.
    pub fn verifying(config: RotaConfig, contracts: SystemContracts) -> Self {
        Self { config, contracts, val: Address::ZERO, sign_tx_fn: None, mining: false }
    }

    /// `init()` on every system contract, in the fixed genesis order. Only
    /// ever part of block 1.
    pub fn init_contracts<H: EvmHost + ?Sized>(
        &self,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        mut received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let data = Bytes::from(initCall {}.abi_encode());
        for contract in self.contracts.init_order() {
            trace!(target: "rota::systx", block = header.number, %contract, "init contract");
            let msg = self.system_message(header.coinbase, contract, data.clone(), U256::ZERO);
            self.apply_transaction(msg, state, header, txs, receipts, received.as_deref_mut(), used_gas)?;
        }
        Ok(())
    }

    /// `slash(validator)` against the slash contract for a validator that
    /// let its turn lapse.
    pub fn slash<H: EvmHost + ?Sized>(
        &self,
        spoiled: Address,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let data = Bytes::from(slashCall { validator: spoiled }.abi_encode());
        let msg = self.system_message(header.coinbase, self.contracts.slash, data, U256::ZERO);
        self.apply_transaction(msg, state, header, txs, receipts, received, used_gas)
    }

    /// Sweep the balance accrued at the reserved system address into the
    /// coinbase, siphoning a share to the system-reward contract while it
    /// sits under its ceiling and depositing the remainder with the
    /// validator controller.
    pub fn distribute_incoming<H: EvmHost + ?Sized>(
        &self,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        mut received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let coinbase = header.coinbase;
        let mut balance = state.balance(SYSTEM_ADDRESS);
        if balance.is_zero() {
            return Ok(());
        }
        state.set_balance(SYSTEM_ADDRESS, U256::ZERO);
        state.add_balance(coinbase, balance);

        if state.balance(self.contracts.system_reward) < MAX_SYSTEM_BALANCE {
            let rewards = balance >> SYSTEM_REWARD_PERCENT;
            if !rewards.is_zero() {
                let msg = self.system_message(
                    coinbase,
                    self.contracts.system_reward,
                    Bytes::new(),
                    rewards,
                );
                self.apply_transaction(
                    msg,
                    state,
                    header,
                    txs,
                    receipts,
                    received.as_deref_mut(),
                    used_gas,
                )?;
                debug!(target: "rota::systx", block = header.number, amount = %rewards, "distribute to system reward pool");
                balance -= rewards;
            }
        }

        debug!(target: "rota::systx", block = header.number, amount = %balance, "distribute to validator contract");
        let data = Bytes::from(depositCall { validator: coinbase }.abi_encode());
        let msg =
            self.system_message(coinbase, self.contracts.validator_controller, data, balance);
        self.apply_transaction(msg, state, header, txs, receipts, received, used_gas)
    }

    /// `distributeReward(validators)` on the staking delegator; part of the
    /// epoch rotation the driver runs ahead of the regular tail.
    pub fn distribute_delegator_reward<H: EvmHost + ?Sized>(
        &self,
        validators: Vec<Address>,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let data = Bytes::from(distributeRewardCall { validators }.abi_encode());
        let msg =
            self.system_message(header.coinbase, self.contracts.staking_delegator, data, U256::ZERO);
        self.apply_transaction(msg, state, header, txs, receipts, received, used_gas)
    }

    /// `setNewRound()` on the staking delegator at an epoch boundary.
    pub fn set_new_round<H: EvmHost + ?Sized>(
        &self,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let data = Bytes::from(setNewRoundCall {}.abi_encode());
        let msg =
            self.system_message(header.coinbase, self.contracts.staking_delegator, data, U256::ZERO);
        self.apply_transaction(msg, state, header, txs, receipts, received, used_gas)
    }

    fn system_message(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> SystemMessage {
        SystemMessage { from, to, value, data, gas: SYSTEM_TX_GAS }
    }

    /// Execute one synthetic call and account for it.
    ///
    /// When mining, the expected transaction is signed by the validator's
    /// key. When verifying, it must match the next received transaction by
    /// signing hash, wrong order or content fails the block.
    fn apply_transaction<H: EvmHost + ?Sized>(
        &self,
        msg: SystemMessage,
        state: &mut H,
        header: &Header,
        txs: &mut Vec<Transaction>,
        receipts: &mut Vec<Receipt>,
        received: Option<&mut Vec<Transaction>>,
        used_gas: &mut u64,
    ) -> Result<(), RotaError> {
        let chain_id = self.config.chain_id;
        let nonce = state.nonce(msg.from);
        let expected = Transaction {
            nonce,
            gas_price: U256::ZERO,
            gas: msg.gas,
            to: msg.to,
            value: msg.value,
            data: msg.data.clone(),
            signature: None,
        };
        let expected_hash = expected.sig_hash(chain_id);

        let tx = if self.mining && msg.from == self.val {
            let sign_tx_fn = self.sign_tx_fn.as_ref().ok_or_else(|| {
                RotaError::SigningFailed { message: "no transaction signer authorized".into() }
            })?;
            sign_tx_fn(self.val, expected, chain_id)?
        } else {
            let received = received.ok_or(RotaError::SystemTxMissing)?;
            if received.is_empty() {
                return Err(RotaError::SystemTxMissing);
            }
            // The head is consumed only on a match; a tolerated slash
            // mismatch must leave the tail aligned for the next call.
            let actual_hash = received[0].sig_hash(chain_id);
            if actual_hash != expected_hash {
                error!(
                    target: "rota::systx",
                    block = header.number,
                    expected = %expected_hash,
                    got = %actual_hash,
                    "system tx mismatch"
                );
                return Err(RotaError::SystemTxMismatch {
                    expected: expected_hash,
                    got: actual_hash,
                });
            }
            received.remove(0)
        };

        let outcome = state.execute(header, &msg)?;
        *used_gas += outcome.gas_used;

        let receipt = Receipt::new(
            tx.hash(chain_id),
            outcome.gas_used,
            *used_gas,
            outcome.logs,
            header.number,
            txs.len() as u64,
        );
        txs.push(tx);
        receipts.push(receipt);
        state.set_nonce(msg.from, nonce + 1);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::traits::{CallOutcome, StateDb};
    use crate::types::TxSignature;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    pub(crate) struct MockState {
        pub balances: HashMap<Address, U256>,
        pub nonces: HashMap<Address, u64>,
        pub executed: Vec<SystemMessage>,
    }

    impl StateDb for MockState {
        fn balance(&self, address: Address) -> U256 {
            self.balances.get(&address).copied().unwrap_or_default()
        }

        fn set_balance(&mut self, address: Address, balance: U256) {
            self.balances.insert(address, balance);
        }

        fn add_balance(&mut self, address: Address, amount: U256) {
            let entry = self.balances.entry(address).or_default();
            *entry += amount;
        }

        fn nonce(&self, address: Address) -> u64 {
            self.nonces.get(&address).copied().unwrap_or_default()
        }

        fn set_nonce(&mut self, address: Address, nonce: u64) {
            self.nonces.insert(address, nonce);
        }

        fn intermediate_root(&mut self) -> B256 {
            B256::repeat_byte(0x5a)
        }
    }

    impl EvmHost for MockState {
        fn execute(
            &mut self,
            _header: &Header,
            msg: &SystemMessage,
        ) -> Result<CallOutcome, RotaError> {
            self.executed.push(msg.clone());
            Ok(CallOutcome { gas_used: 21_000, output: Bytes::new(), logs: Vec::new() })
        }
    }

    pub(crate) fn noop_tx_signer() -> SignerTxFn {
        Arc::new(|_, mut tx: Transaction, _| {
            tx.signature =
                Some(TxSignature { v: 148, r: U256::from(1u64), s: U256::from(1u64) });
            Ok(tx)
        })
    }

    fn coinbase() -> Address {
        Address::repeat_byte(0xc0)
    }

    fn header_at(number: u64) -> Header {
        Header { number, coinbase: coinbase(), difficulty: 1, gas_limit: 30_000_000, ..Default::default() }
    }

    fn config() -> RotaConfig {
        RotaConfig::new(56, 3, 200)
    }

    fn mining_orchestrator() -> Orchestrator {
        Orchestrator::mining(config(), SystemContracts::default(), coinbase(), noop_tx_signer())
    }

    #[test]
    fn recognizes_system_transactions() {
        let contracts = SystemContracts::default();
        let tx = Transaction {
            nonce: 0,
            gas_price: U256::ZERO,
            gas: SYSTEM_TX_GAS,
            to: contracts.slash,
            value: U256::ZERO,
            data: Bytes::new(),
            signature: None,
        };

        assert!(is_system_transaction(&tx, coinbase(), coinbase(), &contracts));
        // Wrong sender.
        assert!(!is_system_transaction(&tx, Address::repeat_byte(0x01), coinbase(), &contracts));
        // Non-system target.
        let mut user_tx = tx.clone();
        user_tx.to = Address::repeat_byte(0x99);
        assert!(!is_system_transaction(&user_tx, coinbase(), coinbase(), &contracts));
        // Paid gas.
        let mut paid_tx = tx;
        paid_tx.gas_price = U256::from(1u64);
        assert!(!is_system_transaction(&paid_tx, coinbase(), coinbase(), &contracts));
    }

    #[test]
    fn mining_slash_then_distribute_produces_the_expected_tail() {
        let orchestrator = mining_orchestrator();
        let contracts = SystemContracts::default();
        let header = header_at(9);
        let spoiled = Address::repeat_byte(0x11);

        let mut state = MockState::default();
        state.set_balance(SYSTEM_ADDRESS, U256::from(1_000_000u64));
        // Reward pool already full: no siphon transaction.
        state.set_balance(contracts.system_reward, MAX_SYSTEM_BALANCE);

        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;

        orchestrator
            .slash(spoiled, &mut state, &header, &mut txs, &mut receipts, None, &mut used_gas)
            .unwrap();
        orchestrator
            .distribute_incoming(&mut state, &header, &mut txs, &mut receipts, None, &mut used_gas)
            .unwrap();

        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].to, contracts.slash);
        assert_eq!(txs[0].data, Bytes::from(slashCall { validator: spoiled }.abi_encode()));
        assert_eq!(txs[1].to, contracts.validator_controller);
        assert_eq!(txs[1].value, U256::from(1_000_000u64));
        assert_eq!(
            txs[1].data,
            Bytes::from(depositCall { validator: coinbase() }.abi_encode())
        );

        // Nonces advanced per call; cumulative gas accrued; swept balance
        // landed on the coinbase.
        assert_eq!(txs[0].nonce, 0);
        assert_eq!(txs[1].nonce, 1);
        assert_eq!(state.nonce(coinbase()), 2);
        assert_eq!(used_gas, 42_000);
        assert_eq!(receipts[1].cumulative_gas_used, 42_000);
        assert_eq!(state.balance(SYSTEM_ADDRESS), U256::ZERO);
        assert_eq!(state.balance(coinbase()), U256::from(1_000_000u64));
    }

    #[test]
    fn distribute_siphons_into_an_underfunded_reward_pool() {
        let orchestrator = mining_orchestrator();
        let contracts = SystemContracts::default();
        let header = header_at(9);

        let incoming = U256::from(1u64) << 40;
        let mut state = MockState::default();
        state.set_balance(SYSTEM_ADDRESS, incoming);

        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        orchestrator
            .distribute_incoming(&mut state, &header, &mut txs, &mut receipts, None, &mut used_gas)
            .unwrap();

        let siphoned = incoming >> SYSTEM_REWARD_PERCENT;
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].to, contracts.system_reward);
        assert_eq!(txs[0].value, siphoned);
        assert!(txs[0].data.is_empty());
        assert_eq!(txs[1].to, contracts.validator_controller);
        assert_eq!(txs[1].value, incoming - siphoned);
    }

    #[test]
    fn distribute_is_a_no_op_without_incoming_balance() {
        let orchestrator = mining_orchestrator();
        let header = header_at(9);

        let mut state = MockState::default();
        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        orchestrator
            .distribute_incoming(&mut state, &header, &mut txs, &mut receipts, None, &mut used_gas)
            .unwrap();
        assert!(txs.is_empty());
        assert_eq!(used_gas, 0);
    }

    #[test]
    fn verifier_replays_the_produced_tail() {
        let header = header_at(9);
        let contracts = SystemContracts::default();
        let spoiled = Address::repeat_byte(0x11);

        // Produce the tail.
        let mut produced = Vec::new();
        {
            let orchestrator = mining_orchestrator();
            let mut state = MockState::default();
            state.set_balance(SYSTEM_ADDRESS, U256::from(500u64));
            state.set_balance(contracts.system_reward, MAX_SYSTEM_BALANCE);
            let mut receipts = Vec::new();
            let mut used_gas = 0;
            orchestrator
                .slash(spoiled, &mut state, &header, &mut produced, &mut receipts, None, &mut used_gas)
                .unwrap();
            orchestrator
                .distribute_incoming(&mut state, &header, &mut produced, &mut receipts, None, &mut used_gas)
                .unwrap();
        }

        // Replay it on the verifier side.
        let orchestrator = Orchestrator::verifying(config(), contracts);
        let mut state = MockState::default();
        state.set_balance(SYSTEM_ADDRESS, U256::from(500u64));
        state.set_balance(contracts.system_reward, MAX_SYSTEM_BALANCE);

        let mut received = produced.clone();
        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        orchestrator
            .slash(
                spoiled,
                &mut state,
                &header,
                &mut txs,
                &mut receipts,
                Some(&mut received),
                &mut used_gas,
            )
            .unwrap();
        orchestrator
            .distribute_incoming(
                &mut state,
                &header,
                &mut txs,
                &mut receipts,
                Some(&mut received),
                &mut used_gas,
            )
            .unwrap();

        assert!(received.is_empty());
        assert_eq!(txs, produced);
    }

    #[test]
    fn verifier_rejects_out_of_order_tails() {
        let header = header_at(9);
        let contracts = SystemContracts::default();
        let spoiled = Address::repeat_byte(0x11);

        let mut produced = Vec::new();
        {
            let orchestrator = mining_orchestrator();
            let mut state = MockState::default();
            state.set_balance(SYSTEM_ADDRESS, U256::from(500u64));
            state.set_balance(contracts.system_reward, MAX_SYSTEM_BALANCE);
            let mut receipts = Vec::new();
            let mut used_gas = 0;
            orchestrator
                .slash(spoiled, &mut state, &header, &mut produced, &mut receipts, None, &mut used_gas)
                .unwrap();
            orchestrator
                .distribute_incoming(&mut state, &header, &mut produced, &mut receipts, None, &mut used_gas)
                .unwrap();
        }
        produced.swap(0, 1);

        let orchestrator = Orchestrator::verifying(config(), contracts);
        let mut state = MockState::default();
        state.set_balance(SYSTEM_ADDRESS, U256::from(500u64));
        state.set_balance(contracts.system_reward, MAX_SYSTEM_BALANCE);

        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        let err = orchestrator
            .slash(
                spoiled,
                &mut state,
                &header,
                &mut txs,
                &mut receipts,
                Some(&mut produced),
                &mut used_gas,
            )
            .unwrap_err();
        assert!(matches!(err, RotaError::SystemTxMismatch { .. }));
    }

    #[test]
    fn verifier_requires_the_tail_to_be_present() {
        let orchestrator = Orchestrator::verifying(config(), SystemContracts::default());
        let header = header_at(9);

        let mut state = MockState::default();
        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        let mut received = Vec::new();
        let err = orchestrator
            .slash(
                Address::repeat_byte(0x11),
                &mut state,
                &header,
                &mut txs,
                &mut receipts,
                Some(&mut received),
                &mut used_gas,
            )
            .unwrap_err();
        assert_eq!(err, RotaError::SystemTxMissing);
    }

    #[test]
    fn init_touches_every_contract_in_order() {
        let orchestrator = mining_orchestrator();
        let contracts = SystemContracts::default();
        let header = header_at(1);

        let mut state = MockState::default();
        let mut txs = Vec::new();
        let mut receipts = Vec::new();
        let mut used_gas = 0;
        orchestrator
            .init_contracts(&mut state, &header, &mut txs, &mut receipts, None, &mut used_gas)
            .unwrap();

        let targets: Vec<Address> = txs.iter().map(|tx| tx.to).collect();
        assert_eq!(targets, contracts.init_order().to_vec());
        let init_data = Bytes::from(initCall {}.abi_encode());
        assert!(txs.iter().all(|tx| tx.data == init_data && tx.value.is_zero()));
        assert_eq!(state.nonce(coinbase()), 10);
    }
}
