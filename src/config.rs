//! Engine configuration and the system-contract registry.

use alloy_primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_EPOCH_LENGTH;

/// Reserved address that accrues block fees before distribution. Not a
/// contract; swept into the coinbase by `distributeIncoming` every block.
pub const SYSTEM_ADDRESS: Address = address!("fffffffffffffffffffffffffffffffffffffffe");

/// Ceiling on the system-reward contract balance (100 ether). While the
/// contract holds less than this, a share of incoming fees is siphoned to it.
pub const MAX_SYSTEM_BALANCE: U256 = U256::from_limbs([0x6bc7_5e2d_6310_0000, 0x5, 0, 0]);

/// Rota consensus engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotaConfig {
    /// Chain id, mixed into seal hashes and system-transaction signatures.
    pub chain_id: u64,
    /// Number of seconds between blocks to enforce.
    pub period: u64,
    /// Epoch length after which the validator set is reread from the
    /// validator controller and embedded in block extra-data.
    pub epoch: u64,
}

impl RotaConfig {
    /// Create a configuration, substituting the default epoch for zero.
    pub fn new(chain_id: u64, period: u64, epoch: u64) -> Self {
        Self {
            chain_id,
            period,
            epoch: if epoch == 0 { DEFAULT_EPOCH_LENGTH } else { epoch },
        }
    }
}

impl Default for RotaConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            period: 3,
            epoch: DEFAULT_EPOCH_LENGTH,
        }
    }
}

/// Addresses of the on-chain system contracts the engine orchestrates.
///
/// The defaults are the well-known genesis placements; chains that deploy
/// elsewhere pass their own registry in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemContracts {
    /// Validator-set controller; receives `deposit` and answers `getValidators`.
    pub validator_controller: Address,
    /// Slash indicator; receives `slash(validator)` for missed turns.
    pub slash: Address,
    /// System reward pool.
    pub system_reward: Address,
    /// On-chain light client fed by the header attestor.
    pub light_client: Address,
    /// Cross-chain relayer registry.
    pub relayer_hub: Address,
    /// Validator hub, maintained by governance on the staking side.
    pub validator_hub: Address,
    /// Governance hub.
    pub gov_hub: Address,
    /// Staking system entry point.
    pub staking_system: Address,
    /// Staking delegator; round rotation and delegator rewards.
    pub staking_delegator: Address,
    /// Protocol fee sink.
    pub fee_sink: Address,
}

impl SystemContracts {
    /// All system contracts in the fixed `init()` order used at block 1.
    pub fn init_order(&self) -> [Address; 10] {
        [
            self.validator_controller,
            self.slash,
            self.system_reward,
            self.light_client,
            self.relayer_hub,
            self.validator_hub,
            self.gov_hub,
            self.staking_system,
            self.staking_delegator,
            self.fee_sink,
        ]
    }

    /// Whether `to` is one of the known system contracts.
    pub fn contains(&self, to: Address) -> bool {
        self.init_order().contains(&to)
    }
}

impl Default for SystemContracts {
    fn default() -> Self {
        Self {
            validator_controller: address!("0000000000000000000000000000000000001000"),
            slash: address!("0000000000000000000000000000000000001001"),
            system_reward: address!("0000000000000000000000000000000000001002"),
            light_client: address!("0000000000000000000000000000000000001003"),
            relayer_hub: address!("0000000000000000000000000000000000001004"),
            validator_hub: address!("0000000000000000000000000000000000001005"),
            gov_hub: address!("0000000000000000000000000000000000001006"),
            staking_system: address!("0000000000000000000000000000000000001007"),
            staking_delegator: address!("0000000000000000000000000000000000001008"),
            fee_sink: address!("0000000000000000000000000000000000001009"),
        }
    }
}
