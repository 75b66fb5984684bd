//! Block primitives consumed by the engine.
//!
//! The engine does not own the chain's canonical types; these carry exactly
//! the fields the consensus rules read and the RLP shape they commit to.

use alloy_primitives::{b256, keccak256, Address, Bloom, Bytes, Log, B256, B64, U256};
use alloy_rlp::Encodable;

use crate::{error::RotaError, EXTRA_SEAL, EXTRA_VANITY, MAX_VALIDATORS, VALIDATOR_BYTES_LENGTH};

/// keccak256(RLP([])) — the only uncle hash a PoA block may carry.
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    /// Proposing validator.
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    /// 2 for in-turn seals, 1 otherwise.
    pub difficulty: u64,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
    /// Vanity prefix, optional epoch validator list, trailing 65 byte seal.
    pub extra: Bytes,
    /// Must be zero.
    pub mix_digest: B256,
    /// Must be zero.
    pub nonce: B64,
    /// Per-gas base fee, once the fee market is enabled.
    pub base_fee: Option<u64>,
    /// Unsupported; verification rejects headers that set it.
    pub withdrawals_hash: Option<B256>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: EMPTY_UNCLE_HASH,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Bloom::ZERO,
            difficulty: 0,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra: Bytes::new(),
            mix_digest: B256::ZERO,
            nonce: B64::ZERO,
            base_fee: None,
            withdrawals_hash: None,
        }
    }
}

impl Encodable for Header {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.payload_length();
        alloy_rlp::Header { list: true, payload_length }.encode(out);
        self.parent_hash.encode(out);
        self.uncle_hash.encode(out);
        self.coinbase.encode(out);
        self.state_root.encode(out);
        self.transactions_root.encode(out);
        self.receipts_root.encode(out);
        self.logs_bloom.encode(out);
        self.difficulty.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.timestamp.encode(out);
        self.extra.encode(out);
        self.mix_digest.encode(out);
        self.nonce.encode(out);
        if let Some(base_fee) = self.base_fee {
            base_fee.encode(out);
        }
        if let Some(withdrawals_hash) = &self.withdrawals_hash {
            withdrawals_hash.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Header {
    fn payload_length(&self) -> usize {
        let mut length = self.parent_hash.length()
            + self.uncle_hash.length()
            + self.coinbase.length()
            + self.state_root.length()
            + self.transactions_root.length()
            + self.receipts_root.length()
            + self.logs_bloom.length()
            + self.difficulty.length()
            + self.number.length()
            + self.gas_limit.length()
            + self.gas_used.length()
            + self.timestamp.length()
            + self.extra.length()
            + self.mix_digest.length()
            + self.nonce.length();
        if let Some(base_fee) = self.base_fee {
            length += base_fee.length();
        }
        if let Some(withdrawals_hash) = &self.withdrawals_hash {
            length += withdrawals_hash.length();
        }
        length
    }

    /// Hash of the full RLP-encoded header, seal included.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Whether this header sits on an epoch boundary.
    pub fn is_epoch(&self, epoch: u64) -> bool {
        self.number % epoch == 0
    }

    /// The trailing 65 byte seal slot of the extra-data.
    pub fn signature(&self) -> Result<&[u8], RotaError> {
        if self.extra.len() < EXTRA_SEAL {
            return Err(RotaError::MissingSignature);
        }
        Ok(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }

    /// The validator-list region of the extra-data, between vanity and seal.
    pub fn validator_bytes(&self) -> Result<&[u8], RotaError> {
        if self.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(RotaError::MissingSignature);
        }
        Ok(&self.extra[EXTRA_VANITY..self.extra.len() - EXTRA_SEAL])
    }

    /// Parse the embedded validator list of an epoch block, ascending order
    /// not enforced here (the snapshot orders on insert).
    pub fn epoch_validators(&self) -> Result<Vec<Address>, RotaError> {
        parse_validators(self.validator_bytes()?)
    }
}

/// Parse a packed 20-byte-per-entry validator list.
pub fn parse_validators(bytes: &[u8]) -> Result<Vec<Address>, RotaError> {
    if bytes.is_empty() || bytes.len() % VALIDATOR_BYTES_LENGTH != 0 {
        return Err(RotaError::InvalidSpanValidators);
    }
    let count = bytes.len() / VALIDATOR_BYTES_LENGTH;
    if count > MAX_VALIDATORS {
        return Err(RotaError::TooManyValidators { count });
    }
    Ok(bytes
        .chunks(VALIDATOR_BYTES_LENGTH)
        .map(Address::from_slice)
        .collect())
}

/// Signature of a system transaction, EIP-155 encoded v.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// Legacy-shaped transaction, the form every synthetic system call takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    /// Present once signed by the proposing validator.
    pub signature: Option<TxSignature>,
}

impl Transaction {
    /// The EIP-155 signing hash; system transactions are matched on this.
    pub fn sig_hash(&self, chain_id: u64) -> B256 {
        let mut out = Vec::new();
        let payload_length = self.nonce.length()
            + self.gas_price.length()
            + self.gas.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + chain_id.length()
            + 0u8.length()
            + 0u8.length();
        alloy_rlp::Header { list: true, payload_length }.encode(&mut out);
        self.nonce.encode(&mut out);
        self.gas_price.encode(&mut out);
        self.gas.encode(&mut out);
        self.to.encode(&mut out);
        self.value.encode(&mut out);
        self.data.encode(&mut out);
        chain_id.encode(&mut out);
        0u8.encode(&mut out);
        0u8.encode(&mut out);
        keccak256(&out)
    }

    /// Transaction hash: over the signed encoding when a signature is
    /// attached, otherwise the signing hash.
    pub fn hash(&self, chain_id: u64) -> B256 {
        let Some(signature) = &self.signature else {
            return self.sig_hash(chain_id);
        };
        let mut out = Vec::new();
        let payload_length = self.nonce.length()
            + self.gas_price.length()
            + self.gas.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + signature.v.length()
            + signature.r.length()
            + signature.s.length();
        alloy_rlp::Header { list: true, payload_length }.encode(&mut out);
        self.nonce.encode(&mut out);
        self.gas_price.encode(&mut out);
        self.gas.encode(&mut out);
        self.to.encode(&mut out);
        self.value.encode(&mut out);
        self.data.encode(&mut out);
        signature.v.encode(&mut out);
        signature.r.encode(&mut out);
        signature.s.encode(&mut out);
        keccak256(&out)
    }
}

/// Execution receipt, shaped like a user-transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
    pub logs_bloom: Bloom,
    pub block_number: u64,
    pub transaction_index: u64,
}

impl Receipt {
    /// Build a receipt, folding the logs into its bloom.
    pub fn new(
        tx_hash: B256,
        gas_used: u64,
        cumulative_gas_used: u64,
        logs: Vec<Log>,
        block_number: u64,
        transaction_index: u64,
    ) -> Self {
        let mut logs_bloom = Bloom::ZERO;
        for log in &logs {
            logs_bloom.accrue_log(log);
        }
        Self { tx_hash, gas_used, cumulative_gas_used, logs, logs_bloom, block_number, transaction_index }
    }
}

/// An assembled block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    /// Always empty under PoA; carried so the driver can hand us foreign
    /// blocks for uncle verification.
    pub uncles: Vec<Header>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions, uncles: Vec::new() }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    /// The same block carrying a sealed copy of the header.
    pub fn with_seal(&self, header: Header) -> Self {
        Self { header, transactions: self.transactions.clone(), uncles: self.uncles.clone() }
    }
}

/// Commitment to an ordered list of RLP-encodable items, used for the
/// transaction and receipt roots of blocks this engine assembles.
pub fn ordered_list_root<T: Encodable>(items: &[T]) -> B256 {
    let mut out = Vec::new();
    let payload_length: usize = items.iter().map(Encodable::length).sum();
    alloy_rlp::Header { list: true, payload_length }.encode(&mut out);
    for item in items {
        item.encode(&mut out);
    }
    keccak256(&out)
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.tx_payload_length();
        alloy_rlp::Header { list: true, payload_length }.encode(out);
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        if let Some(signature) = &self.signature {
            signature.v.encode(out);
            signature.r.encode(out);
            signature.s.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.tx_payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Transaction {
    fn tx_payload_length(&self) -> usize {
        let mut length = self.nonce.length()
            + self.gas_price.length()
            + self.gas.length()
            + self.to.length()
            + self.value.length()
            + self.data.length();
        if let Some(signature) = &self.signature {
            length += signature.v.length() + signature.r.length() + signature.s.length();
        }
        length
    }
}

impl Encodable for Receipt {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.receipt_payload_length();
        alloy_rlp::Header { list: true, payload_length }.encode(out);
        self.tx_hash.encode(out);
        self.cumulative_gas_used.encode(out);
        self.logs_bloom.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.receipt_payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Receipt {
    fn receipt_payload_length(&self) -> usize {
        self.tx_hash.length() + self.cumulative_gas_used.length() + self.logs_bloom.length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn header_with_extra(extra: Vec<u8>) -> Header {
        Header { extra: extra.into(), ..Default::default() }
    }

    #[test]
    fn signature_requires_seal_slot() {
        let header = header_with_extra(vec![0u8; EXTRA_SEAL - 1]);
        assert_eq!(header.signature(), Err(RotaError::MissingSignature));

        let mut extra = vec![0u8; EXTRA_VANITY + EXTRA_SEAL];
        extra[EXTRA_VANITY] = 0xaa;
        let header = header_with_extra(extra);
        assert_eq!(header.signature().unwrap()[0], 0xaa);
    }

    #[test]
    fn epoch_validators_parse() {
        let a = Address::repeat_byte(0x11);
        let b = Address::repeat_byte(0x22);

        let mut extra = vec![0u8; EXTRA_VANITY];
        extra.extend_from_slice(a.as_slice());
        extra.extend_from_slice(b.as_slice());
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);

        let header = header_with_extra(extra);
        assert_eq!(header.epoch_validators().unwrap(), vec![a, b]);
    }

    #[test]
    fn epoch_validators_reject_ragged_list() {
        let mut extra = vec![0u8; EXTRA_VANITY];
        extra.extend_from_slice(&[0u8; 19]);
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);

        let header = header_with_extra(extra);
        assert_eq!(header.epoch_validators(), Err(RotaError::InvalidSpanValidators));

        // Empty list is also invalid on an epoch block.
        let header = header_with_extra(vec![0u8; EXTRA_VANITY + EXTRA_SEAL]);
        assert_eq!(header.epoch_validators(), Err(RotaError::InvalidSpanValidators));
    }

    #[test]
    fn header_hash_commits_to_every_field() {
        let header = Header::default();
        let mut other = header.clone();
        other.gas_used = 1;
        assert_ne!(header.hash(), other.hash());

        let mut other = header.clone();
        other.base_fee = Some(7);
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn sig_hash_separates_chains() {
        let tx = Transaction {
            nonce: 0,
            gas_price: U256::ZERO,
            gas: u64::MAX / 2,
            to: Address::repeat_byte(0x10),
            value: U256::ZERO,
            data: Bytes::new(),
            signature: None,
        };
        assert_ne!(tx.sig_hash(1), tx.sig_hash(2));
        assert_eq!(tx.sig_hash(1), tx.sig_hash(1));
    }

    #[test]
    fn signed_hash_differs_from_sig_hash() {
        let mut tx = Transaction {
            nonce: 3,
            gas_price: U256::ZERO,
            gas: 21000,
            to: Address::repeat_byte(0x10),
            value: U256::from(5u64),
            data: Bytes::from(vec![0x01, 0x02]),
            signature: None,
        };
        let unsigned = tx.hash(1);
        assert_eq!(unsigned, tx.sig_hash(1));

        tx.signature = Some(TxSignature { v: 37, r: U256::from(1u64), s: U256::from(2u64) });
        assert_ne!(tx.hash(1), unsigned);
    }
}
