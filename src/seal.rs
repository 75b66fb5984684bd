//! Seal-hash codec and signer recovery.
//!
//! The seal hash commits to every header field except the trailing 65 byte
//! signature slot, with the chain id as the leading list element for
//! cross-chain domain separation.

use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::Encodable;
use lru::LruCache;
use parking_lot::RwLock;
use secp256k1::{ecdsa::RecoverableSignature, All, Message, Secp256k1};
use std::{num::NonZeroUsize, sync::Arc};

use crate::{error::RotaError, types::Header, EXTRA_SEAL};

/// Hash of a header prior to it being sealed.
///
/// keccak256 of the RLP list `[chain_id, parent_hash, uncle_hash, coinbase,
/// state_root, transactions_root, receipts_root, logs_bloom, difficulty,
/// number, gas_limit, gas_used, timestamp, extra[..len-65], mix_digest,
/// nonce]`. Fails only when the extra-data cannot hold a seal.
pub fn seal_hash(header: &Header, chain_id: u64) -> Result<B256, RotaError> {
    if header.extra.len() < EXTRA_SEAL {
        return Err(RotaError::MissingSignature);
    }
    let mut out = Vec::with_capacity(768);
    encode_sig_header(header, chain_id, &mut out);
    Ok(keccak256(&out))
}

fn encode_sig_header(header: &Header, chain_id: u64, out: &mut Vec<u8>) {
    let extra = &header.extra[..header.extra.len() - EXTRA_SEAL];
    let payload_length = chain_id.length()
        + header.parent_hash.length()
        + header.uncle_hash.length()
        + header.coinbase.length()
        + header.state_root.length()
        + header.transactions_root.length()
        + header.receipts_root.length()
        + header.logs_bloom.length()
        + header.difficulty.length()
        + header.number.length()
        + header.gas_limit.length()
        + header.gas_used.length()
        + header.timestamp.length()
        + extra.length()
        + header.mix_digest.length()
        + header.nonce.length();
    alloy_rlp::Header { list: true, payload_length }.encode(out);
    chain_id.encode(out);
    header.parent_hash.encode(out);
    header.uncle_hash.encode(out);
    header.coinbase.encode(out);
    header.state_root.encode(out);
    header.transactions_root.encode(out);
    header.receipts_root.encode(out);
    header.logs_bloom.encode(out);
    header.difficulty.encode(out);
    header.number.encode(out);
    header.gas_limit.encode(out);
    header.gas_used.encode(out);
    header.timestamp.encode(out);
    extra.encode(out);
    header.mix_digest.encode(out);
    header.nonce.encode(out);
}

/// Bounded cache from block hash to recovered signer address.
#[derive(Clone)]
pub struct SignatureCache {
    inner: Arc<RwLock<LruCache<B256, Address>>>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            ))),
        }
    }

    pub fn get(&self, hash: &B256) -> Option<Address> {
        self.inner.write().get(hash).copied()
    }

    pub fn insert(&self, hash: B256, signer: Address) {
        self.inner.write().put(hash, signer);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl std::fmt::Debug for SignatureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureCache").field("len", &self.inner.read().len()).finish()
    }
}

/// Extract the signing validator from a sealed header, via the cache when
/// the header was recovered before.
pub fn recover_signer(
    secp: &Secp256k1<All>,
    header: &Header,
    cache: &SignatureCache,
    chain_id: u64,
) -> Result<Address, RotaError> {
    let hash = header.hash();
    if let Some(signer) = cache.get(&hash) {
        return Ok(signer);
    }

    let signature = header.signature()?;
    let digest = seal_hash(header, chain_id)?;
    let signer = recover_address(secp, digest, signature)?;

    cache.insert(hash, signer);
    Ok(signer)
}

/// Recover the 20-byte address behind a 65 byte (r||s||v) signature.
pub fn recover_address(
    secp: &Secp256k1<All>,
    digest: B256,
    signature: &[u8],
) -> Result<Address, RotaError> {
    if signature.len() != EXTRA_SEAL {
        return Err(RotaError::MissingSignature);
    }

    // Accept both 0/1 and legacy 27/28 recovery ids.
    let v = signature[64];
    let recovery_id_value = if v >= 27 { v - 27 } else { v } as i32;
    let recovery_id = secp256k1::ecdsa::RecoveryId::from_i32(recovery_id_value).map_err(|e| {
        RotaError::SignatureRecoveryFailed {
            message: format!("invalid recovery id {recovery_id_value}: {e}"),
        }
    })?;

    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|e| RotaError::SignatureRecoveryFailed { message: e.to_string() })?;

    let message = Message::from_digest_slice(digest.as_slice())
        .map_err(|e| RotaError::SignatureRecoveryFailed { message: e.to_string() })?;

    let pubkey = secp
        .recover_ecdsa(&message, &signature)
        .map_err(|e| RotaError::SignatureRecoveryFailed { message: e.to_string() })?;

    // Address is the last 20 bytes of keccak256 over the uncompressed key
    // without its 0x04 prefix.
    let pubkey_bytes = pubkey.serialize_uncompressed();
    let hash = keccak256(&pubkey_bytes[1..]);
    Ok(Address::from_slice(&hash[12..]))
}
