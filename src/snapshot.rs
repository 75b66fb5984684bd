//! Authorization snapshot.
//!
//! A snapshot is the immutable record of the validator set and the recent
//! signers ring after a given block. It is derivable from the header stream
//! alone: created from the genesis (or a trusted checkpoint) validator list
//! and advanced by applying headers forward one at a time.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::RotaError,
    store::{SnapshotStore, SNAPSHOT_PREFIX},
    types::Header,
};

/// Authorization state after block `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Validator-set rotation period.
    pub epoch: u64,
    /// Block height the snapshot was taken at.
    pub number: u64,
    /// Block hash the snapshot was taken at.
    pub hash: B256,
    /// Authorized validators, ascending by byte-lex order.
    pub validators: BTreeSet<Address>,
    /// Recent signers, block number to signer, spanning the anti-double-sign
    /// window of `len(validators) / 2 + 1` blocks.
    pub recents: BTreeMap<u64, Address>,
}

impl Snapshot {
    /// Create a snapshot from a trusted validator list. Does not populate
    /// the recent signers ring, so only use it for genesis or checkpoint
    /// headers.
    pub fn new(epoch: u64, number: u64, hash: B256, validators: Vec<Address>) -> Self {
        Self {
            epoch,
            number,
            hash,
            validators: validators.into_iter().collect(),
            recents: BTreeMap::new(),
        }
    }

    /// The validator list in ascending order.
    pub fn validators_list(&self) -> Vec<Address> {
        self.validators.iter().copied().collect()
    }

    /// Position of a validator in the ascending list.
    pub fn index_of(&self, validator: Address) -> Option<usize> {
        self.validators.iter().position(|v| *v == validator)
    }

    pub fn is_validator(&self, validator: Address) -> bool {
        self.validators.contains(&validator)
    }

    /// The anti-double-sign window size.
    pub fn recents_window(&self) -> u64 {
        self.validators.len() as u64 / 2 + 1
    }

    /// Whether the validator owes the turn for block `number + 1`.
    pub fn inturn(&self, validator: Address) -> bool {
        match self.index_of(validator) {
            Some(index) => (self.number + 1) % self.validators.len() as u64 == index as u64,
            None => false,
        }
    }

    /// The validator whose turn it is at block `number + 1`.
    pub fn suppose_validator(&self) -> Address {
        let validators = self.validators_list();
        validators[((self.number + 1) % validators.len() as u64) as usize]
    }

    /// Whether the validator appears in the recent signers ring.
    pub fn sign_recently(&self, validator: Address) -> bool {
        self.recents.values().any(|signer| *signer == validator)
    }

    /// Advance the snapshot over a contiguous run of headers.
    ///
    /// `recover` resolves the sealing validator of each header; injected so
    /// the engine's signature cache backs every recovery.
    pub fn apply<F>(&self, headers: &[Header], recover: F) -> Result<Snapshot, RotaError>
    where
        F: Fn(&Header) -> Result<Address, RotaError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // The run must be contiguous and hash-linked onto this snapshot.
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(RotaError::OutOfRangeChain);
            }
            if pair[1].parent_hash != pair[0].hash() {
                return Err(RotaError::BlockHashInconsistent);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(RotaError::OutOfRangeChain);
        }
        if headers[0].parent_hash != self.hash {
            return Err(RotaError::BlockHashInconsistent);
        }

        let mut snap = self.clone();

        for header in headers {
            let number = header.number;

            // Let the oldest recent signer sign again.
            let limit = snap.recents_window();
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            let signer = recover(header)?;
            if !snap.validators.contains(&signer) {
                return Err(RotaError::UnauthorizedValidator { validator: signer });
            }
            if let Some((&recent_block, _)) =
                snap.recents.iter().find(|(_, recent)| **recent == signer)
            {
                return Err(RotaError::RecentlySigned { signer, recent_block });
            }
            snap.recents.insert(number, signer);

            // Epoch boundary: the header embeds the next validator set. It
            // takes effect for number + 1, and the recents ring is rebuilt
            // around the new window size.
            if number % snap.epoch == 0 {
                let new_validators = header.epoch_validators()?;
                let new_window = new_validators.len() as u64 / 2 + 1;
                snap.recents.retain(|&seen, _| seen + new_window > number);
                snap.validators = new_validators.into_iter().collect();
            }
        }

        let last = headers.last().expect("headers checked non-empty");
        snap.number = last.number;
        snap.hash = last.hash();

        Ok(snap)
    }

    /// Load a snapshot from the key-value store.
    pub fn load<S: SnapshotStore + ?Sized>(
        store: &S,
        hash: B256,
    ) -> Result<Option<Snapshot>, RotaError> {
        let Some(blob) = store.get(&snapshot_key(hash))? else {
            return Ok(None);
        };
        let snap: Snapshot = serde_json::from_slice(&blob)
            .map_err(|e| RotaError::Store { message: e.to_string() })?;
        Ok(Some(snap))
    }

    /// Persist the snapshot into the key-value store.
    pub fn store<S: SnapshotStore + ?Sized>(&self, store: &S) -> Result<(), RotaError> {
        let blob = serde_json::to_vec(self)
            .map_err(|e| RotaError::Store { message: e.to_string() })?;
        store.put(&snapshot_key(self.hash), blob)
    }
}

fn snapshot_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_PREFIX.len() + 32);
    key.extend_from_slice(SNAPSHOT_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemorySnapshotStore, EXTRA_SEAL, EXTRA_VANITY};
    use alloy_primitives::Bytes;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn plain_extra() -> Bytes {
        Bytes::from(vec![0u8; EXTRA_VANITY + EXTRA_SEAL])
    }

    fn epoch_extra(validators: &[Address]) -> Bytes {
        let mut extra = vec![0u8; EXTRA_VANITY];
        for validator in validators {
            extra.extend_from_slice(validator.as_slice());
        }
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        Bytes::from(extra)
    }

    /// A hash-linked run of headers on top of `snap`, signed (by coinbase
    /// convention) by the given validators in order.
    fn chain_on(snap: &Snapshot, signers: &[Address]) -> Vec<Header> {
        let mut headers = Vec::new();
        let mut parent_hash = snap.hash;
        for (i, signer) in signers.iter().enumerate() {
            let header = Header {
                parent_hash,
                coinbase: *signer,
                number: snap.number + 1 + i as u64,
                extra: plain_extra(),
                ..Default::default()
            };
            parent_hash = header.hash();
            headers.push(header);
        }
        headers
    }

    fn by_coinbase(header: &Header) -> Result<Address, RotaError> {
        Ok(header.coinbase)
    }

    #[test]
    fn validators_are_byte_lex_ascending() {
        let snap = Snapshot::new(100, 0, B256::ZERO, vec![addr(0x33), addr(0x11), addr(0x22)]);
        assert_eq!(snap.validators_list(), vec![addr(0x11), addr(0x22), addr(0x33)]);
        assert_eq!(snap.index_of(addr(0x22)), Some(1));
        assert_eq!(snap.index_of(addr(0x44)), None);
    }

    #[test]
    fn inturn_rotates_with_height() {
        let validators = vec![addr(0x11), addr(0x22), addr(0x33)];
        let mut snap = Snapshot::new(100, 0, B256::ZERO, validators.clone());

        // Snapshot at 0 authorizes block 1: index 1 is in turn.
        assert!(snap.inturn(validators[1]));
        assert_eq!(snap.suppose_validator(), validators[1]);

        snap.number = 2;
        assert!(snap.inturn(validators[0]));
        assert_eq!(snap.suppose_validator(), validators[0]);

        assert!(!snap.inturn(addr(0x44)));
    }

    #[test]
    fn apply_rejects_non_contiguous_runs() {
        let snap = Snapshot::new(100, 5, B256::ZERO, vec![addr(0x11), addr(0x22)]);

        let mut headers = chain_on(&snap, &[addr(0x11)]);
        headers[0].number = 7;
        assert_eq!(snap.apply(&headers, by_coinbase), Err(RotaError::OutOfRangeChain));

        let mut headers = chain_on(&snap, &[addr(0x11)]);
        headers[0].parent_hash = B256::repeat_byte(0xde);
        assert_eq!(snap.apply(&headers, by_coinbase), Err(RotaError::BlockHashInconsistent));
    }

    #[test]
    fn apply_rejects_unauthorized_signer() {
        let snap = Snapshot::new(100, 0, B256::ZERO, vec![addr(0x11), addr(0x22)]);
        let headers = chain_on(&snap, &[addr(0x99)]);
        assert_eq!(
            snap.apply(&headers, by_coinbase),
            Err(RotaError::UnauthorizedValidator { validator: addr(0x99) })
        );
    }

    #[test]
    fn apply_rejects_recently_signed() {
        // recents = {5: A}; a block at 6 signed by A again must fail.
        let mut snap = Snapshot::new(100, 5, B256::ZERO, vec![addr(0x11), addr(0x22), addr(0x33)]);
        snap.recents.insert(5, addr(0x11));

        let headers = chain_on(&snap, &[addr(0x11)]);
        assert_eq!(
            snap.apply(&headers, by_coinbase),
            Err(RotaError::RecentlySigned { signer: addr(0x11), recent_block: 5 })
        );
    }

    #[test]
    fn apply_evicts_the_oldest_recent_signer() {
        let a = addr(0x11);
        let b = addr(0x22);
        let snap = Snapshot::new(100, 0, B256::ZERO, vec![a, b, addr(0x33)]);

        // Window is 2: A may sign again at height 3.
        let headers = chain_on(&snap, &[a, b, a]);
        let snap = snap.apply(&headers, by_coinbase).unwrap();

        assert_eq!(snap.number, 3);
        assert_eq!(snap.recents.get(&2), Some(&b));
        assert_eq!(snap.recents.get(&3), Some(&a));
        assert!(!snap.recents.contains_key(&1));
    }

    #[test]
    fn apply_replaces_validators_at_epoch_boundary() {
        let a = addr(0x11);
        let b = addr(0x22);
        let c = addr(0x33);
        let d = addr(0x44);
        let e = addr(0x55);

        let mut snap = Snapshot::new(4, 3, B256::ZERO, vec![a, b, c]);
        snap.recents.insert(2, b);
        snap.recents.insert(3, c);

        let mut headers = chain_on(&snap, &[a]);
        headers[0].extra = epoch_extra(&[a, d, e]);

        let snap = snap.apply(&headers, by_coinbase).unwrap();

        assert_eq!(snap.validators_list(), vec![a, d, e]);
        // New window is 2: only entries in (2, 4] survive.
        assert!(!snap.recents.contains_key(&2));
        assert_eq!(snap.recents.get(&3), Some(&c));
        assert_eq!(snap.recents.get(&4), Some(&a));
    }

    #[test]
    fn apply_in_stages_matches_full_replay() {
        let a = addr(0x11);
        let b = addr(0x22);
        let c = addr(0x33);
        let genesis = Snapshot::new(100, 0, B256::ZERO, vec![a, b, c]);

        let headers = chain_on(&genesis, &[b, c, a, b, c]);

        let staged = genesis
            .apply(&headers[..2], by_coinbase)
            .unwrap()
            .apply(&headers[2..], by_coinbase)
            .unwrap();
        let replayed = genesis.apply(&headers, by_coinbase).unwrap();

        assert_eq!(staged, replayed);
    }

    #[test]
    fn store_load_round_trip() {
        let store = MemorySnapshotStore::new();
        let mut snap =
            Snapshot::new(200, 1024, B256::repeat_byte(0xaa), vec![addr(0x11), addr(0x22)]);
        snap.recents.insert(1023, addr(0x11));
        snap.recents.insert(1024, addr(0x22));

        snap.store(&store).unwrap();

        let loaded = Snapshot::load(&store, snap.hash).unwrap().unwrap();
        assert_eq!(loaded, snap);

        assert!(Snapshot::load(&store, B256::ZERO).unwrap().is_none());
    }
}
