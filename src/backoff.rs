//! Out-of-turn sealing back-off.
//!
//! Every node must agree on the delay each validator owes for a given round,
//! while the delays themselves diverge per round so out-of-turn attempts do
//! not collide. Both properties come from a Fisher-Yates shuffle of the step
//! table seeded by the snapshot height.

use alloy_primitives::Address;
use tracing::trace;

use crate::{snapshot::Snapshot, INITIAL_BACK_OFF_TIME, WIGGLE_TIME};

/// Seconds an out-of-turn validator waits beyond `parent.time + period`
/// before its block becomes timely. Zero for the in-turn validator, and for
/// strangers (they fail authorization before timing matters).
pub fn back_off_time(snap: &Snapshot, validator: Address) -> u64 {
    if snap.inturn(validator) {
        return 0;
    }

    let Some(index) = snap.index_of(validator) else {
        trace!(target: "rota::backoff", %validator, "validator not authorized");
        return 0;
    };

    let mut steps: Vec<u64> = (0..snap.validators.len() as u64).collect();
    shuffle(&mut steps, snap.number);

    INITIAL_BACK_OFF_TIME + steps[index] * WIGGLE_TIME
}

/// Fisher-Yates over a splitmix64 stream seeded by the round number.
fn shuffle(steps: &mut [u64], seed: u64) {
    let mut state = seed;
    for i in (1..steps.len()).rev() {
        let j = (splitmix64(&mut state) % (i as u64 + 1)) as usize;
        steps.swap(i, j);
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn snap_at(number: u64, validators: Vec<Address>) -> Snapshot {
        Snapshot::new(30_000, number, B256::ZERO, validators)
    }

    #[test]
    fn zero_iff_in_turn() {
        let validators: Vec<Address> = (1..=5).map(Address::repeat_byte).collect();
        for number in 0..20 {
            let snap = snap_at(number, validators.clone());
            for validator in &validators {
                let delay = back_off_time(&snap, *validator);
                if snap.inturn(*validator) {
                    assert_eq!(delay, 0);
                } else {
                    assert!(delay >= INITIAL_BACK_OFF_TIME);
                }
            }
        }
    }

    #[test]
    fn deterministic_per_round() {
        let validators: Vec<Address> = (1..=7).map(Address::repeat_byte).collect();
        let snap = snap_at(41, validators.clone());
        for validator in &validators {
            assert_eq!(back_off_time(&snap, *validator), back_off_time(&snap, *validator));
        }
    }

    #[test]
    fn out_of_turn_delays_are_distinct() {
        let validators: Vec<Address> = (1..=7).map(Address::repeat_byte).collect();
        let snap = snap_at(13, validators.clone());

        let mut delays: Vec<u64> = validators
            .iter()
            .filter(|v| !snap.inturn(**v))
            .map(|v| back_off_time(&snap, *v))
            .collect();
        delays.sort_unstable();
        delays.dedup();
        assert_eq!(delays.len(), validators.len() - 1);
    }

    #[test]
    fn unknown_validator_owes_nothing() {
        let snap = snap_at(9, vec![Address::repeat_byte(0x01)]);
        assert_eq!(back_off_time(&snap, Address::repeat_byte(0xee)), 0);
    }
}
