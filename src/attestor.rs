//! Light-client header attestation precompile.
//!
//! Cross-chain light clients call this contract to obtain a canonical
//! 288-byte encoding of a local header at a requested height. Gas is a flat
//! protocol constant and the entry point never panics.

use alloy_primitives::B256;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::{error::RotaError, traits::ChainHeaderReader, types::Header};

/// Flat gas charged for one attestation.
pub const HEADER_ATTEST_GAS: u64 = 3_000;

/// Metadata prefix ahead of the payload; its trailing 8 bytes carry the
/// payload length.
const METADATA_LENGTH: usize = 64;
const U64_LENGTH: usize = 8;
/// `{height: u64 padded to 32 bytes, hash: 32 bytes}`.
const PAYLOAD_LENGTH: usize = 64;
/// Nine 32-byte fields.
const OUTPUT_LENGTH: usize = 288;

/// Decoded attestation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationRequest {
    pub height: u64,
    pub hash: B256,
}

/// The precompile body.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAttestor;

impl HeaderAttestor {
    /// Gas cost; independent of the input.
    pub fn required_gas(_input: &[u8]) -> u64 {
        HEADER_ATTEST_GAS
    }

    /// Run the precompile. Panics from any depth are converted into a
    /// generic internal error instead of unwinding into the VM.
    pub fn run<C: ChainHeaderReader + ?Sized>(
        input: &[u8],
        chain: &C,
    ) -> Result<Vec<u8>, RotaError> {
        catch_unwind(AssertUnwindSafe(|| Self::attest(input, chain))).unwrap_or_else(|_| {
            Err(RotaError::Internal { message: "header attestation panicked".into() })
        })
    }

    fn attest<C: ChainHeaderReader + ?Sized>(
        input: &[u8],
        chain: &C,
    ) -> Result<Vec<u8>, RotaError> {
        let request = Self::decode_input(input)?;
        let header = chain
            .get_header_by_number(request.height)
            .ok_or(RotaError::UnknownBlock)?;
        Ok(Self::encode_header(&header))
    }

    /// Validate the metadata prefix and decode the 64-byte payload.
    pub fn decode_input(input: &[u8]) -> Result<AttestationRequest, RotaError> {
        if input.len() <= METADATA_LENGTH {
            return Err(RotaError::InvalidAttestationInput { message: "invalid input".into() });
        }
        let mut length_bytes = [0u8; U64_LENGTH];
        length_bytes.copy_from_slice(&input[METADATA_LENGTH - U64_LENGTH..METADATA_LENGTH]);
        let payload_length = u64::from_be_bytes(length_bytes);
        if payload_length != (input.len() - METADATA_LENGTH) as u64 {
            return Err(RotaError::InvalidAttestationInput {
                message: format!(
                    "input size should be {}, actual size is {}",
                    METADATA_LENGTH as u64 + payload_length,
                    input.len()
                ),
            });
        }

        let payload = &input[METADATA_LENGTH..];
        if payload.len() != PAYLOAD_LENGTH {
            return Err(RotaError::InvalidAttestationInput {
                message: format!("payload size should be {PAYLOAD_LENGTH}, actual size is {}", payload.len()),
            });
        }

        let mut height_bytes = [0u8; U64_LENGTH];
        height_bytes.copy_from_slice(&payload[32 - U64_LENGTH..32]);
        Ok(AttestationRequest {
            height: u64::from_be_bytes(height_bytes),
            hash: B256::from_slice(&payload[32..64]),
        })
    }

    /// The canonical 288-byte encoding.
    ///
    /// Addresses sit right-aligned in their 32-byte field; the u64 scalars
    /// occupy the leading 8 bytes of theirs, as cross-chain clients already
    /// parse them. Difficulty and number truncate to 64 bits.
    pub fn encode_header(header: &Header) -> Vec<u8> {
        let mut result = vec![0u8; OUTPUT_LENGTH];
        result[0..32].copy_from_slice(header.parent_hash.as_slice());
        result[32..64].copy_from_slice(header.uncle_hash.as_slice());
        result[76..96].copy_from_slice(header.coinbase.as_slice());
        result[96..104].copy_from_slice(&header.difficulty.to_be_bytes());
        result[128..136].copy_from_slice(&header.number.to_be_bytes());
        result[160..168].copy_from_slice(&header.gas_limit.to_be_bytes());
        result[192..200].copy_from_slice(&header.gas_used.to_be_bytes());
        result[224..232].copy_from_slice(&header.timestamp.to_be_bytes());
        result[256..264].copy_from_slice(header.nonce.as_slice());
        result
    }
}
