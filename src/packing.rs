//! Two 128-bit quantities packed big-endian into one 32-byte slot, as used by the
//! v0.7 EntryPoint for `accountGasLimits` and `gasFees`.

use crate::error::{Result, UserOpError};
use ethers::types::U256;

pub fn pack_u128_pair(high: u128, low: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&high.to_be_bytes());
    out[16..].copy_from_slice(&low.to_be_bytes());
    out
}

pub fn unpack_pair(packed: &[u8; 32]) -> (u128, u128) {
    let mut high = [0u8; 16];
    let mut low = [0u8; 16];
    high.copy_from_slice(&packed[..16]);
    low.copy_from_slice(&packed[16..]);
    (u128::from_be_bytes(high), u128::from_be_bytes(low))
}

/// Checked narrowing; values wider than 128 bits are rejected, never truncated.
pub fn to_u128(field: &'static str, value: U256) -> Result<u128> {
    if value.bits() > 128 {
        return Err(UserOpError::ValueOverflow { field, value });
    }
    Ok(value.low_u128())
}

pub fn pack_pair(
    (high_field, high): (&'static str, U256),
    (low_field, low): (&'static str, U256),
) -> Result<[u8; 32]> {
    Ok(pack_u128_pair(
        to_u128(high_field, high)?,
        to_u128(low_field, low)?,
    ))
}
