// SPDX-License-Identifier: AGPL-3.0

use lazy_static::lazy_static;
use num_bigint::BigUint;

/// EVM word width in bits.
pub const WORD_BITS: u32 = 256;

/// EVM word width in bytes.
pub const WORD_SIZE: usize = 32;

/// Maximum EVM stack depth.
pub const MAX_STACK: usize = 1024;

/// Logical calldata size for symbolic test runs.
pub const CALLDATA_SIZE: usize = 10_000;

/// Cap on concrete memory growth (1 MiB).
pub const MAX_MEMORY_SIZE: usize = 1 << 20;

/// Panic(uint256) selector - bytes4(keccak256("Panic(uint256)"))
pub const PANIC_SELECTOR: [u8; 4] = [0x4E, 0x48, 0x7B, 0x71];

lazy_static! {
    /// The full 36-byte revert payload of `assert(false)`:
    /// Panic(uint256) selector followed by code 0x01.
    pub static ref PANIC_ASSERT: Vec<u8> = {
        let mut payload = PANIC_SELECTOR.to_vec();
        payload.extend_from_slice(&[0u8; 31]);
        payload.push(0x01);
        payload
    };

    /// 2^256, the word modulus.
    pub static ref WORD_MODULUS: BigUint = BigUint::from(1u8) << 256;
}

/// Empty Keccak-256 hash (keccak256(""))
pub const EMPTY_KECCAK: [u8; 32] = [
    0xC5, 0xD2, 0x46, 0x01, 0x86, 0xF7, 0x23, 0x3C, 0x92, 0x7E, 0x7D, 0xB2, 0xDC, 0xC7, 0x03, 0xC0,
    0xE5, 0x00, 0xB6, 0x53, 0xCA, 0x82, 0x27, 0x3B, 0x7B, 0xFA, 0xD8, 0x04, 0x5D, 0x85, 0xA4, 0x70,
];

/// The hevm cheatcode address used by DSTest/forge-std.
pub const HEVM_ADDRESS: [u8; 20] = [
    0x71, 0x09, 0x70, 0x9E, 0xCf, 0xa9, 0x1a, 0x80, 0x62, 0x6f, 0xF3, 0x98, 0x9D, 0x68, 0xf6,
    0x7F, 0x5b, 0x1D, 0xD1, 0x2D,
];

/// Selector of the hevm `store(address,bytes32,bytes32)` cheatcode.
pub const HEVM_STORE_SELECTOR: [u8; 4] = [0x70, 0xca, 0x10, 0xbb];

/// bytes32("failed") - the slot DSTest's fail() writes through hevm.store.
pub const DSTEST_FAILED_SLOT: [u8; 32] = [
    b'f', b'a', b'i', b'l', b'e', b'd', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0,
];

/// Default loop unrolling bound.
pub const DEFAULT_LOOP_BOUND: usize = 2;

/// Default branching-query timeout in milliseconds.
pub const DEFAULT_TIMEOUT_BRANCHING_MS: u32 = 1_000;

/// Default assertion-query timeout in milliseconds.
pub const DEFAULT_TIMEOUT_ASSERTION_MS: u32 = 60_000;

/// Default bound N for unrolling EXP with a concrete exponent <= N.
pub const DEFAULT_EXP_BY_CONST: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload() {
        assert_eq!(PANIC_ASSERT.len(), 36);
        assert_eq!(&PANIC_ASSERT[0..4], &PANIC_SELECTOR);
        assert_eq!(PANIC_ASSERT[35], 0x01);
        assert!(PANIC_ASSERT[4..35].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_word_modulus() {
        assert_eq!(WORD_MODULUS.bits(), 257);
    }

    #[test]
    fn test_failed_slot() {
        assert_eq!(&DSTEST_FAILED_SLOT[0..6], b"failed");
        assert!(DSTEST_FAILED_SLOT[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hevm_address() {
        // 0x7109709ECfa91a80626fF3989D68f67F5b1DD12D
        assert_eq!(HEVM_ADDRESS[0], 0x71);
        assert_eq!(HEVM_ADDRESS[19], 0x2D);
    }
}
