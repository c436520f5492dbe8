//! Ambient RNG consulted by stochastic op implementations, with opaque
//! state capture for deterministic recomputation.
//!
//! Checkpoint marking may snapshot this generator's state as a byte blob;
//! `recompute_subgraph` restores the blob before re-running a forward
//! evaluator so stochastic ops reproduce identical outputs. The blob format
//! is private to this module; the checkpoint layer treats it as opaque.
//!
//! The generator is per-thread, matching the thread-scoped execution model
//! of the engines.

use anyhow::{bail, Result};
use std::cell::Cell;

const DEFAULT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

thread_local! {
    static STATE: Cell<u64> = const { Cell::new(DEFAULT_SEED) };
}

/// Reset this thread's generator to a fixed seed.
pub fn reseed(seed: u64) {
    STATE.with(|s| s.set(seed));
}

/// Next raw 64-bit draw (SplitMix64).
pub fn next_u64() -> u64 {
    STATE.with(|s| {
        let mut z = s.get().wrapping_add(0x9E37_79B9_7F4A_7C15);
        s.set(z);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    })
}

/// Next draw in `[0, 1)`.
pub fn next_f64() -> f64 {
    (next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Capture this thread's generator state as an opaque blob.
pub fn save_state() -> Vec<u8> {
    STATE.with(|s| s.get().to_le_bytes().to_vec())
}

/// Restore a previously captured state.
pub fn restore_state(blob: &[u8]) -> Result<()> {
    if blob.len() != 8 {
        bail!("invalid RNG state blob of {} bytes", blob.len());
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(blob);
    STATE.with(|s| s.set(u64::from_le_bytes(raw)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_replays_sequence() {
        reseed(7);
        let blob = save_state();
        let first: Vec<u64> = (0..4).map(|_| next_u64()).collect();

        restore_state(&blob).unwrap();
        let second: Vec<u64> = (0..4).map(|_| next_u64()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_next_f64_in_unit_interval() {
        reseed(11);
        for _ in 0..100 {
            let x = next_f64();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_restore_rejects_bad_blob() {
        assert!(restore_state(&[1, 2, 3]).is_err());
    }
}
