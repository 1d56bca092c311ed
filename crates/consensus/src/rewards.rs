//! Block value schedule.
//!
//! The subsidy is banded by the difficulty of the parent block and by its height. Each
//! intermediate result is truncated to whole coins, matching the integer arithmetic the
//! chain was mined under.

use crate::money::{Amount, COIN};

/// Difficulty encoded by compact bits, relative to a 0x1d00ffff target.
pub fn difficulty_from_bits(bits: u32) -> f64 {
    let mut shift = (bits >> 24) & 0xff;
    let mut diff = f64::from(0x0000_ffffu32) / f64::from((bits & 0x00ff_ffff).max(1));
    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }
    diff
}

/// Maximum coinbase value for a block whose parent has `bits` at `height`, plus `fees`.
///
/// `legacy_mantissa_diff` reproduces the early mainnet rule where blocks at or below
/// height 100 measured difficulty from the mantissa alone.
pub fn block_value(bits: u32, height: i32, fees: Amount, legacy_mantissa_diff: bool) -> Amount {
    let diff = if height > 100 || !legacy_mantissa_diff {
        difficulty_from_bits(bits)
    } else {
        f64::from(0x0000_ffffu32) / f64::from((bits & 0x00ff_ffff).max(1))
    };
    let h = i64::from(height);

    let mut coins: i64;
    if (1..1000).contains(&height) {
        if height >= 101 && diff > 75.0 {
            coins = (diff * 0.4356) as i64;
            if coins == 25 {
                coins = 251 - h / 4;
            }
            if coins == 5 {
                coins = 250 - h / 4;
            }
        } else {
            coins = (diff * 0.4426) as i64;
            if coins == 500 {
                coins = 255 - h / 4;
            }
            if coins == 25 {
                coins = 250 - h / 4;
            }
            if height > 10 && height < 12 {
                coins = 3i64.pow(18);
            }
        }
    } else {
        coins = (diff * 0.4826) as i64;
    }

    if (1000..6000).contains(&height) {
        coins = (diff * 0.4726) as i64;
    }

    if height >= 6000 {
        coins = (2_222_222.0 / ((diff + 2600.0) / 9.0).powi(2)) as i64;
        if coins > 25 {
            coins = (diff * 0.4356) as i64;
        }
        if coins < 5 {
            coins = 1;
        }
    }

    if diff > 100.0 && height <= 1000 {
        coins = 100;
    }
    if diff > 100.0 && height > 1000 {
        coins = 50;
    }
    if diff < 0.5 && height > 15 {
        coins = 1;
    }

    coins.saturating_mul(COIN).saturating_add(fees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_one_at_reference_bits() {
        assert!((difficulty_from_bits(0x1d00_ffff) - 1.0).abs() < 1e-12);
        assert!((difficulty_from_bits(0x1c00_ffff) - 256.0).abs() < 1e-9);
    }

    #[test]
    fn low_difficulty_pays_one_coin_after_launch() {
        // 0x207fffff is far below difficulty 0.5.
        assert_eq!(block_value(0x207f_ffff, 500, 0, false), COIN);
        assert_eq!(block_value(0x207f_ffff, 500, 7, false), COIN + 7);
    }

    #[test]
    fn high_difficulty_caps_reward() {
        // Difficulty 256 lands in the override bands.
        assert_eq!(block_value(0x1c00_ffff, 900, 0, false), 100 * COIN);
        assert_eq!(block_value(0x1c00_ffff, 7000, 0, false), 50 * COIN);
    }

    #[test]
    fn mid_band_scales_with_difficulty() {
        // Roughly difficulty 64 at height 2000.
        let bits = 0x1d00_03ff;
        let diff = difficulty_from_bits(bits);
        let expected = (diff * 0.4726) as i64;
        assert_eq!(block_value(bits, 2000, 0, false), expected * COIN);
    }
}
