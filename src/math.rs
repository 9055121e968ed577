//! Keycode derivation and rate-scaling helpers shared by the envelope and phase-step
//! calculations.

/// Internal (FM) keycode for a given block/F-number pair.
///
/// `n43` selects which quarter of the octave `fns` falls into, using the same thresholds as the
/// datasheet's internal keycode table.
pub fn internal_keycode(block: u8, fns: u16) -> usize {
    let n43 = if fns >= 0xA80 {
        3
    } else if fns >= 0x900 {
        2
    } else if fns >= 0x780 {
        1
    } else {
        0
    };

    ((block as usize & 7) * 4 + n43) & 0x1f
}

/// External (PCM) keycode, combining the PCM source's own block/note fields with the slot's
/// block/F-number.
pub fn external_keycode(block: u8, fns: u16, srcb: u8, srcnote: u8) -> usize {
    let n43 = if fns >= 0x500 {
        3
    } else if fns >= 0x300 {
        2
    } else if fns >= 0x100 {
        1
    } else {
        0
    };

    let src_keycode = (srcb as usize & 7) * 4 + (srcnote as usize & 3);
    let block_keycode = (block as usize & 7) * 4 + n43;

    (src_keycode + block_keycode).min(31)
}

/// Apply rate-key-scaling to a base envelope rate, clamped to the valid `0..=63` range.
pub fn keyscaled_rate(base_rate: i32, rks_offset: i32) -> u8 {
    (base_rate + rks_offset).clamp(0, 63) as u8
}
