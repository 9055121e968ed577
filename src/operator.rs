//! The per-sample FM operator kernel: advances a slot's envelope/LFO/phase, reads a wavetable
//! (or, in PFM mode, PCM ROM) sample, and applies envelope attenuation.

use crate::rom::Rom;
use crate::slot::{Slot, OP_INPUT_FEEDBACK, OP_INPUT_NONE};
use crate::tables::Tables;

const SIN_MASK: u64 = 1023;

/// Compute one FM operator sample from an internal wavetable.
///
/// `input` is either [`OP_INPUT_FEEDBACK`] (self-modulation from the slot's own last two
/// outputs), [`OP_INPUT_NONE`] (no modulation), or another role's freshly computed output.
pub fn calculate_op(tables: &Tables, slot: &mut Slot, input: i32) -> i32 {
    slot.advance_modulators(tables);
    let env = slot.slot_volume(tables);

    let slot_input = modulation_input(slot, input);
    let phase = (slot.stepptr as i64).wrapping_add(slot_input as i64) as u64;
    let index = ((phase >> 16) & SIN_MASK) as usize;

    let sample = tables.waves[slot.waveform as usize & 7][index] as i32;
    let output = ((sample as i64 * env as i64) >> 16) as i32;

    slot.stepptr = slot.stepptr.wrapping_add(slot.step as u64);

    output
}

/// PFM variant: the carrier's wavetable lookup is replaced by a PCM fetch from ROM, honoring the
/// slot's own loop address the same way [`crate::pcm::update_pcm`] does.
pub fn calculate_op_pfm(tables: &Tables, slot: &mut Slot, rom: &Rom, input: i32) -> i32 {
    slot.advance_modulators(tables);
    let env = slot.slot_volume(tables);

    let slot_input = modulation_input(slot, input);
    let modulated = ((slot.stepptr as i64) + slot_input as i64).max(0) as u64;
    let raw_offset = (modulated >> 16) as u32;

    let sample_offset = pfm_sample_offset(slot.startaddr, slot.loopaddr, slot.endaddr, raw_offset);
    let sample = fetch_pfm_sample(slot, rom, sample_offset);
    let output = ((sample as i64 * env as i64) >> 16) as i32;

    slot.stepptr = slot.stepptr.wrapping_add(slot.step as u64);

    output
}

/// Resolve a raw (unwrapped) sample offset past `startaddr` against a PFM slot's loop region.
/// `startaddr`/`loopaddr`/`endaddr` are absolute addresses; once `raw_offset` runs past
/// `sample_length = endaddr - startaddr`, it wraps into `[loopaddr - startaddr, endaddr -
/// startaddr)`, i.e. relative to `loopaddr`, not re-added onto `startaddr` a second time.
fn pfm_sample_offset(startaddr: u32, loopaddr: u32, endaddr: u32, raw_offset: u32) -> u32 {
    let sample_length = endaddr.saturating_sub(startaddr);
    if raw_offset <= sample_length {
        return raw_offset;
    }

    if loopaddr <= endaddr {
        let loop_length = endaddr.saturating_sub(loopaddr);
        if loop_length > 0 {
            (loopaddr - startaddr) + (raw_offset - sample_length) % loop_length
        } else {
            sample_length
        }
    } else {
        sample_length
    }
}

/// Fetch one PCM sample at `sample_offset` samples past `slot.startaddr`, in whichever of the
/// two on-ROM formats the slot is configured for. Mirrors [`crate::pcm::update_pcm`]'s fetch so
/// the PFM carrier path and standalone PCM playback never disagree on byte layout.
fn fetch_pfm_sample(slot: &Slot, rom: &Rom, sample_offset: u32) -> i32 {
    if slot.bits == 12 {
        let base = slot.startaddr + (sample_offset / 2) * 3;
        if sample_offset % 2 == 0 {
            let hi = rom.read(base) as u16;
            let lo = rom.read(base + 1) as u16 & 0xf0;
            (((hi << 8) | lo) as i16) as i32
        } else {
            let hi = rom.read(base + 2) as u16;
            let lo = (rom.read(base + 1) as u16 & 0x0f) << 4;
            (((hi << 8) | lo) as i16) as i32
        }
    } else {
        let byte = rom.read(slot.startaddr + sample_offset) as u16;
        ((byte << 8) as i16) as i32
    }
}

fn modulation_input(slot: &mut Slot, input: i32) -> i32 {
    if input == OP_INPUT_FEEDBACK {
        slot.feedback_input()
    } else if input != OP_INPUT_NONE {
        slot.modulation_input(input)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::STD_CLOCK;

    #[test]
    fn silent_slot_produces_zero_output() {
        let tables = Tables::new(STD_CLOCK);
        let mut slot = Slot::new();
        slot.waveform = 6; // constant full-scale wave
        // volume starts attenuated to -60dB worth of headroom but never key-on'd, so env stays
        // at the default release-state volume (255<<16 == full attenuation == silent)
        let out = calculate_op(&tables, &mut slot, OP_INPUT_NONE);
        assert_eq!(out, 0);
    }

    #[test]
    fn feedback_path_consumes_latched_value() {
        let tables = Tables::new(STD_CLOCK);
        let mut slot = Slot::new();
        slot.key_on(&tables);
        slot.set_feedback(1000);
        let _ = calculate_op(&tables, &mut slot, OP_INPUT_FEEDBACK);
        // Second call consumes the rolled-forward feedback memory without panicking or
        // depending on external state.
        let _ = calculate_op(&tables, &mut slot, OP_INPUT_FEEDBACK);
    }

    #[test]
    fn phase_step_advances_monotonically_without_modulation() {
        let tables = Tables::new(STD_CLOCK);
        let mut slot = Slot::new();
        slot.key_on(&tables);
        let before = slot.stepptr;
        let _ = calculate_op(&tables, &mut slot, OP_INPUT_NONE);
        assert!(slot.stepptr >= before);
    }

    #[test]
    fn pfm_offset_passes_through_unchanged_before_endaddr() {
        assert_eq!(pfm_sample_offset(0, 2, 5, 3), 3);
    }

    #[test]
    fn pfm_offset_wraps_into_the_loop_region_relative_to_loopaddr_not_startaddr() {
        // startaddr=10, loopaddr=12, endaddr=15 -> sample_length=5, loop_length=3.
        // raw_offset=7 is 2 past sample_length, so it should land on
        // (loopaddr - startaddr) + (7 - 5) % 3 = 2 + 2 = 4, not 12 + (7-15)%5 (double-counted
        // startaddr) and not modulo sample_length either.
        assert_eq!(pfm_sample_offset(10, 12, 15, 7), 4);
    }

    #[test]
    fn pfm_offset_clamps_to_sample_length_when_loop_length_is_zero() {
        // loopaddr == endaddr: no room to loop, clamp to sample_length.
        assert_eq!(pfm_sample_offset(0, 5, 5, 9), 5);
    }

    #[test]
    fn pfm_offset_clamps_to_sample_length_when_loopaddr_exceeds_endaddr() {
        assert_eq!(pfm_sample_offset(0, 9, 4, 6), 4);
    }
}
