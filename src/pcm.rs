//! Standalone PCM slot playback: forward and alternating ("ping-pong") looping, 8-bit and packed
//! 12-bit sample formats, and the two mixing paths (plain attenuated sum, or the 18-bit
//! saturating accumulator used when `accon` is set).

use crate::rom::Rom;
use crate::slot::Slot;
use crate::tables::Tables;

const ACC_18BIT_MIN: i32 = -131072;
const ACC_18BIT_MAX: i32 = 131071;
const ACC_TL_SCALE: i32 = 2;

fn sat18(value: i32) -> i32 {
    value.clamp(ACC_18BIT_MIN, ACC_18BIT_MAX)
}

/// Advance the slot's loop state for one sample. Returns `true` the sample the forward loop
/// wraps (the caller raises the slot's end-status flag on that edge).
fn advance_loop(slot: &mut Slot) -> bool {
    let end16 = (slot.endaddr as u64) << 16;
    let loop16 = (slot.loopaddr as u64) << 16;

    if slot.loop_direction > 0 {
        if (slot.stepptr >> 16) as u32 <= slot.endaddr {
            return false;
        }

        if slot.altloop {
            slot.loop_direction = -1;
            slot.stepptr = end16;
        } else {
            slot.stepptr = slot.stepptr.saturating_sub(end16).saturating_add(loop16);
            if (slot.stepptr >> 16) as u32 > slot.endaddr {
                slot.stepptr = loop16;
                if (slot.stepptr >> 16) as u32 > slot.endaddr {
                    slot.stepptr = end16;
                }
            }
        }
        true
    } else {
        if (slot.stepptr >> 16) as u32 >= slot.loopaddr {
            return false;
        }
        slot.loop_direction = 1;
        slot.stepptr = loop16;
        false
    }
}

fn fetch_sample(slot: &Slot, rom: &Rom) -> i32 {
    let i = (slot.stepptr >> 16) as u32;

    if slot.bits == 12 {
        let base = slot.startaddr + (i / 2) * 3;
        if i % 2 == 0 {
            let hi = rom.read(base) as u16;
            let lo = rom.read(base + 1) as u16 & 0xf0;
            (((hi << 8) | lo) as i16) as i32
        } else {
            let hi = rom.read(base + 2) as u16;
            let lo = (rom.read(base + 1) as u16 & 0x0f) << 4;
            (((hi << 8) | lo) as i16) as i32
        }
    } else {
        let byte = rom.read(slot.startaddr + i) as u16;
        ((byte << 8) as i16) as i32
    }
}

/// Render `len` samples of a PCM slot into the interleaved 4-channel `mix`/`acc` buffers,
/// returning whether the slot's end-status flag should be raised (the forward loop wrapped at
/// least once during this chunk).
pub fn update_pcm(
    tables: &Tables,
    slot: &mut Slot,
    rom: &Rom,
    mix: &mut [i32],
    acc: &mut [i32],
    len: usize,
) -> bool {
    let mut wrapped = false;

    for i in 0..len {
        if advance_loop(slot) {
            wrapped = true;
        }

        let sample = fetch_sample(slot, rom);

        let ended = slot.envelope.update();
        if ended {
            slot.active = false;
        }
        slot.lfo.update(tables, slot.lfowave, slot.pms);

        if slot.accon {
            let accumulation_factor = if slot.tl == 0 { ACC_TL_SCALE } else { slot.tl as i32 * ACC_TL_SCALE };
            let output = sat18(sample * accumulation_factor) >> 2;

            for (ch, level) in [slot.levels.ch0, slot.levels.ch1, slot.levels.ch2, slot.levels.ch3]
                .into_iter()
                .enumerate()
            {
                let attn = tables.attenuation[level as usize & 0xf];
                let idx = i * 4 + ch;
                acc[idx] = sat18(acc[idx] + (((output as i64 * attn as i64) >> 16) as i32));
            }
        } else {
            let final_volume = slot.slot_volume(tables);

            for (ch, level) in [slot.levels.ch0, slot.levels.ch1, slot.levels.ch2, slot.levels.ch3]
                .into_iter()
                .enumerate()
            {
                let attn = tables.attenuation[level as usize & 0xf];
                let ch_vol = (((final_volume as i64 * attn as i64) >> 16) as i32).min(65536);
                let idx = i * 4 + ch;
                mix[idx] += ((sample as i64 * ch_vol as i64) >> 16) as i32;
            }
        }

        let delta = slot.step as i64 * slot.loop_direction as i64;
        slot.stepptr = (slot.stepptr as i64).wrapping_add(delta) as u64;
    }

    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::STD_CLOCK;
    use proptest::prelude::any;
    use proptest::prelude::*;

    fn slot_8bit(bytes: &[u8], endaddr: u32) -> (Slot, Rom) {
        let mut rom = Rom::empty();
        rom.alloc(bytes.len() as u32);
        rom.write(0, bytes);

        let mut slot = Slot::new();
        slot.waveform = 7;
        slot.bits = 8;
        slot.startaddr = 0;
        slot.loopaddr = 0;
        slot.endaddr = endaddr;
        slot.tl = 0;
        slot.ar = 31;
        (slot, rom)
    }

    #[test]
    fn pcm_loop_wraps_to_loopaddr() {
        let tables = Tables::new(STD_CLOCK);
        let (mut slot, rom) = slot_8bit(&[1, 2, 3, 4], 3);
        slot.key_on(&tables);
        slot.step = 1 << 16;

        let mut mix = vec![0i32; 4 * 4];
        let mut acc = vec![0i32; 4 * 4];
        let wrapped = update_pcm(&tables, &mut slot, &rom, &mut mix, &mut acc, 4);
        assert!(wrapped);
    }

    #[test]
    fn accon_path_saturates_to_eighteen_bits() {
        let tables = Tables::new(STD_CLOCK);
        let (mut slot, rom) = slot_8bit(&[0x7f], 0);
        slot.accon = true;
        slot.tl = 32;
        slot.levels.ch0 = 0; // 0 dB attenuation entry
        slot.key_on(&tables);
        slot.step = 0;

        let mut mix = vec![0i32; 4];
        let mut acc = vec![0i32; 4];
        update_pcm(&tables, &mut slot, &rom, &mut mix, &mut acc, 1);
        assert!(acc[0].abs() <= ACC_18BIT_MAX);
    }

    #[test]
    fn altloop_reverses_direction_at_endaddr() {
        let tables = Tables::new(STD_CLOCK);
        let (mut slot, rom) = slot_8bit(&[1, 2, 3, 4, 5], 4);
        slot.altloop = true;
        slot.key_on(&tables);
        slot.step = 1 << 16;
        slot.stepptr = 4u64 << 16;

        let mut mix = vec![0i32; 4];
        let mut acc = vec![0i32; 4];
        update_pcm(&tables, &mut slot, &rom, &mut mix, &mut acc, 1);
        assert_eq!(slot.loop_direction, -1);
    }

    proptest::proptest! {
        #[test]
        fn accon_output_never_exceeds_eighteen_bits(byte in any::<u8>(), tl in 0u8..128, level in 0u8..16) {
            let tables = Tables::new(STD_CLOCK);
            let (mut slot, rom) = slot_8bit(&[byte], 0);
            slot.accon = true;
            slot.tl = tl;
            slot.levels.ch0 = level;
            slot.levels.ch1 = level;
            slot.levels.ch2 = level;
            slot.levels.ch3 = level;
            slot.key_on(&tables);
            slot.step = 0;

            let mut mix = vec![0i32; 4];
            let mut acc = vec![0i32; 4];
            update_pcm(&tables, &mut slot, &rom, &mut mix, &mut acc, 1);

            for &value in &acc {
                prop_assert!(value.abs() <= ACC_18BIT_MAX);
            }
        }
    }
}
