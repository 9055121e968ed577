//! A cycle-free emulation core for a Yamaha YMF271-class OPX sound chip: 48 four-operator-FM and
//! PCM-capable voice slots arranged into 12 groups, each independently configurable as one
//! four-operator FM voice, two two-operator FM voices, a three-operator FM voice layered with a
//! PCM channel, or four independent PCM channels.
//!
//! The twelve groups and their 48 underlying slots are addressed the same way the real chip's
//! register ports are: pair an address write with a data write, and the engine figures out which
//! slot(s) the write should land on, including the sync-group broadcast behavior documented on
//! [`Chip::write`].
//!
//! To get started, construct a [`Chip`] with a clock rate, configure some slots through
//! [`Chip::write`], and render:
//!
//! ```
//! # use opx271::Chip;
//! let mut chip = Chip::new(16_934_400.0)?;
//!
//! // Address FM register 0x4 (total level) of group 0, bank 0, then write it.
//! chip.write(0, 0x00);
//! chip.write(1, 0x00);
//!
//! let mut outputs = vec![[0i32; 4]; 1024];
//! chip.update(1024, &mut outputs);
//! # Ok::<(), opx271::Error>(())
//! ```

mod envelope;
mod error;
mod group;
mod lfo;
pub mod math;
mod operator;
mod pcm;
mod registers;
mod rom;
mod slot;
mod tables;
mod timer;

pub use envelope::{EnvState, Envelope};
pub use error::Error;
pub use group::Group;
pub use lfo::Lfo;
pub use rom::Rom;
pub use slot::Slot;
pub use tables::Tables;
pub use timer::Timer;

use registers::ControlWrite;

/// The YMF271-class tone generator: 48 slots, 12 groups, one PCM ROM bank, two timers.
///
/// Construct with [`Chip::new`], configure slots through [`Chip::write`], and render audio
/// through [`Chip::update`].
pub struct Chip {
    tables: Tables,
    slots: [Slot; 48],
    groups: [Group; 12],
    rom: Rom,

    timer_a: Timer,
    timer_a_raw: u16,
    timer_b: Timer,
    irq_enable_a: bool,
    irq_enable_b: bool,
    irq_state: u8,
    status: u8,
    end_flags: u16,

    mute_mask: u16,
    irq_callback: Option<Box<dyn FnMut(bool)>>,

    // Address-port latches: one per FM address port (0/2/4/6), plus PCM and control.
    fm_address: [u8; 4],
    pcm_address: u8,
    control_address: u8,

    ext_address: u32,

    /// `update` re-chunks arbitrarily large sample counts into blocks of at most this many
    /// frames (one tenth of a second at this chip's output sample rate), so scratch-buffer size
    /// never grows with the caller's request.
    chunk_frames: usize,
    mix_buffer: Vec<i32>,
    acc_buffer: Vec<i32>,
}

impl Chip {
    /// Construct a chip clocked at `clock` Hz. The chip's output sample rate is `clock / 384`.
    pub fn new(clock: f64) -> Result<Self, Error> {
        if clock <= 0.0 {
            return Err(Error::ClockRateTooLow);
        }

        let sample_rate = clock / 384.0;
        let chunk_frames = ((sample_rate / 10.0).round() as usize).max(1);

        Ok(Self {
            tables: Tables::new(clock),
            slots: std::array::from_fn(|_| Slot::new()),
            groups: std::array::from_fn(|_| Group::new()),
            rom: Rom::empty(),

            timer_a: Timer::new_a(),
            timer_a_raw: 0,
            timer_b: Timer::new_b(),
            irq_enable_a: false,
            irq_enable_b: false,
            irq_state: 0,
            status: 0,
            end_flags: 0,

            mute_mask: 0,
            irq_callback: None,

            fm_address: [0; 4],
            pcm_address: 0,
            control_address: 0,

            ext_address: 0,

            chunk_frames,
            mix_buffer: vec![0; chunk_frames * 4],
            acc_buffer: vec![0; chunk_frames * 4],
        })
    }

    /// Deactivate every slot and clear status/IRQ/end-flag state. Register contents (pitch,
    /// algorithm, ROM) are left untouched, matching the reference implementation's reset, which
    /// only silences voices rather than erasing programming.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
            slot.envelope = Envelope::new();
        }
        self.timer_a.reset();
        self.timer_b.reset();
        self.irq_enable_a = false;
        self.irq_enable_b = false;
        self.irq_state = 0;
        self.status = 0;
        self.end_flags = 0;
        self.set_irq(false);
    }

    /// Allocate (or reallocate) the PCM ROM bank, filling it with the unprogrammed-EPROM value.
    pub fn alloc_rom(&mut self, size: u32) {
        self.rom.alloc(size);
    }

    /// Copy `data` into the PCM ROM bank starting at `offset`, clamped to the allocated size.
    pub fn write_rom(&mut self, offset: u32, data: &[u8]) {
        self.rom.write(offset, data);
    }

    /// Silence groups whose bit is set in `mask` (bit `g` mutes group `g`). Muted groups still
    /// advance their envelopes and phase accumulators; only their contribution to the mix is
    /// dropped, matching a mixer-stage mute on real hardware.
    pub fn set_mute_mask(&mut self, mask: u16) {
        self.mute_mask = mask;
    }

    /// Install a callback invoked whenever the chip's IRQ line changes state.
    pub fn set_irq_callback(&mut self, cb: impl FnMut(bool) + 'static) {
        self.irq_callback = Some(Box::new(cb));
    }

    /// Register write. `port` follows the chip's address/data port pairing: address ports
    /// {0, 2, 4, 6, 8, 0xC} latch a slot/group/timer address, and the following write to the
    /// paired data port {1, 3, 5, 7, 9, 0xD} performs the actual register update.
    ///
    /// FM registers 0x0, 0x9, 0xA, 0xC, 0xD and 0xE written to a sync-leader bank are broadcast
    /// to every slot participating in that sync group; all other registers affect only the
    /// addressed slot.
    pub fn write(&mut self, port: u8, byte: u8) {
        match port {
            0 | 2 | 4 | 6 => self.fm_address[(port / 2) as usize] = byte,
            1 | 3 | 5 | 7 => self.write_fm(port - 1, byte),
            8 => self.pcm_address = byte,
            9 => self.write_pcm(byte),
            0xC => self.control_address = byte,
            0xD => self.write_control(byte),
            _ => {}
        }
    }

    fn write_fm(&mut self, address_port: u8, data: u8) {
        let address = self.fm_address[(address_port / 2) as usize];
        let Some((bank, slot_in_bank)) = registers::decode_fm_address(address_port, address) else {
            return;
        };
        let reg = (address >> 4) & 0xf;
        let leader = bank * 12 + slot_in_bank as usize;

        if reg == 0x0 {
            self.write_key_state(leader, data);
            return;
        }

        let sync = self.groups[slot_in_bank as usize].sync;
        registers::write_fm_broadcast(&mut self.slots, leader, sync, reg, data);
    }

    fn write_key_state(&mut self, leader: usize, data: u8) {
        let group = leader % 12;
        let sync = self.groups[group].sync;

        for &target in &registers::sync_targets(leader, sync) {
            self.slots[target].ext_en = data & 0x80 != 0;
            self.slots[target].ext_out = (data >> 3) & 0xf;

            if data & 0x1 != 0 {
                self.slots[target].key_on(&self.tables);
                self.clear_end_flag(target);
            } else {
                self.slots[target].key_off();
            }
        }
    }

    fn write_pcm(&mut self, data: u8) {
        let address = self.pcm_address;
        let Some(slot) = registers::decode_pcm_address(address) else {
            return;
        };
        let field = (address >> 4) & 0xf;
        registers::write_pcm_register(&mut self.slots[slot], field, data);
    }

    fn write_control(&mut self, data: u8) {
        match registers::decode_control_write(self.control_address, data) {
            ControlWrite::Group { index, sync, pfm } => {
                registers::apply_group_control(&mut self.groups, index, sync, pfm);
            }
            ControlWrite::TimerAHigh(d) => {
                self.timer_a_raw = (self.timer_a_raw & 0x3) | ((d as u16) << 2);
                self.timer_a.set_value(self.timer_a_raw);
            }
            ControlWrite::TimerALow(d) => {
                self.timer_a_raw = (self.timer_a_raw & !0x3) | (d as u16 & 0x3);
                self.timer_a.set_value(self.timer_a_raw);
            }
            ControlWrite::TimerB(d) => {
                self.timer_b.set_value(d as u16);
            }
            ControlWrite::TimerControl(d) => {
                let (reset_a, reset_b, irq_enable_a, irq_enable_b) =
                    registers::apply_timer_control(&mut self.timer_a, &mut self.timer_b, d);
                self.irq_enable_a = irq_enable_a;
                self.irq_enable_b = irq_enable_b;
                if reset_a {
                    self.irq_state &= !1;
                    self.status &= !1;
                }
                if reset_b {
                    self.irq_state &= !2;
                    self.status &= !2;
                }
                if reset_a || reset_b {
                    self.set_irq(self.irq_state != 0);
                }
            }
            ControlWrite::ExtAddrLow(d) => {
                self.ext_address = (self.ext_address & !0xff) | d as u32;
            }
            ControlWrite::ExtAddrMid(d) => {
                self.ext_address = (self.ext_address & !0xff00) | ((d as u32) << 8);
            }
            ControlWrite::ExtAddrHighAndRw(d) => {
                self.ext_address = (self.ext_address & !0x7f0000) | (((d & 0x7f) as u32) << 16);
            }
            ControlWrite::ExtWrite(d) => {
                self.rom.write(self.ext_address, &[d]);
                self.ext_address = self.ext_address.wrapping_add(1);
            }
            ControlWrite::Ignored => {}
        }
    }

    /// Register-port read.
    ///
    /// Port 0 returns status byte 1: bit 7 is the busy flag (this engine is synchronous, so it is
    /// always clear), bits 3-6 are the end-status flags for group 0's four banks, and bits 0-1 are
    /// the timer status bits.
    ///
    /// Port 1 returns status byte 2: the end-status flags for groups 4 and 8's four banks each.
    ///
    /// Port 2 performs a sequential external PCM memory read, post-incrementing the latched
    /// address.
    ///
    /// Only groups 0, 4 and 8 (the PFM-capable groups) have end-status tracking at all; their
    /// four banks occupy one nibble each of the 12-bit `end_flags` word, in the twisted order the
    /// reference hardware uses (see [`Chip::end_flag_bit`]).
    pub fn read(&mut self, port: u8) -> u8 {
        match port {
            0 => (((self.end_flags & 0xf) as u8) << 3) | (self.status & 0x3),
            1 => (self.end_flags >> 4) as u8,
            2 => {
                let value = self.rom.read(self.ext_address);
                self.ext_address = self.ext_address.wrapping_add(1);
                value
            }
            _ => 0,
        }
    }

    /// Synthesize `samples` frames into `outputs`. Each output frame is the post-fold-down
    /// stereo pair, laid out as `[left, right, 0, 0]` for symmetry with the engine's internal
    /// 4-channel frames.
    pub fn update(&mut self, samples: u32, outputs: &mut [[i32; 4]]) {
        let mut produced = 0usize;
        let mut remaining = samples as usize;

        while remaining > 0 {
            let chunk = remaining.min(self.chunk_frames);
            self.render_chunk(chunk, &mut outputs[produced..produced + chunk]);
            produced += chunk;
            remaining -= chunk;
        }
    }

    fn render_chunk(&mut self, len: usize, outputs: &mut [[i32; 4]]) {
        self.mix_buffer[..len * 4].fill(0);
        self.acc_buffer[..len * 4].fill(0);

        for i in 0..len {
            self.tick_timers();
            self.render_sample(i);
        }

        let mut left = vec![0i32; len];
        let mut right = vec![0i32; len];
        group::stereo_fold_down(&self.mix_buffer[..len * 4], &self.acc_buffer[..len * 4], len, &mut left, &mut right);

        for i in 0..len {
            outputs[i] = [left[i], right[i], 0, 0];
        }
    }

    /// Timer expiry always sets the corresponding status bit; it only reaches the IRQ line when
    /// that timer's IRQ-enable bit (register 0x13 bit 2 for A, bit 3 for B) is set, matching the
    /// reference implementation's `chip->status |= ...` / `if (chip->enable & ...) irq_handler(...)`
    /// split.
    fn tick_timers(&mut self) {
        if self.timer_a.tick() {
            self.status |= 0x1;
            if self.irq_enable_a {
                self.irq_state |= 0x1;
                self.set_irq(true);
            }
        }
        if self.timer_b.tick() {
            self.status |= 0x2;
            if self.irq_enable_b {
                self.irq_state |= 0x2;
                self.set_irq(true);
            }
        }
    }

    fn set_irq(&mut self, asserted: bool) {
        if let Some(cb) = self.irq_callback.as_mut() {
            cb(asserted);
        }
    }

    /// Render one sample (at chunk-relative index `i`) across all 12 groups, group-by-group in
    /// ascending index, accumulating into `mix_buffer`/`acc_buffer` at offset `i*4`.
    fn render_sample(&mut self, i: usize) {
        for g in 0..12 {
            let muted = self.mute_mask & (1 << g) != 0;
            let sync = self.groups[g].sync;
            let pfm_capable = matches!(g, 0 | 4 | 8);
            let pfm_enabled = pfm_capable && self.groups[g].pfm && sync != 3;

            match sync {
                0 => {
                    let frame = self.render_4op_group(g, pfm_enabled);
                    if !muted {
                        for ch in 0..4 {
                            self.mix_buffer[i * 4 + ch] += frame[ch];
                        }
                    }
                }
                1 => {
                    let frame = self.render_2op_pairs(g, pfm_enabled);
                    if !muted {
                        for ch in 0..4 {
                            self.mix_buffer[i * 4 + ch] += frame[ch];
                        }
                    }
                }
                2 => self.render_3op_group(g, i, muted, pfm_enabled),
                _ => self.render_4pcm_group(g, i, muted),
            }
        }
    }

    fn render_4op_group(&mut self, group: usize, pfm_enabled: bool) -> [i32; 4] {
        let algorithm = self.slots[group].algorithm;
        let (bank0, rest) = self.slots.split_at_mut(12);
        let (bank1, rest) = rest.split_at_mut(12);
        let (bank2, bank3) = rest.split_at_mut(12);
        let mut roles: [&mut Slot; 4] = [&mut bank0[group], &mut bank1[group], &mut bank2[group], &mut bank3[group]];
        group::render_4op(&self.tables, &self.rom, &mut roles, algorithm, pfm_enabled)
    }

    fn render_2op_pairs(&mut self, group: usize, pfm_enabled: bool) -> [i32; 4] {
        let algorithm0 = self.slots[group].algorithm;
        let algorithm1 = self.slots[group + 12].algorithm;

        let (bank0, rest) = self.slots.split_at_mut(12);
        let (bank1, rest) = rest.split_at_mut(12);
        let (bank2, bank3) = rest.split_at_mut(12);

        let mut frame = group::render_2op(&self.tables, &self.rom, &mut bank0[group], &mut bank2[group], algorithm0, pfm_enabled);
        let second = group::render_2op(&self.tables, &self.rom, &mut bank1[group], &mut bank3[group], algorithm1, pfm_enabled);
        for ch in 0..4 {
            frame[ch] += second[ch];
        }
        frame
    }

    fn render_3op_group(&mut self, group: usize, i: usize, muted: bool, pfm_enabled: bool) {
        let algorithm = self.slots[group].algorithm;
        let (bank0, rest) = self.slots.split_at_mut(12);
        let (bank1, bank2) = rest.split_at_mut(12);
        let mut roles: [&mut Slot; 3] = [&mut bank0[group], &mut bank1[group], &mut bank2[group]];
        let frame = group::render_3op(&self.tables, &self.rom, &mut roles, algorithm, pfm_enabled);

        if !muted {
            for ch in 0..4 {
                self.mix_buffer[i * 4 + ch] += frame[ch];
            }
        }

        let pcm_index = group + 36;
        let mut mix_one = [0i32; 4];
        let mut acc_one = [0i32; 4];
        let wrapped = pcm::update_pcm(&self.tables, &mut self.slots[pcm_index], &self.rom, &mut mix_one, &mut acc_one, 1);
        if wrapped {
            self.raise_end_flag(pcm_index);
        }
        if !muted {
            for ch in 0..4 {
                self.mix_buffer[i * 4 + ch] += mix_one[ch];
                self.acc_buffer[i * 4 + ch] += acc_one[ch];
            }
        }
    }

    fn render_4pcm_group(&mut self, group: usize, i: usize, muted: bool) {
        for bank in 0..4 {
            let index = bank * 12 + group;
            let mut mix_one = [0i32; 4];
            let mut acc_one = [0i32; 4];
            let wrapped = pcm::update_pcm(&self.tables, &mut self.slots[index], &self.rom, &mut mix_one, &mut acc_one, 1);
            if wrapped {
                self.raise_end_flag(index);
            }
            if !muted {
                for ch in 0..4 {
                    self.mix_buffer[i * 4 + ch] += mix_one[ch];
                    self.acc_buffer[i * 4 + ch] += acc_one[ch];
                }
            }
        }
    }

    /// The end-status bitmap only tracks groups 0, 4 and 8 (the same three groups that are
    /// PFM-capable); the reference hardware packs each of their four banks' flags into one
    /// nibble of a 12-bit word, ordered `bank + (group >> 2) * 4` rather than by absolute slot
    /// index.
    fn end_flag_bit(slot_index: usize) -> Option<u32> {
        let bank = slot_index / 12;
        let group = slot_index % 12;
        if group % 4 != 0 {
            return None;
        }
        Some((bank + (group >> 2) * 4) as u32)
    }

    fn raise_end_flag(&mut self, slot_index: usize) {
        if let Some(bit) = Self::end_flag_bit(slot_index) {
            self.end_flags |= 1 << bit;
        }
    }

    fn clear_end_flag(&mut self, slot_index: usize) {
        if let Some(bit) = Self::end_flag_bit(slot_index) {
            self.end_flags &= !(1 << bit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_non_positive_clock() {
        assert!(Chip::new(0.0).is_err());
        assert!(Chip::new(-1.0).is_err());
    }

    #[test]
    fn silence_after_reset() {
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.reset();
        let mut outputs = vec![[0i32; 4]; 256];
        chip.update(256, &mut outputs);
        assert!(outputs.iter().all(|f| f == &[0, 0, 0, 0]));
    }

    #[test]
    fn sync_broadcast_reaches_all_banks_of_sync0_group() {
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        // Address group 0 bank 0, key on.
        chip.write(0, 0x00);
        chip.write(1, 0x01);
        // Address FM register 0xC (algorithm) of the same slot, write 5; sync defaults to 0.
        chip.write(0, 0xC0);
        chip.write(1, 5);
        assert_eq!(chip.slots[0].algorithm, 5);
        assert_eq!(chip.slots[12].algorithm, 5);
        assert_eq!(chip.slots[24].algorithm, 5);
        assert_eq!(chip.slots[36].algorithm, 5);
    }

    #[test]
    fn timer_a_minimum_period_expires_after_one_sample() {
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.write(0xC, 0x10);
        chip.write(0xD, 0xff); // high 8 bits
        chip.write(0xC, 0x11);
        chip.write(0xD, 0x03); // low 2 bits -> timerA = 1023, period = 1 sample
        chip.write(0xC, 0x13);
        chip.write(0xD, 0x01); // enable timer A

        let mut outputs = vec![[0i32; 4]; 2];
        chip.update(2, &mut outputs);
        assert_eq!(chip.status & 0x1, 0x1);
    }

    #[test]
    fn timer_expiry_sets_status_without_firing_irq_when_irq_enable_is_clear() {
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired_clone = fired.clone();
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.set_irq_callback(move |_| fired_clone.set(true));

        chip.write(0xC, 0x10);
        chip.write(0xD, 0xff);
        chip.write(0xC, 0x11);
        chip.write(0xD, 0x03); // timerA = 1023, period = 1 sample
        chip.write(0xC, 0x13);
        chip.write(0xD, 0x01); // enable timer A, IRQ-enable bit (0x4) left clear

        let mut outputs = vec![[0i32; 4]; 2];
        chip.update(2, &mut outputs);
        assert_eq!(chip.status & 0x1, 0x1);
        assert!(!fired.get());
    }

    #[test]
    fn timer_expiry_fires_irq_when_irq_enable_is_set() {
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired_clone = fired.clone();
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.set_irq_callback(move |_| fired_clone.set(true));

        chip.write(0xC, 0x10);
        chip.write(0xD, 0xff);
        chip.write(0xC, 0x11);
        chip.write(0xD, 0x03); // timerA = 1023, period = 1 sample
        chip.write(0xC, 0x13);
        chip.write(0xD, 0x05); // enable timer A (0x1) and its IRQ-enable bit (0x4)

        let mut outputs = vec![[0i32; 4]; 2];
        chip.update(2, &mut outputs);
        assert_eq!(chip.status & 0x1, 0x1);
        assert!(fired.get());
    }

    #[test]
    fn external_memory_read_post_increments_address() {
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.alloc_rom(4);
        chip.write_rom(0, &[1, 2, 3, 4]);
        chip.write(0xC, 0x14);
        chip.write(0xD, 0); // ext address low = 0
        assert_eq!(chip.read(2), 1);
        assert_eq!(chip.read(2), 2);
    }

    #[test]
    fn end_status_only_tracks_the_pfm_capable_groups() {
        assert_eq!(Chip::end_flag_bit(0), Some(0)); // bank 0, group 0
        assert_eq!(Chip::end_flag_bit(36), Some(3)); // bank 3, group 0
        assert_eq!(Chip::end_flag_bit(8), Some(8)); // bank 0, group 8
        assert_eq!(Chip::end_flag_bit(44), Some(11)); // bank 3, group 8
        assert_eq!(Chip::end_flag_bit(1), None); // group 1 is not a multiple of 4
    }

    #[test]
    fn end_status_surfaces_through_both_read_ports() {
        let mut chip = Chip::new(tables::STD_CLOCK).unwrap();
        chip.raise_end_flag(36); // bank 3, group 0 -> bit 3, visible on port 0
        chip.raise_end_flag(44); // bank 3, group 8 -> bit 11, visible on port 1
        assert_eq!(chip.read(0) & 0b0111_1000, 0b0100_0000);
        assert_eq!(chip.read(1) & 0x80, 0x80);
    }
}
