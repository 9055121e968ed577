//! A single voice slot: register shadow plus the runtime phase/envelope/LFO state needed to
//! render one operator or PCM channel.

use crate::envelope::Envelope;
use crate::lfo::Lfo;
use crate::math;
use crate::tables::Tables;

/// Feeding a role's phase accumulator from its own last two outputs (averaged), vs. from another
/// role's freshly computed output, vs. nothing.
pub const OP_INPUT_NONE: i32 = i32::MIN;
pub const OP_INPUT_FEEDBACK: i32 = i32::MIN + 1;

#[derive(Default, Clone, Copy)]
pub struct ChannelLevels {
    pub ch0: u8,
    pub ch1: u8,
    pub ch2: u8,
    pub ch3: u8,
}

/// One of the 48 voice slots (`bank * 12 + group`).
pub struct Slot {
    // Pitch / routing registers
    pub ext_en: bool,
    pub ext_out: u8,
    pub lfo_freq: u8,
    pub lfowave: u8,
    pub pms: u8,
    pub ams: u8,
    pub detune: u8,
    pub multiple: u8,
    pub tl: u8,
    pub ar: u8,
    pub keyscale: u8,
    pub decay1rate: u8,
    pub decay2rate: u8,
    pub relrate: u8,
    pub decay1lvl: u8,
    pub block: u8,
    pub fns: u16,
    fns_hi_latch: u8,
    pub feedback: u8,
    pub waveform: u8,
    pub accon: bool,
    pub algorithm: u8,
    pub levels: ChannelLevels,

    // PCM registers
    pub startaddr: u32,
    pub loopaddr: u32,
    pub endaddr: u32,
    pub altloop: bool,
    pub fs: u8,
    pub bits: u8,
    pub srcnote: u8,
    pub srcb: u8,

    // Runtime state
    pub step: u32,
    pub stepptr: u64,
    pub active: bool,
    pub loop_direction: i8,
    pub envelope: Envelope,
    pub lfo: Lfo,
    feedback_mod0: i32,
    feedback_mod1: i32,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            ext_en: false,
            ext_out: 0,
            lfo_freq: 0,
            lfowave: 0,
            pms: 0,
            ams: 0,
            detune: 0,
            multiple: 0,
            tl: 0,
            ar: 0,
            keyscale: 0,
            decay1rate: 0,
            decay2rate: 0,
            relrate: 0,
            decay1lvl: 0,
            block: 0,
            fns: 0,
            fns_hi_latch: 0,
            feedback: 0,
            waveform: 0,
            accon: false,
            algorithm: 0,
            levels: ChannelLevels::default(),
            startaddr: 0,
            loopaddr: 0,
            endaddr: 0,
            altloop: false,
            fs: 0,
            bits: 8,
            srcnote: 0,
            srcb: 0,
            step: 0,
            stepptr: 0,
            active: false,
            loop_direction: 1,
            envelope: Envelope::new(),
            lfo: Lfo::new(),
            feedback_mod0: 0,
            feedback_mod1: 0,
        }
    }

    /// Apply an FM register write (0x0-0xE), except for the key-on/off bit of register 0x0,
    /// which the register front-end handles via [`Slot::key_on`]/[`Slot::key_off`] since it also
    /// drives sibling-slot synchronization.
    pub fn write_fm_register(&mut self, reg: u8, data: u8) {
        match reg {
            0x0 => {
                self.ext_en = data & 0x80 != 0;
                self.ext_out = (data >> 3) & 0xf;
            }
            0x1 => self.lfo_freq = data,
            0x2 => {
                self.lfowave = data & 0x3;
                self.pms = (data >> 3) & 0x7;
                self.ams = (data >> 6) & 0x3;
            }
            0x3 => {
                self.multiple = data & 0xf;
                self.detune = (data >> 4) & 0x7;
            }
            0x4 => self.tl = data & 0x7f,
            0x5 => {
                self.ar = data & 0x1f;
                self.keyscale = (data >> 5) & 0x3;
            }
            0x6 => self.decay1rate = data & 0x1f,
            0x7 => self.decay2rate = data & 0x1f,
            0x8 => {
                self.relrate = data & 0xf;
                self.decay1lvl = (data >> 4) & 0xf;
            }
            0x9 => {
                self.fns = ((self.fns_hi_latch as u16 & 0xf) << 8) | data as u16;
                self.block = (self.fns_hi_latch >> 4) & 0xf;
            }
            0xa => self.fns_hi_latch = data,
            0xb => {
                self.waveform = data & 0x7;
                self.feedback = (data >> 4) & 0x7;
                self.accon = data & 0x80 != 0;
            }
            0xc => self.algorithm = data & 0xf,
            0xd => {
                self.levels.ch0 = data >> 4;
                self.levels.ch1 = data & 0xf;
            }
            0xe => {
                self.levels.ch2 = data >> 4;
                self.levels.ch3 = data & 0xf;
            }
            _ => {}
        }
    }

    /// Key on: reset phase, envelope and LFO, then compute the very first phase step.
    pub fn key_on(&mut self, tables: &Tables) {
        self.step = 0;
        self.stepptr = 0;
        self.active = true;
        self.loop_direction = 1;
        self.feedback_mod0 = 0;
        self.feedback_mod1 = 0;

        let keycode = self.keycode();
        self.envelope.key_on(
            tables,
            self.ar,
            self.decay1rate,
            self.decay2rate,
            self.relrate,
            self.decay1lvl,
            keycode,
            self.keyscale as usize,
        );
        self.lfo.key_on(tables, self.lfo_freq, self.lfowave, self.pms);

        self.calculate_step(tables);
    }

    /// Key off: enter release, only meaningful while the slot is active.
    pub fn key_off(&mut self) {
        if self.active {
            self.envelope.key_off();
        }
    }

    fn keycode(&self) -> usize {
        if self.waveform == 7 {
            math::external_keycode(self.block, self.fns, self.srcb, self.srcnote)
        } else {
            math::internal_keycode(self.block, self.fns)
        }
    }

    /// Recompute the phase accumulator step from pitch registers and the current LFO
    /// phase-modulation multiplier.
    pub fn calculate_step(&mut self, tables: &Tables) {
        let multiple = crate::tables::MULTIPLE_TABLE[self.multiple as usize & 0xf];
        let block_scale = crate::tables::POW_TABLE[self.block as usize & 0xf];

        self.step = if self.waveform == 7 {
            let fns = (self.fns | 0x800) as f64;
            let fs = crate::tables::FS_FREQUENCY[self.fs as usize & 3];
            let st = 2.0 * fns * block_scale * fs * multiple * self.lfo.phasemod;
            (st / (524288.0 / 65536.0)) as u32
        } else {
            let keycode = self.keycode();
            let detuned = (self.fns as i32 + tables.detune[self.detune as usize & 7][keycode]).max(0);
            let st = 2.0 * detuned as f64 * block_scale * multiple * 1024.0 * self.lfo.phasemod;
            (st / (536870912.0 / 65536.0)) as u32
        };
    }

    /// Final per-sample attenuation multiplier, in 0.16 fixed point, combining envelope, LFO and
    /// total level.
    pub fn slot_volume(&self, tables: &Tables) -> i32 {
        let lfo_volume = self.lfo.ams_multiplier(self.ams);
        let env_index = (255 - (self.envelope.volume >> 16)).clamp(0, 255) as usize;
        let env_volume = ((tables.env_volume[env_index] as i64 * lfo_volume as i64) >> 16) as i32;
        ((env_volume as i64 * tables.total_level[self.tl as usize & 0x7f] as i64) >> 16) as i32
    }

    /// Advance envelope and LFO state by one sample; call once per sample before reading
    /// operator output.
    pub fn advance_modulators(&mut self, tables: &Tables) -> bool {
        let ended = self.envelope.update();
        if ended {
            self.active = false;
        }
        self.lfo.update(tables, self.lfowave, self.pms);
        self.calculate_step(tables);
        ended
    }

    /// Latch the feedback register from a freshly computed modulator output, using the
    /// empirically tuned `/4` scale factor (preserved exactly to match known-good recordings).
    pub fn set_feedback(&mut self, output: i32) {
        self.feedback_mod1 =
            ((output << 8) * crate::tables::FEEDBACK_LEVEL[self.feedback as usize & 7]) / 4;
    }

    /// Self-feedback modulation input: the average of the last two latched outputs. Rolls the
    /// feedback memory forward by one sample.
    pub fn feedback_input(&mut self) -> i32 {
        let input = (self.feedback_mod0 + self.feedback_mod1) / 2;
        self.feedback_mod0 = self.feedback_mod1;
        input
    }

    /// Upstream modulation input scaled by this slot's feedback register (despite the name, this
    /// uses the *modulation* level table, not the feedback one).
    pub fn modulation_input(&self, upstream_output: i32) -> i32 {
        (upstream_output << 8) * crate::tables::MODULATION_LEVEL[self.feedback as usize & 7]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_on_activates_slot_and_seeds_attack() {
        let tables = Tables::new(crate::tables::STD_CLOCK);
        let mut slot = Slot::new();
        slot.ar = 31;
        slot.fns = 0x400;
        slot.key_on(&tables);
        assert!(slot.active);
        assert_eq!(slot.envelope.state, crate::envelope::EnvState::Attack);
    }

    #[test]
    fn key_off_on_inactive_slot_is_a_no_op() {
        let mut slot = Slot::new();
        slot.key_off();
        assert_eq!(slot.envelope.state, crate::envelope::EnvState::Release);
    }

    #[test]
    fn feedback_input_averages_last_two_outputs() {
        let mut slot = Slot::new();
        slot.feedback = 1; // level = 1
        slot.set_feedback(100);
        let first = slot.feedback_input();
        assert_eq!(first, (0 + ((100i32 << 8) * 1 / 4)) / 2);
    }

    #[test]
    fn pcm_keycode_uses_external_formula() {
        let mut slot = Slot::new();
        slot.waveform = 7;
        slot.srcb = 1;
        slot.srcnote = 2;
        slot.block = 0;
        slot.fns = 0;
        assert_eq!(slot.keycode(), math::external_keycode(0, 0, 1, 2));
    }
}
