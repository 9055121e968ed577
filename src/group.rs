//! Group dispatcher: wires slots into one of the 28 FM algorithm topologies (or routes them to
//! independent PCM playback), and folds the resulting 4-channel output down to stereo.
//!
//! The topologies themselves are plain data (arrays of [`AlgoStep`]): a single generic
//! interpreter walks whichever table the group's `sync`/`algorithm` registers select, rather
//! than branching through one body of code per topology.

use crate::operator::{calculate_op, calculate_op_pfm};
use crate::pcm::update_pcm;
use crate::rom::Rom;
use crate::slot::{Slot, OP_INPUT_FEEDBACK, OP_INPUT_NONE};
use crate::tables::Tables;

/// How a step's phase modulation input is produced.
#[derive(Clone, Copy)]
pub enum ModInput {
    None,
    Feedback,
    Role(u8),
    SumRoles(u8, u8),
}

/// One step of an FM algorithm topology, addressing operators by abstract "role" (1-based,
/// matching the datasheet's S1/S2/S3/S4 labeling).
#[derive(Clone, Copy)]
pub enum AlgoStep {
    /// Compute a role purely as a modulation source for later steps; not mixed to output.
    Modulate { role: u8, input: ModInput },
    /// Latch a role's feedback register from a value already computed this sample.
    CaptureFeedback { role: u8, source: ModInput },
    /// Compute a role and mix its output to all four channels.
    Carrier { role: u8, input: ModInput },
    /// A role already computed by an earlier `Modulate` step is *also* a carrier. Without PFM
    /// this simply reuses the cached value (no second call); with PFM the carrier is
    /// recomputed through the PCM-aware path using the same input, which re-advances that
    /// slot's envelope/LFO/phase a second time for this sample — an authentic quirk of the
    /// original hardware, not a bug.
    CarrierReuse { role: u8, input: ModInput },
}

use AlgoStep::{CaptureFeedback, Carrier, CarrierReuse, Modulate};
use ModInput::{Feedback, Role, SumRoles};

macro_rules! algo {
    ($($step:expr),* $(,)?) => { &[$($step),*] as &[AlgoStep] };
}

pub const ALGO_4OP: [&[AlgoStep]; 16] = [
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: Role(1) },
        Modulate { role: 2, input: Role(3) },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        Modulate { role: 2, input: Role(3) },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: ModInput::None },
        Modulate { role: 2, input: SumRoles(1, 3) },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: ModInput::None },
        Modulate { role: 2, input: Role(3) },
        Carrier { role: 4, input: SumRoles(1, 2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: Role(1) },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: SumRoles(3, 2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: SumRoles(3, 2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Carrier { role: 3, input: Role(1) },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        CarrierReuse { role: 3, input: Role(1) },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Modulate { role: 3, input: ModInput::None },
        Modulate { role: 2, input: Role(3) },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Modulate { role: 3, input: ModInput::None },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: SumRoles(3, 2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Carrier { role: 3, input: Role(1) },
        Carrier { role: 2, input: ModInput::None },
        Carrier { role: 4, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        CarrierReuse { role: 3, input: Role(1) },
        Carrier { role: 2, input: ModInput::None },
        Carrier { role: 4, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Carrier { role: 3, input: Role(1) },
        Carrier { role: 2, input: Role(1) },
        Carrier { role: 4, input: Role(1) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Modulate { role: 3, input: ModInput::None },
        Carrier { role: 2, input: Role(3) },
        Carrier { role: 4, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: Role(1) },
        Modulate { role: 2, input: ModInput::None },
        Carrier { role: 4, input: Role(2) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: ModInput::None },
        Carrier { role: 2, input: ModInput::None },
        Carrier { role: 4, input: ModInput::None },
    ],
];

pub const ALGO_2OP: [&[AlgoStep]; 4] = [
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Carrier { role: 3, input: Role(1) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        CarrierReuse { role: 3, input: Role(1) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: Role(1) },
    ],
];

pub const ALGO_3OP: [&[AlgoStep]; 8] = [
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: Role(1) },
        Carrier { role: 2, input: Role(3) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        Carrier { role: 2, input: Role(3) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Modulate { role: 3, input: ModInput::None },
        Carrier { role: 2, input: SumRoles(1, 3) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Modulate { role: 3, input: ModInput::None },
        Carrier { role: 2, input: Role(3) },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        Carrier { role: 3, input: Role(1) },
        Carrier { role: 2, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        Modulate { role: 3, input: Role(1) },
        CaptureFeedback { role: 1, source: Role(3) },
        CarrierReuse { role: 3, input: Role(1) },
        Carrier { role: 2, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: ModInput::None },
        Carrier { role: 2, input: ModInput::None },
    ],
    algo![
        Modulate { role: 1, input: Feedback },
        CaptureFeedback { role: 1, source: Role(1) },
        CarrierReuse { role: 1, input: Feedback },
        Carrier { role: 3, input: Role(1) },
        Carrier { role: 2, input: ModInput::None },
    ],
];

/// One of the 12 FM/PCM groups: the `sync`/`pfm` control register shared by its whole bank
/// column. The algorithm register itself lives on each bank's `Slot`, since it is an FM register
/// broadcast by sync like any other.
pub struct Group {
    pub sync: u8,
    pub pfm: bool,
}

impl Group {
    pub fn new() -> Self {
        Self { sync: 0, pfm: false }
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(input: ModInput, values: &[i32; 5]) -> i32 {
    match input {
        ModInput::None => OP_INPUT_NONE,
        Feedback => OP_INPUT_FEEDBACK,
        Role(r) => values[r as usize],
        SumRoles(a, b) => values[a as usize] + values[b as usize],
    }
}

fn attenuate(tables: &Tables, output: i32, slot: &Slot, frame: &mut [i32; 4]) {
    let levels = [slot.levels.ch0, slot.levels.ch1, slot.levels.ch2, slot.levels.ch3];
    for (ch, &level) in levels.iter().enumerate() {
        let attn = tables.attenuation[level as usize & 0xf];
        frame[ch] += ((output as i64 * attn as i64) >> 16) as i32;
    }
}

/// Walk an algorithm's steps against `slots`, a table mapping role number (1-based) to the
/// physical slot that fills it, and fold every carrier's output into a 4-channel frame.
fn run(steps: &[AlgoStep], tables: &Tables, rom: &Rom, slots: &mut [&mut Slot], role_index: impl Fn(u8) -> usize, pfm_enabled: bool) -> [i32; 4] {
    let mut values = [0i32; 5]; // index 0 unused, roles are 1-based
    let mut frame = [0i32; 4];

    for step in steps {
        match *step {
            Modulate { role, input } => {
                let resolved = resolve(input, &values);
                let slot = &mut *slots[role_index(role)];
                values[role as usize] = calculate_op(tables, slot, resolved);
            }
            CaptureFeedback { role, source } => {
                let value = resolve(source, &values);
                let slot = &mut *slots[role_index(role)];
                slot.set_feedback(value);
            }
            Carrier { role, input } => {
                let resolved = resolve(input, &values);
                let slot = &mut *slots[role_index(role)];
                let output = if pfm_enabled {
                    calculate_op_pfm(tables, slot, rom, resolved)
                } else {
                    calculate_op(tables, slot, resolved)
                };
                values[role as usize] = output;
                attenuate(tables, output, slot, &mut frame);
            }
            CarrierReuse { role, input } => {
                let slot = &mut *slots[role_index(role)];
                let output = if pfm_enabled {
                    let resolved = resolve(input, &values);
                    calculate_op_pfm(tables, slot, rom, resolved)
                } else {
                    values[role as usize]
                };
                attenuate(tables, output, slot, &mut frame);
            }
        }
    }

    frame
}

/// Render one sample of a sync-0 (4-operator FM) group, wiring roles 1..4 to banks 0..3.
pub fn render_4op(tables: &Tables, rom: &Rom, slots4: &mut [&mut Slot; 4], algorithm: u8, pfm_enabled: bool) -> [i32; 4] {
    let steps = ALGO_4OP[algorithm as usize & 0xf];
    run(steps, tables, rom, slots4, |role| role as usize - 1, pfm_enabled)
}

/// Render one sample of a sync-1 (2x2-operator FM) pair, wiring role 1 to `slot1` and role 3 to
/// `slot3`.
pub fn render_2op(tables: &Tables, rom: &Rom, slot1: &mut Slot, slot3: &mut Slot, algorithm: u8, pfm_enabled: bool) -> [i32; 4] {
    let steps = ALGO_2OP[algorithm as usize & 0x3];
    let mut slots: [&mut Slot; 2] = [slot1, slot3];
    run(steps, tables, rom, &mut slots, |role| if role == 1 { 0 } else { 1 }, pfm_enabled)
}

/// Render one sample of a sync-2 (3-operator FM) triple, wiring roles 1..3 to banks 0..2.
pub fn render_3op(tables: &Tables, rom: &Rom, slots3: &mut [&mut Slot; 3], algorithm: u8, pfm_enabled: bool) -> [i32; 4] {
    let steps = ALGO_3OP[algorithm as usize & 0x7];
    run(steps, tables, rom, slots3, |role| role as usize - 1, pfm_enabled)
}

/// Render one sample of a sync-3 group: four fully independent PCM channels.
pub fn render_4pcm(tables: &Tables, rom: &Rom, slots4: &mut [&mut Slot; 4], mix: &mut [i32], acc: &mut [i32]) {
    for slot in slots4.iter_mut() {
        update_pcm(tables, slot, rom, mix, acc, 1);
    }
}

/// Fold the 4-channel mix+acc buffers down to stereo, per the Seibu-SPI-derived mixdown ratio.
pub fn stereo_fold_down(mix: &[i32], acc: &[i32], len: usize, out_left: &mut [i32], out_right: &mut [i32]) {
    for i in 0..len {
        let ch0 = mix[i * 4] + acc[i * 4];
        let ch1 = mix[i * 4 + 1] + acc[i * 4 + 1];
        let ch2 = mix[i * 4 + 2] + acc[i * 4 + 2];
        let ch3 = mix[i * 4 + 3] + acc[i * 4 + 3];

        let left = ch0 + ((ch2 * 5) >> 8);
        let right = ch1 + ((ch3 * 5) >> 8);

        out_left[i] = left >> 2;
        out_right[i] = right >> 2;
    }
}
