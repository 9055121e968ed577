//! The four-stage (attack/decay1/decay2/release) envelope generator shared by every slot.

use crate::tables::Tables;

/// Initial volume on key-on, in the 0..255 8-bit domain (~-60dB below full scale).
const INITIAL_ATTENUATION: i32 = 255 - 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Attack,
    Decay1,
    Decay2,
    Release,
}

/// Runtime envelope state for one slot. `volume` is 16.16 fixed point, always non-negative; it
/// represents attenuation from full scale, so larger means quieter.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub state: EnvState,
    pub volume: i32,
    attack_step: i32,
    decay1_step: i32,
    decay2_step: i32,
    release_step: i32,
    decay1_threshold: i32,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            state: EnvState::Release,
            volume: 255 << 16,
            attack_step: 0,
            decay1_step: 0,
            decay2_step: 0,
            release_step: 0,
            decay1_threshold: 0,
        }
    }

    /// Recompute rate steps and reset to the attack stage. Called on key-on, before the first
    /// phase step is calculated for the slot.
    pub fn key_on(
        &mut self,
        tables: &Tables,
        ar: u8,
        decay1rate: u8,
        decay2rate: u8,
        relrate: u8,
        decay1lvl: u8,
        keycode: usize,
        keyscale: usize,
    ) {
        let rks = tables.rks(keycode, keyscale);

        self.decay1_threshold = 255 - (decay1lvl as i32 * 16);

        let ar_rate = crate::math::keyscaled_rate(ar as i32 * 2, rks);
        let d1_rate = crate::math::keyscaled_rate(decay1rate as i32 * 2, rks);
        let d2_rate = crate::math::keyscaled_rate(decay2rate as i32 * 2, rks);
        let rr_rate = crate::math::keyscaled_rate(relrate as i32 * 4, rks);

        self.attack_step = rate_step(255.0, ar_rate, &tables.ar);
        self.decay1_step = rate_step((255 - self.decay1_threshold) as f64, d1_rate, &tables.dc);
        self.decay2_step = rate_step(255.0, d2_rate, &tables.dc);
        self.release_step = rate_step(255.0, rr_rate, &tables.dc);

        self.volume = INITIAL_ATTENUATION << 16;
        self.state = EnvState::Attack;
    }

    /// Transition to release, if the slot is currently active. The caller is responsible for
    /// checking `active` before calling this.
    pub fn key_off(&mut self) {
        self.state = EnvState::Release;
    }

    /// Advance the envelope by one sample. Returns `true` once volume has bottomed out, meaning
    /// the slot should be deactivated.
    pub fn update(&mut self) -> bool {
        match self.state {
            EnvState::Attack => {
                self.volume += self.attack_step;
                if self.volume >= 255 << 16 {
                    self.volume = 255 << 16;
                    self.state = EnvState::Decay1;
                }
                false
            }
            EnvState::Decay1 => {
                self.volume -= self.decay1_step;
                if self.ended() {
                    return true;
                }
                if (self.volume >> 16) <= self.decay1_threshold {
                    self.state = EnvState::Decay2;
                }
                false
            }
            EnvState::Decay2 => {
                self.volume -= self.decay2_step;
                self.ended()
            }
            EnvState::Release => {
                self.volume -= self.release_step;
                self.ended()
            }
        }
    }

    fn ended(&mut self) -> bool {
        if self.volume <= 0 {
            self.volume = 0;
            true
        } else {
            false
        }
    }
}

/// `rate < 4` is the datasheet's "never advances" case; otherwise the step is scaled so that
/// `numerator` worth of 8-bit attenuation is covered in `lut[rate]` samples.
fn rate_step(numerator: f64, rate: u8, lut: &[f64; 64]) -> i32 {
    if rate < 4 {
        0
    } else {
        ((numerator / lut[rate as usize]) * 65536.0).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn envelope_at(clock: f64, ar: u8) -> Envelope {
        let tables = Tables::new(clock);
        let mut env = Envelope::new();
        env.key_on(&tables, ar, 31, 31, 15, 0, 0, 0);
        env
    }

    #[test]
    fn attack_volume_is_monotonically_non_decreasing() {
        let mut env = envelope_at(crate::tables::STD_CLOCK, 31);
        let mut prev = env.volume;
        for _ in 0..64 {
            env.update();
            assert!(env.volume >= prev);
            prev = env.volume;
        }
    }

    #[test]
    fn rate_below_four_never_advances() {
        let mut env = envelope_at(crate::tables::STD_CLOCK, 1);
        let start = env.volume;
        for _ in 0..1000 {
            env.update();
        }
        assert_eq!(env.volume, start);
    }

    #[test]
    fn release_reaches_zero_and_reports_end() {
        let mut env = envelope_at(crate::tables::STD_CLOCK, 31);
        // Drive to full volume, then release.
        for _ in 0..10_000 {
            if env.update() {
                break;
            }
        }
        env.key_off();
        let mut ended = false;
        for _ in 0..200_000 {
            if env.update() {
                ended = true;
                break;
            }
        }
        assert!(ended);
        assert_eq!(env.volume, 0);
    }

    proptest::proptest! {
        #[test]
        fn decay_and_release_volume_never_increases(
            ar in 0u8..32, d1 in 0u8..32, d2 in 0u8..32, rr in 0u8..16, d1lvl in 0u8..16,
        ) {
            let tables = Tables::new(crate::tables::STD_CLOCK);
            let mut env = Envelope::new();
            env.key_on(&tables, ar, d1, d2, rr, d1lvl, 0, 0);

            let mut prev = env.volume;
            let mut reached_decay = false;
            for step in 0..20_000 {
                let ended = env.update();
                if env.state != EnvState::Attack {
                    reached_decay = true;
                    prop_assert!(env.volume <= prev);
                }
                prev = env.volume;
                if ended {
                    prop_assert_eq!(env.volume, 0);
                    break;
                }
                if step == 19_999 && ar >= 4 {
                    prop_assert!(reached_decay, "attack never transitioned out within the sample budget");
                }
            }
        }
    }
}
