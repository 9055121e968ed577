//! Register front-end: the address/data port pairs that host software actually writes to, and
//! the sync-broadcast logic that makes one FM register write land on every slot participating in
//! a sync group.

use crate::group::Group;
use crate::slot::Slot;
use crate::tables::{FM_TAB, PCM_TAB};
use crate::timer::Timer;

/// FM registers that a sync-leader bank's write broadcasts to every participating sibling slot.
const BROADCAST_REGISTERS: [u8; 6] = [0x0, 0x9, 0xA, 0xC, 0xD, 0xE];

/// Compute the set of slot indices (within a 48-slot chip, `bank*12 + group`) that a write to
/// `leader` (absolute slot index) should reach, given the leader's group's sync mode.
///
/// This is the single generalized write path referenced in the synchronization design: it reads
/// off the sync topology once, rather than hand-listing targets per sync case.
pub fn sync_targets(leader: usize, sync: u8) -> Vec<usize> {
    let group = leader % 12;
    let bank = leader / 12;

    match sync {
        0 if bank == 0 => (0..4).map(|b| b * 12 + group).collect(),
        1 if bank < 2 => vec![leader, (bank + 2) * 12 + group],
        2 if bank == 0 => vec![group, 12 + group, 24 + group],
        _ => vec![leader],
    }
}

/// Apply an FM register write to `leader`, broadcasting to sync siblings when the register and
/// sync mode call for it.
pub fn write_fm_broadcast(slots: &mut [Slot; 48], leader: usize, sync: u8, reg: u8, data: u8) {
    if BROADCAST_REGISTERS.contains(&reg) {
        for &target in &sync_targets(leader, sync) {
            slots[target].write_fm_register(reg, data);
        }
    } else {
        slots[leader].write_fm_register(reg, data);
    }
}

/// Decode an FM-register address byte (port 0/2/4/6) into `(bank, slot-within-bank)`, logging and
/// returning `None` for the four reserved nibble values.
pub fn decode_fm_address(port: u8, address: u8) -> Option<(usize, u8)> {
    let bank = (port / 2) as usize;
    let slot_in_bank = FM_TAB[address as usize & 0xf];
    if slot_in_bank < 0 {
        log::debug!("ignoring fm register write to reserved address {address:#04x}");
        return None;
    }
    Some((bank, slot_in_bank as u8))
}

/// Decode a PCM-register address byte (port 9) into an absolute slot index.
pub fn decode_pcm_address(address: u8) -> Option<usize> {
    let slot = PCM_TAB[address as usize & 0xf];
    if slot < 0 {
        log::debug!("ignoring pcm register write to reserved address {address:#04x}");
        return None;
    }
    Some(slot as usize)
}

/// Apply a PCM attribute/address-byte register write (port 9, address high nibble selects which
/// field).
pub fn write_pcm_register(slot: &mut Slot, field: u8, data: u8) {
    match field {
        0x0 => {
            slot.startaddr = (slot.startaddr & !0xff) | data as u32;
        }
        0x1 => {
            slot.startaddr = (slot.startaddr & !0xff00) | ((data as u32) << 8);
        }
        0x2 => {
            slot.startaddr = (slot.startaddr & !0x7f0000) | (((data & 0x7f) as u32) << 16);
            slot.altloop = data & 0x80 != 0;
        }
        0x3 => {
            slot.loopaddr = (slot.loopaddr & !0xff) | data as u32;
        }
        0x4 => {
            slot.loopaddr = (slot.loopaddr & !0xff00) | ((data as u32) << 8);
        }
        0x5 => {
            slot.loopaddr = (slot.loopaddr & !0x7f0000) | (((data & 0x7f) as u32) << 16);
        }
        0x6 => {
            slot.endaddr = (slot.endaddr & !0xff) | data as u32;
        }
        0x7 => {
            slot.endaddr = (slot.endaddr & !0xff00) | ((data as u32) << 8);
        }
        0x8 => {
            slot.endaddr = (slot.endaddr & !0x7f0000) | (((data & 0x7f) as u32) << 16);
        }
        0x9 => {
            slot.fs = data & 0x3;
            slot.bits = if data & 0x4 != 0 { 12 } else { 8 };
            slot.srcnote = (data >> 3) & 0x3;
            slot.srcb = (data >> 5) & 0x7;
        }
        _ => {}
    }
}

/// Apply a group/timer/external-memory control register write (port 0xD after addressing port
/// 0xC). See the group-control and timer-layout notes at the call site in [`crate::Chip::write`].
pub enum ControlWrite {
    Group { index: usize, sync: u8, pfm: bool },
    TimerAHigh(u8),
    TimerALow(u8),
    TimerB(u8),
    TimerControl(u8),
    ExtAddrLow(u8),
    ExtAddrMid(u8),
    ExtAddrHighAndRw(u8),
    ExtWrite(u8),
    Ignored,
}

pub fn decode_control_write(address: u8, data: u8) -> ControlWrite {
    if address & 0xf0 == 0 {
        return match FM_TAB[address as usize & 0xf] {
            g if g >= 0 => ControlWrite::Group { index: g as usize, sync: data & 0x3, pfm: data & 0x80 != 0 },
            _ => ControlWrite::Ignored,
        };
    }

    match address {
        0x10 => ControlWrite::TimerAHigh(data),
        0x11 => ControlWrite::TimerALow(data),
        0x12 => ControlWrite::TimerB(data),
        0x13 => ControlWrite::TimerControl(data),
        0x14 => ControlWrite::ExtAddrLow(data),
        0x15 => ControlWrite::ExtAddrMid(data),
        0x16 => ControlWrite::ExtAddrHighAndRw(data),
        0x17 => ControlWrite::ExtWrite(data),
        _ => ControlWrite::Ignored,
    }
}

/// Apply a `TimerControl` (register 0x13) write: enable/disable both timers and acknowledge
/// expired status bits. Returns `(reset_a, reset_b, irq_enable_a, irq_enable_b)` — the reset
/// flags the caller acknowledges immediately, and the IRQ-enable bits (register 0x13 bits 2/3)
/// it should hold onto and consult on every subsequent timer expiry, the same way the reference
/// implementation stores the whole register byte and tests bits 2/3 against it at tick time
/// rather than deriving a one-shot decision here.
pub fn apply_timer_control(timer_a: &mut Timer, timer_b: &mut Timer, data: u8) -> (bool, bool, bool, bool) {
    timer_a.set_enabled(data & 0x1 != 0);
    timer_b.set_enabled(data & 0x2 != 0);

    let reset_a = data & 0x10 != 0;
    let reset_b = data & 0x20 != 0;
    let irq_enable_a = data & 0x4 != 0;
    let irq_enable_b = data & 0x8 != 0;

    (reset_a, reset_b, irq_enable_a, irq_enable_b)
}

/// Apply a group-control write decoded by [`decode_control_write`].
pub fn apply_group_control(groups: &mut [Group; 12], index: usize, sync: u8, pfm: bool) {
    groups[index].sync = sync;
    groups[index].pfm = pfm;
}
