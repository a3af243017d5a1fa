//! The four hardware timers.
//!
//! Each timer has a 16-bit counter, a 16-bit reload, and a control half:
//!
//! | Bits  | Field                                      |
//! |-------|--------------------------------------------|
//! | 0-1   | prescaler: 1, 64, 256, 1024 system cycles  |
//! | 2     | count-up (chained to predecessor overflow) |
//! | 6     | overflow IRQ enable                        |
//! | 7     | enable                                     |
//!
//! Counters advance from CPU-cycle deltas through per-timer prescaler
//! accumulators; nothing here looks at host time. Writes to the counter half
//! set the reload, which takes effect on the next enable edge or overflow.
//! Reads return the live counter through the on-read observer.
//!
//! A count-up timer ignores its own prescaler and advances once per overflow
//! of its predecessor. Timer 0 has no predecessor; its count-up bit is inert.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::io_registers::{IoAccess, IoRegisters, IoWords};

use super::Devices;

/// I/O offset of the first timer word (TM0CNT).
pub const TM0CNT_OFFSET: usize = 0x100;

pub const TIMER_COUNT: usize = 4;

const PRESCALER_PERIODS: [u32; 4] = [1, 64, 256, 1024];

#[derive(Default, Serialize, Deserialize)]
pub struct Timer {
    counter: u16,
    reload: u16,
    control: u16,
    prescaler_acc: u32,
}

impl Timer {
    fn enabled(&self) -> bool {
        self.control.get_bit(7)
    }

    fn count_up(&self) -> bool {
        self.control.get_bit(2)
    }

    pub fn irq_enabled(&self) -> bool {
        self.control.get_bit(6)
    }

    fn prescaler_period(&self) -> u32 {
        PRESCALER_PERIODS[usize::from(self.control.get_bits(0..=1))]
    }
}

/// Overflow counts per timer for one step. A long delta (a DMA burst) can
/// overflow a fast timer more than once.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct TimerOverflows(pub [u32; TIMER_COUNT]);

#[derive(Default, Serialize, Deserialize)]
pub struct Timers {
    timers: [Timer; TIMER_COUNT],
}

impl Timers {
    /// Advances all timers by `cycles` CPU cycles.
    pub fn step(&mut self, cycles: u32) -> TimerOverflows {
        let mut overflows = TimerOverflows::default();
        for k in 0..TIMER_COUNT {
            let timer = &mut self.timers[k];
            if !timer.enabled() || (k > 0 && timer.count_up()) {
                continue;
            }
            timer.prescaler_acc += cycles;
            let ticks = timer.prescaler_acc / timer.prescaler_period();
            timer.prescaler_acc %= timer.prescaler_period();
            self.advance(k, ticks, &mut overflows.0);
        }
        overflows
    }

    fn advance(&mut self, k: usize, mut ticks: u32, overflows: &mut [u32; TIMER_COUNT]) {
        while ticks > 0 {
            let remaining = 0x1_0000 - u32::from(self.timers[k].counter);
            if ticks < remaining {
                self.timers[k].counter += ticks as u16;
                return;
            }
            ticks -= remaining;
            self.timers[k].counter = self.timers[k].reload;
            overflows[k] += 1;

            let next = k + 1;
            if next < TIMER_COUNT && self.timers[next].enabled() && self.timers[next].count_up() {
                self.advance(next, 1, overflows);
            }
        }
    }

    #[must_use]
    pub fn counter(&self, k: usize) -> u16 {
        self.timers[k].counter
    }

    #[must_use]
    pub fn irq_enabled(&self, k: usize) -> bool {
        self.timers[k].irq_enabled()
    }

    /// Writes the counter half: hardware latches this into the reload, not
    /// the running counter.
    pub fn set_reload(&mut self, k: usize, value: u16) {
        self.timers[k].reload = value;
    }

    pub fn set_control(&mut self, k: usize, value: u16) {
        let was_enabled = self.timers[k].enabled();
        self.timers[k].control = value;
        if !was_enabled && self.timers[k].enabled() {
            // enable edge: counter restarts from the reload
            self.timers[k].counter = self.timers[k].reload;
            self.timers[k].prescaler_acc = 0;
        }
    }
}

pub(super) fn install_hooks(io: &mut IoRegisters) {
    for k in 0..TIMER_COUNT {
        io.on_read(TM0CNT_OFFSET + k * 4, counter_read);
        io.on_post_write(TM0CNT_OFFSET + k * 4, control_post_write);
    }
}

const TM0CNT_INDEX: usize = TM0CNT_OFFSET / 4;

fn counter_read(devices: &mut Devices, access: IoAccess, value: &mut u32) {
    let k = access.index - TM0CNT_INDEX;
    *value = (*value & 0xFFFF_0000) | u32::from(devices.timers.counter(k));
}

fn control_post_write(devices: &mut Devices, _: &mut IoWords, access: IoAccess, _: u32, new: u32) {
    let k = access.index - TM0CNT_INDEX;
    if access.mask & 0xFFFF != 0 {
        devices.timers.set_reload(k, new as u16);
    }
    if access.mask & 0xFFFF_0000 != 0 {
        devices.timers.set_control(k, (new >> 16) as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn wired() -> (IoRegisters, Devices) {
        let mut io = IoRegisters::default();
        install_hooks(&mut io);
        (io, Devices::default())
    }

    #[test]
    fn counter_advances_one_tick_per_prescaler_period() {
        let mut timers = Timers::default();
        timers.set_control(0, 0x0081); // enabled, prescaler 64

        assert_eq!(timers.step(63).0[0], 0);
        assert_eq!(timers.counter(0), 0);

        timers.step(1);
        assert_eq!(timers.counter(0), 1);

        timers.step(64 * 10);
        assert_eq!(timers.counter(0), 11);
    }

    #[test]
    fn overflow_reloads_and_reports() {
        let mut timers = Timers::default();
        timers.set_reload(0, 0xFFFE);
        timers.set_control(0, 0x0080); // enabled, prescaler 1

        assert_eq!(timers.counter(0), 0xFFFE);
        let overflows = timers.step(2);
        assert_eq!(overflows.0[0], 1);
        assert_eq!(timers.counter(0), 0xFFFE);

        // period is 2 ticks now, so 7 cycles is 3 more overflows
        assert_eq!(timers.step(7).0[0], 3);
    }

    #[test]
    fn count_up_ignores_own_prescaler() {
        let mut timers = Timers::default();
        timers.set_reload(0, 0xFFFF); // overflows every tick
        timers.set_control(0, 0x0080);
        timers.set_control(1, 0x0087); // enabled, count-up (prescaler bits ignored)

        let overflows = timers.step(3);
        assert_eq!(overflows.0[0], 3);
        assert_eq!(timers.counter(1), 3);
    }

    #[test]
    fn cascade_overflow_propagates() {
        let mut timers = Timers::default();
        timers.set_reload(0, 0xFFFF);
        timers.set_control(0, 0x0080);
        timers.set_reload(1, 0xFFFF);
        timers.set_control(1, 0x0084);
        timers.set_control(2, 0x0084);

        let overflows = timers.step(2);
        assert_eq!(overflows.0[1], 2);
        assert_eq!(timers.counter(2), 2);
    }

    #[test]
    fn counter_write_latches_into_reload_only() {
        let (mut io, mut devices) = wired();

        io.write(&mut devices, TM0CNT_OFFSET, 0x1234, 2);
        io.write(&mut devices, TM0CNT_OFFSET + 2, 0x0080, 2);

        // enable edge loaded the reload
        assert_eq!(io.read(&mut devices, TM0CNT_OFFSET, 2), 0x1234);

        // writing the counter half while running does not touch the counter
        io.write(&mut devices, TM0CNT_OFFSET, 0xAAAA, 2);
        assert_eq!(io.read(&mut devices, TM0CNT_OFFSET, 2), 0x1234);

        // ...until the next overflow wraps to the new reload
        let to_overflow = 0x1_0000 - 0x1234;
        let overflows = devices.timers.step(to_overflow);
        assert_eq!(overflows.0[0], 1);
        assert_eq!(io.read(&mut devices, TM0CNT_OFFSET, 2), 0xAAAA);
    }

    #[test]
    fn live_counter_visible_through_io_read() {
        let (mut io, mut devices) = wired();

        io.write(&mut devices, TM0CNT_OFFSET + 2, 0x0080, 2);
        devices.timers.step(5);

        assert_eq!(io.read(&mut devices, TM0CNT_OFFSET, 2), 5);
        // control half reads back as written
        assert_eq!(io.read(&mut devices, TM0CNT_OFFSET + 2, 2), 0x0080);
    }
}
