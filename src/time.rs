//! Millisecond tick source and polled timers.

use core::cell::Cell;

use critical_section::Mutex;

/// Monotonic millisecond time source.
pub trait Clock {
    fn now(&self) -> u64;
}

/// Interrupt-driven 64-bit millisecond counter.
///
/// `tick` runs in the periodic timer handler, `now` in the main loop. The
/// counter is wider than the word size of 32-bit targets, so both sides
/// take a critical section rather than risk a torn read.
pub struct TickCounter {
    ticks: Mutex<Cell<u64>>,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self {
            ticks: Mutex::new(Cell::new(0)),
        }
    }

    /// Advance the counter by one millisecond. Call from the tick ISR.
    pub fn tick(&self) {
        critical_section::with(|cs| {
            let ticks = self.ticks.borrow(cs);
            ticks.set(ticks.get() + 1);
        });
    }
}

impl Clock for TickCounter {
    fn now(&self) -> u64 {
        critical_section::with(|cs| self.ticks.borrow(cs).get())
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin until `ms` milliseconds have passed.
pub fn delay<C: Clock>(clock: &C, ms: u64) {
    let end = clock.now() + ms;
    while clock.now() < end {}
}

/// [`embedded_hal::delay::DelayNs`] adapter over a [`Clock`], millisecond
/// resolution rounded up. Lets platform drivers that want a delay provider
/// share the bootloader's tick source.
pub struct ClockDelay<'a, C: Clock> {
    clock: &'a C,
}

impl<'a, C: Clock> ClockDelay<'a, C> {
    pub fn new(clock: &'a C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> embedded_hal::delay::DelayNs for ClockDelay<'_, C> {
    fn delay_ns(&mut self, ns: u32) {
        delay(self.clock, u64::from(ns).div_ceil(1_000_000));
    }

    fn delay_ms(&mut self, ms: u32) {
        delay(self.clock, u64::from(ms));
    }
}

/// One-shot or repeating timer polled against a [`Clock`].
///
/// One-shot timers latch once elapsed; repeating timers re-arm by
/// advancing the target by `wait_time` on the elapsed poll, so successive
/// firings stay `wait_time` apart regardless of polling jitter.
pub struct SimpleTimer {
    wait_time: u64,
    target_time: u64,
    auto_reset: bool,
    has_elapsed: bool,
}

impl SimpleTimer {
    pub fn new<C: Clock>(clock: &C, wait_time: u64, auto_reset: bool) -> Self {
        Self {
            wait_time,
            target_time: clock.now() + wait_time,
            auto_reset,
            has_elapsed: false,
        }
    }

    pub fn has_elapsed<C: Clock>(&mut self, clock: &C) -> bool {
        if self.has_elapsed {
            return true;
        }

        let elapsed = clock.now() >= self.target_time;
        if elapsed {
            if self.auto_reset {
                self.target_time += self.wait_time;
            } else {
                self.has_elapsed = true;
            }
        }
        elapsed
    }

    /// Re-arm relative to now and clear the latch.
    pub fn reset<C: Clock>(&mut self, clock: &C) {
        self.target_time = clock.now() + self.wait_time;
        self.has_elapsed = false;
    }
}
