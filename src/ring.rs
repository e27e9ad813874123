//! Lossy single-producer single-consumer ring buffers.
//!
//! The byte ring is the only structure shared between interrupt context and
//! the main loop: the serial RX handler pushes, the main loop pops. The
//! packet ring reuses the same type with both ends on the main loop.
//!
//! SPSC discipline: the producer only stores the write index, the consumer
//! only stores the read index, and each side loads the other's index once
//! per operation before acting on it. Capacity is a power of two so
//! wrap-around is a bitmask.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert;

/// Byte ring capacity. Covers ~10 ms of line latency at 115200 baud.
pub const RX_RING_CAPACITY: usize = 128;
/// Packet ring capacity.
pub const PACKET_RING_CAPACITY: usize = 8;

const_assert!(RX_RING_CAPACITY.is_power_of_two());
const_assert!(PACKET_RING_CAPACITY.is_power_of_two());

/// Fixed-capacity SPSC queue holding up to `N - 1` elements.
///
/// `push` may run in interrupt context while `pop` runs in the main loop;
/// a `&'static Ring` can be shared with the RX ISR.
pub struct Ring<T, const N: usize> {
    buf: UnsafeCell<[MaybeUninit<T>; N]>,
    read_index: AtomicUsize,
    write_index: AtomicUsize,
}

// SAFETY: a slot is written before the write index publishes it (Release)
// and read only after observing that publication (Acquire); the two ends
// never touch the same slot concurrently.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T: Copy, const N: usize> Ring<T, N> {
    const MASK: usize = N - 1;
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.is_power_of_two());

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_IS_POWER_OF_TWO;
        Self {
            buf: UnsafeCell::new([MaybeUninit::uninit(); N]),
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_index.load(Ordering::Relaxed) == self.write_index.load(Ordering::Relaxed)
    }

    /// Number of elements currently queued. Consumer-side view.
    pub fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);
        write.wrapping_sub(read) & Self::MASK
    }

    /// Producer end. Returns `false` when the ring is full; the newest
    /// element is dropped rather than overwriting queued data.
    pub fn push(&self, value: T) -> bool {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Acquire);

        let next = (write + 1) & Self::MASK;
        if next == read {
            return false;
        }

        unsafe {
            let slot = (self.buf.get() as *mut MaybeUninit<T>).add(write);
            slot.write(MaybeUninit::new(value));
        }
        self.write_index.store(next, Ordering::Release);
        true
    }

    /// Consumer end. Returns `None` when the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let value = unsafe {
            let slot = (self.buf.get() as *const MaybeUninit<T>).add(read);
            slot.read().assume_init()
        };
        self.read_index.store((read + 1) & Self::MASK, Ordering::Release);
        Some(value)
    }
}

impl<T: Copy, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
