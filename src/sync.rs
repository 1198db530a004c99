//! Interrupt-safe spinlocks.
//!
//! Every lock in the allocator may be taken from interrupt context, so the
//! guard pairs the busy-wait acquisition with a local interrupt gate: the
//! prior interrupt state is captured on acquisition and restored on release,
//! which keeps nested critical sections from re-enabling interrupts early.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Local-CPU interrupt gate.
///
/// Real `cli`/`sti` gating is only meaningful in ring 0 and therefore sits
/// behind the `hw-irq` feature; hosted builds get a no-op gate so the lock
/// logic stays exercisable from user space.
mod arch {
    #[cfg(all(target_arch = "x86_64", feature = "hw-irq"))]
    pub fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nostack, preserves_flags))
        }
        rflags & (1 << 9) != 0
    }

    #[cfg(all(target_arch = "x86_64", feature = "hw-irq"))]
    pub fn disable_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[cfg(all(target_arch = "x86_64", feature = "hw-irq"))]
    pub fn enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[cfg(not(all(target_arch = "x86_64", feature = "hw-irq")))]
    pub fn interrupts_enabled() -> bool {
        false
    }

    #[cfg(not(all(target_arch = "x86_64", feature = "hw-irq")))]
    pub fn disable_interrupts() {}

    #[cfg(not(all(target_arch = "x86_64", feature = "hw-irq")))]
    pub fn enable_interrupts() {}
}

/// A busy-wait spinlock that disables local interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Access to `data` only happens through a held guard.
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Disables local interrupts, acquires the lock and returns a guard
    /// that undoes both in reverse order when dropped.
    pub fn lock(&self) -> IrqSpinGuard<'_, T> {
        let was_enabled = arch::interrupts_enabled();
        if was_enabled {
            arch::disable_interrupts();
        }

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqSpinGuard {
            lock: self,
            was_enabled,
        }
    }
}

/// Guard for [`IrqSpinLock`]; releasing it restores the interrupt state
/// that was active before the acquisition.
pub struct IrqSpinGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    was_enabled: bool,
}

impl<'a, T> Deref for IrqSpinGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqSpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqSpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.was_enabled {
            arch::enable_interrupts();
        }
    }
}
