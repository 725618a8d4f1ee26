// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The register bus interface with hardware.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;

/// Access to the register window of a single PLL.
///
/// Every register access a PLL driver performs goes through this trait,
/// which is what makes the drivers runnable on the host: unit tests hand
/// the driver a simulated bus instead of a memory-mapped one.
///
/// All `offset`s are byte offsets from the start of the PLL's register
/// window. Registers are 32 bits wide and word aligned. If a PLL's
/// registers do not start at the beginning of a hardware block, fold that
/// offset into the bus implementation, not into the driver.
///
/// The boiler plate for an implementation will look something like this
///
/// ```rust
/// use clk_pll::bus::PllBus;
///
/// struct FixedBus {
///     regs: [core::cell::Cell<u32>; 8],
/// }
///
/// impl PllBus for FixedBus {
///     fn read(&self, offset: usize) -> u32 {
///         self.regs[offset / 4].get()
///     }
///
///     fn write(&self, offset: usize, value: u32) {
///         self.regs[offset / 4].set(value);
///     }
///
///     fn delay_us(&self, _us: u32) {}
/// }
/// ```
pub trait PllBus {
    /// Read the 32-bit register at `offset` bytes into the window.
    fn read(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset` bytes into the window.
    fn write(&self, offset: usize, value: u32);

    /// Busy-wait for at least `us` microseconds.
    ///
    /// Programming sequences use this for the settle time between a
    /// divider write and releasing reset. Implementations must not sleep.
    fn delay_us(&self, us: u32);
}

/// A [`PllBus`] over a memory-mapped register window.
pub struct MmioBus {
    base: *const ReadWrite<u32>,
    words: usize,
    cycles_per_us: u32,
}

impl MmioBus {
    /// Create a bus over `words` consecutive 32-bit registers at `base`.
    ///
    /// `cycles_per_us` calibrates [`PllBus::delay_us`] to the core clock
    /// driving the busy-wait loop.
    ///
    /// # Safety
    ///
    /// `base` must point to `words` mapped, word-aligned device registers
    /// that remain valid for the lifetime of the bus, and nothing else may
    /// alias them as ordinary memory.
    pub const unsafe fn new(base: *const ReadWrite<u32>, words: usize, cycles_per_us: u32) -> Self {
        Self {
            base,
            words,
            cycles_per_us,
        }
    }
}

impl PllBus for MmioBus {
    fn read(&self, offset: usize) -> u32 {
        let index = offset / 4;
        if index >= self.words {
            panic!("register offset {:#x} outside PLL window", offset);
        }
        unsafe { (*self.base.add(index)).get() }
    }

    fn write(&self, offset: usize, value: u32) {
        let index = offset / 4;
        if index >= self.words {
            panic!("register offset {:#x} outside PLL window", offset);
        }
        unsafe { (*self.base.add(index)).set(value) }
    }

    fn delay_us(&self, us: u32) {
        for _ in 0..us.saturating_mul(self.cycles_per_us) {
            core::hint::spin_loop();
        }
    }
}
