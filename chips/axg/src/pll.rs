// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! GP0, HIFI and PCIE PLLs of the Amlogic AXG/GXL family.
//!
//! These PLLs multiply the 24 MHz crystal up through a feedback divider M,
//! an input divider N and one or two power-of-two output dividers. The
//! HIFI PLL adds a signed 15-bit fractional part so audio rates land
//! exactly. Control, reset and lock status all live in the first control
//! register of each PLL's window.
//!
//! Programming follows the vendor sequence: load the factory default
//! control words, write the dividers, pulse reset, then busy-wait for the
//! lock bit.

use core::cell::Cell;

use clk_pll::bus::PllBus;
use clk_pll::error_codes::ErrorCode;
use clk_pll::field::FieldDesc;
use clk_pll::ops::PllOps;
use clk_pll::rate::{frac_for_rate, frac_rate};
use clk_pll::table::{RateEntry, RateTable};
use log::{debug, warn};

const PLL_RESET: u32 = 1 << 29;
const PLL_ENABLE: u32 = 1 << 30;
const PLL_LOCK: u32 = 1 << 31;

/// Lock polling budget, in register reads.
pub const LOCK_POLL_TRIES: u32 = 24_000_000;
const RESET_SETTLE_US: u32 = 10;

const FRAC_SCALE: i64 = 8192;
/// The fractional part must stay strictly inside this band or the PLL
/// is unstable.
const FRAC_STABLE_LIMIT: i32 = 16128;

const GXL_GP0_CNTL1: u32 = 0xc084a000;
const GXL_GP0_CNTL2: u32 = 0xb75020be;
const GXL_GP0_CNTL3: u32 = 0x0a59a288;
const GXL_GP0_CNTL4: u32 = 0xc000004d;
const GXL_GP0_CNTL5: u32 = 0x00078000;

const AXG_PCIE_PLL_CNTL: u32 = 0x400106c8;
const AXG_PCIE_PLL_CNTL1: u32 = 0x0084a2aa;
const AXG_PCIE_PLL_CNTL2: u32 = 0xb75020be;
const AXG_PCIE_PLL_CNTL3: u32 = 0x0a47488e;
const AXG_PCIE_PLL_CNTL4: u32 = 0xc000004d;
const AXG_PCIE_PLL_CNTL5: u32 = 0x00078000;
const AXG_PCIE_PLL_CNTL6: u32 = 0x002323c6;

const AXG_HIFI_PLL_CNTL1: u32 = 0xc084b000;
const AXG_HIFI_PLL_CNTL2: u32 = 0xb75020be;
const AXG_HIFI_PLL_CNTL3: u32 = 0x0a6a3a88;
const AXG_HIFI_PLL_CNTL4: u32 = 0xc000004d;
const AXG_HIFI_PLL_CNTL5: u32 = 0x000581eb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PllVariant {
    Gp0,
    Hifi,
    Pcie,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PllKind {
    /// Rates come straight from the table, requests must match exactly.
    Integer,
    /// Nearest table entry plus a fractional skew toward the request.
    Fractional,
    /// Rate readback only, the PLL is owned by firmware.
    ReadOnly,
}

struct FieldSet {
    m: FieldDesc,
    n: FieldDesc,
    od: FieldDesc,
    od2: FieldDesc,
    frac: FieldDesc,
}

struct Settings {
    m: u32,
    n: u32,
    od: u32,
    od2: u32,
    frac: i32,
}

static GP0_RATES: [RateEntry; 4] = [
    RateEntry { rate: 960_000_000, m: 40, n: 1, od: 0, od2: 0, frac: 0 },
    RateEntry { rate: 792_000_000, m: 66, n: 1, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 516_000_000, m: 43, n: 1, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 504_000_000, m: 42, n: 1, od: 1, od2: 0, frac: 0 },
];

static HIFI_RATES: [RateEntry; 3] = [
    RateEntry { rate: 1_536_000_000, m: 64, n: 1, od: 0, od2: 0, frac: 0 },
    RateEntry { rate: 491_520_000, m: 40, n: 1, od: 1, od2: 0, frac: 7864 },
    RateEntry { rate: 451_584_000, m: 37, n: 1, od: 1, od2: 0, frac: 5177 },
];

static PCIE_RATES: [RateEntry; 2] = [
    RateEntry { rate: 120_000_000, m: 40, n: 1, od: 3, od2: 0, frac: 0 },
    RateEntry { rate: 100_000_000, m: 200, n: 6, od: 3, od2: 0, frac: 0 },
];

impl PllVariant {
    fn fields(self) -> FieldSet {
        match self {
            PllVariant::Gp0 | PllVariant::Pcie => FieldSet {
                m: FieldDesc::new(0x0, 0, 9),
                n: FieldDesc::new(0x0, 9, 5),
                od: FieldDesc::new(0x0, 16, 2),
                od2: FieldDesc::absent(),
                frac: FieldDesc::absent(),
            },
            PllVariant::Hifi => FieldSet {
                m: FieldDesc::new(0x0, 0, 9),
                n: FieldDesc::new(0x0, 9, 5),
                od: FieldDesc::new(0x0, 16, 2),
                od2: FieldDesc::new(0x0, 18, 2),
                frac: FieldDesc::new(0x4, 0, 15),
            },
        }
    }

    fn rates(self) -> &'static [RateEntry] {
        match self {
            PllVariant::Gp0 => &GP0_RATES,
            PllVariant::Hifi => &HIFI_RATES,
            PllVariant::Pcie => &PCIE_RATES,
        }
    }

    /// Register (relative to the control base) that still holds its
    /// default control word once the PLL has been programmed at least
    /// once, and that word.
    fn programmed_probe(self) -> (usize, u32) {
        match self {
            PllVariant::Gp0 => (4 * 4, GXL_GP0_CNTL5),
            PllVariant::Hifi => (4 * 4, AXG_HIFI_PLL_CNTL5),
            PllVariant::Pcie => (6 * 4, AXG_PCIE_PLL_CNTL6),
        }
    }
}

pub struct MesonPll<'a, B: PllBus> {
    bus: &'a B,
    variant: PllVariant,
    kind: PllKind,
    fields: FieldSet,
    table: RateTable,
    parent_rate: Cell<u64>,
    use_lock: bool,
}

impl<'a, B: PllBus> MesonPll<'a, B> {
    /// `parent_rate` is the crystal rate feeding the PLL, used when
    /// `enable` has to pick a rate on its own. `use_lock` runs every
    /// programming sequence inside a critical section.
    pub fn new(
        bus: &'a B,
        variant: PllVariant,
        kind: PllKind,
        parent_rate: u64,
        use_lock: bool,
    ) -> Self {
        let fields = variant.fields();
        if kind == PllKind::Fractional && !fields.frac.is_present() {
            panic!("fractional PLL without a fractional field");
        }
        Self {
            bus,
            variant,
            kind,
            fields,
            table: RateTable::new(variant.rates()),
            parent_rate: Cell::new(parent_rate),
            use_lock,
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.use_lock {
            critical_section::with(|_| f())
        } else {
            f()
        }
    }

    fn control_reg(&self) -> u32 {
        self.bus.read(self.fields.n.reg)
    }

    /// Load the factory control words for this PLL. The write order is
    /// the vendor's, the first control register is loaded last for GP0
    /// and HIFI.
    fn load_defaults(&self, enable: bool) {
        let cntl = self.fields.n.reg;
        match self.variant {
            PllVariant::Pcie => {
                self.bus.write(cntl + 0 * 4, AXG_PCIE_PLL_CNTL);
                self.bus.write(cntl + 1 * 4, AXG_PCIE_PLL_CNTL1);
                self.bus.write(cntl + 2 * 4, AXG_PCIE_PLL_CNTL2);
                self.bus.write(cntl + 3 * 4, AXG_PCIE_PLL_CNTL3);
                self.bus.write(cntl + 4 * 4, AXG_PCIE_PLL_CNTL4);
                self.bus.write(cntl + 5 * 4, AXG_PCIE_PLL_CNTL5);
                self.bus.write(cntl + 6 * 4, AXG_PCIE_PLL_CNTL6);
            }
            PllVariant::Hifi => {
                self.bus.write(cntl + 6 * 4, AXG_HIFI_PLL_CNTL1);
                self.bus.write(cntl + 1 * 4, AXG_HIFI_PLL_CNTL2);
                self.bus.write(cntl + 2 * 4, AXG_HIFI_PLL_CNTL3);
                self.bus.write(cntl + 3 * 4, AXG_HIFI_PLL_CNTL4);
                self.bus.write(cntl + 4 * 4, AXG_HIFI_PLL_CNTL5);
            }
            PllVariant::Gp0 => {
                self.bus.write(cntl + 6 * 4, GXL_GP0_CNTL1);
                self.bus.write(cntl + 1 * 4, GXL_GP0_CNTL2);
                self.bus.write(cntl + 2 * 4, GXL_GP0_CNTL3);
                self.bus.write(cntl + 3 * 4, GXL_GP0_CNTL4);
                self.bus.write(cntl + 4 * 4, GXL_GP0_CNTL5);
            }
        }

        if enable {
            let reg = self.control_reg();
            self.bus
                .write(self.fields.n.reg, (reg | PLL_ENABLE) & !PLL_RESET);
        }
    }

    fn wait_lock(&self) -> Result<(), ErrorCode> {
        for _ in 0..LOCK_POLL_TRIES {
            if self.control_reg() & PLL_LOCK != 0 {
                return Ok(());
            }
        }
        Err(ErrorCode::LockTimeout)
    }

    fn current_settings(&self) -> Result<Settings, ErrorCode> {
        if self.control_reg() & PLL_ENABLE == 0 {
            return Err(ErrorCode::NotEnabled);
        }
        Ok(Settings {
            m: self.fields.m.get(self.bus),
            n: self.fields.n.get(self.bus),
            od: self.fields.od.get(self.bus),
            od2: self.fields.od2.get(self.bus),
            frac: self.fields.frac.sign_extend(self.fields.frac.get(self.bus)),
        })
    }

    fn write_dividers(&self, entry: &RateEntry, frac: i32) {
        self.fields.n.set(self.bus, entry.n as u32);
        self.fields.m.set(self.bus, entry.m as u32);
        self.fields.od.set(self.bus, entry.od as u32);
        self.fields.od2.set(self.bus, entry.od2 as u32);
        self.fields.frac.set(self.bus, frac as u32);
    }

    /// Exact-match programming used by the integer path and by `enable`.
    /// Retries the whole sequence once if the PLL misses lock.
    fn program_exact(&self, rate: u64) -> Result<(), ErrorCode> {
        let entry = self.table.exact(rate).ok_or(ErrorCode::NoRateEntry)?;

        self.with_lock(|| {
            if self.control_reg() & PLL_ENABLE != 0 {
                let old = self.recalc_rate(self.parent_rate.get());
                if self.table.ceiling(old).rate == rate {
                    return Ok(());
                }
            }

            let mut tries = 2;
            loop {
                self.load_defaults(true);
                self.write_dividers(entry, entry.frac);

                let reg = self.control_reg();
                self.bus.write(self.fields.n.reg, reg | PLL_RESET);
                self.bus.delay_us(RESET_SETTLE_US);
                self.bus.write(self.fields.n.reg, reg & !PLL_RESET);

                match self.wait_lock() {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tries -= 1;
                        if tries == 0 {
                            return Err(e);
                        }
                        warn!("pll did not lock, trying rate {} again", rate);
                    }
                }
            }
        })
    }

    fn set_rate_frac(&self, rate: u64, parent_rate: u64) -> Result<(), ErrorCode> {
        self.with_lock(|| {
            let entry = self.table.closest(rate);

            // Skew the fractional part toward the exact request. Outside
            // the stable band the table value is kept.
            let mut frac = frac_for_rate(
                rate,
                parent_rate,
                entry.m as u32,
                entry.n as u32,
                entry.od as u32,
                entry.od2 as u32,
                FRAC_SCALE,
            ) as i32;
            if frac <= -FRAC_STABLE_LIMIT || frac >= FRAC_STABLE_LIMIT {
                warn!(
                    "frac {} for rate {} outside the stable band, keeping the table value",
                    frac, rate
                );
                frac = entry.frac;
            }

            match self.current_settings() {
                Ok(cur)
                    if cur.m == entry.m as u32
                        && cur.n == entry.n as u32
                        && cur.od == entry.od as u32
                        && cur.od2 == entry.od2 as u32 =>
                {
                    // Only the fractional part moved, update it in place
                    // without a reset.
                    if cur.frac == frac {
                        return Ok(());
                    }
                    self.fields.frac.set(self.bus, frac as u32);
                    Ok(())
                }
                _ => {
                    // Dividers changed or the PLL is not running, full
                    // reprogram.
                    debug!("re-initializing the pll for rate {}", rate);
                    self.load_defaults(false);
                    self.write_dividers(entry, frac);

                    let reg = self.control_reg() | PLL_RESET | PLL_ENABLE;
                    self.bus.write(self.fields.n.reg, reg);
                    self.bus.delay_us(RESET_SETTLE_US);
                    self.bus.write(self.fields.n.reg, reg & !PLL_RESET);

                    self.wait_lock().inspect_err(|_| {
                        warn!("failed to lock the pll at rate {}", rate);
                    })
                }
            }
        })
    }
}

impl<B: PllBus> PllOps for MesonPll<'_, B> {
    fn recalc_rate(&self, parent_rate: u64) -> u64 {
        let m = self.fields.m.get(self.bus);
        let n = self.fields.n.get(self.bus);
        let od = self.fields.od.get(self.bus);
        let od2 = self.fields.od2.get(self.bus);
        let frac = self.fields.frac.sign_extend(self.fields.frac.get(self.bus));

        if n == 0 {
            // Never programmed.
            return 0;
        }
        frac_rate(parent_rate, m, n, od, od2, frac, FRAC_SCALE)
    }

    fn round_rate(&self, rate: u64, parent_rate: u64) -> u64 {
        match self.kind {
            PllKind::ReadOnly => 0,
            PllKind::Integer => self.table.ceiling(rate).rate,
            PllKind::Fractional => {
                let entry = self.table.closest(rate);
                let frac = frac_for_rate(
                    rate,
                    parent_rate,
                    entry.m as u32,
                    entry.n as u32,
                    entry.od as u32,
                    entry.od2 as u32,
                    FRAC_SCALE,
                ) as i32;
                if frac != entry.frac && frac > -FRAC_STABLE_LIMIT && frac < FRAC_STABLE_LIMIT {
                    frac_rate(
                        parent_rate,
                        entry.m as u32,
                        entry.n as u32,
                        entry.od as u32,
                        entry.od2 as u32,
                        frac,
                        FRAC_SCALE,
                    )
                } else {
                    entry.rate
                }
            }
        }
    }

    fn set_rate(&self, rate: u64, parent_rate: u64) -> Result<(), ErrorCode> {
        if rate == 0 || parent_rate == 0 {
            return Err(ErrorCode::InvalidRate);
        }
        self.parent_rate.set(parent_rate);
        match self.kind {
            PllKind::ReadOnly => Err(ErrorCode::NotSupported),
            PllKind::Integer => self.program_exact(rate),
            PllKind::Fractional => self.set_rate_frac(rate, parent_rate),
        }
    }

    fn enable(&self) -> Result<(), ErrorCode> {
        if self.kind == PllKind::ReadOnly {
            return Err(ErrorCode::NotSupported);
        }

        let rate = self.with_lock(|| {
            if self.control_reg() & PLL_ENABLE != 0 {
                return None;
            }

            let (probe, expected) = self.variant.programmed_probe();
            let first_set = self.bus.read(self.fields.n.reg + probe) != expected;

            // On the very first programming nothing in the window can be
            // trusted, start from the slowest table rate.
            Some(if first_set {
                self.table.min().rate
            } else {
                let old = self.recalc_rate(self.parent_rate.get());
                self.table.ceiling(old).rate
            })
        });

        match rate {
            None => Ok(()),
            Some(rate) => self.program_exact(rate),
        }
    }

    fn disable(&self) {
        if self.kind == PllKind::ReadOnly {
            return;
        }
        self.with_lock(|| {
            let reg = self.control_reg();
            self.bus.write(self.fields.n.reg, reg & !PLL_ENABLE);
        });
    }

    fn is_enabled(&self) -> bool {
        self.control_reg() & PLL_ENABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MesonPll, PllKind, PllVariant, AXG_HIFI_PLL_CNTL5, GXL_GP0_CNTL5, PLL_ENABLE, PLL_LOCK,
        PLL_RESET,
    };
    use clk_pll::error_codes::ErrorCode;
    use clk_pll::ops::PllOps;
    use clk_pll::sim::SimBus;

    const XTAL: u64 = 24_000_000;

    fn gp0(bus: &SimBus) -> MesonPll<'_, SimBus> {
        MesonPll::new(bus, PllVariant::Gp0, PllKind::Integer, XTAL, true)
    }

    fn hifi(bus: &SimBus) -> MesonPll<'_, SimBus> {
        MesonPll::new(bus, PllVariant::Hifi, PllKind::Fractional, XTAL, true)
    }

    #[test]
    fn recalc_decodes_dividers() {
        let bus = SimBus::new();
        // m = 40, n = 1, od = 0 -> 960 MHz from the 24 MHz crystal.
        bus.set_reg(0x0, (1 << 9) | 40);
        let pll = gp0(&bus);
        assert_eq!(pll.recalc_rate(XTAL), 960_000_000);

        // od = 1 halves the output.
        bus.set_reg(0x0, (1 << 16) | (1 << 9) | 40);
        assert_eq!(pll.recalc_rate(XTAL), 480_000_000);
    }

    #[test]
    fn recalc_of_blank_pll_is_zero() {
        let bus = SimBus::new();
        assert_eq!(gp0(&bus).recalc_rate(XTAL), 0);
    }

    #[test]
    fn integer_round_is_ceiling() {
        let bus = SimBus::new();
        let pll = gp0(&bus);
        assert_eq!(pll.round_rate(504_000_000, XTAL), 504_000_000);
        assert_eq!(pll.round_rate(505_000_000, XTAL), 516_000_000);
        assert_eq!(pll.round_rate(1, XTAL), 504_000_000);
        assert_eq!(pll.round_rate(2_000_000_000, XTAL), 960_000_000);
    }

    #[test]
    fn integer_set_rate_rejects_bad_requests() {
        let bus = SimBus::new();
        let pll = gp0(&bus);
        assert_eq!(pll.set_rate(0, XTAL), Err(ErrorCode::InvalidRate));
        assert_eq!(pll.set_rate(516_000_000, 0), Err(ErrorCode::InvalidRate));
        assert_eq!(
            pll.set_rate(505_000_000, XTAL),
            Err(ErrorCode::NoRateEntry)
        );
    }

    #[test]
    fn integer_set_rate_programs_and_locks() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = gp0(&bus);

        assert_eq!(pll.set_rate(792_000_000, XTAL), Ok(()));
        assert!(pll.is_enabled());
        assert_eq!(pll.recalc_rate(XTAL), 792_000_000);
        // One reset pulse, 10 us settle.
        assert_eq!(bus.delay_total_us(), 10);

        // Same rate again is a no-op.
        bus.reset_ledger();
        assert_eq!(pll.set_rate(792_000_000, XTAL), Ok(()));
        assert_eq!(bus.write_count(), 0);
    }

    #[test]
    fn integer_lock_timeout_retries_once() {
        let bus = SimBus::new();
        let pll = gp0(&bus);

        assert_eq!(pll.set_rate(960_000_000, XTAL), Err(ErrorCode::LockTimeout));
        // Two full sequences ran, each with one reset settle.
        assert_eq!(bus.delay_total_us(), 20);
    }

    #[test]
    fn frac_set_rate_uses_fast_path_for_frac_only_changes() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = hifi(&bus);

        assert_eq!(pll.set_rate(491_520_000, XTAL), Ok(()));
        assert!(bus.wrote_bits(0x0, PLL_RESET));

        // Nudge within the same divider setting: only the fractional
        // register may be written, no reset.
        bus.reset_ledger();
        assert_eq!(pll.set_rate(491_620_000, XTAL), Ok(()));
        assert!(!bus.wrote_bits(0x0, PLL_RESET));
        assert_eq!(bus.writes_to(0x4), 1);
        assert_eq!(bus.delay_total_us(), 0);

        let achieved = pll.recalc_rate(XTAL);
        assert!(achieved.abs_diff(491_620_000) < 1_000);

        // Same rate again changes nothing at all.
        bus.reset_ledger();
        assert_eq!(pll.set_rate(491_620_000, XTAL), Ok(()));
        assert_eq!(bus.write_count(), 0);
    }

    #[test]
    fn frac_out_of_band_keeps_table_value() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = hifi(&bus);

        // 470 MHz is 18.4 MHz from the nearest entry, the refined frac
        // would fall outside the stable band and must be discarded.
        assert_eq!(pll.set_rate(470_000_000, XTAL), Ok(()));
        let achieved = pll.recalc_rate(XTAL);
        assert!(achieved.abs_diff(451_584_000) < 10_000);
    }

    #[test]
    fn frac_round_rate_refines_within_band() {
        let bus = SimBus::new();
        let pll = hifi(&bus);
        let rounded = pll.round_rate(491_620_000, XTAL);
        assert!(rounded.abs_diff(491_620_000) < 1_000);
        // Out of band falls back to the table rate.
        assert_eq!(pll.round_rate(470_000_000, XTAL), 451_584_000);
    }

    #[test]
    fn enable_first_set_picks_slowest_rate() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = gp0(&bus);

        assert_eq!(pll.enable(), Ok(()));
        assert!(pll.is_enabled());
        assert_eq!(pll.recalc_rate(XTAL), 504_000_000);
        // Defaults were loaded, the probe register holds its control word.
        assert_eq!(bus.reg(4 * 4), GXL_GP0_CNTL5);

        // Enabling an enabled PLL does nothing.
        bus.reset_ledger();
        assert_eq!(pll.enable(), Ok(()));
        assert_eq!(bus.write_count(), 0);
    }

    #[test]
    fn enable_after_disable_restores_current_rate() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = gp0(&bus);

        assert_eq!(pll.set_rate(792_000_000, XTAL), Ok(()));
        pll.disable();
        assert!(!pll.is_enabled());
        // Settings survive the gate.
        assert_eq!(pll.recalc_rate(XTAL), 792_000_000);

        assert_eq!(pll.enable(), Ok(()));
        assert!(pll.is_enabled());
        assert_eq!(pll.recalc_rate(XTAL), 792_000_000);
    }

    #[test]
    fn hifi_defaults_load_in_vendor_order() {
        let bus = SimBus::new();
        bus.auto_lock(0x0, PLL_LOCK);
        let pll = hifi(&bus);
        assert_eq!(pll.set_rate(1_536_000_000, XTAL), Ok(()));
        assert_eq!(bus.reg(4 * 4), AXG_HIFI_PLL_CNTL5);
    }

    #[test]
    fn read_only_rejects_rate_changes() {
        let bus = SimBus::new();
        bus.set_reg(0x0, PLL_ENABLE | (1 << 9) | 40);
        let pll = MesonPll::new(&bus, PllVariant::Gp0, PllKind::ReadOnly, XTAL, false);

        assert_eq!(pll.recalc_rate(XTAL), 960_000_000);
        assert_eq!(pll.set_rate(792_000_000, XTAL), Err(ErrorCode::NotSupported));
        assert_eq!(pll.enable(), Err(ErrorCode::NotSupported));
        pll.disable();
        assert!(pll.is_enabled());
    }
}
