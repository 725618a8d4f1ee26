// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! PLL1416x and PLL1443x synthesizers of the NXP i.MX8M family.
//!
//! Both variants share a three-register window: a general control word
//! with bypass, reset and lock status, and two divider registers holding
//! the feedback divider m, the input divider p and the power-of-two
//! output divider s. The 1443x adds a signed 16-bit fractional divider k
//! in the second divider register. Its skewable flavour retunes k while
//! the PLL is running, which audio and video links use to chase a
//! reference without a reset glitch.
//!
//! Reprogramming runs bypassed: drop reset, write the dividers, wait the
//! settle time, release reset and busy-wait for lock before leaving
//! bypass.

use clk_pll::bus::PllBus;
use clk_pll::error_codes::ErrorCode;
use clk_pll::field::FieldDesc;
use clk_pll::ops::PllOps;
use clk_pll::rate::{div_round_closest, frac_for_rate};
use clk_pll::table::{RateEntry, RateTable};
use log::{debug, error, warn};

const GNRL_CTL: usize = 0x0;
const DIV_CTL0: usize = 0x4;
const DIV_CTL1: usize = 0x8;

const LOCK_STATUS: u32 = 1 << 31;
const LOCK_SEL: u32 = 1 << 29;
const RST: u32 = 1 << 9;
const BYPASS: u32 = 1 << 4;

const MDIV: FieldDesc = FieldDesc::new(DIV_CTL0, 12, 10);
const PDIV: FieldDesc = FieldDesc::new(DIV_CTL0, 4, 6);
const SDIV: FieldDesc = FieldDesc::new(DIV_CTL0, 0, 3);
const KDIV: FieldDesc = FieldDesc::new(DIV_CTL1, 0, 16);
const KDIV_MASK: u32 = 0xffff;

/// Lock polling budget, in microseconds.
pub const LOCK_TIMEOUT_US: u32 = 10_000;
/// The divider inputs need at least 1 us and one reference period before
/// reset deasserts. The reference can be as slow as FIN / 63.
const DIVIDER_SETTLE_US: u32 = 3;

const KDIV_SCALE: i64 = 65536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PllType {
    /// Integer PLL, requests must match a table rate exactly.
    Pll1416x,
    /// Integer PLL owned by firmware, rate readback only.
    Pll1416xReadOnly,
    /// Fractional PLL with a signed 16-bit k divider.
    Pll1443x,
    /// Fractional PLL whose k divider is retuned without a reset.
    Pll1443xSkewable,
}

static PLL1416X_RATES: [RateEntry; 10] = [
    RateEntry { rate: 1_800_000_000, m: 225, n: 3, od: 0, od2: 0, frac: 0 },
    RateEntry { rate: 1_600_000_000, m: 200, n: 3, od: 0, od2: 0, frac: 0 },
    RateEntry { rate: 1_500_000_000, m: 375, n: 3, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 1_400_000_000, m: 350, n: 3, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 1_200_000_000, m: 300, n: 3, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 1_000_000_000, m: 250, n: 3, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 800_000_000, m: 200, n: 3, od: 1, od2: 0, frac: 0 },
    RateEntry { rate: 750_000_000, m: 250, n: 2, od: 2, od2: 0, frac: 0 },
    RateEntry { rate: 700_000_000, m: 350, n: 3, od: 2, od2: 0, frac: 0 },
    RateEntry { rate: 600_000_000, m: 300, n: 3, od: 2, od2: 0, frac: 0 },
];

static PLL1443X_RATES: [RateEntry; 6] = [
    RateEntry { rate: 1_039_500_000, m: 173, n: 2, od: 1, od2: 0, frac: 16384 },
    RateEntry { rate: 650_000_000, m: 325, n: 3, od: 2, od2: 0, frac: 0 },
    RateEntry { rate: 594_000_000, m: 198, n: 2, od: 2, od2: 0, frac: 0 },
    RateEntry { rate: 519_750_000, m: 173, n: 2, od: 2, od2: 0, frac: 16384 },
    RateEntry { rate: 393_216_000, m: 262, n: 2, od: 3, od2: 0, frac: 9437 },
    RateEntry { rate: 361_267_200, m: 361, n: 3, od: 3, od2: 0, frac: 17511 },
];

/// Output rate of a 1443x:
///
/// ```text
///                  m * 65536 + k
/// fout = parent * ---------------
///                 p * 65536 * 2^s
/// ```
fn rate_1443x(parent: u64, m: u32, p: u32, s: u32, k: i32) -> u64 {
    let fvco = parent as i64 * (m as i64 * KDIV_SCALE + k as i64);
    div_round_closest(fvco, (p as i64 * KDIV_SCALE) << s) as u64
}

fn div_ctl0_word(entry: &RateEntry) -> u32 {
    ((entry.m as u32) << MDIV.shift)
        | ((entry.n as u32) << PDIV.shift)
        | ((entry.od as u32) << SDIV.shift)
}

pub struct Pll14xx<'a, B: PllBus> {
    bus: &'a B,
    pll_type: PllType,
    table: RateTable,
    use_lock: bool,
}

impl<'a, B: PllBus> Pll14xx<'a, B> {
    /// `use_lock` runs every programming sequence inside a critical
    /// section. Construction drops the bypass the boot ROM may have left
    /// behind.
    pub fn new(bus: &'a B, pll_type: PllType, use_lock: bool) -> Self {
        let rates: &'static [RateEntry] = match pll_type {
            PllType::Pll1416x | PllType::Pll1416xReadOnly => &PLL1416X_RATES,
            PllType::Pll1443x | PllType::Pll1443xSkewable => &PLL1443X_RATES,
        };
        let val = bus.read(GNRL_CTL);
        bus.write(GNRL_CTL, val & !BYPASS);
        Self {
            bus,
            pll_type,
            table: RateTable::new(rates),
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

    fn wait_lock(&self) -> Result<(), ErrorCode> {
        for _ in 0..LOCK_TIMEOUT_US {
            if self.bus.read(GNRL_CTL) & LOCK_STATUS != 0 {
                return Ok(());
            }
            self.bus.delay_us(1);
        }
        Err(ErrorCode::LockTimeout)
    }

    fn set_rate_integer(&self, rate: u64) -> Result<(), ErrorCode> {
        let entry = match self.table.exact(rate) {
            Some(entry) => entry,
            None => {
                error!("no divider setting for rate {}", rate);
                return Err(ErrorCode::NoRateEntry);
            }
        };

        self.with_lock(|| {
            if entry.same_mn(MDIV.get(self.bus), PDIV.get(self.bus)) {
                // Feedback and input dividers hold, only the output
                // scaling moves. No reset needed.
                SDIV.set(self.bus, entry.od as u32);
                return Ok(());
            }

            let mut tmp = self.bus.read(GNRL_CTL);
            tmp |= LOCK_SEL;
            self.bus.write(GNRL_CTL, tmp);
            tmp &= !RST;
            self.bus.write(GNRL_CTL, tmp);
            tmp |= BYPASS;
            self.bus.write(GNRL_CTL, tmp);

            self.bus.write(DIV_CTL0, div_ctl0_word(entry));
            self.bus.delay_us(DIVIDER_SETTLE_US);

            tmp |= RST;
            self.bus.write(GNRL_CTL, tmp);
            self.wait_lock()?;
            tmp &= !BYPASS;
            self.bus.write(GNRL_CTL, tmp);
            Ok(())
        })
    }

    fn set_rate_frac(&self, rate: u64) -> Result<(), ErrorCode> {
        let entry = match self.table.exact(rate) {
            Some(entry) => entry,
            None => {
                error!("no divider setting for rate {}", rate);
                return Err(ErrorCode::NoRateEntry);
            }
        };

        self.with_lock(|| {
            if entry.same_mn(MDIV.get(self.bus), PDIV.get(self.bus)) {
                SDIV.set(self.bus, entry.od as u32);
                self.bus.write(DIV_CTL1, entry.frac as u32 & KDIV_MASK);
                return Ok(());
            }

            let mut tmp = self.bus.read(GNRL_CTL);
            tmp &= !RST;
            self.bus.write(GNRL_CTL, tmp);
            tmp |= BYPASS;
            self.bus.write(GNRL_CTL, tmp);

            self.bus.write(DIV_CTL0, div_ctl0_word(entry));
            self.bus.write(DIV_CTL1, entry.frac as u32 & KDIV_MASK);
            self.bus.delay_us(DIVIDER_SETTLE_US);

            tmp |= RST;
            self.bus.write(GNRL_CTL, tmp);
            self.wait_lock()?;
            tmp &= !BYPASS;
            self.bus.write(GNRL_CTL, tmp);
            Ok(())
        })
    }

    fn set_rate_skewable(&self, rate: u64, parent_rate: u64) -> Result<(), ErrorCode> {
        self.with_lock(|| {
            let entry = self.table.closest(rate);

            // Retune k toward the exact request. Outside the signed
            // 16-bit range the table value is kept.
            let mut frac = frac_for_rate(
                rate,
                parent_rate,
                entry.m as u32,
                entry.n as u32,
                entry.od as u32,
                0,
                KDIV_SCALE,
            );
            if frac < i16::MIN as i64 || frac > i16::MAX as i64 {
                warn!("k {} for rate {} is out of range, keeping the table value", frac, rate);
                frac = entry.frac as i64;
            }
            let k = frac as u32 & KDIV_MASK;

            let old_m = MDIV.get(self.bus);
            let old_p = PDIV.get(self.bus);
            let old_s = SDIV.get(self.bus);
            let old_k = KDIV.get(self.bus);

            let mps_change = old_m != entry.m as u32
                || old_p != entry.n as u32
                || old_s != entry.od as u32;

            if mps_change {
                debug!("dividers moved, pulsing reset for rate {}", rate);
                let mut tmp = self.bus.read(GNRL_CTL) & !RST;
                self.bus.write(GNRL_CTL, tmp);
                self.bus.write(DIV_CTL0, div_ctl0_word(entry));
                if old_k != k {
                    self.bus.write(DIV_CTL1, k);
                }
                tmp |= RST;
                self.bus.write(GNRL_CTL, tmp);
                self.wait_lock()?;
                self.bus.write(GNRL_CTL, tmp & !BYPASS);
            } else if old_k != k {
                // Hot retune, k alone moves without a reset.
                self.bus.write(DIV_CTL1, k);
            }
            Ok(())
        })
    }

    /// Nudge the running fractional divider by `delta_k` steps.
    /// Saturates at the ends of the signed 16-bit range. Only meaningful
    /// for the 1443x types.
    pub fn set_delta_k(&self, delta_k: i16) {
        let k = KDIV.sign_extend(KDIV.get(self.bus));
        let k = (k + delta_k as i32).clamp(i16::MIN as i32, i16::MAX as i32);
        self.bus.write(DIV_CTL1, k as u32 & KDIV_MASK);
    }

    /// Raw readback of both divider registers, for diagnostics.
    pub fn pll_setting(&self) -> (u32, u32) {
        (self.bus.read(DIV_CTL0), self.bus.read(DIV_CTL1))
    }
}

impl<B: PllBus> PllOps for Pll14xx<'_, B> {
    fn recalc_rate(&self, parent_rate: u64) -> u64 {
        let m = MDIV.get(self.bus);
        let p = PDIV.get(self.bus);
        let s = SDIV.get(self.bus);
        if p == 0 {
            // Never programmed.
            return 0;
        }
        match self.pll_type {
            PllType::Pll1416x | PllType::Pll1416xReadOnly => {
                parent_rate * m as u64 / ((p as u64) << s)
            }
            PllType::Pll1443x | PllType::Pll1443xSkewable => {
                let k = KDIV.sign_extend(KDIV.get(self.bus));
                // The k part makes the formula land a few Hz off the
                // nominal rates, prefer the table entry matching the
                // readback.
                match self.table.by_settings(m, p, s, k) {
                    Some(entry) => entry.rate,
                    None => rate_1443x(parent_rate, m, p, s, k),
                }
            }
        }
    }

    fn round_rate(&self, rate: u64, parent_rate: u64) -> u64 {
        match self.pll_type {
            PllType::Pll1416xReadOnly => 0,
            PllType::Pll1416x | PllType::Pll1443x => self.table.ceiling(rate).rate,
            PllType::Pll1443xSkewable => {
                let entry = self.table.closest(rate);
                let mut frac = frac_for_rate(
                    rate,
                    parent_rate,
                    entry.m as u32,
                    entry.n as u32,
                    entry.od as u32,
                    0,
                    KDIV_SCALE,
                );
                if frac < i16::MIN as i64 || frac > i16::MAX as i64 {
                    warn!("k {} for rate {} is out of range, keeping the table value", frac, rate);
                    frac = entry.frac as i64;
                }
                rate_1443x(
                    parent_rate,
                    entry.m as u32,
                    entry.n as u32,
                    entry.od as u32,
                    frac as i32,
                )
            }
        }
    }

    fn set_rate(&self, rate: u64, parent_rate: u64) -> Result<(), ErrorCode> {
        if rate == 0 || parent_rate == 0 {
            return Err(ErrorCode::InvalidRate);
        }
        match self.pll_type {
            PllType::Pll1416xReadOnly => Err(ErrorCode::NotSupported),
            PllType::Pll1416x => self.set_rate_integer(rate),
            PllType::Pll1443x => self.set_rate_frac(rate),
            PllType::Pll1443xSkewable => self.set_rate_skewable(rate, parent_rate),
        }
    }

    fn enable(&self) -> Result<(), ErrorCode> {
        if self.pll_type == PllType::Pll1416xReadOnly {
            return Err(ErrorCode::NotSupported);
        }
        self.with_lock(|| {
            let mut val = self.bus.read(GNRL_CTL);
            if val & RST != 0 {
                // Already running.
                return Ok(());
            }
            val |= BYPASS;
            self.bus.write(GNRL_CTL, val);
            val |= RST;
            self.bus.write(GNRL_CTL, val);
            self.wait_lock()?;
            val &= !BYPASS;
            self.bus.write(GNRL_CTL, val);
            Ok(())
        })
    }

    fn disable(&self) {
        if self.pll_type == PllType::Pll1416xReadOnly {
            return;
        }
        self.with_lock(|| {
            // Reset low is power-down, every digital block is held in
            // reset.
            let val = self.bus.read(GNRL_CTL);
            self.bus.write(GNRL_CTL, val & !RST);
        });
    }

    fn is_enabled(&self) -> bool {
        self.bus.read(GNRL_CTL) & RST != 0
    }
}
