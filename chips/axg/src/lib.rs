// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Clock drivers for the Amlogic AXG/GXL SoC family.

#![no_std]

pub mod pll;
