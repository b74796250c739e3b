// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical memory layout for x86_64.

pub const PAGE_SIZE: u64 = 4096;

/// Base of the four reserved pages holding the EPT identity map and the TSS
/// scratch area. Placed just under the BIOS so images of up to 16M fit.
pub const IDENTITY_MAP_ADDR: u64 = 0xfeff_c000;

/// The TSS scratch area sits one page above the identity map.
pub const TSS_ADDRESS: u64 = IDENTITY_MAP_ADDR + 0x1000;

/// End of the first megabyte; the BIOS image ends here.
pub const BIOS_LOW_LIMIT: u64 = 0x10_0000;

/// End of the 32-bit physical address space; the BIOS shadow ends here so the
/// reset vector at 0xFFFFFFF0 lands inside it.
pub const BIOS_HIGH_LIMIT: u64 = 0x1_0000_0000;

/// Largest BIOS image the low mapping can take.
pub const MAX_BIOS_SIZE: u64 = BIOS_LOW_LIMIT;

/// Start of the 32-bit MMIO hole. RAM that does not fit below this line is
/// mapped past the 4G boundary instead.
pub const MMIO_GAP_START: u64 = 0xc000_0000;

/// First guest address above the 32-bit space.
pub const FIRST_ADDR_PAST_32BITS: u64 = 0x1_0000_0000;
