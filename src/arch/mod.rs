// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Architecture-specific guest layout.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;
