// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! A small virtual machine monitor built on the Linux Kernel-based Virtual
//! Machine (KVM).
//!
//! The crate instantiates a BIOS-booting virtual machine, routes guest port
//! and memory-mapped I/O to emulated device backends, and delivers interrupts
//! back to the guest, using the kernel's irqfd and ioeventfd fast paths where
//! devices ask for them. The entry point is [`Machine`]; devices implement
//! the [`devices::Device`] contract and hang off the synthetic system root.

pub mod arch;
pub mod config;
pub mod device_manager;
pub mod devices;
pub mod io_thread;
pub mod machine;
pub mod vstate;

pub use config::MachineConfig;
pub use machine::{Machine, MachineError};

#[cfg(test)]
pub(crate) mod test_utils {
    /// Tests touching the hypervisor skip quietly on hosts without /dev/kvm.
    pub fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
            && kvm_ioctls::Kvm::new().is_ok()
    }
}
