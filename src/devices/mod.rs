// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! The contract emulated devices must satisfy, plus the synthetic devices the
//! machine itself provides.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

pub mod resource;
pub mod system_root;

pub use resource::{IoResource, IoResourceKind};
pub use system_root::{DebugConsole, SystemRoot};

use crate::device_manager::{DeviceManager, DeviceManagerError};

/// Errors a device may raise while being wired into the machine.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DeviceError {
    /// I/O error: {0}
    Io(#[from] std::io::Error),
    /// Device manager error: {0}
    Manager(#[from] Box<DeviceManagerError>),
}

/// PCI coordinates of a device that is also a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u16,
    pub devfn: u8,
}

/// An emulated device.
///
/// Devices form an ownership tree rooted at the synthetic
/// [`SystemRoot`]; the device manager walks the tree to connect, reset and
/// disconnect them. `read` and `write` run on the trapping vCPU worker's
/// thread with the device's own mutex held, so they must not block on guest
/// progress; they are also infallible by contract, a broken device panics.
pub trait Device: Send + Debug {
    /// Human readable, unique across the machine.
    fn name(&self) -> &str;

    /// The PIO/MMIO/RAM ranges this device claims. Handlers for them are
    /// registered when the device is connected and removed when it is
    /// disconnected.
    fn io_resources(&self) -> Vec<IoResource> {
        Vec::new()
    }

    /// Devices owned by this one. Connected after, disconnected before.
    fn children(&self) -> Vec<Arc<Mutex<dyn Device>>> {
        Vec::new()
    }

    /// Kernel-side and manager-side setup beyond plain handler registration
    /// (event fd fast paths, MSI routes). Called once while the device is
    /// being attached.
    fn connect(&mut self, _manager: &DeviceManager) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Inverse of [`Device::connect`]. Must tolerate a partially connected
    /// device.
    fn disconnect(&mut self, _manager: &DeviceManager) {}

    /// Drives all device state back to its power-on values.
    fn reset(&mut self) {}

    /// Satisfies a guest read at `resource.base + offset`. The device must
    /// fill all of `data`; unmodeled bits read as all-ones.
    fn read(&mut self, _resource: &IoResource, _offset: u64, data: &mut [u8]) {
        data.fill(0xff);
    }

    /// Satisfies a guest write at `resource.base + offset`. Side effects may
    /// include calling back into the device manager (`set_irq`, `signal_msi`).
    fn write(&mut self, _resource: &IoResource, _offset: u64, _data: &[u8]) {}

    /// Capability query: the device's PCI coordinates, if it is a PCI
    /// function.
    fn pci_address(&self) -> Option<PciAddress> {
        None
    }
}

/// Instantiates a device from its configuration class name.
pub fn create_device(class: &str) -> Option<Arc<Mutex<dyn Device>>> {
    match class {
        "debug-console" => Some(Arc::new(Mutex::new(DebugConsole::new()))),
        _ => None,
    }
}

/// Whether `class` names a device this build knows how to create.
pub fn is_known_class(class: &str) -> bool {
    matches!(class, "debug-console")
}
