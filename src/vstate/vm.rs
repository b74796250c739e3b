// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Wrapper over the per-VM KVM file descriptor.
//!
//! Every kernel request the core issues on the VM handle goes through this
//! type, so the rest of the crate never touches raw ioctls. The fd is shared
//! across all worker threads; KVM guarantees requests on it are thread safe.

use kvm_bindings::{
    kvm_irq_routing_entry, kvm_msi, kvm_pit_config, kvm_userspace_memory_region, KvmIrqRouting,
};
use kvm_ioctls::{IoEventAddress, NoDatamatch, VcpuFd, VmFd};
use vmm_sys_util::eventfd::EventFd;

use crate::vstate::kvm::Kvm;

/// Errors covering every KVM request issued on the VM handle. All of these are
/// fatal to the machine: the kernel has no recovery path for a half-applied
/// request.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VmError {
    /// Failed to create the VM fd: {0}
    CreateVm(kvm_ioctls::Error),
    /// KVM_SET_IDENTITY_MAP_ADDR failed: {0}
    SetIdentityMap(kvm_ioctls::Error),
    /// KVM_SET_TSS_ADDR failed: {0}
    SetTssAddress(kvm_ioctls::Error),
    /// KVM_CREATE_IRQCHIP failed: {0}
    CreateIrqChip(kvm_ioctls::Error),
    /// KVM_CREATE_PIT2 failed: {0}
    CreatePit(kvm_ioctls::Error),
    /// KVM_IRQ_LINE failed: {0}
    IrqLine(kvm_ioctls::Error),
    /// KVM_SIGNAL_MSI failed: {0}
    SignalMsi(kvm_ioctls::Error),
    /// KVM_SET_GSI_ROUTING failed: {0}
    SetGsiRouting(kvm_ioctls::Error),
    /// KVM_IRQFD failed: {0}
    Irqfd(kvm_ioctls::Error),
    /// KVM_IOEVENTFD failed: {0}
    Ioeventfd(kvm_ioctls::Error),
    /// Cannot build the routing table payload: {0}
    FamStruct(vmm_sys_util::fam::Error),
    /// A data match of {0} bytes is not supported
    DatamatchLength(u32),
    /// Cannot register a guest memory slot: {0}
    SetUserMemoryRegion(kvm_ioctls::Error),
    /// Cannot create a vCPU fd: {0}
    CreateVcpu(kvm_ioctls::Error),
}

/// Address space an event fd binding covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventSpace {
    Pio,
    Mmio,
}

/// A KVM virtual machine.
#[derive(Debug)]
pub struct Vm {
    fd: VmFd,
}

impl Vm {
    pub fn new(kvm: &Kvm) -> Result<Vm, VmError> {
        let fd = kvm.fd.create_vm().map_err(VmError::CreateVm)?;
        Ok(Vm { fd })
    }

    pub fn fd(&self) -> &VmFd {
        &self.fd
    }

    /// Moves the EPT identity map out of the default low-memory location so
    /// large BIOS images fit below it.
    #[cfg(target_arch = "x86_64")]
    pub fn set_identity_map(&self, address: u64) -> Result<(), VmError> {
        self.fd
            .set_identity_map_address(address)
            .map_err(VmError::SetIdentityMap)
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_tss(&self, address: u64) -> Result<(), VmError> {
        self.fd
            .set_tss_address(address as usize)
            .map_err(VmError::SetTssAddress)
    }

    /// Creates the in-kernel interrupt controllers (PIC master/slave and
    /// IOAPIC). Must run before any vCPU is created.
    #[cfg(target_arch = "x86_64")]
    pub fn create_irqchip(&self) -> Result<(), VmError> {
        self.fd.create_irq_chip().map_err(VmError::CreateIrqChip)
    }

    /// Creates the in-kernel PIT. The dummy speaker stub keeps port 0x61
    /// writes from exiting to userspace.
    #[cfg(target_arch = "x86_64")]
    pub fn create_pit(&self) -> Result<(), VmError> {
        let pit_config = kvm_pit_config {
            flags: kvm_bindings::KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        self.fd.create_pit2(pit_config).map_err(VmError::CreatePit)
    }

    /// Asserts or deasserts a legacy interrupt line.
    pub fn set_irq_line(&self, irq: u32, level: bool) -> Result<(), VmError> {
        self.fd.set_irq_line(irq, level).map_err(VmError::IrqLine)
    }

    /// Injects a message-signaled interrupt. No routing table entry is
    /// required for direct injection.
    pub fn signal_msi(&self, address: u64, data: u32) -> Result<(), VmError> {
        let msi = kvm_msi {
            address_lo: address as u32,
            address_hi: (address >> 32) as u32,
            data,
            ..Default::default()
        };
        // A zero return only means no CPU was listening; the injection itself
        // succeeded.
        self.fd.signal_msi(msi).map_err(VmError::SignalMsi)?;
        Ok(())
    }

    /// Replaces the kernel's GSI routing table with `entries`. The kernel
    /// applies the table atomically or not at all.
    pub fn set_gsi_routes(&self, entries: &[kvm_irq_routing_entry]) -> Result<(), VmError> {
        let routing = KvmIrqRouting::from_entries(entries).map_err(VmError::FamStruct)?;
        self.fd
            .set_gsi_routing(&routing)
            .map_err(VmError::SetGsiRouting)
    }

    pub fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<(), VmError> {
        self.fd.register_irqfd(fd, gsi).map_err(VmError::Irqfd)
    }

    pub fn unregister_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<(), VmError> {
        self.fd.unregister_irqfd(fd, gsi).map_err(VmError::Irqfd)
    }

    /// Binds `fd` to guest writes at `address`. A `length` of zero disables
    /// data matching; otherwise only writes of exactly `length` bytes equal to
    /// `datamatch` are absorbed by the kernel.
    pub fn register_ioevent(
        &self,
        fd: &EventFd,
        space: IoEventSpace,
        address: u64,
        length: u32,
        datamatch: u64,
    ) -> Result<(), VmError> {
        let addr = Self::ioevent_address(space, address);
        let res = match length {
            0 => self.fd.register_ioevent(fd, &addr, NoDatamatch),
            1 => self.fd.register_ioevent(fd, &addr, datamatch as u8),
            2 => self.fd.register_ioevent(fd, &addr, datamatch as u16),
            4 => self.fd.register_ioevent(fd, &addr, datamatch as u32),
            8 => self.fd.register_ioevent(fd, &addr, datamatch),
            other => return Err(VmError::DatamatchLength(other)),
        };
        res.map_err(VmError::Ioeventfd)
    }

    /// Removes a binding installed by [`Vm::register_ioevent`]. The arguments
    /// must match the registration exactly.
    pub fn unregister_ioevent(
        &self,
        fd: &EventFd,
        space: IoEventSpace,
        address: u64,
        length: u32,
        datamatch: u64,
    ) -> Result<(), VmError> {
        let addr = Self::ioevent_address(space, address);
        let res = match length {
            0 => self.fd.unregister_ioevent(fd, &addr, NoDatamatch),
            1 => self.fd.unregister_ioevent(fd, &addr, datamatch as u8),
            2 => self.fd.unregister_ioevent(fd, &addr, datamatch as u16),
            4 => self.fd.unregister_ioevent(fd, &addr, datamatch as u32),
            8 => self.fd.unregister_ioevent(fd, &addr, datamatch),
            other => return Err(VmError::DatamatchLength(other)),
        };
        res.map_err(VmError::Ioeventfd)
    }

    fn ioevent_address(space: IoEventSpace, address: u64) -> IoEventAddress {
        match space {
            IoEventSpace::Pio => IoEventAddress::Pio(address),
            IoEventSpace::Mmio => IoEventAddress::Mmio(address),
        }
    }

    /// Registers a guest memory slot.
    ///
    /// # Safety
    ///
    /// `region.userspace_addr` must point at a host mapping of at least
    /// `region.memory_size` bytes that stays valid for the life of the VM.
    pub unsafe fn set_user_memory_region(
        &self,
        region: kvm_userspace_memory_region,
    ) -> Result<(), VmError> {
        self.fd
            .set_user_memory_region(region)
            .map_err(VmError::SetUserMemoryRegion)
    }

    pub fn create_vcpu(&self, index: u8) -> Result<VcpuFd, VmError> {
        self.fd
            .create_vcpu(u64::from(index))
            .map_err(VmError::CreateVcpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_manager::interrupts::GsiRoutingTable;
    use crate::test_utils::kvm_available;

    fn setup_vm() -> Option<Vm> {
        if !kvm_available() {
            return None;
        }
        let kvm = Kvm::new().unwrap();
        Some(Vm::new(&kvm).unwrap())
    }

    #[test]
    fn test_arch_setup() {
        let Some(vm) = setup_vm() else { return };
        vm.set_identity_map(crate::arch::IDENTITY_MAP_ADDR).unwrap();
        vm.set_tss(crate::arch::TSS_ADDRESS).unwrap();
        vm.create_irqchip().unwrap();
        vm.create_pit().unwrap();
    }

    #[test]
    fn test_set_gsi_routes() {
        let Some(vm) = setup_vm() else { return };
        vm.create_irqchip().unwrap();
        let table = GsiRoutingTable::with_legacy_routes();
        vm.set_gsi_routes(table.entries()).unwrap();
    }

    #[test]
    fn test_irq_line_and_msi() {
        let Some(vm) = setup_vm() else { return };
        vm.create_irqchip().unwrap();
        vm.set_irq_line(4, true).unwrap();
        vm.set_irq_line(4, false).unwrap();
        vm.signal_msi(0xfee0_0000, 0x30).unwrap();
    }

    #[test]
    fn test_irqfd_roundtrip() {
        let Some(vm) = setup_vm() else { return };
        vm.create_irqchip().unwrap();
        let fd = EventFd::new(0).unwrap();
        vm.register_irqfd(&fd, 5).unwrap();
        vm.unregister_irqfd(&fd, 5).unwrap();
    }

    #[test]
    fn test_ioevent_roundtrip() {
        let Some(vm) = setup_vm() else { return };
        let fd = EventFd::new(0).unwrap();

        // With data match.
        vm.register_ioevent(&fd, IoEventSpace::Mmio, 0xc000, 2, 0x1)
            .unwrap();
        vm.unregister_ioevent(&fd, IoEventSpace::Mmio, 0xc000, 2, 0x1)
            .unwrap();

        // Without data match, PIO.
        vm.register_ioevent(&fd, IoEventSpace::Pio, 0x61, 0, 0).unwrap();
        vm.unregister_ioevent(&fd, IoEventSpace::Pio, 0x61, 0, 0)
            .unwrap();

        // Bad data match length is rejected before reaching the kernel.
        assert!(matches!(
            vm.register_ioevent(&fd, IoEventSpace::Pio, 0x61, 3, 0),
            Err(VmError::DatamatchLength(3))
        ));
    }
}
