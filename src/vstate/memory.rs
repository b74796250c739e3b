// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical memory management.
//!
//! Maps host buffers into guest physical address space and answers GPA to
//! host-address translation queries. RAM and reserved regions are backed by
//! anonymous host mappings and registered as KVM memory slots; device regions
//! are bookkeeping only, so guest accesses to them fault into MMIO exits.

use std::sync::{Arc, Mutex};

use kvm_bindings::kvm_userspace_memory_region;
use vm_memory::MmapRegion;

use crate::arch::PAGE_SIZE;
use crate::vstate::vm::{Vm, VmError};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MemoryError {
    /// Region size must be a non-zero multiple of the page size, got {0:#x}
    InvalidSize(u64),
    /// Cannot allocate a host backing: {0}
    Mmap(vm_memory::mmap::MmapRegionError),
    /// KVM error: {0}
    Vm(#[from] VmError),
    /// No device region mapped at {0:#x}
    NoDeviceRegion(u64),
}

/// What a guest physical range is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Normal RAM, backed by a KVM slot.
    Ram,
    /// Device registers; accesses trap to the MMIO dispatcher.
    Device,
    /// Backed but never handed to the guest as usable memory.
    Reserved,
}

#[derive(Debug)]
struct MemoryRegion {
    name: &'static str,
    kind: MemoryKind,
    gpa: u64,
    size: u64,
    /// Host virtual address of the backing, when there is one.
    hva: Option<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    regions: Vec<MemoryRegion>,
    /// Anonymous backings allocated by this manager. Kept only so the
    /// mappings outlive their KVM slots.
    backings: Vec<MmapRegion>,
    next_slot: u32,
}

/// The machine's memory manager.
#[derive(Debug)]
pub struct MemoryManager {
    vm: Arc<Vm>,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    pub fn new(vm: Arc<Vm>) -> MemoryManager {
        MemoryManager {
            vm,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Maps `size` bytes of fresh anonymous memory at `gpa` as guest RAM.
    pub fn map_ram(&self, gpa: u64, size: u64, name: &'static str) -> Result<(), MemoryError> {
        self.map_backed(gpa, size, None, MemoryKind::Ram, name)
    }

    /// Maps an existing host buffer at `gpa` as guest RAM. The same buffer may
    /// be mapped at several guest addresses (the BIOS shadow uses this).
    ///
    /// # Safety
    ///
    /// `host` must point to at least `size` bytes that remain valid and
    /// exclusively owned by the caller for the life of the VM.
    pub unsafe fn map_ram_backed(
        &self,
        gpa: u64,
        size: u64,
        host: *mut u8,
        name: &'static str,
    ) -> Result<(), MemoryError> {
        self.map_backed(gpa, size, Some(host as u64), MemoryKind::Ram, name)
    }

    /// Maps `size` bytes of zeroed memory at `gpa`, reserved from the guest's
    /// point of view (used for the EPT identity map and TSS scratch pages).
    pub fn map_reserved(&self, gpa: u64, size: u64, name: &'static str) -> Result<(), MemoryError> {
        self.map_backed(gpa, size, None, MemoryKind::Reserved, name)
    }

    fn map_backed(
        &self,
        gpa: u64,
        size: u64,
        host: Option<u64>,
        kind: MemoryKind,
        name: &'static str,
    ) -> Result<(), MemoryError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidSize(size));
        }

        let mut state = self.state.lock().expect("Poisoned lock");
        let hva = match host {
            Some(hva) => hva,
            None => {
                let backing =
                    MmapRegion::new(size as usize).map_err(MemoryError::Mmap)?;
                let hva = backing.as_ptr() as u64;
                state.backings.push(backing);
                hva
            }
        };

        let slot = state.next_slot;
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: hva,
            flags: 0,
        };
        // SAFETY: `hva` points to a live mapping of `size` bytes, either one
        // we just allocated and keep in `backings`, or one the caller of
        // `map_ram_backed` vouched for.
        unsafe { self.vm.set_user_memory_region(region)? };
        state.next_slot += 1;

        state.regions.push(MemoryRegion {
            name,
            kind,
            gpa,
            size,
            hva: Some(hva),
        });
        Ok(())
    }

    /// Records a device (MMIO) region. No KVM slot is created, so guest
    /// accesses fault and reach the dispatcher.
    pub fn map_device(&self, gpa: u64, size: u64, name: &'static str) {
        let mut state = self.state.lock().expect("Poisoned lock");
        state.regions.push(MemoryRegion {
            name,
            kind: MemoryKind::Device,
            gpa,
            size,
            hva: None,
        });
    }

    /// Drops the device region starting at `gpa`.
    pub fn unmap_device(&self, gpa: u64) -> Result<(), MemoryError> {
        let mut state = self.state.lock().expect("Poisoned lock");
        let before = state.regions.len();
        state
            .regions
            .retain(|r| !(r.kind == MemoryKind::Device && r.gpa == gpa));
        if state.regions.len() == before {
            return Err(MemoryError::NoDeviceRegion(gpa));
        }
        Ok(())
    }

    /// Translates a guest physical address to a host pointer. Only backed
    /// regions translate; device regions return `None`.
    pub fn translate(&self, gpa: u64) -> Option<*mut u8> {
        let state = self.state.lock().expect("Poisoned lock");
        state
            .regions
            .iter()
            .find(|r| r.hva.is_some() && gpa >= r.gpa && gpa < r.gpa + r.size)
            .map(|r| (r.hva.unwrap() + (gpa - r.gpa)) as *mut u8)
    }

    /// Runs `f` over `(name, kind, gpa, size)` for every region, in mapping
    /// order. Diagnostics only.
    pub fn for_each_region(&self, mut f: impl FnMut(&'static str, MemoryKind, u64, u64)) {
        let state = self.state.lock().expect("Poisoned lock");
        for r in &state.regions {
            f(r.name, r.kind, r.gpa, r.size);
        }
    }
}
