// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! The top-level machine.
//!
//! Construction wires the whole VM together in a fixed order: hypervisor
//! handle, guest memory, BIOS, architecture plumbing, vCPU workers, the I/O
//! worker and finally the device manager (which connects and resets the
//! device tree). `run` starts the workers; `quit` kicks them back out.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::info;
use vm_memory::MmapRegion;

use crate::arch::{
    BIOS_HIGH_LIMIT, BIOS_LOW_LIMIT, FIRST_ADDR_PAST_32BITS, IDENTITY_MAP_ADDR, MAX_BIOS_SIZE,
    MMIO_GAP_START, PAGE_SIZE, TSS_ADDRESS,
};
use crate::config::{ConfigError, MachineConfig};
use crate::device_manager::{DeviceManager, DeviceManagerError};
use crate::devices::{self, Device, SystemRoot};
use crate::io_thread::{IoThread, IoThreadError};
use crate::vstate::kvm::{Kvm, KvmError};
use crate::vstate::memory::{MemoryError, MemoryManager};
use crate::vstate::vcpu::{VcpuError, VcpuHandle, VcpuTask};
use crate::vstate::vm::{Vm, VmError};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MachineError {
    /// Configuration error: {0}
    Config(#[from] ConfigError),
    /// KVM system error: {0}
    Kvm(#[from] KvmError),
    /// KVM VM error: {0}
    Vm(#[from] VmError),
    /// Memory manager error: {0}
    Memory(#[from] MemoryError),
    /// Cannot read BIOS image {0}: {1}
    Bios(std::path::PathBuf, std::io::Error),
    /// BIOS image size {0:#x} must be a non-zero page multiple of at most 1M
    BiosSize(u64),
    /// Cannot allocate the BIOS working buffer: {0}
    BiosBuffer(vm_memory::mmap::MmapRegionError),
    /// vCPU error: {0}
    Vcpu(#[from] VcpuError),
    /// Device manager error: {0}
    DeviceManager(#[from] DeviceManagerError),
    /// I/O worker error: {0}
    IoThread(#[from] IoThreadError),
}

/// A virtual machine and its workers.
pub struct Machine {
    config: MachineConfig,
    kvm: Kvm,
    vm: Arc<Vm>,
    memory: Arc<MemoryManager>,
    io_thread: Arc<IoThread>,
    device_manager: Arc<DeviceManager>,
    vcpus: Mutex<Vec<VcpuHandle>>,
    /// Working BIOS buffer, mapped into the guest at both BIOS windows.
    bios: MmapRegion,
    /// Pristine copy taken at load time; reset restores from it.
    bios_backup: Vec<u8>,
    valid: Arc<AtomicBool>,
}

impl Machine {
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Machine, MachineError> {
        Ok(Machine::new(MachineConfig::from_file(path)?)?)
    }

    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        config.validate()?;

        let kvm = Kvm::new()?;
        let vm = Arc::new(Vm::new(&kvm)?);

        let memory = Arc::new(MemoryManager::new(vm.clone()));
        let bios_backup = Self::read_bios(&config)?;
        Self::map_guest_ram(&memory, config.mem_size_mib << 20, bios_backup.len() as u64)?;
        let bios = Self::map_bios(&memory, &bios_backup)?;

        // Architecture plumbing must precede vCPU creation: the in-kernel
        // irqchip has to exist before the first KVM_CREATE_VCPU.
        vm.set_identity_map(IDENTITY_MAP_ADDR)?;
        vm.set_tss(TSS_ADDRESS)?;
        memory.map_reserved(IDENTITY_MAP_ADDR, 4 * PAGE_SIZE, "ept+tss")?;
        vm.create_irqchip()?;
        vm.create_pit()?;

        let vcpus = (0..config.vcpu_count)
            .map(|index| VcpuHandle::new(index, &vm))
            .collect::<Result<Vec<_>, _>>()?;

        let mut children: Vec<Arc<Mutex<dyn Device>>> = Vec::new();
        for class in &config.devices {
            children.push(
                devices::create_device(class)
                    .ok_or_else(|| ConfigError::UnknownDeviceClass(class.clone()))?,
            );
        }
        let root: Arc<Mutex<dyn Device>> = Arc::new(Mutex::new(SystemRoot::new(children)));

        let io_thread = Arc::new(IoThread::new()?);
        let device_manager = DeviceManager::new(
            vm.clone(),
            memory.clone(),
            io_thread.clone(),
            root,
            config.debug,
        )?;

        info!(
            "machine ready: {} vCPUs, {} MiB RAM, BIOS {} bytes",
            config.vcpu_count,
            config.mem_size_mib,
            bios_backup.len(),
        );

        Ok(Machine {
            config,
            kvm,
            vm,
            memory,
            io_thread,
            device_manager,
            vcpus: Mutex::new(vcpus),
            bios,
            bios_backup,
            valid: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Lays out guest RAM around the fixed windows: the low BIOS shadow is
    /// carved out of the first megabyte (memory slots must not overlap), RAM
    /// that does not fit under the 32-bit MMIO gap moves above 4G.
    fn map_guest_ram(
        memory: &MemoryManager,
        bytes: u64,
        bios_size: u64,
    ) -> Result<(), MemoryError> {
        let low_end = bytes.min(MMIO_GAP_START);
        let low_ram = low_end.min(BIOS_LOW_LIMIT - bios_size);
        if low_ram > 0 {
            memory.map_ram(0, low_ram, "ram-low")?;
        }
        if low_end > BIOS_LOW_LIMIT {
            memory.map_ram(BIOS_LOW_LIMIT, low_end - BIOS_LOW_LIMIT, "ram")?;
        }
        if bytes > low_end {
            memory.map_ram(FIRST_ADDR_PAST_32BITS, bytes - low_end, "ram-high")?;
        }
        Ok(())
    }

    /// Reads the BIOS image into the pristine backup buffer.
    fn read_bios(config: &MachineConfig) -> Result<Vec<u8>, MachineError> {
        let backup = std::fs::read(&config.bios_path)
            .map_err(|err| MachineError::Bios(config.bios_path.clone(), err))?;
        let size = backup.len() as u64;
        if size == 0 || size % PAGE_SIZE != 0 || size > MAX_BIOS_SIZE {
            return Err(MachineError::BiosSize(size));
        }
        Ok(backup)
    }

    /// Copies the backup into a working buffer and maps it at the end of both
    /// the first megabyte and the 32-bit address space.
    fn map_bios(memory: &MemoryManager, backup: &[u8]) -> Result<MmapRegion, MachineError> {
        let size = backup.len() as u64;
        let bios = MmapRegion::new(backup.len()).map_err(MachineError::BiosBuffer)?;
        // SAFETY: source and destination are distinct live buffers of exactly
        // `backup.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(backup.as_ptr(), bios.as_ptr(), backup.len());
        }

        // SAFETY: the working buffer lives in `Machine::bios` until the
        // machine, and with it the VM fd, is dropped.
        unsafe {
            memory.map_ram_backed(BIOS_LOW_LIMIT - size, size, bios.as_ptr(), "bios")?;
            memory.map_ram_backed(BIOS_HIGH_LIMIT - size, size, bios.as_ptr(), "bios-shadow")?;
        }
        Ok(bios)
    }

    /// Starts every vCPU worker, then the I/O worker. Returns immediately;
    /// the workers run until [`Machine::quit`].
    pub fn run(&self) -> Result<(), MachineError> {
        let mut vcpus = self.vcpus.lock().expect("Poisoned lock");
        for vcpu in vcpus.iter_mut() {
            vcpu.start(self.device_manager.clone(), self.valid.clone())?;
        }
        self.io_thread.clone().start()?;
        Ok(())
    }

    /// Restores the BIOS from its backup, resets every device and schedules
    /// each vCPU to reset itself in its own worker context.
    pub fn reset(&self) {
        // SAFETY: the working buffer is exactly `bios_backup.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.bios_backup.as_ptr(),
                self.bios.as_ptr(),
                self.bios_backup.len(),
            );
        }
        self.device_manager.reset_devices();
        for vcpu in self.vcpus.lock().expect("Poisoned lock").iter() {
            vcpu.schedule(VcpuTask::Reset);
        }
    }

    /// Stops the machine: kicks every vCPU out of the kernel and stops the
    /// I/O worker. Idempotent.
    pub fn quit(&self) {
        if !self.valid.swap(false, Ordering::SeqCst) {
            return;
        }
        for vcpu in self.vcpus.lock().expect("Poisoned lock").iter() {
            let _ = vcpu.kick();
        }
        self.io_thread.stop();
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.device_manager
    }

    #[cfg(test)]
    pub(crate) fn bios_matches_backup(&self) -> bool {
        // SAFETY: the working buffer is exactly `bios_backup.len()` bytes and
        // no vCPU is mutating it while tests run.
        let working = unsafe {
            std::slice::from_raw_parts(self.bios.as_ptr(), self.bios_backup.len())
        };
        working == self.bios_backup.as_slice()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.quit();
        for vcpu in self.vcpus.lock().expect("Poisoned lock").iter_mut() {
            vcpu.join();
        }
        self.device_manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::test_utils::kvm_available;

    /// A page-sized BIOS made of HLT instructions: the reset vector at the
    /// top of the image halts immediately.
    fn dummy_bios() -> TempFile {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(&[0xf4u8; 4096]).unwrap();
        file
    }

    fn test_machine(bios: &TempFile, vcpu_count: u8) -> Machine {
        let config = MachineConfig {
            vcpu_count,
            mem_size_mib: 16,
            bios_path: bios.as_path().to_path_buf(),
            debug: false,
            devices: vec!["debug-console".to_string()],
        };
        Machine::new(config).unwrap()
    }

    #[test]
    fn test_construction() {
        if !kvm_available() {
            return;
        }
        let bios = dummy_bios();
        let machine = test_machine(&bios, 1);
        assert!(machine.is_valid());
        assert!(machine
            .device_manager()
            .lookup_device_by_name("system-root")
            .is_some());
        assert!(machine
            .device_manager()
            .lookup_device_by_name("debug-console")
            .is_some());
        assert!(machine.bios_matches_backup());

        // Both BIOS windows are live and alias the same host buffer.
        let low = machine.memory().translate(BIOS_LOW_LIMIT - 4096).unwrap();
        let high = machine.memory().translate(BIOS_HIGH_LIMIT - 4096).unwrap();
        assert_eq!(low, high);
    }

    #[test]
    fn test_bios_validation() {
        if !kvm_available() {
            return;
        }
        let file = TempFile::new().unwrap();
        file.as_file().write_all(&[0xf4u8; 100]).unwrap();
        let config = MachineConfig {
            vcpu_count: 1,
            mem_size_mib: 16,
            bios_path: file.as_path().to_path_buf(),
            debug: false,
            devices: vec![],
        };
        assert!(matches!(
            Machine::new(config),
            Err(MachineError::BiosSize(100))
        ));
    }

    #[test]
    fn test_reset_idempotent() {
        if !kvm_available() {
            return;
        }
        let bios = dummy_bios();
        let machine = test_machine(&bios, 1);

        // Scribble over the working BIOS the way a guest would.
        let hva = machine.memory().translate(BIOS_LOW_LIMIT - 4096).unwrap();
        // SAFETY: the BIOS working buffer is 4096 bytes and no vCPU runs.
        unsafe { std::ptr::write_bytes(hva, 0x90, 64) };
        assert!(!machine.bios_matches_backup());

        machine.reset();
        assert!(machine.bios_matches_backup());
        machine.reset();
        assert!(machine.bios_matches_backup());
    }

    #[test]
    fn test_run_and_quit() {
        if !kvm_available() {
            return;
        }
        let bios = dummy_bios();
        let machine = test_machine(&bios, 2);
        machine.run().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        machine.quit();
        assert!(!machine.is_valid());
        // Quit twice is fine; Drop joins the workers.
        machine.quit();
    }
}
