// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! vCPU workers.
//!
//! Each vCPU runs on its own thread, blocked in the kernel `RUN` call until
//! the guest traps. PIO and MMIO exits are fed straight into the device
//! manager's dispatcher; everything else the core cares about is that workers
//! can be kicked out of the kernel (a real-time signal flips the immediate
//! exit flag through thread-local state) and can execute scheduled work, such
//! as driving themselves back to power-on state, in their own context.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use kvm_bindings::kvm_regs;
use kvm_ioctls::{VcpuExit, VcpuFd};
use libc::{c_int, c_void, siginfo_t};
use log::{error, info, warn};
use vmm_sys_util::signal::{register_signal_handler, Killable};

use crate::device_manager::DeviceManager;
use crate::vstate::vm::{Vm, VmError};

/// Offset from SIGRTMIN for the kick signal.
const VCPU_RTSIG_OFFSET: c_int = 0;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VcpuError {
    /// Cannot create the vCPU: {0}
    Create(#[from] VmError),
    /// Cannot spawn the vCPU thread: {0}
    Spawn(std::io::Error),
    /// Cannot kick the vCPU thread: {0}
    Kick(vmm_sys_util::errno::Error),
}

/// Work executed by a vCPU worker in its own thread context.
#[derive(Debug, Clone, Copy)]
pub enum VcpuTask {
    /// Drive the vCPU back to its architectural power-on state.
    Reset,
}

fn kick_signum() -> c_int {
    libc::SIGRTMIN() + VCPU_RTSIG_OFFSET
}

thread_local! {
    // Points at the running vCPU's fd while its thread is inside `run`, so
    // the signal handler can request an immediate exit.
    static TLS_VCPU_FD: Cell<*const VcpuFd> = const { Cell::new(std::ptr::null()) };
}

fn register_kick_signal_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        extern "C" fn handle_signal(_: c_int, _: *mut siginfo_t, _: *mut c_void) {
            TLS_VCPU_FD.with(|cell| {
                let fd = cell.get();
                if !fd.is_null() {
                    // SAFETY: the pointer is installed and cleared by the
                    // thread this signal is delivered to, and the fd it names
                    // outlives the run loop.
                    unsafe { (*fd).set_kvm_immediate_exit(1) };
                    fence(Ordering::Release);
                }
            });
        }
        register_signal_handler(kick_signum(), handle_signal)
            .expect("Failed to register vcpu kick signal handler");
    });
}

/// A vCPU that has been created but not yet moved to its thread.
#[derive(Debug)]
pub struct Vcpu {
    index: u8,
    fd: VcpuFd,
    task_rx: Receiver<VcpuTask>,
}

impl Vcpu {
    fn run(mut self, manager: Arc<DeviceManager>, valid: Arc<AtomicBool>) {
        // Install the TLS pointer only once the vCPU sits in its final stack
        // slot; `run_loop` borrows rather than moves it.
        TLS_VCPU_FD.with(|cell| cell.set(&self.fd));
        self.run_loop(&manager, &valid);
        TLS_VCPU_FD.with(|cell| cell.set(std::ptr::null()));
    }

    fn run_loop(&mut self, manager: &Arc<DeviceManager>, valid: &AtomicBool) {
        // KVM creates vCPUs in reset state, but going through the same path
        // as Machine::reset keeps the two entry points identical.
        if let Err(err) = self.reset_to_power_on() {
            error!("vcpu{}: cannot reach power-on state: {err}", self.index);
            return;
        }

        while valid.load(Ordering::Acquire) {
            while let Ok(task) = self.task_rx.try_recv() {
                match task {
                    VcpuTask::Reset => {
                        if let Err(err) = self.reset_to_power_on() {
                            error!("vcpu{}: reset failed: {err}", self.index);
                        }
                    }
                }
            }

            let index = self.index;
            match self.fd.run() {
                Ok(exit) => {
                    if !Self::handle_exit(index, exit, manager) {
                        break;
                    }
                }
                Err(err) if err.errno() == libc::EINTR => {
                    // Kicked. Clear the immediate-exit request and loop back
                    // to pick up state changes and scheduled tasks.
                    self.fd.set_kvm_immediate_exit(0);
                }
                Err(err) if err.errno() == libc::EAGAIN => {}
                Err(err) => {
                    error!("vcpu{}: KVM_RUN failed: {err}", self.index);
                    break;
                }
            }
        }
    }

    /// Returns `false` when the worker should stop.
    fn handle_exit(index: u8, exit: VcpuExit<'_>, manager: &Arc<DeviceManager>) -> bool {
        match exit {
            VcpuExit::IoIn(port, data) => {
                let (size, count) = access_shape(data.len());
                manager.handle_io(port, data, size, false, count, false);
                true
            }
            VcpuExit::IoOut(port, data) => {
                let mut buffer = data.to_vec();
                let (size, count) = access_shape(buffer.len());
                manager.handle_io(port, &mut buffer, size, true, count, false);
                true
            }
            VcpuExit::MmioRead(address, data) => {
                let size = data.len();
                manager.handle_mmio(address, data, size, false, false);
                true
            }
            VcpuExit::MmioWrite(address, data) => {
                let mut buffer = data.to_vec();
                let size = buffer.len();
                manager.handle_mmio(address, &mut buffer, size, true, false);
                true
            }
            VcpuExit::Hlt => {
                info!("vcpu{index}: halted");
                false
            }
            VcpuExit::Shutdown => {
                info!("vcpu{index}: shutdown");
                false
            }
            VcpuExit::FailEntry(reason, cpu) => {
                error!("vcpu{index}: entry failure on cpu {cpu}, reason {reason:#x}");
                false
            }
            VcpuExit::InternalError => {
                error!("vcpu{index}: internal error");
                false
            }
            other => {
                warn!("vcpu{index}: unexpected exit: {other:?}");
                false
            }
        }
    }

    /// Architectural power-on state: real mode, CS pinned to the top of the
    /// 32-bit space so the first fetch lands in the BIOS at F000:FFF0.
    fn reset_to_power_on(&self) -> Result<(), kvm_ioctls::Error> {
        let mut sregs = self.fd.get_sregs()?;
        sregs.cs.selector = 0xf000;
        sregs.cs.base = 0xffff_0000;
        for segment in [
            &mut sregs.ds,
            &mut sregs.es,
            &mut sregs.fs,
            &mut sregs.gs,
            &mut sregs.ss,
        ] {
            segment.selector = 0;
            segment.base = 0;
        }
        self.fd.set_sregs(&sregs)?;

        let regs = kvm_regs {
            rip: 0xfff0,
            rflags: 0x2,
            ..Default::default()
        };
        self.fd.set_regs(&regs)
    }
}

/// Owner-side handle to one vCPU worker: holds the vCPU until it is started
/// and controls the thread afterwards.
#[derive(Debug)]
pub struct VcpuHandle {
    index: u8,
    task_tx: Sender<VcpuTask>,
    parked: Option<Vcpu>,
    thread: Option<JoinHandle<()>>,
}

impl VcpuHandle {
    pub fn new(index: u8, vm: &Vm) -> Result<VcpuHandle, VcpuError> {
        let fd = vm.create_vcpu(index)?;
        let (task_tx, task_rx) = channel();
        Ok(VcpuHandle {
            index,
            task_tx,
            parked: Some(Vcpu { index, fd, task_rx }),
            thread: None,
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Moves the vCPU onto its own thread. Does nothing when already started.
    pub fn start(
        &mut self,
        manager: Arc<DeviceManager>,
        valid: Arc<AtomicBool>,
    ) -> Result<(), VcpuError> {
        let Some(vcpu) = self.parked.take() else {
            return Ok(());
        };
        register_kick_signal_handler();
        let thread = std::thread::Builder::new()
            .name(format!("vcpu{}", self.index))
            .spawn(move || vcpu.run(manager, valid))
            .map_err(VcpuError::Spawn)?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Queues `task` for the worker and kicks it so the queue drains promptly.
    pub fn schedule(&self, task: VcpuTask) {
        let _ = self.task_tx.send(task);
        if let Err(err) = self.kick() {
            warn!("vcpu{}: kick after schedule failed: {err}", self.index);
        }
    }

    /// Knocks the worker out of its kernel `RUN` call.
    pub fn kick(&self) -> Result<(), VcpuError> {
        if let Some(thread) = &self.thread {
            thread.kill(kick_signum()).map_err(VcpuError::Kick)?;
        }
        Ok(())
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("vcpu{}: worker thread panicked", self.index);
            }
        }
    }
}

/// Rebuilds a `(size, count)` pair from the flattened buffer the kernel hands
/// us for a PIO exit. Single accesses come through verbatim; string
/// operations are split at the widest granularity that divides the buffer.
fn access_shape(len: usize) -> (usize, usize) {
    match len {
        0 => (0, 0),
        1 | 2 | 4 | 8 => (len, 1),
        l if l % 4 == 0 => (4, l / 4),
        l if l % 2 == 0 => (2, l / 2),
        l => (1, l),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_shape() {
        assert_eq!(access_shape(0), (0, 0));
        assert_eq!(access_shape(1), (1, 1));
        assert_eq!(access_shape(2), (2, 1));
        assert_eq!(access_shape(4), (4, 1));
        assert_eq!(access_shape(8), (8, 1));
        // Flattened string operations.
        assert_eq!(access_shape(12), (4, 3));
        assert_eq!(access_shape(6), (2, 3));
        assert_eq!(access_shape(3), (1, 3));
    }

    #[test]
    fn test_vcpu_create_parked() {
        use crate::test_utils::kvm_available;
        use crate::vstate::kvm::Kvm;

        if !kvm_available() {
            return;
        }
        let kvm = Kvm::new().unwrap();
        let vm = Vm::new(&kvm).unwrap();
        vm.create_irqchip().unwrap();

        let mut handle = VcpuHandle::new(0, &vm).unwrap();
        assert_eq!(handle.index(), 0);
        assert!(handle.parked.is_some());
        // Scheduling and kicking before start must not fail.
        handle.schedule(VcpuTask::Reset);
        handle.kick().unwrap();
        handle.join();
    }
}
