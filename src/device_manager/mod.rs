// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Registry of emulated devices and the guest I/O dispatch fast path.
//!
//! The manager owns the PIO/MMIO handler tables, the set of event fd fast
//! paths and the GSI routing mirror, each behind its own short-lived lock.
//! No lock is held across a device `read`/`write` or a kernel request, so
//! devices are free to call back into the manager from their handlers.
//! The one thing that is not supported is unregistering a handler from
//! inside a `read`/`write` on that same handler entry.

use std::fmt::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::{info, warn};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

pub mod handlers;
pub mod interrupts;

use handlers::HandlerTable;
use interrupts::{GsiRoutingTable, MsiRouteChange};

use crate::devices::{Device, IoResource, IoResourceKind};
use crate::io_thread::{IoThread, IoThreadError};
use crate::vstate::memory::{MemoryError, MemoryManager};
use crate::vstate::vm::{IoEventSpace, Vm, VmError};

/// A dispatch slower than this gets a log line in debug mode.
const SLOW_DISPATCH: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DeviceManagerError {
    /// A device named {0} is already registered
    DeviceNameInUse(String),
    /// PCI function {1:#04x} on bus {0:#x} is already claimed
    PciFunctionInUse(u16, u8),
    /// I/O resource {0} is malformed
    InvalidResource(&'static str),
    /// An I/O handler for {0} at {1:#x} is already registered
    HandlerInUse(&'static str, u64),
    /// No I/O handler matches {0} at {1:#x}
    HandlerNotFound(&'static str, u64),
    /// Device {0} failed to connect: {1}
    Connect(String, String),
    /// Cannot create an eventfd: {0}
    EventFd(std::io::Error),
    /// No routing entry carries GSI {0}
    UnknownGsi(u32),
    /// KVM error: {0}
    Vm(#[from] VmError),
    /// Memory manager error: {0}
    Memory(#[from] MemoryError),
    /// I/O worker error: {0}
    IoThread(#[from] IoThreadError),
}

/// Address space an event fd fast path watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventKind {
    Pio,
    Mmio,
}

impl From<IoEventKind> for IoEventSpace {
    fn from(kind: IoEventKind) -> IoEventSpace {
        match kind {
            IoEventKind::Pio => IoEventSpace::Pio,
            IoEventKind::Mmio => IoEventSpace::Mmio,
        }
    }
}

/// A kernel-side binding that turns matching guest writes into a plain fd
/// wakeup instead of a vCPU trap.
#[derive(Debug)]
pub struct IoEvent {
    pub kind: IoEventKind,
    /// Name of the owning device.
    pub device: String,
    pub address: u64,
    /// Zero means any write length, no data matching.
    pub length: u32,
    pub datamatch: u64,
    fd: EventFd,
}

impl IoEvent {
    pub fn fd(&self) -> &EventFd {
        &self.fd
    }
}

/// Owns every registered device, their I/O handlers and event fds, and the
/// interrupt routing mirror.
#[derive(Debug)]
pub struct DeviceManager {
    vm: Arc<Vm>,
    memory: Arc<MemoryManager>,
    io_thread: Arc<IoThread>,
    root: Arc<Mutex<dyn Device>>,
    devices: Mutex<Vec<Arc<Mutex<dyn Device>>>>,
    pio_handlers: Mutex<HandlerTable>,
    mmio_handlers: Mutex<HandlerTable>,
    ioevents: Mutex<Vec<Arc<IoEvent>>>,
    gsi_routing: Mutex<GsiRoutingTable>,
    weak_self: OnceLock<Weak<DeviceManager>>,
    debug: bool,
}

impl DeviceManager {
    /// Builds the manager: pushes the initial GSI routing table, connects the
    /// device tree rooted at `root` and resets every device.
    ///
    /// The in-kernel interrupt controller must already exist.
    pub fn new(
        vm: Arc<Vm>,
        memory: Arc<MemoryManager>,
        io_thread: Arc<IoThread>,
        root: Arc<Mutex<dyn Device>>,
        debug: bool,
    ) -> Result<Arc<DeviceManager>, DeviceManagerError> {
        let manager = Arc::new(DeviceManager {
            vm,
            memory,
            io_thread,
            root: root.clone(),
            devices: Mutex::new(Vec::new()),
            pio_handlers: Mutex::new(HandlerTable::new()),
            mmio_handlers: Mutex::new(HandlerTable::new()),
            ioevents: Mutex::new(Vec::new()),
            gsi_routing: Mutex::new(GsiRoutingTable::with_legacy_routes()),
            weak_self: OnceLock::new(),
            debug,
        });
        let _ = manager.weak_self.set(Arc::downgrade(&manager));

        manager.push_gsi_routes()?;
        manager.attach_device(root)?;
        manager.reset_devices();
        Ok(manager)
    }

    /// Registers `device` and, recursively, its children: records it in the
    /// registry, installs handlers for its claimed resources and calls its
    /// `connect`.
    pub fn attach_device(
        &self,
        device: Arc<Mutex<dyn Device>>,
    ) -> Result<(), DeviceManagerError> {
        let (name, resources, children, pci) = {
            let locked = device.lock().expect("Poisoned lock");
            (
                locked.name().to_string(),
                locked.io_resources(),
                locked.children(),
                locked.pci_address(),
            )
        };

        {
            let mut devices = self.devices.lock().expect("Poisoned lock");
            for existing in devices.iter() {
                let existing = existing.lock().expect("Poisoned lock");
                if existing.name() == name {
                    return Err(DeviceManagerError::DeviceNameInUse(name));
                }
                if let (Some(new), Some(old)) = (pci, existing.pci_address()) {
                    if new == old {
                        return Err(DeviceManagerError::PciFunctionInUse(new.bus, new.devfn));
                    }
                }
            }
            devices.push(device.clone());
        }

        // The device is visible from here on; a failed step must not leave a
        // half-wired device reachable from dispatch.
        if let Err(err) = self.wire_device(&device, &name, resources, children) {
            self.detach_device(&device);
            return Err(err);
        }
        Ok(())
    }

    fn wire_device(
        &self,
        device: &Arc<Mutex<dyn Device>>,
        name: &str,
        resources: Vec<IoResource>,
        children: Vec<Arc<Mutex<dyn Device>>>,
    ) -> Result<(), DeviceManagerError> {
        for resource in resources {
            self.register_io_handler(device.clone(), resource)?;
        }

        device
            .lock()
            .expect("Poisoned lock")
            .connect(self)
            .map_err(|err| DeviceManagerError::Connect(name.to_string(), err.to_string()))?;

        for child in children {
            self.attach_device(child)?;
        }
        Ok(())
    }

    /// Disconnects `device` and its subtree: children first, then the device's
    /// own `disconnect`, then its handlers, event fds and registry entry.
    /// Safe on partially attached trees.
    pub fn detach_device(&self, device: &Arc<Mutex<dyn Device>>) {
        let (name, children) = {
            let locked = device.lock().expect("Poisoned lock");
            (locked.name().to_string(), locked.children())
        };
        for child in children.iter().rev() {
            self.detach_device(child);
        }

        device.lock().expect("Poisoned lock").disconnect(self);

        let stale: Vec<Arc<IoEvent>> = self
            .ioevents
            .lock()
            .expect("Poisoned lock")
            .iter()
            .filter(|event| event.device == name)
            .cloned()
            .collect();
        for event in stale {
            if let Err(err) = self.unregister_io_event(&event) {
                warn!("failed to drop io event of {name}: {err}");
            }
        }

        self.pio_handlers
            .lock()
            .expect("Poisoned lock")
            .remove_all_for(device);
        let mmio = self
            .mmio_handlers
            .lock()
            .expect("Poisoned lock")
            .remove_all_for(device);
        for handler in mmio {
            let _ = self.memory.unmap_device(handler.resource.base);
        }

        self.devices
            .lock()
            .expect("Poisoned lock")
            .retain(|d| !Arc::ptr_eq(d, device));
    }

    /// Tears down the whole tree. Called once during machine destruction.
    pub fn shutdown(&self) {
        let root = self.root.clone();
        self.detach_device(&root);
    }

    /// Installs a dispatch handler binding `resource` to `device`. RAM
    /// resources are bookkeeping only and get no handler.
    pub fn register_io_handler(
        &self,
        device: Arc<Mutex<dyn Device>>,
        resource: IoResource,
    ) -> Result<(), DeviceManagerError> {
        if !resource.is_valid() {
            return Err(DeviceManagerError::InvalidResource(resource.name));
        }
        let resource = Arc::new(resource);
        match resource.kind {
            IoResourceKind::Pio => {
                let inserted = self
                    .pio_handlers
                    .lock()
                    .expect("Poisoned lock")
                    .insert(device, resource.clone());
                if !inserted {
                    return Err(DeviceManagerError::HandlerInUse(
                        resource.name,
                        resource.base,
                    ));
                }
            }
            IoResourceKind::Mmio => {
                // Record the range as a device region so guest accesses keep
                // faulting into the MMIO dispatcher.
                self.memory
                    .map_device(resource.base, resource.length, resource.name);
                let inserted = self
                    .mmio_handlers
                    .lock()
                    .expect("Poisoned lock")
                    .insert(device, resource.clone());
                if !inserted {
                    let _ = self.memory.unmap_device(resource.base);
                    return Err(DeviceManagerError::HandlerInUse(
                        resource.name,
                        resource.base,
                    ));
                }
            }
            IoResourceKind::Ram => {}
        }
        Ok(())
    }

    /// Removes the handler installed for `(device, resource)`.
    pub fn unregister_io_handler(
        &self,
        device: &Arc<Mutex<dyn Device>>,
        resource: &IoResource,
    ) -> Result<(), DeviceManagerError> {
        let removed = match resource.kind {
            IoResourceKind::Pio => self
                .pio_handlers
                .lock()
                .expect("Poisoned lock")
                .remove(device, resource.base),
            IoResourceKind::Mmio => {
                let removed = self
                    .mmio_handlers
                    .lock()
                    .expect("Poisoned lock")
                    .remove(device, resource.base);
                if removed.is_some() {
                    let _ = self.memory.unmap_device(resource.base);
                }
                removed
            }
            IoResourceKind::Ram => None,
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(DeviceManagerError::HandlerNotFound(
                resource.name,
                resource.base,
            )),
        }
    }

    /// Dispatches a guest port access. `data` holds `size * count` bytes;
    /// with `count > 1` the access is an x86 string operation and the owning
    /// device sees `count` sequential accesses at the same port, the buffer
    /// advancing by `size` each time.
    ///
    /// Unclaimed ports follow floating-bus semantics: reads return all-ones,
    /// writes are dropped. (MMIO misses leave the buffer untouched instead;
    /// reads of unbacked physical addresses are simply undefined.)
    pub fn handle_io(
        &self,
        port: u16,
        data: &mut [u8],
        size: usize,
        is_write: bool,
        count: usize,
        from_ioeventfd: bool,
    ) {
        if count == 0 {
            return;
        }

        let matched = self
            .pio_handlers
            .lock()
            .expect("Poisoned lock")
            .find_and_promote(u64::from(port));
        let Some((resource, device)) = matched else {
            if !is_write {
                data[..size].fill(0xff);
            }
            if self.debug {
                warn!(
                    "unhandled io {} port {port:#x} size {size} count {count}",
                    if is_write { "out" } else { "in" },
                );
            }
            return;
        };

        let start = (self.debug && !from_ioeventfd).then(Instant::now);
        let offset = u64::from(port) - resource.base;
        {
            let mut device = device.lock().expect("Poisoned lock");
            let mut pos = 0;
            for _ in 0..count {
                let chunk = &mut data[pos..pos + size];
                if is_write {
                    device.write(&resource, offset, chunk);
                } else {
                    device.read(&resource, offset, chunk);
                }
                pos += size;
            }
        }
        if let Some(start) = start {
            let elapsed = start.elapsed();
            if elapsed >= SLOW_DISPATCH {
                warn!(
                    "{} SLOW IO {} port {port:#x} size {size} took {elapsed:?}",
                    resource.name,
                    if is_write { "out" } else { "in" },
                );
            }
        }
    }

    /// Dispatches a guest physical memory access that missed every memory
    /// slot. `data` holds `size` bytes.
    pub fn handle_mmio(
        &self,
        address: u64,
        data: &mut [u8],
        size: usize,
        is_write: bool,
        from_ioeventfd: bool,
    ) {
        let matched = self
            .mmio_handlers
            .lock()
            .expect("Poisoned lock")
            .find_and_promote(address);
        let Some((resource, device)) = matched else {
            // Unlike PIO, the buffer is deliberately left alone on a miss.
            if self.debug {
                warn!(
                    "unhandled mmio {} address {address:#x} size {size}",
                    if is_write { "write" } else { "read" },
                );
            }
            return;
        };

        let start = (self.debug && !from_ioeventfd).then(Instant::now);
        let offset = address - resource.base;
        {
            let mut device = device.lock().expect("Poisoned lock");
            if is_write {
                device.write(&resource, offset, &data[..size]);
            } else {
                device.read(&resource, offset, &mut data[..size]);
            }
        }
        if let Some(start) = start {
            let elapsed = start.elapsed();
            if elapsed >= SLOW_DISPATCH {
                warn!(
                    "{} SLOW MMIO {} address {address:#x} size {size} took {elapsed:?}",
                    resource.name,
                    if is_write { "write" } else { "read" },
                );
            }
        }
    }

    /// Asserts or deasserts a legacy interrupt line.
    pub fn set_irq(&self, irq: u32, level: bool) -> Result<(), DeviceManagerError> {
        Ok(self.vm.set_irq_line(irq, level)?)
    }

    /// Injects a message-signaled interrupt directly, with no routing entry.
    pub fn signal_msi(&self, address: u64, data: u32) -> Result<(), DeviceManagerError> {
        Ok(self.vm.signal_msi(address, data)?)
    }

    /// Adds an MSI route on a fresh GSI and returns it. When `trigger` is
    /// given, the fd is bound to the GSI as an irqfd so writes to it inject
    /// the interrupt without a syscall from this process.
    pub fn add_msi_route(
        &self,
        address: u64,
        data: u32,
        trigger: Option<&EventFd>,
    ) -> Result<u32, DeviceManagerError> {
        let gsi = self
            .gsi_routing
            .lock()
            .expect("Poisoned lock")
            .add_msi_route(address, data);
        self.push_gsi_routes()?;
        if let Some(fd) = trigger {
            // Bind the irqfd only after the route is pushed; older kernels
            // panic on an irqfd naming an out-of-bounds GSI.
            self.vm.register_irqfd(fd, gsi)?;
        }
        Ok(gsi)
    }

    /// Rewrites the MSI route on `gsi`. An `address` of zero removes the
    /// route (and unbinds `trigger`, when given). A missing `gsi` is an
    /// error the caller must treat as fatal.
    pub fn update_msi_route(
        &self,
        gsi: u32,
        address: u64,
        data: u32,
        trigger: Option<&EventFd>,
    ) -> Result<(), DeviceManagerError> {
        let change = self
            .gsi_routing
            .lock()
            .expect("Poisoned lock")
            .update_msi_route(gsi, address, data)
            .ok_or(DeviceManagerError::UnknownGsi(gsi))?;

        // The irqfd change goes first either way; the whole-table push is
        // always the last step. An updated route's GSI is already present in
        // the kernel's current table, so reassigning before the re-push is
        // safe.
        match change {
            MsiRouteChange::Removed => {
                if let Some(fd) = trigger {
                    self.vm.unregister_irqfd(fd, gsi)?;
                }
            }
            MsiRouteChange::Updated => {
                if let Some(fd) = trigger {
                    self.vm.register_irqfd(fd, gsi)?;
                }
            }
        }
        self.push_gsi_routes()?;
        Ok(())
    }

    /// Copies the mirror and pushes it whole. The snapshot is taken under the
    /// routing lock but the kernel request runs outside it.
    fn push_gsi_routes(&self) -> Result<(), DeviceManagerError> {
        let entries = self
            .gsi_routing
            .lock()
            .expect("Poisoned lock")
            .entries()
            .to_vec();
        Ok(self.vm.set_gsi_routes(&entries)?)
    }

    /// Creates an event fd, installs the kernel fast-path binding for writes
    /// at `address` and starts polling the fd. On every wakeup the worker
    /// synthesizes the matching dispatch with `datamatch` as payload.
    pub fn register_io_event(
        &self,
        device: &str,
        kind: IoEventKind,
        address: u64,
        length: u32,
        datamatch: u64,
    ) -> Result<Arc<IoEvent>, DeviceManagerError> {
        let fd = EventFd::new(0).map_err(DeviceManagerError::EventFd)?;
        self.vm
            .register_ioevent(&fd, kind.into(), address, length, datamatch)?;

        let event = Arc::new(IoEvent {
            kind,
            device: device.to_string(),
            address,
            length,
            datamatch,
            fd,
        });

        let manager = self
            .weak_self
            .get()
            .cloned()
            .unwrap_or_else(Weak::new);
        let captured = event.clone();
        self.io_thread.start_polling(
            event.fd.as_raw_fd(),
            EventSet::IN,
            Box::new(move |_| {
                // Drain the counter, then replay the absorbed write into the
                // ordinary dispatch path.
                let _ = captured.fd.read();
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let mut payload = captured.datamatch.to_le_bytes();
                let size = captured.length as usize;
                match captured.kind {
                    IoEventKind::Mmio => {
                        manager.handle_mmio(captured.address, &mut payload[..size], size, true, true)
                    }
                    IoEventKind::Pio => manager.handle_io(
                        captured.address as u16,
                        &mut payload[..size],
                        size,
                        true,
                        1,
                        true,
                    ),
                }
            }),
        )?;

        self.ioevents
            .lock()
            .expect("Poisoned lock")
            .push(event.clone());
        Ok(event)
    }

    /// Stops polling, removes the kernel binding and drops the event. The
    /// poller is stopped first so no callback can fire once the kernel-side
    /// binding is gone; dropping the event closes the fd.
    pub fn unregister_io_event(&self, event: &Arc<IoEvent>) -> Result<(), DeviceManagerError> {
        self.io_thread.stop_polling(event.fd.as_raw_fd())?;
        self.vm.unregister_ioevent(
            &event.fd,
            event.kind.into(),
            event.address,
            event.length,
            event.datamatch,
        )?;
        self.ioevents
            .lock()
            .expect("Poisoned lock")
            .retain(|e| !Arc::ptr_eq(e, event));
        Ok(())
    }

    /// Finds a live event by its watched address.
    pub fn find_io_event(&self, kind: IoEventKind, address: u64) -> Option<Arc<IoEvent>> {
        self.ioevents
            .lock()
            .expect("Poisoned lock")
            .iter()
            .find(|e| e.kind == kind && e.address == address)
            .cloned()
    }

    /// Convenience form of [`DeviceManager::unregister_io_event`] keyed by
    /// address.
    pub fn unregister_io_event_at(
        &self,
        kind: IoEventKind,
        address: u64,
    ) -> Result<(), DeviceManagerError> {
        match self.find_io_event(kind, address) {
            Some(event) => self.unregister_io_event(&event),
            None => Ok(()),
        }
    }

    /// Calls `reset` on every registered device, in registration order.
    pub fn reset_devices(&self) {
        let devices: Vec<_> = self
            .devices
            .lock()
            .expect("Poisoned lock")
            .iter()
            .cloned()
            .collect();
        for device in devices {
            device.lock().expect("Poisoned lock").reset();
        }
    }

    pub fn lookup_device_by_name(&self, name: &str) -> Option<Arc<Mutex<dyn Device>>> {
        self.devices
            .lock()
            .expect("Poisoned lock")
            .iter()
            .find(|d| d.lock().expect("Poisoned lock").name() == name)
            .cloned()
    }

    pub fn lookup_pci_device(&self, bus: u16, devfn: u8) -> Option<Arc<Mutex<dyn Device>>> {
        self.devices
            .lock()
            .expect("Poisoned lock")
            .iter()
            .find(|d| {
                d.lock()
                    .expect("Poisoned lock")
                    .pci_address()
                    .is_some_and(|a| a.bus == bus && a.devfn == devfn)
            })
            .cloned()
    }

    /// Logs every registered device and its claimed resources.
    pub fn log_devices(&self) {
        let devices: Vec<_> = self
            .devices
            .lock()
            .expect("Poisoned lock")
            .iter()
            .cloned()
            .collect();
        for device in devices {
            let device = device.lock().expect("Poisoned lock");
            let mut line = format!("device {}", device.name());
            for r in device.io_resources() {
                let kind = match r.kind {
                    IoResourceKind::Pio => "io  ",
                    IoResourceKind::Mmio => "mmio",
                    IoResourceKind::Ram => "ram ",
                };
                let _ = write!(
                    line,
                    "\n\t{kind} {:#010x}-{:#010x} {}",
                    r.base,
                    r.base + r.length - 1,
                    r.name,
                );
            }
            info!("{line}");
        }
    }

    #[cfg(test)]
    pub(crate) fn pio_position_of(&self, base: u64) -> Option<usize> {
        self.pio_handlers
            .lock()
            .expect("Poisoned lock")
            .position_of(base)
    }

    #[cfg(test)]
    pub(crate) fn gsi_routing_len(&self) -> usize {
        self.gsi_routing.lock().expect("Poisoned lock").len()
    }

    #[cfg(test)]
    pub(crate) fn ioevents_len(&self) -> usize {
        self.ioevents.lock().expect("Poisoned lock").len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::devices::{PciAddress, SystemRoot};
    use crate::test_utils::kvm_available;
    use crate::vstate::kvm::Kvm;

    #[derive(Debug, Default)]
    struct AccessLog {
        writes: Vec<(u64, Vec<u8>)>,
        reads: Vec<(u64, usize)>,
        resets: usize,
    }

    #[derive(Debug)]
    struct TestDevice {
        name: &'static str,
        resources: Vec<IoResource>,
        pci: Option<PciAddress>,
        fill: u8,
        log: AccessLog,
    }

    impl TestDevice {
        fn new(name: &'static str, resources: Vec<IoResource>) -> Arc<Mutex<TestDevice>> {
            Arc::new(Mutex::new(TestDevice {
                name,
                resources,
                pci: None,
                fill: 0xab,
                log: AccessLog::default(),
            }))
        }
    }

    impl Device for TestDevice {
        fn name(&self) -> &str {
            self.name
        }

        fn io_resources(&self) -> Vec<IoResource> {
            self.resources.clone()
        }

        fn reset(&mut self) {
            self.log.resets += 1;
        }

        fn read(&mut self, _resource: &IoResource, offset: u64, data: &mut [u8]) {
            self.log.reads.push((offset, data.len()));
            data.fill(self.fill);
        }

        fn write(&mut self, _resource: &IoResource, offset: u64, data: &[u8]) {
            self.log.writes.push((offset, data.to_vec()));
        }

        fn pci_address(&self) -> Option<PciAddress> {
            self.pci
        }
    }

    struct TestRig {
        manager: Arc<DeviceManager>,
        io_thread: Arc<IoThread>,
    }

    fn setup() -> Option<TestRig> {
        if !kvm_available() {
            return None;
        }
        let kvm = Kvm::new().unwrap();
        let vm = Arc::new(Vm::new(&kvm).unwrap());
        vm.create_irqchip().unwrap();
        let memory = Arc::new(MemoryManager::new(vm.clone()));
        let io_thread = Arc::new(IoThread::new().unwrap());
        let root: Arc<Mutex<dyn Device>> = Arc::new(Mutex::new(SystemRoot::new(vec![])));
        let manager =
            DeviceManager::new(vm, memory, io_thread.clone(), root, false).unwrap();
        Some(TestRig { manager, io_thread })
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_pio_dispatch_and_promotion() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;

        // Three cold devices in front of the hot one.
        for (i, base) in [0x10u16, 0x20, 0x30].iter().enumerate() {
            let filler = TestDevice::new(
                ["cold-a", "cold-b", "cold-c"][i],
                vec![IoResource::pio(*base, 4, "cold")],
            );
            dm.attach_device(filler).unwrap();
        }
        let hot = TestDevice::new("kbd", vec![IoResource::pio(0x60, 4, "ps2")]);
        dm.attach_device(hot.clone())
            .unwrap();
        assert_eq!(dm.pio_position_of(0x60), Some(3));

        let mut data = [0xfeu8];
        dm.handle_io(0x60, &mut data, 1, true, 1, false);
        {
            let dev = hot.lock().unwrap();
            assert_eq!(dev.log.writes, vec![(0, vec![0xfe])]);
        }
        // The matched entry moved to the front of the table.
        assert_eq!(dm.pio_position_of(0x60), Some(0));

        let mut data = [0u8];
        dm.handle_io(0x62, &mut data, 1, false, 1, false);
        {
            let dev = hot.lock().unwrap();
            assert_eq!(dev.log.reads, vec![(2, 1)]);
        }
        assert_eq!(data, [0xab]);
    }

    #[test]
    fn test_unhandled_pio_read_returns_ones() {
        let Some(rig) = setup() else { return };
        let mut data = [0u8; 4];
        rig.manager.handle_io(0x378, &mut data, 4, false, 1, false);
        assert_eq!(data, [0xff; 4]);

        // Writes to unclaimed ports are silently dropped.
        let mut data = [0x55u8; 2];
        rig.manager.handle_io(0x378, &mut data, 2, true, 1, false);
        assert_eq!(data, [0x55; 2]);
    }

    #[test]
    fn test_pio_string_operation() {
        let Some(rig) = setup() else { return };
        let dev = TestDevice::new("uart", vec![IoResource::pio(0x3f8, 8, "uart")]);
        rig.manager
            .attach_device(dev.clone())
            .unwrap();

        let mut data = [1u8, 2, 3, 4];
        rig.manager.handle_io(0x3f8, &mut data, 2, true, 2, false);
        let locked = dev.lock().unwrap();
        assert_eq!(
            locked.log.writes,
            vec![(0, vec![1, 2]), (0, vec![3, 4])]
        );
    }

    #[test]
    fn test_pio_access_spanning_resource_end() {
        let Some(rig) = setup() else { return };
        let dev = TestDevice::new("fdc", vec![IoResource::pio(0x3f0, 8, "fdc")]);
        rig.manager.attach_device(dev.clone()).unwrap();

        // A 2-byte access at the last covered port is delivered with
        // offset == length - 1; whether to clamp is the device's call.
        let mut data = [0u8; 2];
        rig.manager.handle_io(0x3f7, &mut data, 2, false, 1, false);
        assert_eq!(dev.lock().unwrap().log.reads, vec![(7, 2)]);
    }

    #[test]
    fn test_zero_count_is_noop() {
        let Some(rig) = setup() else { return };
        let dev = TestDevice::new("uart", vec![IoResource::pio(0x3f8, 8, "uart")]);
        rig.manager
            .attach_device(dev.clone())
            .unwrap();

        let mut data = [0u8; 2];
        rig.manager.handle_io(0x3f8, &mut data, 2, true, 0, false);
        assert!(dev.lock().unwrap().log.writes.is_empty());
        assert_eq!(data, [0; 2]);
    }

    #[test]
    fn test_mmio_dispatch_bounds() {
        let Some(rig) = setup() else { return };
        let dev = TestDevice::new("fb", vec![IoResource::mmio(0xd000_0000, 0x100, "fb")]);
        rig.manager
            .attach_device(dev.clone())
            .unwrap();

        let mut data = [0u8; 1];
        rig.manager.handle_mmio(0xd000_00ff, &mut data, 1, false, false);
        assert_eq!(dev.lock().unwrap().log.reads, vec![(0xff, 1)]);

        // One past the end misses, and the buffer stays untouched.
        let mut data = [0x5au8; 1];
        rig.manager.handle_mmio(0xd000_0100, &mut data, 1, false, false);
        assert_eq!(data, [0x5a]);
    }

    #[test]
    fn test_handler_roundtrip() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        let dev = TestDevice::new("uart", vec![IoResource::pio(0x3f8, 8, "uart")]);
        let dyn_dev: Arc<Mutex<dyn Device>> = dev.clone();
        dm.attach_device(dyn_dev.clone()).unwrap();

        let extra = IoResource::pio(0x2f8, 8, "uart2");
        dm.register_io_handler(dyn_dev.clone(), extra.clone()).unwrap();
        assert!(dm.pio_position_of(0x2f8).is_some());

        dm.unregister_io_handler(&dyn_dev, &extra).unwrap();
        assert!(dm.pio_position_of(0x2f8).is_none());
        assert!(matches!(
            dm.unregister_io_handler(&dyn_dev, &extra),
            Err(DeviceManagerError::HandlerNotFound(_, _))
        ));

        // Duplicate registration for the same (device, base) is rejected.
        let r = IoResource::pio(0x3f8, 8, "uart");
        assert!(matches!(
            dm.register_io_handler(dyn_dev.clone(), r),
            Err(DeviceManagerError::HandlerInUse(_, _))
        ));
    }

    #[test]
    fn test_registry_conflicts() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;

        let a = TestDevice::new("twin", vec![]);
        dm.attach_device(a).unwrap();
        let b = TestDevice::new("twin", vec![]);
        assert!(matches!(
            dm.attach_device(b),
            Err(DeviceManagerError::DeviceNameInUse(_))
        ));

        let mk_pci = |name| {
            let dev = TestDevice::new(name, vec![]);
            dev.lock().unwrap().pci = Some(PciAddress { bus: 0, devfn: 0x10 });
            dev
        };
        dm.attach_device(mk_pci("nic"))
            .unwrap();
        assert!(matches!(
            dm.attach_device(mk_pci("nic2")),
            Err(DeviceManagerError::PciFunctionInUse(0, 0x10))
        ));
        assert!(dm.lookup_pci_device(0, 0x10).is_some());
        assert!(dm.lookup_pci_device(0, 0x11).is_none());
    }

    #[test]
    fn test_failed_attach_rolls_back() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;

        // Two resources with the same base: the second registration fails
        // after the first handler is already installed.
        let dev = TestDevice::new(
            "broken",
            vec![
                IoResource::pio(0x500, 4, "dup"),
                IoResource::pio(0x500, 8, "dup"),
            ],
        );
        assert!(matches!(
            dm.attach_device(dev.clone()),
            Err(DeviceManagerError::HandlerInUse(_, _))
        ));

        // Nothing of the failed attach is left behind.
        assert!(dm.lookup_device_by_name("broken").is_none());
        assert!(dm.pio_position_of(0x500).is_none());
        let mut data = [0u8; 1];
        dm.handle_io(0x500, &mut data, 1, false, 1, false);
        assert!(dev.lock().unwrap().log.reads.is_empty());

        // The name is free to use again.
        let retry = TestDevice::new("broken", vec![IoResource::pio(0x500, 4, "dup")]);
        dm.attach_device(retry).unwrap();
    }

    #[test]
    fn test_msi_route_lifecycle() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        let initial = dm.gsi_routing_len();
        assert_eq!(initial, 38);

        let gsi = dm.add_msi_route(0xfee0_0000, 0x4041, None).unwrap();
        assert_eq!(gsi, 24);
        assert_eq!(dm.gsi_routing_len(), initial + 1);

        dm.update_msi_route(gsi, 0xfee0_1000, 0x4042, None).unwrap();
        assert_eq!(dm.gsi_routing_len(), initial + 1);

        dm.update_msi_route(gsi, 0, 0, None).unwrap();
        assert_eq!(dm.gsi_routing_len(), initial);

        assert!(matches!(
            dm.update_msi_route(gsi, 0xfee0_0000, 0, None),
            Err(DeviceManagerError::UnknownGsi(_))
        ));
    }

    #[test]
    fn test_msi_route_with_irqfd() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        let trigger = EventFd::new(0).unwrap();

        let gsi = dm.add_msi_route(0xfee0_0000, 0x22, Some(&trigger)).unwrap();
        // Writes to the bound fd inject the interrupt entirely in-kernel.
        trigger.write(1).unwrap();
        dm.update_msi_route(gsi, 0, 0, Some(&trigger)).unwrap();
    }

    #[test]
    fn test_set_irq_and_signal_msi() {
        let Some(rig) = setup() else { return };
        rig.manager.set_irq(4, true).unwrap();
        rig.manager.set_irq(4, false).unwrap();
        rig.manager.signal_msi(0xfee0_0000, 0x31).unwrap();
    }

    #[test]
    fn test_ioevent_fast_path() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        rig.io_thread.clone().start().unwrap();

        let dev = TestDevice::new("blk", vec![IoResource::mmio(0xc000, 0x10, "notify")]);
        dm.attach_device(dev.clone())
            .unwrap();

        let event = dm
            .register_io_event("blk", IoEventKind::Mmio, 0xc000, 2, 0x1)
            .unwrap();
        assert_eq!(dm.ioevents_len(), 1);

        // Simulate the kernel absorbing a matching write.
        event.fd().write(1).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            !dev.lock().unwrap().log.writes.is_empty()
        }));
        assert_eq!(dev.lock().unwrap().log.writes, vec![(0, vec![0x01, 0x00])]);

        let fd = event.fd().try_clone().unwrap();
        dm.unregister_io_event(&event).unwrap();
        assert_eq!(dm.ioevents_len(), 0);

        // Once unregistered, wakeups no longer reach the device.
        fd.write(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(dev.lock().unwrap().log.writes.len(), 1);

        rig.io_thread.stop();
    }

    #[test]
    fn test_ioevent_lookup_by_address() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        let _event = dm
            .register_io_event("blk", IoEventKind::Pio, 0xae0, 0, 0)
            .unwrap();
        assert!(dm.find_io_event(IoEventKind::Pio, 0xae0).is_some());
        assert!(dm.find_io_event(IoEventKind::Mmio, 0xae0).is_none());

        dm.unregister_io_event_at(IoEventKind::Pio, 0xae0).unwrap();
        assert!(dm.find_io_event(IoEventKind::Pio, 0xae0).is_none());
        // Removing an address with no event is not an error.
        dm.unregister_io_event_at(IoEventKind::Pio, 0xae0).unwrap();
    }

    #[test]
    fn test_reset_devices() {
        let Some(rig) = setup() else { return };
        let dev = TestDevice::new("uart", vec![]);
        rig.manager
            .attach_device(dev.clone())
            .unwrap();

        rig.manager.reset_devices();
        rig.manager.reset_devices();
        assert_eq!(dev.lock().unwrap().log.resets, 2);
    }

    #[test]
    fn test_detach_removes_everything() {
        let Some(rig) = setup() else { return };
        let dm = &rig.manager;
        let dev = TestDevice::new(
            "uart",
            vec![
                IoResource::pio(0x3f8, 8, "uart"),
                IoResource::mmio(0xe000_0000, 0x1000, "uart-mmio"),
            ],
        );
        let dyn_dev: Arc<Mutex<dyn Device>> = dev.clone();
        dm.attach_device(dyn_dev.clone()).unwrap();
        assert!(dm.lookup_device_by_name("uart").is_some());

        dm.detach_device(&dyn_dev);
        assert!(dm.lookup_device_by_name("uart").is_none());
        assert!(dm.pio_position_of(0x3f8).is_none());

        let mut data = [0u8; 1];
        dm.handle_mmio(0xe000_0000, &mut data, 1, false, false);
        assert!(dev.lock().unwrap().log.reads.is_empty());
    }
}
