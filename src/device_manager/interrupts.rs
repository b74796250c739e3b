// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! In-process mirror of the kernel's GSI routing table.
//!
//! The kernel offers no way to read the current routing table back, so the
//! device manager keeps a faithful copy. Every mutation edits the mirror and
//! then pushes the whole table; the kernel applies it atomically or rejects it
//! outright, so the mirror always equals what the last successful push sent.

use std::fmt;

use kvm_bindings::{
    kvm_irq_routing_entry, KVM_IRQCHIP_IOAPIC, KVM_IRQCHIP_PIC_MASTER, KVM_IRQCHIP_PIC_SLAVE,
    KVM_IRQ_ROUTING_IRQCHIP, KVM_IRQ_ROUTING_MSI,
};

/// First GSI handed out to MSI routes; everything below is wired to the
/// legacy interrupt controllers at setup.
pub const FIRST_DYNAMIC_GSI: u32 = 24;

/// Outcome of [`GsiRoutingTable::update_msi_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiRouteChange {
    /// The entry was rewritten in place.
    Updated,
    /// The entry was removed from the table.
    Removed,
}

fn irqchip_entry(gsi: u32, irqchip: u32, pin: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_IRQCHIP,
        ..Default::default()
    };
    entry.u.irqchip.irqchip = irqchip;
    entry.u.irqchip.pin = pin;
    entry
}

fn msi_entry(gsi: u32, address: u64, data: u32) -> kvm_irq_routing_entry {
    let mut entry = kvm_irq_routing_entry {
        gsi,
        type_: KVM_IRQ_ROUTING_MSI,
        ..Default::default()
    };
    entry.u.msi.address_lo = address as u32;
    entry.u.msi.address_hi = (address >> 32) as u32;
    entry.u.msi.data = data;
    entry
}

pub struct GsiRoutingTable {
    entries: Vec<kvm_irq_routing_entry>,
    next_gsi: u32,
}

impl GsiRoutingTable {
    /// Builds the power-on table: both 8259A halves, the first 24 IOAPIC pins
    /// with GSI 0 cascaded onto pin 2, and GSI 2 left unrouted.
    pub fn with_legacy_routes() -> GsiRoutingTable {
        let mut entries = Vec::new();

        // 8259A master.
        for gsi in 0..8 {
            if gsi != 2 {
                entries.push(irqchip_entry(gsi, KVM_IRQCHIP_PIC_MASTER, gsi));
            }
        }
        // 8259A slave.
        for gsi in 8..16 {
            entries.push(irqchip_entry(gsi, KVM_IRQCHIP_PIC_SLAVE, gsi - 8));
        }
        // IOAPIC. The legacy timer on GSI 0 arrives on pin 2.
        for gsi in 0..24 {
            if gsi == 0 {
                entries.push(irqchip_entry(gsi, KVM_IRQCHIP_IOAPIC, 2));
            } else if gsi != 2 {
                entries.push(irqchip_entry(gsi, KVM_IRQCHIP_IOAPIC, gsi));
            }
        }

        GsiRoutingTable {
            entries,
            next_gsi: FIRST_DYNAMIC_GSI,
        }
    }

    /// Appends an MSI route on a freshly allocated GSI and returns it. GSIs
    /// are never reused, so the returned values are strictly increasing.
    pub fn add_msi_route(&mut self, address: u64, data: u32) -> u32 {
        let gsi = self.next_gsi;
        self.next_gsi += 1;
        self.entries.push(msi_entry(gsi, address, data));
        gsi
    }

    /// Rewrites the MSI route on `gsi`, or removes it when `address` is zero.
    /// Returns `None` when no entry carries `gsi`.
    pub fn update_msi_route(
        &mut self,
        gsi: u32,
        address: u64,
        data: u32,
    ) -> Option<MsiRouteChange> {
        let idx = self.entries.iter().position(|e| e.gsi == gsi)?;
        if address == 0 {
            self.entries.remove(idx);
            Some(MsiRouteChange::Removed)
        } else {
            self.entries[idx] = msi_entry(gsi, address, data);
            Some(MsiRouteChange::Updated)
        }
    }

    pub fn entries(&self) -> &[kvm_irq_routing_entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_gsi(&self) -> u32 {
        self.next_gsi
    }
}

// kvm_irq_routing_entry holds a union and cannot derive Debug.
impl fmt::Debug for GsiRoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GsiRoutingTable")
            .field("entries", &self.entries.len())
            .field("next_gsi", &self.next_gsi)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn irqchip_gsis(table: &GsiRoutingTable, chip: u32) -> Vec<u32> {
        table
            .entries()
            .iter()
            .filter(|e| {
                // SAFETY: entries of type IRQCHIP were built through
                // `irqchip_entry`, so the irqchip arm is the live one.
                e.type_ == KVM_IRQ_ROUTING_IRQCHIP && unsafe { e.u.irqchip.irqchip } == chip
            })
            .map(|e| e.gsi)
            .collect()
    }

    #[test]
    fn test_legacy_table_shape() {
        let table = GsiRoutingTable::with_legacy_routes();
        assert_eq!(table.len(), 38);
        assert_eq!(table.next_gsi(), FIRST_DYNAMIC_GSI);

        let master = irqchip_gsis(&table, KVM_IRQCHIP_PIC_MASTER);
        assert_eq!(master, vec![0, 1, 3, 4, 5, 6, 7]);

        let slave = irqchip_gsis(&table, KVM_IRQCHIP_PIC_SLAVE);
        assert_eq!(slave, (8..16).collect::<Vec<_>>());

        let ioapic = irqchip_gsis(&table, KVM_IRQCHIP_IOAPIC);
        assert_eq!(ioapic.len(), 23);
        assert!(!ioapic.contains(&2));

        // GSI 0 cascades onto IOAPIC pin 2, everything else maps 1:1.
        let pin_of = |gsi: u32| {
            table
                .entries()
                .iter()
                .find(|e| {
                    e.type_ == KVM_IRQ_ROUTING_IRQCHIP
                        && e.gsi == gsi
                        // SAFETY: see `irqchip_gsis`.
                        && unsafe { e.u.irqchip.irqchip } == KVM_IRQCHIP_IOAPIC
                })
                // SAFETY: see `irqchip_gsis`.
                .map(|e| unsafe { e.u.irqchip.pin })
        };
        assert_eq!(pin_of(0), Some(2));
        assert_eq!(pin_of(9), Some(9));
        assert_eq!(pin_of(23), Some(23));
    }

    #[test]
    fn test_add_msi_route() {
        let mut table = GsiRoutingTable::with_legacy_routes();
        let gsi = table.add_msi_route(0xfee0_0000, 0x4041);
        assert_eq!(gsi, 24);
        assert_eq!(table.len(), 39);
        assert_eq!(table.next_gsi(), 25);

        let entry = table.entries().iter().find(|e| e.gsi == 24).unwrap();
        assert_eq!(entry.type_, KVM_IRQ_ROUTING_MSI);
        // SAFETY: the entry was built through `msi_entry`.
        unsafe {
            assert_eq!(entry.u.msi.address_lo, 0xfee0_0000);
            assert_eq!(entry.u.msi.address_hi, 0);
            assert_eq!(entry.u.msi.data, 0x4041);
        }
    }

    #[test]
    fn test_update_msi_route_in_place() {
        let mut table = GsiRoutingTable::with_legacy_routes();
        let gsi = table.add_msi_route(0xfee0_0000, 0x11);
        let change = table.update_msi_route(gsi, 0x1_fee0_0000, 0x22).unwrap();
        assert_eq!(change, MsiRouteChange::Updated);
        assert_eq!(table.len(), 39);

        let entry = table.entries().iter().find(|e| e.gsi == gsi).unwrap();
        // SAFETY: the entry was rewritten through `msi_entry`.
        unsafe {
            assert_eq!(entry.u.msi.address_hi, 0x1);
            assert_eq!(entry.u.msi.data, 0x22);
        }
    }

    #[test]
    fn test_remove_msi_route() {
        let mut table = GsiRoutingTable::with_legacy_routes();
        let before = table.len();
        let gsi = table.add_msi_route(0xfee0_0000, 0x4041);

        let change = table.update_msi_route(gsi, 0, 0).unwrap();
        assert_eq!(change, MsiRouteChange::Removed);
        assert_eq!(table.len(), before);

        // A GSI is never reused, even after its route is gone.
        assert_eq!(table.add_msi_route(0xfee0_0000, 0x1), gsi + 1);
    }

    #[test]
    fn test_update_unknown_gsi() {
        let mut table = GsiRoutingTable::with_legacy_routes();
        assert!(table.update_msi_route(99, 0xfee0_0000, 0).is_none());
    }

    #[test]
    fn test_gsis_unique() {
        let mut table = GsiRoutingTable::with_legacy_routes();
        for i in 0..8 {
            table.add_msi_route(0xfee0_0000, i);
        }
        let mut gsis: Vec<u32> = table.entries().iter().map(|e| e.gsi).collect();
        let total = gsis.len();
        gsis.sort_unstable();
        gsis.dedup();
        assert_eq!(gsis.len(), total);
    }
}
