// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Interface over KVM: the system handle, the VM, its vCPUs and guest memory.

pub mod kvm;
pub mod memory;
pub mod vcpu;
pub mod vm;
