// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Wrapper over the system-wide KVM device node.

use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::Kvm as KvmFd;

/// Errors associated with opening and interrogating /dev/kvm.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum KvmError {
    /// The host kernel reports an unsupported KVM API version: {0}
    ApiVersion(i32),
    /// Error opening the KVM device node: {0}
    Kvm(kvm_ioctls::Error),
    /// Error reading the vCPU shared-state region size: {0}
    VcpuMmapSize(kvm_ioctls::Error),
}

/// The process-wide KVM handle plus the host parameters read from it once.
#[derive(Debug)]
pub struct Kvm {
    /// The file descriptor used for system-level requests.
    pub fd: KvmFd,
    /// Size of the per-vCPU region shared with the kernel.
    pub vcpu_mmap_size: usize,
}

impl Kvm {
    /// Open /dev/kvm, verify the API version and read the vCPU mmap size.
    pub fn new() -> Result<Kvm, KvmError> {
        let fd = KvmFd::new().map_err(KvmError::Kvm)?;

        // Safe to cast because this is a constant.
        #[allow(clippy::cast_possible_wrap)]
        if fd.get_api_version() != KVM_API_VERSION as i32 {
            return Err(KvmError::ApiVersion(fd.get_api_version()));
        }

        let vcpu_mmap_size = fd.get_vcpu_mmap_size().map_err(KvmError::VcpuMmapSize)?;

        Ok(Kvm { fd, vcpu_mmap_size })
    }
}
