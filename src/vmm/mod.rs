// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hypervisor boundary of the launcher.
//!
//! The launcher prepares memory, images and isolation state on its own and
//! only asks a [`VmmBackend`] to run vCPUs over the prepared guest memory.

use vm_memory::GuestMemoryMmap;

use crate::address_space::{BootLayout, GuestMemory};
use crate::boot_image::BlockBacking;
use crate::config::TeeType;
use crate::device_manager::{MmioSlot, SerialSink, VsockEndpoint};
use crate::isolation::sev::{Build, Measurement, Secret, Start};
use crate::utils::error::{LaunchError, Result};

/// KVM reference backend.
pub mod kvm;
/// Minimal 16550 UART emulation for the guest console.
pub mod serial;
/// Virtio-mmio block and vsock devices.
pub mod virtio;

pub use self::kvm::KvmBackend;

/// Everything a backend needs to start a prepared guest.
pub struct VmLaunchParams {
    /// Guest identifier, for logs and thread names.
    pub id: String,
    pub tee: TeeType,
    /// Number of vCPUs to create and start.
    pub vcpu_count: u8,
    /// Guest memory. The backend keeps a handle to it until its vCPUs exit.
    pub memory: GuestMemoryMmap,
    /// Guest regions as (guest address, length, host address).
    pub regions: Vec<(u64, u64, u64)>,
    /// Where the images were placed and how the boot CPU enters.
    pub boot: BootLayout,
    /// Console sink for the guest serial port, if a serial socket is wired.
    pub serial: Option<SerialSink>,
    /// Disk behind the virtio block device, if a rootfs is configured.
    pub rootfs: Option<BlockBacking>,
    /// Host side of the guest vsock device, if a vsock socket is wired.
    pub vsock: Option<VsockEndpoint>,
    /// Where the virtio-mmio devices sit, as announced on the kernel command line.
    pub mmio_slots: Vec<MmioSlot>,
    pub logger: slog::Logger,
}

/// A hypervisor able to run prepared guests.
pub trait VmmBackend: Send + Sync {
    /// Short name, for logs and errors.
    fn name(&self) -> &str;

    /// Whether guests of the given isolation mode can run on this backend.
    fn supports(&self, tee: TeeType) -> bool;

    /// Create the vCPUs of a prepared guest and start them.
    fn start_vcpus(&self, params: VmLaunchParams) -> Result<Box<dyn RunningVm>>;

    /// Open the SEV firmware for a new launch.
    fn sev_launcher(&self) -> Result<Box<dyn SevLauncher>> {
        Err(LaunchError::IsolationConfigInvalid(format!(
            "backend {} has no SEV firmware",
            self.name()
        )))
    }
}

/// SEV firmware commands of one guest launch, in the order they are issued.
pub trait SevLauncher: Send {
    /// Firmware version, as reported by PLATFORM_STATUS.
    fn build(&self) -> Result<Build>;

    /// LAUNCH_START with the guest owner's session.
    fn start(&mut self, start: &Start) -> Result<()>;

    /// LAUNCH_UPDATE_DATA: encrypt `len` bytes of guest memory at `gpa` in
    /// place and add them to the measurement.
    fn update_data(&mut self, memory: &GuestMemory, gpa: u64, len: usize) -> Result<()>;

    /// LAUNCH_MEASURE.
    fn measure(&mut self) -> Result<Measurement>;

    /// LAUNCH_SECRET: decrypt `secret` into guest memory at `gpa`.
    fn inject_secret(&mut self, memory: &GuestMemory, gpa: u64, secret: &Secret) -> Result<()>;

    /// LAUNCH_FINISH. No launch command is accepted afterwards.
    fn finish(&mut self) -> Result<()>;
}

/// A guest whose vCPUs are running.
pub trait RunningVm: Send {
    fn vcpu_count(&self) -> u8;

    /// Block until every vCPU has exited.
    fn wait(&mut self) -> Result<()>;

    /// Stop every vCPU and wait for them. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<()>;
}
