// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handle of a launched guest.

use std::fmt;

use slog::{info, warn};

use crate::address_space::{BootLayout, GuestMemory};
use crate::attestation::AttestationReport;
use crate::boot_image::BootImages;
use crate::config::TeeType;
use crate::device_manager::DeviceEndpoints;
use crate::isolation::{IsolationContext, LaunchMeasurement};
use crate::utils::error::Result;
use crate::utils::resource::ResourceTicket;
use crate::vmm::RunningVm;

/// A running guest and every resource it owns.
///
/// Resources are released by [`GuestHandle::destroy`] or on drop: vCPUs are
/// stopped first, then guest memory, device endpoints and boot images are
/// released.
pub struct GuestHandle {
    id: String,
    tee: TeeType,
    boot_args: String,
    layout: BootLayout,
    attestation: Option<AttestationReport>,
    vm: Option<Box<dyn RunningVm>>,
    vcpus: Option<ResourceTicket>,
    memory: Option<GuestMemory>,
    isolation: Option<IsolationContext>,
    devices: Option<DeviceEndpoints>,
    images: Option<BootImages>,
    logger: slog::Logger,
}

/// Everything `CliInstance::create` hands over to a started guest.
pub(crate) struct GuestParts {
    pub id: String,
    pub layout: BootLayout,
    pub attestation: Option<AttestationReport>,
    pub vm: Box<dyn RunningVm>,
    pub vcpus: ResourceTicket,
    pub memory: GuestMemory,
    pub isolation: IsolationContext,
    pub devices: DeviceEndpoints,
    pub images: BootImages,
}

impl GuestHandle {
    pub(crate) fn new(parts: GuestParts, logger: &slog::Logger) -> Self {
        GuestHandle {
            tee: parts.isolation.tee_type(),
            boot_args: parts.isolation.boot_args().to_string(),
            id: parts.id,
            layout: parts.layout,
            attestation: parts.attestation,
            vm: Some(parts.vm),
            vcpus: Some(parts.vcpus),
            memory: Some(parts.memory),
            isolation: Some(parts.isolation),
            devices: Some(parts.devices),
            images: Some(parts.images),
            logger: logger.clone(),
        }
    }

    /// Guest identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Isolation mode the guest runs under.
    pub fn isolation(&self) -> TeeType {
        self.tee
    }

    /// Kernel command line the guest booted with.
    pub fn boot_args(&self) -> &str {
        &self.boot_args
    }

    pub fn boot_layout(&self) -> &BootLayout {
        &self.layout
    }

    /// Launch measurement; `None` for plain guests or once destroyed.
    pub fn measurement(&self) -> Option<&LaunchMeasurement> {
        self.isolation.as_ref().and_then(|ctx| ctx.measurement())
    }

    /// Pre-attestation outcome, if the guest was attested.
    pub fn attestation(&self) -> Option<&AttestationReport> {
        self.attestation.as_ref()
    }

    /// Serial and vsock endpoints, until the guest is destroyed.
    pub fn devices(&self) -> Option<&DeviceEndpoints> {
        self.devices.as_ref()
    }

    /// Number of running vCPUs, zero once destroyed.
    pub fn vcpu_count(&self) -> u8 {
        self.vm.as_ref().map_or(0, |vm| vm.vcpu_count())
    }

    pub fn is_running(&self) -> bool {
        self.vm.is_some()
    }

    /// Block until every vCPU of the guest has exited.
    pub fn wait(&mut self) -> Result<()> {
        match self.vm.as_mut() {
            Some(vm) => vm.wait(),
            None => Ok(()),
        }
    }

    /// Stop the vCPUs and release every resource. Calling it again is a
    /// no-op.
    pub fn destroy(&mut self) -> Result<()> {
        let mut vm = match self.vm.take() {
            Some(vm) => vm,
            None => return Ok(()),
        };
        let result = vm.shutdown();
        drop(vm);
        self.vcpus.take();

        self.memory.take();
        self.isolation.take();
        self.devices.take();
        self.images.take();

        match result.as_ref() {
            Ok(()) => info!(self.logger, "guest destroyed"),
            Err(e) => warn!(self.logger, "guest destroyed, vcpu shutdown failed"; "error" => %e),
        }
        result
    }
}

impl Drop for GuestHandle {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

impl fmt::Debug for GuestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GuestHandle")
            .field("id", &self.id)
            .field("tee", &self.tee)
            .field("running", &self.is_running())
            .field("measurement", &self.measurement().map(|m| m.to_string()))
            .finish()
    }
}
