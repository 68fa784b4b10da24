// Copyright (c) 2019-2022 Alibaba Cloud
// Copyright (c) 2019-2022 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest launch orchestration.
//!
//! ```text
//! validate -> resolve images -> wire devices -> select isolation
//!          -> allocate memory -> [attest] -> finalize isolation -> start vcpus
//! ```
//!
//! Every stage owns what it acquires through guards, and the guards of a
//! failed launch are dropped in reverse acquisition order before the error
//! reaches the caller. vCPUs are started by this path only.

use std::sync::Arc;

use slog::{debug, error, info};

use crate::address_space::GuestMemory;
use crate::attestation::{
    AttestationSession, ChainVerifier, HttpProxyClient, ProxyClient, SevChainVerifier,
};
use crate::boot_image::BootImages;
use crate::config::LaunchConfig;
use crate::device_manager::{mmio_slots, DeviceEndpoints};
use crate::guest::{GuestHandle, GuestParts};
use crate::isolation::IsolationContext;
use crate::utils::error::{LaunchError, LaunchStage, Result};
use crate::utils::resource::{ResourceKind, ResourceStats};
use crate::utils::CancelFlag;
use crate::vmm::{VmLaunchParams, VmmBackend};

/// Launcher of guests over one VMM backend.
pub struct CliInstance {
    logger: slog::Logger,
    stats: ResourceStats,
    backend: Arc<dyn VmmBackend>,
    proxy: Arc<dyn ProxyClient>,
    verifier: Arc<dyn ChainVerifier>,
    cancel: CancelFlag,
}

impl CliInstance {
    /// Create a launcher using the HTTP attestation client and the OpenSSL
    /// chain verifier.
    pub fn new(backend: Arc<dyn VmmBackend>, logger: &slog::Logger) -> Self {
        CliInstance {
            logger: logger.new(slog::o!("subsystem" => "cli_instance")),
            stats: ResourceStats::new(),
            backend,
            proxy: Arc::new(HttpProxyClient::new()),
            verifier: Arc::new(SevChainVerifier::new()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyClient>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ChainVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag cancelling launches in progress.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Live resources of every guest launched by this instance.
    pub fn stats(&self) -> &ResourceStats {
        &self.stats
    }

    /// Launch the guest described by `config`.
    ///
    /// Either a running guest is returned or nothing acquired by this call
    /// survives it.
    pub fn create(&self, config: &LaunchConfig) -> Result<GuestHandle> {
        let logger = self.logger.new(slog::o!("guest" => config.id.clone()));
        info!(logger, "creating guest"; "tee" => %config.isolation.tee_type());

        let mut stage = LaunchStage::Validate;
        match self.launch(config, &logger, &mut stage) {
            Ok(guest) => {
                info!(logger, "guest started";
                    "vcpus" => guest.vcpu_count(),
                    "measurement" => guest.measurement().map(|m| m.to_string()));
                Ok(guest)
            }
            Err(e) => {
                // every guard of the failed launch is gone by now
                error!(logger, "guest launch failed, acquired resources released";
                    "stage" => %stage, "error" => %e);
                Err(e)
            }
        }
    }

    fn enter(
        &self,
        current: &mut LaunchStage,
        stage: LaunchStage,
        logger: &slog::Logger,
    ) -> Result<()> {
        *current = stage;
        if self.cancel.is_cancelled() {
            return Err(LaunchError::Cancelled(stage));
        }
        debug!(logger, "entering launch stage"; "stage" => %stage);
        Ok(())
    }

    /// Run the launch stages, recording the one in progress in `stage`.
    fn launch(
        &self,
        config: &LaunchConfig,
        logger: &slog::Logger,
        stage: &mut LaunchStage,
    ) -> Result<GuestHandle> {
        self.enter(stage, LaunchStage::Validate, logger)?;
        config.validate()?;

        self.enter(stage, LaunchStage::ResolveImages, logger)?;
        let images = BootImages::resolve(&config.boot, &self.stats, logger)?;

        self.enter(stage, LaunchStage::WireDevices, logger)?;
        let devices = DeviceEndpoints::wire(config, &self.stats, logger)?;

        self.enter(stage, LaunchStage::SelectIsolation, logger)?;
        let mut isolation =
            IsolationContext::select(config, &images, self.backend.as_ref(), logger)?;

        self.enter(stage, LaunchStage::AllocateMemory, logger)?;
        let firmware_size = images.firmware.as_ref().map(|f| f.len());
        let memory = GuestMemory::allocate(&config.machine, firmware_size, &self.stats, logger)?;
        let layout = memory.place_images(&images, isolation.boot_args(), logger)?;

        let attestation = match config.isolation.attestation() {
            Some(spec) if isolation.requires_attestation() => {
                self.enter(stage, LaunchStage::Attest, logger)?;
                let mut session = AttestationSession::new(spec.clone(), logger);
                let result = session.run(
                    &mut isolation,
                    &memory,
                    self.proxy.as_ref(),
                    self.verifier.as_ref(),
                    config.attestation_timeout,
                    &self.cancel,
                );
                let report = session.report();
                drop(session);
                result?;
                Some(report)
            }
            _ => None,
        };

        self.enter(stage, LaunchStage::FinalizeIsolation, logger)?;
        if let Some(measurement) = isolation.finalize(&memory)? {
            info!(logger, "isolation context finalized";
                "tee" => %measurement.tee(), "measurement" => %measurement);
        }

        self.enter(stage, LaunchStage::StartVcpus, logger)?;
        let vm = self.backend.start_vcpus(VmLaunchParams {
            id: config.id.clone(),
            tee: isolation.tee_type(),
            vcpu_count: config.machine.vcpu_count,
            memory: memory.memory().clone(),
            regions: memory.host_regions(),
            boot: layout.clone(),
            serial: devices.serial_sink(),
            rootfs: images.rootfs.as_ref().map(|r| r.block_backing()).transpose()?,
            vsock: devices.vsock_endpoint(),
            mmio_slots: mmio_slots(config),
            logger: logger.clone(),
        })?;
        let vcpus = self.stats.acquire(ResourceKind::Vcpus);

        Ok(GuestHandle::new(
            GuestParts {
                id: config.id.clone(),
                layout,
                attestation,
                vm,
                vcpus,
                memory,
                isolation,
                devices,
                images,
            },
            logger,
        ))
    }
}
