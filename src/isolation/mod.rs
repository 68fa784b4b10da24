// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Isolation policy of a guest launch.
//!
//! An [`IsolationContext`] is selected once per launch from the isolation
//! mode of the [`LaunchConfig`]. It goes through three states:
//!
//! - `Open`: selected, nothing written to guest memory yet;
//! - `Measured`: launch digest computed, only secret injection is allowed;
//! - `Finalized`: locked, no further mutation.

use std::fmt;

use slog::info;

use crate::address_space::GuestMemory;
use crate::boot_image::BootImages;
use crate::config::{IsolationConfig, LaunchConfig, TeeType, CMDLINE_MAX_SIZE};
use crate::device_manager::guest_boot_args;
use crate::utils::error::{LaunchError, Result};
use crate::utils::hex_string;
use crate::vmm::VmmBackend;

/// Kernel command line parameters.
pub mod kernel_param;
/// OVMF GUID table parsing.
pub mod ovmf;
/// Host confidential computing capabilities.
pub mod protection;
/// AMD SEV launch strategy.
pub mod sev;
/// Intel TDX launch strategy.
pub mod tdx;

pub use self::sev::SevContext;
pub use self::tdx::TdxContext;

/// Digest of the initial guest state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchMeasurement {
    tee: TeeType,
    digest: Vec<u8>,
}

impl LaunchMeasurement {
    pub fn tee(&self) -> TeeType {
        self.tee
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }
}

impl fmt::Display for LaunchMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex_string(&self.digest))
    }
}

/// Lifecycle of an isolation context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Measured,
    Finalized,
}

/// Launch strategy for one isolation mode.
#[derive(Debug)]
pub enum IsolationStrategy {
    Plain,
    Tdx(TdxContext),
    Sev(SevContext),
}

/// Launch strategy plus its measurement state.
#[derive(Debug)]
pub struct IsolationContext {
    strategy: IsolationStrategy,
    boot_args: String,
    state: ContextState,
    measurement: Option<LaunchMeasurement>,
}

impl IsolationContext {
    /// Pick the launch strategy for `config`.
    ///
    /// The backend must support the requested mode; a confidential guest is
    /// never downgraded to a plain one.
    pub fn select(
        config: &LaunchConfig,
        images: &BootImages,
        backend: &dyn VmmBackend,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "isolation"));
        let tee = config.isolation.tee_type();
        if !backend.supports(tee) {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "backend {} cannot run {} guests",
                backend.name(),
                tee
            )));
        }

        let boot_args = match &config.isolation {
            IsolationConfig::Tdx(tdx) => tdx::tdx_boot_args(tdx.policy, &guest_boot_args(config)),
            _ => guest_boot_args(config),
        };
        // the caller's text was checked, additions may push it over the limit
        if boot_args.len() >= CMDLINE_MAX_SIZE {
            return Err(LaunchError::ConfigInvalid(format!(
                "effective boot args are {} bytes, limit is {}",
                boot_args.len(),
                CMDLINE_MAX_SIZE - 1
            )));
        }

        let strategy = match &config.isolation {
            IsolationConfig::None => IsolationStrategy::Plain,
            IsolationConfig::Tdx(tdx) => {
                IsolationStrategy::Tdx(TdxContext::new(tdx, images, &boot_args)?)
            }
            IsolationConfig::Sev(sev) => {
                IsolationStrategy::Sev(SevContext::new(sev, images, &boot_args, backend, &logger)?)
            }
        };

        info!(logger, "isolation selected";
            "tee" => %tee,
            "boot_args" => &boot_args,
            "pre_attestation" => config.isolation.attestation().is_some());
        Ok(IsolationContext {
            strategy,
            boot_args,
            state: ContextState::Open,
            measurement: None,
        })
    }

    pub fn tee_type(&self) -> TeeType {
        match self.strategy {
            IsolationStrategy::Plain => TeeType::None,
            IsolationStrategy::Tdx(_) => TeeType::Tdx,
            IsolationStrategy::Sev(_) => TeeType::Sev,
        }
    }

    pub fn strategy(&self) -> &IsolationStrategy {
        &self.strategy
    }

    /// Effective kernel command line.
    pub fn boot_args(&self) -> &str {
        &self.boot_args
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Whether a pre-attestation exchange must run before vCPUs start.
    pub fn requires_attestation(&self) -> bool {
        match &self.strategy {
            IsolationStrategy::Sev(sev) => sev.pre_attestation().is_some(),
            _ => false,
        }
    }

    /// Launch measurement, once computed. Plain guests have none.
    pub fn measurement(&self) -> Option<&LaunchMeasurement> {
        self.measurement.as_ref()
    }

    pub fn sev(&self) -> Option<&SevContext> {
        match &self.strategy {
            IsolationStrategy::Sev(sev) => Some(sev),
            _ => None,
        }
    }

    /// Compute the launch measurement, writing measured tables to guest
    /// memory first.
    pub fn measure(&mut self, memory: &GuestMemory) -> Result<Option<&LaunchMeasurement>> {
        if self.state != ContextState::Open {
            return Err(self.locked_error("measure"));
        }
        self.measurement = match &mut self.strategy {
            IsolationStrategy::Plain => None,
            IsolationStrategy::Tdx(tdx) => Some(LaunchMeasurement {
                tee: TeeType::Tdx,
                digest: tdx.measure(),
            }),
            IsolationStrategy::Sev(sev) => Some(LaunchMeasurement {
                tee: TeeType::Sev,
                digest: sev.measure(memory)?,
            }),
        };
        self.state = ContextState::Measured;
        Ok(self.measurement.as_ref())
    }

    /// Inject an encoded secret table into the SEV secret block. Only allowed
    /// between measurement and finalization.
    pub fn inject_secret(&mut self, memory: &GuestMemory, table: &[u8]) -> Result<()> {
        if self.state != ContextState::Measured {
            return Err(self.locked_error("inject a secret into"));
        }
        let tee = self.tee_type();
        match &mut self.strategy {
            IsolationStrategy::Sev(sev) => sev.inject_secret(memory, table),
            _ => Err(LaunchError::IsolationConfigInvalid(format!(
                "cannot inject secrets into {} guests",
                tee
            ))),
        }
    }

    /// Lock the context, measuring first if that has not happened yet.
    pub fn finalize(&mut self, memory: &GuestMemory) -> Result<Option<&LaunchMeasurement>> {
        match self.state {
            ContextState::Open => {
                self.measure(memory)?;
            }
            ContextState::Measured => {}
            ContextState::Finalized => return Err(self.locked_error("finalize")),
        }
        if let IsolationStrategy::Sev(sev) = &mut self.strategy {
            sev.finish()?;
        }
        self.state = ContextState::Finalized;
        Ok(self.measurement.as_ref())
    }

    fn locked_error(&self, action: &str) -> LaunchError {
        LaunchError::IsolationConfigInvalid(format!(
            "cannot {} a {} isolation context in state {:?}",
            action,
            self.tee_type(),
            self.state
        ))
    }
}
