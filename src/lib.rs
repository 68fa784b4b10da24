// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Launcher of plain, TDX and SEV micro-VM guests.
//!
//! [`CliInstance::create`] turns a [`LaunchConfig`] into a running
//! [`GuestHandle`]: boot images are resolved, the serial and vsock sockets are
//! wired, the isolation mode is selected, guest memory is allocated and
//! loaded, SEV guests are optionally pre-attested against a remote proxy, and
//! only then are vCPUs started.

pub mod address_space;
pub mod attestation;
pub mod boot_image;
pub mod cli_instance;
pub mod config;
pub mod device_manager;
pub mod guest;
pub mod isolation;
pub mod parser;
pub mod utils;
pub mod vmm;

#[cfg(test)]
mod test_utils;

pub use crate::cli_instance::CliInstance;
pub use crate::config::{IsolationConfig, LaunchConfig, TeeType};
pub use crate::guest::GuestHandle;
pub use crate::utils::error::{LaunchError, LaunchStage, Result};
