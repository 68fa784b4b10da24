// Copyright (C) 2020-2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy surfaced by a guest launch.

use std::fmt;
use std::path::PathBuf;

use crate::boot_image::ImageKind;
use crate::device_manager::DeviceKind;

/// Specialized version of `std::result::Result` for launch operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Stages of `CliInstance::create`, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchStage {
    /// Configuration consistency checks.
    Validate,
    /// Boot image resolution.
    ResolveImages,
    /// Serial and vsock socket binding.
    WireDevices,
    /// Isolation strategy selection.
    SelectIsolation,
    /// Guest memory allocation and image placement.
    AllocateMemory,
    /// Pre-attestation secret provisioning.
    Attest,
    /// Launch measurement and context lock.
    FinalizeIsolation,
    /// vCPU creation and start.
    StartVcpus,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LaunchStage::Validate => "validate",
            LaunchStage::ResolveImages => "resolve-images",
            LaunchStage::WireDevices => "wire-devices",
            LaunchStage::SelectIsolation => "select-isolation",
            LaunchStage::AllocateMemory => "allocate-memory",
            LaunchStage::Attest => "attest",
            LaunchStage::FinalizeIsolation => "finalize-isolation",
            LaunchStage::StartVcpus => "start-vcpus",
        };
        f.write_str(name)
    }
}

/// Errors returned by a guest launch. Every variant is reported after the
/// resources acquired by the failed launch have been released.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Inconsistent or missing configuration fields.
    #[error("invalid launch configuration: {0}")]
    ConfigInvalid(String),

    /// A boot image path does not exist.
    #[error("{kind} image not found at {path:?}: {reason}")]
    ImageNotFound {
        kind: ImageKind,
        path: PathBuf,
        reason: String,
    },

    /// A boot image exists but could not be opened or read.
    #[error("{kind} image at {path:?} is unreadable: {reason}")]
    ImageUnreadable {
        kind: ImageKind,
        path: PathBuf,
        reason: String,
    },

    /// A boot image was read but its content is not loadable.
    #[error("{kind} image at {path:?} has an invalid format: {reason}")]
    ImageFormatInvalid {
        kind: ImageKind,
        path: PathBuf,
        reason: String,
    },

    /// A host-side device socket could not be bound.
    #[error("cannot bind {kind} socket at {path:?}")]
    DeviceBindFailed {
        kind: DeviceKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The isolation mode cannot be honoured with the given resources.
    #[error("invalid isolation configuration: {0}")]
    IsolationConfigInvalid(String),

    /// The attestation proxy could not be reached, timed out, or answered
    /// with a non-success status.
    #[error("attestation proxy {url} failed: {reason}")]
    AttestationNetworkError { url: String, reason: String },

    /// The certificate chain or signature returned by the proxy was rejected.
    #[error("attestation chain rejected for launch measurement {measurement}: {reason}")]
    AttestationChainInvalid { measurement: String, reason: String },

    /// The proxy exchange violated the request/response contract.
    #[error("attestation protocol violation: {0}")]
    AttestationProtocolError(String),

    /// Guest memory or vCPU allocation failed in the backend.
    #[error("guest resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The VMM backend failed for a reason other than exhaustion.
    #[error("vmm backend failure: {0}")]
    Backend(String),

    /// The caller cancelled the launch.
    #[error("launch cancelled before stage {0}")]
    Cancelled(LaunchStage),
}
