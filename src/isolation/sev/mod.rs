// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! AMD SEV launch strategy with measured direct boot.
//!
//! The firmware advertises two regions through its OVMF GUID table: the
//! hashes table, which receives the digests of kernel, initrd and command
//! line before launch, and the secret block, which receives secrets
//! provisioned by pre-attestation.
//!
//! The launcher plays the guest owner towards the SEV firmware: it checks
//! the platform certificate chain, wraps the transport keys for the
//! platform, verifies the launch measurement against the digest of what it
//! loaded and hands secrets to the firmware as LAUNCH_SECRET packets.

use std::convert::TryFrom;
use std::fmt;

use openssl::sha::{sha256, Sha256};
use slog::info;
use vm_memory::Address;

use super::ovmf::{parse_ovmf_table, SevHashesTableGpa, SevSecretBlockGpa};
use crate::address_space::GuestMemory;
use crate::boot_image::BootImages;
use crate::config::{AttestationSpec, SevConfig, SevPolicy};
use crate::utils::error::{LaunchError, Result};
use crate::utils::{error_chain, hex_string};
use crate::vmm::{SevLauncher, VmmBackend};

/// SEV and AMD CA certificate formats.
pub mod certs;
/// Guest owner side of the launch.
pub mod session;

pub use self::certs::{CertError, Issuer, PlatformChain, SevCertificate, Usage};
pub use self::session::{
    Build, Initialized, LaunchSession, Measurement, Secret, SecretHeader, Session, SessionError,
    Start, Verified,
};

// 9438d606-4f22-4cc9-b479-a793d411fd21
const SEV_HASH_TABLE_HEADER_GUID: [u8; 16] = [
    0x06, 0xd6, 0x38, 0x94, 0x22, 0x4f, 0xc9, 0x4c, 0xb4, 0x79, 0xa7, 0x93, 0xd4, 0x11, 0xfd, 0x21,
];
// 97d02dd8-bd20-4c94-aa78-e7714d36ab2a
const SEV_CMDLINE_ENTRY_GUID: [u8; 16] = [
    0xd8, 0x2d, 0xd0, 0x97, 0x20, 0xbd, 0x94, 0x4c, 0xaa, 0x78, 0xe7, 0x71, 0x4d, 0x36, 0xab, 0x2a,
];
// 44baf731-3a2f-4bd7-9af1-41e29169781d
const SEV_INITRD_ENTRY_GUID: [u8; 16] = [
    0x31, 0xf7, 0xba, 0x44, 0x2f, 0x3a, 0xd7, 0x4b, 0x9a, 0xf1, 0x41, 0xe2, 0x91, 0x69, 0x78, 0x1d,
];
// 4de79437-abd2-427f-b835-d5b172d2045b
const SEV_KERNEL_ENTRY_GUID: [u8; 16] = [
    0x37, 0x94, 0xe7, 0x4d, 0xd2, 0xab, 0x7f, 0x42, 0xb8, 0x35, 0xd5, 0xb1, 0x72, 0xd2, 0x04, 0x5b,
];

const SHA256_LEN: usize = 32;
const HASH_TABLE_ENTRY_LEN: usize = 16 + 2 + SHA256_LEN;
const HASH_TABLE_LEN: usize = 16 + 2 + 3 * HASH_TABLE_ENTRY_LEN;
/// Size of the hashes table once padded to a 16 byte boundary.
pub const PADDED_HASH_TABLE_LEN: usize = (HASH_TABLE_LEN + 15) & !15;

/// Build the measured direct boot hashes table for the given payload.
///
/// The command line is hashed with its trailing NUL; a missing initrd is
/// hashed as an empty blob.
pub fn build_hashes_table(kernel: &[u8], initrd: &[u8], cmdline: &str) -> Vec<u8> {
    let mut cmdline_bytes = Vec::with_capacity(cmdline.len() + 1);
    cmdline_bytes.extend_from_slice(cmdline.as_bytes());
    cmdline_bytes.push(0);

    let mut table = Vec::with_capacity(PADDED_HASH_TABLE_LEN);
    table.extend_from_slice(&SEV_HASH_TABLE_HEADER_GUID);
    table.extend_from_slice(&(HASH_TABLE_LEN as u16).to_le_bytes());
    for (guid, data) in [
        (SEV_CMDLINE_ENTRY_GUID, &cmdline_bytes[..]),
        (SEV_INITRD_ENTRY_GUID, initrd),
        (SEV_KERNEL_ENTRY_GUID, kernel),
    ] {
        table.extend_from_slice(&guid);
        table.extend_from_slice(&(HASH_TABLE_ENTRY_LEN as u16).to_le_bytes());
        table.extend_from_slice(&sha256(data));
    }
    table.resize(PADDED_HASH_TABLE_LEN, 0);
    table
}

/// Launch state of an SEV guest.
pub struct SevContext {
    policy: SevPolicy,
    chain: PlatformChain,
    build: Build,
    launcher: Box<dyn SevLauncher>,
    session: Option<Session<Initialized>>,
    verified: Option<Session<Verified>>,
    hashes_table: Vec<u8>,
    hashes_gpa: SevHashesTableGpa,
    secret_block: SevSecretBlockGpa,
    launch_digest: Option<[u8; 32]>,
    pre_attestation: Option<AttestationSpec>,
    logger: slog::Logger,
}

impl fmt::Debug for SevContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SevContext")
            .field("policy", &self.policy)
            .field("build", &self.build)
            .field("hashes_gpa", &self.hashes_gpa)
            .field("secret_block", &self.secret_block)
            .field("measured", &self.verified.is_some())
            .field("pre_attestation", &self.pre_attestation)
            .finish()
    }
}

impl SevContext {
    /// Check `config` against the resolved images and start the launch on
    /// the backend's SEV firmware. `boot_args` is the effective command line.
    pub fn new(
        config: &SevConfig,
        images: &BootImages,
        boot_args: &str,
        backend: &dyn VmmBackend,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let reserved = config.policy.reserved_bits();
        if reserved != 0 {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "reserved SEV policy bits 0x{:x} are set",
                reserved
            )));
        }
        let firmware = images.firmware.as_ref().ok_or_else(|| {
            LaunchError::IsolationConfigInvalid("SEV guests require an OVMF firmware".to_string())
        })?;

        let (secret_block, hashes_gpa) = parse_ovmf_table(firmware.bytes()).map_err(|e| {
            LaunchError::IsolationConfigInvalid(format!(
                "firmware {:?}: {}",
                firmware.path(),
                e
            ))
        })?;
        if (hashes_gpa.size as usize) < PADDED_HASH_TABLE_LEN {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "SEV hashes table area of {} bytes is too small",
                hashes_gpa.size
            )));
        }

        let chain = PlatformChain::load(&config.cert_chain_path)?;
        let session = Session::try_from(config.policy).map_err(|e| session_error("create", &e))?;
        let start = session.start(&chain).map_err(|e| {
            LaunchError::IsolationConfigInvalid(format!(
                "certificate chain {:?}: {}",
                config.cert_chain_path,
                error_chain(&e)
            ))
        })?;

        let mut launcher = backend.sev_launcher()?;
        let build = launcher.build()?;
        let (api_major, api_minor) = config.policy.api_version();
        if (build.api_major, build.api_minor) < (api_major, api_minor) {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "SEV policy requires firmware API {}.{}, platform runs {}.{}",
                api_major, api_minor, build.api_major, build.api_minor
            )));
        }
        launcher.start(&start)?;
        info!(logger, "SEV launch started";
            "policy" => format!("0x{:x}", config.policy.0),
            "api" => format!("{}.{}", build.api_major, build.api_minor),
            "build" => build.build);

        let hashes_table = build_hashes_table(
            images.kernel.image.bytes(),
            images.initrd.as_ref().map_or(&[][..], |i| i.bytes()),
            boot_args,
        );

        Ok(SevContext {
            policy: config.policy,
            chain,
            build,
            launcher,
            session: Some(session),
            verified: None,
            hashes_table,
            hashes_gpa,
            secret_block,
            launch_digest: None,
            pre_attestation: config.pre_attestation.clone(),
            logger: logger.clone(),
        })
    }

    pub fn policy(&self) -> SevPolicy {
        self.policy
    }

    /// Platform certificate chain, also the trust anchor of pre-attestation.
    pub fn cert_chain(&self) -> &PlatformChain {
        &self.chain
    }

    pub fn secret_block(&self) -> SevSecretBlockGpa {
        self.secret_block
    }

    pub fn hashes_table_gpa(&self) -> SevHashesTableGpa {
        self.hashes_gpa
    }

    pub fn pre_attestation(&self) -> Option<&AttestationSpec> {
        self.pre_attestation.as_ref()
    }

    /// SHA-256 over the measured memory, once measured.
    pub fn launch_digest(&self) -> Option<&[u8; 32]> {
        self.launch_digest.as_ref()
    }

    /// Write the hashes table, have the firmware measure the firmware window
    /// and the table, and check its measurement against the expected launch
    /// digest. Returns the measurement followed by its nonce.
    pub fn measure(&mut self, memory: &GuestMemory) -> Result<Vec<u8>> {
        let session = self.session.take().ok_or_else(|| {
            LaunchError::IsolationConfigInvalid("SEV launch was already measured".to_string())
        })?;
        let hashes_addr = self.hashes_gpa.addr as u64;
        memory
            .write_bytes(hashes_addr, &self.hashes_table)
            .map_err(|e| {
                LaunchError::IsolationConfigInvalid(format!(
                    "cannot place SEV hashes table: {}",
                    error_chain(&e)
                ))
            })?;

        let mut digest = Sha256::new();
        let mut regions = Vec::with_capacity(2);
        if let Some((addr, len)) = memory.firmware_window() {
            regions.push((addr.raw_value(), len));
        }
        regions.push((hashes_addr, self.hashes_table.len()));
        for (gpa, len) in regions {
            digest.update(&memory.read_bytes(gpa, len)?);
            self.launcher.update_data(memory, gpa, len)?;
        }
        let digest = digest.finish();

        let measurement = self.launcher.measure()?;
        let verified = session
            .verify(&digest, self.build, measurement)
            .map_err(|e| session_error("verify", &e))?;
        info!(self.logger, "SEV launch measured";
            "digest" => hex_string(&digest),
            "measurement" => hex_string(&measurement.measure));
        self.verified = Some(verified);
        self.launch_digest = Some(digest);
        Ok(measurement.to_bytes())
    }

    /// Hand an encoded secret table to the firmware for the secret block.
    pub fn inject_secret(&mut self, memory: &GuestMemory, table: &[u8]) -> Result<()> {
        if table.len() > self.secret_block.size as usize {
            return Err(LaunchError::AttestationProtocolError(format!(
                "secret table of {} bytes exceeds the {} byte secret block",
                table.len(),
                self.secret_block.size
            )));
        }
        let session = self.verified.as_ref().ok_or_else(|| {
            LaunchError::AttestationProtocolError("SEV launch is not measured yet".to_string())
        })?;
        let secret = session.secret(0, table).map_err(|e| {
            LaunchError::AttestationProtocolError(format!(
                "cannot package secret: {}",
                error_chain(&e)
            ))
        })?;
        self.launcher
            .inject_secret(memory, self.secret_block.addr as u64, &secret)
    }

    /// Close the launch; the guest can run from now on.
    pub fn finish(&mut self) -> Result<()> {
        self.launcher.finish()
    }
}

fn session_error(action: &str, e: &SessionError) -> LaunchError {
    LaunchError::IsolationConfigInvalid(format!(
        "cannot {} SEV launch session: {}",
        action,
        error_chain(e)
    ))
}
