// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Declarative description of a guest launch.
//!
//! A [`LaunchConfig`] is built once (usually from command line arguments) and
//! then only read by the launcher. Isolation and pre-attestation settings are
//! nested so that pre-attestation can only be expressed for SEV guests.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::utils::error::{LaunchError, Result};

/// Default timeout of the attestation proxy round trip.
pub const DEFAULT_ATTESTATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Guest context id used for the vsock device when none is given.
pub const DEFAULT_VSOCK_GUEST_CID: u32 = 42;
/// Upper bound of vCPUs of one guest.
pub const MAX_SUPPORTED_VCPUS: u8 = 254;
/// Kernel command line capacity, including the trailing NUL.
pub const CMDLINE_MAX_SIZE: usize = 4096;
/// Secret type requested from the attestation proxy by default.
pub const DEFAULT_SECRET_TYPE: &str = "bundle";
/// Secret GUID requested from the attestation proxy by default.
pub const DEFAULT_SECRET_GUID: &str = "e6f5a162-d67f-4750-a67c-5d065f2a9910";
/// Key set requested from the attestation proxy by default.
pub const DEFAULT_KEYSET: &str = "KEYSET-1";

// Guest CIDs 0, 1 and 2 are reserved for the hypervisor, local and host.
const VSOCK_MIN_GUEST_CID: u32 = 3;
const MIB: usize = 1 << 20;

/// Trusted execution environment requested for a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeeType {
    /// Plain, non-confidential guest.
    None,
    /// Intel Trust Domain Extensions.
    Tdx,
    /// AMD Secure Encrypted Virtualization.
    Sev,
}

impl fmt::Display for TeeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TeeType::None => f.write_str("none"),
            TeeType::Tdx => f.write_str("tdx"),
            TeeType::Sev => f.write_str("sev"),
        }
    }
}

impl FromStr for TeeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(TeeType::None),
            "tdx" => Ok(TeeType::Tdx),
            "sev" => Ok(TeeType::Sev),
            other => Err(format!("unknown tee type {:?}, expect none, tdx or sev", other)),
        }
    }
}

/// CPU topology exposed to the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuTopology {
    /// Threads per core, 1 or 2.
    pub threads_per_core: u8,
    /// Cores per die.
    pub cores_per_die: u8,
    /// Dies per socket.
    pub dies_per_socket: u8,
    /// Number of sockets.
    pub sockets: u8,
}

impl Default for CpuTopology {
    fn default() -> Self {
        CpuTopology {
            threads_per_core: 1,
            cores_per_die: 1,
            dies_per_socket: 1,
            sockets: 1,
        }
    }
}

impl CpuTopology {
    /// Number of logical CPUs the topology can hold.
    pub fn capacity(&self) -> usize {
        self.threads_per_core as usize
            * self.cores_per_die as usize
            * self.dies_per_socket as usize
            * self.sockets as usize
    }
}

/// Where guest RAM comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryBacking {
    /// Anonymous shared memory.
    Anonymous,
    /// A file, for example on a hugetlbfs mount.
    File(PathBuf),
}

/// Guest machine shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Guest memory size in MiB.
    pub mem_size_mib: usize,
    /// Number of vCPUs started at boot.
    pub vcpu_count: u8,
    /// Ceiling of vCPUs.
    pub max_vcpu_count: u8,
    /// CPU topology.
    pub cpu_topology: CpuTopology,
    /// Guest memory backing.
    pub mem_backing: MemoryBacking,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            mem_size_mib: 128,
            vcpu_count: 1,
            max_vcpu_count: 1,
            cpu_topology: CpuTopology::default(),
            mem_backing: MemoryBacking::Anonymous,
        }
    }
}

impl MachineConfig {
    /// Guest memory size in bytes.
    pub fn mem_size_bytes(&self) -> Option<usize> {
        self.mem_size_mib.checked_mul(MIB)
    }
}

/// Root block device backing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootfsConfig {
    /// Host path of the image.
    pub path: PathBuf,
    /// Whether the device is the guest's root device.
    pub is_root: bool,
    /// Whether the device is exposed read-only.
    pub is_read_only: bool,
}

/// Boot images and kernel command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootSourceConfig {
    /// Guest kernel.
    pub kernel_path: PathBuf,
    /// Firmware (OVMF or TD shim), required for confidential guests.
    pub firmware_path: Option<PathBuf>,
    /// Initial ramdisk.
    pub initrd_path: Option<PathBuf>,
    /// Root block device.
    pub rootfs: Option<RootfsConfig>,
    /// Kernel command line, passed through verbatim.
    pub boot_args: String,
}

/// Hybrid vsock device settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VsockConfig {
    /// Host Unix socket path.
    pub uds_path: PathBuf,
    /// Guest context id.
    pub guest_cid: u32,
}

/// TDX guest policy bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TdxPolicy(pub u32);

impl TdxPolicy {
    /// Debuggable trust domain.
    pub const DEBUG: u32 = 1 << 0;
    /// Disable the guest kernel's device filter.
    pub const DISABLE_FILTER: u32 = 1 << 1;

    const KNOWN: u32 = Self::DEBUG | Self::DISABLE_FILTER;

    pub fn debug(&self) -> bool {
        self.0 & Self::DEBUG != 0
    }

    pub fn disable_filter(&self) -> bool {
        self.0 & Self::DISABLE_FILTER != 0
    }

    /// Bits that do not name a known policy.
    pub fn unknown_bits(&self) -> u32 {
        self.0 & !Self::KNOWN
    }
}

/// SEV guest policy, as defined by the AMD SEV API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SevPolicy(pub u32);

impl SevPolicy {
    /// Debugging of the guest is disallowed.
    pub const NODBG: u32 = 1 << 0;
    /// Sharing keys with other guests is disallowed.
    pub const NOKS: u32 = 1 << 1;
    /// SEV-ES is required.
    pub const ES: u32 = 1 << 2;
    /// Sending the guest to another platform is disallowed.
    pub const NOSEND: u32 = 1 << 3;
    /// The guest must not leave the domain.
    pub const DOMAIN: u32 = 1 << 4;
    /// The guest must not leave SEV-capable platforms.
    pub const SEV: u32 = 1 << 5;

    const RESERVED: u32 = 0x0000_ffc0;

    pub fn es_required(&self) -> bool {
        self.0 & Self::ES != 0
    }

    /// Reserved bits 6..15, which must be zero.
    pub fn reserved_bits(&self) -> u32 {
        self.0 & Self::RESERVED
    }

    /// Minimum firmware API version, major.minor.
    pub fn api_version(&self) -> (u8, u8) {
        (((self.0 >> 24) & 0xff) as u8, ((self.0 >> 16) & 0xff) as u8)
    }
}

/// TDX isolation settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TdxConfig {
    pub policy: TdxPolicy,
}

/// Remote secret provisioning run before the first vCPU instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationSpec {
    /// URL of the attestation proxy.
    pub proxy_url: String,
    /// GUID of the requested secret.
    pub secret_guid: Uuid,
    /// Type of the requested secret, e.g. "bundle".
    pub secret_type: String,
    /// Key set the proxy should release the secret from.
    pub keyset: String,
}

/// SEV isolation settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SevConfig {
    /// Numeric guest policy.
    pub policy: SevPolicy,
    /// Platform certificate chain: PDH, PEK, OCA, CEK, ASK and ARK.
    pub cert_chain_path: PathBuf,
    /// Pre-attestation exchange, if the guest needs a secret before boot.
    pub pre_attestation: Option<AttestationSpec>,
}

/// Isolation mode of a guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IsolationConfig {
    None,
    Tdx(TdxConfig),
    Sev(SevConfig),
}

impl Default for IsolationConfig {
    fn default() -> Self {
        IsolationConfig::None
    }
}

impl IsolationConfig {
    pub fn tee_type(&self) -> TeeType {
        match self {
            IsolationConfig::None => TeeType::None,
            IsolationConfig::Tdx(_) => TeeType::Tdx,
            IsolationConfig::Sev(_) => TeeType::Sev,
        }
    }

    /// The pre-attestation spec, present only for SEV guests that asked for it.
    pub fn attestation(&self) -> Option<&AttestationSpec> {
        match self {
            IsolationConfig::Sev(sev) => sev.pre_attestation.as_ref(),
            _ => None,
        }
    }
}

/// Everything needed to launch one guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Guest identifier.
    pub id: String,
    pub machine: MachineConfig,
    pub boot: BootSourceConfig,
    /// Host socket of the guest serial console.
    pub serial_path: Option<PathBuf>,
    pub vsock: Option<VsockConfig>,
    pub isolation: IsolationConfig,
    /// Bound of the attestation proxy round trip.
    pub attestation_timeout: Duration,
}

impl LaunchConfig {
    /// Create a plain guest config booting `kernel_path`.
    pub fn new(id: &str, kernel_path: PathBuf) -> Self {
        LaunchConfig {
            id: id.to_string(),
            machine: MachineConfig::default(),
            boot: BootSourceConfig {
                kernel_path,
                ..Default::default()
            },
            serial_path: None,
            vsock: None,
            isolation: IsolationConfig::None,
            attestation_timeout: DEFAULT_ATTESTATION_TIMEOUT,
        }
    }

    /// Check the fields for consistency. Files are not touched here.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(invalid("guest id must not be empty"));
        }
        self.validate_machine()?;

        if self.boot.kernel_path.as_os_str().is_empty() {
            return Err(invalid("kernel path is required"));
        }
        if self.boot.boot_args.contains('\0') {
            return Err(invalid("boot args must not contain NUL bytes"));
        }
        if self.boot.boot_args.len() >= CMDLINE_MAX_SIZE {
            return Err(invalid(format!(
                "boot args are {} bytes, limit is {}",
                self.boot.boot_args.len(),
                CMDLINE_MAX_SIZE - 1
            )));
        }

        if let Some(vsock) = self.vsock.as_ref() {
            if vsock.guest_cid < VSOCK_MIN_GUEST_CID {
                return Err(invalid(format!(
                    "vsock guest cid {} is reserved",
                    vsock.guest_cid
                )));
            }
            if self.serial_path.as_ref() == Some(&vsock.uds_path) {
                return Err(invalid(format!(
                    "serial and vsock share the socket path {:?}",
                    vsock.uds_path
                )));
            }
        }

        if self.attestation_timeout.is_zero() {
            return Err(invalid("attestation timeout must be positive"));
        }

        match &self.isolation {
            IsolationConfig::Sev(sev) => {
                if sev.cert_chain_path.as_os_str().is_empty() {
                    return Err(invalid("SEV requires a certificate chain path"));
                }
                if let Some(spec) = sev.pre_attestation.as_ref() {
                    validate_attestation(spec)?;
                }
            }
            IsolationConfig::Tdx(_) | IsolationConfig::None => {}
        }

        Ok(())
    }

    fn validate_machine(&self) -> Result<()> {
        let machine = &self.machine;
        if machine.mem_size_mib == 0 {
            return Err(invalid("memory size must be positive"));
        }
        if machine.mem_size_bytes().is_none() {
            return Err(invalid(format!(
                "memory size {} MiB overflows",
                machine.mem_size_mib
            )));
        }
        if machine.vcpu_count == 0 {
            return Err(invalid("vcpu count must be positive"));
        }
        if machine.vcpu_count > machine.max_vcpu_count {
            return Err(invalid(format!(
                "vcpu count {} exceeds max vcpu count {}",
                machine.vcpu_count, machine.max_vcpu_count
            )));
        }
        if machine.max_vcpu_count > MAX_SUPPORTED_VCPUS {
            return Err(invalid(format!(
                "max vcpu count {} exceeds {}",
                machine.max_vcpu_count, MAX_SUPPORTED_VCPUS
            )));
        }

        let topology = &machine.cpu_topology;
        if !(1..=2).contains(&topology.threads_per_core) {
            return Err(invalid("threads per core must be 1 or 2"));
        }
        if topology.cores_per_die == 0 || topology.dies_per_socket == 0 || topology.sockets == 0 {
            return Err(invalid("cpu topology fields must be positive"));
        }
        if topology.capacity() < machine.max_vcpu_count as usize {
            return Err(invalid(format!(
                "cpu topology holds {} cpus, fewer than max vcpu count {}",
                topology.capacity(),
                machine.max_vcpu_count
            )));
        }

        if let MemoryBacking::File(path) = &machine.mem_backing {
            if path.as_os_str().is_empty() {
                return Err(invalid("memory file path must not be empty"));
            }
        }

        Ok(())
    }
}

fn validate_attestation(spec: &AttestationSpec) -> Result<()> {
    let url = reqwest::Url::parse(&spec.proxy_url)
        .map_err(|e| invalid(format!("bad attestation proxy url {:?}: {}", spec.proxy_url, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!(
            "attestation proxy url {:?} must be http or https",
            spec.proxy_url
        )));
    }
    if spec.secret_type.is_empty() {
        return Err(invalid("attestation secret type must not be empty"));
    }
    Ok(())
}

fn invalid<S: Into<String>>(msg: S) -> LaunchError {
    LaunchError::ConfigInvalid(msg.into())
}
