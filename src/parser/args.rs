// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{
    AttestationSpec, CpuTopology, IsolationConfig, LaunchConfig, MachineConfig, MemoryBacking,
    RootfsConfig, SevConfig, SevPolicy, TdxConfig, TdxPolicy, TeeType, VsockConfig,
    DEFAULT_KEYSET, DEFAULT_SECRET_GUID, DEFAULT_SECRET_TYPE, DEFAULT_VSOCK_GUEST_CID,
};
use crate::utils::error::{LaunchError, Result};

const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 tty0 reboot=k debug panic=1 pci=off root=/dev/vda1";

/// A command-line tool to launch plain and confidential micro-VM guests
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct DBSArgs {
    #[clap(subcommand)]
    pub command: Option<Commands>,

    #[clap(flatten)]
    pub create_args: CreateArgs,

    #[clap(flatten)]
    pub boot_args: BootArgs,

    #[clap(flatten)]
    pub security_args: SecurityArgs,

    #[clap(long, value_parser, default_value = "dbs-cli.log", display_order = 1)]
    pub log_file: String,

    #[clap(long, value_parser, default_value = "Info", display_order = 1)]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create a guest and wait until it exits
    Create,
}

/// CPU topology exposed to the guest
#[derive(Args, Debug, Serialize, Deserialize, Clone)]
pub struct CpuTopologyArgs {
    #[clap(
        long,
        value_parser,
        default_value_t = 1,
        help = "Threads per core, 2 enables hyper-threading",
        display_order = 1
    )]
    pub threads_per_core: u8,

    #[clap(
        long,
        value_parser,
        default_value_t = 1,
        help = "Cores per die",
        display_order = 1
    )]
    pub cores_per_die: u8,

    #[clap(
        long,
        value_parser,
        default_value_t = 1,
        help = "Dies per socket",
        display_order = 1
    )]
    pub dies_per_socket: u8,

    #[clap(
        long,
        value_parser,
        default_value_t = 1,
        help = "The number of sockets",
        display_order = 1
    )]
    pub sockets: u8,
}

/// Root block device
#[derive(Args, Debug, Serialize, Deserialize, Clone)]
pub struct RootfsArgs {
    #[clap(
        short,
        long,
        value_parser,
        help = "The path of the rootfs image",
        display_order = 4
    )]
    pub rootfs: Option<String>,

    #[clap(
        long,
        action = ArgAction::Set,
        default_value_t = true,
        help = "Whether the rootfs is the root boot device",
        display_order = 5
    )]
    pub is_root: bool,

    #[clap(
        long,
        action = ArgAction::SetTrue,
        help = "Expose the rootfs read-only",
        display_order = 6
    )]
    pub is_read_only: bool,
}

/// Guest machine and communication channels
#[derive(Args, Debug, Deserialize, Serialize, Clone)]
pub struct CreateArgs {
    #[clap(
        long,
        value_parser,
        default_value = "dbs-cli",
        help = "Identifier of the guest",
        display_order = 1
    )]
    pub id: String,

    #[clap(
        short = 'C',
        long,
        value_parser,
        default_value_t = 1,
        help = "The number of vcpus to start",
        display_order = 1
    )]
    pub vcpu: u8,

    #[clap(
        long,
        value_parser,
        default_value_t = 1,
        help = "The max number of vcpus",
        display_order = 1
    )]
    pub max_vcpu: u8,

    #[clap(flatten)]
    pub cpu_topology: CpuTopologyArgs,

    #[clap(
        long,
        value_parser,
        default_value = "shmem",
        help = "Memory type, either shmem or hugetlbfs",
        display_order = 2
    )]
    pub mem_type: String,

    #[clap(
        long,
        value_parser,
        default_value = "",
        help = "Memory backing file, required for hugetlbfs",
        display_order = 2
    )]
    pub mem_file_path: String,

    #[clap(
        short,
        long,
        value_parser,
        default_value_t = 128,
        help = "The memory size in MiB",
        display_order = 2
    )]
    pub mem_size: usize,

    #[clap(
        short,
        long,
        value_parser,
        help = "Host socket of the guest serial console",
        display_order = 2
    )]
    pub serial_path: Option<String>,

    #[clap(
        short,
        long,
        value_parser,
        help = "Host socket of the hybrid vsock device",
        display_order = 2
    )]
    pub vsock: Option<String>,

    #[clap(
        long,
        value_parser,
        default_value_t = DEFAULT_VSOCK_GUEST_CID,
        help = "Guest context id of the vsock device",
        display_order = 2
    )]
    pub vsock_guest_cid: u32,
}

/// Boot source
#[derive(Args, Debug, Deserialize, Serialize, Clone)]
pub struct BootArgs {
    #[clap(
        short,
        long,
        value_parser,
        help = "The path of the kernel image",
        display_order = 1
    )]
    pub kernel_path: Option<String>,

    #[clap(
        short,
        long,
        value_parser,
        help = "The path of the initrd (Optional)",
        display_order = 2
    )]
    pub initrd_path: Option<String>,

    #[clap(
        short,
        long,
        value_parser,
        help = "The path of the OVMF or TD shim firmware (Optional)",
        display_order = 3
    )]
    pub firmware_path: Option<String>,

    #[clap(
        short,
        long,
        value_parser,
        default_value = DEFAULT_BOOT_ARGS,
        help = "The kernel command line",
        display_order = 4
    )]
    pub boot_args: String,

    #[clap(flatten)]
    pub rootfs_args: RootfsArgs,
}

/// Isolation mode and pre-attestation
#[derive(Args, Debug, Deserialize, Serialize, Clone)]
pub struct SecurityArgs {
    #[clap(
        long,
        value_parser,
        default_value = "none",
        help = "Trusted execution environment: none, tdx or sev",
        display_order = 1
    )]
    pub tee_type: String,

    #[clap(
        long,
        value_parser = parse_policy,
        default_value = "0",
        help = "TDX guest policy bits",
        display_order = 1
    )]
    pub tdx_guest_policy: u32,

    #[clap(
        short = 'p',
        long,
        value_parser = parse_policy,
        default_value = "0",
        help = "SEV guest policy bits",
        display_order = 1
    )]
    pub sev_guest_policy: u32,

    #[clap(
        short = 'c',
        long,
        value_parser,
        help = "SEV platform certificate chain, as exported by `sevctl export --full`",
        display_order = 2
    )]
    pub sev_cert_chain_path: Option<String>,

    #[clap(
        short = 'o',
        long,
        value_parser,
        help = "URL of the SEV pre-attestation proxy, enables pre-attestation",
        display_order = 3
    )]
    pub guest_pre_attestation_proxy: Option<String>,

    #[clap(
        short = 'g',
        long,
        value_parser,
        default_value = DEFAULT_KEYSET,
        help = "Key set the secret is released from",
        display_order = 3
    )]
    pub guest_pre_attestation_keyset: String,

    #[clap(
        short = 'd',
        long,
        value_parser,
        default_value = DEFAULT_SECRET_GUID,
        help = "GUID of the requested secret",
        display_order = 3
    )]
    pub guest_pre_attestation_secret_guid: String,

    #[clap(
        short = 't',
        long,
        value_parser,
        default_value = DEFAULT_SECRET_TYPE,
        help = "Type of the requested secret",
        display_order = 3
    )]
    pub guest_pre_attestation_secret_type: String,

    #[clap(
        long,
        value_parser,
        default_value_t = 30,
        help = "Timeout of the attestation proxy round trip, in seconds",
        display_order = 3
    )]
    pub guest_pre_attestation_timeout: u64,
}

/// Accept decimal or `0x` prefixed hexadecimal policy values.
fn parse_policy(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid policy {:?}: {}", s, e))
}

fn invalid<S: Into<String>>(msg: S) -> LaunchError {
    LaunchError::ConfigInvalid(msg.into())
}

impl DBSArgs {
    /// Build the launch configuration described by the arguments.
    pub fn launch_config(&self) -> Result<LaunchConfig> {
        let kernel_path = self
            .boot_args
            .kernel_path
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("--kernel-path is required"))?;

        let mut config = LaunchConfig::new(&self.create_args.id, PathBuf::from(kernel_path));
        config.machine = self.create_args.machine_config()?;
        config.boot.firmware_path = non_empty_path(&self.boot_args.firmware_path);
        config.boot.initrd_path = non_empty_path(&self.boot_args.initrd_path);
        config.boot.boot_args = self.boot_args.boot_args.clone();
        config.boot.rootfs =
            non_empty_path(&self.boot_args.rootfs_args.rootfs).map(|path| RootfsConfig {
                path,
                is_root: self.boot_args.rootfs_args.is_root,
                is_read_only: self.boot_args.rootfs_args.is_read_only,
            });

        config.serial_path = non_empty_path(&self.create_args.serial_path);
        config.vsock = non_empty_path(&self.create_args.vsock).map(|uds_path| VsockConfig {
            uds_path,
            guest_cid: self.create_args.vsock_guest_cid,
        });

        config.isolation = self.security_args.isolation_config()?;
        config.attestation_timeout =
            Duration::from_secs(self.security_args.guest_pre_attestation_timeout);

        config.validate()?;
        Ok(config)
    }
}

impl CreateArgs {
    fn machine_config(&self) -> Result<MachineConfig> {
        let mem_backing = match self.mem_type.as_str() {
            "shmem" if self.mem_file_path.is_empty() => MemoryBacking::Anonymous,
            "shmem" | "hugetlbfs" if !self.mem_file_path.is_empty() => {
                MemoryBacking::File(PathBuf::from(&self.mem_file_path))
            }
            "hugetlbfs" => return Err(invalid("hugetlbfs memory needs --mem-file-path")),
            other => {
                return Err(invalid(format!(
                    "unknown memory type {:?}, expect shmem or hugetlbfs",
                    other
                )))
            }
        };

        Ok(MachineConfig {
            mem_size_mib: self.mem_size,
            vcpu_count: self.vcpu,
            max_vcpu_count: self.max_vcpu,
            cpu_topology: CpuTopology {
                threads_per_core: self.cpu_topology.threads_per_core,
                cores_per_die: self.cpu_topology.cores_per_die,
                dies_per_socket: self.cpu_topology.dies_per_socket,
                sockets: self.cpu_topology.sockets,
            },
            mem_backing,
        })
    }
}

impl SecurityArgs {
    fn isolation_config(&self) -> Result<IsolationConfig> {
        let tee: TeeType = self.tee_type.parse().map_err(invalid)?;

        if tee != TeeType::Sev {
            if self.guest_pre_attestation_proxy.is_some() {
                return Err(invalid(format!(
                    "pre-attestation requires --tee-type sev, got {}",
                    tee
                )));
            }
            if self.sev_guest_policy != 0 || self.sev_cert_chain_path.is_some() {
                return Err(invalid(format!("SEV options given for a {} guest", tee)));
            }
        }
        if tee != TeeType::Tdx && self.tdx_guest_policy != 0 {
            return Err(invalid(format!("TDX policy given for a {} guest", tee)));
        }

        match tee {
            TeeType::None => Ok(IsolationConfig::None),
            TeeType::Tdx => Ok(IsolationConfig::Tdx(TdxConfig {
                policy: TdxPolicy(self.tdx_guest_policy),
            })),
            TeeType::Sev => {
                let cert_chain_path = non_empty_path(&self.sev_cert_chain_path)
                    .ok_or_else(|| invalid("SEV requires --sev-cert-chain-path"))?;
                let pre_attestation = match self.guest_pre_attestation_proxy.as_ref() {
                    Some(proxy_url) => Some(AttestationSpec {
                        proxy_url: proxy_url.clone(),
                        secret_guid: Uuid::parse_str(&self.guest_pre_attestation_secret_guid)
                            .map_err(|e| {
                                invalid(format!(
                                    "bad secret guid {:?}: {:?}",
                                    self.guest_pre_attestation_secret_guid, e
                                ))
                            })?,
                        secret_type: self.guest_pre_attestation_secret_type.clone(),
                        keyset: self.guest_pre_attestation_keyset.clone(),
                    }),
                    None => None,
                };
                Ok(IsolationConfig::Sev(SevConfig {
                    policy: SevPolicy(self.sev_guest_policy),
                    cert_chain_path,
                    pre_attestation,
                }))
            }
        }
    }
}

fn non_empty_path(path: &Option<String>) -> Option<PathBuf> {
    path.as_ref()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}
