// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host confidential computing capability detection.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::config::TeeType;

pub const PROC_CPUINFO: &str = "/proc/cpuinfo";
const TDX_CPU_FLAG: &str = "tdx";
const TDX_SYS_FIRMWARE_PATH: &str = "/sys/firmware/tdx_seam/";
const SEV_KVM_PARAMETER_PATH: &str = "/sys/module/kvm_amd/parameters/sev";
const SNP_KVM_PARAMETER_PATH: &str = "/sys/module/kvm_amd/parameters/sev_snp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestProtectionType {
    Sev,
    Snp,
    Tdx,
    None,
}

impl GuestProtectionType {
    /// Whether guests of `tee` can be protected by this host capability.
    pub fn supports(&self, tee: TeeType) -> bool {
        matches!(
            (self, tee),
            (_, TeeType::None)
                | (GuestProtectionType::Tdx, TeeType::Tdx)
                | (GuestProtectionType::Sev, TeeType::Sev)
                | (GuestProtectionType::Snp, TeeType::Sev)
        )
    }
}

/// Host files consulted by [`available_guest_protection`].
#[derive(Debug, Clone)]
pub struct ProtectionPaths {
    pub cpuinfo: PathBuf,
    pub tdx_firmware: PathBuf,
    pub sev_parameter: PathBuf,
    pub snp_parameter: PathBuf,
}

impl Default for ProtectionPaths {
    fn default() -> Self {
        ProtectionPaths {
            cpuinfo: PathBuf::from(PROC_CPUINFO),
            tdx_firmware: PathBuf::from(TDX_SYS_FIRMWARE_PATH),
            sev_parameter: PathBuf::from(SEV_KVM_PARAMETER_PATH),
            snp_parameter: PathBuf::from(SNP_KVM_PARAMETER_PATH),
        }
    }
}

// scan the `flags` lines in given cpuinfo_path and collect every flag
pub fn get_cpu_flags(cpuinfo_path: &Path) -> io::Result<HashSet<String>> {
    let reader = BufReader::new(File::open(cpuinfo_path)?);

    let mut flags = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        // expected format: ["flags", ":", ...] or ["flags:", ...]
        if !line.starts_with("flags") {
            continue;
        }
        flags.extend(
            line.split_whitespace()
                .skip_while(|f| *f != ":" && !f.ends_with(':'))
                .skip(1)
                .map(|f| f.to_string()),
        );
    }

    Ok(flags)
}

fn parameter_enabled(path: &Path, accept_one: bool) -> bool {
    match fs::read(path) {
        Ok(contents) => match contents.first() {
            Some(b'Y') => true,
            Some(b'1') => accept_one,
            _ => false,
        },
        Err(_) => false,
    }
}

/// Detect the confidential computing technology enabled on this host.
pub fn available_guest_protection(paths: &ProtectionPaths) -> io::Result<GuestProtectionType> {
    let flags = get_cpu_flags(&paths.cpuinfo)?;

    // TDX is loaded when the firmware directory exists or "tdx" is a CPU flag
    if paths.tdx_firmware.exists() || flags.contains(TDX_CPU_FLAG) {
        return Ok(GuestProtectionType::Tdx);
    }

    // the kvm `sev` parameter is `1` before linux 5.12 and `Y` after
    if parameter_enabled(&paths.sev_parameter, true) {
        return Ok(GuestProtectionType::Sev);
    }

    if parameter_enabled(&paths.snp_parameter, false) {
        return Ok(GuestProtectionType::Snp);
    }

    Ok(GuestProtectionType::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn paths_in(dir: &TempDir) -> ProtectionPaths {
        let root = dir.as_path();
        ProtectionPaths {
            cpuinfo: root.join("cpuinfo"),
            tdx_firmware: root.join("tdx_seam"),
            sev_parameter: root.join("sev"),
            snp_parameter: root.join("sev_snp"),
        }
    }

    #[test]
    fn test_get_cpu_flags() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        fs::write(
            &paths.cpuinfo,
            "processor\t: 0\nflags\t\t: fpu vme sse2 tdx\nbugs\t\t: spectre_v1\n",
        )
        .unwrap();
        let flags = get_cpu_flags(&paths.cpuinfo).unwrap();
        assert!(flags.contains("fpu"));
        assert!(flags.contains("tdx"));
        assert!(!flags.contains("flags"));
        assert!(!flags.contains("spectre_v1"));
    }

    #[test]
    fn test_available_guest_protection() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        fs::write(&paths.cpuinfo, "flags\t\t: fpu sse2\n").unwrap();
        assert_eq!(available_guest_protection(&paths).unwrap(), GuestProtectionType::None);

        fs::write(&paths.snp_parameter, "Y\n").unwrap();
        assert_eq!(available_guest_protection(&paths).unwrap(), GuestProtectionType::Snp);

        fs::write(&paths.sev_parameter, "1\n").unwrap();
        assert_eq!(available_guest_protection(&paths).unwrap(), GuestProtectionType::Sev);

        fs::create_dir(&paths.tdx_firmware).unwrap();
        assert_eq!(available_guest_protection(&paths).unwrap(), GuestProtectionType::Tdx);
    }

    #[test]
    fn test_supports() {
        assert!(GuestProtectionType::None.supports(TeeType::None));
        assert!(!GuestProtectionType::None.supports(TeeType::Sev));
        assert!(GuestProtectionType::Snp.supports(TeeType::Sev));
        assert!(!GuestProtectionType::Sev.supports(TeeType::Tdx));
    }
}
