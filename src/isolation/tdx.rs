// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Intel TDX launch strategy.

use openssl::sha::{sha384, Sha384};

use super::kernel_param::{append_missing, Param};
use crate::boot_image::BootImages;
use crate::config::{TdxConfig, TdxPolicy};
use crate::utils::error::{LaunchError, Result};

/// Kernel parameter turning off the guest's device filter.
pub const TDX_DISABLE_FILTER_PARAM: &str = "tdx_disable_filter";

const TDX_MEASUREMENT_TAG: &[u8] = b"dbs-cli/tdx-launch/v1";

/// Launch state of a trust domain.
#[derive(Debug)]
pub struct TdxContext {
    policy: TdxPolicy,
    firmware_digest: [u8; 48],
    kernel_digest: [u8; 48],
    initrd_digest: [u8; 48],
    cmdline_digest: [u8; 48],
}

/// Kernel command line of a TDX guest: the caller's text plus
/// `tdx_disable_filter` when the policy asks for it.
pub fn tdx_boot_args(policy: TdxPolicy, boot_args: &str) -> String {
    if policy.disable_filter() {
        append_missing(boot_args, &[Param::new(TDX_DISABLE_FILTER_PARAM, "")])
    } else {
        boot_args.to_string()
    }
}

impl TdxContext {
    /// Check `config` against the resolved images and digest the initial
    /// TD contents. `boot_args` is the effective command line.
    pub fn new(config: &TdxConfig, images: &BootImages, boot_args: &str) -> Result<Self> {
        let unknown = config.policy.unknown_bits();
        if unknown != 0 {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "unknown TDX policy bits 0x{:x}",
                unknown
            )));
        }
        let firmware = images.firmware.as_ref().ok_or_else(|| {
            LaunchError::IsolationConfigInvalid("TDX guests require a TD shim firmware".to_string())
        })?;

        Ok(TdxContext {
            policy: config.policy,
            firmware_digest: sha384(firmware.bytes()),
            kernel_digest: sha384(images.kernel.image.bytes()),
            initrd_digest: sha384(images.initrd.as_ref().map_or(&[][..], |i| i.bytes())),
            cmdline_digest: sha384(boot_args.as_bytes()),
        })
    }

    pub fn policy(&self) -> TdxPolicy {
        self.policy
    }

    /// SHA-384 launch digest of the trust domain.
    pub fn measure(&self) -> Vec<u8> {
        let mut hasher = Sha384::new();
        hasher.update(TDX_MEASUREMENT_TAG);
        hasher.update(&self.policy.0.to_le_bytes());
        hasher.update(&self.firmware_digest);
        hasher.update(&self.kernel_digest);
        hasher.update(&self.initrd_digest);
        hasher.update(&self.cmdline_digest);
        hasher.finish().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{resolve_images, ImageSet};

    #[test]
    fn test_tdx_boot_args() {
        let filter = TdxPolicy(TdxPolicy::DISABLE_FILTER);
        assert_eq!(
            tdx_boot_args(filter, "console=hvc0"),
            "console=hvc0 tdx_disable_filter"
        );
        assert_eq!(
            tdx_boot_args(filter, "tdx_disable_filter console=hvc0"),
            "tdx_disable_filter console=hvc0"
        );
        assert_eq!(
            tdx_boot_args(TdxPolicy(TdxPolicy::DEBUG), "console=hvc0"),
            "console=hvc0"
        );
    }

    #[test]
    fn test_tdx_context() {
        let set = ImageSet::new().with_firmware(&[]);
        let images = resolve_images(&set);
        let config = TdxConfig {
            policy: TdxPolicy(TdxPolicy::DEBUG),
        };
        let ctx = TdxContext::new(&config, &images, "console=hvc0").unwrap();
        assert_eq!(ctx.policy(), TdxPolicy(TdxPolicy::DEBUG));
        let digest = ctx.measure();
        assert_eq!(digest.len(), 48);
        assert_eq!(digest, ctx.measure());

        let other = TdxContext::new(&config, &images, "console=ttyS0").unwrap();
        assert_ne!(digest, other.measure());
    }

    #[test]
    fn test_tdx_context_rejects_bad_config() {
        let set = ImageSet::new();
        let images = resolve_images(&set);
        let config = TdxConfig::default();
        assert!(matches!(
            TdxContext::new(&config, &images, ""),
            Err(LaunchError::IsolationConfigInvalid(_))
        ));

        let set = ImageSet::new().with_firmware(&[]);
        let images = resolve_images(&set);
        let config = TdxConfig {
            policy: TdxPolicy(1 << 7),
        };
        match TdxContext::new(&config, &images, "") {
            Err(LaunchError::IsolationConfigInvalid(msg)) => assert!(msg.contains("0x80")),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
