// Copyright (c) 2019-2022 Alibaba Cloud
// Copyright (c) 2019-2022 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Kernel command line parameters.
//!
//! Isolation modes may add parameters to the caller's command line; the
//! caller's own text is kept byte for byte and additions go at the end.

const KERNEL_KV_DELIMITER: &str = "=";
const KERNEL_PARAM_DELIMITER: &str = " ";

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: &str, value: &str) -> Self {
        Param {
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }
}

impl std::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}{}{}", self.key, KERNEL_KV_DELIMITER, self.value)
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct KernelParams {
    params: Vec<Param>,
}

impl KernelParams {
    pub fn from_string(params_string: &str) -> Self {
        let params = params_string
            .split_whitespace()
            .map(|param| {
                let mut kv = param.splitn(2, KERNEL_KV_DELIMITER);
                let key = kv.next().unwrap_or_default();
                Param::new(key, kv.next().unwrap_or_default())
            })
            .collect();

        Self { params }
    }

    /// Whether a parameter named `key` is present, with any value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.params.iter().any(|p| p.key == key)
    }
}

/// Append each of `additions` to `cmdline` unless a parameter with the same
/// key is already there. `cmdline` itself is never rewritten.
pub fn append_missing(cmdline: &str, additions: &[Param]) -> String {
    let existing = KernelParams::from_string(cmdline);
    let mut result = cmdline.to_string();
    for param in additions {
        if !existing.contains_key(&param.key) {
            push_param(&mut result, param);
        }
    }
    result
}

/// Append `param` to `cmdline`, separated from what is already there.
pub fn push_param(cmdline: &mut String, param: &Param) {
    if !cmdline.is_empty() && !cmdline.ends_with(KERNEL_PARAM_DELIMITER) {
        cmdline.push_str(KERNEL_PARAM_DELIMITER);
    }
    cmdline.push_str(&param.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_params() {
        let expect_params = KernelParams {
            params: vec![
                Param::new("k1", "v1"),
                Param::new("k2", "v2=x"),
                Param::new("quiet", ""),
            ],
        };

        let kernel_params = KernelParams::from_string("  k1=v1 k2=v2=x\tquiet ");
        assert_eq!(kernel_params, expect_params);
        assert!(kernel_params.contains_key("quiet"));
        assert!(kernel_params.contains_key("k2"));
        assert!(!kernel_params.contains_key("k3"));
        assert_eq!(Param::new("k2", "v2=x").to_string(), "k2=v2=x");
        assert_eq!(Param::new("quiet", "").to_string(), "quiet");
    }

    #[test]
    fn test_append_missing_keeps_caller_text() {
        let flag = [Param::new("tdx_disable_filter", "")];

        // odd spacing is preserved as given
        let cmdline = "console=ttyS0  tty0 reboot=k";
        assert_eq!(
            append_missing(cmdline, &flag),
            "console=ttyS0  tty0 reboot=k tdx_disable_filter"
        );

        let cmdline = "tdx_disable_filter console=hvc0";
        assert_eq!(append_missing(cmdline, &flag), cmdline);

        assert_eq!(append_missing("", &flag), "tdx_disable_filter");
        assert_eq!(append_missing("panic=1 ", &flag), "panic=1 tdx_disable_filter");
        assert_eq!(
            append_missing("panic=1", &[Param::new("panic", "0"), Param::new("agent.log", "debug")]),
            "panic=1 agent.log=debug"
        );
    }
}
