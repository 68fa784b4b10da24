// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-visible placement of the virtio-mmio devices.
//!
//! Devices get fixed 4K windows in the 32-bit MMIO hole and one legacy IRQ
//! each, in a fixed order: the root block device first, then vsock. The
//! guest kernel learns about them through `virtio_mmio.device=` parameters.

use std::fmt;

use crate::address_space::MMIO_LOW_START;
use crate::config::LaunchConfig;
use crate::isolation::kernel_param::{append_missing, push_param, Param};

/// First virtio-mmio window.
pub const VIRTIO_MMIO_BASE: u64 = MMIO_LOW_START + 0x1000_0000;
/// Size of one virtio-mmio window.
pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;
/// IRQ of the first virtio-mmio device. Lower lines belong to legacy ISA devices.
pub const VIRTIO_MMIO_IRQ_BASE: u32 = 5;

/// Guest device node of the first virtio block device.
const ROOT_DEVICE: &str = "/dev/vda";

/// Kinds of guest virtio devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtioDeviceKind {
    Block,
    Vsock,
}

impl fmt::Display for VirtioDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VirtioDeviceKind::Block => f.write_str("virtio-blk"),
            VirtioDeviceKind::Vsock => f.write_str("virtio-vsock"),
        }
    }
}

/// MMIO window and interrupt line of one guest device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioSlot {
    pub kind: VirtioDeviceKind,
    pub base: u64,
    pub irq: u32,
}

impl MmioSlot {
    fn new(kind: VirtioDeviceKind, index: usize) -> Self {
        MmioSlot {
            kind,
            base: VIRTIO_MMIO_BASE + index as u64 * VIRTIO_MMIO_SIZE,
            irq: VIRTIO_MMIO_IRQ_BASE + index as u32,
        }
    }

    /// Whether `addr` falls inside this device's window.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + VIRTIO_MMIO_SIZE
    }

    fn cmdline_param(&self) -> Param {
        Param::new(
            "virtio_mmio.device",
            &format!("{}K@{:#x}:{}", VIRTIO_MMIO_SIZE >> 10, self.base, self.irq),
        )
    }
}

/// Slots of every virtio device `config` asks for.
pub fn mmio_slots(config: &LaunchConfig) -> Vec<MmioSlot> {
    let kinds = [
        config.boot.rootfs.as_ref().map(|_| VirtioDeviceKind::Block),
        config.vsock.as_ref().map(|_| VirtioDeviceKind::Vsock),
    ];
    kinds
        .iter()
        .flatten()
        .enumerate()
        .map(|(index, kind)| MmioSlot::new(*kind, index))
        .collect()
}

/// The caller's boot arguments plus whatever the guest needs to find its
/// virtio devices and root filesystem. Parameters the caller already set are
/// left alone, and without devices the caller's text comes back unchanged.
pub fn guest_boot_args(config: &LaunchConfig) -> String {
    let boot_args = config.boot.boot_args.as_str();
    let slots = mmio_slots(config);
    if slots.is_empty() {
        return boot_args.to_string();
    }

    // every device repeats the same key, so match on the whole parameter
    let mut result = boot_args.to_string();
    for param in slots.iter().map(MmioSlot::cmdline_param) {
        let text = param.to_string();
        if !result.split_whitespace().any(|p| p == text) {
            push_param(&mut result, &param);
        }
    }

    if let Some(rootfs) = config.boot.rootfs.as_ref().filter(|r| r.is_root) {
        let mut additions = vec![Param::new("root", ROOT_DEVICE)];
        if !has_access_flag(boot_args) {
            let access = if rootfs.is_read_only { "ro" } else { "rw" };
            additions.push(Param::new(access, ""));
        }
        result = append_missing(&result, &additions);
    }
    result
}

fn has_access_flag(cmdline: &str) -> bool {
    cmdline.split_whitespace().any(|p| p == "ro" || p == "rw")
}
