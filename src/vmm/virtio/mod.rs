// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Guest virtio devices of the reference backend.
//!
//! Devices sit behind virtio-mmio transports placed by
//! [`crate::device_manager::virtio_mmio`] and use split virtqueues.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vm_memory::GuestMemoryMmap;

/// Virtio block device backed by the rootfs image.
pub mod block;
/// Virtio-mmio register interface.
pub mod mmio;
/// Split virtqueues.
pub mod queue;
/// Virtio vsock device bridged to the hybrid vsock socket.
pub mod vsock;

pub use self::block::Block;
pub use self::mmio::{MmioBus, MmioTransport};
pub use self::queue::{DescriptorChain, Queue, QueueError};
pub use self::vsock::Vsock;

/// Feature bit of devices following virtio 1.0 or later.
pub const VIRTIO_F_VERSION_1: u32 = 32;

/// Interrupt status bit for a used buffer notification.
pub const VIRTIO_MMIO_INT_VRING: u32 = 0x01;

/// A guest interrupt line.
pub trait IrqLine: Send + Sync {
    /// Raise an edge on the line.
    fn pulse(&self) -> io::Result<()>;
}

/// Interrupt state shared by a transport and its device.
#[derive(Clone)]
pub struct Interrupt {
    status: Arc<AtomicU32>,
    line: Arc<dyn IrqLine>,
}

impl Interrupt {
    pub fn new(line: Arc<dyn IrqLine>) -> Self {
        Interrupt {
            status: Arc::new(AtomicU32::new(0)),
            line,
        }
    }

    /// Tell the driver that used rings have new entries.
    pub fn signal_used_queue(&self) -> io::Result<()> {
        self.status.fetch_or(VIRTIO_MMIO_INT_VRING, Ordering::SeqCst);
        self.line.pulse()
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn ack(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::SeqCst);
    }
}

/// A virtio device model behind a transport.
pub trait VirtioDevice: Send {
    /// Virtio device id.
    fn device_type(&self) -> u32;

    /// Largest size of each queue; the slice length is the queue count.
    fn queue_max_sizes(&self) -> &[u16];

    /// Device feature bits, without the transport's own.
    fn avail_features(&self) -> u64;

    /// Read from the device config space.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Start serving the driver once it set DRIVER_OK.
    fn activate(&mut self, memory: GuestMemoryMmap, interrupt: Interrupt, queues: Vec<Queue>)
        -> io::Result<()>;

    /// The driver made buffers available on queue `index`.
    fn queue_notify(&mut self, index: u32);
}

/// Copy the part of `config` at `offset` into `data`, zero past its end.
pub(crate) fn read_config_bytes(config: &[u8], offset: u64, data: &mut [u8]) {
    data.fill(0);
    let start = offset as usize;
    if start >= config.len() {
        return;
    }
    let len = data.len().min(config.len() - start);
    data[..len].copy_from_slice(&config[start..start + len]);
}
