// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::sync::{Mutex, MutexGuard};

use slog::{debug, info, warn};
use vm_memory::{GuestAddress, GuestMemoryMmap};

use super::{Interrupt, Queue, VirtioDevice, VIRTIO_F_VERSION_1};
use crate::device_manager::MmioSlot;

/// "virt" in little endian.
pub const MMIO_MAGIC_VALUE: u32 = 0x7472_6976;
const MMIO_VERSION: u32 = 2;
const VENDOR_ID: u32 = 0;
const CONFIG_SPACE_OFFSET: u64 = 0x100;

const DEVICE_STATUS_ACKNOWLEDGE: u32 = 0x01;
const DEVICE_STATUS_DRIVER: u32 = 0x02;
const DEVICE_STATUS_DRIVER_OK: u32 = 0x04;
const DEVICE_STATUS_FEATURES_OK: u32 = 0x08;
const DEVICE_STATUS_NEEDS_RESET: u32 = 0x40;
const DEVICE_STATUS_FAILED: u32 = 0x80;

/// Register interface of one virtio-mmio device.
pub struct MmioTransport {
    device: Box<dyn VirtioDevice>,
    memory: GuestMemoryMmap,
    interrupt: Interrupt,
    queues: Vec<Queue>,
    features_select: u32,
    driver_features_select: u32,
    driver_features: u64,
    queue_select: u32,
    status: u32,
    activated: bool,
    logger: slog::Logger,
}

impl MmioTransport {
    pub fn new(
        device: Box<dyn VirtioDevice>,
        memory: GuestMemoryMmap,
        interrupt: Interrupt,
        logger: &slog::Logger,
    ) -> Self {
        let queues = device
            .queue_max_sizes()
            .iter()
            .map(|size| Queue::new(*size))
            .collect();
        MmioTransport {
            device,
            memory,
            interrupt,
            queues,
            features_select: 0,
            driver_features_select: 0,
            driver_features: 0,
            queue_select: 0,
            status: 0,
            activated: false,
            logger: logger.clone(),
        }
    }

    fn avail_features(&self) -> u64 {
        self.device.avail_features() | 1 << VIRTIO_F_VERSION_1
    }

    fn selected_queue(&mut self) -> Option<&mut Queue> {
        self.queues.get_mut(self.queue_select as usize)
    }

    // Queue layout is fixed once the driver has started the device.
    fn update_queue<F: FnOnce(&mut Queue)>(&mut self, f: F) {
        if self.activated {
            warn!(self.logger, "queue update after activation ignored");
            return;
        }
        if let Some(queue) = self.selected_queue() {
            f(queue);
        }
    }

    /// Guest read of `data.len()` bytes at `offset` into the window.
    pub fn read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= CONFIG_SPACE_OFFSET {
            self.device.read_config(offset - CONFIG_SPACE_OFFSET, data);
            return;
        }
        if data.len() != 4 {
            debug!(self.logger, "unaligned virtio-mmio read"; "offset" => offset, "len" => data.len());
            data.fill(0);
            return;
        }

        let value = match offset {
            0x00 => MMIO_MAGIC_VALUE,
            0x04 => MMIO_VERSION,
            0x08 => self.device.device_type(),
            0x0c => VENDOR_ID,
            0x10 => match self.features_select {
                0 => self.avail_features() as u32,
                1 => (self.avail_features() >> 32) as u32,
                _ => 0,
            },
            0x34 => self.selected_queue().map(|q| q.max_size as u32).unwrap_or(0),
            0x44 => self.selected_queue().map(|q| q.ready as u32).unwrap_or(0),
            0x60 => self.interrupt.status(),
            0x70 => self.status,
            // config generation, the config space never changes
            0xfc => 0,
            _ => {
                debug!(self.logger, "read of unknown virtio-mmio register"; "offset" => offset);
                0
            }
        };
        data.copy_from_slice(&value.to_le_bytes());
    }

    /// Guest write of `data` at `offset` into the window.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if offset >= CONFIG_SPACE_OFFSET {
            warn!(self.logger, "config space is read-only"; "offset" => offset);
            return;
        }
        let mut bytes = [0u8; 4];
        if data.len() != bytes.len() {
            debug!(self.logger, "unaligned virtio-mmio write"; "offset" => offset, "len" => data.len());
            return;
        }
        bytes.copy_from_slice(data);
        let value = u32::from_le_bytes(bytes);

        match offset {
            0x14 => self.features_select = value,
            0x20 => self.set_driver_features(value),
            0x24 => self.driver_features_select = value,
            0x30 => self.queue_select = value,
            0x38 => self.update_queue(|q| q.size = value as u16),
            0x44 => self.update_queue(|q| q.ready = value == 1),
            0x50 => {
                if self.activated {
                    self.device.queue_notify(value);
                }
            }
            0x64 => self.interrupt.ack(value),
            0x70 => self.set_status(value),
            0x80 => self.update_queue(|q| set_low(&mut q.desc_table, value)),
            0x84 => self.update_queue(|q| set_high(&mut q.desc_table, value)),
            0x90 => self.update_queue(|q| set_low(&mut q.avail_ring, value)),
            0x94 => self.update_queue(|q| set_high(&mut q.avail_ring, value)),
            0xa0 => self.update_queue(|q| set_low(&mut q.used_ring, value)),
            0xa4 => self.update_queue(|q| set_high(&mut q.used_ring, value)),
            _ => debug!(self.logger, "write to unknown virtio-mmio register"; "offset" => offset),
        }
    }

    fn set_driver_features(&mut self, value: u32) {
        if self.status & DEVICE_STATUS_FEATURES_OK != 0 {
            warn!(self.logger, "feature update after FEATURES_OK ignored");
            return;
        }
        let (shift, mask) = match self.driver_features_select {
            0 => (0, 0xffff_ffffu64),
            1 => (32, 0xffff_ffffu64 << 32),
            _ => return,
        };
        let accepted = ((value as u64) << shift) & self.avail_features();
        self.driver_features = (self.driver_features & !mask) | accepted;
    }

    fn set_status(&mut self, status: u32) {
        if status == 0 {
            if self.activated {
                // the device keeps running, as it cannot be restarted
                warn!(self.logger, "reset of an active virtio device ignored");
                self.status |= DEVICE_STATUS_NEEDS_RESET;
                return;
            }
            self.status = 0;
            self.driver_features = 0;
            self.queue_select = 0;
            for queue in self.queues.iter_mut() {
                *queue = Queue::new(queue.max_size);
            }
            return;
        }

        let legacy_driver = status & DEVICE_STATUS_FEATURES_OK != 0
            && self.driver_features & (1 << VIRTIO_F_VERSION_1) == 0;
        if legacy_driver {
            warn!(self.logger, "driver refused VIRTIO_F_VERSION_1");
            self.status = status & !DEVICE_STATUS_FEATURES_OK;
            return;
        }
        self.status = status;

        let driver_ok = DEVICE_STATUS_ACKNOWLEDGE
            | DEVICE_STATUS_DRIVER
            | DEVICE_STATUS_FEATURES_OK
            | DEVICE_STATUS_DRIVER_OK;
        if !self.activated && status & driver_ok == driver_ok && status & DEVICE_STATUS_FAILED == 0 {
            self.activate();
        }
    }

    fn activate(&mut self) {
        // queues the driver left disabled are not handed to the device
        if let Some(index) = self
            .queues
            .iter()
            .position(|q| q.ready && !q.is_valid(&self.memory))
        {
            warn!(self.logger, "virtqueue {} is misconfigured", index);
            self.status |= DEVICE_STATUS_NEEDS_RESET;
            return;
        }
        let queues = self.queues.clone();
        match self
            .device
            .activate(self.memory.clone(), self.interrupt.clone(), queues)
        {
            Ok(()) => {
                self.activated = true;
                info!(self.logger, "virtio device activated";
                    "device_type" => self.device.device_type(),
                    "features" => self.driver_features);
            }
            Err(e) => {
                warn!(self.logger, "virtio device activation failed: {}", e);
                self.status |= DEVICE_STATUS_NEEDS_RESET;
            }
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }
}

fn set_low(addr: &mut GuestAddress, value: u32) {
    *addr = GuestAddress((addr.0 & !0xffff_ffff) | value as u64);
}

fn set_high(addr: &mut GuestAddress, value: u32) {
    *addr = GuestAddress((addr.0 & 0xffff_ffff) | (value as u64) << 32);
}

/// The virtio-mmio windows of one guest.
pub struct MmioBus {
    devices: Vec<(MmioSlot, Mutex<MmioTransport>)>,
}

impl MmioBus {
    pub fn new(devices: Vec<(MmioSlot, MmioTransport)>) -> Self {
        MmioBus {
            devices: devices
                .into_iter()
                .map(|(slot, transport)| (slot, Mutex::new(transport)))
                .collect(),
        }
    }

    fn find(&self, addr: u64) -> Option<(u64, MutexGuard<MmioTransport>)> {
        self.devices
            .iter()
            .find(|(slot, _)| slot.contains(addr))
            .map(|(slot, transport)| {
                (
                    addr - slot.base,
                    transport.lock().unwrap_or_else(|e| e.into_inner()),
                )
            })
    }

    /// Dispatch a guest read; false if no device claims `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        match self.find(addr) {
            Some((offset, mut transport)) => {
                transport.read(offset, data);
                true
            }
            None => false,
        }
    }

    /// Dispatch a guest write; false if no device claims `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.find(addr) {
            Some((offset, mut transport)) => {
                transport.write(offset, data);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device_manager::{MmioSlot, VirtioDeviceKind};
    use crate::test_utils::test_logger;
    use crate::vmm::virtio::queue::DriverQueue;
    use crate::vmm::virtio::tests::CountingIrq;
    use std::io;
    use crate::vmm::virtio::read_config_bytes;
    use std::sync::Arc;

    #[derive(Default)]
    struct Record {
        activated: Option<Vec<Queue>>,
        notified: Vec<u32>,
    }

    struct DummyDevice {
        record: Arc<Mutex<Record>>,
        fail: bool,
    }

    impl VirtioDevice for DummyDevice {
        fn device_type(&self) -> u32 {
            0x42
        }

        fn queue_max_sizes(&self) -> &[u16] {
            &[16, 8]
        }

        fn avail_features(&self) -> u64 {
            1 << 5
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            read_config_bytes(&[1, 2, 3, 4], offset, data);
        }

        fn activate(&mut self, _: GuestMemoryMmap, _: Interrupt, queues: Vec<Queue>) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::Other));
            }
            self.record.lock().unwrap().activated = Some(queues);
            Ok(())
        }

        fn queue_notify(&mut self, index: u32) {
            self.record.lock().unwrap().notified.push(index);
        }
    }

    /// Register access helpers mirroring a guest driver.
    pub(crate) fn read_reg(transport: &mut MmioTransport, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        transport.read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    pub(crate) fn write_reg(transport: &mut MmioTransport, offset: u64, value: u32) {
        transport.write(offset, &value.to_le_bytes());
    }

    /// Negotiate features and start the device with the given queues.
    pub(crate) fn driver_activate(transport: &mut MmioTransport, queues: &[Queue]) {
        write_reg(transport, 0x70, 0);
        write_reg(transport, 0x70, DEVICE_STATUS_ACKNOWLEDGE);
        write_reg(transport, 0x70, DEVICE_STATUS_ACKNOWLEDGE | DEVICE_STATUS_DRIVER);
        for select in 0..2 {
            write_reg(transport, 0x14, select);
            let features = read_reg(transport, 0x10);
            write_reg(transport, 0x24, select);
            write_reg(transport, 0x20, features);
        }
        let status = DEVICE_STATUS_ACKNOWLEDGE | DEVICE_STATUS_DRIVER | DEVICE_STATUS_FEATURES_OK;
        write_reg(transport, 0x70, status);
        for (index, queue) in queues.iter().enumerate() {
            write_reg(transport, 0x30, index as u32);
            write_reg(transport, 0x38, queue.size as u32);
            write_reg(transport, 0x80, queue.desc_table.0 as u32);
            write_reg(transport, 0x84, (queue.desc_table.0 >> 32) as u32);
            write_reg(transport, 0x90, queue.avail_ring.0 as u32);
            write_reg(transport, 0x94, (queue.avail_ring.0 >> 32) as u32);
            write_reg(transport, 0xa0, queue.used_ring.0 as u32);
            write_reg(transport, 0xa4, (queue.used_ring.0 >> 32) as u32);
            write_reg(transport, 0x44, 1);
        }
        write_reg(transport, 0x70, status | DEVICE_STATUS_DRIVER_OK);
    }

    fn memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap()
    }

    fn dummy_transport(fail: bool) -> (MmioTransport, Arc<Mutex<Record>>) {
        let record = Arc::new(Mutex::new(Record::default()));
        let device = DummyDevice {
            record: record.clone(),
            fail,
        };
        let interrupt = Interrupt::new(Arc::new(CountingIrq::default()));
        let transport = MmioTransport::new(Box::new(device), memory(), interrupt, &test_logger());
        (transport, record)
    }

    #[test]
    fn test_mmio_identification() {
        let (mut transport, _) = dummy_transport(false);
        assert_eq!(read_reg(&mut transport, 0x00), MMIO_MAGIC_VALUE);
        assert_eq!(read_reg(&mut transport, 0x04), 2);
        assert_eq!(read_reg(&mut transport, 0x08), 0x42);
        assert_eq!(read_reg(&mut transport, 0x10), 1 << 5);
        write_reg(&mut transport, 0x14, 1);
        assert_eq!(read_reg(&mut transport, 0x10), 1);
        write_reg(&mut transport, 0x30, 1);
        assert_eq!(read_reg(&mut transport, 0x34), 8);
        write_reg(&mut transport, 0x30, 7);
        assert_eq!(read_reg(&mut transport, 0x34), 0);

        let mut config = [0u8; 2];
        transport.read(0x102, &mut config);
        assert_eq!(config, [3, 4]);
        // short reads of registers return zero
        let mut short = [0xffu8; 2];
        transport.read(0x00, &mut short);
        assert_eq!(short, [0, 0]);
    }

    #[test]
    fn test_mmio_activation() {
        let memory = memory();
        let (mut transport, record) = dummy_transport(false);
        let queues = [
            DriverQueue::new(&memory, 0x1000, 16).queue(),
            DriverQueue::new(&memory, 0x2000, 8).queue(),
        ];

        // notifications before activation are dropped
        write_reg(&mut transport, 0x50, 0);
        driver_activate(&mut transport, &queues);
        assert!(transport.is_activated());
        assert_eq!(read_reg(&mut transport, 0x70) & DEVICE_STATUS_NEEDS_RESET, 0);
        assert_eq!(transport.driver_features, 1 << 5 | 1 << VIRTIO_F_VERSION_1);

        let activated = record.lock().unwrap().activated.clone().unwrap();
        assert_eq!(activated[0].desc_table, GuestAddress(0x1000));
        assert_eq!(activated[1].used_ring, queues[1].used_ring);
        assert_eq!(activated[1].size, 8);

        write_reg(&mut transport, 0x50, 1);
        assert_eq!(record.lock().unwrap().notified, vec![1]);

        // layout and resets are frozen once running
        write_reg(&mut transport, 0x30, 0);
        write_reg(&mut transport, 0x38, 4);
        write_reg(&mut transport, 0x70, 0);
        assert!(transport.is_activated());
        assert_eq!(transport.queues[0].size, 16);
        assert_ne!(read_reg(&mut transport, 0x70) & DEVICE_STATUS_NEEDS_RESET, 0);
    }

    #[test]
    fn test_mmio_activation_failures() {
        let memory = memory();
        let (mut transport, _) = dummy_transport(true);
        let queues = [DriverQueue::new(&memory, 0x1000, 16).queue()];
        driver_activate(&mut transport, &queues);
        assert!(!transport.is_activated());
        assert_ne!(read_reg(&mut transport, 0x70) & DEVICE_STATUS_NEEDS_RESET, 0);

        // a ready queue outside guest memory
        let (mut transport, record) = dummy_transport(false);
        let mut bad = DriverQueue::new(&memory, 0x1000, 16).queue();
        bad.used_ring = GuestAddress(0x20_0000);
        driver_activate(&mut transport, &[bad]);
        assert!(!transport.is_activated());
        assert!(record.lock().unwrap().activated.is_none());

        // a driver without VIRTIO_F_VERSION_1 never gets FEATURES_OK
        let (mut transport, _) = dummy_transport(false);
        write_reg(&mut transport, 0x70, DEVICE_STATUS_ACKNOWLEDGE | DEVICE_STATUS_DRIVER);
        write_reg(&mut transport, 0x24, 0);
        write_reg(&mut transport, 0x20, 1 << 5);
        write_reg(
            &mut transport,
            0x70,
            DEVICE_STATUS_ACKNOWLEDGE | DEVICE_STATUS_DRIVER | DEVICE_STATUS_FEATURES_OK,
        );
        assert_eq!(read_reg(&mut transport, 0x70) & DEVICE_STATUS_FEATURES_OK, 0);
    }

    #[test]
    fn test_mmio_bus_dispatch() {
        let (transport, _) = dummy_transport(false);
        let slot = MmioSlot {
            kind: VirtioDeviceKind::Block,
            base: 0xd000_0000,
            irq: 5,
        };
        let bus = MmioBus::new(vec![(slot, transport)]);
        assert!(!bus.is_empty());

        let mut data = [0u8; 4];
        assert!(bus.read(0xd000_0000, &mut data));
        assert_eq!(u32::from_le_bytes(data), MMIO_MAGIC_VALUE);
        assert!(bus.read(0xd000_0008, &mut data));
        assert_eq!(u32::from_le_bytes(data), 0x42);
        assert!(!bus.read(0xd000_1000, &mut data));
        assert!(!bus.write(0xc000_0000, &data));
    }
}
