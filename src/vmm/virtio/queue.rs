// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryError, GuestMemoryMmap};

pub(crate) const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub(crate) const VIRTQ_DESC_F_WRITE: u16 = 0x2;
const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

const DESCRIPTOR_SIZE: u64 = 16;
const AVAIL_RING_HEADER: u64 = 4;
const USED_RING_HEADER: u64 = 4;
const USED_ELEMENT_SIZE: u64 = 8;

/// Errors while walking a virtqueue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("descriptor index {0} out of range")]
    DescriptorIndex(u16),

    #[error("descriptor chain longer than the queue")]
    ChainTooLong,

    #[error("indirect descriptors were not negotiated")]
    Indirect,

    #[error("guest memory access failed")]
    Memory(#[source] GuestMemoryError),
}

/// One buffer of a descriptor chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: GuestAddress,
    pub len: u32,
    /// Whether the device writes (rather than reads) the buffer.
    pub writable: bool,
}

/// A chain of buffers the driver made available.
#[derive(Clone, Debug)]
pub struct DescriptorChain {
    /// Index of the first descriptor, reported back in the used ring.
    pub head: u16,
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Total length of the device-writable buffers.
    pub fn writable_len(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| d.writable)
            .map(|d| d.len as usize)
            .sum()
    }

    /// Gather at most `limit` bytes from the device-readable buffers.
    pub fn read_to_vec(&self, memory: &GuestMemoryMmap, limit: usize) -> Result<Vec<u8>, QueueError> {
        let mut data = Vec::new();
        for desc in self.descriptors.iter().filter(|d| !d.writable) {
            let len = (desc.len as usize).min(limit - data.len());
            if len == 0 {
                break;
            }
            let start = data.len();
            data.resize(start + len, 0);
            memory
                .read_slice(&mut data[start..], desc.addr)
                .map_err(QueueError::Memory)?;
        }
        Ok(data)
    }

    /// Scatter `data` into the device-writable buffers and return how many
    /// bytes fit.
    pub fn write_from(&self, memory: &GuestMemoryMmap, data: &[u8]) -> Result<usize, QueueError> {
        let mut written = 0;
        for desc in self.descriptors.iter().filter(|d| d.writable) {
            let len = (desc.len as usize).min(data.len() - written);
            if len == 0 {
                break;
            }
            memory
                .write_slice(&data[written..written + len], desc.addr)
                .map_err(QueueError::Memory)?;
            written += len;
        }
        Ok(written)
    }
}

/// Device side of a split virtqueue.
#[derive(Clone, Debug)]
pub struct Queue {
    /// Largest size the device accepts.
    pub max_size: u16,
    /// Size chosen by the driver.
    pub size: u16,
    pub ready: bool,
    pub desc_table: GuestAddress,
    pub avail_ring: GuestAddress,
    pub used_ring: GuestAddress,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

impl Queue {
    pub fn new(max_size: u16) -> Self {
        Queue {
            max_size,
            size: max_size,
            ready: false,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
        }
    }

    /// Whether the driver configured the queue in a usable way.
    pub fn is_valid(&self, memory: &GuestMemoryMmap) -> bool {
        let size = self.size as u64;
        let in_memory = |addr: GuestAddress, len: u64| {
            memory.address_in_range(addr) && memory.address_in_range(GuestAddress(addr.0 + len - 1))
        };
        self.ready
            && self.size != 0
            && self.size <= self.max_size
            && self.size.is_power_of_two()
            && self.desc_table.0 % 16 == 0
            && self.avail_ring.0 % 2 == 0
            && self.used_ring.0 % 4 == 0
            && in_memory(self.desc_table, DESCRIPTOR_SIZE * size)
            && in_memory(self.avail_ring, AVAIL_RING_HEADER + 2 * size + 2)
            && in_memory(self.used_ring, USED_RING_HEADER + USED_ELEMENT_SIZE * size + 2)
    }

    /// Take the next chain the driver made available.
    pub fn pop(&mut self, memory: &GuestMemoryMmap) -> Result<Option<DescriptorChain>, QueueError> {
        let avail_idx: u16 = memory
            .read_obj(GuestAddress(self.avail_ring.0 + 2))
            .map_err(QueueError::Memory)?;
        // ring entries are read only after the index that published them
        fence(Ordering::Acquire);
        if self.next_avail.0 == avail_idx {
            return Ok(None);
        }

        let slot = (self.next_avail.0 % self.size) as u64;
        let head: u16 = memory
            .read_obj(GuestAddress(self.avail_ring.0 + AVAIL_RING_HEADER + 2 * slot))
            .map_err(QueueError::Memory)?;
        self.next_avail += Wrapping(1);
        self.read_chain(memory, head).map(Some)
    }

    fn read_chain(&self, memory: &GuestMemoryMmap, head: u16) -> Result<DescriptorChain, QueueError> {
        let mut descriptors = Vec::new();
        let mut index = head;
        loop {
            if index >= self.size {
                return Err(QueueError::DescriptorIndex(index));
            }
            if descriptors.len() >= self.size as usize {
                return Err(QueueError::ChainTooLong);
            }
            let base = self.desc_table.0 + DESCRIPTOR_SIZE * index as u64;
            let read = |offset: u64| GuestAddress(base + offset);
            let addr: u64 = memory.read_obj(read(0)).map_err(QueueError::Memory)?;
            let len: u32 = memory.read_obj(read(8)).map_err(QueueError::Memory)?;
            let flags: u16 = memory.read_obj(read(12)).map_err(QueueError::Memory)?;
            let next: u16 = memory.read_obj(read(14)).map_err(QueueError::Memory)?;
            if flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(QueueError::Indirect);
            }
            descriptors.push(Descriptor {
                addr: GuestAddress(addr),
                len,
                writable: flags & VIRTQ_DESC_F_WRITE != 0,
            });
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            index = next;
        }
        Ok(DescriptorChain { head, descriptors })
    }

    /// Return a chain to the driver with `len` bytes written into it.
    pub fn add_used(&mut self, memory: &GuestMemoryMmap, head: u16, len: u32) -> Result<(), QueueError> {
        let slot = (self.next_used.0 % self.size) as u64;
        let entry = self.used_ring.0 + USED_RING_HEADER + USED_ELEMENT_SIZE * slot;
        memory
            .write_obj(head as u32, GuestAddress(entry))
            .map_err(QueueError::Memory)?;
        memory
            .write_obj(len, GuestAddress(entry + 4))
            .map_err(QueueError::Memory)?;
        self.next_used += Wrapping(1);
        // the entry must be visible before the index that publishes it
        fence(Ordering::Release);
        memory
            .write_obj(self.next_used.0, GuestAddress(self.used_ring.0 + 2))
            .map_err(QueueError::Memory)
    }
}

/// Driver side of a split virtqueue, for exercising devices in tests.
#[cfg(test)]
pub(crate) struct DriverQueue {
    memory: GuestMemoryMmap,
    queue: Queue,
    next_desc: u16,
    avail_idx: u16,
    used_seen: u16,
}

#[cfg(test)]
impl DriverQueue {
    /// Lay out a queue of `size` entries at `base`.
    pub(crate) fn new(memory: &GuestMemoryMmap, base: u64, size: u16) -> Self {
        let mut queue = Queue::new(size);
        queue.ready = true;
        queue.desc_table = GuestAddress(base);
        queue.avail_ring = GuestAddress(base + DESCRIPTOR_SIZE * size as u64);
        let avail_end = queue.avail_ring.0 + AVAIL_RING_HEADER + 2 * size as u64 + 2;
        queue.used_ring = GuestAddress((avail_end + 3) & !3);
        DriverQueue {
            memory: memory.clone(),
            queue,
            next_desc: 0,
            avail_idx: 0,
            used_seen: 0,
        }
    }

    /// The device's view of the queue, as the driver configured it.
    pub(crate) fn queue(&self) -> Queue {
        self.queue.clone()
    }

    /// Publish a chain of `(address, length, device writable)` buffers.
    pub(crate) fn add_chain(&mut self, buffers: &[(u64, u32, bool)]) -> u16 {
        let size = self.queue.size;
        let head = self.next_desc;
        for (i, (addr, len, writable)) in buffers.iter().enumerate() {
            let index = (head + i as u16) % size;
            let mut flags = if *writable { VIRTQ_DESC_F_WRITE } else { 0 };
            if i + 1 < buffers.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            let base = self.queue.desc_table.0 + DESCRIPTOR_SIZE * index as u64;
            self.memory.write_obj(*addr, GuestAddress(base)).unwrap();
            self.memory.write_obj(*len, GuestAddress(base + 8)).unwrap();
            self.memory.write_obj(flags, GuestAddress(base + 12)).unwrap();
            self.memory
                .write_obj((index + 1) % size, GuestAddress(base + 14))
                .unwrap();
        }
        self.next_desc = (head + buffers.len() as u16) % size;

        let slot = (self.avail_idx % size) as u64;
        let ring = self.queue.avail_ring.0;
        self.memory
            .write_obj(head, GuestAddress(ring + AVAIL_RING_HEADER + 2 * slot))
            .unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.memory.write_obj(self.avail_idx, GuestAddress(ring + 2)).unwrap();
        head
    }

    /// Used entries `(head, length)` published since the last call.
    pub(crate) fn take_used(&mut self) -> Vec<(u32, u32)> {
        let ring = self.queue.used_ring.0;
        let used_idx: u16 = self.memory.read_obj(GuestAddress(ring + 2)).unwrap();
        let mut entries = Vec::new();
        while self.used_seen != used_idx {
            let slot = (self.used_seen % self.queue.size) as u64;
            let entry = ring + USED_RING_HEADER + USED_ELEMENT_SIZE * slot;
            let id: u32 = self.memory.read_obj(GuestAddress(entry)).unwrap();
            let len: u32 = self.memory.read_obj(GuestAddress(entry + 4)).unwrap();
            entries.push((id, len));
            self.used_seen = self.used_seen.wrapping_add(1);
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap()
    }

    #[test]
    fn test_pop_and_add_used() {
        let memory = memory();
        let mut driver = DriverQueue::new(&memory, 0x1000, 16);
        let mut queue = driver.queue();
        assert!(queue.is_valid(&memory));
        assert!(queue.pop(&memory).unwrap().is_none());

        memory.write_slice(b"request", GuestAddress(0x8000)).unwrap();
        let head = driver.add_chain(&[(0x8000, 7, false), (0x9000, 16, true), (0xa000, 16, true)]);
        let chain = queue.pop(&memory).unwrap().unwrap();
        assert_eq!(chain.head, head);
        assert_eq!(chain.descriptors.len(), 3);
        assert_eq!(chain.writable_len(), 32);
        assert_eq!(chain.read_to_vec(&memory, 64).unwrap(), b"request");
        assert_eq!(chain.read_to_vec(&memory, 3).unwrap(), b"req");

        // spills from the first writable buffer into the second
        let reply = [0x5au8; 20];
        assert_eq!(chain.write_from(&memory, &reply).unwrap(), 20);
        let mut tail = [0u8; 4];
        memory.read_slice(&mut tail, GuestAddress(0xa000)).unwrap();
        assert_eq!(tail, [0x5a; 4]);
        assert_eq!(chain.write_from(&memory, &[0u8; 64]).unwrap(), 32);

        queue.add_used(&memory, chain.head, 20).unwrap();
        assert_eq!(driver.take_used(), vec![(head as u32, 20)]);
        assert!(queue.pop(&memory).unwrap().is_none());
    }

    #[test]
    fn test_invalid_queues() {
        let memory = memory();
        let driver = DriverQueue::new(&memory, 0x1000, 16);

        let mut queue = driver.queue();
        queue.size = 12;
        assert!(!queue.is_valid(&memory));

        let mut queue = driver.queue();
        queue.ready = false;
        assert!(!queue.is_valid(&memory));

        let mut queue = driver.queue();
        queue.used_ring = GuestAddress(0x10_0000);
        assert!(!queue.is_valid(&memory));

        let mut queue = driver.queue();
        queue.desc_table = GuestAddress(0x1008);
        assert!(!queue.is_valid(&memory));
    }

    #[test]
    fn test_malformed_chains() {
        let memory = memory();
        let mut driver = DriverQueue::new(&memory, 0x1000, 4);
        let mut queue = driver.queue();

        // a chain pointing past the table
        let head = driver.add_chain(&[(0x8000, 8, false), (0x9000, 8, true)]);
        let base = 0x1000 + DESCRIPTOR_SIZE * head as u64;
        memory.write_obj(9u16, GuestAddress(base + 14)).unwrap();
        assert!(matches!(queue.pop(&memory), Err(QueueError::DescriptorIndex(9))));

        // a chain looping on itself
        let head = driver.add_chain(&[(0x8000, 8, false), (0x9000, 8, true)]);
        let second = (head + 1) % 4;
        let base = 0x1000 + DESCRIPTOR_SIZE * second as u64;
        memory.write_obj(VIRTQ_DESC_F_NEXT, GuestAddress(base + 12)).unwrap();
        memory.write_obj(head, GuestAddress(base + 14)).unwrap();
        assert!(matches!(queue.pop(&memory), Err(QueueError::ChainTooLong)));

        let head = driver.add_chain(&[(0x8000, 16, false)]);
        let base = 0x1000 + DESCRIPTOR_SIZE * head as u64;
        memory.write_obj(VIRTQ_DESC_F_INDIRECT, GuestAddress(base + 12)).unwrap();
        assert!(matches!(queue.pop(&memory), Err(QueueError::Indirect)));
    }
}
