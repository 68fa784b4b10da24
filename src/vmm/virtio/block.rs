// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::io;
use std::os::unix::fs::FileExt;

use slog::{debug, warn};
use vm_memory::{Bytes, GuestMemoryMmap};

use super::{read_config_bytes, DescriptorChain, Interrupt, Queue, QueueError, VirtioDevice};
use crate::boot_image::BlockBacking;

pub const VIRTIO_ID_BLOCK: u32 = 2;

const QUEUE_SIZE: u16 = 256;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE];
const SECTOR_SHIFT: u8 = 9;
const REQUEST_HEADER_SIZE: u32 = 16;
const VIRTIO_BLK_ID_BYTES: usize = 20;

const VIRTIO_BLK_F_RO: u64 = 1 << 5;
const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("malformed request chain")]
    Malformed,

    #[error("guest memory access failed")]
    Queue(#[from] QueueError),

    #[error("request beyond the end of the disk")]
    OutOfRange,

    #[error("write to a read-only disk")]
    ReadOnly,

    #[error("unsupported request type {0}")]
    Unsupported(u32),

    #[error("disk I/O failed")]
    Io(#[source] io::Error),
}

impl RequestError {
    fn status(&self) -> u8 {
        match self {
            RequestError::Unsupported(_) => VIRTIO_BLK_S_UNSUPP,
            _ => VIRTIO_BLK_S_IOERR,
        }
    }
}

struct Activated {
    memory: GuestMemoryMmap,
    interrupt: Interrupt,
    queue: Queue,
}

/// Virtio block device over a host file. Requests run synchronously on the
/// vCPU that notified the queue.
pub struct Block {
    backing: BlockBacking,
    device_id: [u8; VIRTIO_BLK_ID_BYTES],
    active: Option<Activated>,
    logger: slog::Logger,
}

impl Block {
    pub fn new(backing: BlockBacking, logger: &slog::Logger) -> Self {
        let mut device_id = [0u8; VIRTIO_BLK_ID_BYTES];
        let name = backing
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let len = name.len().min(VIRTIO_BLK_ID_BYTES);
        device_id[..len].copy_from_slice(&name.as_bytes()[..len]);
        Block {
            backing,
            device_id,
            active: None,
            logger: logger.new(slog::o!("device" => "virtio-blk")),
        }
    }

    fn capacity(&self) -> u64 {
        self.backing.size >> SECTOR_SHIFT
    }

    fn process_queue(&mut self) {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return,
        };
        let mut used_any = false;
        loop {
            let chain = match active.queue.pop(&active.memory) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    warn!(self.logger, "dropping block queue entry: {}", e);
                    break;
                }
            };
            let len = execute(&self.backing, &self.device_id, &active.memory, &chain, &self.logger);
            if let Err(e) = active.queue.add_used(&active.memory, chain.head, len) {
                warn!(self.logger, "cannot return block request: {}", e);
                break;
            }
            used_any = true;
        }
        if used_any {
            if let Err(e) = active.interrupt.signal_used_queue() {
                warn!(self.logger, "cannot raise block interrupt: {}", e);
            }
        }
    }
}

// Run one request and write its status byte. Returns the bytes written to
// guest memory.
fn execute(
    backing: &BlockBacking,
    device_id: &[u8],
    memory: &GuestMemoryMmap,
    chain: &DescriptorChain,
    logger: &slog::Logger,
) -> u32 {
    let status = match chain.descriptors.last() {
        Some(status) if status.writable && status.len >= 1 && chain.descriptors.len() >= 2 => *status,
        _ => {
            warn!(logger, "block request without a status buffer");
            return 0;
        }
    };
    let (code, written) = match handle_request(backing, device_id, memory, chain) {
        Ok(written) => (VIRTIO_BLK_S_OK, written),
        Err(e) => {
            debug!(logger, "block request failed: {}", e);
            (e.status(), 0)
        }
    };
    match memory.write_obj(code, status.addr) {
        Ok(()) => written + 1,
        Err(e) => {
            warn!(logger, "cannot write block request status: {}", e);
            written
        }
    }
}

fn handle_request(
    backing: &BlockBacking,
    device_id: &[u8],
    memory: &GuestMemoryMmap,
    chain: &DescriptorChain,
) -> Result<u32, RequestError> {
    let header = chain.descriptors[0];
    if header.writable || header.len < REQUEST_HEADER_SIZE {
        return Err(RequestError::Malformed);
    }
    let mut raw = [0u8; REQUEST_HEADER_SIZE as usize];
    memory
        .read_slice(&mut raw, header.addr)
        .map_err(|e| RequestError::Queue(QueueError::Memory(e)))?;
    let request_type = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let mut sector_bytes = [0u8; 8];
    sector_bytes.copy_from_slice(&raw[8..16]);
    let sector = u64::from_le_bytes(sector_bytes);

    let data = &chain.descriptors[1..chain.descriptors.len() - 1];
    match request_type {
        VIRTIO_BLK_T_IN => {
            let mut offset = sector_offset(backing, sector, data.iter().map(|d| d.len as u64).sum())?;
            let mut written = 0u32;
            for desc in data {
                if !desc.writable {
                    return Err(RequestError::Malformed);
                }
                let mut buf = vec![0u8; desc.len as usize];
                backing
                    .file
                    .read_exact_at(&mut buf, offset)
                    .map_err(RequestError::Io)?;
                memory
                    .write_slice(&buf, desc.addr)
                    .map_err(|e| RequestError::Queue(QueueError::Memory(e)))?;
                offset += desc.len as u64;
                written += desc.len;
            }
            Ok(written)
        }
        VIRTIO_BLK_T_OUT => {
            if backing.read_only {
                return Err(RequestError::ReadOnly);
            }
            let mut offset = sector_offset(backing, sector, data.iter().map(|d| d.len as u64).sum())?;
            for desc in data {
                if desc.writable {
                    return Err(RequestError::Malformed);
                }
                let mut buf = vec![0u8; desc.len as usize];
                memory
                    .read_slice(&mut buf, desc.addr)
                    .map_err(|e| RequestError::Queue(QueueError::Memory(e)))?;
                backing
                    .file
                    .write_all_at(&buf, offset)
                    .map_err(RequestError::Io)?;
                offset += desc.len as u64;
            }
            Ok(0)
        }
        VIRTIO_BLK_T_FLUSH => {
            if !backing.read_only {
                backing.file.sync_all().map_err(RequestError::Io)?;
            }
            Ok(0)
        }
        VIRTIO_BLK_T_GET_ID => {
            let desc = match data.first() {
                Some(desc) if desc.writable => desc,
                _ => return Err(RequestError::Malformed),
            };
            let len = device_id.len().min(desc.len as usize);
            memory
                .write_slice(&device_id[..len], desc.addr)
                .map_err(|e| RequestError::Queue(QueueError::Memory(e)))?;
            Ok(len as u32)
        }
        other => Err(RequestError::Unsupported(other)),
    }
}

fn sector_offset(backing: &BlockBacking, sector: u64, len: u64) -> Result<u64, RequestError> {
    let offset = sector
        .checked_shl(SECTOR_SHIFT as u32)
        .filter(|o| o >> SECTOR_SHIFT == sector)
        .ok_or(RequestError::OutOfRange)?;
    match offset.checked_add(len) {
        Some(end) if end <= backing.size => Ok(offset),
        _ => Err(RequestError::OutOfRange),
    }
}

impl VirtioDevice for Block {
    fn device_type(&self) -> u32 {
        VIRTIO_ID_BLOCK
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn avail_features(&self) -> u64 {
        if self.backing.read_only {
            VIRTIO_BLK_F_RO
        } else {
            VIRTIO_BLK_F_FLUSH
        }
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        read_config_bytes(&self.capacity().to_le_bytes(), offset, data);
    }

    fn activate(&mut self, memory: GuestMemoryMmap, interrupt: Interrupt, mut queues: Vec<Queue>)
        -> io::Result<()> {
        let queue = queues
            .pop()
            .filter(|q| q.ready)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request queue not ready"))?;
        self.active = Some(Activated {
            memory,
            interrupt,
            queue,
        });
        Ok(())
    }

    fn queue_notify(&mut self, index: u32) {
        if index == 0 {
            self.process_queue();
        }
    }
}
