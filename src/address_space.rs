// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest physical address space.
//!
//! ```text
//! 0                      3GiB          4GiB - fw        4GiB
//! +----------------------+-------------+----------------+----------------------+
//! | low RAM              | MMIO hole   | firmware       | high RAM (remainder) |
//! +----------------------+-------------+----------------+----------------------+
//! ```
//!
//! Firmware boots enter through the reset vector at the top of the firmware
//! window and find the kernel payload at `FIRMWARE_PAYLOAD_START`. Direct
//! boots enter the kernel in 64-bit mode with boot params at
//! `ZERO_PAGE_START`.

use std::fs::OpenOptions;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use linux_loader::configurator::linux::LinuxBootConfigurator;
use linux_loader::configurator::{BootConfigurator, BootParams};
use linux_loader::loader::bootparam::{boot_params, setup_header};
use linux_loader::loader::{bzimage::BzImage, elf::Elf, KernelLoader};
use slog::{debug, info};
use vm_memory::{
    Address, Bytes, FileOffset, GuestAddress, GuestMemory as _, GuestMemoryMmap, GuestMemoryRegion,
};

use crate::boot_image::{BootImages, KernelFormat};
use crate::config::{MachineConfig, MemoryBacking, CMDLINE_MAX_SIZE};
use crate::utils::error::LaunchError;
use crate::utils::error_chain;
use crate::utils::resource::{ResourceKind, ResourceStats, ResourceTicket};

/// Start of the kernel load area for direct boots.
pub const HIMEM_START: u64 = 0x0010_0000;
/// Boot params ("zero page") location.
pub const ZERO_PAGE_START: u64 = 0x7000;
/// Kernel command line location.
pub const CMDLINE_START: u64 = 0x0002_0000;
/// Kernel payload location for firmware boots.
pub const FIRMWARE_PAYLOAD_START: u64 = 0x0200_0000;
/// Start of the 32-bit MMIO hole.
pub const MMIO_LOW_START: u64 = 0xc000_0000;
/// First address above 4GiB.
pub const FIRST_ADDR_PAST_32BITS: u64 = 1 << 32;

// Conventional memory below the EBDA.
const EBDA_START: u64 = 0x0009_fc00;
const PAGE_SIZE: u64 = 0x1000;
const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;
const KERNEL_BOOT_FLAG_MAGIC: u16 = 0xaa55;
const KERNEL_HDR_MAGIC: u32 = 0x5372_6448;
const KERNEL_LOADER_OTHER: u8 = 0xff;
const KERNEL_MIN_ALIGNMENT_BYTES: u32 = 0x0100_0000;
// 64-bit entry of a bzImage protected-mode kernel.
const BZIMAGE_64BIT_ENTRY_OFFSET: u64 = 0x200;

/// Errors associated with guest address space setup.
#[derive(Debug, thiserror::Error)]
pub enum AddressSpaceError {
    /// Guest memory could not be mapped.
    #[error("failure in creating guest memory object")]
    CreateGuestMemory(#[source] vm_memory::mmap::Error),

    /// The memory backing file could not be prepared.
    #[error("cannot prepare memory file {0:?}")]
    MemoryFile(PathBuf, #[source] std::io::Error),

    /// A guest memory access failed.
    #[error("cannot access guest memory at 0x{0:x}")]
    AccessGuestMemory(u64, #[source] vm_memory::GuestMemoryError),

    /// A range does not fit in guest RAM.
    #[error("range 0x{0:x}+0x{1:x} is outside guest RAM")]
    OutOfRange(u64, u64),

    /// The kernel loader rejected the kernel.
    #[error("cannot load kernel")]
    LoadKernel(#[source] linux_loader::loader::Error),

    /// Boot params could not be written.
    #[error("cannot write boot params")]
    BootParams(#[source] linux_loader::configurator::Error),

    /// The command line does not fit the kernel's buffer.
    #[error("command line of {0} bytes exceeds the {1} byte limit")]
    CmdlineTooLong(usize, usize),
}

impl From<AddressSpaceError> for LaunchError {
    fn from(e: AddressSpaceError) -> Self {
        match e {
            AddressSpaceError::CreateGuestMemory(_) | AddressSpaceError::MemoryFile(..) => {
                LaunchError::ResourceExhausted(error_chain(&e))
            }
            e => LaunchError::ConfigInvalid(format!("guest memory layout: {}", error_chain(&e))),
        }
    }
}

/// Specialized version of `std::result::Result` for address space operations.
pub type Result<T> = std::result::Result<T, AddressSpaceError>;

/// Where the boot CPU starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootEntry {
    /// Firmware reset vector, 16 bytes below 4GiB.
    ResetVector,
    /// 64-bit kernel entry point with boot params at `ZERO_PAGE_START`.
    Direct(GuestAddress),
}

/// Result of placing boot images into guest memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootLayout {
    pub entry: BootEntry,
    pub kernel: (GuestAddress, u64),
    pub initrd: Option<(GuestAddress, u64)>,
    pub cmdline: (GuestAddress, u64),
}

/// The RAM and firmware window of one guest.
pub struct GuestMemory {
    memory: GuestMemoryMmap,
    ram: Vec<(GuestAddress, usize)>,
    firmware: Option<(GuestAddress, usize)>,
    _ticket: ResourceTicket,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("ram", &self.ram)
            .field("firmware", &self.firmware)
            .finish()
    }
}

/// Split `size` bytes of RAM around the MMIO hole.
pub fn ram_ranges(size: usize) -> Vec<(GuestAddress, usize)> {
    let size = size as u64;
    if size <= MMIO_LOW_START {
        vec![(GuestAddress(0), size as usize)]
    } else {
        vec![
            (GuestAddress(0), MMIO_LOW_START as usize),
            (
                GuestAddress(FIRST_ADDR_PAST_32BITS),
                (size - MMIO_LOW_START) as usize,
            ),
        ]
    }
}

impl GuestMemory {
    /// Map guest RAM, plus a firmware window of `firmware_size` bytes ending
    /// at 4GiB when a firmware is used.
    pub fn allocate(
        machine: &MachineConfig,
        firmware_size: Option<usize>,
        stats: &ResourceStats,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "address_space"));
        let size = machine
            .mem_size_bytes()
            .ok_or(AddressSpaceError::OutOfRange(0, u64::MAX))?;
        let ram = ram_ranges(size);
        let firmware = firmware_size
            .map(|len| (GuestAddress(FIRST_ADDR_PAST_32BITS - len as u64), len));

        let mut ranges: Vec<(GuestAddress, usize, Option<FileOffset>)> = match &machine.mem_backing
        {
            MemoryBacking::Anonymous => ram.iter().map(|(a, l)| (*a, *l, None)).collect(),
            MemoryBacking::File(path) => file_backed_ranges(path, &ram)?,
        };
        if let Some((addr, len)) = firmware {
            ranges.push((addr, len, None));
        }

        let memory = GuestMemoryMmap::from_ranges_with_files(ranges)
            .map_err(AddressSpaceError::CreateGuestMemory)?;
        for (addr, len) in ram.iter() {
            info!(logger, "guest memory region created";
                "start" => format!("0x{:x}", addr.raw_value()), "size" => len);
        }
        if let Some((addr, len)) = firmware {
            info!(logger, "firmware window created";
                "start" => format!("0x{:x}", addr.raw_value()), "size" => len);
        }

        Ok(GuestMemory {
            memory,
            ram,
            firmware,
            _ticket: stats.acquire(ResourceKind::GuestMemory),
        })
    }

    /// The mapped guest memory.
    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// RAM ranges, excluding the firmware window.
    pub fn ram_ranges(&self) -> &[(GuestAddress, usize)] {
        &self.ram
    }

    /// Firmware window, if any.
    pub fn firmware_window(&self) -> Option<(GuestAddress, usize)> {
        self.firmware
    }

    /// Highest RAM address below the MMIO hole, exclusive.
    pub fn low_ram_end(&self) -> u64 {
        self.ram[0].0.raw_value() + self.ram[0].1 as u64
    }

    fn check_ram_range(&self, addr: u64, len: u64) -> Result<()> {
        let fits = self.ram.iter().any(|(start, size)| {
            let start = start.raw_value();
            addr >= start
                && addr
                    .checked_add(len)
                    .map_or(false, |end| end <= start + *size as u64)
        });
        if fits {
            Ok(())
        } else {
            Err(AddressSpaceError::OutOfRange(addr, len))
        }
    }

    /// Copy `data` to guest RAM at `addr`.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_ram_range(addr, data.len() as u64)?;
        self.memory
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| AddressSpaceError::AccessGuestMemory(addr, e))
    }

    /// Read `len` bytes of guest RAM at `addr`.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory
            .read_slice(&mut buf, GuestAddress(addr))
            .map_err(|e| AddressSpaceError::AccessGuestMemory(addr, e))?;
        Ok(buf)
    }

    /// Copy boot images and the command line into guest memory.
    pub fn place_images(
        &self,
        images: &BootImages,
        cmdline: &str,
        logger: &slog::Logger,
    ) -> Result<BootLayout> {
        let logger = logger.new(slog::o!("subsystem" => "address_space"));

        if cmdline.len() >= CMDLINE_MAX_SIZE {
            return Err(AddressSpaceError::CmdlineTooLong(
                cmdline.len(),
                CMDLINE_MAX_SIZE - 1,
            ));
        }
        let cmdline_len = cmdline.len() as u64 + 1;
        self.check_ram_range(CMDLINE_START, cmdline_len)?;
        let mut cmdline_bytes = Vec::with_capacity(cmdline_len as usize);
        cmdline_bytes.extend_from_slice(cmdline.as_bytes());
        cmdline_bytes.push(0);
        self.write_bytes(CMDLINE_START, &cmdline_bytes)?;

        let layout = match (images.firmware.as_ref(), self.firmware) {
            (Some(firmware), Some((fw_addr, _))) => {
                self.memory
                    .write_slice(firmware.bytes(), fw_addr)
                    .map_err(|e| AddressSpaceError::AccessGuestMemory(fw_addr.raw_value(), e))?;

                let kernel = images.kernel.image.bytes();
                self.write_bytes(FIRMWARE_PAYLOAD_START, kernel)?;
                let kernel_end = FIRMWARE_PAYLOAD_START + kernel.len() as u64;
                let initrd = self.place_initrd(images, kernel_end)?;

                BootLayout {
                    entry: BootEntry::ResetVector,
                    kernel: (GuestAddress(FIRMWARE_PAYLOAD_START), kernel.len() as u64),
                    initrd,
                    cmdline: (GuestAddress(CMDLINE_START), cmdline_len),
                }
            }
            _ => self.load_direct(images, cmdline_len)?,
        };

        debug!(logger, "boot images placed"; "layout" => ?layout);
        Ok(layout)
    }

    fn place_initrd(
        &self,
        images: &BootImages,
        kernel_end: u64,
    ) -> Result<Option<(GuestAddress, u64)>> {
        match images.initrd.as_ref() {
            Some(initrd) => {
                let addr = align_up(kernel_end, PAGE_SIZE);
                self.write_bytes(addr, initrd.bytes())?;
                Ok(Some((GuestAddress(addr), initrd.len() as u64)))
            }
            None => Ok(None),
        }
    }

    fn load_direct(&self, images: &BootImages, cmdline_len: u64) -> Result<BootLayout> {
        let kernel = images.kernel.image.bytes();
        let mut reader = Cursor::new(kernel);

        let (entry, kernel_start, kernel_end, header) = match images.kernel.format {
            KernelFormat::Elf => {
                let result = Elf::load(
                    &self.memory,
                    None,
                    &mut reader,
                    Some(GuestAddress(HIMEM_START)),
                )
                .map_err(AddressSpaceError::LoadKernel)?;
                (result.kernel_load, result.kernel_load, result.kernel_end, None)
            }
            KernelFormat::BzImage => {
                let result = BzImage::load(
                    &self.memory,
                    Some(GuestAddress(HIMEM_START)),
                    &mut reader,
                    Some(GuestAddress(HIMEM_START)),
                )
                .map_err(AddressSpaceError::LoadKernel)?;
                let entry = result
                    .kernel_load
                    .checked_add(BZIMAGE_64BIT_ENTRY_OFFSET)
                    .ok_or(AddressSpaceError::OutOfRange(result.kernel_load.raw_value(), 0))?;
                (entry, result.kernel_load, result.kernel_end, result.setup_header)
            }
        };
        let kernel_len = kernel_end.saturating_sub(kernel_start.raw_value());
        self.check_ram_range(kernel_start.raw_value(), kernel_len)?;

        let initrd = self.place_initrd(images, kernel_end)?;
        self.write_boot_params(header, initrd, cmdline_len)?;

        Ok(BootLayout {
            entry: BootEntry::Direct(entry),
            kernel: (kernel_start, kernel_len),
            initrd,
            cmdline: (GuestAddress(CMDLINE_START), cmdline_len),
        })
    }

    fn write_boot_params(
        &self,
        header: Option<setup_header>,
        initrd: Option<(GuestAddress, u64)>,
        cmdline_len: u64,
    ) -> Result<()> {
        // cmdline_size is the kernel's limit without the NUL, kept as the
        // bzImage announces it
        let mut hdr = match header {
            Some(hdr) => {
                if hdr.cmdline_size != 0 && cmdline_len - 1 > hdr.cmdline_size as u64 {
                    return Err(AddressSpaceError::CmdlineTooLong(
                        cmdline_len as usize - 1,
                        hdr.cmdline_size as usize,
                    ));
                }
                hdr
            }
            None => setup_header {
                cmdline_size: CMDLINE_MAX_SIZE as u32 - 1,
                ..Default::default()
            },
        };
        hdr.type_of_loader = KERNEL_LOADER_OTHER;
        hdr.boot_flag = KERNEL_BOOT_FLAG_MAGIC;
        hdr.header = KERNEL_HDR_MAGIC;
        hdr.cmd_line_ptr = CMDLINE_START as u32;
        hdr.kernel_alignment = KERNEL_MIN_ALIGNMENT_BYTES;
        if let Some((addr, len)) = initrd {
            hdr.ramdisk_image = addr.raw_value() as u32;
            hdr.ramdisk_size = len as u32;
        }

        let mut params = boot_params {
            hdr,
            ..Default::default()
        };
        let mut e820 = vec![(0u64, EBDA_START, E820_RAM)];
        let low_end = self.low_ram_end();
        if low_end > HIMEM_START {
            e820.push((HIMEM_START, low_end - HIMEM_START, E820_RAM));
        }
        if let Some((addr, len)) = self.firmware {
            e820.push((addr.raw_value(), len as u64, E820_RESERVED));
        }
        if let Some((addr, len)) = self.ram.get(1) {
            e820.push((addr.raw_value(), *len as u64, E820_RAM));
        }
        for (i, (addr, size, type_)) in e820.iter().enumerate() {
            params.e820_table[i].addr = *addr;
            params.e820_table[i].size = *size;
            params.e820_table[i].type_ = *type_;
        }
        params.e820_entries = e820.len() as u8;

        let boot_params = BootParams::new(&params, GuestAddress(ZERO_PAGE_START));
        LinuxBootConfigurator::write_bootparams(&boot_params, &self.memory)
            .map_err(AddressSpaceError::BootParams)
    }

    /// Guest regions with their host mapping, for registering with a hypervisor.
    pub fn host_regions(&self) -> Vec<(u64, u64, u64)> {
        self.memory
            .iter()
            .filter_map(|region| {
                let host = self.memory.get_host_address(region.start_addr()).ok()?;
                Some((region.start_addr().raw_value(), region.len(), host as u64))
            })
            .collect()
    }
}

fn file_backed_ranges(
    path: &Path,
    ram: &[(GuestAddress, usize)],
) -> Result<Vec<(GuestAddress, usize, Option<FileOffset>)>> {
    let total: u64 = ram.iter().map(|(_, len)| *len as u64).sum();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| AddressSpaceError::MemoryFile(path.to_path_buf(), e))?;
    file.set_len(total)
        .map_err(|e| AddressSpaceError::MemoryFile(path.to_path_buf(), e))?;

    let mut offset = 0u64;
    let mut ranges = Vec::with_capacity(ram.len());
    for (addr, len) in ram.iter() {
        let file = file
            .try_clone()
            .map_err(|e| AddressSpaceError::MemoryFile(path.to_path_buf(), e))?;
        ranges.push((*addr, *len, Some(FileOffset::new(file, offset))));
        offset += *len as u64;
    }
    Ok(ranges)
}

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}
