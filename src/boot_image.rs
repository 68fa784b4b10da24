// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boot image resolution.
//!
//! Kernel, firmware and initrd are read into owned buffers ready to be copied
//! into guest memory. The rootfs is only opened: it backs a block device and
//! is never loaded. Every image is opened read-only, except a rootfs the
//! guest is allowed to write.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use slog::{debug, info};

use crate::config::{BootSourceConfig, RootfsConfig};
use crate::utils::error::{LaunchError, Result};
use crate::utils::resource::{ResourceKind, ResourceStats, ResourceTicket};

/// Largest firmware image that fits the firmware window below 4GiB.
pub const FIRMWARE_MAX_SIZE: usize = 16 << 20;
/// Firmware images are mapped in whole pages.
pub const FIRMWARE_ALIGNMENT: usize = 0x1000;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
// Offsets into the bzImage real-mode header, see Documentation/x86/boot.rst.
const BZIMAGE_HEADER_OFFSET: usize = 0x202;
const BZIMAGE_VERSION_OFFSET: usize = 0x206;
const BZIMAGE_LOADFLAGS_OFFSET: usize = 0x211;
const BZIMAGE_HDR_MAGIC: u32 = 0x5372_6448;
const BZIMAGE_MIN_VERSION: u16 = 0x0200;
const BZIMAGE_LOADED_HIGH: u8 = 0x1;

/// Kinds of boot images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Kernel,
    Firmware,
    Initrd,
    Rootfs,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ImageKind::Kernel => "kernel",
            ImageKind::Firmware => "firmware",
            ImageKind::Initrd => "initrd",
            ImageKind::Rootfs => "rootfs",
        };
        f.write_str(name)
    }
}

/// Format of a guest kernel image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFormat {
    /// Uncompressed 64-bit ELF (vmlinux).
    Elf,
    /// Compressed bzImage.
    BzImage,
}

/// A boot image loaded into memory.
#[derive(Debug)]
pub struct LoadedImage {
    kind: ImageKind,
    path: PathBuf,
    data: Vec<u8>,
    _ticket: ResourceTicket,
}

impl LoadedImage {
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A guest kernel and its detected format.
#[derive(Debug)]
pub struct KernelImage {
    pub image: LoadedImage,
    pub format: KernelFormat,
}

/// Root block device backing, opened but not read.
#[derive(Debug)]
pub struct RootfsImage {
    path: PathBuf,
    file: File,
    size: u64,
    is_root: bool,
    is_read_only: bool,
    _ticket: ResourceTicket,
}

impl RootfsImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    /// A second handle on the image for the guest block device. The image
    /// itself stays with the guest for resource accounting.
    pub fn block_backing(&self) -> Result<BlockBacking> {
        let file = self.file.try_clone().map_err(|e| {
            LaunchError::ResourceExhausted(format!("cannot duplicate rootfs handle: {}", e))
        })?;
        Ok(BlockBacking {
            path: self.path.clone(),
            file,
            size: self.size,
            read_only: self.is_read_only,
        })
    }
}

/// Host file behind a guest block device.
#[derive(Debug)]
pub struct BlockBacking {
    pub path: PathBuf,
    pub file: File,
    /// Size in bytes.
    pub size: u64,
    pub read_only: bool,
}

/// Validated boot images of one guest.
#[derive(Debug)]
pub struct BootImages {
    pub kernel: KernelImage,
    pub firmware: Option<LoadedImage>,
    pub initrd: Option<LoadedImage>,
    pub rootfs: Option<RootfsImage>,
}

impl BootImages {
    /// Open, read and validate every image named by `boot`.
    ///
    /// Images already loaded are released if a later one fails.
    pub fn resolve(
        boot: &BootSourceConfig,
        stats: &ResourceStats,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "boot_image"));

        let kernel = load_image(ImageKind::Kernel, &boot.kernel_path, stats)?;
        let format = kernel_format(&kernel.data).ok_or_else(|| LaunchError::ImageFormatInvalid {
            kind: ImageKind::Kernel,
            path: boot.kernel_path.clone(),
            reason: "neither a 64-bit ELF nor a bzImage".to_string(),
        })?;
        debug!(logger, "kernel image loaded"; "path" => ?boot.kernel_path, "format" => ?format, "size" => kernel.len());

        let firmware = match boot.firmware_path.as_ref() {
            Some(path) => {
                let firmware = load_image(ImageKind::Firmware, path, stats)?;
                check_firmware(&firmware)?;
                debug!(logger, "firmware image loaded"; "path" => ?path, "size" => firmware.len());
                Some(firmware)
            }
            None => None,
        };

        let initrd = match boot.initrd_path.as_ref() {
            Some(path) => Some(load_image(ImageKind::Initrd, path, stats)?),
            None => None,
        };

        let rootfs = match boot.rootfs.as_ref() {
            Some(rootfs) => Some(open_rootfs(rootfs, stats)?),
            None => None,
        };

        info!(logger, "boot images resolved";
            "kernel" => ?boot.kernel_path,
            "firmware" => ?boot.firmware_path,
            "initrd" => ?boot.initrd_path,
            "rootfs" => ?boot.rootfs.as_ref().map(|r| &r.path));

        Ok(BootImages {
            kernel: KernelImage {
                image: kernel,
                format,
            },
            firmware,
            initrd,
            rootfs,
        })
    }
}

fn open_error(kind: ImageKind, path: &Path, e: io::Error) -> LaunchError {
    if e.kind() == io::ErrorKind::NotFound {
        LaunchError::ImageNotFound {
            kind,
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    } else {
        LaunchError::ImageUnreadable {
            kind,
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    }
}

fn open_read_only(kind: ImageKind, path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| open_error(kind, path, e))
}

fn load_image(kind: ImageKind, path: &Path, stats: &ResourceStats) -> Result<LoadedImage> {
    let mut file = open_read_only(kind, path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| LaunchError::ImageUnreadable {
            kind,
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if data.is_empty() {
        return Err(LaunchError::ImageFormatInvalid {
            kind,
            path: path.to_path_buf(),
            reason: "image is empty".to_string(),
        });
    }

    Ok(LoadedImage {
        kind,
        path: path.to_path_buf(),
        data,
        _ticket: stats.acquire(ResourceKind::Image),
    })
}

/// Detect the format of a kernel image from its header bytes.
pub fn kernel_format(data: &[u8]) -> Option<KernelFormat> {
    if data.len() > 5
        && &data[..4] == ELF_MAGIC
        && data[4] == ELF_CLASS_64
        && data[5] == ELF_DATA_LSB
    {
        return Some(KernelFormat::Elf);
    }

    if data.len() > BZIMAGE_LOADFLAGS_OFFSET {
        let magic = u32::from_le_bytes([
            data[BZIMAGE_HEADER_OFFSET],
            data[BZIMAGE_HEADER_OFFSET + 1],
            data[BZIMAGE_HEADER_OFFSET + 2],
            data[BZIMAGE_HEADER_OFFSET + 3],
        ]);
        let version =
            u16::from_le_bytes([data[BZIMAGE_VERSION_OFFSET], data[BZIMAGE_VERSION_OFFSET + 1]]);
        let loadflags = data[BZIMAGE_LOADFLAGS_OFFSET];
        if magic == BZIMAGE_HDR_MAGIC
            && version >= BZIMAGE_MIN_VERSION
            && loadflags & BZIMAGE_LOADED_HIGH != 0
        {
            return Some(KernelFormat::BzImage);
        }
    }

    None
}

fn check_firmware(firmware: &LoadedImage) -> Result<()> {
    let reason = if firmware.len() % FIRMWARE_ALIGNMENT != 0 {
        format!(
            "size {:#x} is not a multiple of {:#x}",
            firmware.len(),
            FIRMWARE_ALIGNMENT
        )
    } else if firmware.len() > FIRMWARE_MAX_SIZE {
        format!(
            "size {:#x} exceeds the firmware window of {:#x}",
            firmware.len(),
            FIRMWARE_MAX_SIZE
        )
    } else {
        return Ok(());
    };

    Err(LaunchError::ImageFormatInvalid {
        kind: ImageKind::Firmware,
        path: firmware.path.clone(),
        reason,
    })
}

fn open_rootfs(rootfs: &RootfsConfig, stats: &ResourceStats) -> Result<RootfsImage> {
    let path = rootfs.path.as_path();
    let mut file = OpenOptions::new()
        .read(true)
        .write(!rootfs.is_read_only)
        .open(path)
        .map_err(|e| open_error(ImageKind::Rootfs, path, e))?;
    let unreadable = |e: io::Error| LaunchError::ImageUnreadable {
        kind: ImageKind::Rootfs,
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let file_type = file.metadata().map_err(unreadable)?.file_type();
    if !file_type.is_file() && !file_type.is_block_device() {
        return Err(LaunchError::ImageFormatInvalid {
            kind: ImageKind::Rootfs,
            path: path.to_path_buf(),
            reason: "neither a regular file nor a block device".to_string(),
        });
    }

    // metadata reports zero for block devices, seek reports the real size
    let size = file.seek(SeekFrom::End(0)).map_err(unreadable)?;
    file.seek(SeekFrom::Start(0)).map_err(unreadable)?;
    if size == 0 {
        return Err(LaunchError::ImageFormatInvalid {
            kind: ImageKind::Rootfs,
            path: path.to_path_buf(),
            reason: "image is empty".to_string(),
        });
    }

    Ok(RootfsImage {
        path: path.to_path_buf(),
        file,
        size,
        is_root: rootfs.is_root,
        is_read_only: rootfs.is_read_only,
        _ticket: stats.acquire(ResourceKind::Image),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{elf_kernel_stub, test_logger, write_temp_file};
    use vmm_sys_util::tempdir::TempDir;

    fn bzimage_stub() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        data[BZIMAGE_HEADER_OFFSET..BZIMAGE_HEADER_OFFSET + 4]
            .copy_from_slice(&BZIMAGE_HDR_MAGIC.to_le_bytes());
        data[BZIMAGE_VERSION_OFFSET..BZIMAGE_VERSION_OFFSET + 2]
            .copy_from_slice(&0x020f_u16.to_le_bytes());
        data[BZIMAGE_LOADFLAGS_OFFSET] = BZIMAGE_LOADED_HIGH;
        data
    }

    #[test]
    fn test_kernel_format() {
        assert_eq!(kernel_format(&elf_kernel_stub()), Some(KernelFormat::Elf));
        assert_eq!(kernel_format(&bzimage_stub()), Some(KernelFormat::BzImage));

        let mut old = bzimage_stub();
        old[BZIMAGE_VERSION_OFFSET..BZIMAGE_VERSION_OFFSET + 2]
            .copy_from_slice(&0x0104_u16.to_le_bytes());
        assert_eq!(kernel_format(&old), None);

        let mut elf32 = elf_kernel_stub();
        elf32[4] = 1;
        assert_eq!(kernel_format(&elf32), None);
        assert_eq!(kernel_format(b"MZ"), None);
    }

    #[test]
    fn test_resolve_all_images() {
        let dir = TempDir::new().unwrap();
        let stats = ResourceStats::new();
        let boot = BootSourceConfig {
            kernel_path: write_temp_file(&dir, "vmlinux", &elf_kernel_stub()),
            firmware_path: Some(write_temp_file(&dir, "OVMF.fd", &[0x90u8; 0x2000])),
            initrd_path: Some(write_temp_file(&dir, "initrd.img", b"070701")),
            rootfs: Some(RootfsConfig {
                path: write_temp_file(&dir, "rootfs.ext4", &[0u8; 512]),
                is_root: true,
                is_read_only: true,
            }),
            boot_args: String::new(),
        };

        let images = BootImages::resolve(&boot, &stats, &test_logger()).unwrap();
        assert_eq!(images.kernel.format, KernelFormat::Elf);
        assert_eq!(images.firmware.as_ref().unwrap().len(), 0x2000);
        assert_eq!(images.initrd.as_ref().unwrap().bytes(), b"070701");
        let rootfs = images.rootfs.as_ref().unwrap();
        assert_eq!(rootfs.size(), 512);
        assert!(rootfs.is_root());
        assert!(rootfs.is_read_only());
        let backing = rootfs.block_backing().unwrap();
        assert_eq!(backing.size, 512);
        assert!(backing.read_only);
        assert_eq!(backing.path, rootfs.path());
        assert_eq!(stats.live(ResourceKind::Image), 4);

        drop(images);
        assert_eq!(stats.live(ResourceKind::Image), 0);
    }

    #[test]
    fn test_missing_rootfs_releases_loaded_images() {
        let dir = TempDir::new().unwrap();
        let stats = ResourceStats::new();
        let missing = dir.as_path().join("missing.ext4");
        let boot = BootSourceConfig {
            kernel_path: write_temp_file(&dir, "vmlinux", &elf_kernel_stub()),
            rootfs: Some(RootfsConfig {
                path: missing.clone(),
                is_root: true,
                is_read_only: false,
            }),
            ..Default::default()
        };

        match BootImages::resolve(&boot, &stats, &test_logger()) {
            Err(LaunchError::ImageNotFound { kind, path, .. }) => {
                assert_eq!(kind, ImageKind::Rootfs);
                assert_eq!(path, missing);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(stats.live(ResourceKind::Image), 0);
    }

    #[test]
    fn test_invalid_images() {
        let dir = TempDir::new().unwrap();
        let stats = ResourceStats::new();
        let logger = test_logger();

        let mut boot = BootSourceConfig {
            kernel_path: write_temp_file(&dir, "vmlinux", b"not a kernel"),
            ..Default::default()
        };
        assert!(matches!(
            BootImages::resolve(&boot, &stats, &logger),
            Err(LaunchError::ImageFormatInvalid { kind: ImageKind::Kernel, .. })
        ));

        boot.kernel_path = write_temp_file(&dir, "vmlinux", &elf_kernel_stub());
        boot.firmware_path = Some(write_temp_file(&dir, "OVMF.fd", &[0u8; 100]));
        assert!(matches!(
            BootImages::resolve(&boot, &stats, &logger),
            Err(LaunchError::ImageFormatInvalid { kind: ImageKind::Firmware, .. })
        ));

        boot.firmware_path = None;
        boot.initrd_path = Some(write_temp_file(&dir, "initrd.img", b""));
        assert!(matches!(
            BootImages::resolve(&boot, &stats, &logger),
            Err(LaunchError::ImageFormatInvalid { kind: ImageKind::Initrd, .. })
        ));

        // a directory opens fine but cannot be read
        boot.initrd_path = Some(dir.as_path().to_path_buf());
        assert!(matches!(
            BootImages::resolve(&boot, &stats, &logger),
            Err(LaunchError::ImageUnreadable { kind: ImageKind::Initrd, .. })
        ));

        assert_eq!(stats.live(ResourceKind::Image), 0);
    }

    #[test]
    fn test_rootfs_access_mode() {
        use std::os::unix::fs::FileExt;

        let dir = TempDir::new().unwrap();
        let stats = ResourceStats::new();
        let kernel_path = write_temp_file(&dir, "vmlinux", &elf_kernel_stub());
        let rootfs_path = write_temp_file(&dir, "rootfs.ext4", &[0u8; 512]);

        for read_only in [true, false] {
            let boot = BootSourceConfig {
                kernel_path: kernel_path.clone(),
                rootfs: Some(RootfsConfig {
                    path: rootfs_path.clone(),
                    is_root: true,
                    is_read_only: read_only,
                }),
                ..Default::default()
            };
            let images = BootImages::resolve(&boot, &stats, &test_logger()).unwrap();
            let backing = images.rootfs.as_ref().unwrap().block_backing().unwrap();
            assert_eq!(backing.file.write_at(b"ext4", 0).is_ok(), !read_only);
        }
        assert_eq!(std::fs::read(&rootfs_path).unwrap()[..4], *b"ext4");
    }
}
