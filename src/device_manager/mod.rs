// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Host-side endpoints of guest communication channels.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use slog::{info, warn};

use crate::config::LaunchConfig;
use crate::utils::error::{LaunchError, Result};
use crate::utils::resource::{ResourceKind, ResourceStats, ResourceTicket};

/// Virtual machine console device manager.
pub mod console_manager;
pub use self::console_manager::{ConsoleManager, SerialSink};

/// Hybrid vsock host endpoint.
pub mod vsock_manager;
pub use self::vsock_manager::{VsockEndpoint, VsockManager};

/// Guest placement of the virtio-mmio devices.
pub mod virtio_mmio;
pub use self::virtio_mmio::{guest_boot_args, mmio_slots, MmioSlot, VirtioDeviceKind};

/// Kinds of host-side device endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Serial,
    Vsock,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::Serial => f.write_str("serial"),
            DeviceKind::Vsock => f.write_str("vsock"),
        }
    }
}

/// A Unix domain socket bound at a filesystem path, owned by one guest.
///
/// A stale socket left at the path by an earlier run is removed before
/// binding. The socket file is removed again when the guard is dropped.
#[derive(Debug)]
pub struct SocketGuard {
    kind: DeviceKind,
    path: PathBuf,
    listener: UnixListener,
    _ticket: ResourceTicket,
}

impl SocketGuard {
    /// Bind a listener at `path`.
    pub fn bind(
        kind: DeviceKind,
        path: &Path,
        stats: &ResourceStats,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let bind_failed = |source: io::Error| LaunchError::DeviceBindFailed {
            kind,
            path: path.to_path_buf(),
            source,
        };

        if remove_stale_socket(path).map_err(bind_failed)? {
            info!(logger, "removed stale socket"; "kind" => %kind, "path" => ?path);
        }
        let listener = UnixListener::bind(path).map_err(bind_failed)?;
        listener.set_nonblocking(true).map_err(bind_failed)?;

        Ok(SocketGuard {
            kind,
            path: path.to_path_buf(),
            listener,
            _ticket: stats.acquire(ResourceKind::Socket),
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// Only sockets are removed; any other file at the path makes bind fail.
fn remove_stale_socket(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path).map(|_| true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Serial and vsock endpoints of one guest.
#[derive(Default)]
pub struct DeviceEndpoints {
    pub serial: Option<ConsoleManager>,
    pub vsock: Option<VsockManager>,
}

impl DeviceEndpoints {
    /// Bind every channel requested by `config`; omitted channels are skipped.
    ///
    /// Endpoints already bound are released if a later one fails.
    pub fn wire(config: &LaunchConfig, stats: &ResourceStats, logger: &slog::Logger) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "device_manager"));
        let mut endpoints = DeviceEndpoints::default();

        match config.serial_path.as_ref() {
            Some(path) => {
                endpoints.serial = Some(ConsoleManager::create_socket_console(path, stats, &logger)?);
            }
            None => warn!(logger, "no serial path configured, guest console output is discarded"),
        }

        if let Some(vsock) = config.vsock.as_ref() {
            endpoints.vsock = Some(VsockManager::create(vsock, stats, &logger)?);
        }

        Ok(endpoints)
    }

    /// Guest serial sink, if a serial socket is wired.
    pub fn serial_sink(&self) -> Option<SerialSink> {
        self.serial.as_ref().map(|console| console.sink())
    }

    /// Guest side of the hybrid vsock socket, if one is wired.
    pub fn vsock_endpoint(&self) -> Option<VsockEndpoint> {
        self.vsock.as_ref().map(|vsock| vsock.endpoint())
    }
}

impl fmt::Debug for DeviceEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceEndpoints")
            .field("serial", &self.serial.as_ref().map(|c| c.sock_path().to_path_buf()))
            .field("vsock", &self.vsock.as_ref().map(|v| v.uds_path().to_path_buf()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VsockConfig, DEFAULT_VSOCK_GUEST_CID};
    use crate::test_utils::test_logger;
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_socket_guard_removes_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("serial.sock");
        let stats = ResourceStats::new();
        let logger = test_logger();

        // a leftover socket from a crashed run
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let guard = SocketGuard::bind(DeviceKind::Serial, &path, &stats, &logger).unwrap();
        assert_eq!(guard.kind(), DeviceKind::Serial);
        assert_eq!(stats.live(ResourceKind::Socket), 1);
        drop(guard);
        assert!(!path.exists());
        assert_eq!(stats.live(ResourceKind::Socket), 0);
    }

    #[test]
    fn test_socket_guard_keeps_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();
        let stats = ResourceStats::new();

        match SocketGuard::bind(DeviceKind::Vsock, &path, &stats, &test_logger()) {
            Err(LaunchError::DeviceBindFailed { kind, source, .. }) => {
                assert_eq!(kind, DeviceKind::Vsock);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        assert_eq!(stats.live(ResourceKind::Socket), 0);
    }

    #[test]
    fn test_wire_releases_serial_when_vsock_fails() {
        let dir = TempDir::new().unwrap();
        let stats = ResourceStats::new();
        let serial = dir.as_path().join("serial.sock");
        let mut config = LaunchConfig::new("vm", PathBuf::from("/boot/vmlinux"));
        config.serial_path = Some(serial.clone());
        config.vsock = Some(VsockConfig {
            uds_path: dir.as_path().join("missing-dir").join("kata.hvsock"),
            guest_cid: DEFAULT_VSOCK_GUEST_CID,
        });

        let err = DeviceEndpoints::wire(&config, &stats, &test_logger()).unwrap_err();
        assert!(matches!(err, LaunchError::DeviceBindFailed { kind: DeviceKind::Vsock, .. }));
        assert!(!serial.exists());
        assert_eq!(stats.live(ResourceKind::Socket), 0);
    }

    #[test]
    fn test_wire_skips_omitted_channels() {
        let stats = ResourceStats::new();
        let config = LaunchConfig::new("vm", PathBuf::from("/boot/vmlinux"));
        let endpoints = DeviceEndpoints::wire(&config, &stats, &test_logger()).unwrap();
        assert!(endpoints.serial.is_none());
        assert!(endpoints.vsock.is_none());
        assert!(endpoints.serial_sink().is_none());
        assert!(endpoints.vsock_endpoint().is_none());
        assert!(stats.is_idle());
    }
}
