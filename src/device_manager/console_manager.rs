// Copyright (C) 2022 Alibaba Cloud Computing. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtual machine console device manager.
//!
//! The guest serial port is the frontend, a Unix domain socket on the host is
//! the backend. One client may be attached to the socket at a time: guest
//! output is forwarded to it and its input is buffered for the guest UART.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::{DeviceKind, SocketGuard};
use crate::utils::error::{LaunchError, Result};
use crate::utils::resource::ResourceStats;

const EPOLL_EVENT_SERIAL: u64 = 0;
const EPOLL_EVENT_SERIAL_DATA: u64 = 1;
const EPOLL_EVENT_EXIT: u64 = 2;
// Input not yet consumed by the guest is dropped beyond this size.
const SERIAL_INPUT_CAPACITY: usize = 64 << 10;

#[derive(Default)]
struct SerialState {
    output: Option<UnixStream>,
    input: VecDeque<u8>,
    dropped: u64,
}

/// Shared console state between the console thread and the guest serial
/// device emulation.
#[derive(Clone, Default)]
pub struct SerialSink {
    state: Arc<Mutex<SerialState>>,
}

impl SerialSink {
    fn lock(&self) -> MutexGuard<SerialState> {
        // A panicking holder leaves only byte buffers behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forward guest output to the attached client, if any.
    ///
    /// The client socket is nonblocking: output it does not drain in time is
    /// dropped rather than stalling the vCPU.
    pub fn write_output(&self, data: &[u8]) {
        let mut state = self.lock();
        let conn = match state.output.as_mut() {
            Some(conn) => conn,
            None => return,
        };
        let mut written = 0;
        let mut broken = false;
        while written < data.len() {
            match conn.write(&data[written..]) {
                Ok(0) => {
                    broken = true;
                    break;
                }
                Ok(count) => written += count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    broken = true;
                    break;
                }
            }
        }
        if broken {
            state.output = None;
        } else {
            state.dropped += (data.len() - written) as u64;
        }
    }

    /// Whether a console client is attached.
    pub fn is_connected(&self) -> bool {
        self.lock().output.is_some()
    }

    /// Bytes of guest output dropped because the client did not keep up.
    pub fn dropped_output(&self) -> u64 {
        self.lock().dropped
    }

    /// Next byte of client input for the guest.
    pub fn pop_input(&self) -> Option<u8> {
        self.lock().input.pop_front()
    }

    /// Whether client input is waiting for the guest.
    pub fn has_input(&self) -> bool {
        !self.lock().input.is_empty()
    }

    fn push_input(&self, data: &[u8]) {
        let mut state = self.lock();
        let room = SERIAL_INPUT_CAPACITY.saturating_sub(state.input.len());
        state.input.extend(data.iter().take(room));
    }

    fn set_output_stream(&self, stream: Option<UnixStream>) {
        self.lock().output = stream;
    }
}

/// Console manager serving the guest serial port on a Unix domain socket.
pub struct ConsoleManager {
    logger: slog::Logger,
    sink: SerialSink,
    exit_evt: EventFd,
    thread: Option<thread::JoinHandle<()>>,
    socket: SocketGuard,
}

impl ConsoleManager {
    /// Create a console backend device by using Unix Domain socket.
    pub fn create_socket_console(
        sock_path: &Path,
        stats: &ResourceStats,
        logger: &slog::Logger,
    ) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "console_manager"));
        let socket = SocketGuard::bind(DeviceKind::Serial, sock_path, stats, &logger)?;
        let setup_failed = |source: io::Error| LaunchError::DeviceBindFailed {
            kind: DeviceKind::Serial,
            path: sock_path.to_path_buf(),
            source,
        };

        let exit_evt = EventFd::new(EFD_NONBLOCK).map_err(setup_failed)?;
        let sink = SerialSink::default();
        let mut handler = ConsoleEpollHandler {
            sink: sink.clone(),
            listener: socket.listener().try_clone().map_err(setup_failed)?,
            conn: None,
            exit_evt: exit_evt.try_clone().map_err(setup_failed)?,
            epoll: Epoll::new().map_err(setup_failed)?,
            logger: logger.clone(),
        };
        handler.init().map_err(setup_failed)?;

        let thread = thread::Builder::new()
            .name("console_mgr".to_owned())
            .spawn(move || handler.run())
            .map_err(setup_failed)?;

        slog::info!(logger, "serial console listening"; "path" => ?sock_path);
        Ok(ConsoleManager {
            logger,
            sink,
            exit_evt,
            thread: Some(thread),
            socket,
        })
    }

    /// Host path of the console socket.
    pub fn sock_path(&self) -> &Path {
        self.socket.path()
    }

    /// Handle used by the guest serial device.
    pub fn sink(&self) -> SerialSink {
        self.sink.clone()
    }
}

impl Drop for ConsoleManager {
    fn drop(&mut self) {
        if let Err(e) = self.exit_evt.write(1) {
            slog::error!(self.logger, "failed to stop console thread: {:?}", e);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.sink.set_output_stream(None);
    }
}

struct ConsoleEpollHandler {
    sink: SerialSink,
    listener: UnixListener,
    conn: Option<UnixStream>,
    exit_evt: EventFd,
    epoll: Epoll,
    logger: slog::Logger,
}

impl ConsoleEpollHandler {
    fn init(&mut self) -> io::Result<()> {
        self.epoll.ctl(
            ControlOperation::Add,
            self.listener.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EPOLL_EVENT_SERIAL),
        )?;
        self.epoll.ctl(
            ControlOperation::Add,
            self.exit_evt.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EPOLL_EVENT_EXIT),
        )
    }

    fn run(&mut self) {
        let mut events = vec![EpollEvent::default(); 4];
        loop {
            let count = match self.epoll.wait(-1, &mut events[..]) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    slog::error!(self.logger, "console epoll wait failed: {:?}", e);
                    return;
                }
            };

            for event in events.iter().take(count) {
                match event.data() {
                    EPOLL_EVENT_EXIT => return,
                    EPOLL_EVENT_SERIAL => {
                        if let Err(e) = self.uds_listener_accept() {
                            slog::warn!(self.logger, "failed to accept incoming connection, {:?}", e);
                        }
                    }
                    EPOLL_EVENT_SERIAL_DATA => {
                        if let Err(e) = self.uds_read_in() {
                            slog::warn!(self.logger, "failed to read data from UDS, {:?}", e);
                        }
                    }
                    slot => slog::error!(self.logger, "unknown epoll slot number {}", slot),
                }
            }
        }
    }

    fn uds_listener_accept(&mut self) -> io::Result<()> {
        let (conn_sock, _) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        if self.conn.is_some() {
            slog::warn!(
                self.logger,
                "UDS for serial port already exists, reject the new connection"
            );
            return Ok(());
        }

        // shared by the reader below and the vCPU writing guest output
        conn_sock.set_nonblocking(true)?;
        self.epoll.ctl(
            ControlOperation::Add,
            conn_sock.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EPOLL_EVENT_SERIAL_DATA),
        )?;
        self.sink.set_output_stream(Some(conn_sock.try_clone()?));
        self.conn = Some(conn_sock);

        Ok(())
    }

    fn uds_read_in(&mut self) -> io::Result<()> {
        let mut should_drop = true;

        if let Some(conn_sock) = self.conn.as_mut() {
            let mut out = [0u8; 64];
            match conn_sock.read(&mut out[..]) {
                // Zero-length read means EOF. Remove this conn sock.
                Ok(0) => {}
                Ok(count) => {
                    self.sink.push_input(&out[..count]);
                    should_drop = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => should_drop = false,
                Err(e) => {
                    slog::warn!(self.logger, "error while reading serial conn sock: {:?}", e);
                }
            }
        }

        if should_drop {
            self.sink.set_output_stream(None);
            if let Some(conn_sock) = self.conn.take() {
                self.epoll.ctl(
                    ControlOperation::Delete,
                    conn_sock.as_raw_fd(),
                    EpollEvent::default(),
                )?;
            }
        }

        Ok(())
    }
}
