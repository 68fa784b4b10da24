// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host side of a hybrid vsock device.
//!
//! Host processes reach guest vsock ports through a Unix domain socket: a
//! client connects, sends `CONNECT <port>\n` and, once the guest accepts
//! the connection, receives `OK <local port>\n` before the stream carries
//! payload.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, info, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::{DeviceKind, SocketGuard};
use crate::config::VsockConfig;
use crate::utils::error::{LaunchError, Result};
use crate::utils::resource::ResourceStats;

const EPOLL_EVENT_LISTENER: u64 = 0;
const EPOLL_EVENT_EXIT: u64 = 1;
const EPOLL_EVENT_HANDSHAKE_BASE: u64 = 2;
const EPOLL_EVENTS_LEN: usize = 32;
const MAX_PENDING_CONNECTIONS: usize = 64;
const MAX_HANDSHAKES: usize = 64;
const HANDSHAKE_MAX_LEN: usize = 32;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors related to the hybrid vsock handshake.
#[derive(Debug, thiserror::Error)]
pub enum VsockHandshakeError {
    /// The client closed or failed before sending a full request.
    #[error("cannot read connect request")]
    Read(#[source] io::Error),

    /// The request line is not `CONNECT <port>`.
    #[error("malformed connect request {0:?}")]
    Malformed(String),

    #[error("no connect request within {0:?}")]
    Timeout(Duration),
}

/// Parse a `CONNECT <port>` request line, case-insensitively.
pub fn parse_connect_request(line: &str) -> std::result::Result<u32, VsockHandshakeError> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(cmd), Some(port), None) if cmd.eq_ignore_ascii_case("connect") => port
            .parse::<u32>()
            .map_err(|_| VsockHandshakeError::Malformed(line.to_string())),
        _ => Err(VsockHandshakeError::Malformed(line.to_string())),
    }
}

/// A host connection waiting for the guest to accept it.
#[derive(Debug)]
pub struct PendingConnection {
    /// Guest port the client asked for.
    pub port: u32,
    pub stream: UnixStream,
}

impl PendingConnection {
    /// Tell the client the guest accepted the connection on `local_port` and
    /// hand the stream over.
    pub fn accept(mut self, local_port: u32) -> io::Result<UnixStream> {
        self.stream
            .write_all(format!("OK {}\n", local_port).as_bytes())?;
        Ok(self.stream)
    }
}

type PendingQueue = Arc<Mutex<VecDeque<PendingConnection>>>;

fn lock(queue: &PendingQueue) -> MutexGuard<VecDeque<PendingConnection>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

/// The guest-facing half of a hybrid vsock endpoint, handed to the backend
/// that emulates the guest vsock device.
#[derive(Clone)]
pub struct VsockEndpoint {
    guest_cid: u32,
    uds_path: PathBuf,
    pending: PendingQueue,
    ready: Arc<EventFd>,
}

impl VsockEndpoint {
    pub fn guest_cid(&self) -> u32 {
        self.guest_cid
    }

    pub fn uds_path(&self) -> &Path {
        &self.uds_path
    }

    /// Readable whenever new host connections are pending.
    pub fn ready_evt(&self) -> &EventFd {
        &self.ready
    }

    /// Take every pending host connection, oldest first.
    pub fn drain_pending(&self) -> Vec<PendingConnection> {
        // clear the counter before draining so a racing push re-arms it
        let _ = self.ready.read();
        lock(&self.pending).drain(..).collect()
    }
}

impl std::fmt::Debug for VsockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VsockEndpoint")
            .field("guest_cid", &self.guest_cid)
            .field("uds_path", &self.uds_path)
            .finish()
    }
}

/// Hybrid vsock endpoint of one guest.
pub struct VsockManager {
    endpoint: VsockEndpoint,
    exit_evt: EventFd,
    thread: Option<thread::JoinHandle<()>>,
    socket: SocketGuard,
}

impl VsockManager {
    /// Bind the hybrid vsock socket and start accepting host connections.
    pub fn create(config: &VsockConfig, stats: &ResourceStats, logger: &slog::Logger) -> Result<Self> {
        let logger = logger.new(slog::o!("subsystem" => "vsock_manager"));
        let socket = SocketGuard::bind(DeviceKind::Vsock, &config.uds_path, stats, &logger)?;
        let setup_failed = |source: io::Error| LaunchError::DeviceBindFailed {
            kind: DeviceKind::Vsock,
            path: config.uds_path.clone(),
            source,
        };

        let exit_evt = EventFd::new(EFD_NONBLOCK).map_err(setup_failed)?;
        let endpoint = VsockEndpoint {
            guest_cid: config.guest_cid,
            uds_path: config.uds_path.clone(),
            pending: PendingQueue::default(),
            ready: Arc::new(EventFd::new(EFD_NONBLOCK).map_err(setup_failed)?),
        };
        let acceptor = VsockAcceptor {
            listener: socket.listener().try_clone().map_err(setup_failed)?,
            exit_evt: exit_evt.try_clone().map_err(setup_failed)?,
            epoll: Epoll::new().map_err(setup_failed)?,
            endpoint: endpoint.clone(),
            handshakes: HashMap::new(),
            next_token: EPOLL_EVENT_HANDSHAKE_BASE,
            logger: logger.clone(),
        };
        acceptor.init().map_err(setup_failed)?;
        let thread = thread::Builder::new()
            .name("vsock_mgr".to_owned())
            .spawn(move || acceptor.run())
            .map_err(setup_failed)?;

        info!(logger, "hybrid vsock listening";
            "path" => ?config.uds_path, "guest_cid" => config.guest_cid);
        Ok(VsockManager {
            endpoint,
            exit_evt,
            thread: Some(thread),
            socket,
        })
    }

    pub fn guest_cid(&self) -> u32 {
        self.endpoint.guest_cid
    }

    pub fn uds_path(&self) -> &Path {
        self.socket.path()
    }

    /// Handle for the backend's guest vsock device.
    pub fn endpoint(&self) -> VsockEndpoint {
        self.endpoint.clone()
    }

    /// Number of host connections waiting for the guest.
    pub fn pending_count(&self) -> usize {
        lock(&self.endpoint.pending).len()
    }
}

impl Drop for VsockManager {
    fn drop(&mut self) {
        let _ = self.exit_evt.write(1);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        lock(&self.endpoint.pending).clear();
    }
}

/// A client that connected but has not sent its full request line yet.
struct Handshake {
    stream: UnixStream,
    line: Vec<u8>,
    deadline: Instant,
}

impl Handshake {
    /// Consume what the client sent so far. Bytes are read one at a time so
    /// payload following the request line stays in the socket.
    fn read_request(&mut self) -> Option<std::result::Result<u32, VsockHandshakeError>> {
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Some(Err(VsockHandshakeError::Read(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    ))))
                }
                Ok(_) if byte[0] == b'\n' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    return Some(parse_connect_request(&line));
                }
                Ok(_) if self.line.len() + 1 >= HANDSHAKE_MAX_LEN => {
                    self.line.push(byte[0]);
                    return Some(Err(VsockHandshakeError::Malformed(
                        String::from_utf8_lossy(&self.line).into_owned(),
                    )));
                }
                Ok(_) => self.line.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(VsockHandshakeError::Read(e))),
            }
        }
    }
}

struct VsockAcceptor {
    listener: UnixListener,
    exit_evt: EventFd,
    epoll: Epoll,
    endpoint: VsockEndpoint,
    handshakes: HashMap<u64, Handshake>,
    next_token: u64,
    logger: slog::Logger,
}

impl VsockAcceptor {
    fn init(&self) -> io::Result<()> {
        self.epoll.ctl(
            ControlOperation::Add,
            self.listener.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EPOLL_EVENT_LISTENER),
        )?;
        self.epoll.ctl(
            ControlOperation::Add,
            self.exit_evt.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EPOLL_EVENT_EXIT),
        )
    }

    fn run(mut self) {
        let mut events = vec![EpollEvent::default(); EPOLL_EVENTS_LEN];
        loop {
            let count = match self.epoll.wait(self.wait_timeout(), &mut events[..]) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    slog::error!(self.logger, "vsock epoll wait failed: {:?}", e);
                    return;
                }
            };
            for event in events.iter().take(count) {
                match event.data() {
                    EPOLL_EVENT_EXIT => return,
                    EPOLL_EVENT_LISTENER => self.accept(),
                    token => self.continue_handshake(token),
                }
            }
            self.expire_handshakes();
        }
    }

    // Milliseconds until the oldest handshake expires, or forever.
    fn wait_timeout(&self) -> i32 {
        let now = Instant::now();
        self.handshakes
            .values()
            .map(|h| h.deadline.saturating_duration_since(now))
            .min()
            .map(|left| left.as_millis().min(i32::MAX as u128) as i32 + 1)
            .unwrap_or(-1)
    }

    fn accept(&mut self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(self.logger, "failed to accept vsock connection: {:?}", e);
                    return;
                }
            };
            if self.handshakes.len() >= MAX_HANDSHAKES {
                warn!(self.logger, "too many vsock handshakes in progress, dropping client");
                continue;
            }
            if let Err(e) = self.track(stream) {
                warn!(self.logger, "cannot watch vsock client: {:?}", e);
            }
        }
    }

    fn track(&mut self, stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let token = self.next_token;
        self.epoll.ctl(
            ControlOperation::Add,
            stream.as_raw_fd(),
            EpollEvent::new(EventSet::IN, token),
        )?;
        self.next_token += 1;
        self.handshakes.insert(
            token,
            Handshake {
                stream,
                line: Vec::with_capacity(HANDSHAKE_MAX_LEN),
                deadline: Instant::now() + HANDSHAKE_TIMEOUT,
            },
        );
        Ok(())
    }

    fn untrack(&mut self, token: u64) -> Option<Handshake> {
        let handshake = self.handshakes.remove(&token)?;
        let _ = self.epoll.ctl(
            ControlOperation::Delete,
            handshake.stream.as_raw_fd(),
            EpollEvent::default(),
        );
        Some(handshake)
    }

    fn continue_handshake(&mut self, token: u64) {
        let result = match self.handshakes.get_mut(&token) {
            Some(handshake) => match handshake.read_request() {
                Some(result) => result,
                None => return,
            },
            None => return,
        };
        let handshake = match self.untrack(token) {
            Some(handshake) => handshake,
            None => return,
        };
        match result {
            Ok(port) => self.queue(port, handshake.stream),
            Err(e) => warn!(self.logger, "rejecting vsock connection: {}", e),
        }
    }

    fn expire_handshakes(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .handshakes
            .iter()
            .filter(|(_, h)| h.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            self.untrack(token);
            warn!(self.logger, "rejecting vsock connection: {}",
                VsockHandshakeError::Timeout(HANDSHAKE_TIMEOUT));
        }
    }

    fn queue(&self, port: u32, stream: UnixStream) {
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(self.logger, "rejecting vsock connection: {:?}", e; "port" => port);
            return;
        }
        let mut queue = lock(&self.endpoint.pending);
        if queue.len() >= MAX_PENDING_CONNECTIONS {
            warn!(self.logger, "too many pending vsock connections"; "port" => port);
            return;
        }
        debug!(self.logger, "vsock connection pending"; "port" => port);
        queue.push_back(PendingConnection { port, stream });
        drop(queue);
        let _ = self.endpoint.ready.write(1);
    }
}
