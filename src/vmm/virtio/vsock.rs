// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Virtio vsock device bridged to a hybrid vsock socket.
//!
//! Host clients reach guest ports through the [`VsockEndpoint`] handshake.
//! A guest connecting to host port `P` is bridged to the Unix socket at
//! `<uds_path>_P`, if one is listening.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::num::Wrapping;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;

use slog::{debug, error, info, warn};
use vm_memory::GuestMemoryMmap;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::{read_config_bytes, Interrupt, Queue, VirtioDevice};
use crate::device_manager::vsock_manager::{PendingConnection, VsockEndpoint};

pub const VIRTIO_ID_VSOCK: u32 = 19;

const QUEUE_SIZE: u16 = 256;
const QUEUE_SIZES: &[u16] = &[QUEUE_SIZE; 3];
const RX_QUEUE: u32 = 0;
const TX_QUEUE: u32 = 1;

const VSOCK_HOST_CID: u64 = 2;
const VSOCK_TYPE_STREAM: u16 = 1;

const VSOCK_OP_REQUEST: u16 = 1;
const VSOCK_OP_RESPONSE: u16 = 2;
const VSOCK_OP_RST: u16 = 3;
const VSOCK_OP_SHUTDOWN: u16 = 4;
const VSOCK_OP_RW: u16 = 5;
const VSOCK_OP_CREDIT_UPDATE: u16 = 6;
const VSOCK_OP_CREDIT_REQUEST: u16 = 7;

const VSOCK_FLAGS_SHUTDOWN_RCV: u32 = 1;
const VSOCK_FLAGS_SHUTDOWN_SEND: u32 = 2;

pub(crate) const PACKET_HEADER_SIZE: usize = 44;
/// Largest payload read from a host stream at once.
const MAX_PACKET_PAYLOAD: usize = 4096;
/// Receive buffer advertised to the guest for each connection.
const CONN_BUF_ALLOC: u32 = 256 * 1024;
const CREDIT_UPDATE_THRESHOLD: u32 = CONN_BUF_ALLOC / 4;
/// Host side ports of host initiated connections start here.
const LOCAL_PORT_BASE: u32 = 1 << 30;

const EPOLL_EVENT_EXIT: u64 = 0;
const EPOLL_EVENT_KICK: u64 = 1;
const EPOLL_EVENT_PENDING: u64 = 2;
const EPOLL_EVENT_STREAM_BASE: u64 = 3;
const EPOLL_EVENTS_LEN: usize = 32;

/// Header of a virtio vsock packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub src_cid: u64,
    pub dst_cid: u64,
    pub src_port: u32,
    pub dst_port: u32,
    pub len: u32,
    pub type_: u16,
    pub op: u16,
    pub flags: u32,
    pub buf_alloc: u32,
    pub fwd_cnt: u32,
}

impl PacketHeader {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| u32_at(at) as u64 | (u32_at(at + 4) as u64) << 32;
        Some(PacketHeader {
            src_cid: u64_at(0),
            dst_cid: u64_at(8),
            src_port: u32_at(16),
            dst_port: u32_at(20),
            len: u32_at(24),
            type_: u16_at(28),
            op: u16_at(30),
            flags: u32_at(32),
            buf_alloc: u32_at(36),
            fwd_cnt: u32_at(40),
        })
    }

    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        raw[0..8].copy_from_slice(&self.src_cid.to_le_bytes());
        raw[8..16].copy_from_slice(&self.dst_cid.to_le_bytes());
        raw[16..20].copy_from_slice(&self.src_port.to_le_bytes());
        raw[20..24].copy_from_slice(&self.dst_port.to_le_bytes());
        raw[24..28].copy_from_slice(&self.len.to_le_bytes());
        raw[28..30].copy_from_slice(&self.type_.to_le_bytes());
        raw[30..32].copy_from_slice(&self.op.to_le_bytes());
        raw[32..36].copy_from_slice(&self.flags.to_le_bytes());
        raw[36..40].copy_from_slice(&self.buf_alloc.to_le_bytes());
        raw[40..44].copy_from_slice(&self.fwd_cnt.to_le_bytes());
        raw
    }
}

#[derive(Debug)]
struct Packet {
    header: PacketHeader,
    data: Vec<u8>,
}

/// (host side port, guest port)
type ConnKey = (u32, u32);

enum ConnState {
    /// Host client waiting for the guest to answer our REQUEST.
    HostConnecting(PendingConnection),
    Established(UnixStream),
}

struct Connection {
    state: ConnState,
    token: u64,
    /// Events the stream is registered for, empty if not registered.
    interest: EventSet,
    peer_buf_alloc: u32,
    peer_fwd_cnt: Wrapping<u32>,
    /// Bytes sent to the guest.
    rx_cnt: Wrapping<u32>,
    /// Bytes from the guest written to the host stream.
    fwd_cnt: Wrapping<u32>,
    last_fwd_cnt_sent: Wrapping<u32>,
    /// Guest bytes the host stream could not take yet.
    to_host: VecDeque<u8>,
    peer_shutdown: u32,
    host_eof: bool,
}

impl Connection {
    fn new(state: ConnState, token: u64) -> Self {
        Connection {
            state,
            token,
            interest: EventSet::empty(),
            peer_buf_alloc: 0,
            peer_fwd_cnt: Wrapping(0),
            rx_cnt: Wrapping(0),
            fwd_cnt: Wrapping(0),
            last_fwd_cnt_sent: Wrapping(0),
            to_host: VecDeque::new(),
            peer_shutdown: 0,
            host_eof: false,
        }
    }

    fn stream(&self) -> Option<&UnixStream> {
        match &self.state {
            ConnState::Established(stream) => Some(stream),
            ConnState::HostConnecting(_) => None,
        }
    }

    /// Bytes the guest can still take on this connection.
    fn peer_credit(&self) -> u32 {
        let in_flight = (self.rx_cnt - self.peer_fwd_cnt).0;
        self.peer_buf_alloc.saturating_sub(in_flight)
    }

    fn wanted_interest(&self) -> EventSet {
        let mut interest = EventSet::empty();
        if self.stream().is_none() {
            return interest;
        }
        if !self.host_eof
            && self.peer_shutdown & VSOCK_FLAGS_SHUTDOWN_RCV == 0
            && self.peer_credit() > 0
        {
            interest |= EventSet::IN;
        }
        if !self.to_host.is_empty() {
            interest |= EventSet::OUT;
        }
        interest
    }

    /// Push queued guest bytes into the host stream.
    fn flush_to_host(&mut self) -> io::Result<()> {
        let stream = match &mut self.state {
            ConnState::Established(stream) => stream,
            ConnState::HostConnecting(_) => return Ok(()),
        };
        while !self.to_host.is_empty() {
            let (front, _) = self.to_host.as_slices();
            match stream.write(front) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.to_host.drain(..n);
                    self.fwd_cnt += Wrapping(n as u32);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.to_host.is_empty() && self.peer_shutdown & VSOCK_FLAGS_SHUTDOWN_SEND != 0 {
            let _ = stream.shutdown(Shutdown::Write);
        }
        Ok(())
    }
}

/// Virtio vsock device. Packets are moved by a worker thread; the vCPU
/// only kicks it on queue notifications.
pub struct Vsock {
    endpoint: VsockEndpoint,
    kick_evt: Option<EventFd>,
    exit_evt: Option<EventFd>,
    worker: Option<thread::JoinHandle<()>>,
    logger: slog::Logger,
}

impl Vsock {
    pub fn new(endpoint: VsockEndpoint, logger: &slog::Logger) -> Self {
        Vsock {
            endpoint,
            kick_evt: None,
            exit_evt: None,
            worker: None,
            logger: logger.new(slog::o!("device" => "virtio-vsock")),
        }
    }
}

impl VirtioDevice for Vsock {
    fn device_type(&self) -> u32 {
        VIRTIO_ID_VSOCK
    }

    fn queue_max_sizes(&self) -> &[u16] {
        QUEUE_SIZES
    }

    fn avail_features(&self) -> u64 {
        0
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        read_config_bytes(&(self.endpoint.guest_cid() as u64).to_le_bytes(), offset, data);
    }

    fn activate(&mut self, memory: GuestMemoryMmap, interrupt: Interrupt, queues: Vec<Queue>)
        -> io::Result<()> {
        let mut queues = queues.into_iter();
        let (rx, tx) = match (queues.next(), queues.next()) {
            (Some(rx), Some(tx)) if rx.ready && tx.ready => (rx, tx),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "vsock rx and tx queues not ready",
                ))
            }
        };
        let kick_evt = EventFd::new(EFD_NONBLOCK)?;
        let exit_evt = EventFd::new(EFD_NONBLOCK)?;
        let worker = VsockWorker::new(
            memory,
            interrupt,
            rx,
            tx,
            self.endpoint.clone(),
            kick_evt.try_clone()?,
            exit_evt.try_clone()?,
            &self.logger,
        )?;
        let handle = thread::Builder::new()
            .name("db_vsock".to_owned())
            .spawn(move || worker.run())?;
        self.kick_evt = Some(kick_evt);
        self.exit_evt = Some(exit_evt);
        self.worker = Some(handle);
        info!(self.logger, "vsock device active"; "guest_cid" => self.endpoint.guest_cid());
        Ok(())
    }

    fn queue_notify(&mut self, index: u32) {
        if index != RX_QUEUE && index != TX_QUEUE {
            return;
        }
        if let Some(kick) = self.kick_evt.as_ref() {
            if let Err(e) = kick.write(1) {
                warn!(self.logger, "cannot kick vsock worker: {}", e);
            }
        }
    }
}

impl Drop for Vsock {
    fn drop(&mut self) {
        if let Some(exit) = self.exit_evt.as_ref() {
            let _ = exit.write(1);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct VsockWorker {
    memory: GuestMemoryMmap,
    interrupt: Interrupt,
    rx: Queue,
    tx: Queue,
    guest_cid: u64,
    endpoint: VsockEndpoint,
    epoll: Epoll,
    kick_evt: EventFd,
    exit_evt: EventFd,
    conns: HashMap<ConnKey, Connection>,
    tokens: HashMap<u64, ConnKey>,
    next_token: u64,
    next_local_port: Wrapping<u32>,
    to_guest: VecDeque<Packet>,
    logger: slog::Logger,
}

impl VsockWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        memory: GuestMemoryMmap,
        interrupt: Interrupt,
        rx: Queue,
        tx: Queue,
        endpoint: VsockEndpoint,
        kick_evt: EventFd,
        exit_evt: EventFd,
        logger: &slog::Logger,
    ) -> io::Result<Self> {
        let epoll = Epoll::new()?;
        for (fd, token) in [
            (exit_evt.as_raw_fd(), EPOLL_EVENT_EXIT),
            (kick_evt.as_raw_fd(), EPOLL_EVENT_KICK),
            (endpoint.ready_evt().as_raw_fd(), EPOLL_EVENT_PENDING),
        ] {
            epoll.ctl(ControlOperation::Add, fd, EpollEvent::new(EventSet::IN, token))?;
        }
        Ok(VsockWorker {
            memory,
            interrupt,
            rx,
            tx,
            guest_cid: endpoint.guest_cid() as u64,
            endpoint,
            epoll,
            kick_evt,
            exit_evt,
            conns: HashMap::new(),
            tokens: HashMap::new(),
            next_token: EPOLL_EVENT_STREAM_BASE,
            next_local_port: Wrapping(LOCAL_PORT_BASE),
            to_guest: VecDeque::new(),
            logger: logger.clone(),
        })
    }

    fn run(mut self) {
        let mut events = vec![EpollEvent::default(); EPOLL_EVENTS_LEN];
        // host clients may have queued up before the guest driver came up
        self.connect_pending();
        self.flush_to_guest();
        loop {
            let count = match self.epoll.wait(-1, &mut events[..]) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(self.logger, "vsock epoll wait failed: {:?}", e);
                    return;
                }
            };
            for event in events.iter().take(count) {
                match event.data() {
                    EPOLL_EVENT_EXIT => {
                        let _ = self.exit_evt.read();
                        debug!(self.logger, "vsock worker exiting");
                        return;
                    }
                    EPOLL_EVENT_KICK => {
                        let _ = self.kick_evt.read();
                        self.process_tx();
                    }
                    EPOLL_EVENT_PENDING => self.connect_pending(),
                    token => self.service_stream(token, event.event_set()),
                }
            }
            self.flush_to_guest();
            self.update_interests();
        }
    }

    fn connect_pending(&mut self) {
        for pending in self.endpoint.drain_pending() {
            let local_port = match self.alloc_local_port() {
                Some(port) => port,
                None => {
                    warn!(self.logger, "no free vsock host port"; "port" => pending.port);
                    continue;
                }
            };
            let peer_port = pending.port;
            let token = self.next_token();
            let key = (local_port, peer_port);
            self.conns
                .insert(key, Connection::new(ConnState::HostConnecting(pending), token));
            self.tokens.insert(token, key);
            debug!(self.logger, "host connecting to guest";
                "local_port" => local_port, "port" => peer_port);
            self.send_control(key, VSOCK_OP_REQUEST, 0);
        }
    }

    fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn alloc_local_port(&mut self) -> Option<u32> {
        for _ in 0..LOCAL_PORT_BASE {
            let port = self.next_local_port.0;
            self.next_local_port += Wrapping(1);
            if self.next_local_port.0 < LOCAL_PORT_BASE {
                self.next_local_port = Wrapping(LOCAL_PORT_BASE);
            }
            if !self.conns.keys().any(|(local, _)| *local == port) {
                return Some(port);
            }
        }
        None
    }

    fn process_tx(&mut self) {
        let mut used_any = false;
        loop {
            let chain = match self.tx.pop(&self.memory) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    warn!(self.logger, "dropping vsock tx entry: {}", e);
                    break;
                }
            };
            let raw = chain.read_to_vec(&self.memory, PACKET_HEADER_SIZE + CONN_BUF_ALLOC as usize);
            if let Err(e) = self.tx.add_used(&self.memory, chain.head, 0) {
                warn!(self.logger, "cannot return vsock tx entry: {}", e);
                break;
            }
            used_any = true;
            match raw {
                Ok(raw) => match PacketHeader::from_bytes(&raw) {
                    Some(header) => {
                        let end = (PACKET_HEADER_SIZE + header.len as usize).min(raw.len());
                        let data = raw[PACKET_HEADER_SIZE..end].to_vec();
                        self.handle_guest_packet(Packet { header, data });
                    }
                    None => debug!(self.logger, "short vsock packet dropped"),
                },
                Err(e) => warn!(self.logger, "cannot read vsock tx packet: {}", e),
            }
        }
        if used_any {
            self.notify_guest();
        }
    }

    fn handle_guest_packet(&mut self, packet: Packet) {
        let header = packet.header;
        if header.src_cid != self.guest_cid
            || header.dst_cid != VSOCK_HOST_CID
            || header.type_ != VSOCK_TYPE_STREAM
        {
            debug!(self.logger, "vsock packet for unknown address"; "header" => ?header);
            self.reset_unknown(&header);
            return;
        }

        let key = (header.dst_port, header.src_port);
        let conn = match self.conns.get_mut(&key) {
            Some(conn) => conn,
            None => {
                if header.op == VSOCK_OP_REQUEST {
                    self.connect_to_host(header);
                } else {
                    self.reset_unknown(&header);
                }
                return;
            }
        };
        conn.peer_buf_alloc = header.buf_alloc;
        conn.peer_fwd_cnt = Wrapping(header.fwd_cnt);
        let connecting = matches!(conn.state, ConnState::HostConnecting(_));

        match (header.op, connecting) {
            (VSOCK_OP_RESPONSE, true) => self.host_connected(key),
            (VSOCK_OP_RW, false) => {
                if conn.to_host.len() + packet.data.len() > CONN_BUF_ALLOC as usize {
                    warn!(self.logger, "guest overran its vsock credit"; "port" => key.1);
                    self.reset(key);
                    return;
                }
                conn.to_host.extend(packet.data);
                if let Err(e) = conn.flush_to_host() {
                    debug!(self.logger, "host vsock peer failed: {}", e);
                    self.reset(key);
                    return;
                }
                if (conn.fwd_cnt - conn.last_fwd_cnt_sent).0 >= CREDIT_UPDATE_THRESHOLD {
                    self.send_control(key, VSOCK_OP_CREDIT_UPDATE, 0);
                }
            }
            (VSOCK_OP_SHUTDOWN, _) => {
                conn.peer_shutdown |= header.flags;
                let both = VSOCK_FLAGS_SHUTDOWN_RCV | VSOCK_FLAGS_SHUTDOWN_SEND;
                if conn.peer_shutdown & both == both && conn.to_host.is_empty() {
                    self.reset(key);
                } else if let Err(e) = conn.flush_to_host() {
                    debug!(self.logger, "host vsock peer failed: {}", e);
                    self.reset(key);
                }
            }
            (VSOCK_OP_CREDIT_UPDATE, _) => {}
            (VSOCK_OP_CREDIT_REQUEST, _) => self.send_control(key, VSOCK_OP_CREDIT_UPDATE, 0),
            (VSOCK_OP_RST, _) => self.remove(key),
            _ => {
                debug!(self.logger, "unexpected vsock op {}", header.op; "port" => key.1);
                self.reset(key);
            }
        }
    }

    fn host_connected(&mut self, key: ConnKey) {
        let mut conn = match self.conns.remove(&key) {
            Some(conn) => conn,
            None => return,
        };
        let accepted = match conn.state {
            ConnState::HostConnecting(pending) => pending
                .accept(key.0)
                .and_then(|stream| stream.set_nonblocking(true).map(|_| stream)),
            ConnState::Established(stream) => Ok(stream),
        };
        match accepted {
            Ok(stream) => {
                conn.state = ConnState::Established(stream);
                self.conns.insert(key, conn);
                info!(self.logger, "vsock connection established";
                    "local_port" => key.0, "port" => key.1);
            }
            Err(e) => {
                debug!(self.logger, "host client went away before accept: {}", e);
                self.tokens.remove(&conn.token);
                self.send_control(key, VSOCK_OP_RST, 0);
            }
        }
    }

    fn connect_to_host(&mut self, header: PacketHeader) {
        let key = (header.dst_port, header.src_port);
        let path = format!("{}_{}", self.endpoint.uds_path().display(), header.dst_port);
        let stream = match UnixStream::connect(&path).and_then(|s| s.set_nonblocking(true).map(|_| s)) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(self.logger, "no host listener for guest connection";
                    "path" => &path, "error" => %e);
                self.reset_unknown(&header);
                return;
            }
        };
        let token = self.next_token();
        let mut conn = Connection::new(ConnState::Established(stream), token);
        conn.peer_buf_alloc = header.buf_alloc;
        conn.peer_fwd_cnt = Wrapping(header.fwd_cnt);
        self.conns.insert(key, conn);
        self.tokens.insert(token, key);
        info!(self.logger, "guest connected to host"; "port" => header.dst_port);
        self.send_control(key, VSOCK_OP_RESPONSE, 0);
    }

    fn service_stream(&mut self, token: u64, events: EventSet) {
        let key = match self.tokens.get(&token) {
            Some(key) => *key,
            None => return,
        };
        let conn = match self.conns.get_mut(&key) {
            Some(conn) => conn,
            None => return,
        };

        if events.contains(EventSet::OUT) {
            if let Err(e) = conn.flush_to_host() {
                debug!(self.logger, "host vsock peer failed: {}", e);
                self.reset(key);
                return;
            }
            let both = VSOCK_FLAGS_SHUTDOWN_RCV | VSOCK_FLAGS_SHUTDOWN_SEND;
            if conn.to_host.is_empty() && conn.peer_shutdown & both == both {
                self.reset(key);
                return;
            }
            if (conn.fwd_cnt - conn.last_fwd_cnt_sent).0 >= CREDIT_UPDATE_THRESHOLD {
                self.send_control(key, VSOCK_OP_CREDIT_UPDATE, 0);
            }
        }

        let readable = EventSet::IN | EventSet::HANG_UP | EventSet::ERROR;
        if events.intersects(readable) {
            self.read_from_host(key);
        }
    }

    fn read_from_host(&mut self, key: ConnKey) {
        let conn = match self.conns.get_mut(&key) {
            Some(conn) => conn,
            None => return,
        };
        let credit = conn.peer_credit() as usize;
        if conn.host_eof || credit == 0 {
            return;
        }
        let stream = match &mut conn.state {
            ConnState::Established(stream) => stream,
            ConnState::HostConnecting(_) => return,
        };
        let mut buf = vec![0u8; credit.min(MAX_PACKET_PAYLOAD)];
        match stream.read(&mut buf) {
            Ok(0) => {
                conn.host_eof = true;
                self.send_control(
                    key,
                    VSOCK_OP_SHUTDOWN,
                    VSOCK_FLAGS_SHUTDOWN_RCV | VSOCK_FLAGS_SHUTDOWN_SEND,
                );
            }
            Ok(n) => {
                buf.truncate(n);
                conn.rx_cnt += Wrapping(n as u32);
                let header = self.header_for(key, VSOCK_OP_RW, 0);
                self.to_guest.push_back(Packet { header, data: buf });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(self.logger, "host vsock peer failed: {}", e);
                self.reset(key);
            }
        }
    }

    // Header from the host side of `key`, carrying our current credit.
    fn header_for(&mut self, key: ConnKey, op: u16, flags: u32) -> PacketHeader {
        let fwd_cnt = match self.conns.get_mut(&key) {
            Some(conn) => {
                conn.last_fwd_cnt_sent = conn.fwd_cnt;
                conn.fwd_cnt.0
            }
            None => 0,
        };
        PacketHeader {
            src_cid: VSOCK_HOST_CID,
            dst_cid: self.guest_cid,
            src_port: key.0,
            dst_port: key.1,
            len: 0,
            type_: VSOCK_TYPE_STREAM,
            op,
            flags,
            buf_alloc: CONN_BUF_ALLOC,
            fwd_cnt,
        }
    }

    fn send_control(&mut self, key: ConnKey, op: u16, flags: u32) {
        let header = self.header_for(key, op, flags);
        self.to_guest.push_back(Packet {
            header,
            data: Vec::new(),
        });
    }

    // Reset a connection the guest addressed but we do not know.
    fn reset_unknown(&mut self, header: &PacketHeader) {
        if header.op == VSOCK_OP_RST {
            return;
        }
        let mut reply = self.header_for((header.dst_port, header.src_port), VSOCK_OP_RST, 0);
        reply.dst_cid = header.src_cid;
        self.to_guest.push_back(Packet {
            header: reply,
            data: Vec::new(),
        });
    }

    fn reset(&mut self, key: ConnKey) {
        self.send_control(key, VSOCK_OP_RST, 0);
        self.remove(key);
    }

    fn remove(&mut self, key: ConnKey) {
        if let Some(conn) = self.conns.remove(&key) {
            self.tokens.remove(&conn.token);
            if let (Some(stream), false) = (conn.stream(), conn.interest.is_empty()) {
                let _ = self
                    .epoll
                    .ctl(ControlOperation::Delete, stream.as_raw_fd(), EpollEvent::default());
            }
            debug!(self.logger, "vsock connection closed"; "local_port" => key.0, "port" => key.1);
        }
    }

    fn update_interests(&mut self) {
        for conn in self.conns.values_mut() {
            let wanted = conn.wanted_interest();
            if wanted == conn.interest {
                continue;
            }
            let stream = match conn.stream() {
                Some(stream) => stream,
                None => continue,
            };
            let op = if conn.interest.is_empty() {
                ControlOperation::Add
            } else if wanted.is_empty() {
                ControlOperation::Delete
            } else {
                ControlOperation::Modify
            };
            match self
                .epoll
                .ctl(op, stream.as_raw_fd(), EpollEvent::new(wanted, conn.token))
            {
                Ok(()) => conn.interest = wanted,
                Err(e) => warn!(self.logger, "cannot watch vsock stream: {}", e),
            }
        }
    }

    fn flush_to_guest(&mut self) {
        let mut used_any = false;
        while let Some(packet) = self.to_guest.front_mut() {
            let chain = match self.rx.pop(&self.memory) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    warn!(self.logger, "dropping vsock rx entry: {}", e);
                    break;
                }
            };
            // payload that does not fit stays queued for the next buffer
            let room = chain.writable_len().saturating_sub(PACKET_HEADER_SIZE);
            let len = packet.data.len().min(room);
            let mut header = packet.header;
            header.len = len as u32;
            let mut raw = header.to_bytes().to_vec();
            raw.extend_from_slice(&packet.data[..len]);
            let written = match chain.write_from(&self.memory, &raw) {
                Ok(written) => written,
                Err(e) => {
                    warn!(self.logger, "cannot write vsock rx packet: {}", e);
                    0
                }
            };
            if let Err(e) = self.rx.add_used(&self.memory, chain.head, written as u32) {
                warn!(self.logger, "cannot return vsock rx entry: {}", e);
                break;
            }
            used_any = true;
            if written < PACKET_HEADER_SIZE {
                continue;
            }
            if len == packet.data.len() {
                self.to_guest.pop_front();
            } else {
                packet.data.drain(..len);
            }
        }
        if used_any {
            self.notify_guest();
        }
    }

    fn notify_guest(&self) {
        if let Err(e) = self.interrupt.signal_used_queue() {
            warn!(self.logger, "cannot raise vsock interrupt: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use vm_memory::{Bytes, GuestAddress};
    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::config::VsockConfig;
    use crate::device_manager::VsockManager;
    use crate::test_utils::test_logger;
    use crate::utils::resource::ResourceStats;
    use crate::vmm::virtio::queue::DriverQueue;
    use crate::vmm::virtio::tests::CountingIrq;

    const GUEST_CID: u32 = 42;
    const BUF_SIZE: u32 = 0x1000;

    struct TestVsock {
        memory: GuestMemoryMmap,
        rx: DriverQueue,
        tx: DriverQueue,
        irq: Arc<CountingIrq>,
        worker: VsockWorker,
        manager: VsockManager,
        uds_path: std::path::PathBuf,
        next_buf: u64,
        _dir: TempDir,
    }

    impl TestVsock {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let uds_path = dir.as_path().join("kata.hvsock");
            let config = VsockConfig {
                uds_path: uds_path.clone(),
                guest_cid: GUEST_CID,
            };
            let logger = test_logger();
            let manager = VsockManager::create(&config, &ResourceStats::new(), &logger).unwrap();
            let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap();
            let rx = DriverQueue::new(&memory, 0x1000, 16);
            let tx = DriverQueue::new(&memory, 0x2000, 16);
            let irq = Arc::new(CountingIrq::default());
            let worker = VsockWorker::new(
                memory.clone(),
                Interrupt::new(irq.clone()),
                rx.queue(),
                tx.queue(),
                manager.endpoint(),
                EventFd::new(EFD_NONBLOCK).unwrap(),
                EventFd::new(EFD_NONBLOCK).unwrap(),
                &logger,
            )
            .unwrap();
            TestVsock {
                memory,
                rx,
                tx,
                irq,
                worker,
                manager,
                uds_path,
                next_buf: 0x10000,
                _dir: dir,
            }
        }

        fn alloc_buf(&mut self) -> u64 {
            let addr = self.next_buf;
            self.next_buf += BUF_SIZE as u64;
            addr
        }

        /// Send a packet from the guest and let the device process it.
        fn guest_send(&mut self, op: u16, src_port: u32, dst_port: u32, data: &[u8]) {
            let header = PacketHeader {
                src_cid: GUEST_CID as u64,
                dst_cid: VSOCK_HOST_CID,
                src_port,
                dst_port,
                len: data.len() as u32,
                type_: VSOCK_TYPE_STREAM,
                op,
                flags: 0,
                buf_alloc: CONN_BUF_ALLOC,
                fwd_cnt: 0,
            };
            let mut raw = header.to_bytes().to_vec();
            raw.extend_from_slice(data);
            let addr = self.alloc_buf();
            self.memory.write_slice(&raw, GuestAddress(addr)).unwrap();
            self.tx.add_chain(&[(addr, raw.len() as u32, false)]);
            self.worker.process_tx();
            assert_eq!(self.tx.take_used().len(), 1);
        }

        /// Post one receive buffer and collect what the device put there.
        fn guest_recv(&mut self) -> Option<(PacketHeader, Vec<u8>)> {
            let addr = self.alloc_buf();
            self.rx.add_chain(&[(addr, BUF_SIZE, true)]);
            self.worker.flush_to_guest();
            let used = self.rx.take_used();
            if used.is_empty() {
                return None;
            }
            let mut raw = vec![0u8; used[0].1 as usize];
            self.memory.read_slice(&mut raw, GuestAddress(addr)).unwrap();
            let header = PacketHeader::from_bytes(&raw).unwrap();
            Some((header, raw[PACKET_HEADER_SIZE..].to_vec()))
        }

        fn wait_pending(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.manager.pending_count() < count && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn test_packet_header_layout() {
        let header = PacketHeader {
            src_cid: 2,
            dst_cid: 42,
            src_port: 1024,
            dst_port: 52,
            len: 5,
            type_: VSOCK_TYPE_STREAM,
            op: VSOCK_OP_RW,
            flags: 0,
            buf_alloc: CONN_BUF_ALLOC,
            fwd_cnt: 7,
        };
        let raw = header.to_bytes();
        assert_eq!(&raw[0..8], &2u64.to_le_bytes());
        assert_eq!(&raw[20..24], &52u32.to_le_bytes());
        assert_eq!(&raw[30..32], &VSOCK_OP_RW.to_le_bytes());
        assert_eq!(PacketHeader::from_bytes(&raw), Some(header));
        assert_eq!(PacketHeader::from_bytes(&raw[..40]), None);
    }

    #[test]
    fn test_vsock_config() {
        let test = TestVsock::new();
        let device = Vsock::new(test.manager.endpoint(), &test_logger());
        assert_eq!(device.device_type(), VIRTIO_ID_VSOCK);
        assert_eq!(device.queue_max_sizes().len(), 3);
        let mut cid = [0u8; 8];
        device.read_config(0, &mut cid);
        assert_eq!(u64::from_le_bytes(cid), GUEST_CID as u64);
    }

    #[test]
    fn test_host_initiated_connection() {
        let mut test = TestVsock::new();
        let mut client = UnixStream::connect(&test.uds_path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"CONNECT 1024\n").unwrap();
        test.wait_pending(1);

        test.worker.connect_pending();
        let (request, _) = test.guest_recv().unwrap();
        assert_eq!(request.op, VSOCK_OP_REQUEST);
        assert_eq!(request.src_cid, VSOCK_HOST_CID);
        assert_eq!(request.dst_cid, GUEST_CID as u64);
        assert_eq!(request.src_port, LOCAL_PORT_BASE);
        assert_eq!(request.dst_port, 1024);
        assert!(test.irq.count() > 0);

        test.guest_send(VSOCK_OP_RESPONSE, 1024, LOCAL_PORT_BASE, &[]);
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, format!("OK {}\n", LOCAL_PORT_BASE));

        // guest to host
        test.guest_send(VSOCK_OP_RW, 1024, LOCAL_PORT_BASE, b"hello");
        let mut data = [0u8; 5];
        reader.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"hello");

        // host to guest
        client.write_all(b"ping").unwrap();
        test.worker.read_from_host((LOCAL_PORT_BASE, 1024));
        let (header, payload) = test.guest_recv().unwrap();
        assert_eq!(header.op, VSOCK_OP_RW);
        assert_eq!(header.len, 4);
        assert_eq!(payload, b"ping");

        // host closes its end
        drop(reader);
        drop(client);
        test.worker.read_from_host((LOCAL_PORT_BASE, 1024));
        let (header, _) = test.guest_recv().unwrap();
        assert_eq!(header.op, VSOCK_OP_SHUTDOWN);
        assert_eq!(header.flags, VSOCK_FLAGS_SHUTDOWN_RCV | VSOCK_FLAGS_SHUTDOWN_SEND);

        test.guest_send(VSOCK_OP_RST, 1024, LOCAL_PORT_BASE, &[]);
        assert!(test.worker.conns.is_empty());
        assert!(test.worker.tokens.is_empty());
    }

    #[test]
    fn test_guest_initiated_connection() {
        let mut test = TestVsock::new();
        let listener = UnixListener::bind(format!("{}_5000", test.uds_path.display())).unwrap();

        test.guest_send(VSOCK_OP_REQUEST, 3000, 5000, &[]);
        let (header, _) = test.guest_recv().unwrap();
        assert_eq!(header.op, VSOCK_OP_RESPONSE);
        assert_eq!(header.src_port, 5000);
        assert_eq!(header.dst_port, 3000);

        let (mut host, _) = listener.accept().unwrap();
        host.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        test.guest_send(VSOCK_OP_RW, 3000, 5000, b"from guest");
        let mut data = [0u8; 10];
        host.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"from guest");

        // no listener behind the port
        test.guest_send(VSOCK_OP_REQUEST, 3001, 5001, &[]);
        let (header, _) = test.guest_recv().unwrap();
        assert_eq!(header.op, VSOCK_OP_RST);
        assert_eq!(header.dst_port, 3001);
        assert_eq!(test.worker.conns.len(), 1);
    }

    #[test]
    fn test_unknown_connection_is_reset() {
        let mut test = TestVsock::new();
        test.guest_send(VSOCK_OP_RW, 4000, 7777, b"stray");
        let (header, payload) = test.guest_recv().unwrap();
        assert_eq!(header.op, VSOCK_OP_RST);
        assert_eq!(header.src_port, 7777);
        assert_eq!(header.dst_port, 4000);
        assert!(payload.is_empty());

        // a reset is never answered
        test.guest_send(VSOCK_OP_RST, 4000, 7777, &[]);
        assert!(test.guest_recv().is_none());
    }

    #[test]
    fn test_packets_wait_for_rx_buffers() {
        let mut test = TestVsock::new();
        test.guest_send(VSOCK_OP_CREDIT_REQUEST, 4000, 7777, &[]);
        test.worker.flush_to_guest();
        assert_eq!(test.worker.to_guest.len(), 1);
        assert!(test.guest_recv().is_some());
        assert!(test.worker.to_guest.is_empty());
    }
}
