// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live resource accounting for guest launches.
//!
//! Every image buffer, host socket, guest memory object and running vCPU set
//! holds a [`ResourceTicket`]; dropping the owner drops the ticket and the
//! matching counter goes back down. A launcher that rolled back correctly
//! therefore reports zero live resources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Kinds of resources tracked by [`ResourceStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// A loaded or opened boot image.
    Image,
    /// A bound host-side socket.
    Socket,
    /// An allocated guest address space.
    GuestMemory,
    /// A started set of vCPUs.
    Vcpus,
}

#[derive(Debug, Default)]
struct Counters {
    images: AtomicUsize,
    sockets: AtomicUsize,
    memory: AtomicUsize,
    vcpus: AtomicUsize,
}

impl Counters {
    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Image => &self.images,
            ResourceKind::Socket => &self.sockets,
            ResourceKind::GuestMemory => &self.memory,
            ResourceKind::Vcpus => &self.vcpus,
        }
    }
}

/// Shared counters of live resources owned by one launcher.
#[derive(Clone, Debug, Default)]
pub struct ResourceStats {
    counters: Arc<Counters>,
}

impl ResourceStats {
    /// Create an empty set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly acquired resource; it is released when the ticket drops.
    pub fn acquire(&self, kind: ResourceKind) -> ResourceTicket {
        self.counters.counter(kind).fetch_add(1, Ordering::SeqCst);
        ResourceTicket {
            stats: self.clone(),
            kind,
        }
    }

    /// Number of live resources of `kind`.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counters.counter(kind).load(Ordering::SeqCst)
    }

    /// Whether no resource of any kind is alive.
    pub fn is_idle(&self) -> bool {
        [
            ResourceKind::Image,
            ResourceKind::Socket,
            ResourceKind::GuestMemory,
            ResourceKind::Vcpus,
        ]
        .iter()
        .all(|kind| self.live(*kind) == 0)
    }
}

/// Proof of ownership of one live resource.
#[derive(Debug)]
pub struct ResourceTicket {
    stats: ResourceStats,
    kind: ResourceKind,
}

impl ResourceTicket {
    /// Kind of the tracked resource.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl Drop for ResourceTicket {
    fn drop(&mut self) {
        self.stats
            .counters
            .counter(self.kind)
            .fetch_sub(1, Ordering::SeqCst);
    }
}
