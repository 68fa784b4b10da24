// Copyright (C) 2020-2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! KVM reference backend.
//!
//! Runs plain guests only: confidential launches need the vendor launch
//! ioctls and are reported as unsupported instead of being run unencrypted.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use kvm_bindings::{
    kvm_fpu, kvm_pit_config, kvm_regs, kvm_segment, kvm_userspace_memory_region,
    KVM_MAX_CPUID_ENTRIES, KVM_PIT_SPEAKER_DUMMY,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use slog::{debug, error, info, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};
use vmm_sys_util::signal::{register_signal_handler, Killable, SIGRTMIN};

use super::serial::{SerialPort, SERIAL_PORT_BASE};
use super::virtio::{Block, Interrupt, IrqLine, MmioBus, MmioTransport, VirtioDevice, Vsock};
use super::{RunningVm, VmLaunchParams, VmmBackend};
use crate::address_space::{BootEntry, ZERO_PAGE_START};
use crate::config::TeeType;
use crate::device_manager::VirtioDeviceKind;
use crate::isolation::protection::{available_guest_protection, GuestProtectionType, ProtectionPaths};
use crate::utils::error::{LaunchError, Result};
use crate::utils::error_chain;

const BOOT_STACK_POINTER: u64 = 0x8ff0;
const BOOT_GDT_OFFSET: u64 = 0x500;
const BOOT_IDT_OFFSET: u64 = 0x520;
const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;
// Three pages in the MMIO hole, below the largest firmware window.
const KVM_TSS_ADDRESS: usize = 0xfeff_c000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

const CPUID_FEATURES: u32 = 1;
const VCPU_KICK_INTERVAL: Duration = Duration::from_millis(10);

/// Errors associated with the KVM backend.
#[derive(Debug, thiserror::Error)]
pub enum KvmError {
    #[error("failed to open /dev/kvm")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("failed to create VM")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region {0}")]
    SetUserMemoryRegion(u32, #[source] kvm_ioctls::Error),

    #[error("failed to set TSS address")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("failed to create in-kernel IRQ chip")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to create PIT")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU {0}")]
    CreateVcpu(u8, #[source] kvm_ioctls::Error),

    #[error("failed to configure CPUID")]
    Cpuid(#[source] kvm_ioctls::Error),

    #[error("failed to set vCPU registers")]
    Registers(#[source] kvm_ioctls::Error),

    #[error("failed to write boot structures to guest memory")]
    GuestMemoryWrite(#[source] vm_memory::GuestMemoryError),

    #[error("failed to run vCPU {0}")]
    VcpuRun(u8, #[source] kvm_ioctls::Error),

    #[error("failed to register vCPU kick signal")]
    Signal(#[source] vmm_sys_util::errno::Error),

    #[error("failed to spawn vCPU thread")]
    Thread(#[source] std::io::Error),

    #[error("no backing for the virtio {0} device")]
    MissingDevice(VirtioDeviceKind),
}

impl From<KvmError> for LaunchError {
    fn from(e: KvmError) -> Self {
        match e {
            KvmError::CreateVm(_)
            | KvmError::SetUserMemoryRegion(..)
            | KvmError::CreateVcpu(..)
            | KvmError::Thread(_) => LaunchError::ResourceExhausted(error_chain(&e)),
            e => LaunchError::Backend(error_chain(&e)),
        }
    }
}

fn kvm_result<T>(r: std::result::Result<T, KvmError>) -> Result<T> {
    r.map_err(LaunchError::from)
}

/// The KVM reference backend.
pub struct KvmBackend {
    host_protection: GuestProtectionType,
    logger: slog::Logger,
}

impl KvmBackend {
    pub fn new(logger: &slog::Logger) -> Self {
        let logger = logger.new(slog::o!("subsystem" => "kvm"));
        let host_protection = available_guest_protection(&ProtectionPaths::default())
            .unwrap_or_else(|e| {
                warn!(logger, "cannot detect guest protection: {}", e);
                GuestProtectionType::None
            });
        info!(logger, "kvm backend ready"; "host_protection" => ?host_protection);
        KvmBackend {
            host_protection,
            logger,
        }
    }

    /// Confidential computing technology enabled on this host.
    pub fn host_protection(&self) -> GuestProtectionType {
        self.host_protection
    }
}

impl VmmBackend for KvmBackend {
    fn name(&self) -> &str {
        "kvm"
    }

    fn supports(&self, tee: TeeType) -> bool {
        if tee != TeeType::None && self.host_protection.supports(tee) {
            debug!(self.logger, "host supports {} but this backend runs plain guests only", tee);
        }
        tee == TeeType::None
    }

    fn start_vcpus(&self, params: VmLaunchParams) -> Result<Box<dyn RunningVm>> {
        if !self.supports(params.tee) {
            return Err(LaunchError::IsolationConfigInvalid(format!(
                "kvm backend cannot run {} guests",
                params.tee
            )));
        }
        kvm_result(KvmVm::start(params)).map(|vm| Box::new(vm) as Box<dyn RunningVm>)
    }
}

extern "C" fn handle_kick_signal(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

fn vcpu_kick_signal() -> libc::c_int {
    SIGRTMIN()
}

/// Interrupt line of the in-kernel irqchip.
struct KvmIrqLine {
    vm: Arc<VmFd>,
    irq: u32,
}

impl IrqLine for KvmIrqLine {
    fn pulse(&self) -> io::Result<()> {
        let to_io = |e: kvm_ioctls::Error| io::Error::from_raw_os_error(e.errno());
        self.vm.set_irq_line(self.irq, true).map_err(to_io)?;
        self.vm.set_irq_line(self.irq, false).map_err(to_io)
    }
}

// Put a virtio-mmio transport in every slot, taking the device backings out
// of `params`.
fn build_mmio_bus(
    vm: &Arc<VmFd>,
    params: &mut VmLaunchParams,
    logger: &slog::Logger,
) -> std::result::Result<MmioBus, KvmError> {
    let mut devices = Vec::with_capacity(params.mmio_slots.len());
    for slot in params.mmio_slots.iter() {
        let device: Box<dyn VirtioDevice> = match slot.kind {
            VirtioDeviceKind::Block => match params.rootfs.take() {
                Some(backing) => Box::new(Block::new(backing, logger)),
                None => return Err(KvmError::MissingDevice(slot.kind)),
            },
            VirtioDeviceKind::Vsock => match params.vsock.take() {
                Some(endpoint) => Box::new(Vsock::new(endpoint, logger)),
                None => return Err(KvmError::MissingDevice(slot.kind)),
            },
        };
        let line = Arc::new(KvmIrqLine {
            vm: vm.clone(),
            irq: slot.irq,
        });
        let transport =
            MmioTransport::new(device, params.memory.clone(), Interrupt::new(line), logger);
        debug!(logger, "virtio device attached";
            "kind" => %slot.kind, "base" => format!("{:#x}", slot.base), "irq" => slot.irq);
        devices.push((*slot, transport));
    }
    Ok(MmioBus::new(devices))
}

struct KvmVm {
    vcpu_count: u8,
    handles: Vec<JoinHandle<std::result::Result<(), KvmError>>>,
    shutdown: Arc<AtomicBool>,
    logger: slog::Logger,
    // dropped after the vCPUs are joined
    _mmio: Arc<MmioBus>,
    _vm: Arc<VmFd>,
    _memory: GuestMemoryMmap,
}

impl KvmVm {
    fn start(mut params: VmLaunchParams) -> std::result::Result<Self, KvmError> {
        let logger = params.logger.new(slog::o!("subsystem" => "kvm", "id" => params.id.clone()));
        let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
        let vm = Arc::new(kvm.create_vm().map_err(KvmError::CreateVm)?);

        for (slot, (gpa, len, host)) in params.regions.iter().enumerate() {
            let region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: *gpa,
                memory_size: *len,
                userspace_addr: *host,
                flags: 0,
            };
            // Safety: the region is mapped by `params.memory`, and the VM keeps
            // a handle to it until the vCPUs have exited.
            unsafe { vm.set_user_memory_region(region) }
                .map_err(|e| KvmError::SetUserMemoryRegion(slot as u32, e))?;
        }

        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(KvmError::SetTssAddress)?;
        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;
        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(KvmError::CreatePit)?;

        if let BootEntry::Direct(_) = params.boot.entry {
            setup_boot_structures(&params.memory)?;
        }

        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(KvmError::Cpuid)?;
        let mut vcpus = Vec::with_capacity(params.vcpu_count as usize);
        for index in 0..params.vcpu_count {
            let vcpu = vm
                .create_vcpu(index as u64)
                .map_err(|e| KvmError::CreateVcpu(index, e))?;
            let mut vcpu_cpuid = cpuid.clone();
            for entry in vcpu_cpuid.as_mut_slice() {
                if entry.function == CPUID_FEATURES {
                    // initial APIC id
                    entry.ebx = (entry.ebx & 0x00ff_ffff) | ((index as u32) << 24);
                }
            }
            vcpu.set_cpuid2(&vcpu_cpuid).map_err(KvmError::Cpuid)?;
            if index == 0 {
                if let BootEntry::Direct(entry) = params.boot.entry {
                    setup_long_mode(&vcpu, entry)?;
                }
            }
            vcpus.push(vcpu);
        }

        register_signal_handler(vcpu_kick_signal(), handle_kick_signal).map_err(KvmError::Signal)?;

        let mmio = Arc::new(build_mmio_bus(&vm, &mut params, &logger)?);
        let serial = Arc::new(Mutex::new(SerialPort::new(params.serial)));
        let mut running = KvmVm {
            vcpu_count: params.vcpu_count,
            handles: Vec::with_capacity(vcpus.len()),
            shutdown: Arc::new(AtomicBool::new(false)),
            logger: logger.clone(),
            _mmio: mmio.clone(),
            _vm: vm,
            _memory: params.memory,
        };
        for (index, vcpu) in vcpus.into_iter().enumerate() {
            let worker = VcpuWorker {
                index: index as u8,
                vcpu,
                serial: serial.clone(),
                mmio: mmio.clone(),
                shutdown: running.shutdown.clone(),
                logger: logger.clone(),
            };
            // vCPUs already running are stopped when `running` drops
            let handle = thread::Builder::new()
                .name(format!("db_vcpu{}", index))
                .spawn(move || worker.run())
                .map_err(KvmError::Thread)?;
            running.handles.push(handle);
        }

        info!(logger, "vcpus started"; "count" => params.vcpu_count,
            "entry" => ?params.boot.entry, "virtio_devices" => params.mmio_slots.len());
        Ok(running)
    }

    fn join_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (index, handle) in self.handles.drain(..).enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(self.logger, "vcpu {} failed: {}", index, error_chain(&e));
                    if result.is_ok() {
                        result = Err(LaunchError::from(e));
                    }
                }
                Err(_) => {
                    error!(self.logger, "vcpu {} panicked", index);
                    if result.is_ok() {
                        result = Err(LaunchError::Backend(format!("vcpu {} panicked", index)));
                    }
                }
            }
        }
        result
    }
}

impl RunningVm for KvmVm {
    fn vcpu_count(&self) -> u8 {
        self.vcpu_count
    }

    fn wait(&mut self) -> Result<()> {
        let result = self.join_all();
        info!(self.logger, "all vcpus exited");
        result
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);
        // A kick that lands before KVM_RUN is entered is lost, so keep kicking
        // until every vCPU thread is gone.
        while self.handles.iter().any(|h| !h.is_finished()) {
            for handle in self.handles.iter().filter(|h| !h.is_finished()) {
                let _ = handle.kill(vcpu_kick_signal());
            }
            thread::sleep(VCPU_KICK_INTERVAL);
        }
        info!(self.logger, "vcpus stopped");
        self.join_all()
    }
}

impl Drop for KvmVm {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(self.logger, "vcpu shutdown reported an error: {}", e);
        }
    }
}

struct VcpuWorker {
    index: u8,
    vcpu: VcpuFd,
    serial: Arc<Mutex<SerialPort>>,
    mmio: Arc<MmioBus>,
    shutdown: Arc<AtomicBool>,
    logger: slog::Logger,
}

fn lock_serial(serial: &Mutex<SerialPort>) -> std::sync::MutexGuard<SerialPort> {
    serial.lock().unwrap_or_else(|e| e.into_inner())
}

impl VcpuWorker {
    fn run(mut self) -> std::result::Result<(), KvmError> {
        debug!(self.logger, "vcpu thread running"; "vcpu" => self.index);
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.vcpu.run() {
                Ok(VcpuExit::IoIn(port, data)) => {
                    if SerialPort::handles(port) {
                        let value = lock_serial(&self.serial).read(port - SERIAL_PORT_BASE);
                        data.iter_mut().for_each(|b| *b = value);
                    } else {
                        data.iter_mut().for_each(|b| *b = 0xff);
                    }
                }
                Ok(VcpuExit::IoOut(port, data)) => {
                    if SerialPort::handles(port) {
                        if let Some(value) = data.first() {
                            lock_serial(&self.serial).write(port - SERIAL_PORT_BASE, *value);
                        }
                    }
                }
                Ok(VcpuExit::MmioRead(addr, data)) => {
                    if !self.mmio.read(addr, data) {
                        data.iter_mut().for_each(|b| *b = 0);
                    }
                }
                Ok(VcpuExit::MmioWrite(addr, data)) => {
                    self.mmio.write(addr, data);
                }
                Ok(VcpuExit::Hlt) => {
                    info!(self.logger, "vcpu halted"; "vcpu" => self.index);
                    break;
                }
                Ok(VcpuExit::Shutdown) => {
                    info!(self.logger, "guest shutdown"; "vcpu" => self.index);
                    // stop the other vCPUs too
                    self.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(reason) => {
                    warn!(self.logger, "unhandled vcpu exit {:?}", reason; "vcpu" => self.index);
                    self.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => continue,
                Err(e) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Err(KvmError::VcpuRun(self.index, e));
                }
            }
        }
        Ok(())
    }
}

fn setup_boot_structures(memory: &GuestMemoryMmap) -> std::result::Result<(), KvmError> {
    let gdt_table: [u64; 4] = [
        0,
        gdt_entry(0xa09b, 0, 0xfffff), // CODE
        gdt_entry(0xc093, 0, 0xfffff), // DATA
        gdt_entry(0x808b, 0, 0xfffff), // TSS
    ];
    for (i, entry) in gdt_table.iter().enumerate() {
        memory
            .write_obj(*entry, GuestAddress(BOOT_GDT_OFFSET + (i as u64 * 8)))
            .map_err(KvmError::GuestMemoryWrite)?;
    }
    memory
        .write_obj(0u64, GuestAddress(BOOT_IDT_OFFSET))
        .map_err(KvmError::GuestMemoryWrite)?;

    // identity map the first 1GiB with 2MiB pages
    memory
        .write_obj(PDPTE_START | 0x03, GuestAddress(PML4_START))
        .map_err(KvmError::GuestMemoryWrite)?;
    memory
        .write_obj(PDE_START | 0x03, GuestAddress(PDPTE_START))
        .map_err(KvmError::GuestMemoryWrite)?;
    for i in 0..512u64 {
        memory
            .write_obj((i << 21) | 0x83, GuestAddress(PDE_START + i * 8))
            .map_err(KvmError::GuestMemoryWrite)?;
    }
    Ok(())
}

fn setup_long_mode(vcpu: &VcpuFd, entry: GuestAddress) -> std::result::Result<(), KvmError> {
    let mut sregs = vcpu.get_sregs().map_err(KvmError::Registers)?;
    sregs.cs = kvm_segment_from_gdt(gdt_entry(0xa09b, 0, 0xfffff), 1);
    let data_seg = kvm_segment_from_gdt(gdt_entry(0xc093, 0, 0xfffff), 2);
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;
    sregs.tr = kvm_segment_from_gdt(gdt_entry(0x808b, 0, 0xfffff), 3);
    sregs.gdt.base = BOOT_GDT_OFFSET;
    sregs.gdt.limit = 4 * 8 - 1;
    sregs.idt.base = BOOT_IDT_OFFSET;
    sregs.idt.limit = 8 - 1;
    sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
    sregs.cr3 = PML4_START;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.efer |= EFER_LME | EFER_LMA;
    vcpu.set_sregs(&sregs).map_err(KvmError::Registers)?;

    let regs = kvm_regs {
        rip: entry.0,
        rsp: BOOT_STACK_POINTER,
        rbp: BOOT_STACK_POINTER,
        rsi: ZERO_PAGE_START,
        // bit 1 is reserved and must be set
        rflags: 0x2,
        ..Default::default()
    };
    vcpu.set_regs(&regs).map_err(KvmError::Registers)?;

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu).map_err(KvmError::Registers)
}

fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let present = ((entry >> 47) & 0x1) as u8;
    let granularity = ((entry >> 55) & 0x1) as u8;
    let limit = (((entry >> 32) & 0x000f_0000) | (entry & 0xffff)) as u32;
    kvm_segment {
        base: ((entry >> 32) & 0xff00_0000) | ((entry >> 16) & 0x00ff_ffff),
        limit: if granularity == 0 {
            limit
        } else {
            (limit << 12) | 0xfff
        },
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: granularity,
        avl: ((entry >> 52) & 0x1) as u8,
        padding: 0,
        unusable: if present == 0 { 1 } else { 0 },
    }
}
