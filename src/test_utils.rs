// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures of the unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sha::Sha256;
use openssl::sign::Signer;
use slog::Drain;
use uuid::Uuid;
use vmm_sys_util::tempdir::TempDir;

use crate::address_space::GuestMemory;
use crate::attestation::{AttestationRequest, AttestationResponse, ProxyClient};
use crate::boot_image::BootImages;
use crate::device_manager::MmioSlot;
use crate::config::{
    AttestationSpec, LaunchConfig, SevConfig, SevPolicy, TeeType, DEFAULT_KEYSET,
    DEFAULT_SECRET_GUID, DEFAULT_SECRET_TYPE,
};
use crate::isolation::ovmf::{OVMF_TABLE_FOOTER_GUID, SEV_HASH_TABLE_RV_GUID, SEV_SECRET_BLOCK_GUID};
use crate::isolation::sev::certs::CaCertificate;
use crate::isolation::sev::session::{
    aes_128_ctr, ecdh, hmac_sha256, measurement_mac, secret_mac, wrapping_keys,
};
use crate::isolation::sev::{
    Build, Issuer, Measurement, PlatformChain, Secret, SevCertificate, Start, Usage,
};
use crate::utils::error::{LaunchError, Result};
use crate::utils::resource::ResourceStats;
use crate::utils::CancelFlag;
use crate::vmm::{RunningVm, SevLauncher, VmLaunchParams, VmmBackend};

/// Physical address the ELF kernel stub is linked at.
pub const ELF_STUB_LOAD_ADDR: u64 = 0x100_0000;
/// Size of the synthetic firmware images.
pub const TEST_FIRMWARE_SIZE: usize = 0x2000;

pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn write_temp_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.as_path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// A 64-bit ELF executable with one loadable segment holding `hlt`.
pub fn elf_kernel_stub() -> Vec<u8> {
    const EHDR_LEN: usize = 64;
    const PHDR_LEN: usize = 56;
    let code_offset = (EHDR_LEN + PHDR_LEN) as u64;

    let mut elf = vec![0u8; EHDR_LEN + PHDR_LEN];
    elf[..4].copy_from_slice(b"\x7fELF");
    elf[4] = 2; // ELFCLASS64
    elf[5] = 1; // ELFDATA2LSB
    elf[6] = 1; // EV_CURRENT
    elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[24..32].copy_from_slice(&ELF_STUB_LOAD_ADDR.to_le_bytes());
    elf[32..40].copy_from_slice(&(EHDR_LEN as u64).to_le_bytes());
    elf[52..54].copy_from_slice(&(EHDR_LEN as u16).to_le_bytes());
    elf[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes());
    elf[56..58].copy_from_slice(&1u16.to_le_bytes());

    let phdr = &mut elf[EHDR_LEN..];
    phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    phdr[4..8].copy_from_slice(&5u32.to_le_bytes()); // R+X
    phdr[8..16].copy_from_slice(&code_offset.to_le_bytes());
    phdr[16..24].copy_from_slice(&ELF_STUB_LOAD_ADDR.to_le_bytes());
    phdr[24..32].copy_from_slice(&ELF_STUB_LOAD_ADDR.to_le_bytes());
    phdr[32..40].copy_from_slice(&1u64.to_le_bytes());
    phdr[40..48].copy_from_slice(&1u64.to_le_bytes());
    phdr[48..56].copy_from_slice(&0x1000u64.to_le_bytes());

    elf.push(0xf4);
    elf
}

/// One entry of a synthetic OVMF GUID table.
pub enum OvmfEntry {
    Raw([u8; 16], Vec<u8>),
    Gpa([u8; 16], u32, u32),
}

/// A firmware image whose GUID table holds `entries`, the last one next to
/// the footer.
pub fn ovmf_firmware(entries: &[OvmfEntry]) -> Vec<u8> {
    let mut table = Vec::new();
    for entry in entries {
        let (guid, data) = match entry {
            OvmfEntry::Raw(guid, data) => (*guid, data.clone()),
            OvmfEntry::Gpa(guid, addr, size) => {
                let mut data = addr.to_le_bytes().to_vec();
                data.extend_from_slice(&size.to_le_bytes());
                (*guid, data)
            }
        };
        table.extend_from_slice(&data);
        table.extend_from_slice(&((data.len() + 18) as u16).to_le_bytes());
        table.extend_from_slice(&guid);
    }
    let table_len = table.len() + 18;
    table.extend_from_slice(&(table_len as u16).to_le_bytes());
    table.extend_from_slice(&OVMF_TABLE_FOOTER_GUID);

    let mut firmware = vec![0u8; TEST_FIRMWARE_SIZE];
    let end = firmware.len() - 32;
    firmware[end - table.len()..end].copy_from_slice(&table);
    firmware
}

/// Hashes table and secret block entries of a SEV capable OVMF.
pub fn sev_firmware_entries() -> Vec<OvmfEntry> {
    vec![
        OvmfEntry::Raw([0x5a; 16], vec![0u8; 4]),
        OvmfEntry::Gpa(SEV_HASH_TABLE_RV_GUID, 0x80_0c00, 0x400),
        OvmfEntry::Gpa(SEV_SECRET_BLOCK_GUID, 0x80_b000, 0x1000),
    ]
}

/// An SEV platform chain with the private keys of its owner and its PDH.
pub struct TestPlatform {
    pub chain: PlatformChain,
    pub oca_key: PKey<Private>,
    pub pdh_key: PKey<Private>,
}

impl TestPlatform {
    /// Certificates presented by a proxy holding the owner key, signer first.
    pub fn response_chain(&self) -> Vec<String> {
        vec![base64::encode(self.chain.oca.as_bytes())]
    }

    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.oca_key).unwrap();
        signer.update(payload).unwrap();
        signer.sign_to_vec().unwrap()
    }
}

/// A fresh platform; every call creates unrelated keys.
pub fn test_platform() -> TestPlatform {
    let ark_rsa = Rsa::generate(2048).unwrap();
    let ark = CaCertificate::build(Usage::ARK, [0xa1; 16], &ark_rsa, None).unwrap();
    let ark_key = PKey::from_rsa(ark_rsa).unwrap();
    let ask_rsa = Rsa::generate(2048).unwrap();
    let ask =
        CaCertificate::build(Usage::ASK, [0xa2; 16], &ask_rsa, Some(([0xa1; 16], &ark_key)))
            .unwrap();
    let ask_key = PKey::from_rsa(ask_rsa).unwrap();

    let (mut cek, cek_key) = SevCertificate::generate(Usage::CEK).unwrap();
    cek.sign(Usage::ASK, &ask_key).unwrap();
    let (mut oca, oca_key) = SevCertificate::generate(Usage::OCA).unwrap();
    oca.sign(Usage::OCA, &oca_key).unwrap();
    let (mut pek, pek_key) = SevCertificate::generate(Usage::PEK).unwrap();
    pek.sign(Usage::OCA, &oca_key).unwrap();
    pek.sign(Usage::CEK, &cek_key).unwrap();
    let (mut pdh, pdh_key) = SevCertificate::generate(Usage::PDH).unwrap();
    pdh.sign(Usage::PEK, &pek_key).unwrap();

    TestPlatform {
        chain: PlatformChain {
            pdh,
            pek,
            oca,
            cek,
            ask,
            ark,
        },
        oca_key,
        pdh_key,
    }
}

/// Kernel, firmware, initrd and certificate files in a temporary directory.
pub struct ImageSet {
    dir: TempDir,
    kernel: PathBuf,
    firmware: Option<PathBuf>,
    initrd: Option<PathBuf>,
}

impl ImageSet {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let kernel = write_temp_file(&dir, "vmlinux", &elf_kernel_stub());
        ImageSet {
            dir,
            kernel,
            firmware: None,
            initrd: None,
        }
    }

    pub fn with_firmware(self, entries: &[OvmfEntry]) -> Self {
        self.with_firmware_bytes(ovmf_firmware(entries))
    }

    pub fn with_firmware_bytes(mut self, data: Vec<u8>) -> Self {
        self.firmware = Some(write_temp_file(&self.dir, "OVMF.fd", &data));
        self
    }

    pub fn with_initrd(mut self, data: &[u8]) -> Self {
        self.initrd = Some(write_temp_file(&self.dir, "initrd.img", data));
        self
    }

    pub fn with_platform(self, platform: &TestPlatform) -> Self {
        write_temp_file(&self.dir, "cert_chain.cert", &platform.chain.to_bytes());
        self
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    /// A plain guest booting the images of this set.
    pub fn launch_config(&self) -> LaunchConfig {
        let mut config = LaunchConfig::new("test-guest", self.kernel.clone());
        config.boot.firmware_path = self.firmware.clone();
        config.boot.initrd_path = self.initrd.clone();
        config.boot.boot_args = "console=ttyS0".to_string();
        config
    }

    pub fn sev_config(&self, policy: SevPolicy, pre_attestation: Option<AttestationSpec>) -> SevConfig {
        SevConfig {
            policy,
            cert_chain_path: self.dir().join("cert_chain.cert"),
            pre_attestation,
        }
    }

    pub fn attestation_spec(&self) -> AttestationSpec {
        AttestationSpec {
            proxy_url: "http://127.0.0.1:44444/attest".to_string(),
            secret_guid: Uuid::parse_str(DEFAULT_SECRET_GUID).unwrap(),
            secret_type: DEFAULT_SECRET_TYPE.to_string(),
            keyset: DEFAULT_KEYSET.to_string(),
        }
    }
}

pub fn resolve_images(set: &ImageSet) -> BootImages {
    BootImages::resolve(&set.launch_config().boot, &ResourceStats::new(), &test_logger()).unwrap()
}

pub fn allocate_memory(config: &LaunchConfig, images: &BootImages) -> GuestMemory {
    GuestMemory::allocate(
        &config.machine,
        images.firmware.as_ref().map(|f| f.len()),
        &ResourceStats::new(),
        &test_logger(),
    )
    .unwrap()
}

/// Virtio devices handed to a started guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachedDevices {
    /// Rootfs path and whether it is read-only.
    pub rootfs: Option<(PathBuf, bool)>,
    pub vsock_cid: Option<u32>,
    pub slots: Vec<MmioSlot>,
}

/// Backend that records launches instead of running vCPUs.
#[derive(Clone, Default)]
pub struct MockBackend {
    plain_only: bool,
    fail_start: bool,
    starts: Arc<Mutex<Vec<(TeeType, u8)>>>,
    attached: Arc<Mutex<Vec<AttachedDevices>>>,
    running: Arc<AtomicUsize>,
    sev_pdh_key: Option<PKey<Private>>,
    skew_measurement: bool,
    sev_commands: Arc<Mutex<Vec<&'static str>>>,
    sev_secrets: Arc<Mutex<Vec<Secret>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain_only() -> Self {
        MockBackend {
            plain_only: true,
            ..Default::default()
        }
    }

    /// A backend whose vCPU creation always fails.
    pub fn failing() -> Self {
        MockBackend {
            fail_start: true,
            ..Default::default()
        }
    }

    /// A backend whose SEV firmware owns the PDH of `platform`.
    pub fn with_sev_platform(platform: &TestPlatform) -> Self {
        MockBackend {
            sev_pdh_key: Some(platform.pdh_key.clone()),
            ..Default::default()
        }
    }

    /// Have the firmware measure something other than the loaded memory.
    pub fn skew_measurement(mut self) -> Self {
        self.skew_measurement = true;
        self
    }

    /// SEV firmware commands issued so far.
    pub fn sev_commands(&self) -> Vec<&'static str> {
        self.sev_commands.lock().unwrap().clone()
    }

    /// LAUNCH_SECRET packets the firmware accepted.
    pub fn sev_secrets(&self) -> Vec<Secret> {
        self.sev_secrets.lock().unwrap().clone()
    }

    /// Isolation mode and vCPU count of every started guest.
    pub fn starts(&self) -> Vec<(TeeType, u8)> {
        self.starts.lock().unwrap().clone()
    }

    /// Devices of every started guest.
    pub fn attached(&self) -> Vec<AttachedDevices> {
        self.attached.lock().unwrap().clone()
    }

    /// Number of guests whose vCPUs have not been stopped.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl VmmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, tee: TeeType) -> bool {
        !self.plain_only || tee == TeeType::None
    }

    fn start_vcpus(&self, params: VmLaunchParams) -> Result<Box<dyn RunningVm>> {
        if self.fail_start {
            return Err(LaunchError::ResourceExhausted(format!(
                "cannot create {} vcpus",
                params.vcpu_count
            )));
        }
        self.starts
            .lock()
            .unwrap()
            .push((params.tee, params.vcpu_count));
        self.attached.lock().unwrap().push(AttachedDevices {
            rootfs: params
                .rootfs
                .as_ref()
                .map(|disk| (disk.path.clone(), disk.read_only)),
            vsock_cid: params.vsock.as_ref().map(|vsock| vsock.guest_cid()),
            slots: params.mmio_slots.clone(),
        });
        self.running.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockVm {
            vcpu_count: params.vcpu_count,
            running: self.running.clone(),
            stopped: AtomicBool::new(false),
        }))
    }

    fn sev_launcher(&self) -> Result<Box<dyn SevLauncher>> {
        let pdh_key = self.sev_pdh_key.clone().ok_or_else(|| {
            LaunchError::IsolationConfigInvalid("mock backend has no SEV platform".to_string())
        })?;
        Ok(Box::new(MockPsp {
            pdh_key,
            skew_measurement: self.skew_measurement,
            commands: self.sev_commands.clone(),
            secrets: self.sev_secrets.clone(),
            launch: None,
        }))
    }
}

const MOCK_SEV_BUILD: Build = Build {
    api_major: 0,
    api_minor: 24,
    build: 15,
};

/// SEV firmware that unwraps the launch session with the platform PDH key.
struct MockPsp {
    pdh_key: PKey<Private>,
    skew_measurement: bool,
    commands: Arc<Mutex<Vec<&'static str>>>,
    secrets: Arc<Mutex<Vec<Secret>>>,
    launch: Option<MockLaunch>,
}

struct MockLaunch {
    policy: SevPolicy,
    tek: Vec<u8>,
    tik: Vec<u8>,
    digest: Sha256,
    measure: Option<[u8; 32]>,
    finished: bool,
}

fn psp_error(command: &str, reason: &str) -> LaunchError {
    LaunchError::Backend(format!("{}: {}", command, reason))
}

impl MockPsp {
    fn launch(&mut self, command: &'static str) -> Result<&mut MockLaunch> {
        self.commands.lock().unwrap().push(command);
        match self.launch.as_mut() {
            Some(launch) if !launch.finished => Ok(launch),
            _ => Err(psp_error(command, "no launch in progress")),
        }
    }
}

impl SevLauncher for MockPsp {
    fn build(&self) -> Result<Build> {
        Ok(MOCK_SEV_BUILD)
    }

    fn start(&mut self, start: &Start) -> Result<()> {
        self.commands.lock().unwrap().push("start");
        let godh = start.cert.public_key().unwrap();
        let z = ecdh(&self.pdh_key, &godh).unwrap();
        let (kek, kik) = wrapping_keys(&z, &start.session.nonce).unwrap();
        if hmac_sha256(&kik, &[&start.session.wrap_tk]).unwrap() != start.session.wrap_mac {
            return Err(psp_error("start", "bad wrap MAC"));
        }
        let keys = aes_128_ctr(&kek, &start.session.wrap_iv, &start.session.wrap_tk).unwrap();
        let (tek, tik) = keys.split_at(16);
        if hmac_sha256(tik, &[&start.policy.0.to_le_bytes()]).unwrap() != start.session.policy_mac
        {
            return Err(psp_error("start", "bad policy MAC"));
        }
        self.launch = Some(MockLaunch {
            policy: start.policy,
            tek: tek.to_vec(),
            tik: tik.to_vec(),
            digest: Sha256::new(),
            measure: None,
            finished: false,
        });
        Ok(())
    }

    fn update_data(&mut self, memory: &GuestMemory, gpa: u64, len: usize) -> Result<()> {
        let data = memory.read_bytes(gpa, len)?;
        self.launch("update_data")?.digest.update(&data);
        Ok(())
    }

    fn measure(&mut self) -> Result<Measurement> {
        let skew = self.skew_measurement;
        let launch = self.launch("measure")?;
        let mut digest = launch.digest.clone().finish();
        if skew {
            digest[0] ^= 1;
        }
        let mut mnonce = [0u8; 16];
        openssl::rand::rand_bytes(&mut mnonce).unwrap();
        let measure =
            measurement_mac(&launch.tik, MOCK_SEV_BUILD, launch.policy, &digest, &mnonce).unwrap();
        launch.measure = Some(measure);
        Ok(Measurement { measure, mnonce })
    }

    fn inject_secret(&mut self, memory: &GuestMemory, gpa: u64, secret: &Secret) -> Result<()> {
        let secrets = self.secrets.clone();
        let launch = self.launch("secret")?;
        let measure = launch
            .measure
            .ok_or_else(|| psp_error("secret", "launch is not measured"))?;
        let header = &secret.header;
        let mac = secret_mac(&launch.tik, header.flags, &header.iv, &secret.ciphertext, &measure)
            .unwrap();
        if mac != header.mac {
            return Err(psp_error("secret", "bad packet MAC"));
        }
        let plain = aes_128_ctr(&launch.tek, &header.iv, &secret.ciphertext).unwrap();
        memory.write_bytes(gpa, &plain)?;
        secrets.lock().unwrap().push(secret.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.launch("finish")?.finished = true;
        Ok(())
    }
}

struct MockVm {
    vcpu_count: u8,
    running: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl RunningVm for MockVm {
    fn vcpu_count(&self) -> u8 {
        self.vcpu_count
    }

    fn wait(&mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Attestation proxy answering from memory.
pub struct MockProxy {
    answer: Option<(PKey<Private>, Vec<String>, Vec<u8>)>,
    tamper_signature: bool,
    replay_nonce: bool,
    cancel: Option<CancelFlag>,
    requests: Mutex<Vec<AttestationRequest>>,
}

impl MockProxy {
    /// A proxy releasing `secret`, signed with the owner key of `platform`.
    pub fn signing(platform: &TestPlatform, secret: &[u8]) -> Self {
        MockProxy {
            answer: Some((
                platform.oca_key.clone(),
                platform.response_chain(),
                secret.to_vec(),
            )),
            tamper_signature: false,
            replay_nonce: false,
            cancel: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A proxy that cannot be reached.
    pub fn unreachable() -> Self {
        MockProxy {
            answer: None,
            tamper_signature: false,
            replay_nonce: false,
            cancel: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sign something other than the response payload.
    pub fn tamper_signature(mut self) -> Self {
        self.tamper_signature = true;
        self
    }

    /// Echo a stale nonce instead of the requested one.
    pub fn replay_nonce(mut self) -> Self {
        self.replay_nonce = true;
        self
    }

    /// Cancel the launch while the exchange is in flight.
    pub fn cancel_on_exchange(mut self, cancel: &CancelFlag) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }

    pub fn requests(&self) -> Vec<AttestationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProxyClient for MockProxy {
    fn exchange(
        &self,
        url: &str,
        request: &AttestationRequest,
        _timeout: Duration,
    ) -> Result<AttestationResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(cancel) = self.cancel.as_ref() {
            cancel.cancel();
        }
        let (key, chain, secret) = match self.answer.as_ref() {
            Some(answer) => answer,
            None => {
                return Err(LaunchError::AttestationNetworkError {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                })
            }
        };

        let nonce = if self.replay_nonce {
            vec![0u8; 16]
        } else {
            base64::decode(&request.nonce).unwrap()
        };
        let guid = Uuid::parse_str(&request.secret_guid).unwrap();
        let mut payload = nonce.clone();
        payload.extend(base64::decode(&request.launch_measurement).unwrap());
        payload.extend_from_slice(guid.as_bytes());
        payload.extend_from_slice(secret);
        if self.tamper_signature {
            payload.push(0);
        }

        let mut signer = Signer::new(MessageDigest::sha256(), key).unwrap();
        signer.update(&payload).unwrap();
        Ok(AttestationResponse {
            nonce: base64::encode(&nonce),
            secret: base64::encode(secret),
            cert_chain: chain.clone(),
            signature: base64::encode(signer.sign_to_vec().unwrap()),
        })
    }
}
