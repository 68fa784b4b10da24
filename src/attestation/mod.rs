// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! SEV pre-attestation.
//!
//! Before any vCPU runs, the launch measurement of a SEV guest is sent to a
//! remote attestation proxy together with a fresh nonce. The proxy answers
//! with a secret, a certificate chain and a signature over
//!
//! ```text
//! nonce || launch measurement || secret GUID || secret
//! ```
//!
//! The chain holds SEV format certificates, signer first, and must lead to
//! the platform certificate chain the guest was configured with. Once the response is validated the secret is written into the SEV
//! secret block as an EFI secret table and wiped from host memory.

use std::fmt;
use std::time::Duration;

use slog::{error, info};
use uuid::Uuid;

use crate::address_space::GuestMemory;
use crate::config::AttestationSpec;
use crate::isolation::sev::PlatformChain;
use crate::isolation::IsolationContext;
use crate::utils::error::{LaunchError, LaunchStage, Result};
use crate::utils::{hex_string, CancelFlag};

/// Attestation proxy transport.
pub mod proxy;
/// Secret buffers and the EFI secret table encoding.
pub mod secret;
/// Certificate chain and signature validation.
pub mod verifier;

pub use self::proxy::{AttestationRequest, AttestationResponse, HttpProxyClient, ProxyClient};
pub use self::secret::{efi_secret_table, SecretBuffer};
pub use self::verifier::{verify_signature, ChainVerifier, SevChainVerifier};

const NONCE_LEN: usize = 16;

/// Why an attestation session failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    ChainInvalid,
    Protocol,
    Isolation,
    Cancelled,
}

impl From<&LaunchError> for FailureKind {
    fn from(e: &LaunchError) -> Self {
        match e {
            LaunchError::AttestationNetworkError { .. } => FailureKind::Network,
            LaunchError::AttestationChainInvalid { .. } => FailureKind::ChainInvalid,
            LaunchError::AttestationProtocolError(_) => FailureKind::Protocol,
            LaunchError::Cancelled(_) => FailureKind::Cancelled,
            _ => FailureKind::Isolation,
        }
    }
}

/// Progress of one pre-attestation exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttestationState {
    Idle,
    MeasurementComputed,
    ProxyRequested,
    ResponseValidated,
    SecretInjected,
    Done,
    Failed(FailureKind),
}

impl AttestationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttestationState::Done | AttestationState::Failed(_))
    }

    fn can_advance_to(&self, next: AttestationState) -> bool {
        use AttestationState::*;
        match (*self, next) {
            (Idle, MeasurementComputed)
            | (MeasurementComputed, ProxyRequested)
            | (ProxyRequested, ResponseValidated)
            | (ResponseValidated, SecretInjected)
            | (SecretInjected, Done) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AttestationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttestationState::Idle => f.write_str("idle"),
            AttestationState::MeasurementComputed => f.write_str("measurement-computed"),
            AttestationState::ProxyRequested => f.write_str("proxy-requested"),
            AttestationState::ResponseValidated => f.write_str("response-validated"),
            AttestationState::SecretInjected => f.write_str("secret-injected"),
            AttestationState::Done => f.write_str("done"),
            AttestationState::Failed(kind) => write!(f, "failed({:?})", kind),
        }
    }
}

/// Outcome of a session, kept on the guest handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationReport {
    pub state: AttestationState,
    /// Every state the session went through, `Idle` first.
    pub history: Vec<AttestationState>,
    /// Hex launch measurement that was sent, if the session got that far.
    pub measurement: Option<String>,
    pub secret_guid: Uuid,
    pub secret_type: String,
    pub proxy_url: String,
}

/// One pre-attestation exchange of a SEV guest.
pub struct AttestationSession {
    spec: AttestationSpec,
    state: AttestationState,
    history: Vec<AttestationState>,
    measurement: Option<Vec<u8>>,
    secret: Option<SecretBuffer>,
    logger: slog::Logger,
}

impl AttestationSession {
    pub fn new(spec: AttestationSpec, logger: &slog::Logger) -> Self {
        let logger = logger.new(slog::o!(
            "subsystem" => "attestation",
            "proxy" => spec.proxy_url.clone(),
        ));
        AttestationSession {
            spec,
            state: AttestationState::Idle,
            history: vec![AttestationState::Idle],
            measurement: None,
            secret: None,
            logger,
        }
    }

    pub fn state(&self) -> AttestationState {
        self.state
    }

    pub fn history(&self) -> &[AttestationState] {
        &self.history
    }

    /// Whether no secret bytes remain in host memory.
    pub fn secret_wiped(&self) -> bool {
        self.secret.as_ref().map_or(true, |s| s.is_zeroized())
    }

    pub fn report(&self) -> AttestationReport {
        AttestationReport {
            state: self.state,
            history: self.history.clone(),
            measurement: self.measurement.as_deref().map(hex_string),
            secret_guid: self.spec.secret_guid,
            secret_type: self.spec.secret_type.clone(),
            proxy_url: self.spec.proxy_url.clone(),
        }
    }

    /// Measure the guest, exchange the measurement for a secret and inject
    /// it. The secret is wiped whether the exchange succeeds or not.
    pub fn run(
        &mut self,
        ctx: &mut IsolationContext,
        memory: &GuestMemory,
        proxy: &dyn ProxyClient,
        verifier: &dyn ChainVerifier,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<()> {
        if self.state != AttestationState::Idle {
            return Err(LaunchError::AttestationProtocolError(format!(
                "attestation session already ran, state {}",
                self.state
            )));
        }

        let result = self.exchange(ctx, memory, proxy, verifier, timeout, cancel);
        if let Some(secret) = self.secret.as_mut() {
            secret.zeroize();
        }
        match result {
            Ok(()) => {
                self.advance(AttestationState::Done)?;
                info!(self.logger, "pre-attestation done";
                    "secret_guid" => self.spec.secret_guid.to_string());
                Ok(())
            }
            Err(e) => {
                self.state = AttestationState::Failed(FailureKind::from(&e));
                self.history.push(self.state);
                error!(self.logger, "pre-attestation failed"; "state" => %self.state, "error" => %e);
                Err(e)
            }
        }
    }

    fn exchange(
        &mut self,
        ctx: &mut IsolationContext,
        memory: &GuestMemory,
        proxy: &dyn ProxyClient,
        verifier: &dyn ChainVerifier,
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let policy = ctx
            .sev()
            .map(|sev| sev.policy())
            .ok_or_else(|| {
                LaunchError::IsolationConfigInvalid(format!(
                    "pre-attestation needs a sev guest, got {}",
                    ctx.tee_type()
                ))
            })?;

        let measurement = ctx
            .measure(memory)?
            .map(|m| m.digest().to_vec())
            .ok_or_else(|| {
                LaunchError::AttestationProtocolError("guest has no launch measurement".to_string())
            })?;
        self.measurement = Some(measurement.clone());
        self.advance(AttestationState::MeasurementComputed)?;
        info!(self.logger, "launch measurement computed"; "measurement" => hex_string(&measurement));

        check_cancel(cancel)?;
        let mut nonce = [0u8; NONCE_LEN];
        openssl::rand::rand_bytes(&mut nonce).map_err(|e| {
            LaunchError::AttestationProtocolError(format!("cannot generate nonce: {}", e))
        })?;
        let request = AttestationRequest {
            launch_measurement: base64::encode(&measurement),
            nonce: base64::encode(nonce),
            secret_guid: self.spec.secret_guid.to_string(),
            secret_type: self.spec.secret_type.clone(),
            keyset: self.spec.keyset.clone(),
            policy: policy.0,
        };
        self.advance(AttestationState::ProxyRequested)?;
        let response = proxy.exchange(&self.spec.proxy_url, &request, timeout)?;

        let platform = ctx.sev().map(|sev| sev.cert_chain()).ok_or_else(|| {
            LaunchError::IsolationConfigInvalid("guest lost its SEV context".to_string())
        })?;
        self.validate(&response, &nonce, &measurement, platform, verifier)?;
        drop(response);
        self.advance(AttestationState::ResponseValidated)?;

        check_cancel(cancel)?;
        let secret = self.secret.as_ref().ok_or_else(|| {
            LaunchError::AttestationProtocolError("validated response carries no secret".to_string())
        })?;
        let table = efi_secret_table(&self.spec.secret_guid, secret.as_bytes());
        ctx.inject_secret(memory, &table)?;
        self.advance(AttestationState::SecretInjected)?;
        info!(self.logger, "secret injected"; "bytes" => secret_len(&self.secret));

        Ok(())
    }

    fn validate(
        &mut self,
        response: &AttestationResponse,
        nonce: &[u8],
        measurement: &[u8],
        platform: &PlatformChain,
        verifier: &dyn ChainVerifier,
    ) -> Result<()> {
        let echoed = decode_field("nonce", &response.nonce)?;
        if echoed != nonce {
            return Err(LaunchError::AttestationProtocolError(
                "proxy echoed a different nonce".to_string(),
            ));
        }
        let signature = decode_field("signature", &response.signature)?;
        let secret = SecretBuffer::new(decode_field("secret", &response.secret)?);
        // from here on the secret is wiped however validation ends
        self.secret = Some(secret);

        let mut chain = Vec::with_capacity(response.cert_chain.len());
        for cert in response.cert_chain.iter() {
            chain.push(decode_field("certificate", cert)?);
        }

        let chain_invalid = |reason: String| LaunchError::AttestationChainInvalid {
            measurement: hex_string(measurement),
            reason,
        };
        let key = verifier.verify_chain(platform, &chain).map_err(chain_invalid)?;

        let secret = self.secret.as_ref().map(|s| s.as_bytes()).unwrap_or(&[]);
        let mut payload = zeroize::Zeroizing::new(Vec::with_capacity(
            nonce.len() + measurement.len() + 16 + secret.len(),
        ));
        payload.extend_from_slice(nonce);
        payload.extend_from_slice(measurement);
        payload.extend_from_slice(self.spec.secret_guid.as_bytes());
        payload.extend_from_slice(secret);
        verify_signature(&key, &payload, &signature).map_err(chain_invalid)
    }

    fn advance(&mut self, next: AttestationState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(LaunchError::AttestationProtocolError(format!(
                "illegal attestation transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl fmt::Debug for AttestationSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AttestationSession")
            .field("proxy_url", &self.spec.proxy_url)
            .field("state", &self.state)
            .field("secret", &self.secret)
            .finish()
    }
}

fn check_cancel(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(LaunchError::Cancelled(LaunchStage::Attest));
    }
    Ok(())
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    base64::decode(value).map_err(|e| {
        LaunchError::AttestationProtocolError(format!("undecodable {} in proxy response: {}", name, e))
    })
}

fn secret_len(secret: &Option<SecretBuffer>) -> usize {
    secret.as_ref().map_or(0, |s| s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationConfig, LaunchConfig, SevPolicy};
    use crate::test_utils::{
        allocate_memory, resolve_images, sev_firmware_entries, test_logger, test_platform,
        ImageSet, MockBackend, MockProxy, TestPlatform,
    };
    use crate::utils::guid_le_bytes;

    struct Fixture {
        platform: TestPlatform,
        set: ImageSet,
        config: LaunchConfig,
    }

    fn fixture() -> Fixture {
        let platform = test_platform();
        let set = ImageSet::new()
            .with_firmware(&sev_firmware_entries())
            .with_platform(&platform);
        let mut config = set.launch_config();
        config.isolation = IsolationConfig::Sev(
            set.sev_config(SevPolicy(SevPolicy::NODBG), Some(set.attestation_spec())),
        );
        Fixture {
            platform,
            set,
            config,
        }
    }

    fn run_session(
        fixture: &Fixture,
        proxy: &MockProxy,
        cancel: &CancelFlag,
    ) -> (AttestationSession, Result<()>, IsolationContext, GuestMemory) {
        let images = resolve_images(&fixture.set);
        let memory = allocate_memory(&fixture.config, &images);
        let mut ctx = IsolationContext::select(
            &fixture.config,
            &images,
            &MockBackend::with_sev_platform(&fixture.platform),
            &test_logger(),
        )
        .unwrap();
        let spec = fixture.config.isolation.attestation().unwrap().clone();
        let mut session = AttestationSession::new(spec, &test_logger());
        let result = session.run(
            &mut ctx,
            &memory,
            proxy,
            &SevChainVerifier::new(),
            Duration::from_secs(1),
            cancel,
        );
        (session, result, ctx, memory)
    }

    #[test]
    fn test_session_injects_secret() {
        let fixture = fixture();
        let proxy = MockProxy::signing(&fixture.platform, b"disk-passphrase");
        let (session, result, ctx, memory) = run_session(&fixture, &proxy, &CancelFlag::new());
        result.unwrap();

        assert_eq!(session.state(), AttestationState::Done);
        assert_eq!(
            session.history(),
            &[
                AttestationState::Idle,
                AttestationState::MeasurementComputed,
                AttestationState::ProxyRequested,
                AttestationState::ResponseValidated,
                AttestationState::SecretInjected,
                AttestationState::Done,
            ]
        );
        assert!(session.secret_wiped());

        // the request carried the measurement of the guest
        let requests = proxy.requests();
        assert_eq!(requests.len(), 1);
        let measurement = ctx.measurement().unwrap();
        assert_eq!(
            base64::decode(&requests[0].launch_measurement).unwrap(),
            measurement.digest()
        );
        // LAUNCH_MEASURE output: measure and mnonce
        assert_eq!(measurement.digest().len(), 48);
        assert_eq!(requests[0].policy, SevPolicy::NODBG);
        assert_eq!(base64::decode(&requests[0].nonce).unwrap().len(), NONCE_LEN);

        // the secret block holds an EFI secret table with the secret
        let block = ctx.sev().unwrap().secret_block();
        let table = memory.read_bytes(block.addr as u64, 55).unwrap();
        let guid = fixture.config.isolation.attestation().unwrap().secret_guid;
        assert_eq!(&table[20..36], &guid_le_bytes(&guid));
        assert_eq!(&table[40..], b"disk-passphrase");

        let report = session.report();
        assert_eq!(report.measurement, Some(measurement.to_string()));
        assert_eq!(report.secret_type, "bundle");
    }

    #[test]
    fn test_session_rejects_foreign_chain() {
        let fixture = fixture();
        let stranger = test_platform();
        let proxy = MockProxy::signing(&stranger, b"secret");
        let (session, result, _ctx, _memory) = run_session(&fixture, &proxy, &CancelFlag::new());

        match result {
            Err(LaunchError::AttestationChainInvalid { measurement, .. }) => {
                assert_eq!(measurement, session.report().measurement.unwrap());
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            session.state(),
            AttestationState::Failed(FailureKind::ChainInvalid)
        );
        assert!(session.secret_wiped());
    }

    #[test]
    fn test_session_rejects_bad_signature() {
        let fixture = fixture();
        let proxy = MockProxy::signing(&fixture.platform, b"secret").tamper_signature();
        let (session, result, _ctx, _memory) = run_session(&fixture, &proxy, &CancelFlag::new());
        assert!(matches!(result, Err(LaunchError::AttestationChainInvalid { .. })));
        assert!(session.secret_wiped());
    }

    #[test]
    fn test_session_rejects_replayed_nonce() {
        let fixture = fixture();
        let proxy = MockProxy::signing(&fixture.platform, b"secret").replay_nonce();
        let (session, result, _ctx, _memory) = run_session(&fixture, &proxy, &CancelFlag::new());
        assert!(matches!(result, Err(LaunchError::AttestationProtocolError(_))));
        assert_eq!(session.state(), AttestationState::Failed(FailureKind::Protocol));
    }

    #[test]
    fn test_session_network_failure() {
        let fixture = fixture();
        let proxy = MockProxy::unreachable();
        let (session, result, ctx, _memory) = run_session(&fixture, &proxy, &CancelFlag::new());
        assert!(matches!(result, Err(LaunchError::AttestationNetworkError { .. })));
        assert_eq!(session.state(), AttestationState::Failed(FailureKind::Network));
        assert_eq!(
            session.history().last(),
            Some(&AttestationState::Failed(FailureKind::Network))
        );
        // measured but never finalized
        assert!(ctx.measurement().is_some());
    }

    #[test]
    fn test_session_cancelled_after_response() {
        let fixture = fixture();
        let cancel = CancelFlag::new();
        let proxy = MockProxy::signing(&fixture.platform, b"secret").cancel_on_exchange(&cancel);
        let (session, result, _ctx, _memory) = run_session(&fixture, &proxy, &cancel);
        assert!(matches!(result, Err(LaunchError::Cancelled(LaunchStage::Attest))));
        assert_eq!(session.state(), AttestationState::Failed(FailureKind::Cancelled));
        // the response was validated, then the secret wiped instead of injected
        assert!(session.secret.is_some());
        assert!(session.secret_wiped());
    }

    #[test]
    fn test_session_runs_once() {
        let fixture = fixture();
        let proxy = MockProxy::signing(&fixture.platform, b"secret");
        let (mut session, result, mut ctx, memory) =
            run_session(&fixture, &proxy, &CancelFlag::new());
        result.unwrap();
        assert!(matches!(
            session.run(
                &mut ctx,
                &memory,
                &proxy,
                &SevChainVerifier::new(),
                Duration::from_secs(1),
                &CancelFlag::new()
            ),
            Err(LaunchError::AttestationProtocolError(_))
        ));
        assert_eq!(session.state(), AttestationState::Done);
    }

    #[test]
    fn test_state_transitions() {
        use AttestationState::*;
        assert!(Idle.can_advance_to(MeasurementComputed));
        assert!(!Idle.can_advance_to(ProxyRequested));
        assert!(!MeasurementComputed.can_advance_to(SecretInjected));
        assert!(ProxyRequested.can_advance_to(Failed(FailureKind::Network)));
        assert!(!Done.can_advance_to(Failed(FailureKind::Protocol)));
        assert!(!Failed(FailureKind::Network).can_advance_to(Done));
        assert!(Done.is_terminal());
    }
}
