// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest owner side of an SEV launch.
//!
//! The owner picks a transport encryption key (TEK) and a transport
//! integrity key (TIK), wraps them for the platform's PDH in the
//! LAUNCH_START session blob, checks the LAUNCH_MEASURE result with the TIK
//! and packages LAUNCH_SECRET payloads that only the firmware can decrypt.

use std::convert::TryFrom;

use openssl::derive::Deriver;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::rand::rand_bytes;
use openssl::sign::Signer;
use openssl::symm::{encrypt, Cipher};
use zeroize::Zeroizing;

use super::certs::{CertError, PlatformChain, SevCertificate, Usage};
use crate::config::SevPolicy;

/// Size of the LAUNCH_START session blob.
pub const LAUNCH_SESSION_LEN: usize = 128;
/// Size of a LAUNCH_MEASURE result.
pub const MEASUREMENT_LEN: usize = 48;

const KEY_LEN: usize = 16;

/// Errors of the owner side of a launch.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("platform certificate chain rejected")]
    Chain(#[from] CertError),

    #[error("launch measurement does not match the expected launch digest")]
    MeasurementMismatch,

    #[error("cryptographic operation failed")]
    Crypto(#[from] ErrorStack),
}

/// Firmware version of the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Build {
    pub api_major: u8,
    pub api_minor: u8,
    pub build: u8,
}

/// Session blob of LAUNCH_START.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSession {
    pub nonce: [u8; 16],
    /// TEK and TIK, encrypted with the key encryption key.
    pub wrap_tk: [u8; 32],
    pub wrap_iv: [u8; 16],
    pub wrap_mac: [u8; 32],
    pub policy_mac: [u8; 32],
}

impl LaunchSession {
    pub fn to_bytes(&self) -> [u8; LAUNCH_SESSION_LEN] {
        let mut raw = [0u8; LAUNCH_SESSION_LEN];
        raw[0..16].copy_from_slice(&self.nonce);
        raw[16..48].copy_from_slice(&self.wrap_tk);
        raw[48..64].copy_from_slice(&self.wrap_iv);
        raw[64..96].copy_from_slice(&self.wrap_mac);
        raw[96..128].copy_from_slice(&self.policy_mac);
        raw
    }
}

/// Everything LAUNCH_START takes from the guest owner.
#[derive(Clone, Debug)]
pub struct Start {
    pub policy: SevPolicy,
    /// Guest owner Diffie-Hellman certificate.
    pub cert: SevCertificate,
    pub session: LaunchSession,
}

/// Result of LAUNCH_MEASURE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pub measure: [u8; 32],
    pub mnonce: [u8; 16],
}

impl Measurement {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(MEASUREMENT_LEN);
        raw.extend_from_slice(&self.measure);
        raw.extend_from_slice(&self.mnonce);
        raw
    }
}

/// Header of a LAUNCH_SECRET packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecretHeader {
    pub flags: u32,
    pub iv: [u8; 16],
    pub mac: [u8; 32],
}

/// A LAUNCH_SECRET packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub header: SecretHeader,
    pub ciphertext: Vec<u8>,
}

/// Session state before the launch measurement is checked.
pub struct Initialized;

/// Session state once the launch measurement matched.
pub struct Verified {
    measurement: Measurement,
}

/// Transport keys of one launch.
pub struct Session<T> {
    policy: SevPolicy,
    tek: Zeroizing<[u8; KEY_LEN]>,
    tik: Zeroizing<[u8; KEY_LEN]>,
    state: T,
}

impl TryFrom<SevPolicy> for Session<Initialized> {
    type Error = SessionError;

    fn try_from(policy: SevPolicy) -> Result<Self, SessionError> {
        let mut tek = Zeroizing::new([0u8; KEY_LEN]);
        let mut tik = Zeroizing::new([0u8; KEY_LEN]);
        rand_bytes(&mut tek[..])?;
        rand_bytes(&mut tik[..])?;
        Ok(Session {
            policy,
            tek,
            tik,
            state: Initialized,
        })
    }
}

impl<T> Session<T> {
    pub fn policy(&self) -> SevPolicy {
        self.policy
    }
}

impl Session<Initialized> {
    /// Check the platform chain and wrap the transport keys for its PDH.
    pub fn start(&self, chain: &PlatformChain) -> Result<Start, SessionError> {
        let pdh = chain.verify()?;
        let (cert, godh) = SevCertificate::generate(Usage::OCA)?;
        let z = ecdh(&godh, &pdh)?;

        let mut nonce = [0u8; 16];
        rand_bytes(&mut nonce)?;
        let (kek, kik) = wrapping_keys(&z, &nonce)?;

        let mut wrap_iv = [0u8; 16];
        rand_bytes(&mut wrap_iv)?;
        let mut keys = Zeroizing::new([0u8; 2 * KEY_LEN]);
        keys[..KEY_LEN].copy_from_slice(&self.tek[..]);
        keys[KEY_LEN..].copy_from_slice(&self.tik[..]);
        let mut wrap_tk = [0u8; 32];
        wrap_tk.copy_from_slice(&aes_128_ctr(&kek, &wrap_iv, &keys[..])?);

        Ok(Start {
            policy: self.policy,
            cert,
            session: LaunchSession {
                nonce,
                wrap_tk,
                wrap_iv,
                wrap_mac: hmac_sha256(&kik, &[&wrap_tk])?,
                policy_mac: hmac_sha256(&self.tik[..], &[&self.policy.0.to_le_bytes()])?,
            },
        })
    }

    /// Check that the firmware measured `digest` under this session.
    pub fn verify(
        self,
        digest: &[u8],
        build: Build,
        measurement: Measurement,
    ) -> Result<Session<Verified>, SessionError> {
        let expected =
            measurement_mac(&self.tik[..], build, self.policy, digest, &measurement.mnonce)?;
        if !memcmp::eq(&expected, &measurement.measure) {
            return Err(SessionError::MeasurementMismatch);
        }
        Ok(Session {
            policy: self.policy,
            tek: self.tek,
            tik: self.tik,
            state: Verified { measurement },
        })
    }
}

impl Session<Verified> {
    pub fn measurement(&self) -> &Measurement {
        &self.state.measurement
    }

    /// Encrypt `data` into a LAUNCH_SECRET packet bound to the measurement.
    pub fn secret(&self, flags: u32, data: &[u8]) -> Result<Secret, SessionError> {
        let mut iv = [0u8; 16];
        rand_bytes(&mut iv)?;
        let ciphertext = aes_128_ctr(&self.tek[..], &iv, data)?;
        let mac = secret_mac(
            &self.tik[..],
            flags,
            &iv,
            &ciphertext,
            &self.state.measurement.measure,
        )?;
        Ok(Secret {
            header: SecretHeader { flags, iv, mac },
            ciphertext,
        })
    }
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], ErrorStack> {
    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    for part in parts {
        signer.update(part)?;
    }
    let mut mac = [0u8; 32];
    mac.copy_from_slice(&signer.sign_to_vec()?);
    Ok(mac)
}

pub(crate) fn aes_128_ctr(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    encrypt(Cipher::aes_128_ctr(), key, Some(iv), data)
}

/// Shared secret of an ECDH exchange, little endian.
pub(crate) fn ecdh(
    private: &PKeyRef<Private>,
    peer: &PKeyRef<Public>,
) -> Result<Zeroizing<Vec<u8>>, ErrorStack> {
    let mut deriver = Deriver::new(private)?;
    deriver.set_peer(peer)?;
    let mut z = Zeroizing::new(deriver.derive_to_vec()?);
    z.reverse();
    Ok(z)
}

/// NIST SP 800-108 counter mode KDF over HMAC-SHA256.
fn kdf(key: &[u8], size: usize, context: &[u8], label: &str) -> Result<Zeroizing<Vec<u8>>, ErrorStack> {
    let bits = ((size * 8) as u32).to_le_bytes();
    let mut out = Zeroizing::new(vec![0u8; size]);
    for (i, chunk) in out.chunks_mut(32).enumerate() {
        let counter = (i as u32 + 1).to_le_bytes();
        let mac = hmac_sha256(key, &[&counter, label.as_bytes(), &[0], context, &bits])?;
        chunk.copy_from_slice(&mac[..chunk.len()]);
    }
    Ok(out)
}

/// Key encryption key and key integrity key of a launch.
pub(crate) fn wrapping_keys(
    z: &[u8],
    nonce: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>), ErrorStack> {
    let master = kdf(z, KEY_LEN, nonce, "sev-master-secret")?;
    Ok((
        kdf(&master, KEY_LEN, &[], "sev-kek")?,
        kdf(&master, KEY_LEN, &[], "sev-kik")?,
    ))
}

pub(crate) fn measurement_mac(
    tik: &[u8],
    build: Build,
    policy: SevPolicy,
    digest: &[u8],
    mnonce: &[u8],
) -> Result<[u8; 32], ErrorStack> {
    hmac_sha256(
        tik,
        &[
            &[0x04],
            &[build.api_major, build.api_minor, build.build],
            &policy.0.to_le_bytes(),
            digest,
            mnonce,
        ],
    )
}

pub(crate) fn secret_mac(
    tik: &[u8],
    flags: u32,
    iv: &[u8],
    ciphertext: &[u8],
    measure: &[u8],
) -> Result<[u8; 32], ErrorStack> {
    let len = (ciphertext.len() as u32).to_le_bytes();
    hmac_sha256(
        tik,
        &[&[0x01], &flags.to_le_bytes(), iv, &len, &len, ciphertext, measure],
    )
}
