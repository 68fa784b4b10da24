// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Certificate chain and signature checks of proxy responses.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;

use crate::isolation::sev::{Issuer, PlatformChain, SevCertificate};
use crate::utils::error_chain;

/// Validates the certificate chain returned by the attestation proxy.
pub trait ChainVerifier: Send + Sync {
    /// Check that `presented` (SEV format certificates, signer first) leads
    /// to a certificate of `platform` and return the public key of the
    /// signer.
    fn verify_chain(
        &self,
        platform: &PlatformChain,
        presented: &[Vec<u8>],
    ) -> std::result::Result<PKey<Public>, String>;
}

/// [`ChainVerifier`] for chains of SEV format certificates.
///
/// Each presented certificate must be signed by the next one and the last
/// must be part of the platform chain, whose own signatures are checked up
/// to the ARK. A proxy holding the platform owner key presents the OCA alone.
#[derive(Debug, Default)]
pub struct SevChainVerifier;

impl SevChainVerifier {
    pub fn new() -> Self {
        SevChainVerifier
    }
}

impl ChainVerifier for SevChainVerifier {
    fn verify_chain(
        &self,
        platform: &PlatformChain,
        presented: &[Vec<u8>],
    ) -> std::result::Result<PKey<Public>, String> {
        platform
            .verify()
            .map_err(|e| format!("platform chain: {}", error_chain(&e)))?;

        let mut certs = Vec::with_capacity(presented.len());
        for raw in presented {
            certs.push(SevCertificate::from_bytes(raw).map_err(|e| e.to_string())?);
        }
        let (signer, anchor) = match (certs.first(), certs.last()) {
            (Some(signer), Some(anchor)) => (signer, anchor),
            _ => return Err("empty certificate chain".to_string()),
        };
        for pair in certs.windows(2) {
            pair[0]
                .verify_signed_by(&pair[1])
                .map_err(|e| error_chain(&e))?;
        }
        if !platform.contains(anchor) {
            return Err(format!(
                "{} certificate is not part of the platform chain",
                anchor.usage()
            ));
        }

        signer.public_key().map_err(|e| error_chain(&e))
    }
}

/// Check a SHA-256 signature made by `key` over `payload`.
pub fn verify_signature(
    key: &PKey<Public>,
    payload: &[u8],
    signature: &[u8],
) -> std::result::Result<(), String> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key).map_err(|e| e.to_string())?;
    verifier.update(payload).map_err(|e| e.to_string())?;
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err("signature does not match the response payload".to_string()),
        Err(e) => Err(format!("malformed signature: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::sev::Usage;
    use crate::test_utils::test_platform;

    #[test]
    fn test_verify_chain() {
        let platform = test_platform();
        let verifier = SevChainVerifier::new();
        let oca = platform.chain.oca.as_bytes().to_vec();

        let key = verifier.verify_chain(&platform.chain, &[oca.clone()]).unwrap();
        assert!(key.public_eq(&platform.oca_key));

        // a signer certified by the owner key
        let (mut signer, signer_key) = SevCertificate::generate(Usage::PEK).unwrap();
        signer.sign(Usage::OCA, &platform.oca_key).unwrap();
        let key = verifier
            .verify_chain(&platform.chain, &[signer.as_bytes().to_vec(), oca])
            .unwrap();
        assert!(key.public_eq(&signer_key));

        assert!(verifier.verify_chain(&platform.chain, &[]).is_err());
        assert!(verifier
            .verify_chain(&platform.chain, &[b"-----BEGIN CERTIFICATE-----".to_vec()])
            .is_err());
    }

    #[test]
    fn test_verify_chain_rejects_foreign_issuer() {
        let platform = test_platform();
        let other = test_platform();
        let verifier = SevChainVerifier::new();

        let err = verifier
            .verify_chain(&platform.chain, &[other.chain.oca.as_bytes().to_vec()])
            .unwrap_err();
        assert!(err.contains("not part of the platform chain"));

        // a signer of another owner next to our OCA
        let (mut signer, _) = SevCertificate::generate(Usage::PEK).unwrap();
        signer.sign(Usage::OCA, &other.oca_key).unwrap();
        let err = verifier
            .verify_chain(
                &platform.chain,
                &[
                    signer.as_bytes().to_vec(),
                    platform.chain.oca.as_bytes().to_vec(),
                ],
            )
            .unwrap_err();
        assert!(err.contains("not signed by the OCA"));

        // the platform chain itself is broken
        let mut broken = platform.chain.clone();
        broken.cek = other.chain.cek.clone();
        let err = verifier
            .verify_chain(&broken, &[platform.chain.oca.as_bytes().to_vec()])
            .unwrap_err();
        assert!(err.starts_with("platform chain"));
    }

    #[test]
    fn test_verify_signature() {
        let platform = test_platform();
        let key = platform.chain.oca.public_key().unwrap();
        let signature = platform.sign(b"payload");

        assert!(verify_signature(&key, b"payload", &signature).is_ok());
        assert!(verify_signature(&key, b"tampered", &signature).is_err());
        assert!(verify_signature(&key, b"payload", b"garbage").is_err());
    }
}
