// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! AMD SEV platform certificates.
//!
//! `sevctl export --full` writes the platform chain as PDH, PEK, OCA and CEK
//! in the SEV certificate format, followed by ASK and ARK in the AMD CA
//! format:
//!
//! ```text
//! OCA (self-signed) ----------+
//!                             +--> PEK --> PDH
//! ARK --> ASK --> CEK --------+
//! ```
//!
//! Every field is little endian, big numbers included.

use std::fmt;
use std::fs;
use std::path::Path;

use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use openssl::ec::{EcGroup, EcKey, EcKeyRef};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Verifier};

use crate::utils::error::{LaunchError, Result};
use crate::utils::error_chain;

/// Size of a certificate in the SEV format.
pub const SEV_CERT_LEN: usize = 0x824;
const SEV_CERT_BODY_LEN: usize = 0x414;
const SEV_PUBKEY_OFFSET: usize = 0x10;
const SEV_SIG_OFFSETS: [usize; 2] = [0x414, 0x61c];
const SEV_SIG_LEN: usize = 0x208;
const ECC_COORD_LEN: usize = 0x48;

const CA_HEADER_LEN: usize = 0x40;
const CA_MAX_NUM_LEN: usize = 4096 / 8;

const CURVE_P256: u32 = 1;
const CURVE_P384: u32 = 2;

pub const ALGO_RSA_SHA256: u32 = 0x0001;
pub const ALGO_ECDSA_SHA256: u32 = 0x0002;
pub const ALGO_ECDH_SHA256: u32 = 0x0003;
pub const ALGO_RSA_SHA384: u32 = 0x0101;
pub const ALGO_ECDSA_SHA384: u32 = 0x0102;
pub const ALGO_ECDH_SHA384: u32 = 0x0103;

/// Role of a key in the platform chain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Usage(pub u32);

impl Usage {
    pub const ARK: Usage = Usage(0x0000);
    pub const ASK: Usage = Usage(0x0013);
    pub const INVALID: Usage = Usage(0x1000);
    pub const OCA: Usage = Usage(0x1001);
    pub const PEK: Usage = Usage(0x1002);
    pub const PDH: Usage = Usage(0x1003);
    pub const CEK: Usage = Usage(0x1004);
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Usage::ARK => f.write_str("ARK"),
            Usage::ASK => f.write_str("ASK"),
            Usage::OCA => f.write_str("OCA"),
            Usage::PEK => f.write_str("PEK"),
            Usage::PDH => f.write_str("PDH"),
            Usage::CEK => f.write_str("CEK"),
            Usage(other) => write!(f, "usage 0x{:x}", other),
        }
    }
}

impl fmt::Debug for Usage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Errors of certificate decoding and verification.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// The input ends before the certificate does.
    #[error("{what} needs {expected} bytes, found {found}")]
    Truncated {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("malformed certificate: {0}")]
    Malformed(String),

    /// No signature slot of `subject` verifies under the key of `issuer`.
    #[error("{subject} certificate is not signed by the {issuer}")]
    BadSignature { subject: Usage, issuer: Usage },

    #[error("cryptographic operation failed")]
    Crypto(#[from] ErrorStack),
}

fn u32_at(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn bn_from_le(le: &[u8]) -> std::result::Result<BigNum, ErrorStack> {
    let be: Vec<u8> = le.iter().rev().copied().collect();
    BigNum::from_slice(&be)
}

pub(crate) fn bn_to_le(bn: &BigNumRef, len: usize) -> std::result::Result<Vec<u8>, ErrorStack> {
    let mut le = bn.to_vec_padded(len as i32)?;
    le.reverse();
    Ok(le)
}

fn curve_group(id: u32) -> std::result::Result<EcGroup, CertError> {
    let nid = match id {
        CURVE_P256 => Nid::X9_62_PRIME256V1,
        CURVE_P384 => Nid::SECP384R1,
        other => return Err(CertError::Malformed(format!("unknown curve {}", other))),
    };
    Ok(EcGroup::from_curve_name(nid)?)
}

fn rsa_pss_verify(
    key: &PKeyRef<Public>,
    body: &[u8],
    signature: &[u8],
) -> std::result::Result<bool, ErrorStack> {
    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
    verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    verifier.set_rsa_mgf1_md(MessageDigest::sha256())?;
    verifier.update(body)?;
    // a malformed signature is a mismatch, not a failure
    Ok(verifier.verify(signature).unwrap_or(false))
}

fn ecdsa_verify(
    key: &EcKeyRef<Public>,
    digest: MessageDigest,
    body: &[u8],
    sig: &[u8],
) -> std::result::Result<bool, ErrorStack> {
    let r = bn_from_le(&sig[..ECC_COORD_LEN])?;
    let s = bn_from_le(&sig[ECC_COORD_LEN..2 * ECC_COORD_LEN])?;
    let sig = EcdsaSig::from_private_components(r, s)?;
    let digest = hash(digest, body)?;
    Ok(sig.verify(&digest, key).unwrap_or(false))
}

/// A key able to sign platform certificates.
pub trait Issuer {
    fn usage(&self) -> Usage;

    fn public_key(&self) -> std::result::Result<PKey<Public>, CertError>;
}

/// A certificate in the SEV format.
#[derive(Clone, PartialEq, Eq)]
pub struct SevCertificate {
    raw: Vec<u8>,
}

impl fmt::Debug for SevCertificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SevCertificate")
            .field("usage", &self.usage())
            .field("algo", &self.pubkey_algo())
            .finish()
    }
}

impl SevCertificate {
    /// Decode the certificate at the front of `raw`.
    pub fn from_bytes(raw: &[u8]) -> std::result::Result<Self, CertError> {
        if raw.len() < SEV_CERT_LEN {
            return Err(CertError::Truncated {
                what: "SEV certificate",
                expected: SEV_CERT_LEN,
                found: raw.len(),
            });
        }
        let version = u32_at(raw, 0);
        if version != 1 {
            return Err(CertError::Malformed(format!(
                "SEV certificate version {}",
                version
            )));
        }
        Ok(SevCertificate {
            raw: raw[..SEV_CERT_LEN].to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn pubkey_algo(&self) -> u32 {
        u32_at(&self.raw, 12)
    }

    /// An unsigned certificate over a fresh P-384 key.
    pub fn generate(
        usage: Usage,
    ) -> std::result::Result<(SevCertificate, PKey<Private>), CertError> {
        let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
        let key = EcKey::generate(&group)?;
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        key.public_key()
            .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)?;

        let algo = if usage == Usage::PDH {
            ALGO_ECDH_SHA256
        } else {
            ALGO_ECDSA_SHA256
        };
        let mut raw = vec![0u8; SEV_CERT_LEN];
        raw[0..4].copy_from_slice(&1u32.to_le_bytes());
        raw[8..12].copy_from_slice(&usage.0.to_le_bytes());
        raw[12..16].copy_from_slice(&algo.to_le_bytes());
        let key_at = SEV_PUBKEY_OFFSET;
        raw[key_at..key_at + 4].copy_from_slice(&CURVE_P384.to_le_bytes());
        raw[key_at + 4..key_at + 4 + ECC_COORD_LEN].copy_from_slice(&bn_to_le(&x, ECC_COORD_LEN)?);
        raw[key_at + 4 + ECC_COORD_LEN..key_at + 4 + 2 * ECC_COORD_LEN]
            .copy_from_slice(&bn_to_le(&y, ECC_COORD_LEN)?);
        for at in SEV_SIG_OFFSETS {
            raw[at..at + 4].copy_from_slice(&Usage::INVALID.0.to_le_bytes());
        }
        Ok((SevCertificate { raw }, PKey::from_ec_key(key)?))
    }

    /// Check that one of the signature slots verifies under `issuer`.
    pub fn verify_signed_by(&self, issuer: &dyn Issuer) -> std::result::Result<(), CertError> {
        let key = issuer.public_key()?;
        let body = &self.raw[..SEV_CERT_BODY_LEN];
        for at in SEV_SIG_OFFSETS {
            if Usage(u32_at(&self.raw, at)) != issuer.usage() {
                continue;
            }
            let sig = &self.raw[at + 8..at + SEV_SIG_LEN];
            let verified = match u32_at(&self.raw, at + 4) {
                ALGO_ECDSA_SHA256 => ecdsa_verify(&*key.ec_key()?, MessageDigest::sha256(), body, sig)?,
                ALGO_ECDSA_SHA384 => ecdsa_verify(&*key.ec_key()?, MessageDigest::sha384(), body, sig)?,
                ALGO_RSA_SHA256 => {
                    let len = key.size();
                    if len > sig.len() {
                        false
                    } else {
                        let be: Vec<u8> = sig[..len].iter().rev().copied().collect();
                        rsa_pss_verify(&key, body, &be)?
                    }
                }
                _ => false,
            };
            if verified {
                return Ok(());
            }
        }
        Err(CertError::BadSignature {
            subject: self.usage(),
            issuer: issuer.usage(),
        })
    }

    /// Fill a free signature slot with a signature by `key` acting as `issuer`.
    #[cfg(test)]
    pub(crate) fn sign(&mut self, issuer: Usage, key: &PKey<Private>) -> std::result::Result<(), CertError> {
        use openssl::sign::Signer;

        let at = SEV_SIG_OFFSETS
            .iter()
            .copied()
            .find(|at| Usage(u32_at(&self.raw, *at)) == Usage::INVALID)
            .ok_or_else(|| CertError::Malformed("no free signature slot".to_string()))?;
        let body = self.raw[..SEV_CERT_BODY_LEN].to_vec();
        let (algo, sig) = match key.ec_key() {
            Ok(ec) => {
                let sig = EcdsaSig::sign(&hash(MessageDigest::sha256(), &body)?, &ec)?;
                let mut le = bn_to_le(sig.r(), ECC_COORD_LEN)?;
                le.extend(bn_to_le(sig.s(), ECC_COORD_LEN)?);
                (ALGO_ECDSA_SHA256, le)
            }
            Err(_) => {
                let mut signer = Signer::new(MessageDigest::sha256(), key)?;
                signer.set_rsa_padding(Padding::PKCS1_PSS)?;
                signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
                signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
                signer.update(&body)?;
                let mut le = signer.sign_to_vec()?;
                le.reverse();
                (ALGO_RSA_SHA256, le)
            }
        };
        self.raw[at..at + 4].copy_from_slice(&issuer.0.to_le_bytes());
        self.raw[at + 4..at + 8].copy_from_slice(&algo.to_le_bytes());
        self.raw[at + 8..at + 8 + sig.len()].copy_from_slice(&sig);
        Ok(())
    }
}

impl Issuer for SevCertificate {
    fn usage(&self) -> Usage {
        Usage(u32_at(&self.raw, 8))
    }

    fn public_key(&self) -> std::result::Result<PKey<Public>, CertError> {
        let key = &self.raw[SEV_PUBKEY_OFFSET..];
        match self.pubkey_algo() {
            ALGO_ECDSA_SHA256 | ALGO_ECDH_SHA256 | ALGO_ECDSA_SHA384 | ALGO_ECDH_SHA384 => {
                let group = curve_group(u32_at(key, 0))?;
                let x = bn_from_le(&key[4..4 + ECC_COORD_LEN])?;
                let y = bn_from_le(&key[4 + ECC_COORD_LEN..4 + 2 * ECC_COORD_LEN])?;
                let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
                Ok(PKey::from_ec_key(ec)?)
            }
            other => Err(CertError::Malformed(format!(
                "{} key algorithm 0x{:x}",
                self.usage(),
                other
            ))),
        }
    }
}

/// A certificate in the AMD CA format, the ARK or the ASK.
#[derive(Clone, PartialEq, Eq)]
pub struct CaCertificate {
    raw: Vec<u8>,
}

impl fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CaCertificate")
            .field("usage", &self.usage())
            .field("modulus_bits", &(self.modulus_len() * 8))
            .finish()
    }
}

impl CaCertificate {
    /// Decode the certificate at the front of `raw` and return it with the
    /// bytes that follow it.
    pub fn parse(raw: &[u8]) -> std::result::Result<(Self, &[u8]), CertError> {
        if raw.len() < CA_HEADER_LEN {
            return Err(CertError::Truncated {
                what: "AMD CA certificate header",
                expected: CA_HEADER_LEN,
                found: raw.len(),
            });
        }
        let version = u32_at(raw, 0);
        if version != 1 {
            return Err(CertError::Malformed(format!(
                "AMD CA certificate version {}",
                version
            )));
        }
        let pubexp_bits = u32_at(raw, 0x38) as usize;
        let modulus_bits = u32_at(raw, 0x3c) as usize;
        for (name, bits) in [("exponent", pubexp_bits), ("modulus", modulus_bits)] {
            if bits == 0 || bits % 8 != 0 || bits / 8 > CA_MAX_NUM_LEN {
                return Err(CertError::Malformed(format!("{} of {} bits", name, bits)));
            }
        }
        let len = CA_HEADER_LEN + pubexp_bits / 8 + 2 * (modulus_bits / 8);
        if raw.len() < len {
            return Err(CertError::Truncated {
                what: "AMD CA certificate",
                expected: len,
                found: raw.len(),
            });
        }
        Ok((
            CaCertificate {
                raw: raw[..len].to_vec(),
            },
            &raw[len..],
        ))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn key_id(&self) -> &[u8] {
        &self.raw[0x04..0x14]
    }

    /// Key id of the issuer.
    pub fn sig_id(&self) -> &[u8] {
        &self.raw[0x14..0x24]
    }

    fn pubexp_len(&self) -> usize {
        u32_at(&self.raw, 0x38) as usize / 8
    }

    fn modulus_len(&self) -> usize {
        u32_at(&self.raw, 0x3c) as usize / 8
    }

    fn body(&self) -> &[u8] {
        &self.raw[..CA_HEADER_LEN + self.pubexp_len() + self.modulus_len()]
    }

    /// Check the RSA-PSS signature of this certificate under `issuer`.
    pub fn verify_signed_by(&self, issuer: &CaCertificate) -> std::result::Result<(), CertError> {
        let bad = CertError::BadSignature {
            subject: self.usage(),
            issuer: issuer.usage(),
        };
        if self.sig_id() != issuer.key_id() {
            return Err(bad);
        }
        let signature: Vec<u8> = self.raw[self.body().len()..].iter().rev().copied().collect();
        if rsa_pss_verify(&*issuer.public_key()?, self.body(), &signature)? {
            Ok(())
        } else {
            Err(bad)
        }
    }

    /// A certificate over `key`, self-signed when `issuer` is `None`.
    #[cfg(test)]
    pub(crate) fn build(
        usage: Usage,
        key_id: [u8; 16],
        key: &Rsa<Private>,
        issuer: Option<([u8; 16], &PKey<Private>)>,
    ) -> std::result::Result<Self, CertError> {
        use openssl::sign::Signer;

        let len = key.size() as usize;
        let mut raw = vec![0u8; CA_HEADER_LEN];
        raw[0..4].copy_from_slice(&1u32.to_le_bytes());
        raw[0x04..0x14].copy_from_slice(&key_id);
        raw[0x14..0x24].copy_from_slice(&issuer.map_or(key_id, |(id, _)| id));
        raw[0x24..0x28].copy_from_slice(&usage.0.to_le_bytes());
        raw[0x38..0x3c].copy_from_slice(&((len * 8) as u32).to_le_bytes());
        raw[0x3c..0x40].copy_from_slice(&((len * 8) as u32).to_le_bytes());
        raw.extend(bn_to_le(key.e(), len)?);
        raw.extend(bn_to_le(key.n(), len)?);

        let own = PKey::from_rsa(key.clone())?;
        let signing_key = issuer.map_or(&own, |(_, k)| k);
        let mut signer = Signer::new(MessageDigest::sha256(), signing_key)?;
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
        signer.update(&raw)?;
        let mut signature = signer.sign_to_vec()?;
        signature.reverse();
        raw.extend(signature);
        Ok(CaCertificate { raw })
    }
}

impl Issuer for CaCertificate {
    fn usage(&self) -> Usage {
        Usage(u32_at(&self.raw, 0x24))
    }

    fn public_key(&self) -> std::result::Result<PKey<Public>, CertError> {
        let exp_at = CA_HEADER_LEN;
        let mod_at = exp_at + self.pubexp_len();
        let e = bn_from_le(&self.raw[exp_at..mod_at])?;
        let n = bn_from_le(&self.raw[mod_at..mod_at + self.modulus_len()])?;
        Ok(PKey::from_rsa(Rsa::from_public_components(n, e)?)?)
    }
}

/// The certificate chain of one SEV platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformChain {
    pub pdh: SevCertificate,
    pub pek: SevCertificate,
    pub oca: SevCertificate,
    pub cek: SevCertificate,
    pub ask: CaCertificate,
    pub ark: CaCertificate,
}

impl PlatformChain {
    /// Decode a chain in `sevctl export --full` layout.
    pub fn from_bytes(raw: &[u8]) -> std::result::Result<Self, CertError> {
        let sev_at = |index: usize, usage: Usage| -> std::result::Result<SevCertificate, CertError> {
            let cert = SevCertificate::from_bytes(raw.get(index * SEV_CERT_LEN..).unwrap_or(&[]))?;
            if cert.usage() != usage {
                return Err(CertError::Malformed(format!(
                    "expected the {} at position {}, found the {}",
                    usage,
                    index,
                    cert.usage()
                )));
            }
            Ok(cert)
        };
        let pdh = sev_at(0, Usage::PDH)?;
        let pek = sev_at(1, Usage::PEK)?;
        let oca = sev_at(2, Usage::OCA)?;
        let cek = sev_at(3, Usage::CEK)?;

        let (ask, rest) = CaCertificate::parse(&raw[4 * SEV_CERT_LEN..])?;
        let (ark, rest) = CaCertificate::parse(rest)?;
        for (cert, usage) in [(&ask, Usage::ASK), (&ark, Usage::ARK)] {
            if cert.usage() != usage {
                return Err(CertError::Malformed(format!(
                    "expected the {}, found the {}",
                    usage,
                    cert.usage()
                )));
            }
        }
        if !rest.is_empty() {
            return Err(CertError::Malformed(format!(
                "{} trailing bytes after the ARK",
                rest.len()
            )));
        }
        Ok(PlatformChain {
            pdh,
            pek,
            oca,
            cek,
            ask,
            ark,
        })
    }

    /// Read the chain file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| {
            LaunchError::IsolationConfigInvalid(format!(
                "cannot read certificate chain {:?}: {}",
                path, e
            ))
        })?;
        Self::from_bytes(&raw).map_err(|e| {
            LaunchError::IsolationConfigInvalid(format!(
                "cannot parse certificate chain {:?}: {}",
                path,
                error_chain(&e)
            ))
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(4 * SEV_CERT_LEN);
        for cert in [&self.pdh, &self.pek, &self.oca, &self.cek] {
            raw.extend_from_slice(cert.as_bytes());
        }
        raw.extend_from_slice(self.ask.as_bytes());
        raw.extend_from_slice(self.ark.as_bytes());
        raw
    }

    /// Check every signature of the chain and return the PDH key.
    ///
    /// The PEK must carry both the owner's and AMD's signature.
    pub fn verify(&self) -> std::result::Result<PKey<Public>, CertError> {
        self.ark.verify_signed_by(&self.ark)?;
        self.ask.verify_signed_by(&self.ark)?;
        self.cek.verify_signed_by(&self.ask)?;
        self.oca.verify_signed_by(&self.oca)?;
        self.pek.verify_signed_by(&self.oca)?;
        self.pek.verify_signed_by(&self.cek)?;
        self.pdh.verify_signed_by(&self.pek)?;
        self.pdh.public_key()
    }

    /// Whether `cert` is one of the SEV format certificates of this chain.
    pub fn contains(&self, cert: &SevCertificate) -> bool {
        [&self.pdh, &self.pek, &self.oca, &self.cek]
            .iter()
            .any(|own| *own == cert)
    }
}
