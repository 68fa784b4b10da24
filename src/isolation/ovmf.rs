// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OVMF GUID table parsing.
//!
//! Ref: https://qemu.readthedocs.io/en/latest/specs/sev-guest-firmware.html
//!
//! ```text
//! +-- Entries (zero or more) -----------+
//! |                entry data: any bytes|
//! |         2B     entry length         |
//! |        16B     entry GUID           |
//! +-------------------------------------+
//! EOF-50    2B     OVMF table length
//! EOF-48   16B     OVMF footer GUID
//! EOF-32   32B     reset vector area
//! End of File
//! ```

use std::convert::TryInto;

use thiserror::Error;

/// OVMF table related errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseOvmfTableError {
    /// Abnormal OVMF table format
    #[error("Abnormal OVMF table format")]
    InvalidOvmfTableFormat,
    /// A required entry is not in the table.
    #[error("OVMF table has no {0} entry")]
    MissingEntry(&'static str),
}

pub(crate) const OVMF_TABLE_FOOTER_GUID: [u8; 16] = [
    222, 130, 181, 150, 178, 31, 247, 69, 186, 234, 163, 102, 197, 90, 8, 45,
];
pub(crate) const SEV_SECRET_BLOCK_GUID: [u8; 16] = [
    97, 179, 46, 76, 155, 125, 195, 76, 128, 129, 18, 124, 144, 211, 210, 148,
];
pub(crate) const SEV_HASH_TABLE_RV_GUID: [u8; 16] = [
    31, 55, 85, 114, 59, 58, 4, 75, 146, 123, 29, 166, 239, 168, 212, 84,
];

const FOOTER_OFFSET: usize = 32;
const GUID_LEN: usize = 16;
const ENTRY_HEADER_LEN: usize = GUID_LEN + 2;
const GPA_ENTRY_LEN: usize = 0x1a;

/// Where the firmware expects injected launch secrets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SevSecretBlockGpa {
    pub addr: u32,
    pub size: u32,
}

/// Where the firmware expects the measured-boot hashes table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SevHashesTableGpa {
    pub addr: u32,
    pub size: u32,
}

/// Reads the firmware image backward from a given offset.
struct BackwardReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BackwardReader<'a> {
    /// Move backward and read `len` bytes.
    fn read(&mut self, len: usize) -> Result<&'a [u8], ParseOvmfTableError> {
        let start = self
            .offset
            .checked_sub(len)
            .ok_or(ParseOvmfTableError::InvalidOvmfTableFormat)?;
        let bytes = &self.data[start..self.offset];
        self.offset = start;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), ParseOvmfTableError> {
        self.read(len).map(|_| ())
    }

    fn read_guid(&mut self) -> Result<[u8; 16], ParseOvmfTableError> {
        self.read(GUID_LEN)?
            .try_into()
            .map_err(|_| ParseOvmfTableError::InvalidOvmfTableFormat)
    }

    fn read_u16(&mut self) -> Result<u16, ParseOvmfTableError> {
        let bytes = self.read(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ParseOvmfTableError> {
        let bytes = self.read(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    // entry data is `addr: u32, size: u32`, read back to front
    fn read_gpa(&mut self, entry_len: usize) -> Result<(u32, u32), ParseOvmfTableError> {
        if entry_len != GPA_ENTRY_LEN {
            return Err(ParseOvmfTableError::InvalidOvmfTableFormat);
        }
        let size = self.read_u32()?;
        let addr = self.read_u32()?;
        Ok((addr, size))
    }
}

/// Locate the SEV secret block and hashes table advertised by `firmware`.
pub fn parse_ovmf_table(
    firmware: &[u8],
) -> Result<(SevSecretBlockGpa, SevHashesTableGpa), ParseOvmfTableError> {
    if firmware.len() < FOOTER_OFFSET + ENTRY_HEADER_LEN {
        return Err(ParseOvmfTableError::InvalidOvmfTableFormat);
    }
    let mut f = BackwardReader {
        data: firmware,
        offset: firmware.len() - FOOTER_OFFSET,
    };

    if f.read_guid()? != OVMF_TABLE_FOOTER_GUID {
        return Err(ParseOvmfTableError::InvalidOvmfTableFormat);
    }
    let table_len = f.read_u16()? as usize;
    let mut bytes_left = table_len
        .checked_sub(ENTRY_HEADER_LEN)
        .ok_or(ParseOvmfTableError::InvalidOvmfTableFormat)?;
    if bytes_left > f.offset {
        return Err(ParseOvmfTableError::InvalidOvmfTableFormat);
    }

    let mut secret_block: Option<SevSecretBlockGpa> = None;
    let mut hashes_table: Option<SevHashesTableGpa> = None;

    while bytes_left >= ENTRY_HEADER_LEN && (secret_block.is_none() || hashes_table.is_none()) {
        let guid = f.read_guid()?;
        let entry_len = f.read_u16()? as usize;
        if entry_len < ENTRY_HEADER_LEN {
            return Err(ParseOvmfTableError::InvalidOvmfTableFormat);
        }
        bytes_left = bytes_left
            .checked_sub(entry_len)
            .ok_or(ParseOvmfTableError::InvalidOvmfTableFormat)?;

        match guid {
            SEV_SECRET_BLOCK_GUID if secret_block.is_none() => {
                let (addr, size) = f.read_gpa(entry_len)?;
                secret_block = Some(SevSecretBlockGpa { addr, size });
            }
            SEV_HASH_TABLE_RV_GUID if hashes_table.is_none() => {
                let (addr, size) = f.read_gpa(entry_len)?;
                hashes_table = Some(SevHashesTableGpa { addr, size });
            }
            SEV_SECRET_BLOCK_GUID | SEV_HASH_TABLE_RV_GUID => {
                return Err(ParseOvmfTableError::InvalidOvmfTableFormat)
            }
            _ => f.skip(entry_len - ENTRY_HEADER_LEN)?,
        }
    }

    match (secret_block, hashes_table) {
        (Some(secret), Some(hashes)) => Ok((secret, hashes)),
        (None, _) => Err(ParseOvmfTableError::MissingEntry("SEV secret block")),
        (_, None) => Err(ParseOvmfTableError::MissingEntry("SEV hashes table")),
    }
}
