// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Secret material handling.

use std::fmt;

use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::utils::guid_le_bytes;

// 1e74f542-71dd-4d66-963e-ef4287ff173b
const EFI_SECRET_TABLE_HEADER_GUID: [u8; 16] = [
    0x42, 0xf5, 0x74, 0x1e, 0xdd, 0x71, 0x66, 0x4d, 0x96, 0x3e, 0xef, 0x42, 0x87, 0xff, 0x17, 0x3b,
];
const EFI_SECRET_HEADER_LEN: usize = 16 + 4;

/// A secret payload that is wiped in place once it is no longer needed.
///
/// The buffer keeps its length after [`SecretBuffer::zeroize`], so the wiped
/// bytes stay observable until the buffer itself is dropped. Dropping wipes
/// it as well.
pub struct SecretBuffer {
    data: Vec<u8>,
}

impl SecretBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        SecretBuffer { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite the secret with zeroes.
    pub fn zeroize(&mut self) {
        self.data.as_mut_slice().zeroize();
    }

    pub fn is_zeroized(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecretBuffer({} bytes)", self.data.len())
    }
}

/// Encode `secret` as an EFI secret table with a single entry.
///
/// ```text
/// +-------------------------------+
/// | 16B  table header GUID        |
/// |  4B  table length             |
/// +-- entry ----------------------+
/// | 16B  secret GUID              |
/// |  4B  entry length             |
/// |      secret data              |
/// +-------------------------------+
/// ```
pub fn efi_secret_table(guid: &Uuid, secret: &[u8]) -> Zeroizing<Vec<u8>> {
    let entry_len = EFI_SECRET_HEADER_LEN + secret.len();
    let table_len = EFI_SECRET_HEADER_LEN + entry_len;

    let mut table = Zeroizing::new(Vec::with_capacity(table_len));
    table.extend_from_slice(&EFI_SECRET_TABLE_HEADER_GUID);
    table.extend_from_slice(&(table_len as u32).to_le_bytes());
    table.extend_from_slice(&guid_le_bytes(guid));
    table.extend_from_slice(&(entry_len as u32).to_le_bytes());
    table.extend_from_slice(secret);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_buffer_zeroize_in_place() {
        let mut secret = SecretBuffer::new(b"top secret key".to_vec());
        let ptr = secret.as_bytes().as_ptr();
        assert_eq!(secret.len(), 14);
        assert!(!secret.is_zeroized());
        assert_eq!(format!("{:?}", secret), "SecretBuffer(14 bytes)");

        secret.zeroize();
        // same allocation, every byte overwritten
        assert_eq!(secret.as_bytes().as_ptr(), ptr);
        assert_eq!(secret.len(), 14);
        assert!(secret.is_zeroized());
    }

    #[test]
    fn test_efi_secret_table() {
        let guid = Uuid::parse_str("e6f5a162-d67f-4750-a67c-5d065f2a9910").unwrap();
        let table = efi_secret_table(&guid, b"abcd");
        assert_eq!(table.len(), 44);
        assert_eq!(&table[..16], &EFI_SECRET_TABLE_HEADER_GUID);
        assert_eq!(u32::from_le_bytes([table[16], table[17], table[18], table[19]]), 44);
        assert_eq!(&table[20..36], &guid_le_bytes(&guid));
        assert_eq!(u32::from_le_bytes([table[36], table[37], table[38], table[39]]), 24);
        assert_eq!(&table[40..], b"abcd");
    }
}
