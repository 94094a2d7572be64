//! Fixed-layout header blob of legacy-format images.
//!
//! Layout, little-endian:
//!
//! ```text
//! text[40]          free-form banner
//! signature[16]     must match SIGNATURE exactly
//! version[8]
//! block_name[24]    NUL-padded data object prefix
//! image_size  u64
//! order       u8    \
//! crypt_type  u8     | options triple (crypt/comp always NONE)
//! comp_type   u8    /
//! unused      u8
//! snap_seq    u64
//! snap_count  u32
//! reserved    u32
//! snap_names_len u64
//! snap_count × { id u64, image_size u64 }
//! names blob        snap_count NUL-terminated names, snap_names_len bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use blockio_common::{Error, Result, SnapContext, SnapId};

pub const HEADER_TEXT: &[u8; 40] = b"<<< blockio image >>>\n\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
pub const SIGNATURE: &[u8; 16] = b"BLOCKIOIMGHDR\0\0\0";
pub const VERSION: &[u8; 8] = b"001.000\0";

pub const BLOCK_NAME_LEN: usize = 24;
const FIXED_LEN: usize = 40 + 16 + 8 + BLOCK_NAME_LEN + 8 + 4 + 8 + 4 + 4 + 8;

pub const CRYPT_NONE: u8 = 0;
pub const COMP_NONE: u8 = 0;

/// Decoded legacy header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub block_name: String,
    pub image_size: u64,
    pub order: u8,
    pub snap_seq: SnapId,
    pub snaps: Vec<LegacySnap>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySnap {
    pub id: SnapId,
    pub image_size: u64,
    pub name: String,
}

impl LegacyHeader {
    pub fn new(block_name: String, image_size: u64, order: u8) -> Self {
        debug_assert!(block_name.len() < BLOCK_NAME_LEN);
        Self {
            block_name,
            image_size,
            order,
            snap_seq: 0,
            snaps: Vec::new(),
        }
    }

    /// Snap context of a legacy image: ids descending under the sequence
    pub fn snap_context(&self) -> SnapContext {
        let mut snaps: Vec<SnapId> = self.snaps.iter().map(|s| s.id).collect();
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        SnapContext {
            seq: self.snap_seq,
            snaps,
        }
    }

    pub fn encode(&self) -> Bytes {
        let names_len: usize = self.snaps.iter().map(|s| s.name.len() + 1).sum();
        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.snaps.len() * 16 + names_len);

        buf.put_slice(HEADER_TEXT);
        buf.put_slice(SIGNATURE);
        buf.put_slice(VERSION);
        let mut block_name = [0u8; BLOCK_NAME_LEN];
        block_name[..self.block_name.len()].copy_from_slice(self.block_name.as_bytes());
        buf.put_slice(&block_name);
        buf.put_u64_le(self.image_size);
        buf.put_u8(self.order);
        buf.put_u8(CRYPT_NONE);
        buf.put_u8(COMP_NONE);
        buf.put_u8(0);
        buf.put_u64_le(self.snap_seq);
        buf.put_u32_le(self.snaps.len() as u32);
        buf.put_u32_le(0); // reserved
        buf.put_u64_le(names_len as u64);

        for snap in &self.snaps {
            buf.put_u64_le(snap.id);
            buf.put_u64_le(snap.image_size);
        }
        for snap in &self.snaps {
            buf.put_slice(snap.name.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_LEN {
            return Err(Error::corrupt("legacy header too short"));
        }
        let mut buf = data;

        buf.advance(40); // banner text is informational
        let mut signature = [0u8; 16];
        buf.copy_to_slice(&mut signature);
        if &signature != SIGNATURE {
            return Err(Error::corrupt("unrecognized header signature"));
        }
        buf.advance(8); // version

        let mut block_name = [0u8; BLOCK_NAME_LEN];
        buf.copy_to_slice(&mut block_name);
        let end = block_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BLOCK_NAME_LEN);
        let block_name = String::from_utf8_lossy(&block_name[..end]).into_owned();

        let image_size = buf.get_u64_le();
        let order = buf.get_u8();
        let _crypt = buf.get_u8();
        let _comp = buf.get_u8();
        buf.advance(1);
        let snap_seq = buf.get_u64_le();
        let snap_count = buf.get_u32_le() as usize;
        let _reserved = buf.get_u32_le();
        let snap_names_len = buf.get_u64_le() as usize;

        if buf.remaining() < snap_count * 16 + snap_names_len {
            return Err(Error::corrupt("legacy header snapshot area truncated"));
        }

        let mut snaps = Vec::with_capacity(snap_count);
        for _ in 0..snap_count {
            let id = buf.get_u64_le();
            let size = buf.get_u64_le();
            snaps.push(LegacySnap {
                id,
                image_size: size,
                name: String::new(),
            });
        }

        let mut names = &buf[..snap_names_len];
        for snap in &mut snaps {
            let Some(end) = names.iter().position(|&b| b == 0) else {
                return Err(Error::corrupt("legacy header snapshot names truncated"));
            };
            snap.name = String::from_utf8_lossy(&names[..end]).into_owned();
            names = &names[end + 1..];
        }

        Ok(Self {
            block_name,
            image_size,
            order,
            snap_seq,
            snaps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = LegacyHeader::new("blk.1.2.3".to_string(), 1 << 30, 22);
        hdr.snap_seq = 7;
        hdr.snaps.push(LegacySnap {
            id: 3,
            image_size: 1 << 29,
            name: "before-upgrade".to_string(),
        });
        hdr.snaps.push(LegacySnap {
            id: 7,
            image_size: 1 << 30,
            name: "nightly".to_string(),
        });

        let decoded = LegacyHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let hdr = LegacyHeader::new("blk.0".to_string(), 4096, 12);
        let mut raw = hdr.encode().to_vec();
        raw[41] ^= 0xff; // inside the signature area
        let err = LegacyHeader::decode(&raw).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let hdr = LegacyHeader::new("blk.0".to_string(), 4096, 12);
        let raw = hdr.encode();
        assert!(LegacyHeader::decode(&raw[..32]).is_err());
    }

    #[test]
    fn test_snap_context_descending() {
        let mut hdr = LegacyHeader::new("blk.0".to_string(), 4096, 12);
        hdr.snap_seq = 9;
        for id in [2u64, 9, 5] {
            hdr.snaps.push(LegacySnap {
                id,
                image_size: 4096,
                name: format!("s{id}"),
            });
        }
        let snapc = hdr.snap_context();
        assert_eq!(snapc.snaps, vec![9, 5, 2]);
        assert!(snapc.is_valid());
    }
}
