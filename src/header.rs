//! On-disk metadata header of a random block device.
//!
//! The header is written once by `mkfs` at the device's `start` offset and
//! read back on every open. The encoding is fixed-layout little-endian and
//! bounded by [`RBM_HEADER_MAX_LEN`], so the reserved region never depends on
//! field values:
//!
//! ```text
//! struct_v u8 | struct_compat u8 | size u64 | block_size u64 | start u64 |
//! feature u64 | start_data_area u32 | crc u32 |
//! major_dev u8 | magic u64 | device_type u8 | device_id u8 | seastore_id [u8; 16]
//! ```
//!
//! `crc` is a CRC32 over every other byte of the encoding, in layout order.

use crate::types::DeviceId;
use crc32fast::Hasher as Crc32Hasher;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const RBM_HEADER_STRUCT_V: u8 = 1;
pub const RBM_HEADER_STRUCT_COMPAT: u8 = 1;
pub const RBM_HEADER_ENCODED_LEN: usize = 69;
/// Space reserved for the header regardless of the format version.
pub const RBM_HEADER_MAX_LEN: usize = 128;
pub const RBM_DEFAULT_MAGIC: u64 = 0x5242_4d5f_4844_5231;
/// Smallest block size `mkfs` accepts; the header must fit in one block.
pub const RBM_MIN_BLOCK_SIZE: u64 = 512;

/// The bitmap region between the header block and the data area tracks allocations.
pub const RBM_FEATURE_ALLOC_BITMAP: u64 = 1 << 0;
pub const RBM_SUPPORTED_FEATURES: u64 = RBM_FEATURE_ALLOC_BITMAP;

const CRC_OFFSET: usize = 38;
const CRC_LEN: usize = 4;

const _: () = assert!(RBM_HEADER_ENCODED_LEN <= RBM_HEADER_MAX_LEN);
const _: () = assert!(RBM_HEADER_MAX_LEN as u64 <= RBM_MIN_BLOCK_SIZE);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Hdd = 1,
    Ssd = 2,
    RandomBlockSsd = 3,
    RandomBlockEphemeral = 4,
}

impl DeviceType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeviceType::Hdd),
            2 => Some(DeviceType::Ssd),
            3 => Some(DeviceType::RandomBlockSsd),
            4 => Some(DeviceType::RandomBlockEphemeral),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Hdd => "hdd",
            DeviceType::Ssd => "ssd",
            DeviceType::RandomBlockSsd => "random_block_ssd",
            DeviceType::RandomBlockEphemeral => "random_block_ephemeral",
        };
        f.write_str(name)
    }
}

/// Device-level configuration embedded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub major_dev: bool,
    pub magic: u64,
    pub device_type: DeviceType,
    pub device_id: DeviceId,
    pub seastore_id: [u8; 16],
}

impl DeviceConfig {
    pub fn new(device_id: DeviceId, device_type: DeviceType) -> Self {
        Self {
            major_dev: true,
            magic: RBM_DEFAULT_MAGIC,
            device_type,
            device_id,
            seastore_id: [0u8; 16],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbmMetadataHeader {
    pub size: u64,
    pub block_size: u64,
    pub start: u64,
    pub feature: u64,
    pub start_data_area: u32,
    pub crc: u32,
    pub config: DeviceConfig,
}

impl RbmMetadataHeader {
    /// Builds a header and seals it with a freshly computed checksum.
    pub fn new(
        size: u64,
        block_size: u64,
        start: u64,
        feature: u64,
        start_data_area: u32,
        config: DeviceConfig,
    ) -> Self {
        let mut header = Self {
            size,
            block_size,
            start,
            feature,
            start_data_area,
            crc: 0,
            config,
        };
        header.crc = header.compute_crc();
        header
    }

    pub fn encode(&self) -> [u8; RBM_HEADER_ENCODED_LEN] {
        let mut bytes = self.encode_fields();
        bytes[CRC_OFFSET..CRC_OFFSET + CRC_LEN].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// Encoding zero-padded to the reserved header length.
    pub fn encode_reserved(&self) -> [u8; RBM_HEADER_MAX_LEN] {
        let mut bytes = [0u8; RBM_HEADER_MAX_LEN];
        bytes[..RBM_HEADER_ENCODED_LEN].copy_from_slice(&self.encode());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < RBM_HEADER_ENCODED_LEN {
            return Err(HeaderError::TooShort {
                observed: bytes.len(),
                expected: RBM_HEADER_ENCODED_LEN,
            });
        }
        let bytes = &bytes[..RBM_HEADER_ENCODED_LEN];
        let struct_v = bytes[0];
        let struct_compat = bytes[1];
        if struct_v == 0 || struct_compat > RBM_HEADER_STRUCT_V {
            return Err(HeaderError::UnsupportedVersion {
                struct_v,
                struct_compat,
                supported: RBM_HEADER_STRUCT_V,
            });
        }

        let stored_crc = read_u32(bytes, CRC_OFFSET);
        let computed_crc = crc_over(bytes);
        if stored_crc != computed_crc {
            return Err(HeaderError::ChecksumMismatch {
                stored: stored_crc,
                computed: computed_crc,
            });
        }
        if struct_v > RBM_HEADER_STRUCT_V {
            warn!(
                "event=rbm_header_forward_compat struct_v={} struct_compat={} supported={}",
                struct_v, struct_compat, RBM_HEADER_STRUCT_V
            );
        }

        let major_dev = match bytes[42] {
            0 => false,
            1 => true,
            other => return Err(HeaderError::Malformed(format!("major_dev byte {other}"))),
        };
        let device_type = DeviceType::from_u8(bytes[51])
            .ok_or_else(|| HeaderError::Malformed(format!("device_type byte {}", bytes[51])))?;
        let mut seastore_id = [0u8; 16];
        seastore_id.copy_from_slice(&bytes[53..69]);

        let mut header = Self {
            size: read_u64(bytes, 2),
            block_size: read_u64(bytes, 10),
            start: read_u64(bytes, 18),
            feature: read_u64(bytes, 26),
            start_data_area: read_u32(bytes, 34),
            crc: stored_crc,
            config: DeviceConfig {
                major_dev,
                magic: read_u64(bytes, 43),
                device_type,
                device_id: DeviceId(bytes[52]),
                seastore_id,
            },
        };
        header.validate()?;
        if struct_v != RBM_HEADER_STRUCT_V {
            // Encoding always emits the current version, so reseal against it.
            header.crc = header.compute_crc();
        }
        Ok(header)
    }

    /// Checks the structural invariants of the geometry fields.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(HeaderError::Malformed(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.start % self.block_size != 0 {
            return Err(HeaderError::Malformed(format!(
                "start {:#x} not aligned to block_size {}",
                self.start, self.block_size
            )));
        }
        let start_data_area = u64::from(self.start_data_area);
        if start_data_area % self.block_size != 0 {
            return Err(HeaderError::Malformed(format!(
                "start_data_area {:#x} not aligned to block_size {}",
                start_data_area, self.block_size
            )));
        }
        if start_data_area < self.start.saturating_add(self.block_size) {
            return Err(HeaderError::Malformed(format!(
                "start_data_area {:#x} overlaps header block at {:#x}",
                start_data_area, self.start
            )));
        }
        if self.size <= start_data_area {
            return Err(HeaderError::Malformed(format!(
                "size {} leaves no data area after {:#x}",
                self.size, start_data_area
            )));
        }
        Ok(())
    }

    pub fn compute_crc(&self) -> u32 {
        crc_over(&self.encode_fields())
    }

    pub fn verify_crc(&self) -> bool {
        self.crc == self.compute_crc()
    }

    fn encode_fields(&self) -> [u8; RBM_HEADER_ENCODED_LEN] {
        let mut bytes = [0u8; RBM_HEADER_ENCODED_LEN];
        bytes[0] = RBM_HEADER_STRUCT_V;
        bytes[1] = RBM_HEADER_STRUCT_COMPAT;
        bytes[2..10].copy_from_slice(&self.size.to_le_bytes());
        bytes[10..18].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[18..26].copy_from_slice(&self.start.to_le_bytes());
        bytes[26..34].copy_from_slice(&self.feature.to_le_bytes());
        bytes[34..38].copy_from_slice(&self.start_data_area.to_le_bytes());
        bytes[42] = u8::from(self.config.major_dev);
        bytes[43..51].copy_from_slice(&self.config.magic.to_le_bytes());
        bytes[51] = self.config.device_type as u8;
        bytes[52] = self.config.device_id.0;
        bytes[53..69].copy_from_slice(&self.config.seastore_id);
        bytes
    }
}

impl fmt::Display for RbmMetadataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rbm_metadata_header_t(size={}, block_size={}, start={:#x}, feature={:#x}, \
             start_data_area={:#x}, crc={:#010x}, major_dev={}, magic={:#x}, device_type={}, \
             device_id={}, seastore_id={})",
            self.size,
            self.block_size,
            self.start,
            self.feature,
            self.start_data_area,
            self.crc,
            self.config.major_dev,
            self.config.magic,
            self.config.device_type,
            self.config.device_id,
            HexId(&self.config.seastore_id),
        )
    }
}

struct HexId<'a>(&'a [u8]);

impl fmt::Display for HexId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn crc_over(encoded: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&encoded[..CRC_OFFSET]);
    hasher.update(&encoded[CRC_OFFSET + CRC_LEN..RBM_HEADER_ENCODED_LEN]);
    hasher.finalize()
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(array)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(array)
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum HeaderError {
    #[error("header too short: observed {observed} bytes, expected {expected}")]
    TooShort { observed: usize, expected: usize },
    #[error("unsupported header version {struct_v} (compat {struct_compat}, supported {supported})")]
    UnsupportedVersion {
        struct_v: u8,
        struct_compat: u8,
        supported: u8,
    },
    #[error("header CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("malformed header: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RbmMetadataHeader {
        RbmMetadataHeader::new(
            1 << 20,
            4096,
            0,
            RBM_FEATURE_ALLOC_BITMAP,
            8192,
            DeviceConfig::new(DeviceId(1), DeviceType::RandomBlockSsd),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let header = sample();
        let decoded = RbmMetadataHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify_crc());
    }

    #[test]
    fn round_trips_across_geometries_and_identities() {
        let device_types = [
            DeviceType::Hdd,
            DeviceType::Ssd,
            DeviceType::RandomBlockSsd,
            DeviceType::RandomBlockEphemeral,
        ];
        let geometries = [
            (1u64 << 20, 4096u64, 0u64, 8192u32),
            (1 << 20, 4096, 16384, 0x6000),
            (64 << 20, 512, 0, 512 + 16384),
            (1 << 30, 65536, 65536, 3 * 65536),
        ];
        for (index, &(size, block_size, start, start_data_area)) in geometries.iter().enumerate() {
            for (ty, &device_type) in device_types.iter().enumerate() {
                let mut config = DeviceConfig::new(DeviceId((index * 4 + ty) as u8), device_type);
                config.major_dev = ty % 2 == 0;
                for (i, byte) in config.seastore_id.iter_mut().enumerate() {
                    *byte = (i as u8).wrapping_mul(17).wrapping_add(ty as u8 + 1);
                }
                let header = RbmMetadataHeader::new(
                    size,
                    block_size,
                    start,
                    RBM_FEATURE_ALLOC_BITMAP,
                    start_data_area,
                    config,
                );
                let decoded = RbmMetadataHeader::decode(&header.encode_reserved()).unwrap();
                assert_eq!(decoded, header, "geometry {index} type {device_type}");
            }
        }
    }

    #[test]
    fn newer_compatible_version_re_encodes_as_current() {
        let mut bytes = sample().encode();
        bytes[0] = RBM_HEADER_STRUCT_V + 1;
        let crc = crc_over(&bytes);
        bytes[CRC_OFFSET..CRC_OFFSET + CRC_LEN].copy_from_slice(&crc.to_le_bytes());

        let decoded = RbmMetadataHeader::decode(&bytes).unwrap();
        assert!(decoded.verify_crc());
        assert_eq!(decoded, sample());
        let reencoded = decoded.encode();
        assert_eq!(reencoded[0], RBM_HEADER_STRUCT_V);
        assert_eq!(RbmMetadataHeader::decode(&reencoded).unwrap(), decoded);
    }

    #[test]
    fn decode_ignores_reserved_padding() {
        let header = sample();
        let mut bytes = header.encode_reserved();
        bytes[RBM_HEADER_MAX_LEN - 1] = 0xaa;
        assert_eq!(RbmMetadataHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn any_flipped_byte_is_a_checksum_mismatch() {
        let encoded = sample().encode();
        for index in 2..RBM_HEADER_ENCODED_LEN {
            let mut bytes = encoded;
            bytes[index] ^= 0x40;
            let err = RbmMetadataHeader::decode(&bytes).unwrap_err();
            assert!(
                matches!(err, HeaderError::ChecksumMismatch { .. }),
                "byte {index}: {err:?}"
            );
        }
    }

    #[test]
    fn incompatible_version_is_distinct() {
        let mut bytes = sample().encode();
        bytes[1] = RBM_HEADER_STRUCT_V + 1;
        assert!(matches!(
            RbmMetadataHeader::decode(&bytes),
            Err(HeaderError::UnsupportedVersion { .. })
        ));

        let mut bytes = sample().encode();
        bytes[0] = 0;
        assert!(matches!(
            RbmMetadataHeader::decode(&bytes),
            Err(HeaderError::UnsupportedVersion { struct_v: 0, .. })
        ));
    }

    #[test]
    fn rejects_malformed_geometry() {
        let mut header = sample();
        header.block_size = 3000;
        header.crc = header.compute_crc();
        assert!(matches!(
            RbmMetadataHeader::decode(&header.encode()),
            Err(HeaderError::Malformed(_))
        ));

        let mut header = sample();
        header.start_data_area = 4096 + 17;
        header.crc = header.compute_crc();
        assert!(matches!(
            RbmMetadataHeader::decode(&header.encode()),
            Err(HeaderError::Malformed(_))
        ));

        let mut header = sample();
        header.size = 8192;
        header.crc = header.compute_crc();
        assert!(matches!(
            RbmMetadataHeader::decode(&header.encode()),
            Err(HeaderError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = sample().encode();
        assert_eq!(
            RbmMetadataHeader::decode(&bytes[..40]),
            Err(HeaderError::TooShort {
                observed: 40,
                expected: RBM_HEADER_ENCODED_LEN
            })
        );
    }

    #[test]
    fn display_lists_geometry() {
        let rendered = sample().to_string();
        assert!(rendered.contains("size=1048576"));
        assert!(rendered.contains("start_data_area=0x2000"));
        assert!(rendered.contains("device_type=random_block_ssd"));
        assert!(rendered.ends_with("seastore_id=00000000000000000000000000000000)"));

        let mut header = sample();
        header.config.seastore_id[0] = 0xab;
        header.config.seastore_id[15] = 0x01;
        assert!(header
            .to_string()
            .contains("seastore_id=ab000000000000000000000000000001"));
    }
}
