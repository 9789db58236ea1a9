//! On-disk layout of one shard file.
//!
//! ```text
//! header (48 bytes, little-endian)
//!   magic "MGSH" | version u32 | flags u32 | file_count u32 | trigram_count u32
//!   file_table_offset u64 | trigram_table_offset u64 | posting_offset u64 | crc32 u32
//! file table
//!   per file: flags u8 | path_len u16 | path bytes          + section crc32
//! trigram table (sorted by trigram)
//!   per trigram: trigram u32 | posting_offset u32 | posting_len u32   + section crc32
//! postings
//!   serialized roaring bitmaps, back to back                + section crc32
//! ```
//!
//! File ids are positions in the file table.

pub const MAGIC: [u8; 4] = *b"MGSH";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 48;
pub const TRIGRAM_ENTRY_SIZE: usize = 12;
pub const CRC_SIZE: usize = 4;

/// File-table flag: content looked binary, no trigrams were indexed
pub const FILE_BINARY: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHeader {
    pub version: u32,
    pub flags: u32,
    pub file_count: u32,
    pub trigram_count: u32,
    pub file_table_offset: u64,
    pub trigram_table_offset: u64,
    pub posting_offset: u64,
}

impl ShardHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.file_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.trigram_count.to_le_bytes());
        buf[20..28].copy_from_slice(&self.file_table_offset.to_le_bytes());
        buf[28..36].copy_from_slice(&self.trigram_table_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.posting_offset.to_le_bytes());
        let crc = crc32fast::hash(&buf[..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and verify a header; `None` on bad magic, version or checksum
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE || data[0..4] != MAGIC {
            return None;
        }
        if read_u32(data, 44)? != crc32fast::hash(&data[..44]) {
            return None;
        }
        let header = Self {
            version: read_u32(data, 4)?,
            flags: read_u32(data, 8)?,
            file_count: read_u32(data, 12)?,
            trigram_count: read_u32(data, 16)?,
            file_table_offset: read_u64(data, 20)?,
            trigram_table_offset: read_u64(data, 28)?,
            posting_offset: read_u64(data, 36)?,
        };
        (header.version == VERSION).then_some(header)
    }
}

#[inline]
pub fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

#[inline]
pub fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

#[inline]
pub fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes = data.get(at..at.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Check the trailing crc32 of `section` (body followed by its checksum)
pub fn verify_section(section: &[u8]) -> bool {
    if section.len() < CRC_SIZE {
        return false;
    }
    let (body, crc) = section.split_at(section.len() - CRC_SIZE);
    read_u32(crc, 0) == Some(crc32fast::hash(body))
}
