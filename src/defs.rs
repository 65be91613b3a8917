//! Map and program definition records
//!
//! The `maps` and `progs` sections of a bpf object carry packed arrays of
//! fixed-size little-endian records emitted by the object's build macros.
//! A section whose length is not a whole multiple of the record size means
//! the compiler and loader disagree about the layout, which is fatal.

use crate::error::{LoadError, LoadResult};

/// Size of one packed map definition record
pub const MAP_DEF_SIZE: usize = 112;

/// Size of one packed program definition record
pub const PROG_DEF_SIZE: usize = 20;

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

/// One map definition from the `maps` section
#[derive(Debug, Clone)]
pub struct MapDef {
    /// Map type (BPF_MAP_TYPE_*)
    pub map_type: u32,
    /// Size of keys in bytes
    pub key_size: u32,
    /// Size of values in bytes
    pub value_size: u32,
    /// Maximum number of entries
    pub max_entries: u32,
    /// Map creation flags
    pub map_flags: u32,
    /// Pin owner uid
    pub uid: u32,
    /// Pin owner gid
    pub gid: u32,
    /// Pin file mode
    pub mode: u32,
    /// Minimum kernel version (inclusive)
    pub min_kver: u32,
    /// Maximum kernel version (exclusive)
    pub max_kver: u32,
    /// Pin subdirectory hint, unused by this loader
    pub pin_subdir: [u8; 32],
    /// SELinux context hint, unused by this loader
    pub selinux_context: [u8; 32],
    /// Map is shared across objects (empty object segment in the pin path)
    pub shared: bool,
    /// Layout canary, must be zero
    pub zero: u32,
}

impl MapDef {
    fn parse(rec: &[u8]) -> Self {
        Self {
            map_type: le32(rec, 0),
            key_size: le32(rec, 4),
            value_size: le32(rec, 8),
            max_entries: le32(rec, 12),
            map_flags: le32(rec, 16),
            uid: le32(rec, 20),
            gid: le32(rec, 24),
            mode: le32(rec, 28),
            min_kver: le32(rec, 32),
            max_kver: le32(rec, 36),
            pin_subdir: rec[40..72].try_into().unwrap(),
            selinux_context: rec[72..104].try_into().unwrap(),
            shared: rec[104] != 0,
            zero: le32(rec, 108),
        }
    }
}

/// One program definition from the `progs` section
#[derive(Debug, Clone, Copy)]
pub struct ProgDef {
    /// Pin owner uid
    pub uid: u32,
    /// Pin owner gid
    pub gid: u32,
    /// Minimum kernel version (inclusive)
    pub min_kver: u32,
    /// Maximum kernel version (exclusive)
    pub max_kver: u32,
    /// Load failure of this program does not fail the run
    pub optional: bool,
}

impl ProgDef {
    fn parse(rec: &[u8]) -> Self {
        Self {
            uid: le32(rec, 0),
            gid: le32(rec, 4),
            min_kver: le32(rec, 8),
            max_kver: le32(rec, 12),
            optional: rec[16] != 0,
        }
    }
}

/// Parse the `maps` section bytes into definitions
pub fn parse_map_defs(data: &[u8]) -> LoadResult<Vec<MapDef>> {
    if data.len() % MAP_DEF_SIZE != 0 {
        return Err(LoadError::Malformed(format!(
            "maps section size {} is not a multiple of {}",
            data.len(),
            MAP_DEF_SIZE
        )));
    }
    Ok(data.chunks_exact(MAP_DEF_SIZE).map(MapDef::parse).collect())
}

/// Parse the `progs` section bytes into definitions
pub fn parse_prog_defs(data: &[u8]) -> LoadResult<Vec<ProgDef>> {
    if data.len() % PROG_DEF_SIZE != 0 {
        return Err(LoadError::Malformed(format!(
            "progs section size {} is not a multiple of {}",
            data.len(),
            PROG_DEF_SIZE
        )));
    }
    Ok(data
        .chunks_exact(PROG_DEF_SIZE)
        .map(ProgDef::parse)
        .collect())
}
