//! Kernel bpf ABI constants
//!
//! Map types, program types, attach types, and map creation flags follow
//! the Linux uapi values. Only the subset this loader handles is listed.

use bitflags::bitflags;

// =============================================================================
// Map Types (Linux ABI)
// =============================================================================

/// Unspecified map type
#[allow(dead_code)]
pub const BPF_MAP_TYPE_UNSPEC: u32 = 0;
/// Hash table map
pub const BPF_MAP_TYPE_HASH: u32 = 1;
/// Array map (indexed by u32)
pub const BPF_MAP_TYPE_ARRAY: u32 = 2;
/// Device map (ifindex redirect targets, array form)
pub const BPF_MAP_TYPE_DEVMAP: u32 = 14;
/// Device map, hash form
pub const BPF_MAP_TYPE_DEVMAP_HASH: u32 = 25;
/// Ring buffer map
pub const BPF_MAP_TYPE_RINGBUF: u32 = 27;

// =============================================================================
// Program Types (Linux ABI)
// =============================================================================

/// Unspecified program type
pub const BPF_PROG_TYPE_UNSPEC: u32 = 0;
/// Socket filter
pub const BPF_PROG_TYPE_SOCKET_FILTER: u32 = 1;
/// kprobe (also kretprobe/uprobe/uretprobe)
pub const BPF_PROG_TYPE_KPROBE: u32 = 2;
/// Tracepoint
pub const BPF_PROG_TYPE_TRACEPOINT: u32 = 5;
/// Perf event
pub const BPF_PROG_TYPE_PERF_EVENT: u32 = 7;

// =============================================================================
// Attach Types (Linux ABI)
// =============================================================================

/// Unspecified attach type (value 0 in the uapi attach-type enum)
pub const BPF_ATTACH_TYPE_UNSPEC: u32 = 0;

// =============================================================================
// Map Creation Flags (Linux ABI)
// =============================================================================

bitflags! {
    /// Flags accepted by map creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Don't preallocate map storage
        const NO_PREALLOC = 1;
        /// Map is read-only from userspace
        const RDONLY = 1 << 3;
        /// Map is write-only from userspace
        const WRONLY = 1 << 4;
        /// Map is read-only from the program side
        const RDONLY_PROG = 1 << 7;
        /// Map is write-only from the program side
        const WRONLY_PROG = 1 << 8;
    }
}

// =============================================================================
// Kernel Version Encoding
// =============================================================================

/// Encode a kernel version the way `LINUX_VERSION_CODE` does
pub const fn kver(major: u32, minor: u32, sub: u32) -> u32 {
    (major << 16) | (minor << 8) | sub
}

/// First kernel that supports `BPF_MAP_TYPE_DEVMAP_HASH`
pub const KVER_DEVMAP_HASH: u32 = kver(5, 4, 0);

/// Matches every kernel (open upper bound for version gating)
pub const KVER_INF: u32 = 0xFFFF_FFFF;
