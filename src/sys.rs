//! Kernel collaborator contract
//!
//! The loader performs no bpf(2) or filesystem-metadata syscalls itself;
//! everything privileged goes through the [`Kernel`] trait. Descriptors
//! are an associated owned type: dropping one releases the in-memory
//! descriptor, so every exit path of the loader releases whatever it still
//! holds. A pinned object stays alive through its filesystem entry.

use std::io;
use std::path::Path;

/// Descriptor value patched into instructions for kver-skipped map slots
pub const INVALID_FD: i32 = -1;

/// Attributes for a map-create request
#[derive(Debug, Clone)]
pub struct MapCreateRequest<'a> {
    /// Map type (BPF_MAP_TYPE_*), after any substitution
    pub map_type: u32,
    /// Size of keys in bytes
    pub key_size: u32,
    /// Size of values in bytes
    pub value_size: u32,
    /// Maximum number of entries, after any clamping
    pub max_entries: u32,
    /// Map creation flags, after any implied bits
    pub map_flags: u32,
    /// Kernel-side map name (the kernel keeps at most 15 bytes)
    pub name: &'a str,
}

/// Attributes for a program-load request
#[derive(Debug, Clone)]
pub struct ProgLoadRequest<'a> {
    /// Program type (BPF_PROG_TYPE_*)
    pub prog_type: u32,
    /// Attach type the program expects
    pub expected_attach_type: u32,
    /// Running kernel version
    pub kern_version: u32,
    /// License string from the object
    pub license: &'a str,
    /// Encoded instructions, relocations already applied
    pub insns: &'a [u8],
    /// Kernel-side program name (the kernel keeps at most 15 bytes)
    pub name: &'a str,
}

/// Kernel-reported map attributes, for attribute agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    /// Map type
    pub map_type: u32,
    /// Key size in bytes
    pub key_size: u32,
    /// Value size in bytes
    pub value_size: u32,
    /// Maximum number of entries
    pub max_entries: u32,
    /// Map flags
    pub map_flags: u32,
}

/// The privileged kernel interface the loader drives
///
/// Errors carry the syscall's errno through `io::Error::raw_os_error`.
pub trait Kernel {
    /// Owned descriptor for a kernel bpf object
    type Fd;

    /// Running kernel version in `LINUX_VERSION_CODE` encoding, 0 if unknown
    fn version(&self) -> u32;

    /// System page size in bytes
    fn page_size(&self) -> u32;

    /// Create a map with the given attributes
    fn create_map(&self, req: &MapCreateRequest<'_>) -> io::Result<Self::Fd>;

    /// Load and verify a program
    ///
    /// On failure the kernel writes its verifier log into `log_buf` as a
    /// NUL-terminated string.
    fn load_prog(&self, req: &ProgLoadRequest<'_>, log_buf: &mut [u8]) -> io::Result<Self::Fd>;

    /// Pin an object at a bpffs path
    fn pin(&self, fd: &Self::Fd, path: &Path) -> io::Result<()>;

    /// Retrieve a pinned map read-only
    fn retrieve_map_ro(&self, path: &Path) -> io::Result<Self::Fd>;

    /// Retrieve a pinned program
    fn retrieve_prog(&self, path: &Path) -> io::Result<Self::Fd>;

    /// Whether a pin exists at the path
    fn pin_exists(&self, path: &Path) -> bool;

    /// Change the mode of a pin
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Change the owner of a pin
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Kernel-reported attributes of a map descriptor
    fn map_info(&self, fd: &Self::Fd) -> io::Result<MapInfo>;

    /// Kernel-assigned id of a map descriptor
    fn map_id(&self, fd: &Self::Fd) -> io::Result<u32>;

    /// Kernel-assigned id of a program descriptor
    fn prog_id(&self, fd: &Self::Fd) -> io::Result<u32>;

    /// Raw descriptor value, as patched into map-load instructions
    fn fd_value(&self, fd: &Self::Fd) -> i32;
}
