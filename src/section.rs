//! Section-name classification
//!
//! A code section's name prefix determines its program type and expected
//! attach type via a fixed table scanned in declaration order. The `fuse/`
//! prefix is special: its program type is only known at runtime, so it is
//! resolved through a pluggable [`DynProgTypeSource`].

use std::path::Path;

use crate::abi::{
    BPF_ATTACH_TYPE_UNSPEC, BPF_PROG_TYPE_KPROBE, BPF_PROG_TYPE_PERF_EVENT,
    BPF_PROG_TYPE_SOCKET_FILTER, BPF_PROG_TYPE_TRACEPOINT, BPF_PROG_TYPE_UNSPEC,
};

/// One entry of the section-name prefix table
#[derive(Debug, Clone, Copy)]
pub struct SectionType {
    /// Section name prefix, including the trailing slash
    pub prefix: &'static str,
    /// Program type loaded from sections with this prefix
    pub prog_type: u32,
    /// Attach type the kernel expects at load time
    pub expected_attach_type: u32,
}

/// Prefix table; first match wins
pub const SECTION_NAME_TYPES: [SectionType; 7] = [
    SectionType { prefix: "kprobe/", prog_type: BPF_PROG_TYPE_KPROBE, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "kretprobe/", prog_type: BPF_PROG_TYPE_KPROBE, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "perf_event/", prog_type: BPF_PROG_TYPE_PERF_EVENT, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "skfilter/", prog_type: BPF_PROG_TYPE_SOCKET_FILTER, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "tracepoint/", prog_type: BPF_PROG_TYPE_TRACEPOINT, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "uprobe/", prog_type: BPF_PROG_TYPE_KPROBE, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
    SectionType { prefix: "uretprobe/", prog_type: BPF_PROG_TYPE_KPROBE, expected_attach_type: BPF_ATTACH_TYPE_UNSPEC },
];

/// Prefix whose program type is resolved at runtime
const FUSE_PREFIX: &str = "fuse/";

/// Runtime source of the dynamically assigned program type
///
/// The fuse program type is not a fixed uapi value yet; the kernel
/// advertises it through a virtual file. Implementations may read that
/// file, return a constant, or anything else.
pub trait DynProgTypeSource {
    /// The current dynamic program type, or `BPF_PROG_TYPE_UNSPEC`
    fn prog_type(&self) -> u32;
}

/// Default source: reads the fuse type from sysfs
///
/// Absent or unparseable content yields `BPF_PROG_TYPE_UNSPEC`, which
/// makes `fuse/` sections non-program sections.
pub struct FuseSysfs;

/// Virtual file advertising the fuse program type
const FUSE_PROG_TYPE_PATH: &str = "/sys/fs/fuse/bpf_prog_type_fuse";

impl DynProgTypeSource for FuseSysfs {
    fn prog_type(&self) -> u32 {
        std::fs::read_to_string(Path::new(FUSE_PROG_TYPE_PATH))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(BPF_PROG_TYPE_UNSPEC)
    }
}

/// Program type for a section name, or `BPF_PROG_TYPE_UNSPEC`
pub fn section_prog_type(name: &str, dynamic: &dyn DynProgTypeSource) -> u32 {
    for snt in &SECTION_NAME_TYPES {
        if name.starts_with(snt.prefix) {
            return snt.prog_type;
        }
    }
    if name.starts_with(FUSE_PREFIX) {
        return dynamic.prog_type();
    }
    BPF_PROG_TYPE_UNSPEC
}

/// Attach type the kernel expects for a section name
pub fn expected_attach_type(name: &str) -> u32 {
    for snt in &SECTION_NAME_TYPES {
        if name.starts_with(snt.prefix) {
            return snt.expected_attach_type;
        }
    }
    BPF_ATTACH_TYPE_UNSPEC
}

/// Section-name prefix for a program type, for diagnostics
pub fn section_name_of(prog_type: u32) -> String {
    for snt in &SECTION_NAME_TYPES {
        if snt.prog_type == prog_type {
            return snt.prefix.to_string();
        }
    }
    format!("UNKNOWN SECTION NAME {prog_type}")
}

/// Whether a program type is permitted by the allow-list
///
/// `None` permits everything. A list containing `BPF_PROG_TYPE_UNSPEC`
/// additionally permits the runtime-resolved dynamic type.
pub fn is_allowed(prog_type: u32, allowed: Option<&[u32]>, dynamic: &dyn DynProgTypeSource) -> bool {
    let Some(allowed) = allowed else { return true };

    for &a in allowed {
        if a == BPF_PROG_TYPE_UNSPEC {
            if prog_type == dynamic.prog_type() {
                return true;
            }
        } else if prog_type == a {
            return true;
        }
    }
    false
}
