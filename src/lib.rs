//! bpfload - installs compiled bpf objects into the kernel
//!
//! Takes an ELF64 relocatable object containing eBPF bytecode, map
//! definitions, and metadata, and installs its maps and programs through
//! the kernel, pinning each to a well-known bpffs path so other processes
//! can reuse them. Intended to run once per object early during boot from
//! a privileged service.
//!
//! ## Pipeline
//!
//! 1. Read the `critical` tag and `license` sections.
//! 2. Classify code sections by name prefix and collect their bytes,
//!    program definitions, and relocation companions; reject program
//!    types the [`Location`] does not allow.
//! 3. Create or reuse each declared map, validate attribute agreement
//!    against the kernel, and pin with the declared owner and mode.
//! 4. Rewrite map-reference instructions with the assigned descriptors.
//! 5. Load each applicable program, surface the verifier log on
//!    rejection, and pin with mode 0440.
//!
//! ## Collaborators
//!
//! All privileged operations go through the [`Kernel`] trait; the crate
//! itself never invokes bpf(2). Runs are idempotent through pin reuse: a
//! second load of the same object finds its pins and skips creation, and
//! nothing is ever rolled back on failure.

pub mod abi;
pub mod defs;
pub mod elf;
pub mod error;
pub mod insn;
mod maps;
mod progs;
mod relo;
pub mod section;
pub mod sys;

mod loader;

pub use error::{LoadError, LoadResult};
pub use loader::{LoadSummary, Loader, Location, object_name};
pub use section::{DynProgTypeSource, FuseSysfs};
pub use sys::{INVALID_FD, Kernel, MapCreateRequest, MapInfo, ProgLoadRequest};
