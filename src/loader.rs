//! Load orchestration
//!
//! [`Loader`] drives one object end to end: read the criticality tag and
//! license, collect code sections (rejecting disallowed program types
//! before any map is touched), create and pin maps, apply map
//! relocations, then load and pin programs. A run is one-shot; pins left
//! by earlier runs are reused, never rolled back.

use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::elf::ElfObject;
use crate::error::{LoadError, LoadResult};
use crate::maps::create_maps;
use crate::progs::{load_code_sections, read_code_sections};
use crate::relo::apply_map_relocations;
use crate::section::{DynProgTypeSource, FuseSysfs};
use crate::sys::Kernel;

/// Default bpffs mount point
const BPF_FS_PATH: &str = "/sys/fs/bpf/";

/// Where and what a load run is allowed to install
#[derive(Debug, Clone, Default)]
pub struct Location {
    /// Pin path prefix under the bpffs root
    pub prefix: String,
    /// Permitted program types; `None` permits all
    pub allowed_types: Option<Vec<u32>>,
}

/// Outcome of a successful load
#[derive(Debug, Clone, Copy)]
pub struct LoadSummary {
    /// The object carries a `critical` section
    pub critical: bool,
}

/// Installs the maps and programs of bpf objects through a [`Kernel`]
pub struct Loader<K: Kernel> {
    kernel: K,
    root: PathBuf,
    dynamic_type: Box<dyn DynProgTypeSource>,
}

impl<K: Kernel> Loader<K> {
    /// A loader pinning under `/sys/fs/bpf/` with the sysfs fuse source
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            root: PathBuf::from(BPF_FS_PATH),
            dynamic_type: Box::new(FuseSysfs),
        }
    }

    /// Override the bpffs root (primarily for test fixtures)
    pub fn bpffs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Override the dynamic program-type source
    pub fn dynamic_type_source(mut self, source: Box<dyn DynProgTypeSource>) -> Self {
        self.dynamic_type = source;
        self
    }

    /// Whether the object at `path` is marked critical
    ///
    /// Reads only the `critical` section, so callers can classify an
    /// object even when its load failed.
    pub fn is_critical(&self, path: &Path) -> LoadResult<bool> {
        let obj = ElfObject::open(path)?;
        Ok(obj.section_by_name("critical")?.is_some())
    }

    /// Install every applicable map and program of the object at `path`
    pub fn load(&self, path: &Path, location: &Location) -> LoadResult<LoadSummary> {
        let obj = ElfObject::open(path)?;
        let obj_name = object_name(path);

        let critical_tag = obj.section_by_name("critical")?.map(cstr);
        let license = match obj.section_by_name("license")? {
            Some(bytes) => cstr(bytes),
            None => {
                error!("couldn't find license in {}", path.display());
                return Err(LoadError::Malformed(format!(
                    "no license section in {}",
                    path.display()
                )));
            }
        };

        match &critical_tag {
            Some(tag) => info!(
                "loading critical for {tag} object {} with license {license}",
                path.display()
            ),
            None => info!(
                "loading optional object {} with license {license}",
                path.display()
            ),
        }

        let mut sections = read_code_sections(
            &obj,
            location.allowed_types.as_deref(),
            &*self.dynamic_type,
        )
        .inspect_err(|_| error!("couldn't read all code sections in {}", path.display()))?;

        let map_fds = create_maps(&self.kernel, &obj, &obj_name, &self.root, &location.prefix)
            .inspect_err(|e| error!("failed to create maps in {}: {e}", path.display()))?;

        for (i, fd) in map_fds.iter().enumerate() {
            match fd {
                Some(fd) => debug!("map slot {i} fd {}", self.kernel.fd_value(fd)),
                None => debug!("map slot {i} skipped"),
            }
        }

        apply_map_relocations(&self.kernel, &obj, &map_fds, &mut sections)?;

        load_code_sections(
            &self.kernel,
            &sections,
            &license,
            &obj_name,
            &self.root,
            &location.prefix,
        )
        .inspect_err(|e| error!("failed to load programs in {}: {e}", path.display()))?;

        Ok(LoadSummary {
            critical: critical_tag.is_some(),
        })
    }
}

/// Object name used in pin paths
///
/// The file's basename with its final extension removed and any trailing
/// `@<tag>` stripped, so `dir/foo@1.o` and `dir/foo.o` both name `foo`.
/// The `@` form lets several builds of one object coexist on disk.
pub fn object_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match file.rfind('.') {
        Some(at) => &file[..at],
        None => file.as_str(),
    };
    let stem = match stem.rfind('@') {
        Some(at) => &stem[..at],
        None => stem,
    };
    stem.to_string()
}

/// Bytes up to the first NUL as a string
fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
