//! Map creation with reuse-or-create semantics
//!
//! For each record in the `maps` section, either retrieve an existing pin
//! or create a fresh map, validate that the kernel-side attributes agree
//! with the object-declared ones, and pin with the declared owner and
//! mode. Kver-skipped records keep an empty slot so relocation indexes
//! stay aligned with the definition array.

use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::abi::{
    BPF_MAP_TYPE_DEVMAP, BPF_MAP_TYPE_DEVMAP_HASH, BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_RINGBUF,
    KVER_DEVMAP_HASH, MapFlags,
};
use crate::defs::{MapDef, parse_map_defs};
use crate::elf::ElfObject;
use crate::error::{LoadError, LoadResult};
use crate::sys::{Kernel, MapCreateRequest, MapInfo};

/// Effective attributes after kernel-version substitutions
struct EffectiveAttrs {
    map_type: u32,
    max_entries: u32,
    map_flags: u32,
}

/// Derive the attributes actually requested from the kernel
///
/// Three adjustments, all mirroring what the kernel would do or require:
/// device-map-hash degrades to hash on kernels that predate it, ring
/// buffers are clamped up to a page, and device maps carry the implied
/// read-only-from-program flag so the agreement check matches.
fn effective_attrs(def: &MapDef, kvers: u32, page_size: u32) -> EffectiveAttrs {
    let mut map_type = def.map_type;
    if map_type == BPF_MAP_TYPE_DEVMAP_HASH && kvers < KVER_DEVMAP_HASH {
        // Userspace-visible behavior of HASH is the same; programs that
        // redirect through the map are required to be gated to 5.4+.
        map_type = BPF_MAP_TYPE_HASH;
    }

    let mut max_entries = def.max_entries;
    if map_type == BPF_MAP_TYPE_RINGBUF && max_entries < page_size {
        // Declared value is a power of two, so this makes it a page multiple.
        max_entries = page_size;
    }

    let mut map_flags = MapFlags::from_bits_retain(def.map_flags);
    if map_type == BPF_MAP_TYPE_DEVMAP || map_type == BPF_MAP_TYPE_DEVMAP_HASH {
        map_flags |= MapFlags::RDONLY_PROG;
    }

    EffectiveAttrs {
        map_type,
        max_entries,
        map_flags: map_flags.bits(),
    }
}

/// Pin path for a map
///
/// `<root>/<prefix>map_<objname>_<mapname>`, with an empty object segment
/// for maps shared across objects.
fn map_pin_path(root: &Path, prefix: &str, obj_name: &str, map_name: &str, shared: bool) -> PathBuf {
    let obj_seg = if shared { "" } else { obj_name };
    root.join(format!("{prefix}map_{obj_seg}_{map_name}"))
}

fn matches_expectations(name: &str, want: &EffectiveAttrs, def: &MapDef, found: &MapInfo) -> bool {
    if found.map_type == want.map_type
        && found.key_size == def.key_size
        && found.value_size == def.value_size
        && found.max_entries == want.max_entries
        && found.map_flags == want.map_flags
    {
        return true;
    }

    error!(
        "map {name} mismatch: desired/found: type:{}/{} key:{}/{} value:{}/{} entries:{}/{} flags:{:#x}/{:#x}",
        want.map_type,
        found.map_type,
        def.key_size,
        found.key_size,
        def.value_size,
        found.value_size,
        want.max_entries,
        found.max_entries,
        want.map_flags,
        found.map_flags
    );
    false
}

/// Create or reuse every map declared by the object
///
/// The returned vector is indexed identically to the `maps` record array;
/// `None` marks a kernel-version-skipped slot.
pub(crate) fn create_maps<K: Kernel>(
    kernel: &K,
    obj: &ElfObject,
    obj_name: &str,
    root: &Path,
    prefix: &str,
) -> LoadResult<Vec<Option<K::Fd>>> {
    let Some(md_data) = obj.section_by_name("maps")? else {
        return Ok(Vec::new());
    };
    let defs = parse_map_defs(md_data)?;
    let names = obj.section_sym_names("maps", None)?;
    if names.len() != defs.len() {
        return Err(LoadError::Malformed(format!(
            "maps section has {} definitions but {} symbols",
            defs.len(),
            names.len()
        )));
    }

    let kvers = kernel.version();
    let mut map_fds = Vec::with_capacity(defs.len());

    for (def, name) in defs.iter().zip(&names) {
        if def.zero != 0 {
            // Compiler and loader disagree about the record layout; nothing
            // parsed from this section can be trusted.
            return Err(LoadError::Invalid(format!(
                "map {name} definition canary is {:#x}",
                def.zero
            )));
        }

        if kvers < def.min_kver {
            debug!(
                "skipping map {name} which requires kernel version {kvers:#x} >= {:#x}",
                def.min_kver
            );
            map_fds.push(None);
            continue;
        }
        if kvers >= def.max_kver {
            debug!(
                "skipping map {name} which requires kernel version {kvers:#x} < {:#x}",
                def.max_kver
            );
            map_fds.push(None);
            continue;
        }

        let want = effective_attrs(def, kvers, kernel.page_size());
        let pin_path = map_pin_path(root, prefix, obj_name, name, def.shared);

        let mut reuse = false;
        let fd = if kernel.pin_exists(&pin_path) {
            reuse = true;
            let fd = kernel
                .retrieve_map_ro(&pin_path)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "retrieve",
                    path: pin_path.clone(),
                    source,
                })?;
            debug!("reusing map {name}");
            fd
        } else {
            let req = MapCreateRequest {
                map_type: want.map_type,
                key_size: def.key_size,
                value_size: def.value_size,
                max_entries: want.max_entries,
                map_flags: want.map_flags,
                name,
            };
            let fd = kernel
                .create_map(&req)
                .map_err(|source| LoadError::KernelRefused {
                    what: format!("map {name}"),
                    source,
                })?;
            debug!("created map {name}");
            fd
        };

        // The agreement check matters for the reuse path, but runs on fresh
        // maps too; a mismatch means a hostile or stale pin, never something
        // to heal in place.
        let found = kernel
            .map_info(&fd)
            .map_err(|_| LoadError::NotUnique(name.clone()))?;
        if !matches_expectations(name, &want, def, &found) {
            return Err(LoadError::NotUnique(name.clone()));
        }

        if !reuse {
            kernel
                .pin(&fd, &pin_path)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "pin",
                    path: pin_path.clone(),
                    source,
                })?;
            kernel
                .chmod(&pin_path, def.mode)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "chmod",
                    path: pin_path.clone(),
                    source,
                })?;
            kernel
                .chown(&pin_path, def.uid, def.gid)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "chown",
                    path: pin_path.clone(),
                    source,
                })?;
        }

        // Advisory only; a failed id query never fails the run.
        match kernel.map_id(&fd) {
            Ok(id) => debug!("map {} id {id}", pin_path.display()),
            Err(e) => error!("map id query for {name} failed: {e}"),
        }

        map_fds.push(Some(fd));
    }

    Ok(map_fds)
}
