//! Code-section collection and program loading
//!
//! Collection walks every section of the object, keeps the ones whose
//! name classifies to a program type, and gathers everything a later load
//! needs: instruction bytes, the companion relocation section, and the
//! program definition found through the section's first function symbol.
//!
//! Loading gates each collected section by kernel version, reuses an
//! existing pin when one is present, and otherwise submits the program to
//! the kernel, surfacing the verifier log line by line on rejection.

use std::path::Path;

use log::{debug, error, warn};

use crate::abi::BPF_PROG_TYPE_UNSPEC;
use crate::defs::{ProgDef, parse_prog_defs};
use crate::elf::{ElfObject, STT_FUNC};
use crate::error::{LoadError, LoadResult};
use crate::section::{
    DynProgTypeSource, expected_attach_type, is_allowed, section_name_of, section_prog_type,
};
use crate::sys::{Kernel, ProgLoadRequest};

/// Verifier log buffer size in bytes
const LOAD_LOG_SIZE: usize = 0xfffff;

/// Mode applied to every program pin
const PROG_PIN_MODE: u32 = 0o440;

/// One code section retained for loading
#[derive(Debug)]
pub struct CodeSection {
    /// Program type (BPF_PROG_TYPE_*)
    pub prog_type: u32,
    /// Attach type the kernel expects at load time
    pub expected_attach_type: u32,
    /// Canonical name: section name with `/` replaced by `_`
    pub name: String,
    /// Raw instruction bytes; relocation mutates these in place
    pub data: Vec<u8>,
    /// Companion `.rel` section bytes, empty when absent
    pub rel_data: Vec<u8>,
    /// Program definition, absent when no `<symbol>_def` record matched
    pub prog_def: Option<ProgDef>,
}

/// Collect every program-typed code section of the object
pub(crate) fn read_code_sections(
    obj: &ElfObject,
    allowed: Option<&[u32]>,
    dynamic: &dyn DynProgTypeSource,
) -> LoadResult<Vec<CodeSection>> {
    let table = obj.section_headers()?;

    let prog_defs = match obj.section_by_name("progs")? {
        Some(data) => parse_prog_defs(data)?,
        None => Vec::new(),
    };
    let prog_def_names = if prog_defs.is_empty() {
        Vec::new()
    } else {
        obj.section_sym_names("progs", None)?
    };

    let mut sections = Vec::new();

    for (i, sh) in table.iter().enumerate() {
        let orig_name = obj.sym_name(sh.name_off)?;

        let prog_type = section_prog_type(&orig_name, dynamic);
        if prog_type == BPF_PROG_TYPE_UNSPEC {
            continue;
        }

        if !is_allowed(prog_type, allowed, dynamic) {
            let type_name = section_name_of(prog_type);
            error!("program type {type_name} not permitted here");
            return Err(LoadError::PermissionDenied(type_name));
        }

        // Resolved before slashes become underscores.
        let attach_type = expected_attach_type(&orig_name);
        let name = orig_name.replace('/', "_");

        let data = obj.section_data(i)?.to_vec();
        debug!("loaded code section {i} ({name})");

        let fn_syms = obj.section_sym_names(&orig_name, Some(STT_FUNC))?;
        let prog_def = fn_syms.first().and_then(|first| {
            let want = format!("{first}_def");
            prog_def_names
                .iter()
                .zip(&prog_defs)
                .find(|(def_name, _)| **def_name == want)
                .map(|(_, def)| *def)
        });

        let mut rel_data = Vec::new();
        if !data.is_empty()
            && let Some(next) = table.get(i + 1)
            && obj.sym_name(next.name_off)? == format!(".rel{orig_name}")
        {
            rel_data = obj.section_data(i + 1)?.to_vec();
            debug!("loaded relocation section for {name}");
        }

        if !data.is_empty() {
            sections.push(CodeSection {
                prog_type,
                expected_attach_type: attach_type,
                name,
                data,
                rel_data,
                prog_def,
            });
        }
    }

    Ok(sections)
}

/// Split the NUL-terminated verifier log and emit one line per fragment
fn emit_verifier_log(name: &str, log_buf: &[u8]) {
    let end = log_buf.iter().position(|&b| b == 0).unwrap_or(log_buf.len());
    let text = String::from_utf8_lossy(&log_buf[..end]);

    warn!("verifier log for {name} - begin");
    for line in text.split('\n') {
        warn!("{line}");
    }
    warn!("verifier log for {name} - end");
}

/// Load and pin every applicable collected section
pub(crate) fn load_code_sections<K: Kernel>(
    kernel: &K,
    sections: &[CodeSection],
    license: &str,
    obj_name: &str,
    root: &Path,
    prefix: &str,
) -> LoadResult<()> {
    let kvers = kernel.version();
    if kvers == 0 {
        error!("unable to get kernel version");
        return Err(LoadError::Invalid("unknown kernel version".into()));
    }

    for (i, sec) in sections.iter().enumerate() {
        let Some(def) = &sec.prog_def else {
            error!("[{i}] '{}' missing program definition", sec.name);
            return Err(LoadError::Invalid(format!(
                "program {} has no definition record",
                sec.name
            )));
        };

        if kvers < def.min_kver || kvers >= def.max_kver {
            debug!(
                "skipping program {} min_kver:{:#x} max_kver:{:#x} (kvers:{kvers:#x})",
                sec.name, def.min_kver, def.max_kver
            );
            continue;
        }

        // A `$suffix` distinguishes kernel-version variants of the same
        // program; all variants share one pin name.
        let pin_name = match sec.name.rfind('$') {
            Some(at) => &sec.name[..at],
            None => sec.name.as_str(),
        };
        let pin_path = root.join(format!("{prefix}prog_{obj_name}_{pin_name}"));

        let mut reuse = false;
        let fd = if kernel.pin_exists(&pin_path) {
            reuse = true;
            let fd = kernel
                .retrieve_prog(&pin_path)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "retrieve",
                    path: pin_path.clone(),
                    source,
                })?;
            debug!("reusing program {}", pin_path.display());
            fd
        } else {
            let mut log_buf = vec![0u8; LOAD_LOG_SIZE];
            let req = ProgLoadRequest {
                prog_type: sec.prog_type,
                expected_attach_type: sec.expected_attach_type,
                kern_version: kvers,
                license,
                insns: &sec.data,
                name: &sec.name,
            };

            match kernel.load_prog(&req, &mut log_buf) {
                Ok(fd) => fd,
                Err(source) => {
                    warn!("program load for {} failed: {source}", sec.name);
                    emit_verifier_log(&sec.name, &log_buf);

                    if def.optional {
                        warn!("failed program is marked optional - continuing...");
                        continue;
                    }
                    error!("non-optional program failed to load");
                    return Err(LoadError::KernelRefused {
                        what: format!("program {}", sec.name),
                        source,
                    });
                }
            }
        };

        if !reuse {
            kernel
                .pin(&fd, &pin_path)
                .map_err(|source| LoadError::FilesystemOp {
                    op: "pin",
                    path: pin_path.clone(),
                    source,
                })?;
            kernel
                .chmod(&pin_path, PROG_PIN_MODE)
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
        match kernel.prog_id(&fd) {
            Ok(id) => debug!("prog {} id {id}", pin_path.display()),
            Err(e) => error!("prog id query for {} failed: {e}", sec.name),
        }
    }

    Ok(())
}
