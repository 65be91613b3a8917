//! Map-descriptor relocation
//!
//! Rewrites the wide-load instructions that reference maps symbolically so
//! their immediate carries the descriptor assigned during map creation and
//! their source register carries the pseudo-map-fd tag. This is the only
//! mutation ever applied to program bytes.

use log::{error, warn};

use crate::elf::ElfObject;
use crate::error::LoadResult;
use crate::insn::{BPF_LD_MAP_IMM, BPF_PSEUDO_MAP_FD, BpfInsn, INSN_SIZE};
use crate::progs::CodeSection;
use crate::sys::{INVALID_FD, Kernel};

/// Size of one Elf64_Rel entry
const REL_SIZE: usize = 16;

/// Patch the instruction at `offset` with a map descriptor
///
/// Returns false (and logs) when the offset is out of range or the
/// instruction is not the map-reference wide load.
fn apply_relo(data: &mut [u8], offset: u64, fd: i32) -> bool {
    let insn_index = offset as usize / INSN_SIZE;
    let start = insn_index * INSN_SIZE;
    let Some(bytes) = data.get(start..start + INSN_SIZE) else {
        error!("relocation offset {offset} outside code section");
        return false;
    };

    let mut insn = BpfInsn::from_bytes(bytes.try_into().unwrap());
    if insn.code != BPF_LD_MAP_IMM {
        error!(
            "invalid relo for insn {insn_index}: code {:#04x}",
            insn.code
        );
        return false;
    }

    insn.imm = fd;
    insn.set_src_reg(BPF_PSEUDO_MAP_FD);
    data[start..start + INSN_SIZE].copy_from_slice(&insn.to_bytes());
    true
}

/// Apply every map relocation in every collected code section
pub(crate) fn apply_map_relocations<K: Kernel>(
    kernel: &K,
    obj: &ElfObject,
    map_fds: &[Option<K::Fd>],
    sections: &mut [CodeSection],
) -> LoadResult<()> {
    let map_names = if obj.section_by_name("maps")?.is_some() {
        obj.section_sym_names("maps", None)?
    } else {
        Vec::new()
    };

    for sec in sections.iter_mut() {
        // Truncated trailing bytes carry no complete entry.
        for rel in sec.rel_data.chunks_exact(REL_SIZE) {
            let r_offset = u64::from_le_bytes(rel[0..8].try_into().unwrap());
            let r_info = u64::from_le_bytes(rel[8..16].try_into().unwrap());
            let sym_index = (r_info >> 32) as usize;

            // A symbol index the table cannot resolve abandons the pass;
            // program loading still proceeds with whatever was applied.
            let sym_name = match obj.sym_name_by_idx(sym_index) {
                Ok(name) => name,
                Err(e) => {
                    warn!(
                        "cannot resolve relocation symbol {sym_index} in {}: {e}",
                        sec.name
                    );
                    return Ok(());
                }
            };

            // Relocations against non-map symbols are left untouched.
            let Some(slot) = map_names.iter().position(|n| *n == sym_name) else {
                continue;
            };

            let fd = match &map_fds[slot] {
                Some(fd) => kernel.fd_value(fd),
                None => {
                    warn!(
                        "relocation in {} references kernel-version-skipped map {sym_name}",
                        sec.name
                    );
                    INVALID_FD
                }
            };
            apply_relo(&mut sec.data, r_offset, fd);
        }
    }

    Ok(())
}
