//! Shared test fixtures
//!
//! `ObjBuilder` assembles a minimal ELF64 relocatable bpf object in
//! memory: blob sections, packed map/program definition records with
//! their symbols, code sections with a function symbol, and `.rel`
//! companions. `FakeKernel` implements the loader's kernel contract with
//! an in-memory descriptor table and pin namespace, recording everything
//! the loader asks for so scenarios can assert on it.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bpfload::abi::KVER_INF;
use bpfload::defs::{MAP_DEF_SIZE, MapDef, PROG_DEF_SIZE, ProgDef};
use bpfload::insn::BpfInsn;
use bpfload::sys::{Kernel, MapCreateRequest, MapInfo, ProgLoadRequest};

// =============================================================================
// Object Builder
// =============================================================================

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;

struct BuildSection {
    name: String,
    sh_type: u32,
    data: Vec<u8>,
    /// Unresolved relocation entries: (offset, symbol name)
    rels: Vec<(u64, String)>,
}

struct BuildSym {
    name: String,
    section: String,
    value: u64,
    func: bool,
}

/// Builds an ELF64 relocatable object image for loader tests
pub struct ObjBuilder {
    sections: Vec<BuildSection>,
    symbols: Vec<BuildSym>,
}

impl Default for ObjBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Add a raw blob section such as `license` or `critical`
    pub fn section(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(BuildSection {
            name: name.to_string(),
            sh_type: SHT_PROGBITS,
            data: data.to_vec(),
            rels: Vec::new(),
        });
        self
    }

    fn append_to(&mut self, section: &str, bytes: &[u8]) -> u64 {
        if let Some(sec) = self.sections.iter_mut().find(|s| s.name == section) {
            let off = sec.data.len() as u64;
            sec.data.extend_from_slice(bytes);
            return off;
        }
        self.sections.push(BuildSection {
            name: section.to_string(),
            sh_type: SHT_PROGBITS,
            data: bytes.to_vec(),
            rels: Vec::new(),
        });
        0
    }

    /// Append a map definition record and its symbol
    pub fn map(mut self, name: &str, def: &MapDef) -> Self {
        let off = self.append_to("maps", &encode_map_def(def));
        self.symbols.push(BuildSym {
            name: name.to_string(),
            section: "maps".to_string(),
            value: off,
            func: false,
        });
        self
    }

    /// Append a program definition record and its `<symbol>_def` symbol
    pub fn prog_def(mut self, def_sym: &str, def: &ProgDef) -> Self {
        let off = self.append_to("progs", &encode_prog_def(def));
        self.symbols.push(BuildSym {
            name: def_sym.to_string(),
            section: "progs".to_string(),
            value: off,
            func: false,
        });
        self
    }

    /// Add a code section with one function symbol at its start
    pub fn code(mut self, section: &str, func: &str, insns: &[BpfInsn]) -> Self {
        let data: Vec<u8> = insns.iter().flat_map(|i| i.to_bytes()).collect();
        self.sections.push(BuildSection {
            name: section.to_string(),
            sh_type: SHT_PROGBITS,
            data,
            rels: Vec::new(),
        });
        self.symbols.push(BuildSym {
            name: func.to_string(),
            section: section.to_string(),
            value: 0,
            func: true,
        });
        self
    }

    /// Add the `.rel` companion directly after its code section
    pub fn rel(mut self, code_section: &str, entries: &[(u64, &str)]) -> Self {
        self.sections.push(BuildSection {
            name: format!(".rel{code_section}"),
            sh_type: SHT_REL,
            data: Vec::new(),
            rels: entries
                .iter()
                .map(|(off, sym)| (*off, sym.to_string()))
                .collect(),
        });
        self
    }

    /// Like [`Self::rel`], but with numeric symbol indices taken as-is
    ///
    /// Lets a test emit entries whose symbol index points outside the
    /// symbol table.
    pub fn rel_raw(mut self, code_section: &str, entries: &[(u64, u64)]) -> Self {
        let mut data = Vec::new();
        for (off, sym_index) in entries {
            data.extend_from_slice(&off.to_le_bytes());
            let r_info = (sym_index << 32) | 1;
            data.extend_from_slice(&r_info.to_le_bytes());
        }
        self.sections.push(BuildSection {
            name: format!(".rel{code_section}"),
            sh_type: SHT_REL,
            data,
            rels: Vec::new(),
        });
        self
    }

    /// Assemble the object image
    pub fn build(self) -> Vec<u8> {
        let Self {
            mut sections,
            symbols,
        } = self;

        // Symbol indices are positions in the symtab; slot 0 is the null
        // symbol, so named symbols start at 1.
        let sym_index = |name: &str| -> u64 {
            1 + symbols
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("unknown symbol {name}")) as u64
        };

        for sec in &mut sections {
            for (off, sym) in std::mem::take(&mut sec.rels) {
                sec.data.extend_from_slice(&off.to_le_bytes());
                let r_info = (sym_index(&sym) << 32) | 1;
                sec.data.extend_from_slice(&r_info.to_le_bytes());
            }
        }

        // Final section order: null, user sections, .symtab, .shstrtab.
        let section_index = |name: &str| -> u16 {
            1 + sections
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("unknown section {name}")) as u16
        };

        // String table holds every section and symbol name.
        let mut strtab = vec![0u8];
        let mut name_offs: HashMap<String, u32> = HashMap::new();
        let mut intern = |strtab: &mut Vec<u8>, name: &str| -> u32 {
            *name_offs.entry(name.to_string()).or_insert_with(|| {
                let off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                off
            })
        };

        let mut symtab = vec![0u8; 24];
        for sym in &symbols {
            let name_off = intern(&mut strtab, &sym.name);
            let mut entry = [0u8; 24];
            entry[0..4].copy_from_slice(&name_off.to_le_bytes());
            entry[4] = if sym.func { 0x12 } else { 0x11 };
            entry[6..8].copy_from_slice(&section_index(&sym.section).to_le_bytes());
            entry[8..16].copy_from_slice(&sym.value.to_le_bytes());
            symtab.extend_from_slice(&entry);
        }

        sections.push(BuildSection {
            name: ".symtab".to_string(),
            sh_type: SHT_SYMTAB,
            data: symtab,
            rels: Vec::new(),
        });

        let mut headers: Vec<(u32, u32, u64, u64)> = vec![(0, 0, 0, 0)];

        let mut image = vec![0u8; 64];
        image[0] = 0x7f;
        image[1..4].copy_from_slice(b"ELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // ELFDATA2LSB

        for sec in &sections {
            let name_off = intern(&mut strtab, &sec.name);
            while image.len() % 8 != 0 {
                image.push(0);
            }
            let off = image.len() as u64;
            image.extend_from_slice(&sec.data);
            headers.push((name_off, sec.sh_type, off, sec.data.len() as u64));
        }

        // .shstrtab goes last; intern its own name before freezing.
        let shstr_name = intern(&mut strtab, ".shstrtab");
        while image.len() % 8 != 0 {
            image.push(0);
        }
        headers.push((shstr_name, SHT_STRTAB, image.len() as u64, strtab.len() as u64));
        image.extend_from_slice(&strtab);

        while image.len() % 8 != 0 {
            image.push(0);
        }
        let shoff = image.len() as u64;
        for (name_off, sh_type, off, size) in &headers {
            let mut sh = [0u8; 64];
            sh[0..4].copy_from_slice(&name_off.to_le_bytes());
            sh[4..8].copy_from_slice(&sh_type.to_le_bytes());
            sh[24..32].copy_from_slice(&off.to_le_bytes());
            sh[32..40].copy_from_slice(&size.to_le_bytes());
            image.extend_from_slice(&sh);
        }

        image[40..48].copy_from_slice(&shoff.to_le_bytes());
        image[58..60].copy_from_slice(&64u16.to_le_bytes());
        image[60..62].copy_from_slice(&(headers.len() as u16).to_le_bytes());
        image[62..64].copy_from_slice(&((headers.len() - 1) as u16).to_le_bytes());

        image
    }

    /// Assemble and write the object to a file under a temp directory
    pub fn write(self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

pub fn encode_map_def(def: &MapDef) -> Vec<u8> {
    let mut rec = vec![0u8; MAP_DEF_SIZE];
    for (off, v) in [
        (0, def.map_type),
        (4, def.key_size),
        (8, def.value_size),
        (12, def.max_entries),
        (16, def.map_flags),
        (20, def.uid),
        (24, def.gid),
        (28, def.mode),
        (32, def.min_kver),
        (36, def.max_kver),
        (108, def.zero),
    ] {
        rec[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    rec[40..72].copy_from_slice(&def.pin_subdir);
    rec[72..104].copy_from_slice(&def.selinux_context);
    rec[104] = def.shared as u8;
    rec
}

pub fn encode_prog_def(def: &ProgDef) -> Vec<u8> {
    let mut rec = vec![0u8; PROG_DEF_SIZE];
    rec[0..4].copy_from_slice(&def.uid.to_le_bytes());
    rec[4..8].copy_from_slice(&def.gid.to_le_bytes());
    rec[8..12].copy_from_slice(&def.min_kver.to_le_bytes());
    rec[12..16].copy_from_slice(&def.max_kver.to_le_bytes());
    rec[16] = def.optional as u8;
    rec
}

/// A map definition with open version bounds and root-owned 0600 pin
pub fn map_def() -> MapDef {
    MapDef {
        map_type: bpfload::abi::BPF_MAP_TYPE_HASH,
        key_size: 4,
        value_size: 4,
        max_entries: 16,
        map_flags: 0,
        uid: 0,
        gid: 0,
        mode: 0o600,
        min_kver: 0,
        max_kver: KVER_INF,
        pin_subdir: [0; 32],
        selinux_context: [0; 32],
        shared: false,
        zero: 0,
    }
}

/// A program definition with open version bounds
pub fn prog_def() -> ProgDef {
    ProgDef {
        uid: 0,
        gid: 0,
        min_kver: 0,
        max_kver: KVER_INF,
        optional: false,
    }
}

/// The smallest valid program: return 0
pub fn ret0() -> Vec<BpfInsn> {
    use bpfload::insn::{BPF_ALU64, BPF_EXIT, BPF_JMP, BPF_K, BPF_MOV};
    vec![
        BpfInsn::new(BPF_ALU64 | BPF_MOV | BPF_K, 0, 0, 0, 0),
        BpfInsn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0),
    ]
}

// =============================================================================
// Fake Kernel
// =============================================================================

/// One object held by the fake descriptor table or a pin
#[derive(Debug, Clone)]
pub enum FakeObject {
    Map {
        info: MapInfo,
        name: String,
        id: u32,
    },
    Prog {
        name: String,
        id: u32,
    },
}

/// A pinned object with its filesystem metadata
#[derive(Debug, Clone)]
pub struct FakePin {
    pub object: FakeObject,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Everything the loader asked of one program-load call
#[derive(Debug, Clone)]
pub struct LoadRecord {
    pub name: String,
    pub prog_type: u32,
    pub expected_attach_type: u32,
    pub kern_version: u32,
    pub license: String,
    pub insns: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    version: u32,
    page_size: u32,
    next_fd: i32,
    next_id: u32,
    objects: HashMap<i32, FakeObject>,
    pins: HashMap<PathBuf, FakePin>,
    load_calls: Vec<LoadRecord>,
    created_maps: Vec<String>,
    fail_loads: HashSet<String>,
}

/// Owned descriptor handed out by [`FakeKernel`]
#[derive(Debug)]
pub struct FakeFd(pub i32);

/// In-memory implementation of the loader's kernel contract
#[derive(Clone)]
pub struct FakeKernel {
    state: Rc<RefCell<FakeState>>,
}

impl FakeKernel {
    pub fn new(version: u32, page_size: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState {
                version,
                page_size,
                next_fd: 3,
                next_id: 1,
                ..FakeState::default()
            })),
        }
    }

    /// Make the next load of the named program fail verification
    pub fn fail_load(&self, name: &str) {
        self.state.borrow_mut().fail_loads.insert(name.to_string());
    }

    /// Seed a pre-existing map pin, as a previous run would have left it
    pub fn seed_map_pin(&self, path: &Path, info: MapInfo) {
        let mut st = self.state.borrow_mut();
        let id = st.next_id;
        st.next_id += 1;
        st.pins.insert(
            path.to_path_buf(),
            FakePin {
                object: FakeObject::Map {
                    info,
                    name: String::new(),
                    id,
                },
                mode: 0o600,
                uid: 0,
                gid: 0,
            },
        );
    }

    pub fn pin_entry(&self, path: &Path) -> Option<FakePin> {
        self.state.borrow().pins.get(path).cloned()
    }

    pub fn pin_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.state.borrow().pins.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn load_calls(&self) -> Vec<LoadRecord> {
        self.state.borrow().load_calls.clone()
    }

    pub fn created_maps(&self) -> Vec<String> {
        self.state.borrow().created_maps.clone()
    }

    fn alloc(&self, object: FakeObject) -> FakeFd {
        let mut st = self.state.borrow_mut();
        let fd = st.next_fd;
        st.next_fd += 1;
        st.objects.insert(fd, object);
        FakeFd(fd)
    }

    fn object(&self, fd: &FakeFd) -> io::Result<FakeObject> {
        self.state
            .borrow()
            .objects
            .get(&fd.0)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(9)) // EBADF
    }
}

impl Kernel for FakeKernel {
    type Fd = FakeFd;

    fn version(&self) -> u32 {
        self.state.borrow().version
    }

    fn page_size(&self) -> u32 {
        self.state.borrow().page_size
    }

    fn create_map(&self, req: &MapCreateRequest<'_>) -> io::Result<Self::Fd> {
        let id = {
            let mut st = self.state.borrow_mut();
            st.created_maps.push(req.name.to_string());
            let id = st.next_id;
            st.next_id += 1;
            id
        };
        Ok(self.alloc(FakeObject::Map {
            info: MapInfo {
                map_type: req.map_type,
                key_size: req.key_size,
                value_size: req.value_size,
                max_entries: req.max_entries,
                map_flags: req.map_flags,
            },
            name: req.name.to_string(),
            id,
        }))
    }

    fn load_prog(&self, req: &ProgLoadRequest<'_>, log_buf: &mut [u8]) -> io::Result<Self::Fd> {
        let rejected = self.state.borrow().fail_loads.contains(req.name);

        self.state.borrow_mut().load_calls.push(LoadRecord {
            name: req.name.to_string(),
            prog_type: req.prog_type,
            expected_attach_type: req.expected_attach_type,
            kern_version: req.kern_version,
            license: req.license.to_string(),
            insns: req.insns.to_vec(),
        });

        if rejected {
            let log = b"R0 invalid mem access\nprocessed 2 insns\0";
            log_buf[..log.len()].copy_from_slice(log);
            return Err(io::Error::from_raw_os_error(13)); // EACCES
        }

        let id = {
            let mut st = self.state.borrow_mut();
            let id = st.next_id;
            st.next_id += 1;
            id
        };
        Ok(self.alloc(FakeObject::Prog {
            name: req.name.to_string(),
            id,
        }))
    }

    fn pin(&self, fd: &Self::Fd, path: &Path) -> io::Result<()> {
        let object = self.object(fd)?;
        let mut st = self.state.borrow_mut();
        if st.pins.contains_key(path) {
            return Err(io::Error::from_raw_os_error(17)); // EEXIST
        }
        st.pins.insert(
            path.to_path_buf(),
            FakePin {
                object,
                mode: 0o600,
                uid: 0,
                gid: 0,
            },
        );
        Ok(())
    }

    fn retrieve_map_ro(&self, path: &Path) -> io::Result<Self::Fd> {
        let pin = self
            .pin_entry(path)
            .ok_or_else(|| io::Error::from_raw_os_error(2))?; // ENOENT
        match pin.object {
            FakeObject::Map { .. } => Ok(self.alloc(pin.object)),
            FakeObject::Prog { .. } => Err(io::Error::from_raw_os_error(22)),
        }
    }

    fn retrieve_prog(&self, path: &Path) -> io::Result<Self::Fd> {
        let pin = self
            .pin_entry(path)
            .ok_or_else(|| io::Error::from_raw_os_error(2))?;
        match pin.object {
            FakeObject::Prog { .. } => Ok(self.alloc(pin.object)),
            FakeObject::Map { .. } => Err(io::Error::from_raw_os_error(22)),
        }
    }

    fn pin_exists(&self, path: &Path) -> bool {
        self.state.borrow().pins.contains_key(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        let pin = st
            .pins
            .get_mut(path)
            .ok_or_else(|| io::Error::from_raw_os_error(2))?;
        pin.mode = mode;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        let pin = st
            .pins
            .get_mut(path)
            .ok_or_else(|| io::Error::from_raw_os_error(2))?;
        pin.uid = uid;
        pin.gid = gid;
        Ok(())
    }

    fn map_info(&self, fd: &Self::Fd) -> io::Result<MapInfo> {
        match self.object(fd)? {
            FakeObject::Map { info, .. } => Ok(info),
            FakeObject::Prog { .. } => Err(io::Error::from_raw_os_error(22)),
        }
    }

    fn map_id(&self, fd: &Self::Fd) -> io::Result<u32> {
        match self.object(fd)? {
            FakeObject::Map { id, .. } => Ok(id),
            FakeObject::Prog { .. } => Err(io::Error::from_raw_os_error(22)),
        }
    }

    fn prog_id(&self, fd: &Self::Fd) -> io::Result<u32> {
        match self.object(fd)? {
            FakeObject::Prog { id, .. } => Ok(id),
            FakeObject::Map { .. } => Err(io::Error::from_raw_os_error(22)),
        }
    }

    fn fd_value(&self, fd: &Self::Fd) -> i32 {
        fd.0
    }
}

/// A unique scratch directory for object files, removed on drop
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!("bpfload-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
