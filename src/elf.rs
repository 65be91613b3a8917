//! ELF64 relocatable-object reader
//!
//! Random-access reads over an in-memory image of a bpf object file: the
//! ELF header, the section table, named/typed sections, and the symbol
//! table. All operations are pure reads; nothing is cached between calls.
//!
//! Symbol and section names both resolve through the section-header string
//! table, which is where the objects this loader consumes keep all names.

use log::{debug, error, warn};

use crate::error::{LoadError, LoadResult};

/// ELF magic number
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// Section type: symbol table
pub const SHT_SYMTAB: u32 = 2;

/// Symbol type: function
pub const STT_FUNC: u8 = 2;

/// Size of the ELF64 file header
const EHDR_SIZE: usize = 64;

/// Size of one ELF64 section header
const SHDR_SIZE: usize = 64;

/// Size of one ELF64 symbol table entry
const SYM_SIZE: usize = 24;

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().unwrap())
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

fn le64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

/// The ELF64 header fields the loader consumes
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    /// Section header table file offset
    pub shoff: u64,
    /// Size of one section header entry
    pub shentsize: u16,
    /// Number of section headers
    pub shnum: u16,
    /// Index of the section-header string table
    pub shstrndx: u16,
}

/// One ELF64 section header
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    /// Offset of the section name in the section-header string table
    pub name_off: u32,
    /// Section type (SHT_*)
    pub sh_type: u32,
    /// Section data file offset
    pub offset: u64,
    /// Section data size in bytes
    pub size: u64,
}

/// One ELF64 symbol table entry
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    /// Offset of the symbol name in the section-header string table
    pub name_off: u32,
    /// Symbol type and binding
    pub info: u8,
    /// Index of the section this symbol is defined in
    pub shndx: u16,
    /// Symbol value (offset within its section for relocatables)
    pub value: u64,
}

impl Symbol {
    /// Symbol type (low nibble of `info`)
    #[inline]
    pub fn sym_type(&self) -> u8 {
        self.info & 0x0f
    }
}

/// An ELF64 relocatable object held in memory
pub struct ElfObject {
    data: Vec<u8>,
}

impl ElfObject {
    /// Read an object file into memory
    pub fn open(path: &std::path::Path) -> LoadResult<Self> {
        let data = std::fs::read(path).map_err(|source| LoadError::FilesystemOp {
            op: "read",
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { data })
    }

    /// Wrap an already-loaded object image
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Parse and validate the ELF64 header
    pub fn header(&self) -> LoadResult<ElfHeader> {
        if self.data.len() < EHDR_SIZE {
            return Err(LoadError::Malformed("file shorter than ELF header".into()));
        }
        if self.data[0..4] != ELF_MAGIC {
            return Err(LoadError::Malformed("bad ELF magic".into()));
        }
        if self.data[4] != ELFCLASS64 {
            return Err(LoadError::Malformed("not a 64-bit ELF".into()));
        }
        if self.data[5] != ELFDATA2LSB {
            return Err(LoadError::Malformed("not little endian".into()));
        }

        Ok(ElfHeader {
            shoff: le64(&self.data, 40),
            shentsize: le16(&self.data, 58),
            shnum: le16(&self.data, 60),
            shstrndx: le16(&self.data, 62),
        })
    }

    /// Read all section headers, ordered by section index
    pub fn section_headers(&self) -> LoadResult<Vec<SectionHeader>> {
        let eh = self.header()?;
        let entsize = eh.shentsize as usize;
        if eh.shnum > 0 && entsize < SHDR_SIZE {
            return Err(LoadError::Malformed("section header entry too small".into()));
        }

        let mut table = Vec::with_capacity(eh.shnum as usize);
        for i in 0..eh.shnum as usize {
            let off = eh.shoff as usize + i * entsize;
            if off + SHDR_SIZE > self.data.len() {
                return Err(LoadError::Malformed("section header table truncated".into()));
            }
            let sh = &self.data[off..off + SHDR_SIZE];
            table.push(SectionHeader {
                name_off: le32(sh, 0),
                sh_type: le32(sh, 4),
                offset: le64(sh, 24),
                size: le64(sh, 32),
            });
        }
        Ok(table)
    }

    /// Raw bytes of section `index`
    pub fn section_data(&self, index: usize) -> LoadResult<&[u8]> {
        let table = self.section_headers()?;
        let sh = table
            .get(index)
            .ok_or_else(|| LoadError::Malformed(format!("no section at index {index}")))?;
        self.section_bytes(sh)
    }

    fn section_bytes(&self, sh: &SectionHeader) -> LoadResult<&[u8]> {
        let start = sh.offset as usize;
        let end = start
            .checked_add(sh.size as usize)
            .ok_or_else(|| LoadError::Malformed("section extent overflows".into()))?;
        if end > self.data.len() {
            return Err(LoadError::Malformed("section data truncated".into()));
        }
        Ok(&self.data[start..end])
    }

    /// Bytes of the section-header string table
    pub fn shstrtab(&self) -> LoadResult<&[u8]> {
        let eh = self.header()?;
        self.section_data(eh.shstrndx as usize)
    }

    /// NUL-terminated name at `name_off` in the section-header string table
    pub fn sym_name(&self, name_off: u32) -> LoadResult<String> {
        let strtab = self.shstrtab()?;
        let start = name_off as usize;
        if start >= strtab.len() {
            return Err(LoadError::Malformed(format!(
                "name offset {start} outside string table"
            )));
        }
        let end = strtab[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(strtab.len());
        Ok(String::from_utf8_lossy(&strtab[start..end]).into_owned())
    }

    /// Bytes of the first section named `name`, or `None` if absent
    ///
    /// "Not found" is distinct from a read error: an absent `maps` section
    /// means an empty map set, while an absent `license` is fatal for the
    /// caller to decide.
    pub fn section_by_name(&self, name: &str) -> LoadResult<Option<&[u8]>> {
        let table = self.section_headers()?;
        for sh in &table {
            if self.sym_name(sh.name_off)? == name {
                return Ok(Some(self.section_bytes(sh)?));
            }
        }
        Ok(None)
    }

    /// Bytes of the first section with type `sh_type`, or `None` if absent
    pub fn section_by_type(&self, sh_type: u32) -> LoadResult<Option<&[u8]>> {
        let table = self.section_headers()?;
        for sh in &table {
            if sh.sh_type == sh_type {
                return Ok(Some(self.section_bytes(sh)?));
            }
        }
        Ok(None)
    }

    /// First four bytes of a named section as LE u32, with a default
    ///
    /// The default is returned when the section is absent or too short.
    pub fn section_u32(&self, name: &str, default: u32) -> u32 {
        match self.section_by_name(name) {
            Ok(Some(bytes)) if bytes.len() >= 4 => le32(bytes, 0),
            Ok(Some(_)) => {
                error!("section {name} too short, defaulting to {default}");
                default
            }
            _ => {
                debug!("no section {name}, defaulting to {default}");
                default
            }
        }
    }

    /// All symbol table entries
    ///
    /// With `sorted` the entries are ordered ascendingly by symbol value,
    /// which associates sections with their defining symbols
    /// deterministically; unsorted preserves file order for index-based
    /// relocation lookups.
    pub fn symtab(&self, sorted: bool) -> LoadResult<Vec<Symbol>> {
        let data = self
            .section_by_type(SHT_SYMTAB)?
            .ok_or_else(|| LoadError::Malformed("no symbol table".into()))?;

        let mut symbols: Vec<Symbol> = data
            .chunks_exact(SYM_SIZE)
            .map(|sym| Symbol {
                name_off: le32(sym, 0),
                info: sym[4],
                shndx: le16(sym, 6),
                value: le64(sym, 8),
            })
            .collect();

        if sorted {
            symbols.sort_by_key(|s| s.value);
        }
        Ok(symbols)
    }

    /// Name of the symbol at `index` in file order
    pub fn sym_name_by_idx(&self, index: usize) -> LoadResult<String> {
        let symtab = self.symtab(false)?;
        let sym = symtab
            .get(index)
            .ok_or_else(|| LoadError::Malformed(format!("no symbol at index {index}")))?;
        self.sym_name(sym.name_off)
    }

    /// Names of all symbols defined in the named section, in value order
    ///
    /// `symbol_type` restricts the result to one symbol kind (e.g.
    /// [`STT_FUNC`]).
    pub fn section_sym_names(
        &self,
        section_name: &str,
        symbol_type: Option<u8>,
    ) -> LoadResult<Vec<String>> {
        let symtab = self.symtab(true)?;
        let table = self.section_headers()?;

        let mut sec_idx = None;
        for (i, sh) in table.iter().enumerate() {
            if self.sym_name(sh.name_off)? == section_name {
                sec_idx = Some(i as u16);
                break;
            }
        }
        let Some(sec_idx) = sec_idx else {
            warn!("no {section_name} section in object");
            return Err(LoadError::Malformed(format!(
                "no {section_name} section for symbol lookup"
            )));
        };

        let mut names = Vec::new();
        for sym in &symtab {
            if let Some(t) = symbol_type
                && sym.sym_type() != t
            {
                continue;
            }
            if sym.shndx == sec_idx {
                names.push(self.sym_name(sym.name_off)?);
            }
        }
        Ok(names)
    }
}
