use std::{
    collections::HashMap,
    fs::read,
    path::{Path, PathBuf},
};

use goblin::elf::{program_header::PT_LOAD, reloc, sym::Sym, Elf};
use log::debug;
use procfs::process::{MMapPath, Process};

use crate::{classify::ModuleBase, error::ImageError, patch::page_size, resolver::SymbolLookup};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const IMPORT_RELOCS: [u32; 2] = [reloc::R_X86_64_JUMP_SLOT, reloc::R_X86_64_GLOB_DAT];
    } else if #[cfg(target_arch = "aarch64")] {
        const IMPORT_RELOCS: [u32; 2] = [reloc::R_AARCH64_JUMP_SLOT, reloc::R_AARCH64_GLOB_DAT];
    } else if #[cfg(target_arch = "x86")] {
        const IMPORT_RELOCS: [u32; 2] = [reloc::R_386_JMP_SLOT, reloc::R_386_GLOB_DAT];
    } else if #[cfg(target_arch = "arm")] {
        const IMPORT_RELOCS: [u32; 2] = [reloc::R_ARM_JUMP_SLOT, reloc::R_ARM_GLOB_DAT];
    } else {
        const IMPORT_RELOCS: [u32; 0] = [];
    }
}

/// The primary executable of a process, as it is mapped right now.
///
/// This is both the symbol lookup for functions defined by the executable
/// and the module base used to classify return addresses.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    path: PathBuf,
    /// Lowest address the image is mapped at.
    load_base: usize,
    /// Difference between runtime addresses and the link-time addresses in
    /// the elf. Zero for non-PIE executables.
    bias: usize,
    functions: HashMap<String, u64>,
    import_slots: Vec<usize>,
}

impl ProcessImage {
    pub fn current() -> Result<Self, ImageError> {
        Self::from_process(&Process::myself()?)
    }

    pub fn for_process(pid: i32) -> Result<Self, ImageError> {
        Self::from_process(&Process::new(pid)?)
    }

    fn from_process(process: &Process) -> Result<Self, ImageError> {
        let path = process.exe()?;
        let bytes = read(&path).map_err(|source| ImageError::Io {
            path: path.clone(),
            source,
        })?;
        let elf = Elf::parse(&bytes)?;

        let load_base = process
            .maps()?
            .into_iter()
            .filter(|map| map.pathname == MMapPath::Path(path.clone()))
            .map(|map| map.address.0 as usize)
            .min()
            .ok_or_else(|| ImageError::NotMapped(path.clone()))?;

        let page = page_size() as u64;
        let first_load = elf
            .program_headers
            .iter()
            .filter(|program_header| program_header.p_type == PT_LOAD)
            .map(|program_header| program_header.p_vaddr & !(page - 1))
            .min()
            .ok_or_else(|| ImageError::NoLoadSegments(path.clone()))?;
        let bias = load_base.saturating_sub(first_load as usize);

        let mut functions = HashMap::new();
        for (name, symbol) in function_symbols(&elf) {
            functions.entry(name.to_string()).or_insert(symbol.st_value);
        }

        let import_slots = elf
            .pltrelocs
            .iter()
            .chain(elf.dynrelas.iter())
            .chain(elf.dynrels.iter())
            .filter(|reloc| IMPORT_RELOCS.contains(&reloc.r_type))
            .map(|reloc| bias + reloc.r_offset as usize)
            .collect::<Vec<_>>();

        debug!(
            "{}: base {:#x}, bias {:#x}, {} functions, {} import slots",
            path.display(),
            load_base,
            bias,
            functions.len(),
            import_slots.len()
        );

        Ok(Self {
            path,
            load_base,
            bias,
            functions,
            import_slots,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_base(&self) -> usize {
        self.load_base
    }

    pub fn bias(&self) -> usize {
        self.bias
    }

    /// Runtime addresses of the image's import slots.
    pub fn import_slots(&self) -> &[usize] {
        &self.import_slots
    }
}

impl SymbolLookup for ProcessImage {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.functions
            .get(name)
            .map(|value| self.bias + *value as usize)
    }
}

impl ModuleBase for ProcessImage {
    fn module_base(&self) -> usize {
        self.load_base
    }
}

/// Function symbols defined by this elf, from both the static and the
/// dynamic symbol table. Static entries come first.
fn function_symbols<'a>(elf: &'a Elf<'a>) -> impl Iterator<Item = (&'a str, Sym)> + 'a {
    let statics = elf
        .syms
        .iter()
        .filter_map(move |symbol| Some((elf.strtab.get_at(symbol.st_name)?, symbol)));
    let dynamics = elf
        .dynsyms
        .iter()
        .filter_map(move |symbol| Some((elf.dynstrtab.get_at(symbol.st_name)?, symbol)));

    statics
        .chain(dynamics)
        .filter(|(name, symbol)| {
            symbol.is_function() && !symbol.is_import() && symbol.st_value != 0 && !name.is_empty()
        })
}

/// This function returns all function symbols the given elf defines, sorted
/// and without duplicates.
pub fn defined_functions(path_to_bin: &Path) -> Result<Vec<String>, ImageError> {
    let bytes = read(path_to_bin).map_err(|source| ImageError::Io {
        path: path_to_bin.to_path_buf(),
        source,
    })?;
    let elf = Elf::parse(&bytes)?;
    let mut out = function_symbols(&elf)
        .map(|(name, _)| name.to_string())
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    Ok(out)
}

/// This function returns all undefined symbols, representing functions, in the
/// given elf. Undefined symbols in a binary will be dynamically linked.
pub fn undefined_functions(path_to_bin: &Path) -> Result<Vec<String>, ImageError> {
    let bytes = read(path_to_bin).map_err(|source| ImageError::Io {
        path: path_to_bin.to_path_buf(),
        source,
    })?;
    let elf = Elf::parse(&bytes)?;
    let out = elf
        .dynsyms
        .iter()
        // The first entry is reserved and holds a default unitialized entry.
        .skip(1)
        .filter(|s| s.is_import())
        .filter(|s| s.is_function())
        .filter_map(|s| elf.dynstrtab.get_at(s.st_name))
        .map(|name| name.to_string())
        .collect();
    Ok(out)
}
