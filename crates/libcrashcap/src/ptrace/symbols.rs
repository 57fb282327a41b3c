//! Module images, ELF symbols, and DWARF line lookups.

use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};

use super::maps::ModuleRange;
use crate::errors::{CrashcapError, CrashcapResult};

type Reader = EndianArcSlice<RunTimeEndian>;

const PAGE_MASK: u64 = !0xfff;

/// Directories searched for separate debug files, `:` or `;` separated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolPath {
    dirs: Vec<PathBuf>,
}

impl SymbolPath {
    pub fn parse(spec: &str) -> Self {
        Self {
            dirs: spec
                .split([':', ';'])
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .collect(),
        }
    }

    /// First `<dir>/<file>.debug` or `<dir>/<file>` that exists.
    pub fn locate(&self, module: &Path) -> Option<PathBuf> {
        let file_name = module.file_name()?.to_str()?;
        self.dirs.iter().find_map(|dir| {
            [dir.join(format!("{file_name}.debug")), dir.join(file_name)]
                .into_iter()
                .find(|candidate| candidate.is_file() && candidate != module)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Symbol {
    address: u64,
    name: String,
}

struct Image {
    /// Runtime address minus file address.
    bias: u64,
    symbols: Vec<Symbol>,
    lines: Option<Context<Reader>>,
}

impl Image {
    fn load(path: &Path, base: u64, symbol_path: &SymbolPath) -> CrashcapResult<Self> {
        let data = fs::read(path)?;
        let file = object::File::parse(&*data)?;

        let bias = match file.kind() {
            ObjectKind::Dynamic | ObjectKind::Executable => {
                let first = file.segments().map(|segment| segment.address()).min().unwrap_or(0);
                base.wrapping_sub(first & PAGE_MASK)
            }
            _ => 0,
        };

        let mut symbols = collect_symbols(&file);
        let debug_data = symbol_path.locate(path).and_then(|debug| {
            debug!("using {} for {}", debug.display(), path.display());
            fs::read(debug).ok()
        });
        let lines = match debug_data.as_deref().map(|data| object::File::parse(data)) {
            Some(Ok(debug_file)) => {
                symbols.extend(collect_symbols(&debug_file));
                line_context(&debug_file)?
            }
            _ => line_context(&file)?,
        };

        symbols.sort_by_key(|symbol| symbol.address);
        symbols.dedup_by(|a, b| a.address == b.address && a.name == b.name);
        Ok(Self { bias, symbols, lines })
    }

    fn symbol_for(&self, file_address: u64) -> Option<&Symbol> {
        let index = self.symbols.partition_point(|symbol| symbol.address <= file_address);
        index.checked_sub(1).map(|index| &self.symbols[index])
    }
}

fn collect_symbols(file: &object::File<'_>) -> Vec<Symbol> {
    file.symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| !symbol.is_undefined() && symbol.kind() == SymbolKind::Text && symbol.address() != 0)
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            (!name.is_empty()).then(|| Symbol {
                address: symbol.address(),
                name: name.to_string(),
            })
        })
        .collect()
}

fn line_context(file: &object::File<'_>) -> CrashcapResult<Option<Context<Reader>>> {
    if file.section_by_name(".debug_info").is_none() {
        return Ok(None);
    }
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let dwarf = Dwarf::load(|id| -> Result<Reader, gimli::Error> {
        let data: Arc<[u8]> = file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .map(|bytes| Arc::from(&*bytes))
            .unwrap_or_else(|| Arc::from(&[][..]));
        Ok(EndianArcSlice::new(data, endian))
    })?;
    Ok(Some(Context::from_dwarf(dwarf)?))
}

/// A loaded module. The image is parsed on first use.
pub struct Module {
    pub name: String,
    pub path: PathBuf,
    pub base: u64,
    pub end: u64,
    image: OnceCell<Option<Image>>,
}

impl Module {
    pub fn new(range: ModuleRange) -> Self {
        Self {
            name: range.name,
            path: PathBuf::from(range.path),
            base: range.base,
            end: range.end,
            image: OnceCell::new(),
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.base..self.end).contains(&address)
    }

    fn is(&self, range: &ModuleRange) -> bool {
        self.base == range.base && self.path.as_path() == Path::new(&range.path)
    }

    fn image(&self, symbol_path: &SymbolPath) -> Option<&Image> {
        self.image
            .get_or_init(|| match Image::load(&self.path, self.base, symbol_path) {
                Ok(image) => Some(image),
                Err(err) => {
                    debug!("no symbols for {}: {err}", self.path.display());
                    None
                }
            })
            .as_ref()
    }

    /// Answers to `module!symbol` expressions accept the full file name or
    /// the part before the first dot.
    fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.name.split('.').next() == Some(name)
    }
}

/// Modules of the current image, in load order.
#[derive(Default)]
pub struct ModuleTable {
    modules: Vec<Module>,
    symbol_path: SymbolPath,
}

impl ModuleTable {
    pub fn set_symbol_path(&mut self, symbol_path: SymbolPath) {
        self.symbol_path = symbol_path;
    }

    /// Sync with the target's current mappings, returning the modules that
    /// were not loaded before.
    pub fn refresh(&mut self, ranges: Vec<ModuleRange>) -> Vec<(String, u64)> {
        self.modules
            .retain(|module| ranges.iter().any(|range| module.is(range)));

        let mut added = Vec::new();
        for range in ranges {
            if !self.modules.iter().any(|module| module.is(&range)) {
                added.push((range.name.clone(), range.base));
                self.modules.push(Module::new(range));
            }
        }
        added
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn find(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|module| module.answers_to(name))
    }

    pub fn containing(&self, address: u64) -> Option<&Module> {
        self.modules.iter().find(|module| module.contains(address))
    }

    pub fn resolve(&self, module: &str, name: &str) -> CrashcapResult<Option<u64>> {
        let module = self
            .find(module)
            .ok_or_else(|| CrashcapError::UnknownModule(module.to_string()))?;
        Ok(module.image(&self.symbol_path).and_then(|image| {
            image
                .symbols
                .iter()
                .find(|symbol| symbol.name == name)
                .map(|symbol| symbol.address.wrapping_add(image.bias))
        }))
    }

    /// `module!symbol+0xoff`, `module+0xoff`, or the bare address.
    pub fn describe(&self, address: u64) -> String {
        let Some(module) = self.containing(address) else {
            return format!("{address:#018x}");
        };
        let symbol = module.image(&self.symbol_path).and_then(|image| {
            image
                .symbol_for(address.wrapping_sub(image.bias))
                .map(|symbol| (symbol, address.wrapping_sub(image.bias) - symbol.address))
        });
        match symbol {
            Some((symbol, offset)) => format!("{}!{}+{offset:#x}", module.name, symbol.name),
            None => format!("{}+{:#x}", module.name, address - module.base),
        }
    }

    /// `file:line` for `address`, when line tables are available.
    pub fn source_line(&self, address: u64) -> Option<String> {
        let module = self.containing(address)?;
        let image = module.image(&self.symbol_path)?;
        let location = image
            .lines
            .as_ref()?
            .find_location(address.wrapping_sub(image.bias))
            .ok()??;
        match (location.file, location.line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            (Some(file), None) => Some(file.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_path_accepts_both_separators() {
        let path = SymbolPath::parse("/a:/b;;/c ");
        assert_eq!(path.dirs, [PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]);
        assert_eq!(SymbolPath::parse(""), SymbolPath::default());
    }

    #[test]
    fn debug_files_are_preferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("libdemo.so"), b"").unwrap();
        fs::write(dir.path().join("libdemo.so.debug"), b"").unwrap();
        let path = SymbolPath::parse(&dir.path().to_string_lossy());

        assert_eq!(
            path.locate(Path::new("/usr/lib/libdemo.so")),
            Some(dir.path().join("libdemo.so.debug"))
        );
        assert_eq!(path.locate(Path::new("/usr/lib/libother.so")), None);
    }

    fn range(name: &str, base: u64) -> ModuleRange {
        ModuleRange {
            name: name.into(),
            path: format!("/nonexistent/{name}"),
            base,
            end: base + 0x1000,
        }
    }

    #[test]
    fn refresh_reports_only_new_modules() {
        let mut table = ModuleTable::default();
        let added = table.refresh(vec![range("app", 0x1000)]);
        assert_eq!(added, [("app".to_string(), 0x1000)]);

        let added = table.refresh(vec![range("app", 0x1000), range("libc.so.6", 0x8000)]);
        assert_eq!(added, [("libc.so.6".to_string(), 0x8000)]);

        table.refresh(vec![range("libc.so.6", 0x8000)]);
        assert!(table.find("app").is_none());
        assert_eq!(table.find("libc").map(|m| m.base), Some(0x8000));
    }

    #[test]
    fn unknown_module_is_an_error_but_missing_symbol_is_not() {
        let mut table = ModuleTable::default();
        table.refresh(vec![range("app", 0x1000)]);
        assert!(matches!(table.resolve("libc.so.6", "abort"), Err(CrashcapError::UnknownModule(_))));
        assert_eq!(table.resolve("app", "abort").unwrap(), None);
    }

    #[test]
    fn addresses_without_symbols_fall_back_to_offsets() {
        let mut table = ModuleTable::default();
        table.refresh(vec![range("app", 0x1000)]);
        assert_eq!(table.describe(0x1010), "app+0x10");
        assert_eq!(table.describe(0x9000), "0x0000000000009000");
        assert_eq!(table.source_line(0x1010), None);
    }

    #[test]
    fn own_test_binary_resolves_its_symbols() {
        let exe = std::env::current_exe().unwrap();
        let image = Image::load(&exe, 0, &SymbolPath::default()).unwrap();
        assert!(!image.symbols.is_empty());
        assert!(image.symbols.windows(2).all(|pair| pair[0].address <= pair[1].address));
    }
}
