use crate::error::{Error, Result};
use object::{Object, ObjectSymbol};
use std::borrow::Cow;
use std::fs::{self, File};
use std::path::Path;

/// A function symbol covering `[addr, addr + size)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub addr: u64,
    pub size: u64,
    pub name: String,
}

/// Address to name lookup service for one session
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Sorted by start address, one per address
    symbols: Vec<Symbol>,
    /// Other names sharing a start address, only found by name
    aliases: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.addr);

        let mut primary: Vec<Symbol> = Vec::with_capacity(symbols.len());
        let mut aliases = Vec::new();
        for sym in symbols {
            if primary.last().is_some_and(|p| p.addr == sym.addr) {
                aliases.push(sym);
            } else {
                primary.push(sym);
            }
        }

        // symbols without a size extend up to the next one
        for i in 0..primary.len() {
            if primary[i].size == 0 {
                primary[i].size = match primary.get(i + 1) {
                    Some(next) => next.addr - primary[i].addr,
                    None => 1,
                };
            }
        }

        for alias in aliases.iter_mut().filter(|a| a.size == 0) {
            let idx = primary.partition_point(|p| p.addr < alias.addr);
            if let Some(p) = primary.get(idx) {
                alias.size = p.size;
            }
        }

        SymbolTable {
            symbols: primary,
            aliases,
        }
    }

    /// Parse nm-style lines: `<hex address> <type> <name>`
    pub fn parse_nm(content: &str) -> Self {
        let symbols = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.collect::<Vec<_>>().join(" ");

                if name.is_empty() || !matches!(kind, "T" | "t" | "W" | "w" | "P") {
                    return None;
                }
                Some(Symbol {
                    addr,
                    size: 0,
                    name,
                })
            })
            .collect();

        Self::new(symbols)
    }

    /// Load an nm-style `.sym` file
    pub fn load_sym_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_nm(&content))
    }

    /// Load function symbols from an ELF symbol table
    pub fn load_elf(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let object = object::File::parse(&*mmap).map_err(|e| {
            Error::SymbolLoad(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let symbols = object
            .symbols()
            .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some(Symbol {
                    addr: sym.address(),
                    size: sym.size(),
                    name: rustc_demangle::demangle(name).to_string(),
                })
            })
            .collect();

        Ok(Self::new(symbols))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Find the symbol containing `addr`
    pub fn find(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.addr <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;

        (addr < sym.addr.saturating_add(sym.size)).then_some(sym)
    }

    pub fn lookup(&self, addr: u64) -> Option<&str> {
        self.find(addr).map(|s| s.name.as_str())
    }

    /// Symbol name, or the address in hex when it cannot be resolved
    pub fn name(&self, addr: u64) -> Cow<'_, str> {
        match self.lookup(addr) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("{:#x}", addr)),
        }
    }

    /// All symbols with exactly this name
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.symbols
            .iter()
            .chain(&self.aliases)
            .filter(move |s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NM: &str = "\
0000000000400000 T main
0000000000401000 T foo
0000000000401100 t bar
0000000000402000 D some_data
0000000000403000 P printf
";

    #[test]
    fn resolves_addresses_inside_ranges() {
        let table = SymbolTable::parse_nm(NM);

        assert_eq!(table.len(), 4);
        assert_eq!(table.lookup(0x400000), Some("main"));
        assert_eq!(table.lookup(0x400fff), Some("main"));
        assert_eq!(table.lookup(0x401010), Some("foo"));
        assert_eq!(table.lookup(0x401100), Some("bar"));
        assert_eq!(table.lookup(0x403000), Some("printf"));
    }

    #[test]
    fn unresolved_address_falls_back_to_hex() {
        let table = SymbolTable::parse_nm(NM);

        assert_eq!(table.lookup(0x3fffff), None);
        assert_eq!(table.name(0x3fffff), "0x3fffff");
        // past the last (unsized) symbol
        assert_eq!(table.name(0x403001), "0x403001");
    }

    #[test]
    fn finds_symbols_by_name() {
        let table = SymbolTable::parse_nm(NM);
        let found: Vec<_> = table.find_by_name("foo").map(|s| s.addr).collect();

        assert_eq!(found, vec![0x401000]);
        assert_eq!(table.find_by_name("nope").count(), 0);
    }

    #[test]
    fn aliases_are_found_by_name() {
        let table = SymbolTable::parse_nm(
            "0000000000500000 T __libc_longjmp\n\
             0000000000500000 W siglongjmp\n\
             0000000000500000 W longjmp\n\
             0000000000500100 T exit\n",
        );

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(0x500010), Some("__libc_longjmp"));

        let alias: Vec<_> = table.find_by_name("siglongjmp").collect();
        assert_eq!(alias.len(), 1);
        assert_eq!((alias[0].addr, alias[0].size), (0x500000, 0x100));
        assert_eq!(table.find_by_name("longjmp").count(), 1);
    }

    #[test]
    fn range_end_saturates_at_top_of_address_space() {
        let table = SymbolTable::new(vec![Symbol {
            addr: u64::MAX - 4,
            size: 16,
            name: "top".into(),
        }]);

        assert_eq!(table.lookup(u64::MAX - 1), Some("top"));
        assert_eq!(table.lookup(u64::MAX - 5), None);
    }
}
