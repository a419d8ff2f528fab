use crate::dumps::DumpDialect;

/// One symbol in one module's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Raw symbol name, possibly still mangled.
    pub name: String,
    /// Address relative to the module's load address.
    pub rva: u64,
    pub line: Option<u32>,
    pub file: Option<String>,
}

/// The address-sorted symbol list for one (module, version) pair.
///
/// Immutable once built. Multiple entries may share an address (one function
/// can have many line records); the floor lookup may return any of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    dialect: Option<DumpDialect>,
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    pub(crate) fn new(dialect: DumpDialect, mut entries: Vec<SymbolEntry>) -> Self {
        // Stable sort: duplicate addresses keep their emission order.
        entries.sort_by_key(|e| e.rva);
        Self {
            dialect: Some(dialect),
            entries,
        }
    }

    /// A table for a module whose symbol dump could not be located.
    pub(crate) fn unavailable() -> Self {
        Self {
            dialect: None,
            entries: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Option<DumpDialect> {
        self.dialect
    }

    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry with the greatest address <= `rva`, or `None` if
    /// `rva` lies before the first entry.
    pub fn lookup(&self, rva: u64) -> Option<&SymbolEntry> {
        let index = match self.entries.binary_search_by_key(&rva, |e| e.rva) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(&self.entries[index])
    }
}
