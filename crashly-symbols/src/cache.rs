//! Explicitly constructed per-batch caches.
//!
//! Symbol tables and demangled names are append-only and read-only after
//! insertion, so the frozen maps can be shared across workers without
//! locking; building a table is a pure function of the on-disk dump, so a
//! racing double-build is harmless (the first insert wins).

use std::collections::HashMap;
use std::sync::Mutex;

use elsa::sync::FrozenMap;

use crate::demangle;
use crate::table::SymbolTable;

/// Identity of one symbol table: module name plus, for the application
/// binary, its build version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Default)]
pub struct SymbolCache {
    tables: FrozenMap<ModuleKey, Box<SymbolTable>>,
    demangled: FrozenMap<String, String>,
    fuzzy_versions: Mutex<HashMap<String, String>>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized table for `key`, building it on first use.
    pub fn table_for(
        &self,
        key: &ModuleKey,
        build: impl FnOnce() -> SymbolTable,
    ) -> &SymbolTable {
        if let Some(table) = self.tables.get(key) {
            return table;
        }
        self.tables.insert(key.clone(), Box::new(build()))
    }

    /// Normalizes `raw`, memoized per raw spelling.
    pub fn demangled(&self, raw: &str) -> &str {
        if let Some(name) = self.demangled.get(raw) {
            return name;
        }
        self.demangled
            .insert(raw.to_string(), demangle::normalize(raw))
    }

    /// Records that symbols for `substituted` were used in place of
    /// `requested` (fuzzy version fallback).
    pub fn record_fuzzy_version(&self, requested: &str, substituted: &str) {
        self.fuzzy_versions
            .lock()
            .unwrap()
            .insert(requested.to_string(), substituted.to_string());
    }

    /// The version reports of `version` should be grouped under: the fuzzy
    /// substitution when one was recorded, otherwise `version` itself.
    pub fn effective_version(&self, version: &str) -> String {
        self.fuzzy_versions
            .lock()
            .unwrap()
            .get(version)
            .cloned()
            .unwrap_or_else(|| version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dumps::DumpDialect;
    use crate::table::SymbolEntry;

    fn key(name: &str) -> ModuleKey {
        ModuleKey {
            name: name.to_string(),
            version: None,
        }
    }

    #[test]
    fn table_built_once_per_key() {
        let cache = SymbolCache::new();
        let mut builds = 0;
        for _ in 0..3 {
            cache.table_for(&key("app.exe"), || {
                builds += 1;
                DumpDialect::Globals.parse(b"Function: [00001000][0001:00000000] f\n")
            });
        }
        assert_eq!(builds, 1);
        let entry_count = cache
            .table_for(&key("app.exe"), || {
                DumpDialect::Globals
                    .parse(b"Function: [00001000][0001:00000000] f\nFunction: [00002000][0001:00001000] g\n")
            })
            .len();
        assert_eq!(entry_count, 1, "second build must not replace the first");
    }

    #[test]
    fn demangled_names_are_memoized_per_spelling() {
        let cache = SymbolCache::new();
        let first = cache.demangled("?doUpdate@Ship@@") as *const str;
        let second = cache.demangled("?doUpdate@Ship@@") as *const str;
        assert_eq!(first, second);
    }

    #[test]
    fn fuzzy_substitution_log() {
        let cache = SymbolCache::new();
        assert_eq!(cache.effective_version("2024_01_03"), "2024_01_03");
        cache.record_fuzzy_version("2024_01_03", "2024_01_02");
        assert_eq!(cache.effective_version("2024_01_03"), "2024_01_02");
        assert_eq!(cache.effective_version("2024_01_02"), "2024_01_02");
    }

    #[test]
    fn distinct_versions_get_distinct_tables() {
        let cache = SymbolCache::new();
        let with_version = ModuleKey {
            name: "app.exe".to_string(),
            version: Some("2024_01_01".to_string()),
        };
        cache.table_for(&with_version, || {
            SymbolTable::new(
                DumpDialect::Line,
                vec![SymbolEntry {
                    name: "main".to_string(),
                    rva: 0x10,
                    line: Some(1),
                    file: None,
                }],
            )
        });
        let other = cache.table_for(&key("app.exe"), SymbolTable::unavailable);
        assert!(other.is_empty());
    }
}
