//! Raw address to (function, line, file) resolution against one report's
//! module map.

use crate::cache::{ModuleKey, SymbolCache};
use crate::store::SymbolStore;

/// One loaded binary referenced by a crash report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// Set only for the application's own binary; system modules use a
    /// version-independent symbol lookup.
    pub version: Option<String>,
}

impl ModuleInfo {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// The modules of one crash report, in order of appearance.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: Vec<ModuleInfo>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, module: ModuleInfo) {
        self.modules.push(module);
    }

    /// First module containing `address`; modules are expected not to
    /// overlap.
    pub fn find(&self, address: u64) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.contains(address))
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }
}

/// What an address resolved to. All-`None` is the normal outcome for
/// addresses outside every known module (JIT or corrupt frames) and is
/// displayed as `<unknown>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedSymbol {
    pub function: Option<String>,
    pub line: Option<u32>,
    pub file: Option<String>,
}

impl ResolvedSymbol {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.function.is_none()
    }
}

pub struct Resolver<'a> {
    store: &'a SymbolStore,
    cache: &'a SymbolCache,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a SymbolStore, cache: &'a SymbolCache) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &'a SymbolCache {
        self.cache
    }

    /// Resolves `address` against `map`. The owning module's symbol table
    /// is built on first use and memoized per (module, version).
    pub fn lookup(&self, map: &ModuleMap, address: u64) -> ResolvedSymbol {
        let Some(module) = map.find(address) else {
            return ResolvedSymbol::unknown();
        };
        let rva = address - module.base;

        let key = ModuleKey {
            name: module.name.clone(),
            version: module.version.clone(),
        };
        let table = self.cache.table_for(&key, || {
            self.store
                .build_table(&module.name, module.version.as_deref(), self.cache)
        });

        if table.is_empty() {
            // Module resolved but no symbols: the file name is still a
            // usable coarse identifier.
            return ResolvedSymbol {
                function: Some(module.name.clone()),
                line: None,
                file: None,
            };
        }

        match table.lookup(rva) {
            Some(entry) => {
                let function = Some(self.cache.demangled(&entry.name).to_string());
                match entry.line {
                    Some(line) => ResolvedSymbol {
                        function,
                        line: Some(line),
                        file: entry.file.clone(),
                    },
                    None => ResolvedSymbol {
                        function,
                        line: None,
                        file: Some(basename(&module.name).to_string()),
                    },
                }
            }
            None => ResolvedSymbol::unknown(),
        }
    }
}

/// `0x<addr> <function> at <file>:<line>`, degrading with the information
/// available.
pub fn format_address(address: u64, symbol: &ResolvedSymbol) -> String {
    let text = match (&symbol.function, symbol.line, &symbol.file) {
        (Some(function), Some(line), Some(file)) => format!("{function} at {file}:{line}"),
        (Some(function), _, Some(file)) => format!("{function} in {file}"),
        (Some(function), _, None) => function.clone(),
        (None, _, _) => "<unknown>".to_string(),
    };
    format!("{address:#08x} {text}")
}

fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use std::path::Path;

    fn write_gz(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap();
    }

    fn app_module() -> ModuleInfo {
        ModuleInfo {
            name: "app.exe".to_string(),
            base: 0x400000,
            size: 0x100000,
            version: Some("2024_01_01".to_string()),
        }
    }

    fn map_of(modules: Vec<ModuleInfo>) -> ModuleMap {
        let mut map = ModuleMap::new();
        for module in modules {
            map.push(module);
        }
        map
    }

    #[test]
    fn containment() {
        let module = app_module();
        assert!(!module.contains(0x3fffff));
        assert!(module.contains(0x400000));
        assert!(module.contains(0x4fffff));
        assert!(!module.contains(0x500000));
        let empty = ModuleInfo {
            size: 0,
            ..app_module()
        };
        assert!(!empty.contains(0x400000));
    }

    #[test]
    fn address_below_every_module_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let resolver = Resolver::new(&store, &cache);
        let map = map_of(vec![app_module()]);
        assert!(resolver.lookup(&map, 0x100).is_unknown());
    }

    #[test]
    fn floor_entry_with_line_info() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_01/app.line.gz"),
            b"** main\n\
              line 41 at [00001040][0001:00000040], len = 0x10\tapp.cpp (MD5: X)\n\
              line 42 at [00001050][0001:00000050], len = 0x5\n",
        );
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let resolver = Resolver::new(&store, &cache);
        let map = map_of(vec![app_module()]);

        let symbol = resolver.lookup(&map, 0x401050);
        assert_eq!(symbol.function.as_deref(), Some("main"));
        assert_eq!(symbol.line, Some(42));
        assert_eq!(symbol.file.as_deref(), Some("app.cpp"));

        // Floor: an address between the two records resolves to the first.
        let symbol = resolver.lookup(&map, 0x401044);
        assert_eq!(symbol.line, Some(41));

        // Before the first record: no owning entry.
        assert!(resolver.lookup(&map, 0x400000).is_unknown());
    }

    #[test]
    fn second_lookup_is_served_from_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("win32/2024_01_01/app.line.gz");
        write_gz(
            &dump,
            b"** main\nline 42 at [00001050][0001:00000050], len = 0x5\tapp.cpp (MD5: X)\n",
        );
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let resolver = Resolver::new(&store, &cache);
        let map = map_of(vec![app_module()]);

        let first = resolver.lookup(&map, 0x401050);
        // If the second lookup re-read the dump this would come back empty.
        fs::remove_file(&dump).unwrap();
        let second = resolver.lookup(&map, 0x401050);
        assert_eq!(first, second);
        assert_eq!(second.function.as_deref(), Some("main"));
    }

    #[test]
    fn empty_table_falls_back_to_the_module_name() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(&dir.path().join("win32/2024_01_01/app.line.gz"), b"junk\n");
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let resolver = Resolver::new(&store, &cache);
        let map = map_of(vec![app_module()]);
        let symbol = resolver.lookup(&map, 0x401050);
        assert_eq!(symbol.function.as_deref(), Some("app.exe"));
        assert_eq!(symbol.line, None);
    }

    #[test]
    fn entries_without_line_info_use_the_module_basename_as_file() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/symbols/foo.pdb.globals.gz"),
            b"Function: [00001000][0001:00000000] helper\n",
        );
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let resolver = Resolver::new(&store, &cache);
        let map = map_of(vec![ModuleInfo {
            name: "C:\\Windows\\foo.dll".to_string(),
            base: 0x10000000,
            size: 0x10000,
            version: None,
        }]);
        let symbol = resolver.lookup(&map, 0x10001234);
        assert_eq!(symbol.function.as_deref(), Some("helper"));
        assert_eq!(symbol.file.as_deref(), Some("foo.dll"));
    }

    #[test]
    fn formatting() {
        assert_eq!(
            format_address(
                0x401050,
                &ResolvedSymbol {
                    function: Some("main".into()),
                    line: Some(42),
                    file: Some("app.cpp".into()),
                }
            ),
            "0x401050 main at app.cpp:42"
        );
        assert_eq!(
            format_address(
                0x401050,
                &ResolvedSymbol {
                    function: Some("helper".into()),
                    line: None,
                    file: Some("foo.dll".into()),
                }
            ),
            "0x401050 helper in foo.dll"
        );
        assert_eq!(
            format_address(0x10, &ResolvedSymbol::unknown()),
            "0x000010 <unknown>"
        );
    }
}
