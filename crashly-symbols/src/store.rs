//! Locates the on-disk symbol dump backing a module.
//!
//! Dumps live under one or more store roots. System libraries are
//! version-independent; the application binary is looked up by exact build
//! version, with a fuzzy fallback to the nearest dated sibling directory
//! when the exact one is missing. Dumps may be plain or gzip-compressed.
//! When nothing is on disk, an optional external generator may be invoked
//! once and its output cached beside the expected path.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::cache::SymbolCache;
use crate::dumps::DumpDialect;
use crate::error::Error;
use crate::table::SymbolTable;
use crate::version::BuildDate;

// Their layout differs per Windows build; never resolvable offline.
const SKIPPED_SYSTEM_DLLS: [&str; 2] = ["ntdll.dll", "kernelbase.dll"];

/// External collaborator that can produce a missing dump, e.g. a PDB or
/// ELF dumper. Invoked at most once per module, blocking.
pub trait DumpGenerator: Send + Sync {
    fn generate(&self, module_name: &str, dialect: DumpDialect) -> Option<Vec<u8>>;
}

/// Runs a shell command with `{module}` replaced by the module name and
/// takes its stdout as the dump.
pub struct CommandDumpGenerator {
    command: String,
}

impl CommandDumpGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl DumpGenerator for CommandDumpGenerator {
    fn generate(&self, module_name: &str, _dialect: DumpDialect) -> Option<Vec<u8>> {
        let command = self.command.replace("{module}", module_name);
        match Command::new("sh").arg("-c").arg(&command).output() {
            Ok(output) if output.status.success() && !output.stdout.is_empty() => {
                Some(output.stdout)
            }
            Ok(output) => {
                warn!(
                    "{}",
                    Error::DumpGenerator(module_name.to_string(), output.status.to_string())
                );
                None
            }
            Err(err) => {
                warn!(
                    "{}",
                    Error::DumpGenerator(module_name.to_string(), err.to_string())
                );
                None
            }
        }
    }
}

pub struct StoreConfig {
    /// Store roots, searched in order.
    pub roots: Vec<PathBuf>,
    /// Platform subdirectory holding Windows dumps.
    pub windows_dir: String,
    /// Platform subdirectory holding Linux dumps.
    pub linux_dir: String,
    /// Release-channel subdirectories between the platform directory and
    /// the version directory, keyed by application binary stem.
    pub channels: HashMap<String, Vec<String>>,
    /// Calendar-day window for fuzzy version fallback.
    pub tolerance_days: i64,
    pub generator: Option<Box<dyn DumpGenerator>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            windows_dir: "win32".to_string(),
            linux_dir: "linux".to_string(),
            channels: HashMap::new(),
            tolerance_days: 2,
            generator: None,
        }
    }
}

pub struct SymbolStore {
    config: StoreConfig,
}

impl SymbolStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Parses the dump backing `module_name` into a table. Every failure
    /// mode short of a located-but-unreadable store degrades to an empty
    /// table plus a warning; the caller memoizes whatever comes back.
    pub fn build_table(
        &self,
        module_name: &str,
        version: Option<&str>,
        cache: &SymbolCache,
    ) -> SymbolTable {
        let basename_lower = module_basename(module_name).to_ascii_lowercase();
        if SKIPPED_SYSTEM_DLLS.contains(&basename_lower.as_str()) {
            debug!("skipping OS-private module {module_name}");
            return SymbolTable::unavailable();
        }

        if let Some((dialect, path)) = self.locate(module_name, version, cache) {
            return match read_dump(&path) {
                Ok(bytes) => {
                    let table = dialect.parse(&bytes);
                    if table.is_empty() {
                        warn!("loaded 0 symbols from {}", path.display());
                    }
                    table
                }
                Err(err) => {
                    warn!("{err}");
                    SymbolTable::unavailable()
                }
            };
        }

        if let Some(generator) = &self.config.generator {
            let dialect = expected_dialect(module_name);
            if let Some(bytes) = generator.generate(module_name, dialect) {
                if let Err(err) = self.store_generated(module_name, version, dialect, &bytes) {
                    warn!("{err}");
                }
                return dialect.parse(&bytes);
            }
        }

        match version {
            Some(version) => warn!("no symbols for {module_name}@{version}"),
            None => warn!("no symbols for {module_name}"),
        }
        SymbolTable::unavailable()
    }

    fn locate(
        &self,
        module_name: &str,
        version: Option<&str>,
        cache: &SymbolCache,
    ) -> Option<(DumpDialect, PathBuf)> {
        for (dialect, path) in self.candidate_paths(module_name, version) {
            if path.is_file() {
                return Some((dialect, path));
            }
        }
        let version = version?;
        self.locate_fuzzy(module_name, version, cache)
    }

    fn candidate_paths(
        &self,
        module_name: &str,
        version: Option<&str>,
    ) -> Vec<(DumpDialect, PathBuf)> {
        let basename = module_basename(module_name);
        let lower = basename.to_ascii_lowercase();
        let mut candidates = Vec::new();

        if lower.ends_with(".dll") {
            let pdb = format!("{}.pdb", module_stem(basename));
            let mut lpdb = pdb.to_ascii_lowercase();
            if is_msvc_runtime_pdb(&lpdb) {
                // The runtime pdbs are archived with an arch infix.
                lpdb = lpdb.replace(".pdb", ".i386.pdb");
            }
            for root in &self.config.roots {
                candidates.push((
                    DumpDialect::Line,
                    root.join(&self.config.windows_dir)
                        .join(format!("{pdb}.line.gz")),
                ));
            }
            for root in &self.config.roots {
                candidates.push((
                    DumpDialect::Globals,
                    root.join(&self.config.windows_dir)
                        .join("symbols")
                        .join(format!("{lpdb}.globals.gz")),
                ));
            }
            return candidates;
        }

        if lower.contains(".so") {
            for root in &self.config.roots {
                candidates.push((
                    DumpDialect::Elf,
                    root.join(&self.config.linux_dir)
                        .join(format!("{basename}.elf.gz")),
                ));
            }
            for root in &self.config.roots {
                candidates.push((
                    DumpDialect::Elf,
                    root.join(&self.config.linux_dir)
                        .join("symbols")
                        .join(format!("{basename}.elf.gz")),
                ));
            }
            return candidates;
        }

        if let Some(version) = version {
            let stem = module_stem(basename);
            let (dialect, ext) = app_dump_kind(&lower);
            for dir in self.version_parent_dirs(module_name) {
                let vdir = dir.join(version);
                candidates.push((dialect, vdir.join(format!("{stem}.{ext}.gz"))));
                candidates.push((dialect, vdir.join(format!("{stem}.{ext}"))));
                candidates.push((DumpDialect::Map, vdir.join(format!("{stem}.map"))));
            }
        }
        candidates
    }

    /// `<root>/<platform>/<channel>` directories whose dated children are
    /// the per-version dump directories for this application binary.
    fn version_parent_dirs(&self, module_name: &str) -> Vec<PathBuf> {
        let basename = module_basename(module_name);
        let stem = module_stem(basename);
        let platform_dir = if basename.to_ascii_lowercase().ends_with(".exe") {
            &self.config.windows_dir
        } else {
            &self.config.linux_dir
        };
        let channels = self
            .config
            .channels
            .get(stem)
            .cloned()
            .unwrap_or_else(|| vec![String::new()]);
        let mut dirs = Vec::new();
        for root in &self.config.roots {
            for channel in &channels {
                let mut dir = root.join(platform_dir);
                if !channel.is_empty() {
                    dir = dir.join(channel);
                }
                dirs.push(dir);
            }
        }
        dirs
    }

    fn locate_fuzzy(
        &self,
        module_name: &str,
        version: &str,
        cache: &SymbolCache,
    ) -> Option<(DumpDialect, PathBuf)> {
        let requested = BuildDate::parse_version(version)?;
        let basename = module_basename(module_name);
        let stem = module_stem(basename);
        let (dialect, ext) = app_dump_kind(&basename.to_ascii_lowercase());

        let mut best: Option<(i64, BuildDate, String, PathBuf)> = None;
        for dir in self.version_parent_dirs(module_name) {
            let Ok(children) = fs::read_dir(&dir) else {
                continue;
            };
            for child in children.flatten() {
                let dir_name = child.file_name().to_string_lossy().into_owned();
                let Some(date) = BuildDate::parse_version(&dir_name) else {
                    continue;
                };
                let distance = requested.distance_days(&date);
                if distance >= self.config.tolerance_days {
                    continue;
                }
                let mut dump = child.path().join(format!("{stem}.{ext}.gz"));
                if !dump.is_file() {
                    dump = child.path().join(format!("{stem}.{ext}"));
                    if !dump.is_file() {
                        continue;
                    }
                }
                // Nearest wins; same-distance ties go to the older build.
                let better = match &best {
                    None => true,
                    Some((best_distance, best_date, _, _)) => {
                        distance < *best_distance
                            || (distance == *best_distance && date < *best_date)
                    }
                };
                if better {
                    best = Some((distance, date, dir_name, dump));
                }
            }
        }

        let (_, _, substituted, path) = best?;
        warn!("using symbols from {substituted} for {version}");
        cache.record_fuzzy_version(version, &substituted);
        Some((dialect, path))
    }

    fn store_generated(
        &self,
        module_name: &str,
        version: Option<&str>,
        dialect: DumpDialect,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let Some((_, path)) = self
            .candidate_paths(module_name, version)
            .into_iter()
            .find(|(d, path)| *d == dialect && path.extension().is_some_and(|e| e == "gz"))
        else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::WriteDump(path.clone(), e))?;
        }
        let file = fs::File::create(&path).map_err(|e| Error::WriteDump(path.clone(), e))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(bytes)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| Error::WriteDump(path.clone(), e))?;
        debug!("cached generated dump at {}", path.display());
        Ok(())
    }
}

fn read_dump(path: &Path) -> Result<Vec<u8>, Error> {
    let mut file = fs::File::open(path).map_err(|e| Error::OpenDump(path.to_path_buf(), e))?;
    let mut bytes = Vec::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        MultiGzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::ReadDump(path.to_path_buf(), e))?;
    } else {
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::ReadDump(path.to_path_buf(), e))?;
    }
    Ok(bytes)
}

fn module_basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn module_stem(basename: &str) -> &str {
    basename
        .rsplit_once('.')
        .map_or(basename, |(stem, _)| stem)
}

fn app_dump_kind(lower_basename: &str) -> (DumpDialect, &'static str) {
    if lower_basename.ends_with(".exe") {
        (DumpDialect::Line, "line")
    } else {
        (DumpDialect::Elf, "elf")
    }
}

fn expected_dialect(module_name: &str) -> DumpDialect {
    let lower = module_basename(module_name).to_ascii_lowercase();
    if lower.ends_with(".dll") {
        DumpDialect::Globals
    } else if lower.contains(".so") {
        DumpDialect::Elf
    } else {
        app_dump_kind(&lower).0
    }
}

fn is_msvc_runtime_pdb(lpdb: &str) -> bool {
    let Some(rest) = lpdb.strip_prefix("msvc") else {
        return false;
    };
    let bytes = rest.as_bytes();
    bytes.len() >= 8
        && matches!(bytes[0], b'p' | b'r')
        && bytes[1] == b'1'
        && (b'2'..=b'9').contains(&bytes[2])
        && bytes[3].is_ascii_digit()
        && rest[4..].starts_with(".pdb")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gz(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap();
    }

    fn store_at(root: &Path) -> SymbolStore {
        SymbolStore::new(StoreConfig {
            roots: vec![root.to_path_buf()],
            ..StoreConfig::default()
        })
    }

    const LINE_DUMP: &[u8] =
        b"** main\nline 42 at [00001050][0001:00000050], len = 0x5\tapp.cpp (MD5: X)\n";

    #[test]
    fn exact_version_match() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_05/App.line.gz"),
            LINE_DUMP,
        );
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        let table = store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(table.len(), 1);
        assert_eq!(table.dialect(), Some(DumpDialect::Line));
        assert_eq!(cache.effective_version("2024_01_05"), "2024_01_05");
    }

    #[test]
    fn fuzzy_fallback_within_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_04/App.line.gz"),
            LINE_DUMP,
        );
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        let table = store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(table.len(), 1);
        assert_eq!(cache.effective_version("2024_01_05"), "2024_01_04");
    }

    #[test]
    fn fuzzy_fallback_refuses_out_of_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_01/App.line.gz"),
            LINE_DUMP,
        );
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        let table = store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert!(table.is_empty());
        assert_eq!(cache.effective_version("2024_01_05"), "2024_01_05");
    }

    #[test]
    fn fuzzy_fallback_prefers_the_nearest_date() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_02/App.line.gz"),
            LINE_DUMP,
        );
        write_gz(
            &dir.path().join("win32/2024_01_04/App.line.gz"),
            LINE_DUMP,
        );
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            tolerance_days: 5,
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(cache.effective_version("2024_01_05"), "2024_01_04");
    }

    #[test]
    fn fuzzy_fallback_tie_goes_to_the_older_build() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/2024_01_04/App.line.gz"),
            LINE_DUMP,
        );
        write_gz(
            &dir.path().join("win32/2024_01_06/App.line.gz"),
            LINE_DUMP,
        );
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(cache.effective_version("2024_01_05"), "2024_01_04");
    }

    #[test]
    fn channel_directories_are_searched() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/steam/2024_01_05/App.line.gz"),
            LINE_DUMP,
        );
        let mut config = StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            ..StoreConfig::default()
        };
        config
            .channels
            .insert("App".to_string(), vec!["steam".to_string(), "release".to_string()]);
        let store = SymbolStore::new(config);
        let cache = SymbolCache::new();
        let table = store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn linker_map_in_version_directory() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("win32/2024_01_05/App.map");
        fs::create_dir_all(map.parent().unwrap()).unwrap();
        fs::write(
            &map,
            " Preferred load address is 00400000\n 0001:00000050  ?f@@YAXXZ  00401050 f app.obj\n",
        )
        .unwrap();
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        let table = store.build_table("App.exe", Some("2024_01_05"), &cache);
        assert_eq!(table.dialect(), Some(DumpDialect::Map));
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].rva, 0x1050);
    }

    #[test]
    fn dll_globals_lookup_is_version_independent() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(
            &dir.path().join("win32/symbols/foo.pdb.globals.gz"),
            b"Function: [00001000][0001:00000000] helper\n",
        );
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        let table = store.build_table("foo.dll", None, &cache);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn os_private_dlls_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let cache = SymbolCache::new();
        assert!(store.build_table("ntdll.dll", None, &cache).is_empty());
    }

    struct FixtureGenerator;

    impl DumpGenerator for FixtureGenerator {
        fn generate(&self, _module_name: &str, _dialect: DumpDialect) -> Option<Vec<u8>> {
            Some(b"Function: [00002000][0001:00001000] generated\n".to_vec())
        }
    }

    #[test]
    fn generator_fills_in_and_caches_a_missing_dump() {
        let dir = tempfile::tempdir().unwrap();
        let store = SymbolStore::new(StoreConfig {
            roots: vec![dir.path().to_path_buf()],
            generator: Some(Box::new(FixtureGenerator)),
            ..StoreConfig::default()
        });
        let cache = SymbolCache::new();
        let table = store.build_table("bar.dll", None, &cache);
        assert_eq!(table.len(), 1);
        assert!(dir
            .path()
            .join("win32/symbols/bar.pdb.globals.gz")
            .is_file());
        // A second store must now find the cached dump without the generator.
        let plain = store_at(dir.path());
        assert_eq!(plain.build_table("bar.dll", None, &cache).len(), 1);
    }

    #[test]
    fn msvc_runtime_pdb_naming() {
        assert!(is_msvc_runtime_pdb("msvcp120.pdb"));
        assert!(is_msvc_runtime_pdb("msvcr140.pdb"));
        assert!(!is_msvc_runtime_pdb("msvcp110.pdb"));
        assert!(!is_msvc_runtime_pdb("foo.pdb"));
    }
}
