//! Offline crash-report symbolication.
//!
//! This crate maps raw return addresses from application crash logs to
//! function names, file names and line numbers, using pre-generated textual
//! symbol dumps instead of the binaries themselves. It knows four dump
//! dialects (Dia2Dump line and globals dumps, MSVC linker map files, and
//! `readelf` output), locates the right dump per module and build version
//! in an on-disk store with a fuzzy date fallback, and normalizes symbol
//! names on a best-effort basis for display and grouping.
//!
//! The crate does no subprocess work of its own apart from the optional
//! [`DumpGenerator`] collaborator; symbol dumps are consumed as byte
//! streams. Everything expected to go wrong during normal operation —
//! missing dumps, unknown addresses, empty tables — degrades to a
//! placeholder value and a logged warning rather than an error.
//!
//! Symbol tables are memoized in an explicitly passed [`SymbolCache`] whose
//! lifetime is one batch run; the cache is safe to share read-only across
//! workers processing independent logs.

mod cache;
mod demangle;
mod dumps;
mod error;
mod resolve;
mod store;
mod table;
mod version;

pub use cache::{ModuleKey, SymbolCache};
pub use demangle::{normalize, reduce_for_signature};
pub use dumps::DumpDialect;
pub use error::Error;
pub use resolve::{format_address, ModuleInfo, ModuleMap, ResolvedSymbol, Resolver};
pub use store::{CommandDumpGenerator, DumpGenerator, StoreConfig, SymbolStore};
pub use table::{SymbolEntry, SymbolTable};
pub use version::BuildDate;
