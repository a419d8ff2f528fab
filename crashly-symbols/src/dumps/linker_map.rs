//! MSVC linker `.map` files: whitespace-delimited rows of
//! `<section:offset> <name> <address> … <objfile>`. Only mangled names are
//! symbols worth keeping; everything else in a map file is noise. Addresses
//! are absolute and need the preferred load address subtracted.

use super::{lines, tidy_source_path, trim};
use crate::table::SymbolEntry;

pub(super) fn parse(data: &[u8]) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    let mut load_address: u64 = 0;
    for line in lines(data) {
        let Ok(text) = std::str::from_utf8(trim(line)) else {
            continue;
        };
        if let Some(tail) = text.strip_prefix("Preferred load address is ") {
            if let Ok(address) = u64::from_str_radix(tail.trim(), 16) {
                load_address = address;
            }
            continue;
        }
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let name = fields[1];
        if !(name.starts_with('?') || name.starts_with('_')) {
            continue;
        }
        let Ok(address) = u64::from_str_radix(fields[2], 16) else {
            continue;
        };
        // Rows below the preferred load address are linker bookkeeping.
        let Some(rva) = address.checked_sub(load_address) else {
            continue;
        };
        entries.push(SymbolEntry {
            name: name.to_string(),
            rva,
            line: None,
            file: fields.last().map(|f| tidy_source_path(f)),
        });
    }
    entries
}
