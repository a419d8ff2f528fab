//! Parsers for the symbol-dump dialects the store knows how to read.
//!
//! Each dialect is the textual output of an external tool; the parsers only
//! ever see already-decompressed bytes and never perform I/O. Unparsable
//! lines are skipped, so a corrupt dump degrades to a smaller table rather
//! than an error.

mod dia_globals;
mod dia_line;
mod linker_map;
mod readelf;

use memchr::memchr;
use nom::error::{Error, ErrorKind, ParseError};
use nom::{Err, IResult};

use crate::table::SymbolTable;

/// The recognized on-disk symbol-dump formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpDialect {
    /// Dia2Dump `-l` function/line dump (Windows, with line info).
    Line,
    /// Dia2Dump `-g -p` globals dump (Windows, no line info).
    Globals,
    /// MSVC linker-generated `.map` file (Windows, mangled names only).
    Map,
    /// `readelf -lsW -wL` output piped through `c++filt` (Linux).
    Elf,
}

impl DumpDialect {
    pub fn parse(self, data: &[u8]) -> SymbolTable {
        let entries = match self {
            DumpDialect::Line => dia_line::parse(data),
            DumpDialect::Globals => dia_globals::parse(data),
            DumpDialect::Map => linker_map::parse(data),
            DumpDialect::Elf => readelf::parse(data),
        };
        SymbolTable::new(self, entries)
    }
}

/// Iterates over lines, excluding `\n` and any trailing `\r`s.
pub(crate) struct Lines<'a> {
    rest: &'a [u8],
}

pub(crate) fn lines(data: &[u8]) -> Lines<'_> {
    Lines { rest: data }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let mut line = match memchr(b'\n', self.rest) {
            Some(line_break) => {
                let line = &self.rest[..line_break];
                self.rest = &self.rest[(line_break + 1)..];
                line
            }
            None => {
                let line = self.rest;
                self.rest = &[];
                line
            }
        };
        while line.last() == Some(&b'\r') {
            line = &line[..(line.len() - 1)];
        }
        Some(line)
    }
}

pub(crate) fn trim(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

/// Match a hex string, parse it to a u32 or a u64.
pub(crate) fn hex_str<T: std::ops::Shl<T, Output = T> + std::ops::BitOr<T, Output = T> + From<u8>>(
    input: &[u8],
) -> IResult<&[u8], T> {
    // Two hex digits per byte of the output type.
    let max_len = std::mem::size_of::<T>() * 2;

    let mut res: T = T::from(0);
    let mut k = 0;
    for v in input.iter().take(max_len) {
        let digit = match (*v as char).to_digit(16) {
            Some(v) => v,
            None => break,
        };
        res = res << T::from(4);
        res = res | T::from(digit as u8);
        k += 1;
    }
    if k == 0 {
        return Err(Err::Error(Error::from_error_kind(
            input,
            ErrorKind::HexDigit,
        )));
    }
    Ok((&input[k..], res))
}

/// Match a decimal string, parse it to a u32.
pub(crate) fn decimal_u32(input: &[u8]) -> IResult<&[u8], u32> {
    const MAX_LEN: usize = 10; // u32::MAX has 10 decimal digits
    let mut res: u64 = 0;
    let mut k = 0;
    for v in input.iter().take(MAX_LEN) {
        let digit_value = match (*v as char).to_digit(10) {
            Some(v) => v,
            None => break,
        };
        res = res * 10 + u64::from(digit_value);
        k += 1;
    }
    if k == 0 {
        return Err(Err::Error(Error::from_error_kind(input, ErrorKind::Digit)));
    }
    let res = u32::try_from(res)
        .map_err(|_| Err::Error(Error::from_error_kind(input, ErrorKind::TooLarge)))?;
    Ok((&input[k..], res))
}

/// Object-file paths in Windows dumps come with backslashes and `.obj`
/// suffixes; rewrite them to the source spelling.
pub(crate) fn tidy_source_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    match path.strip_suffix(".obj") {
        Some(stem) => format!("{stem}.cpp"),
        None => path,
    }
}
