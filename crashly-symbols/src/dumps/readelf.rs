//! `readelf -lsW -wL` dumps (typically piped through `c++filt`).
//!
//! Two logical passes over one stream: the image base comes from the first
//! `LOAD` program header and rebases every `FUNC` symbol-table row; the
//! decoded-line section (after the `File name` header) attributes each line
//! record to the floor function. Functions finally contribute their own
//! first-seen file and minimum line as an entry.

use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::space1;
use nom::combinator::rest;
use nom::sequence::terminated;
use nom::IResult;

use super::{decimal_u32, hex_str, lines, trim};
use crate::table::SymbolEntry;

enum Section {
    ProgramHeaders,
    Symbols,
    DecodedLines,
}

pub(super) fn parse(data: &[u8]) -> Vec<SymbolEntry> {
    let mut section = Section::ProgramHeaders;
    let mut base_address: u64 = 0;
    let mut functions: Vec<SymbolEntry> = Vec::new();
    let mut entries: Vec<SymbolEntry> = Vec::new();
    let mut current_file: Option<String> = None;

    for line in lines(data) {
        match section {
            Section::ProgramHeaders => {
                if let Ok((_rest, vaddr)) = load_header(trim(line)) {
                    base_address = vaddr;
                    section = Section::Symbols;
                }
            }
            Section::Symbols => {
                if let Ok((_rest, (value, name))) = func_symbol_row(trim(line)) {
                    if let Some(rva) = value.checked_sub(base_address) {
                        functions.push(SymbolEntry {
                            name: String::from_utf8_lossy(trim(name)).into_owned(),
                            rva,
                            line: None,
                            file: None,
                        });
                    }
                } else if line.starts_with(b"File name") {
                    functions.sort_by_key(|f| f.rva);
                    section = Section::DecodedLines;
                }
            }
            Section::DecodedLines => {
                if let Ok((_rest, (line_number, address))) = line_record(line) {
                    let Some(rva) = address.checked_sub(base_address) else {
                        continue;
                    };
                    // Floor search; records before the first function have
                    // no owner and are dropped.
                    let index = match functions.binary_search_by_key(&rva, |f| f.rva) {
                        Ok(i) => i,
                        Err(0) => continue,
                        Err(i) => i - 1,
                    };
                    let function = &mut functions[index];
                    entries.push(SymbolEntry {
                        name: function.name.clone(),
                        rva,
                        line: Some(line_number),
                        file: current_file.clone(),
                    });
                    match function.line {
                        None => {
                            function.line = Some(line_number);
                            function.file = current_file.clone();
                        }
                        Some(existing) => function.line = Some(existing.min(line_number)),
                    }
                } else if let Some(file) = file_context(line) {
                    current_file = Some(file);
                }
            }
        }
    }

    entries.extend(functions);
    entries
}

fn load_header(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, _) = terminated(tag("LOAD"), space1)(input)?;
    let (input, _offset) = terminated(tag("0x"), hex_str::<u64>)(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag("0x")(input)?;
    hex_str::<u64>(input)
}

fn func_symbol_row(input: &[u8]) -> IResult<&[u8], (u64, &[u8])> {
    let (input, _num) = terminated(decimal_u32, tag(":"))(input)?;
    let (input, _) = space1(input)?;
    let (input, value) = terminated(hex_str::<u64>, space1)(input)?;
    let (input, _size) = terminated(decimal_u32, space1)(input)?;
    let (input, _) = terminated(tag("FUNC"), space1)(input)?;
    let (input, _bind) = terminated(take_while1(|b: u8| b.is_ascii_uppercase()), space1)(input)?;
    let (input, _vis) = terminated(take_while1(|b: u8| b.is_ascii_uppercase()), space1)(input)?;
    let (input, _ndx) = terminated(
        take_while1(|b: u8| b.is_ascii_uppercase() || b.is_ascii_digit()),
        space1,
    )(input)?;
    let (input, name) = rest(input)?;
    Ok((input, (value, name)))
}

fn line_record(input: &[u8]) -> IResult<&[u8], (u32, u64)> {
    let (input, _cu) = terminated(take_while1(|b: u8| b != b' '), space1)(input)?;
    let (input, line_number) = terminated(decimal_u32, space1)(input)?;
    let (input, _) = tag("0x")(input)?;
    let (input, address) = hex_str::<u64>(input)?;
    Ok((input, (line_number, address)))
}

// A lone `<path>:` line switches the current source file.
fn file_context(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?;
    let path = text.strip_suffix(':')?;
    if path.is_empty()
        || !path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/'))
    {
        return None;
    }
    Some(path.to_string())
}
