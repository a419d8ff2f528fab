//! Dia2Dump `-l` dumps: a `** <function>` marker opens each function block,
//! followed by one `line <N> at [<RVA>][<seg>:<off>], len = 0x<len>` record
//! per source line. A record may carry a `\t<file> (MD5…` tail that switches
//! the current source file.

use memchr::memmem;
use nom::bytes::complete::tag;
use nom::combinator::rest;
use nom::sequence::terminated;
use nom::IResult;

use super::{decimal_u32, hex_str, lines, trim};
use crate::table::SymbolEntry;

pub(super) fn parse(data: &[u8]) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    let mut current_function: Option<String> = None;
    let mut current_file: Option<String> = None;
    for line in lines(data) {
        let line = trim(line);
        if let Ok((_rest, name)) = function_marker(line) {
            current_function = Some(String::from_utf8_lossy(name).into_owned());
            continue;
        }
        if let Ok((_rest, record)) = line_record(line) {
            let Some(function) = &current_function else {
                continue;
            };
            if let Some(file) = record.file {
                current_file = Some(file);
            }
            entries.push(SymbolEntry {
                name: function.clone(),
                rva: record.rva,
                line: Some(record.line),
                file: current_file.clone(),
            });
        }
    }
    entries
}

struct LineRecord {
    line: u32,
    rva: u64,
    file: Option<String>,
}

fn function_marker(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag("** ")(input)?;
    rest(input)
}

fn line_record(input: &[u8]) -> IResult<&[u8], LineRecord> {
    let (input, _) = tag("line ")(input)?;
    let (input, line) = terminated(decimal_u32, tag(" at ["))(input)?;
    let (input, rva) = terminated(hex_str::<u64>, tag("]["))(input)?;
    let (input, _segment) = terminated(hex_str::<u64>, tag(":"))(input)?;
    let (input, _offset) = terminated(hex_str::<u64>, tag("], len = 0x"))(input)?;
    let (input, _len) = hex_str::<u64>(input)?;
    let file = input.strip_prefix(b"\t").and_then(|tail| {
        memmem::find(tail, b" (MD5")
            .map(|end| super::tidy_source_path(&String::from_utf8_lossy(&tail[..end])))
    });
    Ok((input, LineRecord { line, rva, file }))
}
