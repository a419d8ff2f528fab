//! Dia2Dump `-g -p` dumps: one `Function: [<RVA>][<seg>:<off>] <name>` or
//! `PublicSymbol: …` row per symbol, with no line information.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::rest;
use nom::sequence::terminated;
use nom::IResult;

use super::{hex_str, lines, trim};
use crate::table::SymbolEntry;

pub(super) fn parse(data: &[u8]) -> Vec<SymbolEntry> {
    let mut entries = Vec::new();
    for line in lines(data) {
        if let Ok((_rest, (rva, name))) = symbol_row(trim(line)) {
            let name = String::from_utf8_lossy(trim(name)).into_owned();
            entries.push(SymbolEntry {
                name,
                rva,
                line: None,
                file: None,
            });
        }
    }
    entries
}

fn symbol_row(input: &[u8]) -> IResult<&[u8], (u64, &[u8])> {
    let (input, _) = alt((tag("Function"), tag("PublicSymbol")))(input)?;
    let (input, _) = tag(": [")(input)?;
    let (input, rva) = terminated(hex_str::<u64>, tag("]["))(input)?;
    let (input, _segment) = terminated(hex_str::<u64>, tag(":"))(input)?;
    let (input, _offset) = terminated(hex_str::<u64>, tag("] "))(input)?;
    let (input, name) = rest(input)?;
    Ok((input, (rva, name)))
}
