//! Column qualification inside free-form SQL fragments.
//!
//! Fragments are split into code and non-code segments (string literals,
//! quoted identifiers, comments). Only code segments are touched, and only
//! whole identifiers that are neither already qualified nor followed by a
//! qualifier dot or a call parenthesis.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::expect_used)] // constant pattern
static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").expect("identifier regex is valid")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unterminated {kind} at byte {offset}")]
pub struct RawScanError {
    pub kind: &'static str,
    pub offset: usize,
}

/// Prefix every ambiguous identifier in `sql` with `qualifier.`.
///
/// # Errors
/// `RawScanError` when a literal, quoted identifier or block comment is not closed.
pub fn qualify_raw(
    sql: &str,
    qualifier: &str,
    ambiguous: &HashSet<String>,
) -> Result<String, RawScanError> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 16);
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let end = match bytes[i] {
            b'\'' => Some(closing(bytes, i, b'\'', "string literal")?),
            b'"' => Some(closing(bytes, i, b'"', "quoted identifier")?),
            b'`' => Some(closing(bytes, i, b'`', "quoted identifier")?),
            b'-' if bytes.get(i + 1) == Some(&b'-') => Some(line_end(bytes, i)),
            b'/' if bytes.get(i + 1) == Some(&b'*') => Some(block_end(bytes, i)?),
            _ => None,
        };
        if let Some(end) = end {
            qualify_code(&sql[code_start..i], qualifier, ambiguous, &mut out);
            out.push_str(&sql[i..end]);
            i = end;
            code_start = end;
        } else {
            i += 1;
        }
    }
    qualify_code(&sql[code_start..], qualifier, ambiguous, &mut out);
    Ok(out)
}

fn qualify_code(code: &str, qualifier: &str, ambiguous: &HashSet<String>, out: &mut String) {
    let mut last = 0;
    for m in IDENT.find_iter(code) {
        if !ambiguous.contains(m.as_str()) {
            continue;
        }
        let before = code[..m.start()].trim_end().chars().next_back();
        let after = code[m.end()..].trim_start().chars().next();
        if matches!(before, Some('.' | ':' | '@' | '$')) || matches!(after, Some('.' | '(')) {
            continue;
        }
        out.push_str(&code[last..m.start()]);
        out.push_str(qualifier);
        out.push('.');
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&code[last..]);
}

/// Index just past the closing quote; a doubled quote is an escape.
fn closing(bytes: &[u8], start: usize, quote: u8, kind: &'static str) -> Result<usize, RawScanError> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(RawScanError {
        kind,
        offset: start,
    })
}

fn line_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn block_end(bytes: &[u8], start: usize) -> Result<usize, RawScanError> {
    bytes[start + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map(|p| start + 2 + p + 2)
        .ok_or(RawScanError {
            kind: "block comment",
            offset: start,
        })
}
