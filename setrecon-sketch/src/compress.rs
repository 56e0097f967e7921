//! Zero-run length encoding for sketch payloads.
//!
//! Strata estimators of small sets are mostly zero buckets. The encoding is
//! a sequence of records:
//!
//! ```text
//! 0x00 len:u16le            -- `len` zero bytes
//! 0x01 len:u16le bytes[len] -- literal bytes
//! ```

use crate::{SketchError, SketchResult};

const TAG_ZEROS: u8 = 0x00;
const TAG_LITERAL: u8 = 0x01;
const MAX_RECORD: usize = u16::MAX as usize;
/// Shorter zero runs are cheaper as part of a literal.
const MIN_ZERO_RUN: usize = 4;

/// Compresses `data`.
#[must_use]
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;
    while i < data.len() {
        if data[i] != 0 {
            i += 1;
            continue;
        }
        let run = data[i..].iter().take_while(|b| **b == 0).count();
        if run >= MIN_ZERO_RUN {
            push_literal(&mut out, &data[literal_start..i]);
            let mut remaining = run;
            while remaining > 0 {
                let n = remaining.min(MAX_RECORD);
                out.push(TAG_ZEROS);
                out.extend_from_slice(&(n as u16).to_le_bytes());
                remaining -= n;
            }
            literal_start = i + run;
        }
        i += run;
    }
    push_literal(&mut out, &data[literal_start..]);
    out
}

fn push_literal(out: &mut Vec<u8>, literal: &[u8]) {
    for chunk in literal.chunks(MAX_RECORD) {
        out.push(TAG_LITERAL);
        out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        out.extend_from_slice(chunk);
    }
}

/// Expands `data`, which must decode to exactly `expected_len` bytes.
pub fn decompress(data: &[u8], expected_len: usize) -> SketchResult<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < 3 {
            return Err(SketchError::Decompress("truncated record header".into()));
        }
        let tag = data[pos];
        let len = u16::from_le_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if out.len() + len > expected_len {
            return Err(SketchError::Decompress(format!(
                "output exceeds expected {expected_len} bytes"
            )));
        }
        match tag {
            TAG_ZEROS => out.resize(out.len() + len, 0),
            TAG_LITERAL => {
                let end = pos + len;
                if end > data.len() {
                    return Err(SketchError::Decompress("truncated literal".into()));
                }
                out.extend_from_slice(&data[pos..end]);
                pos = end;
            }
            other => {
                return Err(SketchError::Decompress(format!("unknown record tag {other:#04x}")));
            }
        }
    }
    if out.len() != expected_len {
        return Err(SketchError::Decompress(format!(
            "decoded {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
