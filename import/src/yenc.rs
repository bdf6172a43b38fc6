//! yEnc article body decoding.
//!
//! Usenet binaries arrive as yEnc-framed text: a `=ybegin` header line,
//! optionally a `=ypart` line for multi-part posts, raw data lines where
//! every byte is payload+42 (with `=` escaping for critical characters), and
//! a trailing `=yend` line. The pool delivers the body with NNTP dot-stuffing
//! already undone; this module turns it back into raw payload bytes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The body carried no `=ybegin` line at all.
    #[error("article body is not yEnc encoded")]
    MissingHeader,

    /// A data line ended in a dangling escape character.
    #[error("truncated escape sequence in yEnc data")]
    TruncatedEscape,
}

/// Decode a full yEnc article body into its payload bytes.
///
/// Lines before `=ybegin` and after `=yend` are ignored, as are the control
/// lines themselves. Everything in between decodes byte-wise: `ch - 42`,
/// with `=`-escaped bytes decoding as `ch - 64 - 42`.
pub fn decode(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(body.len());
    let mut in_data = false;

    for line in body.split(|b| *b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };

        if line.starts_with(b"=ybegin ") {
            in_data = true;
            continue;
        }
        if !in_data {
            continue;
        }
        if line.starts_with(b"=ypart ") {
            continue;
        }
        if line.starts_with(b"=yend") {
            return Ok(out);
        }

        decode_line(line, &mut out)?;
    }

    if in_data {
        // Tolerate a missing =yend trailer; the segment range check
        // downstream catches short payloads.
        Ok(out)
    } else {
        Err(DecodeError::MissingHeader)
    }
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) -> Result<(), DecodeError> {
    let mut bytes = line.iter();
    while let Some(&b) = bytes.next() {
        if b == b'=' {
            match bytes.next() {
                Some(&esc) => out.push(esc.wrapping_sub(64).wrapping_sub(42)),
                None => return Err(DecodeError::TruncatedEscape),
            }
        } else {
            out.push(b.wrapping_sub(42));
        }
    }
    Ok(())
}

/// Encode payload bytes as a single-part yEnc body. Test helper for the
/// decoder and the in-memory pool; real articles come off the wire.
#[cfg(test)]
pub(crate) fn encode(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 64);
    out.extend_from_slice(
        format!("=ybegin line=128 size={} name={}\r\n", data.len(), name).as_bytes(),
    );

    let mut col = 0usize;
    for &b in data {
        let enc = b.wrapping_add(42);
        // Escape NUL, CR, LF and '=', plus leading dots/tabs for safety.
        if matches!(enc, 0x00 | 0x0a | 0x0d | b'=') || (col == 0 && matches!(enc, b'.' | b'\t')) {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= 128 {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(format!("=yend size={}\r\n", data.len()).as_bytes());
    out
}
