//! Streaming RESP2/RESP3 decoder.
//!
//! [`decode`] reads one frame from the front of a buffer and returns
//! `Ok((Reply, bytes_consumed))`, `Err(Incomplete)` when more data is
//! needed, or `Err(Protocol(…))` on malformed input.
//!
//! The buffer is a ref-counted `Bytes` so bulk string payloads are
//! extracted with zero-copy `slice()`.

use bytes::Bytes;
use memchr::memchr;

use crate::error::{Error, Result};
use crate::resp::types::Reply;

/// Decode one RESP frame from the front of `buf`.
///
/// Returns the decoded value and the number of bytes consumed. Callers
/// seeing `Err(Incomplete)` should read more data and retry from the
/// same offset.
pub fn decode(buf: &Bytes) -> Result<(Reply, usize)> {
    let mut cur = Cursor { buf, pos: 0 };
    let value = cur.value()?;
    Ok((value, cur.pos))
}

/// Decode from a plain byte slice (copies into `Bytes` first).
///
/// Prefer [`decode`] with an existing `Bytes` for zero-copy bulk strings.
pub fn decode_slice(buf: &[u8]) -> Result<(Reply, usize)> {
    decode(&Bytes::copy_from_slice(buf))
}

/// Length in bytes of one complete frame at the front of `buf`, without
/// building a `Reply` tree. Used by the pipeline read path to skip over
/// frames cheaply.
pub fn frame_len(buf: &[u8]) -> Result<usize> {
    let Some(&marker) = buf.first() else {
        return Err(Error::Incomplete);
    };
    match marker {
        b'+' | b'-' | b':' | b',' | b'(' => {
            let (_, end) = line(buf, 1)?;
            Ok(end)
        }
        b'_' => {
            if buf.len() < 3 {
                return Err(Error::Incomplete);
            }
            Ok(3)
        }
        b'#' => {
            if buf.len() < 4 {
                return Err(Error::Incomplete);
            }
            Ok(4)
        }
        b'$' | b'!' | b'=' => {
            let (header, end) = line(buf, 1)?;
            let len = ascii_i64(header)?;
            if len < 0 {
                return Ok(end); // null bulk
            }
            let total = end + len as usize + 2;
            if buf.len() < total {
                return Err(Error::Incomplete);
            }
            Ok(total)
        }
        b'*' | b'~' | b'>' => {
            let (header, mut end) = line(buf, 1)?;
            let count = ascii_i64(header)?;
            if count < 0 {
                return Ok(end); // null array
            }
            for _ in 0..count {
                end += frame_len(&buf[end..])?;
            }
            Ok(end)
        }
        b'%' => {
            let (header, mut end) = line(buf, 1)?;
            let count = expect_count(ascii_i64(header)?, "map")?;
            for _ in 0..count * 2 {
                end += frame_len(&buf[end..])?;
            }
            Ok(end)
        }
        b'|' => {
            let (header, mut end) = line(buf, 1)?;
            let count = expect_count(ascii_i64(header)?, "attribute")?;
            // count key/value pairs, then the actual reply
            for _ in 0..count * 2 + 1 {
                end += frame_len(&buf[end..])?;
            }
            Ok(end)
        }
        other => Err(Error::Protocol(format!(
            "unknown RESP type byte: 0x{other:02x}"
        ))),
    }
}

// ── Cursor ────────────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl Cursor<'_> {
    fn value(&mut self) -> Result<Reply> {
        let Some(&marker) = self.buf.get(self.pos) else {
            return Err(Error::Incomplete);
        };
        self.pos += 1;
        match marker {
            b'+' => {
                let text = self.utf8_line("simple string")?;
                Ok(Reply::SimpleString(text))
            }
            b'-' => {
                let text = self.utf8_line("error")?;
                Ok(Reply::Error(text))
            }
            b':' => {
                let n = self.int_line()?;
                Ok(Reply::Integer(n))
            }
            b'$' => self.bulk_string(),
            b'*' => match self.maybe_count()? {
                None => Ok(Reply::Null),
                Some(count) => Ok(Reply::Array(self.values(count)?)),
            },
            b'_' => {
                self.expect_crlf("null")?;
                Ok(Reply::Null)
            }
            b'#' => self.boolean(),
            b',' => self.double(),
            b'(' => self.big_number(),
            b'!' => {
                let text = self.blob_utf8("bulk error")?;
                Ok(Reply::BulkError(text))
            }
            b'=' => self.verbatim(),
            b'%' => {
                let count = self.count("map")?;
                Ok(Reply::Map(self.pairs(count)?))
            }
            b'~' => {
                let count = self.count("set")?;
                Ok(Reply::Set(self.values(count)?))
            }
            b'>' => self.push(),
            b'|' => self.attribute(),
            other => Err(Error::Protocol(format!(
                "unknown RESP type byte: 0x{other:02x}"
            ))),
        }
    }

    /// Consume one CRLF-terminated line, returning its bytes.
    fn line(&mut self) -> Result<&[u8]> {
        let (contents, end) = line(self.buf, self.pos)?;
        self.pos = end;
        Ok(contents)
    }

    fn utf8_line(&mut self, what: &str) -> Result<String> {
        let raw = self.line()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in {what}: {e}")))
    }

    fn int_line(&mut self) -> Result<i64> {
        let raw = self.line()?;
        ascii_i64(raw)
    }

    /// Read a count header; negative means a RESP2 null composite.
    fn maybe_count(&mut self) -> Result<Option<usize>> {
        let n = self.int_line()?;
        if n < 0 {
            Ok(None)
        } else {
            Ok(Some(n as usize))
        }
    }

    /// Read a count header where negative is a protocol error.
    fn count(&mut self, what: &str) -> Result<usize> {
        expect_count(self.int_line()?, what)
    }

    fn values(&mut self, count: usize) -> Result<Vec<Reply>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.value()?);
        }
        Ok(out)
    }

    fn pairs(&mut self, count: usize) -> Result<Vec<(Reply, Reply)>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.value()?;
            let val = self.value()?;
            out.push((key, val));
        }
        Ok(out)
    }

    /// Consume a length-prefixed blob (after the marker), returning the
    /// payload as a zero-copy slice. `None` for a RESP2 null bulk.
    fn blob(&mut self, what: &str) -> Result<Option<Bytes>> {
        let Some(len) = self.maybe_count()? else {
            return Ok(None);
        };
        let start = self.pos;
        let end = start + len;
        if self.buf.len() < end + 2 {
            return Err(Error::Incomplete);
        }
        if self.buf[end] != b'\r' || self.buf[end + 1] != b'\n' {
            return Err(Error::Protocol(format!("{what} not terminated by \\r\\n")));
        }
        self.pos = end + 2;
        Ok(Some(self.buf.slice(start..end)))
    }

    fn blob_utf8(&mut self, what: &str) -> Result<String> {
        let raw = self
            .blob(what)?
            .ok_or_else(|| Error::Protocol(format!("negative {what} length")))?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in {what}: {e}")))
    }

    fn bulk_string(&mut self) -> Result<Reply> {
        match self.blob("bulk string")? {
            Some(data) => Ok(Reply::BulkString(data)),
            None => Ok(Reply::Null),
        }
    }

    fn boolean(&mut self) -> Result<Reply> {
        if self.buf.len() < self.pos + 3 {
            return Err(Error::Incomplete);
        }
        let value = match self.buf[self.pos] {
            b't' => true,
            b'f' => false,
            other => {
                return Err(Error::Protocol(format!(
                    "invalid boolean value: 0x{other:02x}"
                )));
            }
        };
        self.pos += 1;
        self.expect_crlf("boolean")?;
        Ok(Reply::Boolean(value))
    }

    fn double(&mut self) -> Result<Reply> {
        let text = self.utf8_line("double")?;
        let value = match text.as_str() {
            "inf" | "+inf" => f64::INFINITY,
            "-inf" => f64::NEG_INFINITY,
            "nan" => f64::NAN,
            other => other
                .parse::<f64>()
                .map_err(|e| Error::Protocol(format!("invalid double: {e}")))?,
        };
        Ok(Reply::Double(value))
    }

    fn big_number(&mut self) -> Result<Reply> {
        let text = self.utf8_line("big number")?;
        let digits = text.strip_prefix(['+', '-']).unwrap_or(&text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol(format!("invalid big number: {text}")));
        }
        Ok(Reply::BigNumber(text))
    }

    fn verbatim(&mut self) -> Result<Reply> {
        let raw = self
            .blob("verbatim string")?
            .ok_or_else(|| Error::Protocol("negative verbatim string length".into()))?;
        // 3-byte format tag, ':', payload
        if raw.len() < 4 || raw[3] != b':' {
            return Err(Error::Protocol(
                "verbatim string missing format prefix".into(),
            ));
        }
        let format = String::from_utf8(raw[..3].to_vec())
            .map_err(|e| Error::Protocol(format!("invalid verbatim format: {e}")))?;
        let text = String::from_utf8(raw[4..].to_vec())
            .map_err(|e| Error::Protocol(format!("invalid verbatim text: {e}")))?;
        Ok(Reply::Verbatim { format, text })
    }

    fn push(&mut self) -> Result<Reply> {
        let count = self.count("push")?;
        if count == 0 {
            return Err(Error::Protocol(
                "push frame must carry at least a kind element".into(),
            ));
        }
        let kind = match self.value()? {
            Reply::SimpleString(s) => s,
            Reply::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| Error::Protocol(format!("invalid push kind: {e}")))?,
            other => {
                return Err(Error::Protocol(format!(
                    "push kind must be a string, got {}",
                    other.type_name()
                )));
            }
        };
        let data = self.values(count - 1)?;
        Ok(Reply::Push { kind, data })
    }

    fn attribute(&mut self) -> Result<Reply> {
        let count = self.count("attribute")?;
        let attrs = self.pairs(count)?;
        let data = Box::new(self.value()?);
        Ok(Reply::Attribute { data, attrs })
    }

    fn expect_crlf(&mut self, what: &str) -> Result<()> {
        if self.buf.len() < self.pos + 2 {
            return Err(Error::Incomplete);
        }
        if self.buf[self.pos] != b'\r' || self.buf[self.pos + 1] != b'\n' {
            return Err(Error::Protocol(format!("{what} not terminated by \\r\\n")));
        }
        self.pos += 2;
        Ok(())
    }
}

// ── Free helpers ──────────────────────────────────────────────────

/// Find the CRLF-terminated line starting at `buf[offset]`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn line(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    match memchr(b'\r', &buf[offset..]) {
        Some(rel) => {
            let cr = offset + rel;
            if cr + 1 >= buf.len() {
                Err(Error::Incomplete)
            } else if buf[cr + 1] == b'\n' {
                Ok((&buf[offset..cr], cr + 2))
            } else {
                Err(Error::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Err(Error::Incomplete),
    }
}

/// Parse a decimal integer from ASCII bytes without allocating.
fn ascii_i64(bytes: &[u8]) -> Result<i64> {
    let (negative, digits) = match bytes.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        Some(_) => (false, bytes),
        None => return Err(Error::Protocol("empty integer".into())),
    };
    if digits.is_empty() {
        return Err(Error::Protocol("integer has no digits".into()));
    }

    // Accumulate negative so |i64::MIN| never overflows.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| Error::Protocol("integer overflow".into()))?;
    }
    Ok(if negative { n } else { -n })
}

fn expect_count(n: i64, what: &str) -> Result<usize> {
    if n < 0 {
        Err(Error::Protocol(format!("negative {what} count")))
    } else {
        Ok(n as usize)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
