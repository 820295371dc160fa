// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Incremental MessagePack token codec.
//!
//! `read_token`/`write_token` each consume or produce exactly one
//! [`Token`] at a time against a caller-owned byte cursor. Both are
//! resumable: a short input yields [`Status::Eof`] and the next call
//! picks up exactly where the previous one stopped, using the small
//! pending buffer in [`Tokbuf`]. Header encode/decode never allocates;
//! owned buffers are only introduced one layer up, in the object
//! parser, when it materializes Str/Bin/Ext payloads.

/// Maximum encoded length of a token header: type byte plus an 8-byte
/// value (64-bit int/float), or type byte + 4-byte length + 1-byte ext
/// type for `ext 32`.
const MAX_TOKEN_LEN: usize = 9;

/// One MessagePack element header, or a slice of a str/bin/ext payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    Nil,
    Bool(bool),
    UInt(u64),
    SInt(i64),
    Float(f64),
    Array(u32),
    Map(u32),
    Str(u32),
    Bin(u32),
    Ext(i8, u32),
    /// A slice of the payload following a Str/Bin/Ext header.
    Chunk(&'a [u8]),
}

impl Token<'_> {
    /// True for Str/Bin/Ext headers, which the reader always follows
    /// with one or more `Chunk` tokens summing to the header length.
    pub fn opens_chunk_run(&self) -> bool {
        matches!(self, Token::Str(_) | Token::Bin(_) | Token::Ext(_, _))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Token::Array(_) | Token::Map(_))
    }
}

/// Outcome of a single `read_token`/`write_token` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The token was fully consumed/produced.
    Ok,
    /// Input was exhausted before a full token could be read/written;
    /// retry with more input (recoverable).
    Eof,
    /// The byte stream is malformed; terminal for the current decode.
    Error,
}

/// Small pending buffer that lets `read_token`/`write_token` straddle a
/// byte-boundary cut in the caller's buffer.
pub struct Tokbuf {
    pending: [u8; MAX_TOKEN_LEN],
    /// Bytes currently buffered in `pending`.
    ppos: usize,
    /// Total bytes the in-progress header needs (0 when idle).
    want: usize,
    /// Remaining bytes of a str/bin/ext payload being streamed through
    /// as `Chunk` tokens without copying (read side passthrough mode).
    passthrough: u32,
    /// A chunk write that didn't fully fit in one call: owned copy of
    /// the remaining bytes plus how many have been written so far.
    pending_chunk: Option<(Vec<u8>, usize)>,
}

impl Tokbuf {
    pub fn new() -> Self {
        Tokbuf {
            pending: [0; MAX_TOKEN_LEN],
            ppos: 0,
            want: 0,
            passthrough: 0,
            pending_chunk: None,
        }
    }
}

impl Default for Tokbuf {
    fn default() -> Self {
        Self::new()
    }
}

fn min_u32_usize(a: u32, b: usize) -> u32 {
    if (a as usize) < b {
        a
    } else {
        b as u32
    }
}

/// Read one token from `*buf`, advancing `*buf` past the bytes consumed.
///
/// Returns `Status::Eof` when `*buf` does not contain a full token (all
/// of `*buf` is consumed into `tokbuf`'s pending storage either way, so
/// the caller should simply supply more bytes on the next call). `tok`
/// is only meaningful when the return is `Status::Ok`.
pub fn read_token<'a>(tokbuf: &mut Tokbuf, buf: &mut &'a [u8]) -> (Status, Option<Token<'a>>) {
    if tokbuf.passthrough > 0 {
        if buf.is_empty() {
            return (Status::Eof, None);
        }
        let take = min_u32_usize(tokbuf.passthrough, buf.len());
        let (chunk, rest) = buf.split_at(take as usize);
        tokbuf.passthrough -= take;
        *buf = rest;
        return (Status::Ok, Some(Token::Chunk(chunk)));
    }

    if tokbuf.want > 0 {
        let need = tokbuf.want - tokbuf.ppos;
        let take = need.min(buf.len());
        tokbuf.pending[tokbuf.ppos..tokbuf.ppos + take].copy_from_slice(&buf[..take]);
        tokbuf.ppos += take;
        *buf = &buf[take..];
        if tokbuf.ppos < tokbuf.want {
            return (Status::Eof, None);
        }
        let want = tokbuf.want;
        tokbuf.ppos = 0;
        tokbuf.want = 0;
        // SAFETY of lifetime: decoded token never borrows from
        // `tokbuf.pending` (only `Chunk` borrows, and headers never
        // produce one directly), so it's fine to hand back a token
        // with the caller's lifetime `'a`.
        let pending_copy = tokbuf.pending;
        return match decode_header(&pending_copy[..want]) {
            DecodeResult::Ok(tok, consumed) => {
                debug_assert_eq!(consumed, want);
                finish_ok(tokbuf, tok)
            }
            DecodeResult::NeedMore(_) => unreachable!("exact-length buffer must decode"),
            DecodeResult::Error => (Status::Error, None),
        };
    }

    match decode_header(buf) {
        DecodeResult::Ok(tok, consumed) => {
            *buf = &buf[consumed..];
            finish_ok(tokbuf, tok)
        }
        DecodeResult::NeedMore(total) => {
            let take = buf.len();
            tokbuf.pending[..take].copy_from_slice(buf);
            tokbuf.ppos = take;
            tokbuf.want = total;
            *buf = &buf[take..];
            (Status::Eof, None)
        }
        DecodeResult::Error => (Status::Error, None),
    }
}

fn finish_ok<'a>(tokbuf: &mut Tokbuf, tok: Token<'a>) -> (Status, Option<Token<'a>>) {
    if tok.opens_chunk_run() {
        let len = match tok {
            Token::Str(n) | Token::Bin(n) => n,
            Token::Ext(_, n) => n,
            _ => unreachable!(),
        };
        tokbuf.passthrough = len;
    }
    (Status::Ok, Some(tok))
}

enum DecodeResult<'a> {
    /// Decoded token plus number of bytes of `buf` consumed.
    Ok(Token<'a>, usize),
    /// Not enough bytes; total header length required once complete.
    NeedMore(usize),
    Error,
}

/// Decode one token header from the front of `buf` without mutating it.
fn decode_header<'a>(buf: &'a [u8]) -> DecodeResult<'a> {
    if buf.is_empty() {
        return DecodeResult::NeedMore(1);
    }
    let t = buf[0];
    let rest = &buf[1..];

    macro_rules! need {
        ($extra:expr) => {
            if rest.len() < $extra {
                return DecodeResult::NeedMore(1 + $extra);
            }
        };
    }

    let (tok, extra): (Token<'a>, usize) = match t {
        0x00..=0x7f => (Token::UInt(t as u64), 0),
        0x80..=0x8f => (Token::Map((t & 0x0f) as u32), 0),
        0x90..=0x9f => (Token::Array((t & 0x0f) as u32), 0),
        0xa0..=0xbf => (Token::Str((t & 0x1f) as u32), 0),
        0xc0 => (Token::Nil, 0),
        0xc1 => return DecodeResult::Error,
        0xc2 => (Token::Bool(false), 0),
        0xc3 => (Token::Bool(true), 0),
        0xc4 => {
            need!(1);
            (Token::Bin(rest[0] as u32), 1)
        }
        0xc5 => {
            need!(2);
            (Token::Bin(read_be16(rest)), 2)
        }
        0xc6 => {
            need!(4);
            (Token::Bin(read_be32(rest)), 4)
        }
        0xc7 => {
            need!(2);
            (Token::Ext(rest[1] as i8, rest[0] as u32), 2)
        }
        0xc8 => {
            need!(3);
            (Token::Ext(rest[2] as i8, read_be16(rest)), 3)
        }
        0xc9 => {
            need!(5);
            (Token::Ext(rest[4] as i8, read_be32(rest)), 5)
        }
        0xca => {
            need!(4);
            (Token::Float(f32::from_bits(read_be32(rest)) as f64), 4)
        }
        0xcb => {
            need!(8);
            (Token::Float(f64::from_bits(read_be64(rest))), 8)
        }
        0xcc => {
            need!(1);
            (Token::UInt(rest[0] as u64), 1)
        }
        0xcd => {
            need!(2);
            (Token::UInt(read_be16(rest) as u64), 2)
        }
        0xce => {
            need!(4);
            (Token::UInt(read_be32(rest) as u64), 4)
        }
        0xcf => {
            need!(8);
            (Token::UInt(read_be64(rest)), 8)
        }
        0xd0 => {
            need!(1);
            (upgrade_sint(rest[0] as i8 as i64), 1)
        }
        0xd1 => {
            need!(2);
            (upgrade_sint(read_be16(rest) as i16 as i64), 2)
        }
        0xd2 => {
            need!(4);
            (upgrade_sint(read_be32(rest) as i32 as i64), 4)
        }
        0xd3 => {
            need!(8);
            (upgrade_sint(read_be64(rest) as i64), 8)
        }
        0xd4 => {
            need!(1);
            (Token::Ext(rest[0] as i8, 1), 1)
        }
        0xd5 => {
            need!(1);
            (Token::Ext(rest[0] as i8, 2), 1)
        }
        0xd6 => {
            need!(1);
            (Token::Ext(rest[0] as i8, 4), 1)
        }
        0xd7 => {
            need!(1);
            (Token::Ext(rest[0] as i8, 8), 1)
        }
        0xd8 => {
            need!(1);
            (Token::Ext(rest[0] as i8, 16), 1)
        }
        0xd9 => {
            need!(1);
            (Token::Str(rest[0] as u32), 1)
        }
        0xda => {
            need!(2);
            (Token::Str(read_be16(rest)), 2)
        }
        0xdb => {
            need!(4);
            (Token::Str(read_be32(rest)), 4)
        }
        0xdc => {
            need!(2);
            (Token::Array(read_be16(rest)), 2)
        }
        0xdd => {
            need!(4);
            (Token::Array(read_be32(rest)), 4)
        }
        0xde => {
            need!(2);
            (Token::Map(read_be16(rest)), 2)
        }
        0xdf => {
            need!(4);
            (Token::Map(read_be32(rest)), 4)
        }
        0xe0..=0xff => (Token::SInt(t as i8 as i64), 0),
    };

    DecodeResult::Ok(tok, 1 + extra)
}

/// A signed header whose payload turns out non-negative is upgraded to
/// `UInt`, matching the reference unpacker's `if (!msb) tok->type =
/// MPACK_TOKEN_UINT;`. The fixint ranges already split positive and
/// negative at decode time and never reach here.
fn upgrade_sint(v: i64) -> Token<'static> {
    if v >= 0 {
        Token::UInt(v as u64)
    } else {
        Token::SInt(v)
    }
}

fn read_be16(b: &[u8]) -> u32 {
    u16::from_be_bytes([b[0], b[1]]) as u32
}
fn read_be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
fn read_be64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Write one token to `*buf`, advancing `*buf` past the bytes produced.
///
/// `Status::Eof` means the output slice had too little room; call
/// again with the *same* token (for headers) once more space is
/// available, or it is completed automatically on the next call for
/// chunks (the remaining bytes are retained internally).
pub fn write_token(tokbuf: &mut Tokbuf, buf: &mut &mut [u8], tok: &Token<'_>) -> Status {
    if let Some((data, pos)) = tokbuf.pending_chunk.take() {
        return drain_chunk(tokbuf, buf, data, pos);
    }
    if tokbuf.want > 0 {
        return drain_header(tokbuf, buf);
    }

    if let Token::Chunk(data) = tok {
        return drain_chunk(tokbuf, buf, data.to_vec(), 0);
    }

    let mut scratch = [0u8; MAX_TOKEN_LEN];
    let len = encode_header(tok, &mut scratch);

    if buf.len() >= len {
        buf[..len].copy_from_slice(&scratch[..len]);
        let rest = std::mem::take(buf);
        *buf = &mut rest[len..];
        Status::Ok
    } else {
        let avail = buf.len();
        buf[..avail].copy_from_slice(&scratch[..avail]);
        *buf = &mut [];
        tokbuf.pending[..len].copy_from_slice(&scratch[..len]);
        tokbuf.ppos = avail;
        tokbuf.want = len;
        Status::Eof
    }
}

fn drain_header(tokbuf: &mut Tokbuf, buf: &mut &mut [u8]) -> Status {
    let need = tokbuf.want - tokbuf.ppos;
    let take = need.min(buf.len());
    let pending = tokbuf.pending;
    buf[..take].copy_from_slice(&pending[tokbuf.ppos..tokbuf.ppos + take]);
    let rest = std::mem::take(buf);
    *buf = &mut rest[take..];
    tokbuf.ppos += take;
    if tokbuf.ppos == tokbuf.want {
        tokbuf.ppos = 0;
        tokbuf.want = 0;
        Status::Ok
    } else {
        Status::Eof
    }
}

fn drain_chunk(tokbuf: &mut Tokbuf, buf: &mut &mut [u8], data: Vec<u8>, pos: usize) -> Status {
    let remaining = data.len() - pos;
    let count = remaining.min(buf.len());
    buf[..count].copy_from_slice(&data[pos..pos + count]);
    let rest = std::mem::take(buf);
    *buf = &mut rest[count..];
    let new_pos = pos + count;
    if new_pos == data.len() {
        Status::Ok
    } else {
        tokbuf.pending_chunk = Some((data, new_pos));
        Status::Eof
    }
}

/// Shortest-encoding header bytes for `tok`, as an owned `Vec`. For use
/// against a growable sink (a `Vec<u8>` message buffer) where the
/// fixed-window `write_token` resumption machinery isn't needed;
/// `Token::Chunk` is not valid here since it carries no header.
pub fn encode_token_owned(tok: &Token<'_>) -> Vec<u8> {
    let mut scratch = [0u8; MAX_TOKEN_LEN];
    let len = encode_header(tok, &mut scratch);
    scratch[..len].to_vec()
}

/// Shortest-encoding header for `tok`, written into `scratch`. Returns
/// the number of bytes used. `Token::Chunk` is handled separately by
/// the caller (it has no fixed header).
fn encode_header(tok: &Token<'_>, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    match *tok {
        Token::Nil => {
            scratch[0] = 0xc0;
            1
        }
        Token::Bool(false) => {
            scratch[0] = 0xc2;
            1
        }
        Token::Bool(true) => {
            scratch[0] = 0xc3;
            1
        }
        Token::UInt(v) => encode_uint(v, scratch),
        Token::SInt(v) => encode_sint(v, scratch),
        Token::Float(v) => encode_float(v, scratch),
        Token::Array(n) => encode_len(n, 0x90, 0x0f, 0xdc, 0xdd, scratch),
        Token::Map(n) => encode_len(n, 0x80, 0x0f, 0xde, 0xdf, scratch),
        Token::Str(n) => encode_str_len(n, scratch),
        Token::Bin(n) => encode_blob_len(n, 0xc4, 0xc5, 0xc6, scratch),
        Token::Ext(ty, n) => encode_ext(ty, n, scratch),
        Token::Chunk(_) => unreachable!("chunks have no header"),
    }
}

fn encode_uint(v: u64, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    if v <= 0x7f {
        scratch[0] = v as u8;
        1
    } else if v <= 0xff {
        scratch[0] = 0xcc;
        scratch[1] = v as u8;
        2
    } else if v <= 0xffff {
        scratch[0] = 0xcd;
        scratch[1..3].copy_from_slice(&(v as u16).to_be_bytes());
        3
    } else if v <= 0xffff_ffff {
        scratch[0] = 0xce;
        scratch[1..5].copy_from_slice(&(v as u32).to_be_bytes());
        5
    } else {
        scratch[0] = 0xcf;
        scratch[1..9].copy_from_slice(&v.to_be_bytes());
        9
    }
}

fn encode_sint(v: i64, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    if v >= 0 {
        return encode_uint(v as u64, scratch);
    }
    if v >= -32 {
        scratch[0] = v as i8 as u8;
        1
    } else if v >= i8::MIN as i64 {
        scratch[0] = 0xd0;
        scratch[1] = v as i8 as u8;
        2
    } else if v >= i16::MIN as i64 {
        scratch[0] = 0xd1;
        scratch[1..3].copy_from_slice(&(v as i16).to_be_bytes());
        3
    } else if v >= i32::MIN as i64 {
        scratch[0] = 0xd2;
        scratch[1..5].copy_from_slice(&(v as i32).to_be_bytes());
        5
    } else {
        scratch[0] = 0xd3;
        scratch[1..9].copy_from_slice(&v.to_be_bytes());
        9
    }
}

fn encode_float(v: f64, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    // Downgrade to f32 only when the round-trip through it is exact.
    if v as f32 as f64 == v {
        scratch[0] = 0xca;
        scratch[1..5].copy_from_slice(&(v as f32).to_bits().to_be_bytes());
        5
    } else {
        scratch[0] = 0xcb;
        scratch[1..9].copy_from_slice(&v.to_bits().to_be_bytes());
        9
    }
}

fn encode_len(
    n: u32,
    fix_base: u8,
    fix_mask: u32,
    b16: u8,
    b32: u8,
    scratch: &mut [u8; MAX_TOKEN_LEN],
) -> usize {
    if n <= fix_mask {
        scratch[0] = fix_base | (n as u8);
        1
    } else if n <= 0xffff {
        scratch[0] = b16;
        scratch[1..3].copy_from_slice(&(n as u16).to_be_bytes());
        3
    } else {
        scratch[0] = b32;
        scratch[1..5].copy_from_slice(&n.to_be_bytes());
        5
    }
}

fn encode_str_len(n: u32, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    if n <= 0x1f {
        scratch[0] = 0xa0 | (n as u8);
        1
    } else if n <= 0xff {
        scratch[0] = 0xd9;
        scratch[1] = n as u8;
        2
    } else if n <= 0xffff {
        scratch[0] = 0xda;
        scratch[1..3].copy_from_slice(&(n as u16).to_be_bytes());
        3
    } else {
        scratch[0] = 0xdb;
        scratch[1..5].copy_from_slice(&n.to_be_bytes());
        5
    }
}

fn encode_blob_len(n: u32, b8: u8, b16: u8, b32: u8, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    if n <= 0xff {
        scratch[0] = b8;
        scratch[1] = n as u8;
        2
    } else if n <= 0xffff {
        scratch[0] = b16;
        scratch[1..3].copy_from_slice(&(n as u16).to_be_bytes());
        3
    } else {
        scratch[0] = b32;
        scratch[1..5].copy_from_slice(&n.to_be_bytes());
        5
    }
}

fn encode_ext(ty: i8, n: u32, scratch: &mut [u8; MAX_TOKEN_LEN]) -> usize {
    match n {
        1 => {
            scratch[0] = 0xd4;
            scratch[1] = ty as u8;
            2
        }
        2 => {
            scratch[0] = 0xd5;
            scratch[1] = ty as u8;
            2
        }
        4 => {
            scratch[0] = 0xd6;
            scratch[1] = ty as u8;
            2
        }
        8 => {
            scratch[0] = 0xd7;
            scratch[1] = ty as u8;
            2
        }
        16 => {
            scratch[0] = 0xd8;
            scratch[1] = ty as u8;
            2
        }
        _ if n <= 0xff => {
            scratch[0] = 0xc7;
            scratch[1] = n as u8;
            scratch[2] = ty as u8;
            3
        }
        _ if n <= 0xffff => {
            scratch[0] = 0xc8;
            scratch[1..3].copy_from_slice(&(n as u16).to_be_bytes());
            scratch[3] = ty as u8;
            4
        }
        _ => {
            scratch[0] = 0xc9;
            scratch[1..5].copy_from_slice(&n.to_be_bytes());
            scratch[5] = ty as u8;
            6
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all<'a>(tokbuf: &mut Tokbuf, mut buf: &'a [u8]) -> Vec<Token<'a>> {
        let mut out = Vec::new();
        loop {
            match read_token(tokbuf, &mut buf) {
                (Status::Ok, Some(tok)) => out.push(tok),
                (Status::Eof, None) => {
                    if buf.is_empty() {
                        break;
                    }
                }
                (Status::Error, _) => panic!("decode error"),
                _ => unreachable!(),
            }
        }
        out
    }

    #[test]
    fn positive_fixint_roundtrip() {
        let mut wb = Tokbuf::new();
        let mut out = [0u8; 16];
        let mut w: &mut [u8] = &mut out;
        assert_eq!(write_token(&mut wb, &mut w, &Token::UInt(42)), Status::Ok);
        let written = 16 - w.len();

        let mut rb = Tokbuf::new();
        let toks = read_all(&mut rb, &out[..written]);
        assert_eq!(toks, vec![Token::UInt(42)]);
        assert_eq!(written, 1);
    }

    #[test]
    fn uint_boundary_transitions() {
        let cases: &[(u64, usize)] = &[
            (127, 1),
            (128, 2),
            (255, 2),
            (256, 3),
            (65535, 3),
            (65536, 5),
            (u32::MAX as u64, 5),
            (u32::MAX as u64 + 1, 9),
        ];
        for &(v, expected_len) in cases {
            let mut wb = Tokbuf::new();
            let mut out = [0u8; 16];
            let mut w: &mut [u8] = &mut out;
            write_token(&mut wb, &mut w, &Token::UInt(v));
            let written = 16 - w.len();
            assert_eq!(written, expected_len, "uint {v}");

            let mut rb = Tokbuf::new();
            let toks = read_all(&mut rb, &out[..written]);
            assert_eq!(toks, vec![Token::UInt(v)]);
        }
    }

    #[test]
    fn negative_sint_roundtrip() {
        for &v in &[-1i64, -32, -33, -128, -129, -32768, -32769, i32::MIN as i64, i32::MIN as i64 - 1] {
            let mut wb = Tokbuf::new();
            let mut out = [0u8; 16];
            let mut w: &mut [u8] = &mut out;
            write_token(&mut wb, &mut w, &Token::SInt(v));
            let written = 16 - w.len();

            let mut rb = Tokbuf::new();
            let toks = read_all(&mut rb, &out[..written]);
            assert_eq!(toks, vec![Token::SInt(v)]);
        }
    }

    #[test]
    fn float_downgrades_to_f32_when_exact() {
        let mut wb = Tokbuf::new();
        let mut out = [0u8; 16];
        let mut w: &mut [u8] = &mut out;
        write_token(&mut wb, &mut w, &Token::Float(1.5));
        assert_eq!(16 - w.len(), 5);

        let mut wb2 = Tokbuf::new();
        let mut out2 = [0u8; 16];
        let mut w2: &mut [u8] = &mut out2;
        write_token(&mut wb2, &mut w2, &Token::Float(-3.14));
        assert_eq!(16 - w2.len(), 9);
    }

    #[test]
    fn str_header_then_chunk() {
        let payload = b"hello world";
        let mut wb = Tokbuf::new();
        let mut out = [0u8; 32];
        let mut w: &mut [u8] = &mut out;
        write_token(&mut wb, &mut w, &Token::Str(payload.len() as u32));
        write_token(&mut wb, &mut w, &Token::Chunk(payload));
        let written = 32 - w.len();

        let mut rb = Tokbuf::new();
        let toks = read_all(&mut rb, &out[..written]);
        assert_eq!(toks[0], Token::Str(payload.len() as u32));
        assert_eq!(toks[1], Token::Chunk(&payload[..]));
    }

    #[test]
    fn split_read_byte_at_a_time() {
        let mut wb = Tokbuf::new();
        let mut out = [0u8; 16];
        let mut w: &mut [u8] = &mut out;
        write_token(&mut wb, &mut w, &Token::UInt(u32::MAX as u64 + 1));
        let written = 16 - w.len();

        let mut rb = Tokbuf::new();
        let mut toks = Vec::new();
        for i in 0..written {
            let mut one = &out[i..i + 1];
            match read_token(&mut rb, &mut one) {
                (Status::Ok, Some(tok)) => toks.push(tok),
                (Status::Eof, None) => {}
                _ => panic!("unexpected"),
            }
        }
        assert_eq!(toks, vec![Token::UInt(u32::MAX as u64 + 1)]);
    }

    #[test]
    fn malformed_prefix_is_terminal() {
        let mut rb = Tokbuf::new();
        let mut buf: &[u8] = &[0xc1];
        assert_eq!(read_token(&mut rb, &mut buf).0, Status::Error);
    }

    #[test]
    fn short_write_buffer_drains_across_calls() {
        let mut wb = Tokbuf::new();
        let mut staging = Vec::new();
        let tok = Token::UInt(u32::MAX as u64 + 1); // 9-byte encoding
        loop {
            let mut small = [0u8; 3];
            let mut w: &mut [u8] = &mut small;
            let status = write_token(&mut wb, &mut w, &tok);
            let used = 3 - w.len();
            staging.extend_from_slice(&small[..used]);
            if status == Status::Ok {
                break;
            }
        }
        let mut rb = Tokbuf::new();
        let toks = read_all(&mut rb, &staging);
        assert_eq!(toks, vec![tok]);
    }
}
