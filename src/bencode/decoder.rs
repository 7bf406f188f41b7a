use super::{Bencode, BencodeError, BencodeResult};
use std::collections::BTreeMap;

/// Containers nested deeper than this are rejected rather than recursed
/// into; hostile input must not be able to blow the stack.
const MAX_DEPTH: usize = 32;

/// Decodes a complete bencoded value.
///
/// The whole buffer must be consumed; trailing bytes after the first
/// value are an error. Use [`decode_partial`] when trailing bytes are
/// expected (BEP 9 data messages append the raw piece after the
/// bencoded header).
pub fn decode(buf: &[u8]) -> BencodeResult<Bencode> {
    let (value, trailing) = decode_partial(buf)?;
    if !trailing.is_empty() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes one bencoded value off the front of the buffer and returns it
/// together with the remaining bytes.
pub fn decode_partial(buf: &[u8]) -> BencodeResult<(Bencode, &[u8])> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.decode_next(0)?;
    Ok((value, &buf[decoder.pos..]))
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::ShortInput)
    }

    fn getchar(&mut self) -> BencodeResult<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Ok(c)
    }

    fn read_bytes(&mut self, length: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.buf.len())
            .ok_or(BencodeError::ShortInput)?;
        let blob = &self.buf[self.pos..end];
        self.pos = end;
        Ok(blob)
    }

    /// Reads an ASCII decimal integer terminated by `stop`.
    ///
    /// Rejects empty integers, leading zeros, `-0`, and any non-digit
    /// character (including whitespace) other than a leading minus sign.
    fn read_int(&mut self, stop: u8) -> BencodeResult<i64> {
        let start = self.pos;
        loop {
            let c = self.getchar()?;
            if c == stop {
                break;
            }
            if !c.is_ascii_digit() && !(c == b'-' && self.pos == start + 1) {
                return Err(BencodeError::NonDigit);
            }
        }
        let digits = &self.buf[start..self.pos - 1];
        if digits.is_empty()
            || (digits[0] == b'0' && digits.len() > 1)
            || digits.starts_with(b"-0")
        {
            return Err(BencodeError::InvalidInteger);
        }
        // The buffer holds only ASCII digits at this point.
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger)
    }

    fn decode_string(&mut self) -> BencodeResult<&'a [u8]> {
        let length = self.read_int(b':')?;
        let length = usize::try_from(length).map_err(|_| BencodeError::InvalidInteger)?;
        self.read_bytes(length)
    }

    fn decode_list(&mut self, depth: usize) -> BencodeResult<Vec<Bencode>> {
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode_next(depth)?);
        }
        self.pos += 1;
        Ok(list)
    }

    fn decode_dict(&mut self, depth: usize) -> BencodeResult<BTreeMap<Vec<u8>, Bencode>> {
        let mut dict = BTreeMap::new();
        let mut prev_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonBytesKey);
            }
            let key = self.decode_string()?.to_vec();
            if prev_key.as_deref().is_some_and(|prev| key.as_slice() <= prev) {
                return Err(BencodeError::UnsortedKeys);
            }
            let value = self.decode_next(depth)?;
            prev_key = Some(key.clone());
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(dict)
    }

    fn decode_next(&mut self, depth: usize) -> BencodeResult<Bencode> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'0'..=b'9' => Ok(Bencode::Bytes(self.decode_string()?.to_vec())),
            b'i' => {
                self.pos += 1;
                Ok(Bencode::Int(self.read_int(b'e')?))
            }
            b'l' => {
                self.pos += 1;
                Ok(Bencode::List(self.decode_list(depth + 1)?))
            }
            b'd' => {
                self.pos += 1;
                Ok(Bencode::Dict(self.decode_dict(depth + 1)?))
            }
            c => Err(BencodeError::InvalidByte(c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    fn bytes(b: &[u8]) -> Bencode {
        Bencode::Bytes(b.to_vec())
    }

    fn roundtrip(blob: &[u8], value: Bencode) {
        assert_eq!(decode(blob).unwrap(), value);
        let mut out = Vec::new();
        encode(&mut out, &value).unwrap();
        assert_eq!(out, blob);
    }

    #[test]
    fn string() {
        roundtrip(b"4:spam", bytes(b"spam"));
        roundtrip(b"0:", bytes(b""));
    }

    #[test]
    fn integers() {
        roundtrip(b"i3e", Bencode::Int(3));
        roundtrip(b"i0e", Bencode::Int(0));
        roundtrip(b"i-1e", Bencode::Int(-1));
        roundtrip(b"i-10e", Bencode::Int(-10));
        roundtrip(b"i35e", Bencode::Int(35));
    }

    #[test]
    fn list() {
        roundtrip(b"le", Bencode::List(vec![]));
        roundtrip(b"l4:spam4:eggse", Bencode::List(vec![bytes(b"spam"), bytes(b"eggs")]));
    }

    #[test]
    fn dict() {
        roundtrip(b"de", Bencode::Dict(BTreeMap::new()));
        roundtrip(
            b"d3:cow3:moo4:spam4:eggse",
            Bencode::Dict(BTreeMap::from([
                (b"cow".to_vec(), bytes(b"moo")),
                (b"spam".to_vec(), bytes(b"eggs")),
            ])),
        );
        roundtrip(
            b"d4:data4:\x00\x01\x02\x03e",
            Bencode::Dict(BTreeMap::from([(b"data".to_vec(), bytes(b"\x00\x01\x02\x03"))])),
        );
        roundtrip(
            b"d8:msg_typei0e5:piecei0ee",
            Bencode::Dict(BTreeMap::from([
                (b"msg_type".to_vec(), Bencode::Int(0)),
                (b"piece".to_vec(), Bencode::Int(0)),
            ])),
        );
        roundtrip(
            b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee",
            Bencode::Dict(BTreeMap::from([
                (
                    b"m".to_vec(),
                    Bencode::Dict(BTreeMap::from([(b"ut_metadata".to_vec(), Bencode::Int(3))])),
                ),
                (b"metadata_size".to_vec(), Bencode::Int(31235)),
            ])),
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for blob in [
            b"i-0e".as_slice(),
            b"i00e",
            b"i04e",
            b"04:spam",
            b"-4:spam",
            b"-0:",
            b"24:short",
            b"4:longextra",
            b"l",
            b"q",
            b"d",
            b"di32e6:stringe",
            b"d6:bananai1e5:applei2e",
            b"i3.14e",
            b"i12-e",
            b"i 12e",
            b"i12 e",
            b"i12:",
            b"5eapple",
        ] {
            assert!(decode(blob).is_err(), "{blob:?} should not decode");
        }
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert_eq!(decode(b"d3:cowi1e3:cowi2ee"), Err(BencodeError::UnsortedKeys));
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut blob = vec![b'l'; 1234];
        blob.extend_from_slice(&[b'e'; 1234]);
        assert_eq!(decode(&blob), Err(BencodeError::TooDeep));
    }

    #[test]
    fn partial_decode_returns_trailing_bytes() {
        let (value, trailing) =
            decode_partial(b"d8:msg_typei1e5:piecei0e10:total_sizei3425eeabcdefg").unwrap();
        assert_eq!(
            value,
            Bencode::Dict(BTreeMap::from([
                (b"msg_type".to_vec(), Bencode::Int(1)),
                (b"piece".to_vec(), Bencode::Int(0)),
                (b"total_size".to_vec(), Bencode::Int(3425)),
            ]))
        );
        assert_eq!(trailing, b"abcdefg");
    }
}
