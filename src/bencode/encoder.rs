use super::Bencode;
use std::collections::BTreeMap;
use std::io::{self, Write};

fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> io::Result<()> {
    write!(writer, "i{i}e")
}

fn encode_list<W: Write>(writer: &mut W, list: &[Bencode]) -> io::Result<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode(writer, item)?;
    }
    writer.write_all(b"e")
}

fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, Bencode>) -> io::Result<()> {
    writer.write_all(b"d")?;
    // BTreeMap iteration order is the ascending key order bencoding wants.
    for (key, value) in dict {
        encode_bytes(writer, key)?;
        encode(writer, value)?;
    }
    writer.write_all(b"e")
}

/// Writes the canonical bencoding of `value` to `writer`.
pub fn encode<W: Write>(writer: &mut W, value: &Bencode) -> io::Result<()> {
    match value {
        Bencode::Bytes(s) => encode_bytes(writer, s),
        Bencode::Int(i) => encode_integer(writer, *i),
        Bencode::List(list) => encode_list(writer, list),
        Bencode::Dict(dict) => encode_dict(writer, dict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_keys_come_out_sorted() {
        // Insertion order must not matter.
        let value = Bencode::Dict(BTreeMap::from([
            (b"spam".to_vec(), Bencode::from("eggs")),
            (b"cow".to_vec(), Bencode::from("moo")),
        ]));
        assert_eq!(value.to_bytes(), b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn nested_containers() {
        let value = Bencode::List(vec![
            Bencode::from("spam"),
            Bencode::Int(42),
            Bencode::List(vec![]),
        ]);
        assert_eq!(value.to_bytes(), b"l4:spami42elee");
    }
}
