//! Extension negotiation: the reserved bits of the BitTorrent handshake
//! and the BEP 10 name-to-id registry exchanged in extended handshakes.
use crate::bencode::Bencode;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitAnd;

/// Protocol extensions announced through the 8 reserved bytes of the
/// handshake. The discriminant is the bit index within the 64-bit
/// reserved field, bit 0 being the lowest bit of the last byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Azureus messaging protocol (byte 0, `0x80`)
    AzureusMessaging = 63,
    /// Location-aware protocol (byte 2, `0x08`)
    LocationAware = 43,
    /// BEP 10 extension protocol (byte 5, `0x10`)
    Bep10 = 20,
    /// BEP 30 hybrid-v2 upgrade (byte 7, `0x10`)
    HybridV2 = 4,
    /// NAT traversal (byte 7, `0x08`)
    NatTraversal = 3,
    /// BEP 6 Fast Extension (byte 7, `0x04`)
    Fast = 2,
    /// XBT peer exchange (byte 7, `0x02`)
    XbtPex = 1,
    /// BEP 5 DHT (byte 7, `0x01`)
    Dht = 0,
}

impl Extension {
    const ALL: [Extension; 8] = [
        Extension::AzureusMessaging,
        Extension::LocationAware,
        Extension::Bep10,
        Extension::HybridV2,
        Extension::NatTraversal,
        Extension::Fast,
        Extension::XbtPex,
        Extension::Dht,
    ];

    fn mask(self) -> u64 {
        1 << (self as u64)
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Extension::AzureusMessaging => "Azureus messaging",
            Extension::LocationAware => "location-aware",
            Extension::Bep10 => "BEP 10 extensions",
            Extension::HybridV2 => "hybrid v2",
            Extension::NatTraversal => "NAT traversal",
            Extension::Fast => "fast",
            Extension::XbtPex => "XBT PEX",
            Extension::Dht => "DHT",
        };
        f.write_str(name)
    }
}

/// The set of extension bits in a handshake's reserved field. Unknown
/// bits are preserved so a parsed handshake re-encodes byte-exactly.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionSet(u64);

impl ExtensionSet {
    pub fn from_reserved(reserved: [u8; 8]) -> ExtensionSet {
        ExtensionSet(u64::from_be_bytes(reserved))
    }

    pub fn to_reserved(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn contains(self, ext: Extension) -> bool {
        self.0 & ext.mask() != 0
    }
}

impl FromIterator<Extension> for ExtensionSet {
    fn from_iter<I: IntoIterator<Item = Extension>>(iter: I) -> ExtensionSet {
        ExtensionSet(iter.into_iter().fold(0, |bits, ext| bits | ext.mask()))
    }
}

impl BitAnd for ExtensionSet {
    type Output = ExtensionSet;

    fn bitand(self, rhs: ExtensionSet) -> ExtensionSet {
        ExtensionSet(self.0 & rhs.0)
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionSet({self})")
    }
}

impl fmt::Display for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ext in Extension::ALL {
            if self.contains(ext) {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{ext}")?;
                first = false;
            }
        }
        if first {
            f.write_str("<none>")?;
        }
        Ok(())
    }
}

/// Extended message types negotiated over BEP 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bep10Extension {
    /// BEP 9 metadata transfer
    Metadata,
    /// BEP 11 peer exchange
    Pex,
}

impl Bep10Extension {
    pub fn name(self) -> &'static str {
        match self {
            Bep10Extension::Metadata => "ut_metadata",
            Bep10Extension::Pex => "ut_pex",
        }
    }

    fn from_name(name: &[u8]) -> Option<Bep10Extension> {
        match name {
            b"ut_metadata" => Some(Bep10Extension::Metadata),
            b"ut_pex" => Some(Bep10Extension::Pex),
            _ => None,
        }
    }
}

/// Mapping between BEP 10 extension names and the connection-local
/// message IDs a peer assigned them in its extended handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bep10Registry {
    to_code: BTreeMap<Bep10Extension, u8>,
    from_code: BTreeMap<u8, Bep10Extension>,
}

// Bep10Extension in a BTreeMap needs a total order; discriminant order
// is as good as any.
impl Ord for Bep10Extension {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl PartialOrd for Bep10Extension {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Bep10Registry {
    pub fn new() -> Bep10Registry {
        Bep10Registry::default()
    }

    /// The registry we advertise: just `ut_metadata`.
    pub fn local() -> Bep10Registry {
        let mut registry = Bep10Registry::new();
        // Registering a single extension cannot conflict.
        let _ = registry.register(Bep10Extension::Metadata, crate::consts::UT_METADATA);
        registry
    }

    /// Builds a registry from the `m` dictionary of an extended
    /// handshake. Unrecognised extension names and non-integer IDs are
    /// ignored; conflicting declarations are an error.
    pub fn from_m(m: &BTreeMap<Vec<u8>, Bencode>) -> Result<Bep10Registry, String> {
        let mut registry = Bep10Registry::new();
        for (name, value) in m {
            let Some(ext) = Bep10Extension::from_name(name) else {
                continue;
            };
            if let Some(code) = value.as_int().and_then(|i| u8::try_from(i).ok()) {
                registry.register(ext, code)?;
            }
        }
        Ok(registry)
    }

    /// The `m` dictionary to send in our extended handshake.
    pub fn to_m(&self) -> Bencode {
        let m = self
            .to_code
            .iter()
            .map(|(ext, code)| (ext.name().as_bytes().to_vec(), Bencode::Int(i64::from(*code))))
            .collect();
        Bencode::Dict(m)
    }

    pub fn register(&mut self, ext: Bep10Extension, code: u8) -> Result<(), String> {
        if self.from_code.contains_key(&code) {
            return Err(format!("conflicting declarations for message ID {code}"));
        }
        if self.to_code.contains_key(&ext) {
            return Err(format!("conflicting declarations for {:?}", ext.name()));
        }
        self.from_code.insert(code, ext);
        self.to_code.insert(ext, code);
        Ok(())
    }

    pub fn contains(&self, ext: Bep10Extension) -> bool {
        self.to_code.contains_key(&ext)
    }

    pub fn code_for(&self, ext: Bep10Extension) -> Option<u8> {
        self.to_code.get(&ext).copied()
    }

    pub fn lookup(&self, code: u8) -> Option<Bep10Extension> {
        self.from_code.get(&code).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn reserved_bits_round_trip() {
        let set: ExtensionSet =
            [Extension::Bep10, Extension::Fast, Extension::Dht].into_iter().collect();
        assert_eq!(set.to_reserved(), [0, 0, 0, 0, 0, 0x10, 0, 0x05]);
        let parsed = ExtensionSet::from_reserved([0, 0, 0, 0, 0, 0x10, 0, 0x05]);
        assert_eq!(parsed, set);
        assert!(parsed.contains(Extension::Bep10));
        assert!(parsed.contains(Extension::Fast));
        assert!(!parsed.contains(Extension::XbtPex));
    }

    #[test]
    fn unknown_bits_survive_a_round_trip() {
        let reserved = [0, 0, 0, 0, 0, 0x18, 0, 0x05];
        let set = ExtensionSet::from_reserved(reserved);
        assert_eq!(set.to_reserved(), reserved);
    }

    #[test]
    fn intersection() {
        let ours: ExtensionSet = [Extension::Bep10, Extension::Fast].into_iter().collect();
        let theirs: ExtensionSet =
            [Extension::Bep10, Extension::Dht, Extension::XbtPex].into_iter().collect();
        let active = ours & theirs;
        assert!(active.contains(Extension::Bep10));
        assert!(!active.contains(Extension::Fast));
        assert!(!active.contains(Extension::Dht));
    }

    #[test]
    fn registry_from_handshake_m() {
        let m = BTreeMap::from([
            (b"ut_metadata".to_vec(), Bencode::Int(3)),
            (b"ut_pex".to_vec(), Bencode::Int(1)),
            (b"lt_donthave".to_vec(), Bencode::Int(7)),
        ]);
        let registry = Bep10Registry::from_m(&m).unwrap();
        assert_eq!(registry.code_for(Bep10Extension::Metadata), Some(3));
        assert_eq!(registry.lookup(1), Some(Bep10Extension::Pex));
        assert_eq!(registry.lookup(7), None);
    }

    #[test]
    fn registry_rejects_conflicts() {
        let mut registry = Bep10Registry::new();
        registry.register(Bep10Extension::Metadata, 2).unwrap();
        assert!(registry.register(Bep10Extension::Pex, 2).is_err());
        assert!(registry.register(Bep10Extension::Metadata, 5).is_err());
    }
}
