//! Binary-compact key generator: a schema-agnostic binary serialization of
//! `(method_id, args, version)`, hashed into a short identifier with
//! blake3. Preferred over fast-hash when argument shapes are large or
//! deeply nested, since the serialized form is produced once and streamed
//! into the hasher rather than materialized twice.

use serde::Serialize;

use super::{CacheKey, KeyGenerator, KeyPart};

#[derive(Serialize)]
struct Envelope<'a> {
    method_id: &'a str,
    version: u32,
    parts: &'a [KeyPart],
}

impl Serialize for KeyPart {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        match self {
            KeyPart::Null => serializer.serialize_unit(),
            KeyPart::Bool(b) => serializer.serialize_bool(*b),
            KeyPart::Int(i) => serializer.serialize_i64(*i),
            KeyPart::UInt(u) => serializer.serialize_u64(*u),
            KeyPart::Float(f) => serializer.serialize_f64(*f),
            KeyPart::Str(s) => serializer.serialize_str(s),
            KeyPart::Enum(d) => serializer.serialize_i64(*d),
            KeyPart::Seq(parts) => {
                let mut seq = serializer.serialize_seq(Some(parts.len()))?;
                for p in parts {
                    seq.serialize_element(p)?;
                }
                seq.end()
            }
        }
    }
}

/// Generates keys by encoding `(method_id, version, parts)` with
/// `bincode` and hashing the result with blake3, truncated to its first
/// 16 bytes rendered as hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCompactKeyGenerator;

impl BinaryCompactKeyGenerator {
    /// Construct a new binary-compact generator.
    pub fn new() -> Self {
        Self
    }
}

impl KeyGenerator for BinaryCompactKeyGenerator {
    fn generate(&self, method_id: &str, parts: &[KeyPart], version: u32) -> CacheKey {
        let envelope = Envelope {
            method_id,
            version,
            parts,
        };
        // Encoding failures here would mean a KeyPart variant lost its
        // Serialize impl; every variant above implements it, so this is
        // infallible in practice. Fall back to the method id alone rather
        // than panic on the hot path.
        let encoded = bincode::serialize(&envelope).unwrap_or_default();
        let hash = blake3::hash(&encoded);
        let hex = hash.to_hex();
        CacheKey(format!("{method_id}_{}", &hex[..32]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let gen = BinaryCompactKeyGenerator::new();
        let parts = [KeyPart::Str("abc".into()), KeyPart::Int(-5)];
        let a = gen.generate("Compute", &parts, 3);
        let b = gen.generate("Compute", &parts, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn nested_sequences_distinguish() {
        let gen = BinaryCompactKeyGenerator::new();
        let a = gen.generate(
            "Compute",
            &[KeyPart::Seq(vec![KeyPart::Int(1), KeyPart::Int(2)])],
            1,
        );
        let b = gen.generate(
            "Compute",
            &[KeyPart::Seq(vec![KeyPart::Int(2), KeyPart::Int(1)])],
            1,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn version_is_hashed_material() {
        let gen = BinaryCompactKeyGenerator::new();
        let parts = [KeyPart::Int(1)];
        assert_ne!(gen.generate("M", &parts, 1), gen.generate("M", &parts, 2));
    }
}
