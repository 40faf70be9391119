//! Deterministic, collision-resistant cache key generation.
//!
//! A cache key is built from three ingredients: a method identifier, an
//! ordered list of argument encodings, and the resolved policy's version
//! integer. All three variants below share the same contract and differ
//! only in output shape and cost:
//!
//! - [`fast_hash`]: a 64-bit non-cryptographic hash, cheapest and default.
//! - [`human_readable`]: a debuggable, log-friendly string.
//! - [`binary_compact`]: a schema-agnostic binary encoding hashed down to
//!   a short identifier, useful when argument shapes are large or nested.
//!
//! None of the three variants performs runtime reflection: callers supply
//! arguments as [`KeyPart`] values, a closed enum covering every primitive
//! shape a cached method argument can take. This mirrors a compile-time
//! code-generation step without requiring one — a call site that wants
//! zero-cost encoding can implement [`ToKeyPart`] for its own types.

pub mod binary_compact;
pub mod fast_hash;
pub mod human_readable;

use std::fmt;

/// An opaque, deterministically-generated cache key.
///
/// Two `CacheKey`s are equal if and only if they were generated from equal
/// `(method_id, args, policy)` triples under the same generator variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(pub(crate) String);

impl CacheKey {
    /// Borrow the key as a string slice, e.g. for use as a map key in a
    /// storage provider that only understands strings.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(k: CacheKey) -> Self {
        k.0
    }
}

/// A single cache-key argument, pre-encoded into a closed set of
/// primitive shapes. Reserved sentinel [`KeyPart::Null`] stands in for a
/// missing/nullable argument so its absence still contributes
/// deterministic, distinguishable material to the key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    /// A named argument slot; `name` need only be unique within one call.
    Null,
    /// A boolean argument.
    Bool(bool),
    /// A signed integer argument (covers all narrower signed integer
    /// types by sign/zero extension at the call site).
    Int(i64),
    /// An unsigned integer argument.
    UInt(u64),
    /// A floating-point argument, compared and hashed by bit pattern so
    /// equal keys never depend on float equality semantics.
    Float(f64),
    /// A UTF-8 string argument.
    Str(String),
    /// An enum argument, encoded as its underlying discriminant.
    Enum(i64),
    /// An ordered collection of arguments, canonicalized in declared
    /// order (callers are responsible for sorting if order is not
    /// semantically significant but must be canonical for key purposes).
    Seq(Vec<KeyPart>),
}

impl KeyPart {
    /// Append a canonical byte encoding of this part to `buf`. Used by
    /// every generator variant so the three stay bit-for-bit consistent
    /// about how a given `KeyPart` is serialized.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            KeyPart::Null => buf.push(0x00),
            KeyPart::Bool(b) => {
                buf.push(0x01);
                buf.push(*b as u8);
            }
            KeyPart::Int(i) => {
                buf.push(0x02);
                buf.extend_from_slice(&i.to_le_bytes());
            }
            KeyPart::UInt(u) => {
                buf.push(0x03);
                buf.extend_from_slice(&u.to_le_bytes());
            }
            KeyPart::Float(f) => {
                buf.push(0x04);
                buf.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            KeyPart::Str(s) => {
                buf.push(0x05);
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            KeyPart::Enum(d) => {
                buf.push(0x06);
                buf.extend_from_slice(&d.to_le_bytes());
            }
            KeyPart::Seq(parts) => {
                buf.push(0x07);
                buf.extend_from_slice(&(parts.len() as u64).to_le_bytes());
                for p in parts {
                    p.encode(buf);
                }
            }
        }
    }

    /// A short, human-readable rendering used by the human-readable
    /// generator; deliberately lossy (e.g. strings are not escaped)
    /// because this variant trades strict bijectivity for legibility.
    pub(crate) fn render(&self) -> String {
        match self {
            KeyPart::Null => "null".to_string(),
            KeyPart::Bool(b) => b.to_string(),
            KeyPart::Int(i) => i.to_string(),
            KeyPart::UInt(u) => u.to_string(),
            KeyPart::Float(f) => format!("{:?}", f),
            KeyPart::Str(s) => s.clone(),
            KeyPart::Enum(d) => d.to_string(),
            KeyPart::Seq(parts) => {
                let rendered: Vec<String> = parts.iter().map(KeyPart::render).collect();
                format!("[{}]", rendered.join(","))
            }
        }
    }
}

/// Implemented by argument types that know how to encode themselves into
/// a [`KeyPart`] without runtime reflection.
pub trait ToKeyPart {
    /// Produce this value's canonical key-part encoding.
    fn to_key_part(&self) -> KeyPart;
}

macro_rules! impl_to_key_part_int {
    ($($t:ty),* $(,)?) => {
        $(impl ToKeyPart for $t {
            fn to_key_part(&self) -> KeyPart {
                KeyPart::Int(*self as i64)
            }
        })*
    };
}

macro_rules! impl_to_key_part_uint {
    ($($t:ty),* $(,)?) => {
        $(impl ToKeyPart for $t {
            fn to_key_part(&self) -> KeyPart {
                KeyPart::UInt(*self as u64)
            }
        })*
    };
}

impl_to_key_part_int!(i8, i16, i32, i64, isize);
impl_to_key_part_uint!(u8, u16, u32, u64, usize);

impl ToKeyPart for bool {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Bool(*self)
    }
}

impl ToKeyPart for f32 {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Float(*self as f64)
    }
}

impl ToKeyPart for f64 {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Float(*self)
    }
}

impl ToKeyPart for str {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Str(self.to_string())
    }
}

impl ToKeyPart for String {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Str(self.clone())
    }
}

impl<T: ToKeyPart> ToKeyPart for Option<T> {
    fn to_key_part(&self) -> KeyPart {
        match self {
            Some(v) => v.to_key_part(),
            None => KeyPart::Null,
        }
    }
}

impl<T: ToKeyPart> ToKeyPart for [T] {
    fn to_key_part(&self) -> KeyPart {
        KeyPart::Seq(self.iter().map(ToKeyPart::to_key_part).collect())
    }
}

impl<T: ToKeyPart> ToKeyPart for Vec<T> {
    fn to_key_part(&self) -> KeyPart {
        self.as_slice().to_key_part()
    }
}

/// Convert a heterogeneous argument list into its canonical `KeyPart`
/// sequence. Used by every generator variant as the common front end.
pub fn encode_args<'a>(args: &[&'a dyn ToKeyPart]) -> Vec<KeyPart> {
    args.iter().map(|a| a.to_key_part()).collect()
}

/// Implemented by each key generator variant (fast-hash, human-readable,
/// binary-compact). `version` is the resolved policy's version integer
/// and must be folded into the key material so bumping it invalidates
/// every previously generated key for that method.
pub trait KeyGenerator {
    /// Build a cache key from a method identifier, its encoded arguments,
    /// and the policy version in effect.
    fn generate(&self, method_id: &str, parts: &[KeyPart], version: u32) -> CacheKey;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_part_encoding_is_deterministic() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        KeyPart::Seq(vec![KeyPart::Int(456), KeyPart::Str("x".into())]).encode(&mut a);
        KeyPart::Seq(vec![KeyPart::Int(456), KeyPart::Str("x".into())]).encode(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_parts_encode_distinctly() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        KeyPart::Int(1).encode(&mut a);
        KeyPart::Int(2).encode(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn null_is_reserved_sentinel_distinct_from_zero() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        KeyPart::Null.encode(&mut a);
        KeyPart::Int(0).encode(&mut b);
        assert_ne!(a, b);
    }
}
