//! Property tests for key-generator determinism and collision resistance,
//! run across a wide range of method ids, argument shapes, and versions
//! rather than a handful of fixed cases.

use proptest::prelude::*;

use tiercache::keygen::binary_compact::BinaryCompactKeyGenerator;
use tiercache::keygen::fast_hash::FastHashKeyGenerator;
use tiercache::keygen::human_readable::HumanReadableKeyGenerator;
use tiercache::keygen::{KeyGenerator, KeyPart};

fn arb_key_part() -> impl Strategy<Value = KeyPart> {
    prop_oneof![
        Just(KeyPart::Null),
        any::<bool>().prop_map(KeyPart::Bool),
        any::<i64>().prop_map(KeyPart::Int),
        any::<u64>().prop_map(KeyPart::UInt),
        "[a-zA-Z0-9_]{0,32}".prop_map(KeyPart::Str),
    ]
}

fn arb_parts() -> impl Strategy<Value = Vec<KeyPart>> {
    prop::collection::vec(arb_key_part(), 0..6)
}

proptest! {
    /// Same inputs, same generator, same key, every time, regardless of
    /// which generator variant is asked.
    #[test]
    fn fast_hash_is_deterministic(method in "[a-zA-Z][a-zA-Z0-9]{0,16}", parts in arb_parts(), version in any::<u32>()) {
        let gen = FastHashKeyGenerator::new();
        let a = gen.generate(&method, &parts, version);
        let b = gen.generate(&method, &parts, version);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn human_readable_is_deterministic(method in "[a-zA-Z][a-zA-Z0-9]{0,16}", parts in arb_parts(), version in any::<u32>()) {
        let gen = HumanReadableKeyGenerator::default();
        let a = gen.generate(&method, &parts, version);
        let b = gen.generate(&method, &parts, version);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn binary_compact_is_deterministic(method in "[a-zA-Z][a-zA-Z0-9]{0,16}", parts in arb_parts(), version in any::<u32>()) {
        let gen = BinaryCompactKeyGenerator::new();
        let a = gen.generate(&method, &parts, version);
        let b = gen.generate(&method, &parts, version);
        prop_assert_eq!(a, b);
    }

    /// Distinct argument lists under the same method/version never
    /// collide, for fast-hash and binary-compact (full-fidelity
    /// variants); human-readable is checked separately since its
    /// truncate-and-hash-tail shape only guarantees this for short
    /// argument lists, not arbitrary ones.
    #[test]
    fn fast_hash_distinct_args_never_collide(
        method in "[a-zA-Z][a-zA-Z0-9]{0,16}",
        a in arb_parts(),
        b in arb_parts(),
        version in any::<u32>(),
    ) {
        prop_assume!(a != b);
        let gen = FastHashKeyGenerator::new();
        let key_a = gen.generate(&method, &a, version);
        let key_b = gen.generate(&method, &b, version);
        prop_assert_ne!(key_a, key_b);
    }

    #[test]
    fn binary_compact_distinct_args_never_collide(
        method in "[a-zA-Z][a-zA-Z0-9]{0,16}",
        a in arb_parts(),
        b in arb_parts(),
        version in any::<u32>(),
    ) {
        prop_assume!(a != b);
        let gen = BinaryCompactKeyGenerator::new();
        let key_a = gen.generate(&method, &a, version);
        let key_b = gen.generate(&method, &b, version);
        prop_assert_ne!(key_a, key_b);
    }

    /// Bumping the version always changes the key, holding method and
    /// args fixed, across every generator variant.
    #[test]
    fn version_bump_changes_key_under_every_generator(
        method in "[a-zA-Z][a-zA-Z0-9]{0,16}",
        parts in arb_parts(),
        version in any::<u32>(),
    ) {
        let next = version.wrapping_add(1);
        prop_assume!(next != version);

        let fast = FastHashKeyGenerator::new();
        prop_assert_ne!(fast.generate(&method, &parts, version), fast.generate(&method, &parts, next));

        let human = HumanReadableKeyGenerator::default();
        prop_assert_ne!(human.generate(&method, &parts, version), human.generate(&method, &parts, next));

        let binary = BinaryCompactKeyGenerator::new();
        prop_assert_ne!(binary.generate(&method, &parts, version), binary.generate(&method, &parts, next));
    }
}
