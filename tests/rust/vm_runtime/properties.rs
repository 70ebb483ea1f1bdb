use std::cmp::Ordering;

use proptest::prelude::*;

use weft_vm_runtime::bytecode::{read_string, Config, Image, ImageBuilder, Opcode};
use weft_vm_runtime::interpreter::Vm;
use weft_vm_runtime::memory::Memory;
use weft_vm_runtime::render::write_escaped;
use weft_vm_runtime::value::{equal, order, Value};

fn arena_image() -> Image {
    let mut builder = ImageBuilder::new(Config::default());
    builder.op(Opcode::ConstantNull);
    builder.op(Opcode::Return);
    builder.finish(0).expect("image should assemble")
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        prop::num::f64::NORMAL.prop_map(Value::Float),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::Null),
    ]
}

/// Decode the five entities the escaper emits.
fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let rest = &bytes[i..];
        let (byte, width) = if rest.starts_with(b"&amp;") {
            (b'&', 5)
        } else if rest.starts_with(b"&lt;") {
            (b'<', 4)
        } else if rest.starts_with(b"&gt;") {
            (b'>', 4)
        } else if rest.starts_with(b"&#34;") {
            (b'"', 5)
        } else if rest.starts_with(b"&#39;") {
            (b'\'', 5)
        } else {
            (bytes[i], 1)
        };
        out.push(byte);
        i += width;
    }
    out
}

proptest! {
    #[test]
    fn equality_is_reflexive_for_scalars(value in scalar()) {
        let image = arena_image();
        let memory = Memory::new(&image);
        prop_assert_eq!(equal(&memory, value, value), Ok(true));
        prop_assert_eq!(order(&memory, value, value), Ordering::Equal);
    }

    #[test]
    fn equality_and_ordering_agree_on_scalars(a in scalar(), b in scalar()) {
        let image = arena_image();
        let memory = Memory::new(&image);
        let equal_result = equal(&memory, a, b).unwrap_or(false);
        let order_result = order(&memory, a, b) == Ordering::Equal;
        prop_assert_eq!(equal_result, order_result);
    }

    #[test]
    fn escape_round_trips(text in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut escaped = Vec::new();
        write_escaped(&mut escaped, &text).expect("write should succeed");
        prop_assert_eq!(unescape(&escaped), text);

        // Outside the entity encodings nothing special survives.
        let mut flattened = String::from_utf8_lossy(&escaped).into_owned();
        for entity in ["&amp;", "&lt;", "&gt;", "&#34;", "&#39;"] {
            flattened = flattened.replace(entity, "_");
        }
        for special in ['&', '<', '>', '"', '\''] {
            prop_assert!(!flattened.contains(special), "raw {special} in {flattened}");
        }
    }

    #[test]
    fn modulus_result_has_the_divisor_sign(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(b != 0);
        let mut builder = ImageBuilder::new(Config::default());
        builder.op(Opcode::ConstantI64);
        builder.emit_i64(a);
        builder.op(Opcode::ConstantI64);
        builder.emit_i64(b);
        builder.op(Opcode::Modulus);
        builder.op(Opcode::Return);
        let image = builder.finish(0).expect("image should assemble");

        let mut vm = Vm::new(&image);
        let value = vm.run(&mut Vec::new()).expect("execution should succeed");
        let Value::Int(r) = value else {
            prop_assert!(false, "non-int result {:?}", value);
            unreachable!()
        };
        prop_assert!(r == 0 || (r < 0) == (b < 0), "{a} % {b} = {r}");
        // The result is congruent to the dividend.
        prop_assert_eq!((a as i128 - r as i128).rem_euclid(b as i128), 0);
    }

    #[test]
    fn negative_indices_resolve_from_the_end(
        elements in proptest::collection::vec(any::<i64>(), 1..24),
        selector in any::<prop::sample::Index>(),
    ) {
        let len = elements.len() as i64;
        // Cover the whole valid range [-len, len).
        let index = selector.index((2 * len) as usize) as i64 - len;
        let expected = elements[if index < 0 { index + len } else { index } as usize];

        let mut builder = ImageBuilder::new(Config::default());
        for element in &elements {
            builder.op(Opcode::ConstantI64);
            builder.emit_i64(*element);
        }
        builder.op(Opcode::InitializeArray);
        builder.emit_u32(elements.len() as u32);
        builder.op(Opcode::ConstantI64);
        builder.emit_i64(index);
        builder.op(Opcode::IndexGet);
        builder.op(Opcode::Return);
        let image = builder.finish(0).expect("image should assemble");

        let mut vm = Vm::new(&image);
        let value = vm.run(&mut Vec::new()).expect("execution should succeed");
        prop_assert_eq!(value, Value::Int(expected));
    }

    #[test]
    fn string_table_round_trips(
        literals in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 1..16),
    ) {
        let mut builder = ImageBuilder::new(Config::default());
        builder.op(Opcode::ConstantNull);
        builder.op(Opcode::Return);
        let offsets: Vec<u32> = literals.iter().map(|text| builder.add_string(text)).collect();
        let image = builder.finish(0).expect("image should assemble");

        for (text, offset) in literals.iter().zip(&offsets) {
            let (start, len) = read_string(image.data(), *offset as usize)
                .expect("literal record should resolve");
            prop_assert_eq!(&image.data()[start..start + len], &text[..]);
        }

        // Deduplication hands identical literals identical offsets.
        for (i, a) in literals.iter().enumerate() {
            for (j, b) in literals.iter().enumerate() {
                if a == b {
                    prop_assert_eq!(offsets[i], offsets[j]);
                }
            }
        }
    }

    #[test]
    fn duplicate_literals_stay_distinct_without_deduplication(
        text in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let config = Config {
            deduplicate_string_literals: false,
            ..Config::default()
        };
        let mut builder = ImageBuilder::new(config);
        builder.op(Opcode::ConstantNull);
        builder.op(Opcode::Return);
        let first = builder.add_string(&text);
        let second = builder.add_string(&text);
        prop_assert_ne!(first, second);

        let image = builder.finish(0).expect("image should assemble");
        for offset in [first, second] {
            let (start, len) = read_string(image.data(), offset as usize)
                .expect("literal record should resolve");
            prop_assert_eq!(&image.data()[start..start + len], &text[..]);
        }
    }
}
