use weft_vm_runtime::bytecode::{Config, DebugMode, Image, ImageBuilder, Opcode};
use weft_vm_runtime::host::{
    HostError, PartialResolver, ResolvedPartial, HOST_LEN, HOST_MAP_INSERT, HOST_MAP_NEW,
};
use weft_vm_runtime::interpreter::{RuntimeError, Vm};
use weft_vm_runtime::sandbox::SandboxLimits;
use weft_vm_runtime::value::Value;

fn run(image: &Image) -> (Result<Value, RuntimeError>, Vec<u8>) {
    let mut vm = Vm::new(image);
    let mut out = Vec::new();
    let result = vm.run(&mut out);
    (result, out)
}

fn const_int(builder: &mut ImageBuilder, value: i64) {
    builder.op(Opcode::ConstantI64);
    builder.emit_i64(value);
}

fn const_float(builder: &mut ImageBuilder, value: f64) {
    builder.op(Opcode::ConstantF64);
    builder.emit_f64(value);
}

#[test]
fn adds_integer_constants() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 1);
    const_int(&mut builder, 2);
    builder.op(Opcode::Add);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let mut vm = Vm::new(&image);
    let value = vm.run(&mut Vec::new()).expect("execution should succeed");
    assert_eq!(value, Value::Int(3));
    assert_eq!(vm.stack_depth(), 0, "a balanced program leaves nothing behind");
}

#[test]
fn multiplication_promotes_int_to_float() {
    let mut builder = ImageBuilder::new(Config::default());
    const_float(&mut builder, 1.5);
    const_int(&mut builder, 2);
    builder.op(Opcode::Multiply);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Float(3.0));
}

#[test]
fn negative_index_counts_from_the_end() {
    let mut builder = ImageBuilder::new(Config::default());
    for element in [10, 20, 30] {
        const_int(&mut builder, element);
    }
    builder.op(Opcode::InitializeArray);
    builder.emit_u32(3);
    const_int(&mut builder, -1);
    builder.op(Opcode::IndexGet);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(30));
}

#[test]
fn index_of_negative_length_is_the_first_element() {
    let mut builder = ImageBuilder::new(Config::default());
    for element in [10, 20, 30] {
        const_int(&mut builder, element);
    }
    builder.op(Opcode::InitializeArray);
    builder.emit_u32(3);
    const_int(&mut builder, -3);
    builder.op(Opcode::IndexGet);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(10));
}

#[test]
fn index_past_negative_length_is_out_of_range() {
    let mut builder = ImageBuilder::new(Config::default());
    for element in [10, 20, 30] {
        const_int(&mut builder, element);
    }
    builder.op(Opcode::InitializeArray);
    builder.emit_u32(3);
    const_int(&mut builder, -4);
    builder.op(Opcode::IndexGet);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let mut vm = Vm::new(&image);
    let error = vm.run(&mut Vec::new()).expect_err("index must be rejected");
    assert!(matches!(error, RuntimeError::OutOfRange(_)), "{error}");
    assert!(vm.error().is_some(), "the error record stays on the VM");
}

#[test]
fn maps_compare_equal_regardless_of_insertion_order() {
    let mut builder = ImageBuilder::new(Config::default());
    // Two maps in slots 0 and 1, the same entries inserted in opposite order.
    builder.op(Opcode::CallHost);
    builder.emit_u32(HOST_MAP_NEW);
    builder.emit_u8(0);
    builder.op(Opcode::CallHost);
    builder.emit_u32(HOST_MAP_NEW);
    builder.emit_u8(0);
    for (slot, key, value) in [(0u32, "a", 1i64), (0, "b", 2), (1, "b", 2), (1, "a", 1)] {
        builder.op(Opcode::GetLocal);
        builder.emit_local(slot);
        builder.const_str(key.as_bytes());
        const_int(&mut builder, value);
        builder.op(Opcode::CallHost);
        builder.emit_u32(HOST_MAP_INSERT);
        builder.emit_u8(3);
        builder.op(Opcode::Pop);
    }
    builder.op(Opcode::GetLocal);
    builder.emit_local(0);
    builder.op(Opcode::GetLocal);
    builder.emit_local(1);
    builder.op(Opcode::Equal);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Bool(true));
}

#[test]
fn missing_map_key_reads_as_null() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.op(Opcode::CallHost);
    builder.emit_u32(HOST_MAP_NEW);
    builder.emit_u8(0);
    builder.op(Opcode::GetLocal);
    builder.emit_local(0);
    builder.const_str(b"missing");
    builder.op(Opcode::IndexGet);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Null);
}

#[test]
fn print_escapes_when_configured() {
    let config = Config {
        escape_by_default: true,
        ..Config::default()
    };
    let mut builder = ImageBuilder::new(config.clone());
    builder.const_str(b"a&b");
    builder.op(Opcode::Print);
    builder.op(Opcode::ConstantNull);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let mut vm = Vm::with_config(&image, config, SandboxLimits::default());
    let mut out = Vec::new();
    vm.run(&mut out).expect("execution should succeed");
    assert_eq!(out, b"a&amp;b");
}

#[test]
fn print_passes_raw_bytes_through_by_default() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.const_str(b"a&b");
    builder.op(Opcode::Print);
    builder.op(Opcode::ConstantNull);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, out) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Null);
    assert_eq!(out, b"a&b");
}

#[test]
fn calls_a_two_argument_function() {
    let mut builder = ImageBuilder::new(Config::default());
    // fn add(a, b) { return a + b; }
    let function_start = builder.here();
    builder.op(Opcode::GetLocal);
    builder.emit_local(0);
    builder.op(Opcode::GetLocal);
    builder.emit_local(1);
    builder.op(Opcode::Add);
    builder.op(Opcode::Return);
    let descriptor = builder.add_function(2, function_start as u32);
    let entry = builder.here();
    const_int(&mut builder, 2);
    const_int(&mut builder, 3);
    builder.op(Opcode::Call);
    builder.emit_u32(descriptor);
    builder.op(Opcode::Return);
    let image = builder.finish(entry as u32).expect("image should assemble");

    let mut vm = Vm::new(&image);
    let value = vm.run(&mut Vec::new()).expect("execution should succeed");
    assert_eq!(value, Value::Int(5));
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.sandbox_metrics().max_frame_depth, 1);
}

#[test]
fn runaway_recursion_overflows_the_frame_array() {
    let mut builder = ImageBuilder::new(Config::default());
    let descriptor = builder.add_function(0, 0);
    // fn spin() { return spin(); }
    builder.op(Opcode::Call);
    builder.emit_u32(descriptor);
    builder.op(Opcode::Return);
    let entry = builder.here();
    builder.op(Opcode::Call);
    builder.emit_u32(descriptor);
    builder.op(Opcode::Return);
    let image = builder.finish(entry as u32).expect("image should assemble");

    let (result, _) = run(&image);
    let error = result.expect_err("recursion must trip the frame bound");
    assert!(matches!(error, RuntimeError::StackOverflow(_)), "{error}");
}

#[test]
fn jump_if_false_branches_on_a_nonzero_int() {
    let mut builder = ImageBuilder::new(Config::default());
    // Only Bool(true) is truthy, so Int(0) takes the branch.
    const_int(&mut builder, 0);
    let to_else = builder.jump(Opcode::JumpIfFalse);
    builder.op(Opcode::Pop);
    const_int(&mut builder, 111);
    let to_end = builder.jump(Opcode::Jump);
    builder.patch_jump(to_else);
    builder.op(Opcode::Pop);
    const_int(&mut builder, 222);
    builder.patch_jump(to_end);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(222));
}

#[test]
fn integer_division_by_zero_is_a_type_error() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 1);
    const_int(&mut builder, 0);
    builder.op(Opcode::Divide);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    let error = result.expect_err("zero divisor must be rejected");
    assert!(matches!(error, RuntimeError::Type(_)), "{error}");
}

#[test]
fn float_division_by_zero_follows_ieee() {
    let mut builder = ImageBuilder::new(Config::default());
    const_float(&mut builder, 1.0);
    const_float(&mut builder, 0.0);
    builder.op(Opcode::Divide);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(
        result.expect("execution should succeed"),
        Value::Float(f64::INFINITY)
    );
}

#[test]
fn modulus_rejects_float_operands() {
    let mut builder = ImageBuilder::new(Config::default());
    const_float(&mut builder, 5.0);
    const_int(&mut builder, 2);
    builder.op(Opcode::Modulus);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    let error = result.expect_err("float modulus must be rejected");
    assert!(matches!(error, RuntimeError::Type(_)), "{error}");
}

#[test]
fn modulus_takes_the_sign_of_the_divisor() {
    for (a, b, expected) in [(7, 3, 1), (-7, 3, 2), (7, -3, -2), (-7, -3, -1)] {
        let mut builder = ImageBuilder::new(Config::default());
        const_int(&mut builder, a);
        const_int(&mut builder, b);
        builder.op(Opcode::Modulus);
        builder.op(Opcode::Return);
        let image = builder.finish(0).expect("image should assemble");

        let (result, _) = run(&image);
        assert_eq!(
            result.expect("execution should succeed"),
            Value::Int(expected),
            "{a} % {b}"
        );
    }
}

#[test]
fn incr_sentinel_decrements_and_pushes() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 5);
    builder.op(Opcode::Incr);
    builder.emit_u8(0);
    builder.emit_local(0);
    builder.op(Opcode::Pop);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(4));
}

#[test]
fn incr_adds_a_positive_delta() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 5);
    builder.op(Opcode::Incr);
    builder.emit_u8(3);
    builder.emit_local(0);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    // The pushed copy is what RETURN consumes; the slot keeps the new value.
    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(8));
}

#[test]
fn set_local_leaves_the_stack_unchanged() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 1);
    const_int(&mut builder, 9);
    builder.op(Opcode::SetLocal);
    builder.emit_local(0);
    builder.op(Opcode::Add);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    // Slot 0 and the still-present top are both 9 after the assignment.
    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(18));
}

#[test]
fn tick_budget_interrupts_a_spin_loop() {
    let mut builder = ImageBuilder::new(Config::default());
    let start = builder.here();
    builder.jump_to(Opcode::Jump, start);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let limits = SandboxLimits {
        tick_limit: 1_000,
        ..SandboxLimits::default()
    };
    let mut vm = Vm::with_config(&image, Config::default(), limits);
    let error = vm
        .run(&mut Vec::new())
        .expect_err("the budget must interrupt the loop");
    assert!(matches!(error, RuntimeError::Budget(_)), "{error}");
    assert!(vm.sandbox_metrics().ticks > 1_000);
}

#[test]
fn arena_budget_surfaces_as_out_of_memory() {
    let mut builder = ImageBuilder::new(Config::default());
    for element in [1, 2, 3] {
        const_int(&mut builder, element);
    }
    builder.op(Opcode::InitializeArray);
    builder.emit_u32(3);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let limits = SandboxLimits {
        arena_budget_bytes: 64,
        ..SandboxLimits::default()
    };
    let mut vm = Vm::with_config(&image, Config::default(), limits);
    let error = vm
        .run(&mut Vec::new())
        .expect_err("the arena budget must reject the list");
    assert!(matches!(error, RuntimeError::OutOfMemory(_)), "{error}");
}

#[test]
fn debug_records_are_emitted_under_full_debug_and_skipped_at_run_time() {
    let config = Config {
        debug: DebugMode::Full,
        ..Config::default()
    };
    let mut builder = ImageBuilder::new(config.clone());
    builder.debug_record(b"template.weft:12");
    let with_record = builder.here();
    assert!(with_record > 0);
    const_int(&mut builder, 7);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let mut vm = Vm::with_config(&image, config, SandboxLimits::default());
    let value = vm.run(&mut Vec::new()).expect("execution should succeed");
    assert_eq!(value, Value::Int(7));
}

#[test]
fn debug_records_are_dropped_outside_full_debug() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.debug_record(b"template.weft:12");
    assert_eq!(builder.here(), 0, "records are dropped without full debug");
}

#[test]
fn header_validation_rejects_broken_images() {
    assert!(Image::new(vec![1, 2, 3]).is_err());

    // code_section_end pointing past the buffer
    let mut bytes = vec![0u8; 8];
    bytes[0] = 99;
    assert!(Image::new(bytes).is_err());

    // entry offset outside the code section
    let mut builder = ImageBuilder::new(Config::default());
    builder.op(Opcode::Return);
    assert!(builder.finish(4).is_err());
}

#[test]
fn running_off_the_code_section_returns_null() {
    let mut builder = ImageBuilder::new(Config::default());
    const_int(&mut builder, 5);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Null);
}

#[test]
fn string_indexing_yields_single_byte_strings() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.const_str(b"abc");
    const_int(&mut builder, -1);
    builder.op(Opcode::IndexGet);
    builder.op(Opcode::Print);
    builder.op(Opcode::ConstantNull);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, out) = run(&image);
    result.expect("execution should succeed");
    assert_eq!(out, b"c");
}

#[test]
fn prints_containers_recursively() {
    let mut builder = ImageBuilder::new(Config::default());
    for element in [1, 2] {
        const_int(&mut builder, element);
    }
    builder.op(Opcode::InitializeArray);
    builder.emit_u32(2);
    builder.op(Opcode::Print);
    builder.op(Opcode::ConstantNull);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, out) = run(&image);
    result.expect("execution should succeed");
    assert_eq!(out, b"[1, 2]");
}

#[test]
fn host_len_reads_string_bytes() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.const_str(b"abc");
    builder.op(Opcode::CallHost);
    builder.emit_u32(HOST_LEN);
    builder.emit_u8(1);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    assert_eq!(result.expect("execution should succeed"), Value::Int(3));
}

#[test]
fn unknown_host_function_is_a_type_error() {
    let mut builder = ImageBuilder::new(Config::default());
    builder.op(Opcode::CallHost);
    builder.emit_u32(9_999);
    builder.emit_u8(0);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let (result, _) = run(&image);
    let error = result.expect_err("unregistered id must be rejected");
    assert!(matches!(error, RuntimeError::Type(_)), "{error}");
}

#[test]
fn partials_resolve_through_the_host_interface() {
    struct Fixtures;
    impl PartialResolver for Fixtures {
        fn resolve_partial(
            &self,
            template_key: &str,
            include_key: &str,
        ) -> Result<ResolvedPartial, HostError> {
            if include_key == "header" {
                Ok(ResolvedPartial {
                    key: format!("{template_key}/header"),
                    source: "<h1><%= title %></h1>".to_string(),
                })
            } else {
                Err(HostError::InvalidState("unknown partial"))
            }
        }
    }

    let fixtures = Fixtures;
    let partial = fixtures
        .resolve_partial("index", "header")
        .expect("resolution should succeed");
    assert_eq!(partial.key, "index/header");
    assert!(fixtures.resolve_partial("index", "footer").is_err());
}

#[test]
fn wide_local_indices_follow_the_configuration() {
    let config = Config {
        max_locals: 4_096,
        ..Config::default()
    };
    assert_eq!(config.local_width(), 2);

    let mut builder = ImageBuilder::new(config.clone());
    const_int(&mut builder, 41);
    builder.op(Opcode::Incr);
    builder.emit_u8(1);
    builder.emit_local(0);
    builder.op(Opcode::Return);
    let image = builder.finish(0).expect("image should assemble");

    let mut vm = Vm::with_config(&image, config, SandboxLimits::default());
    let value = vm.run(&mut Vec::new()).expect("execution should succeed");
    assert_eq!(value, Value::Int(42));
}
