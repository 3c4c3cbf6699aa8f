use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::*;
use crate::{
    ArenaCreateInfo, ClassCreateInfo, ClassFlags, ClassInfo, CodeBuilder, Context,
    ContextCreateInfo, ExceptionHandler, Fault, FieldInfo, JitConfig, MethodCreateInfo,
    MethodFlags, MethodInfo, MethodLowering, PoolEntry, ThreadId,
    backend::{
        BinaryOperator, Block, Control, End, Node, ScriptValue, StructuredMethod, ValueGraph,
        generate,
    },
    testing::{self, World},
};

fn returned(completion: VmResult<Completion>) -> Option<Value> {
    match completion {
        Ok(Completion::Returned(value)) => value,
        other => panic!("expected a return, got {other:?}"),
    }
}

fn exception_class(result: VmResult<Option<Value>>) -> String {
    match result {
        Err(VmError::Exception(ex)) => ex.class.name.clone(),
        other => panic!("expected an exception, got {other:?}"),
    }
}

fn assert_unwound(thread: &Thread) {
    assert!(thread.is_empty(), "{thread:?} still has frames");
    assert_eq!(thread.sp, thread.bp - 1);
    assert!(thread.monitors.is_empty());
}

#[test]
fn arithmetic_on_arguments_and_locals() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .load(Kind::Int, 1)
        .op(Opcode::Iadd)
        .store(Kind::Int, 2)
        .load(Kind::Int, 2)
        .iconst(2)
        .op(Opcode::Imul)
        .op(Opcode::Ireturn);
    let method = world.static_method("f", "(II)I", 3, b.into_bytes());

    let mut thread = world.thread();
    let value = returned(thread.invoke(&method, &[Value::Int(3), Value::Int(4)]));
    assert_eq!(value, Some(Value::Int(14)));
    assert_unwound(&thread);
}

#[test]
fn integer_arithmetic_wraps() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .iconst(1)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let method = world.static_method("inc", "(I)I", 1, b.into_bytes());
    assert_eq!(
        world.run(&method, &[Value::Int(i32::MAX)]).unwrap(),
        Some(Value::Int(i32::MIN))
    );
}

#[test]
fn stack_shuffles_copy_both_shadows() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    // [3, 5, 3] -> 3 * (5 - 3)
    b.iconst(5)
        .iconst(3)
        .op(Opcode::DupX1)
        .op(Opcode::Isub)
        .op(Opcode::Imul)
        // 2 - 1 after the swap
        .iconst(1)
        .iconst(2)
        .op(Opcode::Swap)
        .op(Opcode::Isub)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let method = world.static_method("shuffle", "()I", 0, b.into_bytes());
    assert_eq!(world.run(&method, &[]).unwrap(), Some(Value::Int(7)));

    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .op(Opcode::Dup)
        .op(Opcode::Pop)
        .op(Opcode::Areturn);
    let identity = world.static_method(
        "id",
        "(Ljava/lang/Object;)Ljava/lang/Object;",
        1,
        b.into_bytes(),
    );
    let obj = Object::new_instance(&context.object_class());
    match world.run(&identity, &[Value::from(obj.clone())]).unwrap() {
        Some(Value::Reference(Some(r))) => assert!(Arc::ptr_eq(&r, &obj)),
        other => panic!("expected the argument back, got {other:?}"),
    }
}

#[test]
fn loops_branch_backwards() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.iconst(0).store(Kind::Int, 1).iconst(1).store(Kind::Int, 2);
    let top = b.current_offset();
    b.load(Kind::Int, 2).load(Kind::Int, 0);
    let exit = b.jump(Opcode::IfIcmpgt);
    b.load(Kind::Int, 1)
        .load(Kind::Int, 2)
        .op(Opcode::Iadd)
        .store(Kind::Int, 1)
        .iinc(2, 1);
    b.jump_back(Opcode::Goto, top).unwrap();
    b.bind(exit).unwrap();
    b.load(Kind::Int, 1).op(Opcode::Ireturn);
    let method = world.static_method("sum", "(I)I", 3, b.into_bytes());

    assert_eq!(
        world.run(&method, &[Value::Int(100)]).unwrap(),
        Some(Value::Int(5050))
    );
    assert_eq!(
        world.run(&method, &[Value::Int(0)]).unwrap(),
        Some(Value::Int(0))
    );
}

#[test]
fn wide_values_use_two_slots() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Long, 0)
        .load(Kind::Long, 2)
        .op(Opcode::Lmul)
        .op(Opcode::Lreturn);
    let mul = world.static_method("mul", "(JJ)J", 4, b.into_bytes());
    assert_eq!(
        world
            .run(&mul, &[Value::Long(1 << 40), Value::Long(3)])
            .unwrap(),
        Some(Value::Long(3 << 40))
    );

    let mut b = CodeBuilder::new();
    b.load(Kind::Double, 0)
        .load(Kind::Int, 2)
        .op(Opcode::I2d)
        .op(Opcode::Ddiv)
        .op(Opcode::Dreturn);
    let div = world.static_method("div", "(DI)D", 3, b.into_bytes());
    assert_eq!(
        world.run(&div, &[Value::Double(7.0), Value::Int(2)]).unwrap(),
        Some(Value::Double(3.5))
    );
}

#[test]
fn float_comparison_orders_nan_by_opcode() {
    let context = testing::context();
    let world = World::new(&context);
    let compare = |op| {
        let mut b = CodeBuilder::new();
        b.load(Kind::Float, 0)
            .load(Kind::Float, 1)
            .op(op)
            .op(Opcode::Ireturn);
        world.static_method("cmp", "(FF)I", 2, b.into_bytes())
    };
    let (fcmpl, fcmpg) = (compare(Opcode::Fcmpl), compare(Opcode::Fcmpg));
    let nan = [Value::Float(f32::NAN), Value::Float(1.0)];
    assert_eq!(world.run(&fcmpl, &nan).unwrap(), Some(Value::Int(-1)));
    assert_eq!(world.run(&fcmpg, &nan).unwrap(), Some(Value::Int(1)));
    let ordered = [Value::Float(2.0), Value::Float(1.0)];
    assert_eq!(world.run(&fcmpl, &ordered).unwrap(), Some(Value::Int(1)));
}

#[test]
fn switches_select_targets() {
    let context = testing::context();
    let world = World::new(&context);

    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0);
    let table = b.table_switch(1, 3);
    b.bind_switch(&table, 0);
    b.iconst(-1).op(Opcode::Ireturn);
    for case in 1..=3 {
        b.bind_switch(&table, case);
        b.iconst(case as i32 * 10).op(Opcode::Ireturn);
    }
    let method = world.static_method("table", "(I)I", 1, b.into_bytes());
    for (key, expected) in [(0, -1), (1, 10), (2, 20), (3, 30), (4, -1)] {
        assert_eq!(
            world.run(&method, &[Value::Int(key)]).unwrap(),
            Some(Value::Int(expected)),
            "key {key}"
        );
    }

    let mut b = CodeBuilder::new();
    b.op(Opcode::Nop).load(Kind::Int, 0);
    let lookup = b.lookup_switch(&[-5, 100]);
    b.bind_switch(&lookup, 0);
    b.iconst(0).op(Opcode::Ireturn);
    b.bind_switch(&lookup, 1);
    b.iconst(1).op(Opcode::Ireturn);
    b.bind_switch(&lookup, 2);
    b.iconst(2).op(Opcode::Ireturn);
    let method = world.static_method("lookup", "(I)I", 1, b.into_bytes());
    for (key, expected) in [(-5, 1), (100, 2), (7, 0)] {
        assert_eq!(
            world.run(&method, &[Value::Int(key)]).unwrap(),
            Some(Value::Int(expected)),
            "key {key}"
        );
    }
}

#[test]
fn recursive_calls_balance_the_stack() {
    let context = testing::context();
    let world = World::new(&context);
    let fib_ref = world.pool.reserve();
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0).iconst(2);
    let recurse = b.jump(Opcode::IfIcmpge);
    b.load(Kind::Int, 0).op(Opcode::Ireturn);
    b.bind(recurse).unwrap();
    b.load(Kind::Int, 0)
        .iconst(1)
        .op(Opcode::Isub)
        .invoke(Opcode::Invokestatic, fib_ref)
        .load(Kind::Int, 0)
        .iconst(2)
        .op(Opcode::Isub)
        .invoke(Opcode::Invokestatic, fib_ref)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let fib = world.static_method("fib", "(I)I", 1, b.into_bytes());
    world.pool.set(fib_ref, PoolEntry::Method(fib.clone()));

    let mut thread = world.thread();
    let value = returned(thread.invoke(&fib, &[Value::Int(15)]));
    assert_eq!(value, Some(Value::Int(610)));
    assert_unwound(&thread);
    assert!(fib.invocation_count() > 1000);
}

#[test]
fn calls_leave_the_caller_stack_balanced() {
    let context = testing::context();
    let world = World::new(&context);
    let lock = Object::new_instance(&context.object_class());
    let other = ThreadId(u64::MAX);

    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .load(Kind::Long, 1)
        .op(Opcode::L2i)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let narrow = world.static_method("narrow", "(IJ)I", 3, b.into_bytes());
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0).op(Opcode::I2l).op(Opcode::Lreturn);
    let widen = world.static_method("widen", "(I)J", 1, b.into_bytes());
    let mut b = CodeBuilder::new();
    b.load(Kind::Double, 0)
        .load(Kind::Double, 0)
        .op(Opcode::Dadd)
        .op(Opcode::Dreturn);
    let twice = world.static_method("twice", "(D)D", 2, b.into_bytes());
    let mut b = CodeBuilder::new();
    b.op(Opcode::Return);
    let ignore = world.static_method("ignore", "(II)V", 2, b.into_bytes());

    type PushArguments = fn(&mut CodeBuilder);
    let cases: [(&MethodRef, PushArguments, Option<Value>, Option<Opcode>); 4] = [
        (
            &narrow,
            |b| {
                b.iconst(1).op(Opcode::Lconst1);
            },
            Some(Value::Int(2)),
            Some(Opcode::Pop),
        ),
        (
            &widen,
            |b| {
                b.iconst(5);
            },
            Some(Value::Long(5)),
            Some(Opcode::Pop2),
        ),
        (
            &twice,
            |b| {
                b.op(Opcode::Dconst1);
            },
            Some(Value::Double(2.0)),
            Some(Opcode::Pop2),
        ),
        (
            &ignore,
            |b| {
                b.iconst(1).iconst(2);
            },
            None,
            None,
        ),
    ];

    for (callee, push_arguments, result, discard) in cases {
        // 4 sits below the call; the caller parks on `lock` right after it
        let callee_ref = world.method_ref(callee);
        let mut b = CodeBuilder::new();
        b.iconst(4);
        push_arguments(&mut b);
        b.invoke(Opcode::Invokestatic, callee_ref)
            .load(Kind::Reference, 0)
            .op(Opcode::Monitorenter)
            .load(Kind::Reference, 0)
            .op(Opcode::Monitorexit);
        if let Some(op) = discard {
            b.op(op);
        }
        b.op(Opcode::Ireturn);
        let caller = world.static_method("caller", "(Ljava/lang/Object;)I", 1, b.into_bytes());

        assert!(lock.monitor().try_enter(other));
        let mut thread = world.thread();
        assert_eq!(
            thread.invoke(&caller, &[Value::from(lock.clone())]).unwrap(),
            Completion::Suspended
        );

        let fp = thread.bp + 1 + FRAME_HEADER_SLOTS;
        let before_call = fp + 1 + callee.consume_argument_slots();
        let width = result.as_ref().map_or(0, |v| v.kind().slot_count());
        assert_eq!(thread.fp, fp, "{callee:?} returned into the caller frame");
        // the lock reference is still on the stack at the parked MONITORENTER
        assert_eq!(
            thread.sp - 1,
            before_call - callee.consume_argument_slots() + width,
            "{callee:?}"
        );
        {
            let arena = context.arena().lock();
            assert_eq!(arena.i4(fp), 4);
            match result {
                Some(Value::Int(v)) => assert_eq!(arena.i4(fp + 1), v),
                Some(Value::Long(v)) => assert_eq!(arena.i8(fp + 1), v),
                Some(Value::Double(v)) => assert_eq!(arena.f8(fp + 1), v),
                _ => {}
            }
        }

        assert!(lock.monitor().exit(other));
        assert_eq!(returned(thread.resume()), Some(Value::Int(4)));
        assert_eq!(lock.monitor().owner(), None);
        assert_unwound(&thread);
    }
}

#[test]
fn unbounded_recursion_overflows_the_stack() {
    let context = testing::context();
    let world = World::new(&context);
    let self_ref = world.pool.reserve();
    let mut b = CodeBuilder::new();
    b.invoke(Opcode::Invokestatic, self_ref).op(Opcode::Return);
    let forever = world.static_method("forever", "()V", 0, b.into_bytes());
    world.pool.set(self_ref, PoolEntry::Method(forever.clone()));

    let mut thread = world.thread();
    let result = thread.invoke(&forever, &[]).map(|_| None);
    assert_eq!(exception_class(result), "java/lang/StackOverflowError");
    assert_unwound(&thread);
}

#[test]
fn exceptions_are_caught_by_covering_handlers() {
    let context = testing::context();
    let world = World::new(&context);
    let arithmetic = context.system_class("java/lang/ArithmeticException");
    let mut b = CodeBuilder::new();
    // 0: bipush 10, 2: iload_0, 3: idiv, 4: ireturn
    b.iconst(10)
        .load(Kind::Int, 0)
        .op(Opcode::Idiv)
        .op(Opcode::Ireturn);
    let handler_pc = b.current_offset();
    b.op(Opcode::Pop).iconst(-1).op(Opcode::Ireturn);
    let method = world.method(MethodCreateInfo {
        name: "safe_div".into(),
        signature: "(I)I".into(),
        flags: MethodFlags::STATIC,
        code: b.into_bytes(),
        max_locals: 1,
        max_stack: 4,
        exception_handlers: vec![ExceptionHandler {
            start_pc: 0,
            end_pc: handler_pc,
            handler_pc,
            catch_type: arithmetic,
        }],
        ..Default::default()
    });

    assert_eq!(
        world.run(&method, &[Value::Int(2)]).unwrap(),
        Some(Value::Int(5))
    );
    let mut thread = world.thread();
    assert_eq!(
        returned(thread.invoke(&method, &[Value::Int(0)])),
        Some(Value::Int(-1))
    );
    assert_unwound(&thread);
}

#[test]
fn exceptions_unwind_through_callers() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.iconst(1)
        .load(Kind::Int, 0)
        .op(Opcode::Idiv)
        .op(Opcode::Ireturn);
    let inverse = world.static_method("inverse", "(I)I", 1, b.into_bytes());
    let inverse_ref = world.method_ref(&inverse);

    // no handler anywhere
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .invoke(Opcode::Invokestatic, inverse_ref)
        .op(Opcode::Ireturn);
    let unprotected = world.static_method("unprotected", "(I)I", 1, b.into_bytes());
    let mut thread = world.thread();
    let result = thread.invoke(&unprotected, &[Value::Int(0)]).map(|_| None);
    assert_eq!(exception_class(result), "java/lang/ArithmeticException");
    assert_unwound(&thread);

    // a catch-all around the call site
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .invoke(Opcode::Invokestatic, inverse_ref)
        .op(Opcode::Ireturn);
    let handler_pc = b.current_offset();
    b.op(Opcode::Pop).iconst(42).op(Opcode::Ireturn);
    let protected = world.method(MethodCreateInfo {
        name: "protected".into(),
        signature: "(I)I".into(),
        flags: MethodFlags::STATIC,
        code: b.into_bytes(),
        max_locals: 1,
        max_stack: 4,
        exception_handlers: vec![ExceptionHandler {
            start_pc: 0,
            end_pc: handler_pc - 1,
            handler_pc,
            catch_type: None,
        }],
        ..Default::default()
    });
    let mut thread = world.thread();
    assert_eq!(
        returned(thread.invoke(&protected, &[Value::Int(0)])),
        Some(Value::Int(42))
    );
    assert_unwound(&thread);
}

#[test]
fn handlers_of_unrelated_types_are_skipped() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.op(Opcode::AconstNull).op(Opcode::Athrow);
    let handler_pc = b.current_offset();
    b.iconst(0).op(Opcode::Ireturn);
    let method = world.method(MethodCreateInfo {
        name: "throws_npe".into(),
        signature: "()I".into(),
        flags: MethodFlags::STATIC,
        code: b.into_bytes(),
        max_stack: 2,
        exception_handlers: vec![ExceptionHandler {
            start_pc: 0,
            end_pc: handler_pc,
            handler_pc,
            catch_type: context.system_class("java/lang/ArithmeticException"),
        }],
        ..Default::default()
    });
    assert_eq!(
        exception_class(world.run(&method, &[])),
        "java/lang/NullPointerException"
    );
}

#[test]
fn arrays_are_checked() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .op_u8(Opcode::Newarray, 10)
        .store(Kind::Reference, 1)
        .load(Kind::Reference, 1)
        .iconst(0)
        .iconst(7)
        .op(Opcode::Iastore)
        .load(Kind::Reference, 1)
        .iconst(1)
        .iconst(5)
        .op(Opcode::Iastore)
        .load(Kind::Reference, 1)
        .iconst(0)
        .op(Opcode::Iaload)
        .load(Kind::Reference, 1)
        .iconst(1)
        .op(Opcode::Iaload)
        .op(Opcode::Iadd)
        .load(Kind::Reference, 1)
        .op(Opcode::Arraylength)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    let method = world.static_method("arrays", "(I)I", 2, b.into_bytes());

    assert_eq!(
        world.run(&method, &[Value::Int(3)]).unwrap(),
        Some(Value::Int(15))
    );
    assert_eq!(
        exception_class(world.run(&method, &[Value::Int(1)])),
        "java/lang/ArrayIndexOutOfBoundsException"
    );
    assert_eq!(
        exception_class(world.run(&method, &[Value::Int(-1)])),
        "java/lang/NegativeArraySizeException"
    );
}

#[test]
fn byte_arrays_narrow_stores() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.iconst(1)
        .op_u8(Opcode::Newarray, 8)
        .op(Opcode::Dup)
        .iconst(0)
        .iconst(200)
        .op(Opcode::Bastore)
        .iconst(0)
        .op(Opcode::Baload)
        .op(Opcode::Ireturn);
    let method = world.static_method("bytes", "()I", 0, b.into_bytes());
    assert_eq!(world.run(&method, &[]).unwrap(), Some(Value::Int(-56)));
}

#[test]
fn reference_array_stores_check_the_element_type() {
    let context = testing::context();
    let world = World::new(&context);
    let string_class = context.system_class("java/lang/String").unwrap();
    let strings = world.pool.add(PoolEntry::Class(string_class));
    let mut b = CodeBuilder::new();
    b.iconst(1)
        .op_u16(Opcode::Anewarray, strings)
        .iconst(0)
        .load(Kind::Reference, 0)
        .op(Opcode::Aastore)
        .iconst(0)
        .op(Opcode::Ireturn);
    let method = world.static_method("store", "(Ljava/lang/Object;)I", 1, b.into_bytes());

    let text = context.new_string("ok");
    assert_eq!(
        world.run(&method, &[Value::from(text)]).unwrap(),
        Some(Value::Int(0))
    );
    let plain = Object::new_instance(&context.object_class());
    assert_eq!(
        exception_class(world.run(&method, &[Value::from(plain)])),
        "java/lang/ArrayStoreException"
    );
}

#[test]
fn multi_dimensional_arrays_nest() {
    let context = testing::context();
    let world = World::new(&context);
    let ints = context.array_class(&ElementType::Int);
    let matrix = context.array_class(&ElementType::Reference(ints));
    let matrix_ref = world.pool.add(PoolEntry::Class(matrix));
    let mut b = CodeBuilder::new();
    b.iconst(2)
        .iconst(3)
        .multianewarray(matrix_ref, 2)
        .iconst(1)
        .op(Opcode::Aaload)
        .op(Opcode::Arraylength)
        .op(Opcode::Ireturn);
    let method = world.static_method("matrix", "()I", 0, b.into_bytes());
    assert_eq!(world.run(&method, &[]).unwrap(), Some(Value::Int(3)));
}

#[test]
fn fields_are_read_and_written() {
    let context = testing::context();
    let world = World::new(&context);
    let counter = FieldInfo::new_static(&world.class, "counter", Kind::Int);
    let counter_ref = world.pool.add(PoolEntry::Field(counter.clone()));
    let mut b = CodeBuilder::new();
    b.op_u16(Opcode::Getstatic, counter_ref)
        .iconst(1)
        .op(Opcode::Iadd)
        .op(Opcode::Dup)
        .op_u16(Opcode::Putstatic, counter_ref)
        .op(Opcode::Ireturn);
    let next = world.static_method("next", "()I", 0, b.into_bytes());
    assert_eq!(world.run(&next, &[]).unwrap(), Some(Value::Int(1)));
    assert_eq!(world.run(&next, &[]).unwrap(), Some(Value::Int(2)));
    assert_eq!(counter.get_static().unwrap(), Value::Int(2));

    let point = world.class("Point", &world.class, 2);
    let point_ref = world.pool.add(PoolEntry::Class(point.clone()));
    let y = world
        .pool
        .add(PoolEntry::Field(FieldInfo::new_instance(&point, "y", Kind::Int, 1)));
    let mut b = CodeBuilder::new();
    b.op_u16(Opcode::New, point_ref)
        .op(Opcode::Dup)
        .load(Kind::Int, 0)
        .op_u16(Opcode::Putfield, y)
        .op_u16(Opcode::Getfield, y)
        .op(Opcode::Ireturn);
    let roundtrip = world.static_method("point", "(I)I", 1, b.into_bytes());
    assert_eq!(
        world.run(&roundtrip, &[Value::Int(9)]).unwrap(),
        Some(Value::Int(9))
    );

    let mut b = CodeBuilder::new();
    b.op(Opcode::AconstNull)
        .op_u16(Opcode::Getfield, y)
        .op(Opcode::Ireturn);
    let null_read = world.static_method("null_read", "()I", 0, b.into_bytes());
    assert_eq!(
        exception_class(world.run(&null_read, &[])),
        "java/lang/NullPointerException"
    );
}

#[test]
fn type_checks_follow_the_hierarchy() {
    let context = testing::context();
    let world = World::new(&context);
    let runtime = context.system_class("java/lang/RuntimeException").unwrap();
    let runtime_ref = world.pool.add(PoolEntry::Class(runtime));

    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .op_u16(Opcode::Instanceof, runtime_ref)
        .op(Opcode::Ireturn);
    let is_runtime = world.static_method("is", "(Ljava/lang/Object;)I", 1, b.into_bytes());
    let npe = context.new_exception(Fault::NullPointer, None);
    let plain = Object::new_instance(&context.object_class());
    assert_eq!(
        world.run(&is_runtime, &[Value::from(npe.clone())]).unwrap(),
        Some(Value::Int(1))
    );
    assert_eq!(
        world.run(&is_runtime, &[Value::from(plain.clone())]).unwrap(),
        Some(Value::Int(0))
    );
    assert_eq!(
        world.run(&is_runtime, &[Value::NULL]).unwrap(),
        Some(Value::Int(0))
    );

    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .op_u16(Opcode::Checkcast, runtime_ref)
        .op(Opcode::Areturn);
    let cast = world.static_method(
        "cast",
        "(Ljava/lang/Object;)Ljava/lang/RuntimeException;",
        1,
        b.into_bytes(),
    );
    assert!(world.run(&cast, &[Value::from(npe)]).is_ok());
    assert!(world.run(&cast, &[Value::NULL]).is_ok());
    match world.run(&cast, &[Value::from(plain)]) {
        Err(VmError::Exception(ex)) => {
            assert_eq!(ex.class.name, "java/lang/ClassCastException");
            assert_eq!(
                ex.message.as_deref(),
                Some("java/lang/Object cannot be cast to java/lang/RuntimeException")
            );
        }
        other => panic!("expected ClassCastException, got {other:?}"),
    }
}

fn instance_method(class: &ClassRef, name: &str, result: i32, slot: u16) -> MethodRef {
    let mut b = CodeBuilder::new();
    b.iconst(result).op(Opcode::Ireturn);
    MethodInfo::new(class, MethodCreateInfo {
        name: name.into(),
        signature: "()I".into(),
        flags: MethodFlags::PUBLIC,
        code: b.into_bytes(),
        max_locals: 1,
        max_stack: 2,
        vtable_index: Some(slot),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn virtual_calls_dispatch_on_the_receiver() {
    let context = testing::context();
    let world = World::new(&context);
    let animal = world.class("Animal", &world.class, 0);
    let dog = world.class("Dog", &animal, 0);
    let speak = instance_method(&animal, "speak", 1, 0);
    let bark = instance_method(&dog, "speak", 2, 0);
    animal.link(vec![speak.clone()], HashMap::new());
    dog.link(vec![bark], HashMap::new());

    let speak_ref = world.method_ref(&speak);
    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .invoke(Opcode::Invokevirtual, speak_ref)
        .op(Opcode::Ireturn);
    let call = world.static_method("call", "(LAnimal;)I", 1, b.into_bytes());

    let as_value = |class: &ClassRef| Value::from(Object::new_instance(class));
    assert_eq!(
        world.run(&call, &[as_value(&animal)]).unwrap(),
        Some(Value::Int(1))
    );
    assert_eq!(
        world.run(&call, &[as_value(&dog)]).unwrap(),
        Some(Value::Int(2))
    );
    assert_eq!(
        exception_class(world.run(&call, &[Value::NULL])),
        "java/lang/NullPointerException"
    );
}

#[test]
fn interface_calls_dispatch_by_name_and_signature() {
    let context = testing::context();
    let world = World::new(&context);
    let shape = ClassInfo::new(ClassCreateInfo {
        name: "Shape".into(),
        flags: ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT,
        ..Default::default()
    });
    let area = MethodInfo::new(&shape, MethodCreateInfo {
        name: "area".into(),
        signature: "()I".into(),
        flags: MethodFlags::PUBLIC | MethodFlags::ABSTRACT,
        ..Default::default()
    })
    .unwrap();
    let square = ClassInfo::new(ClassCreateInfo {
        name: "Square".into(),
        super_class: Some(context.object_class()),
        interfaces: vec![shape.clone()],
        ..Default::default()
    });
    let square_area = instance_method(&square, "area", 16, 0);
    square.link(
        vec![square_area.clone()],
        HashMap::from([(("area".to_string(), "()I".to_string()), square_area)]),
    );
    let plain = world.class("Plain", &world.class, 0);

    let area_ref = world.method_ref(&area);
    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .invoke(Opcode::Invokeinterface, area_ref)
        .op(Opcode::Ireturn);
    let call = world.static_method("call", "(LShape;)I", 1, b.into_bytes());

    let square = Value::from(Object::new_instance(&square));
    assert_eq!(world.run(&call, &[square]).unwrap(), Some(Value::Int(16)));
    let plain = Value::from(Object::new_instance(&plain));
    assert!(matches!(
        world.run(&call, &[plain]),
        Err(VmError::NoSuchMethod { .. })
    ));
}

#[test]
fn natives_receive_popped_arguments() {
    let context = testing::context();
    let world = World::new(&context);
    let twice = world.method(MethodCreateInfo {
        name: "twice".into(),
        signature: "(JI)J".into(),
        flags: MethodFlags::STATIC | MethodFlags::NATIVE,
        ..Default::default()
    });
    context
        .natives()
        .register("Test.twice.(JI)J", |_, args| {
            Ok(Some(Value::Long(args[0].as_long()? * 2 + args[1].as_int()? as i64)))
        });
    let twice_ref = world.method_ref(&twice);
    let mut b = CodeBuilder::new();
    b.load(Kind::Long, 0)
        .iconst(1)
        .invoke(Opcode::Invokestatic, twice_ref)
        .op(Opcode::Lreturn);
    let call = world.static_method("call", "(J)J", 2, b.into_bytes());
    assert_eq!(
        world.run(&call, &[Value::Long(20)]).unwrap(),
        Some(Value::Long(41))
    );

    let unbound = world.method(MethodCreateInfo {
        name: "missing".into(),
        signature: "()V".into(),
        flags: MethodFlags::STATIC | MethodFlags::NATIVE,
        ..Default::default()
    });
    assert!(matches!(
        world.run(&unbound, &[]),
        Err(VmError::UnboundNative(key)) if key == "Test.missing.()V"
    ));
}

#[test]
fn contended_monitors_suspend_and_resume() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .op(Opcode::Monitorenter)
        .load(Kind::Reference, 0)
        .op(Opcode::Monitorexit)
        .iconst(1)
        .op(Opcode::Ireturn);
    let method = world.static_method("locked", "(Ljava/lang/Object;)I", 1, b.into_bytes());

    let lock = Object::new_instance(&context.object_class());
    let other = ThreadId(u64::MAX);
    assert!(lock.monitor().try_enter(other));

    let mut thread = world.thread();
    assert_eq!(
        thread.invoke(&method, &[Value::from(lock.clone())]).unwrap(),
        Completion::Suspended
    );
    assert!(!thread.is_empty());
    assert_eq!(thread.pc, 1, "parked on the MONITORENTER");

    assert!(lock.monitor().exit(other));
    assert_eq!(returned(thread.resume()), Some(Value::Int(1)));
    assert_eq!(lock.monitor().owner(), None);
    assert_unwound(&thread);
}

#[test]
fn exiting_an_unowned_monitor_throws() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.load(Kind::Reference, 0)
        .op(Opcode::Monitorexit)
        .op(Opcode::Return);
    let method = world.static_method("unlock", "(Ljava/lang/Object;)V", 1, b.into_bytes());
    let lock = Object::new_instance(&context.object_class());
    assert_eq!(
        exception_class(world.run(&method, &[Value::from(lock)])),
        "java/lang/IllegalMonitorStateException"
    );
}

#[test]
fn synchronized_methods_release_their_monitor() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.iconst(1)
        .load(Kind::Int, 0)
        .op(Opcode::Idiv)
        .op(Opcode::Ireturn);
    let method = world.method(MethodCreateInfo {
        name: "guarded".into(),
        signature: "(I)I".into(),
        flags: MethodFlags::STATIC | MethodFlags::SYNCHRONIZED,
        code: b.into_bytes(),
        max_locals: 1,
        max_stack: 2,
        ..Default::default()
    });
    let method_ref = world.method_ref(&method);
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .invoke(Opcode::Invokestatic, method_ref)
        .op(Opcode::Ireturn);
    let caller = world.static_method("caller", "(I)I", 1, b.into_bytes());

    assert_eq!(
        world.run(&caller, &[Value::Int(1)]).unwrap(),
        Some(Value::Int(1))
    );
    assert_eq!(world.class.monitor().owner(), None);

    let mut thread = world.thread();
    assert!(thread.invoke(&caller, &[Value::Int(0)]).is_err());
    assert_eq!(world.class.monitor().owner(), None);
    assert_unwound(&thread);

    // entered directly from the host while another thread holds the class
    let other = ThreadId(u64::MAX);
    assert!(world.class.monitor().try_enter(other));
    let mut thread = world.thread();
    assert_eq!(
        thread.invoke(&method, &[Value::Int(1)]).unwrap(),
        Completion::Suspended
    );
    assert!(thread.is_empty());
    assert!(world.class.monitor().exit(other));
    assert_eq!(
        returned(thread.invoke(&method, &[Value::Int(1)])),
        Some(Value::Int(1))
    );
    assert_eq!(world.class.monitor().owner(), None);
}

#[test]
fn uncatchable_errors_drop_frames_and_monitors() {
    let context = testing::context();
    let world = World::new(&context);
    let missing = world.method(MethodCreateInfo {
        name: "missing".into(),
        signature: "()V".into(),
        flags: MethodFlags::STATIC | MethodFlags::NATIVE,
        ..Default::default()
    });
    let missing_ref = world.method_ref(&missing);
    let mut b = CodeBuilder::new();
    b.invoke(Opcode::Invokestatic, missing_ref)
        .op(Opcode::Return);
    let guarded = world.method(MethodCreateInfo {
        name: "guarded".into(),
        signature: "()V".into(),
        flags: MethodFlags::STATIC | MethodFlags::SYNCHRONIZED,
        code: b.into_bytes(),
        max_locals: 0,
        max_stack: 2,
        ..Default::default()
    });
    let guarded_ref = world.method_ref(&guarded);
    let mut b = CodeBuilder::new();
    b.iconst(7)
        .invoke(Opcode::Invokestatic, guarded_ref)
        .op(Opcode::Ireturn);
    let caller = world.static_method("caller", "(I)I", 1, b.into_bytes());

    let mut thread = world.thread();
    assert!(matches!(
        thread.invoke(&guarded, &[]),
        Err(VmError::UnboundNative(key)) if key == "Test.missing.()V"
    ));
    assert_unwound(&thread);
    assert_eq!(world.class.monitor().owner(), None);

    // the frame below the synchronized one goes too
    assert!(matches!(
        thread.invoke(&caller, &[Value::Int(1)]),
        Err(VmError::UnboundNative(_))
    ));
    assert_unwound(&thread);
    assert_eq!(world.class.monitor().owner(), None);

    context
        .natives()
        .register("Test.missing.()V", |_, _| Ok(None));
    assert_eq!(returned(thread.invoke(&guarded, &[])), None);
    assert_unwound(&thread);
}

#[test]
fn malformed_code_is_reported() {
    let context = testing::context();
    let world = World::new(&context);
    let truncated = world.static_method("truncated", "()I", 0, vec![Opcode::Sipush as u8, 1]);
    assert!(matches!(
        world.run(&truncated, &[]),
        Err(VmError::CodeBounds { .. })
    ));
    let unknown = world.static_method("unknown", "()V", 0, vec![0xfe]);
    assert!(matches!(
        world.run(&unknown, &[]),
        Err(VmError::UnknownOpcode { opcode: 0xfe, pc: 0 })
    ));
    let jsr = world.static_method("jsr", "()V", 0, vec![Opcode::Jsr as u8, 0, 3]);
    assert!(matches!(
        world.run(&jsr, &[]),
        Err(VmError::Unsupported(Opcode::Jsr))
    ));
}

// ── compiled code ──────────────────────────────────────────────────

fn subtraction() -> StructuredMethod {
    let mut graph = ValueGraph::new();
    let a = graph.parameter(0, "a");
    let b = graph.parameter(1, "b");
    let difference = graph.binary(BinaryOperator::ISub, a, b);
    StructuredMethod {
        graph,
        root: Control::Block(Block {
            nodes: Vec::new(),
            end: End::Stop {
                argument: difference,
            },
        }),
    }
}

/// `(II)I` adding its arguments when interpreted.
fn adder(world: &World) -> MethodRef {
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .load(Kind::Int, 1)
        .op(Opcode::Iadd)
        .op(Opcode::Ireturn);
    world.static_method("combine", "(II)I", 2, b.into_bytes())
}

struct CountingLowering {
    calls: AtomicUsize,
    compiles: bool,
}

impl MethodLowering for CountingLowering {
    fn lower(&self, _method: &MethodInfo) -> Option<StructuredMethod> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.compiles.then(subtraction)
    }
}

fn jit_context(hot_method_threshold: u32) -> Arc<Context> {
    Context::new(&ContextCreateInfo {
        arena: ArenaCreateInfo { size: 1 << 16 },
        jit: JitConfig {
            enabled: true,
            hot_method_threshold,
        },
    })
}

#[test]
fn installed_compilations_replace_interpretation() {
    let context = testing::context();
    let world = World::new(&context);
    let combine = adder(&world);
    let combine_ref = world.method_ref(&combine);
    let mut b = CodeBuilder::new();
    b.load(Kind::Int, 0)
        .load(Kind::Int, 1)
        .invoke(Opcode::Invokestatic, combine_ref)
        .op(Opcode::Ireturn);
    let caller = world.static_method("caller", "(II)I", 2, b.into_bytes());
    let args = [Value::Int(10), Value::Int(3)];

    assert_eq!(world.run(&caller, &args).unwrap(), Some(Value::Int(13)));
    let unit = generate(&subtraction(), None).unwrap();
    context.install_compilation(&combine, unit);

    let mut thread = world.thread();
    assert_eq!(returned(thread.invoke(&caller, &args)), Some(Value::Int(7)));
    assert_unwound(&thread);
    assert_eq!(world.run(&combine, &args).unwrap(), Some(Value::Int(7)));
}

#[test]
fn hot_methods_are_promoted() {
    let context = jit_context(3);
    let lowering = Arc::new(CountingLowering {
        calls: AtomicUsize::new(0),
        compiles: true,
    });
    context.set_lowering(lowering.clone());
    let world = World::new(&context);
    let combine = adder(&world);
    let args = [Value::Int(10), Value::Int(3)];

    let results: Vec<_> = (0..4)
        .map(|_| world.run(&combine, &args).unwrap())
        .collect();
    assert_eq!(
        results,
        [
            Some(Value::Int(13)),
            Some(Value::Int(13)),
            Some(Value::Int(7)),
            Some(Value::Int(7)),
        ]
    );
    assert_eq!(lowering.calls.load(Ordering::SeqCst), 1);
    assert_eq!(context.compiled().len(), 1);
}

#[test]
fn methods_without_ir_stay_interpreted() {
    let context = jit_context(1);
    let lowering = Arc::new(CountingLowering {
        calls: AtomicUsize::new(0),
        compiles: false,
    });
    context.set_lowering(lowering.clone());
    let world = World::new(&context);
    let combine = adder(&world);
    let args = [Value::Int(10), Value::Int(3)];

    for _ in 0..3 {
        assert_eq!(world.run(&combine, &args).unwrap(), Some(Value::Int(13)));
    }
    assert!(!combine.is_compilable());
    assert_eq!(lowering.calls.load(Ordering::SeqCst), 1);
    assert!(context.compiled().is_empty());
}

#[test]
fn exceptions_thrown_by_compiled_code_unwind() {
    let context = testing::context();
    let world = World::new(&context);
    let mut b = CodeBuilder::new();
    b.iconst(0).op(Opcode::Ireturn);
    let thrower = world.static_method("thrower", "()I", 0, b.into_bytes());
    let exception = context.new_exception(Fault::Arithmetic, None);
    let mut graph = ValueGraph::new();
    let argument = graph.constant(ScriptValue::Host(Value::Reference(Some(exception))));
    let throw = graph.add(Node::Throw { argument });
    let structured = StructuredMethod {
        graph,
        root: Control::Block(Block {
            nodes: vec![throw],
            end: End::Jump,
        }),
    };
    context.install_compilation(&thrower, generate(&structured, None).unwrap());

    let thrower_ref = world.method_ref(&thrower);
    let mut b = CodeBuilder::new();
    b.invoke(Opcode::Invokestatic, thrower_ref)
        .op(Opcode::Ireturn);
    let handler_pc = b.current_offset();
    b.op(Opcode::Pop).iconst(-1).op(Opcode::Ireturn);
    let caller = world.method(MethodCreateInfo {
        name: "caller".into(),
        signature: "()I".into(),
        flags: MethodFlags::STATIC,
        code: b.into_bytes(),
        max_locals: 0,
        max_stack: 4,
        exception_handlers: vec![ExceptionHandler {
            start_pc: 0,
            end_pc: handler_pc,
            handler_pc,
            catch_type: None,
        }],
        ..Default::default()
    });

    let mut thread = world.thread();
    assert_eq!(returned(thread.invoke(&caller, &[])), Some(Value::Int(-1)));
    assert_unwound(&thread);
    assert_eq!(
        exception_class(world.run(&thrower, &[])),
        "java/lang/ArithmeticException"
    );
}
