//! Integration tests for the bytecode dispatch loop: hand-assembled
//! prototypes run through `State::lambda`/`State::call`, exercising the
//! call/return/closure machinery without going through the loader.

use su_core::{Constant, Instruction, OpCode, Prototype, UpvalDesc, Value};
use su_runtime::State;

fn instr(op: OpCode, a: u8, b: i16) -> Instruction {
    Instruction { op, a, b }
}

/// `fn(a, b) { return a + b }`, arity 2, no constants.
fn add_prototype() -> Prototype {
    Prototype {
        instructions: vec![
            instr(OpCode::Load, 0, 0),
            instr(OpCode::Load, 1, 0),
            instr(OpCode::Add, 0, 0),
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![],
        upvalues: vec![],
        sub_prototypes: vec![],
        name: b"add".to_vec(),
        line_info: vec![1, 1, 1, 1],
    }
}

#[test]
fn closure_call_adds_its_arguments() {
    let mut s = State::new();
    let id = s.heap.prototypes.insert(add_prototype());
    s.lambda(id, 2).unwrap();
    s.push(Value::Number(3.0)).unwrap();
    s.push(Value::Number(4.0)).unwrap();
    s.call(2, 1).unwrap();

    match s.get(-1).unwrap() {
        Value::Number(n) => assert_eq!(n, 7.0),
        other => panic!("expected a number, got {other:?}"),
    }
}

/// `fn(n) { if n <= 1 { return 1 } return n * fact(n - 1) }`, recursing
/// through a global lookup since the prototype can't reference its own
/// not-yet-instantiated closure.
fn factorial_prototype() -> Prototype {
    Prototype {
        instructions: vec![
            instr(OpCode::Load, 0, 0),   // 0: n
            instr(OpCode::Push, 0, 0),   // 1: 1
            instr(OpCode::Lequal, 0, 0), // 2: n <= 1
            instr(OpCode::Test, 6, 0),   // 3: jump to 6 if true
            instr(OpCode::Getglobal, 1, 0), // 4: fact
            instr(OpCode::Jmp, 8, 0),    // 5: skip the base case, land on the recursive step
            instr(OpCode::Push, 0, 0),   // 6: 1
            instr(OpCode::Return, 0, 0), // 7
            instr(OpCode::Load, 0, 0),   // 8: n
            instr(OpCode::Push, 0, 0),   // 9: 1
            instr(OpCode::Sub, 0, 0),    // 10: n - 1
            instr(OpCode::Call, 1, 0),   // 11: fact(n - 1)
            instr(OpCode::Load, 0, 0),   // 12: n
            instr(OpCode::Mul, 0, 0),    // 13: n * fact(n - 1)
            instr(OpCode::Return, 0, 0), // 14
        ],
        constants: vec![Constant::Number(1.0), Constant::Str(b"fact".to_vec())],
        upvalues: vec![],
        sub_prototypes: vec![],
        name: b"fact".to_vec(),
        line_info: vec![1; 15],
    }
}

#[test]
fn recursive_global_call_computes_factorial() {
    let mut s = State::new();
    let id = s.heap.prototypes.insert(factorial_prototype());
    s.lambda(id, 1).unwrap();
    match s.get(-1).unwrap() {
        Value::Function(f) => {
            s.set_global(true, b"fact").unwrap();
            let _ = f;
        }
        _ => unreachable!(),
    }
    // set_global pops the closure; re-fetch it to call with an argument.
    s.get_global(b"fact").unwrap();
    s.push(Value::Number(5.0)).unwrap();
    s.call(1, 1).unwrap();

    match s.get(-1).unwrap() {
        Value::Number(n) => assert_eq!(n, 120.0),
        other => panic!("expected a number, got {other:?}"),
    }
}

/// A closure over an upvalue captured from the enclosing call's locals.
fn counter_prototype() -> Prototype {
    Prototype {
        instructions: vec![
            instr(OpCode::Load, 0, 0), // upvalue slot 0 (the captured start)
            instr(OpCode::Push, 0, 0),
            instr(OpCode::Add, 0, 0),
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![Constant::Number(1.0)],
        upvalues: vec![UpvalDesc { level: 1, index: 0 }],
        sub_prototypes: vec![],
        name: b"bump".to_vec(),
        line_info: vec![1; 4],
    }
}

#[test]
fn upvalue_is_captured_by_value_at_lambda_time() {
    let mut s = State::new();
    let inner = s.heap.prototypes.insert(counter_prototype());
    let outer = Prototype {
        instructions: vec![
            instr(OpCode::Lambda, 0, 0), // closes over arg 0 (the start value), arity 0
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![],
        upvalues: vec![],
        sub_prototypes: vec![inner],
        name: b"make_bumper".to_vec(),
        line_info: vec![1; 2],
    };
    let outer_id = s.heap.prototypes.insert(outer);

    s.lambda(outer_id, 1).unwrap();
    s.push(Value::Number(41.0)).unwrap();
    s.call(1, 1).unwrap();

    match s.get(-1).unwrap() {
        Value::Function(_) => {}
        other => panic!("expected a closure, got {other:?}"),
    }
    s.call(0, 1).unwrap();
    match s.get(-1).unwrap() {
        Value::Number(n) => assert_eq!(n, 42.0),
        other => panic!("expected a number, got {other:?}"),
    }
}

/// Same shape as `counter_prototype`, captured by a `make_bumper` that is
/// itself called as a *nested* call (through an `entry` wrapper) rather
/// than directly from the host. This puts more than one frame on the call
/// stack at the moment the `LAMBDA` instruction runs, so `level: 1` must
/// resolve to the currently-running frame (`make_bumper`'s own), not its
/// caller (`entry`'s) -- the two are easy to conflate by an off-by-one in
/// the frame-levels-up arithmetic, and `entry` is given a different
/// argument value than `make_bumper` so the two cases produce visibly
/// different captured values.
fn bumper_prototype() -> Prototype {
    Prototype {
        instructions: vec![
            instr(OpCode::Load, 0, 0),
            instr(OpCode::Push, 0, 0),
            instr(OpCode::Add, 0, 0),
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![Constant::Number(1.0)],
        upvalues: vec![UpvalDesc { level: 1, index: 0 }],
        sub_prototypes: vec![],
        name: b"bump".to_vec(),
        line_info: vec![1; 4],
    }
}

#[test]
fn upvalue_capture_reads_the_running_frame_not_its_caller() {
    let mut s = State::new();
    let inner = s.heap.prototypes.insert(bumper_prototype());
    let make_bumper = Prototype {
        instructions: vec![
            instr(OpCode::Lambda, 0, 0),
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![],
        upvalues: vec![],
        sub_prototypes: vec![inner],
        name: b"make_bumper".to_vec(),
        line_info: vec![1; 2],
    };
    let make_bumper_id = s.heap.prototypes.insert(make_bumper);
    s.lambda(make_bumper_id, 1).unwrap();
    s.set_global(false, b"make_bumper").unwrap();

    // entry(x): ignores x, calls make_bumper(99) as a nested call so that
    // make_bumper's own frame sits above entry's when its LAMBDA runs.
    let entry = Prototype {
        instructions: vec![
            instr(OpCode::Getglobal, 0, 0),
            instr(OpCode::Push, 1, 0),
            instr(OpCode::Call, 1, 0),
            instr(OpCode::Return, 0, 0),
        ],
        constants: vec![Constant::Str(b"make_bumper".to_vec()), Constant::Number(99.0)],
        upvalues: vec![],
        sub_prototypes: vec![],
        name: b"entry".to_vec(),
        line_info: vec![1; 4],
    };
    let entry_id = s.heap.prototypes.insert(entry);
    s.lambda(entry_id, 1).unwrap();
    s.push(Value::Number(5.0)).unwrap();
    s.call(1, 1).unwrap();

    match s.get(-1).unwrap() {
        Value::Function(_) => {}
        other => panic!("expected a closure, got {other:?}"),
    }
    s.call(0, 1).unwrap();
    match s.get(-1).unwrap() {
        Value::Number(n) => assert_eq!(n, 100.0, "upvalue must be make_bumper's own arg (99), not entry's (5)"),
        other => panic!("expected a number, got {other:?}"),
    }
}
