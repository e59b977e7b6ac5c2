//! Compiled function descriptors and their runtime closures, grounded in
//! `intern.h`'s `struct prototype`/`struct function` and `core.c`'s
//! `lambda()`.

use crate::heap::Id;
use crate::value::{FuncId, StrId, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub a: u8,
    pub b: i16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Push = 0,
    Pop,
    Copy,
    Load,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Eq,
    Less,
    Lequal,
    Not,
    And,
    Or,
    Test,
    Jmp,
    Return,
    Call,
    Tcall,
    Lambda,
    Getglobal,
    Setglobal,
}

impl OpCode {
    pub fn from_u8(b: u8) -> Option<OpCode> {
        use OpCode::*;
        const TABLE: &[OpCode] = &[
            Push, Pop, Copy, Load, Add, Sub, Mul, Div, Mod, Pow, Unm, Eq, Less, Lequal, Not, And,
            Or, Test, Jmp, Return, Call, Tcall, Lambda, Getglobal, Setglobal,
        ];
        TABLE.get(b as usize).copied()
    }
}

/// A constant-pool entry as decoded from the bytecode stream. String
/// constants are raw decoded bytes at this stage; they are interned only
/// when a closure is instantiated from the prototype (§4.6/§4.7).
#[derive(Clone, Debug)]
pub enum Constant {
    Nil,
    True,
    False,
    Number(f64),
    Str(Vec<u8>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpvalDesc {
    pub level: u16,
    pub index: u16,
}

pub type ProtoId = Id<Prototype>;

/// An immutable compiled function template. Nested prototypes are arena
/// ids, not owned inline trees, so the same `Prototype` can be referenced
/// by more than one `Closure` (matches `function_t::prot` being a pointer
/// into the shared, load-time-decoded prototype graph -- a `LAMBDA`
/// executed repeatedly, e.g. inside a loop, creates a fresh closure per
/// iteration but all of them share one `Prototype`).
pub struct Prototype {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub upvalues: Vec<UpvalDesc>,
    pub sub_prototypes: Vec<ProtoId>,
    pub name: Vec<u8>,
    pub line_info: Vec<u32>,
}

/// A resolved constant value: string constants are interned `StrId`s, every
/// other variant carries its value directly.
#[derive(Copy, Clone)]
pub enum ResolvedConstant {
    Nil,
    True,
    False,
    Number(f64),
    Str(StrId),
}

impl ResolvedConstant {
    pub fn as_value(&self) -> Value {
        match self {
            ResolvedConstant::Nil => Value::Nil,
            ResolvedConstant::True => Value::Bool(true),
            ResolvedConstant::False => Value::Bool(false),
            ResolvedConstant::Number(n) => Value::Number(*n),
            ResolvedConstant::Str(s) => Value::Str(*s),
        }
    }
}

/// A runtime instance of a `Prototype`: the shared prototype id, resolved
/// constants (strings interned), captured upvalues, and a declared arity.
pub struct Closure {
    pub prototype: ProtoId,
    pub constants: Vec<ResolvedConstant>,
    pub upvalues: Vec<Value>,
    /// Declared argument count; negative means variadic (collect trailing
    /// arguments into a vector), matching `intern.h`'s signed `num_args`.
    pub arity: i32,
}

pub type ClosureId = FuncId;
