//! The runtime `Value` tagged union, grounded in `intern.h`'s `struct value`
//! and the distilled specification's §3 data model.

use crate::heap::Id;
use crate::intern::SuString;
use crate::map::PMapData;
use crate::proto::Closure;
use crate::seq::SeqNode;
use crate::vector::PVec;

pub type StrId = Id<SuString>;
pub type VectorId = Id<PVec>;
pub type MapId = Id<PMapData>;
pub type SeqId = Id<SeqNode>;
pub type LocalId = Id<Value>;
pub type FuncId = Id<Closure>;

/// An opaque handle into a native-data arena slot; GC-traced as a leaf and
/// dropped by ordinary `Drop` on sweep. Grounded in `SU_NATIVEDATA`.
pub type NativeDataId = Id<Box<dyn std::any::Any>>;

/// A handle into a host-owned resource table (e.g. an open file). Not
/// GC-traced: `get_gc_object` returns null for `SU_NATIVEPTR` in the
/// original, meaning these are managed entirely outside the collector.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NativePtrId(pub u32);

/// Signature of a native (host) function, matching `su_nativefunc`: it
/// receives the embedding state and the argument count, and returns how
/// many result values it left on the stack (0 or 1).
pub type NativeFn = fn(&mut dyn NativeHost, i32) -> Result<i32, crate::error::SuError>;

/// The subset of the embedding API a native function body needs. Defined
/// here (rather than depending on `su-runtime`, which depends on `su-core`)
/// so native functions can be declared alongside `Value` without a cyclic
/// crate dependency; `su-runtime::State` implements this trait by
/// delegating to its own inherent methods of the same name.
///
/// This is wider than the bare push/pop/stack_at surface a minimal native
/// callback would need, because the standard library (`su-runtime::stdlib`)
/// registers natives that manipulate vectors, maps, sequences, locals and
/// host I/O resources -- all of which live behind `State`'s heap, not on
/// the raw operand stack.
pub trait NativeHost {
    fn push(&mut self, v: Value);
    fn pop(&mut self) -> Value;
    fn stack_at(&self, rel_index: i32) -> Value;
    fn stack_len(&self) -> usize;

    fn raise(&self, msg: String) -> crate::error::SuError {
        crate::error::SuError::User(msg)
    }

    fn pop_n(&mut self, n: usize) -> crate::error::SuResult<()>;
    fn type_name_at(&self, idx: i32) -> crate::error::SuResult<&'static str>;

    fn push_nil(&mut self) -> crate::error::SuResult<()>;
    fn push_bool(&mut self, b: bool) -> crate::error::SuResult<()>;
    fn to_bool(&self, idx: i32) -> crate::error::SuResult<bool>;
    fn push_number(&mut self, n: f64) -> crate::error::SuResult<()>;
    fn to_number(&self, idx: i32) -> crate::error::SuResult<f64>;
    fn push_string(&mut self, bytes: &[u8]) -> crate::error::SuResult<()>;
    fn to_string_bytes(&self, idx: i32) -> crate::error::SuResult<Vec<u8>>;
    fn push_pointer(&mut self, ptr: NativePtrId) -> crate::error::SuResult<()>;
    fn to_pointer(&self, idx: i32) -> crate::error::SuResult<NativePtrId>;

    fn ref_local(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn unref_local(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn set_local(&mut self, idx: i32) -> crate::error::SuResult<()>;

    fn seq(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn list(&mut self, num: usize) -> crate::error::SuResult<()>;
    fn cons(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn first(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn rest(&mut self, idx: i32) -> crate::error::SuResult<()>;

    fn vector(&mut self, num: usize) -> crate::error::SuResult<()>;
    fn vector_length(&self, idx: i32) -> crate::error::SuResult<usize>;
    fn vector_index(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn vector_set(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn vector_push(&mut self, idx: i32, num: usize) -> crate::error::SuResult<()>;
    fn vector_pop(&mut self, idx: i32, num: i32) -> crate::error::SuResult<()>;

    fn map_new(&mut self, num_items: usize) -> crate::error::SuResult<()>;
    fn map_length(&self, idx: i32) -> crate::error::SuResult<usize>;
    fn map_get(&mut self, idx: i32) -> crate::error::SuResult<bool>;
    fn map_has(&mut self, idx: i32) -> crate::error::SuResult<bool>;
    fn map_insert(&mut self, idx: i32) -> crate::error::SuResult<()>;
    fn map_remove(&mut self, idx: i32) -> crate::error::SuResult<()>;

    /// Returns `None` (rather than an `Err`) on failure to open, matching
    /// the C-errno convention `io-open` is specified with: script code
    /// checks the result and calls `io-error` for the message afterward.
    fn io_open(&mut self, path: &[u8], mode: &[u8]) -> crate::error::SuResult<Option<NativePtrId>>;
    fn io_close(&mut self, ptr: NativePtrId) -> crate::error::SuResult<()>;
    fn io_read_file(&mut self, ptr: NativePtrId) -> crate::error::SuResult<Vec<u8>>;
    fn io_write_file(&mut self, ptr: NativePtrId, data: &[u8]) -> crate::error::SuResult<()>;
    fn io_size(&mut self, ptr: NativePtrId) -> crate::error::SuResult<u64>;
    fn io_take_last_error(&mut self) -> Option<String>;
    fn io_stdin(&self) -> NativePtrId;
    fn io_stdout(&self) -> NativePtrId;
    fn io_stderr(&self) -> NativePtrId;

    /// Installs a rollback checkpoint at the current stack height, the
    /// `Result`-based analogue of `su_seterror(s, jmp, 0)` recording
    /// `errtop`. A native about to perform several fallible pushes of its
    /// own can install one so that an error unwinds back to this point
    /// rather than only to the enclosing `call`'s boundary.
    fn set_error_checkpoint(&mut self);

    /// Clears a previously installed checkpoint, matching
    /// `su_seterror(s, jmp, -1)`'s `errtop = -1`.
    fn clear_error_checkpoint(&mut self);

    fn gc(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(StrId),
    Function(FuncId),
    NativeFunction(NativeFn),
    NativePointer(NativePtrId),
    NativeData(NativeDataId),
    Vector(VectorId),
    Map(MapId),
    Local(LocalId),
    Seq(SeqId),
    /// Sentinel used only inside map lookups; never placed on the operand
    /// stack or hashed.
    Invalid,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::NativeFunction(_) => "native-function",
            Value::NativePointer(_) => "native-pointer",
            Value::NativeData(_) => "native-data",
            Value::Vector(_) => "vector",
            Value::Map(_) => "map",
            Value::Local(_) => "local",
            Value::Seq(_) => "sequence",
            Value::Invalid => "invalid",
        }
    }

    /// `nil` and `false` are the only falsy values; everything else,
    /// including `0.0` and the empty string, is truthy. Grounded in
    /// `core.c`'s `LOG_OP` macro (used by `AND`/`OR`/`TEST`).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Unwraps a `Number`, panicking otherwise. Used by tests and by
    /// interpreter arithmetic ops after a type check has already run.
    pub fn as_num(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            other => panic!("as_num on non-number {:?}", other),
        }
    }

    pub fn is_gc_object(&self) -> bool {
        !matches!(
            self,
            Value::Invalid
                | Value::Nil
                | Value::Bool(_)
                | Value::Number(_)
                | Value::NativeFunction(_)
                | Value::NativePointer(_)
        )
    }
}

/// Hashes a `Value` the way `hash_value()` does: numbers hash the bits of
/// the double, strings use their arena identity (equivalent to their cached
/// content hash here, since interning already guarantees equal strings
/// share one slot -- same string always yields the same hash), everything
/// else hashes its arena identity.
pub fn hash_value(v: &Value) -> u32 {
    match v {
        Value::Number(n) => {
            let bits = n.to_bits();
            crate::intern::murmur2(&bits.to_le_bytes(), 0)
        }
        Value::Str(id) => id.index,
        Value::Nil => 0,
        Value::Bool(b) => *b as u32,
        Value::Function(id) => id.index,
        Value::Vector(id) => id.index,
        Value::Map(id) => id.index,
        Value::Local(id) => id.index,
        Value::Seq(id) => id.index,
        Value::NativeData(id) => id.index,
        Value::NativePointer(id) => id.0,
        Value::NativeFunction(f) => *f as usize as u32,
        Value::Invalid => 0,
    }
}

/// Equality: numbers by IEEE-754 `==`; strings by interned identity (same
/// arena slot); everything else by identity of the payload id.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Vector(x), Value::Vector(y)) => x == y,
        (Value::Map(x), Value::Map(y)) => x == y,
        (Value::Local(x), Value::Local(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) => x == y,
        (Value::NativeData(x), Value::NativeData(y)) => x == y,
        (Value::NativePointer(x), Value::NativePointer(y)) => x == y,
        (Value::NativeFunction(x), Value::NativeFunction(y)) => {
            *x as usize == *y as usize
        }
        (Value::Invalid, Value::Invalid) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_and_or_semantics() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
    }

    #[test]
    fn number_equality_is_ieee() {
        assert!(value_eq(&Value::Number(1.5), &Value::Number(1.5)));
        assert!(!value_eq(&Value::Number(1.5), &Value::Number(1.6)));
    }

    #[test]
    fn non_gc_kinds_are_excluded() {
        assert!(!Value::Nil.is_gc_object());
        assert!(!Value::Bool(true).is_gc_object());
        assert!(!Value::Number(1.0).is_gc_object());
        assert!(!Value::NativePointer(NativePtrId(0)).is_gc_object());
    }
}
