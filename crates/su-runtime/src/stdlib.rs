//! The standard library installed into every embedding: the core globals
//! (`print`, `type?`, `string!`, ...), the sequence/vector/map builders
//! grounded in `libseq.c`, the `math-*` family from `libm.c`, and the
//! `io-*` family from `libio.c`.
//!
//! Each native follows the same contract as the interpreter's own dispatch:
//! it receives the argument count, reads its arguments from the top of the
//! operand stack by negative offset, and returns how many result values it
//! left on top (0 or 1). `State::call_native` truncates the stack back to
//! the callee's slot afterward, so a native only has to get the *last*
//! pushed value right; it does not need to tidy up every scratch push it
//! made along the way.

use rand::Rng;

use su_core::{NativeFn, NativeHost, NativePtrId, SuError, SuResult, Value};

use crate::state::State;

impl State {
    /// Installs every built-in global. Grounded in `su_libinit`'s
    /// registration sequence (`lib.c`, then `libseq`, `libm`, `libio`).
    pub fn lib_init(&mut self) -> SuResult<()> {
        install(self)
    }
}

pub fn install(state: &mut State) -> SuResult<()> {
    register_core(state)?;
    register_seq(state)?;
    register_math(state)?;
    register_io(state)?;
    Ok(())
}

fn register(state: &mut State, name: &[u8], f: NativeFn) -> SuResult<()> {
    state.push_function(f)?;
    state.set_global(true, name)
}

// --- argument checking, grounded in `su_check_arguments` --------------

/// Checks a fixed argument count and, for each `Some(name)` entry, that the
/// argument at that position has the given type name. `None` accepts any
/// type, matching `SU_NIL` used as a wildcard in `su_check_arguments`.
fn expect_exact(host: &dyn NativeHost, narg: i32, types: &[Option<&'static str>]) -> SuResult<()> {
    if narg < 0 || narg as usize != types.len() {
        return Err(SuError::Arity {
            expected: types.len() as i32,
            got: narg.max(0) as usize,
        });
    }
    let n = types.len() as i32;
    for (i, ty) in types.iter().enumerate() {
        if let Some(name) = ty {
            let idx = -(n - i as i32);
            let got = host.type_name_at(idx)?;
            if got != *name {
                return Err(SuError::type_error(name, got));
            }
        }
    }
    Ok(())
}

/// Like `expect_exact` but only requires *at least* `types.len()`
/// arguments, checking the leading (bottom-most) ones -- the shape
/// `vector-push`'s "vector, then one or more items" takes.
fn expect_min(host: &dyn NativeHost, narg: i32, types: &[Option<&'static str>]) -> SuResult<()> {
    if narg < 0 || (narg as usize) < types.len() {
        return Err(SuError::Arity {
            expected: -(types.len() as i32) - 1,
            got: narg.max(0) as usize,
        });
    }
    for (i, ty) in types.iter().enumerate() {
        if let Some(name) = ty {
            let idx = -narg + i as i32;
            let got = host.type_name_at(idx)?;
            if got != *name {
                return Err(SuError::type_error(name, got));
            }
        }
    }
    Ok(())
}

/// Parses a leading floating-point prefix the way `atof` does: whatever
/// valid numeric text appears at the start, otherwise `0.0`.
fn atof_prefix(s: &str) -> f64 {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    let start = i;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let mut seen_digit = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        seen_digit = true;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            seen_digit = true;
        }
    }
    if seen_digit && i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    if !seen_digit {
        return 0.0;
    }
    s[start..i].parse::<f64>().unwrap_or(0.0)
}

fn strip_trailing_nul(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Renders a value the way `print_rec` does: sequences as `(a b c)`,
/// vectors as `[a b c]`, strings raw (without their trailing NUL), maps
/// as the literal `{}` regardless of contents -- a quirk of the original
/// renderer kept as-is since it is not among the documented bug fixes.
pub(crate) fn stringify_value(host: &mut dyn NativeHost, v: Value) -> SuResult<String> {
    match v {
        Value::Nil => Ok("nil".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(format_number(n)),
        Value::Str(_) => {
            host.push(v);
            let bytes = host.to_string_bytes(-1)?;
            host.pop();
            Ok(String::from_utf8_lossy(&strip_trailing_nul(bytes)).into_owned())
        }
        Value::Seq(_) => {
            let mut parts = Vec::new();
            let mut cur = v;
            loop {
                if matches!(cur, Value::Nil) {
                    break;
                }
                host.push(cur);
                host.first(-1)?;
                let first_val = host.pop();
                parts.push(stringify_value(host, first_val)?);
                host.rest(-1)?;
                let rest_val = host.pop();
                host.pop();
                cur = rest_val;
            }
            Ok(format!("({})", parts.join(" ")))
        }
        Value::Vector(_) => {
            host.push(v);
            let len = host.vector_length(-1)?;
            host.pop();
            let mut parts = Vec::with_capacity(len);
            for i in 0..len {
                host.push(v);
                host.push_number(i as f64)?;
                host.vector_index(-2)?;
                let elem = host.pop();
                parts.push(stringify_value(host, elem)?);
            }
            Ok(format!("[{}]", parts.join(" ")))
        }
        Value::Map(_) => Ok("{}".to_string()),
        Value::Function(_) => Ok("<function>".to_string()),
        Value::NativeFunction(_) => Ok("<native-function>".to_string()),
        Value::NativePointer(_) => Ok("<native-pointer>".to_string()),
        Value::NativeData(_) => Ok("<native-data>".to_string()),
        Value::Local(_) => Ok("<local>".to_string()),
        Value::Invalid => unreachable!("Invalid is never observable from script code"),
    }
}

// --- core globals, grounded in lib.c ------------------------------------

fn print(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    let mut out = Vec::new();
    for i in (1..=narg).rev() {
        let v = host.stack_at(-i);
        out.extend_from_slice(stringify_value(host, v)?.as_bytes());
        out.push(b'\t');
    }
    out.push(b'\n');
    let ptr = host.io_stdout();
    host.io_write_file(ptr, &out)?;
    Ok(0)
}

fn type_query(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[None])?;
    let name = host.type_name_at(-1)?;
    host.push_string(name.as_bytes())?;
    Ok(1)
}

fn string_bang(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[None])?;
    let v = host.stack_at(-1);
    let s = stringify_value(host, v)?;
    host.push_string(s.as_bytes())?;
    Ok(1)
}

fn number_bang(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("string")])?;
    let bytes = host.to_string_bytes(-1)?;
    let text = String::from_utf8_lossy(&strip_trailing_nul(bytes)).into_owned();
    host.push_number(atof_prefix(&text))?;
    Ok(1)
}

fn ref_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[None])?;
    host.ref_local(-1)?;
    Ok(1)
}

fn unref_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("local")])?;
    host.unref_local(-1)?;
    Ok(1)
}

fn set_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("local"), None])?;
    host.set_local(-2)?;
    Ok(1)
}

fn register_core(state: &mut State) -> SuResult<()> {
    register(state, b"print", print)?;
    register(state, b"type?", type_query)?;
    register(state, b"string!", string_bang)?;
    register(state, b"number!", number_bang)?;
    register(state, b"ref", ref_fn)?;
    register(state, b"unref", unref_fn)?;
    register(state, b"set", set_fn)?;
    Ok(())
}

// --- sequence / vector / map globals, grounded in libseq.c --------------

fn seq_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[None])?;
    host.seq(-1)?;
    Ok(1)
}

fn list_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    if narg <= 0 {
        return Ok(0);
    }
    host.list(narg as usize)?;
    Ok(1)
}

fn cons_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[None, None])?;
    host.cons(-2)?;
    Ok(1)
}

fn first_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("sequence")])?;
    host.first(-1)?;
    Ok(1)
}

fn rest_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("sequence")])?;
    host.rest(-1)?;
    Ok(1)
}

fn vector_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    host.vector(narg.max(0) as usize)?;
    Ok(1)
}

fn vector_length_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("vector")])?;
    let len = host.vector_length(-1)?;
    host.push_number(len as f64)?;
    Ok(1)
}

fn vector_index_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("vector"), Some("number")])?;
    host.vector_index(-2)?;
    Ok(1)
}

fn vector_set_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("vector"), Some("number"), None])?;
    host.vector_set(-3)?;
    Ok(1)
}

fn vector_push_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_min(host, narg, &[Some("vector")])?;
    host.vector_push(-narg, (narg - 1) as usize)?;
    Ok(1)
}

fn vector_pop_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("vector"), Some("number")])?;
    host.vector_pop(-2, -1)?;
    Ok(1)
}

fn map_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    host.map_new(narg.max(0) as usize)?;
    Ok(1)
}

fn map_length_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map")])?;
    let len = host.map_length(-1)?;
    host.push_number(len as f64)?;
    Ok(1)
}

fn map_get_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map"), None])?;
    let found = host.map_get(-2)?;
    Ok(if found { 1 } else { 0 })
}

fn map_has_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map"), None])?;
    let found = host.map_has(-2)?;
    host.push_bool(found)?;
    Ok(1)
}

/// Upsert: always replaces the key's value, matching the original
/// `map-set` global (it calls the same `su_map_insert` as `map-insert`,
/// just without the duplicate check that makes `map-insert` strict).
fn map_set_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map"), None, None])?;
    host.map_insert(-3)?;
    Ok(1)
}

/// Strict insert: errors if the key already exists. The original's
/// `su_map_has` always reads the key to look up from `STK(-1)` regardless
/// of the `idx` it's passed (only `idx` itself -- the map operand -- is
/// honored); called as `su_map_has(s, -3)` from a 3-argument
/// `[map, key, value]` layout, that means it checks whether *value*, not
/// *key*, already exists as a key. This builds a fresh `[map, key]` pair
/// so the check actually tests the key before delegating to the same
/// insert.
fn map_insert_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map"), None, None])?;
    let map_v = host.stack_at(-3);
    let key_v = host.stack_at(-2);
    host.push(map_v);
    host.push(key_v);
    let has = host.map_has(-2)?;
    host.pop_n(2)?;
    if has {
        return Err(host.raise("duplicated key in map".to_string()));
    }
    host.map_insert(-3)?;
    Ok(1)
}

fn map_remove_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("map"), None])?;
    let has = host.map_has(-2)?;
    if !has {
        return Err(host.raise("key does not exist in map".to_string()));
    }
    host.map_remove(-2)?;
    Ok(1)
}

fn register_seq(state: &mut State) -> SuResult<()> {
    register(state, b"seq", seq_fn)?;
    register(state, b"list", list_fn)?;
    register(state, b"cons", cons_fn)?;
    register(state, b"first", first_fn)?;
    register(state, b"rest", rest_fn)?;
    register(state, b"vector", vector_fn)?;
    register(state, b"vector-length", vector_length_fn)?;
    register(state, b"vector-index", vector_index_fn)?;
    register(state, b"vector-set", vector_set_fn)?;
    register(state, b"vector-push", vector_push_fn)?;
    register(state, b"vector-pop", vector_pop_fn)?;
    register(state, b"map", map_fn)?;
    register(state, b"map-length", map_length_fn)?;
    register(state, b"map-get", map_get_fn)?;
    register(state, b"map-has", map_has_fn)?;
    register(state, b"map-set", map_set_fn)?;
    register(state, b"map-insert", map_insert_fn)?;
    register(state, b"map-remove", map_remove_fn)?;
    Ok(())
}

// --- math globals, grounded in libm.c -----------------------------------

macro_rules! unary_math {
    ($fn_name:ident, $op:ident) => {
        fn $fn_name(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
            expect_exact(host, narg, &[Some("number")])?;
            let x = host.to_number(-1)?;
            host.push_number(x.$op())?;
            Ok(1)
        }
    };
}

macro_rules! binary_math {
    ($fn_name:ident, $op:ident) => {
        fn $fn_name(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
            expect_exact(host, narg, &[Some("number"), Some("number")])?;
            let a = host.to_number(-2)?;
            let b = host.to_number(-1)?;
            host.push_number(a.$op(b))?;
            Ok(1)
        }
    };
}

unary_math!(math_cos, cos);
unary_math!(math_sin, sin);
unary_math!(math_tan, tan);
unary_math!(math_acos, acos);
unary_math!(math_asin, asin);
unary_math!(math_atan, atan);
unary_math!(math_sqrt, sqrt);
unary_math!(math_exp, exp);
unary_math!(math_ceil, ceil);
unary_math!(math_floor, floor);
unary_math!(math_abs, abs);

/// `atan2` and the `pow` alias (the distilled opcode `POW` already covers
/// `^`; this gives script code a `math-pow` global for symmetry with the
/// rest of the `math-*` family, the way `atan2` already has one).
binary_math!(math_atan2, atan2);
binary_math!(math_pow, powf);

fn math_log(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("number")])?;
    let x = host.to_number(-1)?;
    host.push_number(x.ln())?;
    Ok(1)
}

/// Folds over all arguments, seeded from the *first* argument rather than
/// `0.0` -- the original seeds the accumulator at `0.0`, which silently
/// drags the result toward zero whenever every argument is negative. This
/// fixes that by folding from the first argument instead.
fn math_max(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    if narg < 1 {
        return Err(SuError::Arity {
            expected: -2,
            got: narg.max(0) as usize,
        });
    }
    let mut m = host.to_number(-narg)?;
    for i in 1..narg {
        let v = host.to_number(-(narg - i))?;
        if v > m {
            m = v;
        }
    }
    host.push_number(m)?;
    Ok(1)
}

fn math_min(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    if narg < 1 {
        return Err(SuError::Arity {
            expected: -2,
            got: narg.max(0) as usize,
        });
    }
    let mut m = host.to_number(-narg)?;
    for i in 1..narg {
        let v = host.to_number(-(narg - i))?;
        if v < m {
            m = v;
        }
    }
    host.push_number(m)?;
    Ok(1)
}

fn math_clamp(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("number"), Some("number"), Some("number")])?;
    let v = host.to_number(-3)?;
    let lo = host.to_number(-2)?;
    let hi = host.to_number(-1)?;
    host.push_number(v.max(lo).min(hi))?;
    Ok(1)
}

/// Returns a number drawn from `[0, 1)`. The original discards its own
/// pushed value by returning `0` (meaning "no result") instead of `1`;
/// this fixes that so the caller actually observes the random draw.
fn math_random(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[])?;
    let n: f64 = rand::thread_rng().gen();
    host.push_number(n)?;
    Ok(1)
}

fn register_math(state: &mut State) -> SuResult<()> {
    register(state, b"math-cos", math_cos)?;
    register(state, b"math-sin", math_sin)?;
    register(state, b"math-tan", math_tan)?;
    register(state, b"math-acos", math_acos)?;
    register(state, b"math-asin", math_asin)?;
    register(state, b"math-atan", math_atan)?;
    register(state, b"math-atan2", math_atan2)?;
    register(state, b"math-pow", math_pow)?;
    register(state, b"math-sqrt", math_sqrt)?;
    register(state, b"math-exp", math_exp)?;
    register(state, b"math-log", math_log)?;
    register(state, b"math-ceil", math_ceil)?;
    register(state, b"math-floor", math_floor)?;
    register(state, b"math-abs", math_abs)?;
    register(state, b"math-max", math_max)?;
    register(state, b"math-min", math_min)?;
    register(state, b"math-random", math_random)?;
    register(state, b"math-clamp", math_clamp)?;

    state.push_number(std::f64::consts::PI)?;
    state.set_global(true, b"math-pi")?;
    state.push_number(f64::MAX)?;
    state.set_global(true, b"math-big")?;
    state.push_number(f64::MIN_POSITIVE)?;
    state.set_global(true, b"math-small")?;
    Ok(())
}

// --- io globals, grounded in libio.c ------------------------------------

fn io_open_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("string"), Some("string")])?;
    let mode = strip_trailing_nul(host.to_string_bytes(-1)?);
    let path = strip_trailing_nul(host.to_string_bytes(-2)?);
    match host.io_open(&path, &mode)? {
        Some(ptr) => {
            host.push_pointer(ptr)?;
        }
        None => {
            host.push_nil()?;
        }
    }
    Ok(1)
}

fn io_close_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("native-pointer")])?;
    let ptr = host.to_pointer(-1)?;
    host.io_close(ptr)?;
    Ok(0)
}

/// Reads the whole remaining contents of an already-open handle. The
/// original's `io-read-file` takes a `NATIVEPTR` argument but then calls
/// `fopen` on it as if it were a path string -- a copy-paste bug. This
/// reads through the handle it was actually given instead.
fn io_read_file_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("native-pointer")])?;
    let ptr = host.to_pointer(-1)?;
    let bytes = host.io_read_file(ptr)?;
    host.push_string(&bytes)?;
    Ok(1)
}

/// Writes to an already-open handle (unlike the original's `io-write-file`,
/// which reopens a path by name on every call -- inconsistent with
/// `io-read-file`'s handle-based sibling). Unified here on the handle
/// returned by `io-open`, the way `io-close`/`io-size` already work.
fn io_write_file_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("native-pointer"), Some("string")])?;
    let ptr = host.to_pointer(-2)?;
    let data = strip_trailing_nul(host.to_string_bytes(-1)?);
    host.io_write_file(ptr, &data)?;
    host.push_number(data.len() as f64)?;
    Ok(1)
}

fn io_size_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("native-pointer")])?;
    let ptr = host.to_pointer(-1)?;
    let size = host.io_size(ptr)?;
    host.push_number(size as f64)?;
    Ok(1)
}

fn io_error_fn(host: &mut dyn NativeHost, narg: i32) -> SuResult<i32> {
    expect_exact(host, narg, &[Some("native-pointer")])?;
    match host.io_take_last_error() {
        Some(msg) => {
            host.push_string(msg.as_bytes())?;
            Ok(1)
        }
        None => Ok(0),
    }
}

fn register_io(state: &mut State) -> SuResult<()> {
    register(state, b"io-open", io_open_fn)?;
    register(state, b"io-close", io_close_fn)?;
    register(state, b"io-read-file", io_read_file_fn)?;
    register(state, b"io-write-file", io_write_file_fn)?;
    register(state, b"io-size", io_size_fn)?;
    register(state, b"io-error", io_error_fn)?;

    let stdin = state.io_stdin();
    state.push_pointer(stdin)?;
    state.set_global(true, b"io-stdin")?;
    let stdout = state.io_stdout();
    state.push_pointer(stdout)?;
    state.set_global(true, b"io-stdout")?;
    let stderr = state.io_stderr();
    state.push_pointer(stderr)?;
    state.set_global(true, b"io-stderr")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_every_global_without_conflict() {
        let mut s = State::new();
        s.lib_init().unwrap();
        assert!(s.get_global(b"print").unwrap());
        s.pop_n(1).unwrap();
        assert!(s.get_global(b"map-insert").unwrap());
        s.pop_n(1).unwrap();
        assert!(s.get_global(b"math-pi").unwrap());
        s.pop_n(1).unwrap();
        assert!(s.get_global(b"io-stdout").unwrap());
        s.pop_n(1).unwrap();
    }

    #[test]
    fn type_query_reports_type_name() {
        let mut s = State::new();
        s.push_number(3.0).unwrap();
        let n = type_query(&mut s, 1).unwrap();
        assert_eq!(n, 1);
        assert_eq!(s.to_string_bytes(-1).unwrap(), b"number\0".to_vec());
    }

    #[test]
    fn string_bang_renders_vector_and_sequence() {
        let mut s = State::new();
        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        s.push_number(3.0).unwrap();
        s.vector(3).unwrap();
        assert_eq!(string_bang(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_string_bytes(-1).unwrap(), b"[1 2 3]\0".to_vec());
        s.pop_n(1).unwrap();

        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        s.list(2).unwrap();
        assert_eq!(string_bang(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_string_bytes(-1).unwrap(), b"(1 2)\0".to_vec());
    }

    #[test]
    fn number_bang_parses_leading_prefix() {
        let mut s = State::new();
        s.push_string(b"3.5abc").unwrap();
        assert_eq!(number_bang(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 3.5);
    }

    #[test]
    fn vector_natives_round_trip() {
        let mut s = State::new();
        s.push_number(10.0).unwrap();
        s.push_number(20.0).unwrap();
        vector_fn(&mut s, 2).unwrap();
        s.push_number(0.0).unwrap();
        assert_eq!(vector_index_fn(&mut s, 2).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 10.0);
        s.pop_n(1).unwrap();

        s.push_number(30.0).unwrap();
        assert_eq!(vector_push_fn(&mut s, 2).unwrap(), 1);
        assert_eq!(vector_length_fn(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 3.0);
    }

    #[test]
    fn map_insert_rejects_duplicate_key_and_set_upserts() {
        let mut s = State::new();
        map_fn(&mut s, 0).unwrap();
        s.push_string(b"a").unwrap();
        s.push_number(1.0).unwrap();
        assert_eq!(map_insert_fn(&mut s, 3).unwrap(), 1);

        s.push_string(b"a").unwrap();
        s.push_number(2.0).unwrap();
        assert!(map_insert_fn(&mut s, 3).is_err());
        s.pop_n(2).unwrap();

        s.push_string(b"a").unwrap();
        s.push_number(2.0).unwrap();
        assert_eq!(map_set_fn(&mut s, 3).unwrap(), 1);
        s.push_string(b"a").unwrap();
        assert_eq!(map_get_fn(&mut s, 2).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 2.0);
    }

    #[test]
    fn map_remove_errors_on_missing_key() {
        let mut s = State::new();
        map_fn(&mut s, 0).unwrap();
        s.push_string(b"missing").unwrap();
        assert!(map_remove_fn(&mut s, 2).is_err());
    }

    #[test]
    fn seq_natives_walk_cons_cells() {
        let mut s = State::new();
        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        cons_fn(&mut s, 2).unwrap();
        assert_eq!(first_fn(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 1.0);
    }

    #[test]
    fn math_max_min_seed_from_first_argument() {
        let mut s = State::new();
        s.push_number(-5.0).unwrap();
        s.push_number(-1.0).unwrap();
        s.push_number(-9.0).unwrap();
        assert_eq!(math_max(&mut s, 3).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), -1.0);

        s.push_number(-5.0).unwrap();
        s.push_number(-1.0).unwrap();
        s.push_number(-9.0).unwrap();
        assert_eq!(math_min(&mut s, 3).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), -9.0);
    }

    #[test]
    fn math_random_pushes_a_usable_number() {
        let mut s = State::new();
        assert_eq!(math_random(&mut s, 0).unwrap(), 1);
        let n = s.to_number(-1).unwrap();
        assert!((0.0..1.0).contains(&n));
    }

    #[test]
    fn io_open_missing_file_yields_nil_and_error_message() {
        let mut s = State::new();
        s.push_string(b"/no/such/file-su-test").unwrap();
        s.push_string(b"r").unwrap();
        assert_eq!(io_open_fn(&mut s, 2).unwrap(), 1);
        assert_eq!(s.type_name(-1).unwrap(), "nil");
    }

    #[test]
    fn io_round_trips_through_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdlib-io-test.txt");
        let path_str = path.to_str().unwrap();

        let mut s = State::new();
        s.push_string(path_str.as_bytes()).unwrap();
        s.push_string(b"w").unwrap();
        io_open_fn(&mut s, 2).unwrap();
        let ptr = s.to_pointer(-1).unwrap();
        s.pop_n(1).unwrap();

        s.push_pointer(ptr).unwrap();
        s.push_string(b"hello").unwrap();
        assert_eq!(io_write_file_fn(&mut s, 2).unwrap(), 1);
        assert_eq!(s.to_number(-1).unwrap(), 5.0);
        s.pop_n(1).unwrap();

        s.push_pointer(ptr).unwrap();
        io_close_fn(&mut s, 1).unwrap();

        s.push_string(path_str.as_bytes()).unwrap();
        s.push_string(b"r").unwrap();
        io_open_fn(&mut s, 2).unwrap();
        let read_ptr = s.to_pointer(-1).unwrap();
        s.pop_n(1).unwrap();

        s.push_pointer(read_ptr).unwrap();
        assert_eq!(io_read_file_fn(&mut s, 1).unwrap(), 1);
        assert_eq!(s.to_string_bytes(-1).unwrap(), b"hello\0".to_vec());
    }
}
