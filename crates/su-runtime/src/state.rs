//! The embedding state: operand stack, call frames, heap and the public
//! embedding API, grounded in `saurus.h`'s `su_state`/`su_*` functions.

use std::io::{Read, Write};

use su_core::{
    map, seq, vector, Closure, Constant, FuncId, Heap, MapId, NativeFn, NativeHost, NativePtrId,
    ProtoId, ResolvedConstant, SeqCtx, SuError, SuResult, UpvalDesc, Value,
};

/// Matches `intern.h`'s `STACK_SIZE`/`MAX_CALLS`.
pub const DEFAULT_STACK_SIZE: usize = 512;
pub const DEFAULT_MAX_CALLS: usize = 128;

/// Reserved `NativePtrId` slots for the three standard streams, matching
/// `su_stdin`/`su_stdout`/`su_stderr`'s fixed handles.
const STDIN_PTR: NativePtrId = NativePtrId(0);
const STDOUT_PTR: NativePtrId = NativePtrId(1);
const STDERR_PTR: NativePtrId = NativePtrId(2);

/// A host-owned I/O resource reachable from script code by `NativePtrId`,
/// outside GC tracing (`NativePointer`'s `get_gc_object` returns null in
/// the original -- these are managed by the embedding state directly, not
/// the collector). Grounded in `io.c`'s `su_file` handle table.
enum ResourceEntry {
    Stdin,
    Stdout,
    Stderr,
    File(std::fs::File),
    /// A slot whose file has already been closed; keeps indices stable
    /// for any `NativePtrId` a script may still be holding.
    Closed,
}

/// One activation record, mirroring `struct frame`.
#[derive(Copy, Clone)]
pub struct Frame {
    /// Instruction to resume at in the caller; `None` for the outermost
    /// frame pushed by `call` from native code (matches the `0xffff`
    /// sentinel `su_call` uses for `ret_addr`).
    pub return_pc: Option<i32>,
    pub closure: FuncId,
    pub stack_base: usize,
}

pub struct State {
    pub heap: Heap,
    pub globals: MapId,
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub narg: i32,
    pub pc: i32,
    pub current_closure: Option<FuncId>,
    pub max_stack: usize,
    pub max_calls: usize,
    pub stdout: Box<dyn Write>,
    pub stdin: Box<dyn Read>,
    resources: Vec<ResourceEntry>,
    last_io_error: Option<String>,
    error_checkpoint: Option<usize>,
}

impl State {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let globals = {
            let mut a = heap.map_arenas();
            map::create_empty(&mut a)
        };
        State {
            heap,
            globals,
            stack: Vec::with_capacity(DEFAULT_STACK_SIZE),
            frames: Vec::with_capacity(DEFAULT_MAX_CALLS),
            narg: 0,
            pc: -1,
            current_closure: None,
            max_stack: DEFAULT_STACK_SIZE,
            max_calls: DEFAULT_MAX_CALLS,
            stdout: Box::new(std::io::stdout()),
            stdin: Box::new(std::io::stdin()),
            resources: vec![
                ResourceEntry::Stdin,
                ResourceEntry::Stdout,
                ResourceEntry::Stderr,
            ],
            last_io_error: None,
            error_checkpoint: None,
        }
    }

    pub fn with_limits(max_stack: usize, max_calls: usize) -> Self {
        let mut s = Self::new();
        s.max_stack = max_stack;
        s.max_calls = max_calls;
        s
    }

    fn abs_index(&self, idx: i32) -> SuResult<usize> {
        let abs = self.stack.len() as i64 + idx as i64;
        if abs < 0 || abs >= self.stack.len() as i64 {
            return Err(SuError::IndexOutOfBounds {
                index: idx as i64,
                len: self.stack.len(),
            });
        }
        Ok(abs as usize)
    }

    pub fn get(&self, idx: i32) -> SuResult<Value> {
        Ok(self.stack[self.abs_index(idx)?])
    }

    pub fn push(&mut self, v: Value) -> SuResult<()> {
        if self.stack.len() >= self.max_stack {
            return Err(SuError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    pub fn pop_n(&mut self, n: usize) -> SuResult<()> {
        if n > self.stack.len() {
            return Err(SuError::IndexOutOfBounds {
                index: -(n as i64),
                len: self.stack.len(),
            });
        }
        self.stack.truncate(self.stack.len() - n);
        Ok(())
    }

    /// Installs a rollback checkpoint at the current stack height, matching
    /// `su_seterror(s, jmp, 0)`'s "record `stack_top`" branch.
    pub fn set_error_checkpoint(&mut self) {
        self.error_checkpoint = Some(self.stack.len());
    }

    /// Clears a previously installed checkpoint, matching
    /// `su_seterror(s, jmp, -1)`.
    pub fn clear_error_checkpoint(&mut self) {
        self.error_checkpoint = None;
    }

    /// Consumes the installed checkpoint, if any, for `call`'s error path.
    pub(crate) fn take_error_checkpoint(&mut self) -> Option<usize> {
        self.error_checkpoint.take()
    }

    pub fn copy(&mut self, idx: i32) -> SuResult<()> {
        let v = self.get(idx)?;
        self.push(v)
    }

    pub fn copy_range(&mut self, idx: i32, num: usize) -> SuResult<()> {
        let start = self.abs_index(idx)?;
        for i in 0..num {
            let v = self.stack[start + i];
            self.push(v)?;
        }
        Ok(())
    }

    pub fn type_name(&self, idx: i32) -> SuResult<&'static str> {
        Ok(self.get(idx)?.type_name())
    }

    pub fn check_type(&self, idx: i32, expected: &'static str) -> SuResult<Value> {
        let v = self.get(idx)?;
        if v.type_name() != expected {
            return Err(SuError::type_error(expected, v.type_name()));
        }
        Ok(v)
    }

    /// Debug-renders the value at `idx`, matching `su_stringify`: sequences
    /// as `(a b c)`, vectors as `[a b c]`, everything else its literal form.
    pub fn stringify(&mut self, idx: i32) -> SuResult<Vec<u8>> {
        let v = self.get(idx)?;
        let s = crate::stdlib::stringify_value(self, v)?;
        Ok(s.into_bytes())
    }

    // --- push/to primitives, grounded in su_push*/su_to* ---

    pub fn push_nil(&mut self) -> SuResult<()> {
        self.push(Value::Nil)
    }

    pub fn push_bool(&mut self, b: bool) -> SuResult<()> {
        self.push(Value::Bool(b))
    }

    pub fn to_bool(&self, idx: i32) -> SuResult<bool> {
        Ok(self.get(idx)?.is_truthy())
    }

    pub fn push_number(&mut self, n: f64) -> SuResult<()> {
        self.push(Value::Number(n))
    }

    pub fn to_number(&self, idx: i32) -> SuResult<f64> {
        Ok(self.check_type(idx, "number")?.as_num())
    }

    pub fn push_integer(&mut self, i: i64) -> SuResult<()> {
        self.push_number(i as f64)
    }

    pub fn to_integer(&self, idx: i32) -> SuResult<i64> {
        Ok(self.to_number(idx)? as i64)
    }

    pub fn push_string(&mut self, bytes: &[u8]) -> SuResult<()> {
        let id = self.heap.string_table.intern(&mut self.heap.strings, bytes);
        self.push(Value::Str(id))
    }

    /// String length includes a trailing NUL, matching `read_string`'s
    /// encoded size (preserved; see the design notes).
    pub fn to_string_bytes(&self, idx: i32) -> SuResult<Vec<u8>> {
        let v = self.check_type(idx, "string")?;
        let id = match v {
            Value::Str(id) => id,
            _ => unreachable!(),
        };
        let s = self.heap.strings.get(id).expect("dangling string id");
        let mut out = s.bytes.clone();
        out.push(0);
        Ok(out)
    }

    pub fn push_pointer(&mut self, ptr: NativePtrId) -> SuResult<()> {
        self.push(Value::NativePointer(ptr))
    }

    pub fn to_pointer(&self, idx: i32) -> SuResult<NativePtrId> {
        match self.check_type(idx, "native-pointer")? {
            Value::NativePointer(p) => Ok(p),
            _ => unreachable!(),
        }
    }

    pub fn push_function(&mut self, f: NativeFn) -> SuResult<()> {
        self.push(Value::NativeFunction(f))
    }

    pub fn to_function(&self, idx: i32) -> SuResult<NativeFn> {
        match self.check_type(idx, "native-function")? {
            Value::NativeFunction(f) => Ok(f),
            _ => unreachable!(),
        }
    }

    // --- local cells, grounded in ref.c ---

    pub fn ref_local(&mut self, idx: i32) -> SuResult<()> {
        let v = self.get(idx)?;
        let id = self.heap.locals.insert(v);
        self.push(Value::Local(id))
    }

    pub fn unref_local(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "local")? {
            Value::Local(id) => id,
            _ => unreachable!(),
        };
        let v = *self.heap.locals.get(id).expect("dangling local id");
        self.push(v)
    }

    pub fn set_local(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "local")? {
            Value::Local(id) => id,
            _ => unreachable!(),
        };
        let v = self.get(-1)?;
        *self.heap.locals.get_mut(id).expect("dangling local id") = v;
        self.pop_n(1)
    }

    // --- sequences, grounded in seq.c's outer API ---

    fn seq_ctx(&mut self) -> SeqCtx<'_> {
        SeqCtx {
            seqs: &mut self.heap.seqs,
            vectors: &mut self.heap.vectors,
            vec_nodes: &mut self.heap.vec_nodes,
            strings: &mut self.heap.strings,
            string_table: &mut self.heap.string_table,
        }
    }

    /// Converts the value at `idx` into a sequence view: a vector or string
    /// becomes an iterator, anything else is wrapped as a one-element list.
    pub fn seq(&mut self, idx: i32) -> SuResult<()> {
        let v = self.get(idx)?;
        let result = match v {
            Value::Vector(id) => seq::from_vector(&mut self.heap.seqs, &self.heap.vectors, id),
            Value::Str(id) => seq::from_string(&mut self.heap.seqs, &self.heap.strings, id),
            Value::Nil => Value::Nil,
            other => Value::Seq(seq::cons(&mut self.heap.seqs, other, Value::Nil)),
        };
        self.push(result)
    }

    pub fn list(&mut self, num: usize) -> SuResult<()> {
        let start = self.stack.len() - num;
        let items: Vec<Value> = self.stack[start..].to_vec();
        self.pop_n(num)?;
        let result = seq::from_array(&mut self.heap.seqs, &items);
        self.push(result)
    }

    pub fn cons(&mut self, idx: i32) -> SuResult<()> {
        let first = self.get(idx)?;
        let rest = self.get(-1)?;
        let id = seq::cons(&mut self.heap.seqs, first, rest);
        self.pop_n(2)?;
        self.push(Value::Seq(id))
    }

    pub fn first(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "sequence")? {
            Value::Seq(id) => id,
            _ => unreachable!(),
        };
        let mut ctx = self.seq_ctx();
        let v = seq::first(&mut ctx, id)?;
        self.push(v)
    }

    pub fn rest(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "sequence")? {
            Value::Seq(id) => id,
            _ => unreachable!(),
        };
        let mut ctx = self.seq_ctx();
        let v = seq::rest(&mut ctx, id)?;
        self.push(v)
    }

    // --- vectors ---

    fn vec_arenas(&mut self) -> su_core::VecArenas<'_> {
        self.heap.vec_arenas()
    }

    pub fn vector(&mut self, num: usize) -> SuResult<()> {
        let start = self.stack.len() - num;
        let items: Vec<Value> = self.stack[start..].to_vec();
        self.pop_n(num)?;
        let mut a = self.vec_arenas();
        let mut v = vector::create_empty(&mut a);
        for item in items {
            v = vector::push(&mut a, v, item);
        }
        self.push(Value::Vector(v))
    }

    pub fn vector_length(&self, idx: i32) -> SuResult<usize> {
        match self.check_type(idx, "vector")? {
            Value::Vector(id) => Ok(vector::length(&self.heap.vectors, id)),
            _ => unreachable!(),
        }
    }

    pub fn vector_index(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "vector")? {
            Value::Vector(id) => id,
            _ => unreachable!(),
        };
        let i = self.to_integer(-1)? as usize;
        self.pop_n(2)?;
        let a = self.vec_arenas();
        let v = vector::index(&a, id, i)?;
        self.push(v)
    }

    pub fn vector_set(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "vector")? {
            Value::Vector(id) => id,
            _ => unreachable!(),
        };
        let i = self.to_integer(-2)? as usize;
        let val = self.get(-1)?;
        self.pop_n(3)?;
        let mut a = self.vec_arenas();
        let new_v = vector::set(&mut a, id, i, val)?;
        self.push(Value::Vector(new_v))
    }

    pub fn vector_push(&mut self, idx: i32, num: usize) -> SuResult<()> {
        let id = match self.check_type(idx, "vector")? {
            Value::Vector(id) => id,
            _ => unreachable!(),
        };
        let start = self.stack.len() - num;
        let items: Vec<Value> = self.stack[start..].to_vec();
        self.pop_n(num + 1)?;
        let mut a = self.vec_arenas();
        let mut v = id;
        for item in items {
            v = vector::push(&mut a, v, item);
        }
        self.push(Value::Vector(v))
    }

    pub fn vector_pop(&mut self, idx: i32, num: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "vector")? {
            Value::Vector(id) => id,
            _ => unreachable!(),
        };
        let n = self.to_integer(num)? as usize;
        self.pop_n(2)?;
        let mut a = self.vec_arenas();
        let mut v = id;
        for _ in 0..n.max(1) {
            v = vector::pop(&mut a, v)?;
        }
        self.push(Value::Vector(v))
    }

    // --- maps ---

    fn map_arenas(&mut self) -> su_core::MapArenas<'_> {
        self.heap.map_arenas()
    }

    /// `num_items` is the total count of key/value stack entries (always
    /// even), matching `su_map`'s `narg` convention.
    pub fn map_new(&mut self, num_items: usize) -> SuResult<()> {
        let start = self.stack.len() - num_items;
        let pairs: Vec<(Value, Value)> = self.stack[start..]
            .chunks(2)
            .map(|c| (c[0], c[1]))
            .collect();
        self.pop_n(num_items)?;
        let mut a = self.map_arenas();
        let mut m = map::create_empty(&mut a);
        for (k, v) in pairs {
            let hash = map::hash_of(&k);
            m = map::insert(&mut a, m, hash, k, v);
        }
        self.push(Value::Map(m))
    }

    pub fn map_length(&self, idx: i32) -> SuResult<usize> {
        match self.check_type(idx, "map")? {
            Value::Map(id) => Ok(map::length(&self.heap.maps, id)),
            _ => unreachable!(),
        }
    }

    /// Returns `true` iff a value was found and pushed, matching
    /// `su_map_get`'s boolean/int success return.
    pub fn map_get(&mut self, idx: i32) -> SuResult<bool> {
        let id = match self.check_type(idx, "map")? {
            Value::Map(id) => id,
            _ => unreachable!(),
        };
        let key = self.get(-1)?;
        self.pop_n(2)?;
        let a = self.map_arenas();
        let hash = map::hash_of(&key);
        let found = map::find(&a, id, hash, &key);
        if matches!(found, Value::Invalid) {
            Ok(false)
        } else {
            self.push(found)?;
            Ok(true)
        }
    }

    pub fn map_has(&mut self, idx: i32) -> SuResult<bool> {
        let id = match self.check_type(idx, "map")? {
            Value::Map(id) => id,
            _ => unreachable!(),
        };
        let key = self.get(-1)?;
        let a = self.map_arenas();
        let hash = map::hash_of(&key);
        Ok(map::has(&a, id, hash, &key))
    }

    pub fn map_insert(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "map")? {
            Value::Map(id) => id,
            _ => unreachable!(),
        };
        let key = self.get(-2)?;
        let val = self.get(-1)?;
        self.pop_n(3)?;
        let mut a = self.map_arenas();
        let hash = map::hash_of(&key);
        let new_m = map::insert(&mut a, id, hash, key, val);
        self.push(Value::Map(new_m))
    }

    pub fn map_remove(&mut self, idx: i32) -> SuResult<()> {
        let id = match self.check_type(idx, "map")? {
            Value::Map(id) => id,
            _ => unreachable!(),
        };
        let key = self.get(-1)?;
        self.pop_n(2)?;
        let mut a = self.map_arenas();
        let hash = map::hash_of(&key);
        let new_m = map::remove(&mut a, id, hash, &key);
        self.push(Value::Map(new_m))
    }

    // --- globals ---

    pub fn get_global(&mut self, name: &[u8]) -> SuResult<bool> {
        let key_id = self.heap.string_table.intern(&mut self.heap.strings, name);
        let key = Value::Str(key_id);
        let a = self.heap.map_arenas();
        let hash = map::hash_of(&key);
        let found = map::find(&a, self.globals, hash, &key);
        if matches!(found, Value::Invalid) {
            Ok(false)
        } else {
            self.push(found)?;
            Ok(true)
        }
    }

    /// `replace = false` rejects redefining an existing global, matching
    /// `OP_SETGLOBAL`'s `global_error` on a second `su_setglobal`.
    pub fn set_global(&mut self, replace: bool, name: &[u8]) -> SuResult<()> {
        let key_id = self.heap.string_table.intern(&mut self.heap.strings, name);
        let key = Value::Str(key_id);
        let hash = map::hash_of(&key);
        if !replace {
            let a = self.heap.map_arenas();
            if map::has(&a, self.globals, hash, &key) {
                return Err(SuError::DuplicateGlobal(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
        }
        let val = self.get(-1)?;
        let mut a = self.heap.map_arenas();
        self.globals = map::insert(&mut a, self.globals, hash, key, val);
        self.pop_n(1)
    }

    pub fn set_global_value(&mut self, key_id: su_core::StrId, val: Value) {
        let key = Value::Str(key_id);
        let hash = map::hash_of(&key);
        let mut a = self.heap.map_arenas();
        self.globals = map::insert(&mut a, self.globals, hash, key, val);
    }

    // --- host I/O resources, grounded in io.c's su_file handle table ---

    /// Opens a file and returns its handle, or `None` on failure (the
    /// message is retrievable via `io_error`). Modeled on C's `fopen`
    /// errno-style contract rather than a hard VM error, since a missing
    /// file is routine and script code is expected to check afterward.
    pub fn io_open(&mut self, path: &[u8], mode: &[u8]) -> SuResult<Option<NativePtrId>> {
        let path = String::from_utf8_lossy(path).into_owned();
        let mode = String::from_utf8_lossy(mode).into_owned();
        let mut opts = std::fs::OpenOptions::new();
        match mode.as_str() {
            "r" => {
                opts.read(true);
            }
            "w" => {
                opts.write(true).create(true).truncate(true);
            }
            "a" => {
                opts.append(true).create(true);
            }
            other => {
                self.last_io_error = Some(format!("unsupported io mode: {other}"));
                return Ok(None);
            }
        }
        match opts.open(&path) {
            Ok(file) => {
                let ptr = NativePtrId(self.resources.len() as u32);
                self.resources.push(ResourceEntry::File(file));
                Ok(Some(ptr))
            }
            Err(e) => {
                self.last_io_error = Some(format!("{path}: {e}"));
                Ok(None)
            }
        }
    }

    fn resource_mut(&mut self, ptr: NativePtrId) -> SuResult<&mut ResourceEntry> {
        self.resources
            .get_mut(ptr.0 as usize)
            .ok_or(SuError::MissingKey)
    }

    pub fn io_close(&mut self, ptr: NativePtrId) -> SuResult<()> {
        let slot = self.resource_mut(ptr)?;
        *slot = ResourceEntry::Closed;
        Ok(())
    }

    pub fn io_read_file(&mut self, ptr: NativePtrId) -> SuResult<Vec<u8>> {
        let mut buf = Vec::new();
        // Borrows `self.resources` directly (not through a `&mut self`
        // helper) so `self.stdin` stays available in the `Stdin` arm.
        match self.resources.get_mut(ptr.0 as usize).ok_or(SuError::MissingKey)? {
            ResourceEntry::Stdin => {
                self.stdin
                    .read_to_end(&mut buf)
                    .map_err(|e| SuError::User(e.to_string()))?;
            }
            ResourceEntry::File(f) => {
                f.read_to_end(&mut buf)
                    .map_err(|e| SuError::User(e.to_string()))?;
            }
            ResourceEntry::Stdout | ResourceEntry::Stderr => {
                return Err(SuError::type_error("readable file", "output stream"));
            }
            ResourceEntry::Closed => return Err(SuError::MissingKey),
        }
        Ok(buf)
    }

    pub fn io_write_file(&mut self, ptr: NativePtrId, data: &[u8]) -> SuResult<()> {
        let needs_stdout = matches!(
            self.resources.get(ptr.0 as usize),
            Some(ResourceEntry::Stdout)
        );
        if needs_stdout {
            return self
                .stdout
                .write_all(data)
                .map_err(|e| SuError::User(e.to_string()));
        }
        match self.resources.get_mut(ptr.0 as usize).ok_or(SuError::MissingKey)? {
            ResourceEntry::Stderr => std::io::stderr().write_all(data),
            ResourceEntry::File(f) => f.write_all(data),
            ResourceEntry::Stdin => return Err(SuError::type_error("writable file", "input stream")),
            ResourceEntry::Closed => return Err(SuError::MissingKey),
            ResourceEntry::Stdout => unreachable!("handled above"),
        }
        .map_err(|e| SuError::User(e.to_string()))
    }

    pub fn io_size(&mut self, ptr: NativePtrId) -> SuResult<u64> {
        match self.resource_mut(ptr)? {
            ResourceEntry::File(f) => f.metadata().map(|m| m.len()).map_err(|e| SuError::User(e.to_string())),
            ResourceEntry::Stdin | ResourceEntry::Stdout | ResourceEntry::Stderr => Ok(0),
            ResourceEntry::Closed => Err(SuError::MissingKey),
        }
    }

    pub fn io_take_last_error(&mut self) -> Option<String> {
        self.last_io_error.take()
    }

    pub fn io_stdin(&self) -> NativePtrId {
        STDIN_PTR
    }

    pub fn io_stdout(&self) -> NativePtrId {
        STDOUT_PTR
    }

    pub fn io_stderr(&self) -> NativePtrId {
        STDERR_PTR
    }

    // --- GC ---

    pub fn gc_trace(&mut self) {
        let globals = Some(self.globals);
        self.heap.gc_trace(&self.stack, globals);
        self.publish_gc_stats();
    }

    pub fn gc_full(&mut self) {
        let globals = Some(self.globals);
        self.heap.gc_full(&self.stack, globals);
        self.publish_gc_stats();
    }

    fn publish_gc_stats(&self) {
        use crate::diagnostics::{GC_CYCLES_RUN, GC_OBJECTS_FREED, HEAP_LIVE_OBJECTS};
        use std::sync::atomic::Ordering;
        GC_CYCLES_RUN.store(self.heap.stats.cycles_run, Ordering::Relaxed);
        GC_OBJECTS_FREED.store(self.heap.stats.objects_freed, Ordering::Relaxed);
        HEAP_LIVE_OBJECTS.store(self.heap.num_objects() as u64, Ordering::Relaxed);
    }

    // --- prototype/closure instantiation, grounded in core.c's lambda() ---

    /// Resolves `prot`'s constant pool and captures `num_ups` upvalues from
    /// the enclosing frame, pushing the new closure. Matches `lambda()`.
    pub fn lambda(&mut self, prot: ProtoId, narg: i32) -> SuResult<()> {
        let (constants, upvalue_descs): (Vec<Constant>, Vec<UpvalDesc>) = {
            let p = self
                .heap
                .prototypes
                .get(prot)
                .expect("dangling prototype id");
            (p.constants.clone(), p.upvalues.clone())
        };
        let resolved: Vec<ResolvedConstant> = constants
            .into_iter()
            .map(|c| match c {
                Constant::Nil => ResolvedConstant::Nil,
                Constant::True => ResolvedConstant::True,
                Constant::False => ResolvedConstant::False,
                Constant::Number(n) => ResolvedConstant::Number(n),
                Constant::Str(bytes) => {
                    let id = self.heap.string_table.intern(&mut self.heap.strings, &bytes);
                    ResolvedConstant::Str(id)
                }
            })
            .collect();

        // `level` counts frames up from the one currently running this
        // `LAMBDA` (1 = that frame itself, matching `lambda()`'s
        // `frame_top - lv` indexing the still-active frame at `frame_top - 1`,
        // not its caller).
        let mut upvalues = Vec::with_capacity(upvalue_descs.len());
        for desc in &upvalue_descs {
            let frame_idx = self.frames.len().checked_sub(desc.level as usize);
            let base = match frame_idx {
                Some(i) => self.frames[i].stack_base,
                None => 0,
            };
            upvalues.push(self.stack[base + desc.index as usize + 1]);
        }

        let closure = Closure {
            prototype: prot,
            constants: resolved,
            upvalues,
            arity: narg,
        };
        let id = self.heap.closures.insert(closure);
        self.push(Value::Function(id))
    }

    /// Loads a prototype tree rooted at `root` as the top-level (variadic)
    /// closure and pushes it, matching `su_load`'s final `lambda(s, prot, -1)`.
    pub fn load_root(&mut self, root: ProtoId) -> SuResult<()> {
        self.lambda(root, -1)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Open files are host resources the VM owns; close them on shutdown
/// rather than leaving them to the OS, matching the embedding API's
/// "closed by the time `su_close` returns" contract.
impl Drop for State {
    fn drop(&mut self) {
        for entry in &mut self.resources {
            if let ResourceEntry::File(_) = entry {
                *entry = ResourceEntry::Closed;
            }
        }
    }
}

impl NativeHost for State {
    fn push(&mut self, v: Value) {
        // Native functions are only invoked with stack headroom already
        // reserved by the interpreter's call sequence.
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on empty stack")
    }

    fn stack_at(&self, rel_index: i32) -> Value {
        self.get(rel_index).expect("native host stack access")
    }

    fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn pop_n(&mut self, n: usize) -> SuResult<()> {
        State::pop_n(self, n)
    }

    fn type_name_at(&self, idx: i32) -> SuResult<&'static str> {
        State::type_name(self, idx)
    }

    fn push_nil(&mut self) -> SuResult<()> {
        State::push_nil(self)
    }

    fn push_bool(&mut self, b: bool) -> SuResult<()> {
        State::push_bool(self, b)
    }

    fn to_bool(&self, idx: i32) -> SuResult<bool> {
        State::to_bool(self, idx)
    }

    fn push_number(&mut self, n: f64) -> SuResult<()> {
        State::push_number(self, n)
    }

    fn to_number(&self, idx: i32) -> SuResult<f64> {
        State::to_number(self, idx)
    }

    fn push_string(&mut self, bytes: &[u8]) -> SuResult<()> {
        State::push_string(self, bytes)
    }

    fn to_string_bytes(&self, idx: i32) -> SuResult<Vec<u8>> {
        State::to_string_bytes(self, idx)
    }

    fn push_pointer(&mut self, ptr: NativePtrId) -> SuResult<()> {
        State::push_pointer(self, ptr)
    }

    fn to_pointer(&self, idx: i32) -> SuResult<NativePtrId> {
        State::to_pointer(self, idx)
    }

    fn ref_local(&mut self, idx: i32) -> SuResult<()> {
        State::ref_local(self, idx)
    }

    fn unref_local(&mut self, idx: i32) -> SuResult<()> {
        State::unref_local(self, idx)
    }

    fn set_local(&mut self, idx: i32) -> SuResult<()> {
        State::set_local(self, idx)
    }

    fn seq(&mut self, idx: i32) -> SuResult<()> {
        State::seq(self, idx)
    }

    fn list(&mut self, num: usize) -> SuResult<()> {
        State::list(self, num)
    }

    fn cons(&mut self, idx: i32) -> SuResult<()> {
        State::cons(self, idx)
    }

    fn first(&mut self, idx: i32) -> SuResult<()> {
        State::first(self, idx)
    }

    fn rest(&mut self, idx: i32) -> SuResult<()> {
        State::rest(self, idx)
    }

    fn vector(&mut self, num: usize) -> SuResult<()> {
        State::vector(self, num)
    }

    fn vector_length(&self, idx: i32) -> SuResult<usize> {
        State::vector_length(self, idx)
    }

    fn vector_index(&mut self, idx: i32) -> SuResult<()> {
        State::vector_index(self, idx)
    }

    fn vector_set(&mut self, idx: i32) -> SuResult<()> {
        State::vector_set(self, idx)
    }

    fn vector_push(&mut self, idx: i32, num: usize) -> SuResult<()> {
        State::vector_push(self, idx, num)
    }

    fn vector_pop(&mut self, idx: i32, num: i32) -> SuResult<()> {
        State::vector_pop(self, idx, num)
    }

    fn map_new(&mut self, num_items: usize) -> SuResult<()> {
        State::map_new(self, num_items)
    }

    fn map_length(&self, idx: i32) -> SuResult<usize> {
        State::map_length(self, idx)
    }

    fn map_get(&mut self, idx: i32) -> SuResult<bool> {
        State::map_get(self, idx)
    }

    fn map_has(&mut self, idx: i32) -> SuResult<bool> {
        State::map_has(self, idx)
    }

    fn map_insert(&mut self, idx: i32) -> SuResult<()> {
        State::map_insert(self, idx)
    }

    fn map_remove(&mut self, idx: i32) -> SuResult<()> {
        State::map_remove(self, idx)
    }

    fn io_open(&mut self, path: &[u8], mode: &[u8]) -> SuResult<Option<NativePtrId>> {
        State::io_open(self, path, mode)
    }

    fn io_close(&mut self, ptr: NativePtrId) -> SuResult<()> {
        State::io_close(self, ptr)
    }

    fn io_read_file(&mut self, ptr: NativePtrId) -> SuResult<Vec<u8>> {
        State::io_read_file(self, ptr)
    }

    fn io_write_file(&mut self, ptr: NativePtrId, data: &[u8]) -> SuResult<()> {
        State::io_write_file(self, ptr, data)
    }

    fn io_size(&mut self, ptr: NativePtrId) -> SuResult<u64> {
        State::io_size(self, ptr)
    }

    fn io_take_last_error(&mut self) -> Option<String> {
        State::io_take_last_error(self)
    }

    fn io_stdin(&self) -> NativePtrId {
        State::io_stdin(self)
    }

    fn io_stdout(&self) -> NativePtrId {
        State::io_stdout(self)
    }

    fn io_stderr(&self) -> NativePtrId {
        State::io_stderr(self)
    }

    fn set_error_checkpoint(&mut self) {
        State::set_error_checkpoint(self);
    }

    fn clear_error_checkpoint(&mut self) {
        State::clear_error_checkpoint(self);
    }

    fn gc(&mut self) {
        State::gc_full(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_primitives_roundtrip() {
        let mut s = State::new();
        s.push_number(3.5).unwrap();
        assert_eq!(s.to_number(-1).unwrap(), 3.5);
        s.pop_n(1).unwrap();
        assert_eq!(s.stack.len(), 0);
    }

    #[test]
    fn string_push_interns_and_includes_nul() {
        let mut s = State::new();
        s.push_string(b"hi").unwrap();
        let bytes = s.to_string_bytes(-1).unwrap();
        assert_eq!(bytes, vec![b'h', b'i', 0]);
    }

    #[test]
    fn ref_unref_set_local_roundtrip() {
        let mut s = State::new();
        s.push_number(1.0).unwrap();
        s.ref_local(-1).unwrap();
        s.unref_local(-1).unwrap();
        assert_eq!(s.to_number(-1).unwrap(), 1.0);
        s.pop_n(1).unwrap();

        s.push_number(99.0).unwrap();
        s.set_local(-2).unwrap();
        s.unref_local(-1).unwrap();
        assert_eq!(s.to_number(-1).unwrap(), 99.0);
    }

    #[test]
    fn global_set_then_get() {
        let mut s = State::new();
        s.push_number(42.0).unwrap();
        s.set_global(true, b"answer").unwrap();
        assert!(s.get_global(b"answer").unwrap());
        assert_eq!(s.to_number(-1).unwrap(), 42.0);
    }

    #[test]
    fn duplicate_global_without_replace_errors() {
        let mut s = State::new();
        s.push_number(1.0).unwrap();
        s.set_global(false, b"x").unwrap();
        s.push_number(2.0).unwrap();
        assert!(s.set_global(false, b"x").is_err());
    }
}
