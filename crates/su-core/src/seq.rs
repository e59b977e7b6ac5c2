//! Lazy `first`/`rest` sequence abstraction, grounded in `seq.c`'s
//! `cell_create`, `cell_create_array`, `it_create_vector`,
//! `it_create_string`, `seq_first`, `seq_rest`.

use crate::error::{SuError, SuResult};
use crate::heap::{Arena, Id};
use crate::intern::{StringTable, SuString};
use crate::value::{StrId, Value, VectorId};
use crate::vector::{self, VecArenas};

pub enum SeqSource {
    Vector(VectorId),
    Str(StrId),
}

pub enum SeqNode {
    Cell {
        first: Value,
        rest: Value,
    },
    Iter {
        source: SeqSource,
        index: usize,
    },
}

pub type SeqId = Id<SeqNode>;

/// `cons(x, s)`: allocate one cell with `first = x, rest = s`.
pub fn cons(seqs: &mut Arena<SeqNode>, first: Value, rest: Value) -> SeqId {
    seqs.insert(SeqNode::Cell { first, rest })
}

/// Builds a sequence from an array, one cell per element linked
/// right-to-left, terminal `rest = Nil`.
pub fn from_array(seqs: &mut Arena<SeqNode>, items: &[Value]) -> Value {
    let mut rest = Value::Nil;
    for &item in items.iter().rev() {
        let id = cons(seqs, item, rest);
        rest = Value::Seq(id);
    }
    rest
}

pub fn from_vector(
    seqs: &mut Arena<SeqNode>,
    vectors: &Arena<crate::vector::PVec>,
    v: VectorId,
) -> Value {
    if vector::length(vectors, v) == 0 {
        Value::Nil
    } else {
        Value::Seq(seqs.insert(SeqNode::Iter {
            source: SeqSource::Vector(v),
            index: 0,
        }))
    }
}

pub fn from_string(seqs: &mut Arena<SeqNode>, strings: &Arena<SuString>, s: StrId) -> Value {
    let len = strings.get(s).expect("dangling string id").bytes.len();
    if len == 0 {
        Value::Nil
    } else {
        Value::Seq(seqs.insert(SeqNode::Iter {
            source: SeqSource::Str(s),
            index: 0,
        }))
    }
}

/// Every arena a sequence operation might touch -- string iteration must
/// intern a fresh one-byte string, which needs mutable access to both the
/// string arena and the interning index.
pub struct SeqCtx<'a> {
    pub seqs: &'a mut Arena<SeqNode>,
    pub vectors: &'a mut Arena<crate::vector::PVec>,
    pub vec_nodes: &'a mut Arena<crate::vector::VecNode>,
    pub strings: &'a mut Arena<SuString>,
    pub string_table: &'a mut StringTable,
}

fn source_copy(source: &SeqSource) -> SeqSource {
    match source {
        SeqSource::Vector(v) => SeqSource::Vector(*v),
        SeqSource::Str(s) => SeqSource::Str(*s),
    }
}

/// `first` of `q`. Matches `seq_first`: a string iterator interns a
/// one-byte string on every read (the original always produces a fresh
/// `string_t*` here too, relying on interning to collapse repeats).
pub fn first(ctx: &mut SeqCtx, q: SeqId) -> SuResult<Value> {
    let (source, index) = match ctx.seqs.get(q).expect("dangling seq id") {
        SeqNode::Cell { first, .. } => return Ok(*first),
        SeqNode::Iter { source, index } => (source_copy(source), *index),
    };
    match source {
        SeqSource::Vector(v) => {
            let a = VecArenas {
                nodes: ctx.vec_nodes,
                vectors: ctx.vectors,
            };
            vector::index(&a, v, index)
        }
        SeqSource::Str(s) => {
            let len = ctx.strings.get(s).expect("dangling string id").bytes.len();
            if index >= len {
                return Err(SuError::IndexOutOfBounds {
                    index: index as i64,
                    len,
                });
            }
            let byte = ctx.strings.get(s).unwrap().bytes[index];
            let id = ctx.string_table.intern(ctx.strings, &[byte]);
            Ok(Value::Str(id))
        }
    }
}

/// `rest` on a one-element sequence yields `Nil`; on an iterator it
/// allocates a fresh iterator node at `idx + 1` -- never mutates.
pub fn rest(ctx: &mut SeqCtx, q: SeqId) -> SuResult<Value> {
    let (source, index) = match ctx.seqs.get(q).expect("dangling seq id") {
        SeqNode::Cell { rest, .. } => return Ok(*rest),
        SeqNode::Iter { source, index } => (source_copy(source), *index),
    };
    let len = match &source {
        SeqSource::Vector(v) => vector::length(ctx.vectors, *v),
        SeqSource::Str(s) => ctx.strings.get(*s).expect("dangling string id").bytes.len(),
    };
    if index + 1 >= len {
        Ok(Value::Nil)
    } else {
        let id = ctx.seqs.insert(SeqNode::Iter {
            source,
            index: index + 1,
        });
        Ok(Value::Seq(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{self as vecmod, VecArenas};

    fn empty_ctx<'a>(
        seqs: &'a mut Arena<SeqNode>,
        vectors: &'a mut Arena<crate::vector::PVec>,
        vec_nodes: &'a mut Arena<crate::vector::VecNode>,
        strings: &'a mut Arena<SuString>,
        string_table: &'a mut StringTable,
    ) -> SeqCtx<'a> {
        SeqCtx {
            seqs,
            vectors,
            vec_nodes,
            strings,
            string_table,
        }
    }

    #[test]
    fn cons_and_first_rest() {
        let mut seqs = Arena::new();
        let id = cons(&mut seqs, Value::Number(1.0), Value::Nil);
        let mut vectors = Arena::new();
        let mut vec_nodes = Arena::new();
        let mut strings = Arena::new();
        let mut string_table = StringTable::new();
        let mut ctx = empty_ctx(&mut seqs, &mut vectors, &mut vec_nodes, &mut strings, &mut string_table);
        assert_eq!(first(&mut ctx, id).unwrap(), Value::Number(1.0));
        assert_eq!(rest(&mut ctx, id).unwrap(), Value::Nil);
    }

    #[test]
    fn vector_iterator_walks_to_nil() {
        let mut vec_nodes = Arena::new();
        let mut vectors = Arena::new();
        let v = {
            let mut a = VecArenas {
                nodes: &mut vec_nodes,
                vectors: &mut vectors,
            };
            let mut v = vecmod::create_empty(&mut a);
            v = vecmod::push(&mut a, v, Value::Number(1.0));
            v = vecmod::push(&mut a, v, Value::Number(2.0));
            v
        };
        let mut seqs = Arena::new();
        let mut strings = Arena::new();
        let mut string_table = StringTable::new();
        let seq_val = from_vector(&mut seqs, &vectors, v);
        let mut ctx = empty_ctx(&mut seqs, &mut vectors, &mut vec_nodes, &mut strings, &mut string_table);
        let id = match seq_val {
            Value::Seq(id) => id,
            _ => panic!("expected seq"),
        };
        assert_eq!(first(&mut ctx, id).unwrap(), Value::Number(1.0));
        let rest1 = rest(&mut ctx, id).unwrap();
        let id1 = match rest1 {
            Value::Seq(id) => id,
            _ => panic!("expected seq"),
        };
        assert_eq!(first(&mut ctx, id1).unwrap(), Value::Number(2.0));
        assert_eq!(rest(&mut ctx, id1).unwrap(), Value::Nil);
    }
}
