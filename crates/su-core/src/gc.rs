//! The heap (one arena per GC object kind) and the tri-colour incremental
//! mark-sweep collector over it, grounded line-for-line in `gc.c`.
//!
//! Scan granularity: `gc.c`'s `scan()` drains the *entire* gray stack in
//! one call (`while (s->gc_gray_size)`), not one item per call; `gc_trace`
//! calls `scan()` once per pulse and then checks whether the stack emptied
//! out before deciding whether to run `end()`. This implementation follows
//! that actual control flow rather than the distilled prose's "pop one
//! gray" phrasing, since the two must agree for `gc_trace`'s begin/scan/end
//! staging to behave the same way the original's does.

use std::any::Any;

use crate::heap::{Arena, Color};
use crate::intern::{StringTable, SuString};
use crate::map::{MapArenas, MapId, MapNode};
use crate::proto::{Closure, Prototype, ProtoId, ResolvedConstant};
use crate::seq::{SeqId, SeqNode, SeqSource};
use crate::value::{FuncId, LocalId, NativeDataId, StrId, Value, VectorId};
use crate::vector::{VecArenas, VecNode, VecNodeId};

/// Default live-object count above which a new incremental cycle begins,
/// matching `gc.c`'s `ALIVE_OBJECTS`.
pub const DEFAULT_ALIVE_OBJECTS: usize = 256;

#[derive(Copy, Clone, Debug)]
enum GrayItem {
    Str(StrId),
    VecNode(VecNodeId),
    Vector(VectorId),
    MapNode(crate::map::MapNodeId),
    Map(MapId),
    Seq(SeqId),
    Local(LocalId),
    Closure(FuncId),
    Proto(ProtoId),
    NativeData(NativeDataId),
}

pub struct Heap {
    pub strings: Arena<SuString>,
    pub string_table: StringTable,
    pub vec_nodes: Arena<VecNode>,
    pub vectors: Arena<crate::vector::PVec>,
    pub map_nodes: Arena<MapNode>,
    pub maps: Arena<crate::map::PMapData>,
    pub seqs: Arena<SeqNode>,
    pub locals: Arena<Value>,
    pub closures: Arena<Closure>,
    pub prototypes: Arena<Prototype>,
    pub native_data: Arena<Box<dyn Any>>,

    gray: Vec<GrayItem>,
    pub alive_threshold: usize,
    pub stats: GcStats,
}

#[derive(Default, Copy, Clone, Debug)]
pub struct GcStats {
    pub cycles_run: u64,
    pub objects_freed: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Heap {
            strings: Arena::new(),
            string_table: StringTable::new(),
            vec_nodes: Arena::new(),
            vectors: Arena::new(),
            map_nodes: Arena::new(),
            maps: Arena::new(),
            seqs: Arena::new(),
            locals: Arena::new(),
            closures: Arena::new(),
            prototypes: Arena::new(),
            native_data: Arena::new(),
            gray: Vec::new(),
            alive_threshold: DEFAULT_ALIVE_OBJECTS,
            stats: GcStats::default(),
        }
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_objects(&self) -> usize {
        self.strings.live_count()
            + self.vec_nodes.live_count()
            + self.vectors.live_count()
            + self.map_nodes.live_count()
            + self.maps.live_count()
            + self.seqs.live_count()
            + self.locals.live_count()
            + self.closures.live_count()
            + self.prototypes.live_count()
            + self.native_data.live_count()
    }

    pub fn map_arenas(&mut self) -> MapArenas<'_> {
        MapArenas {
            nodes: &mut self.map_nodes,
            maps: &mut self.maps,
        }
    }

    pub fn vec_arenas(&mut self) -> VecArenas<'_> {
        VecArenas {
            nodes: &mut self.vec_nodes,
            vectors: &mut self.vectors,
        }
    }

    fn color_of(&self, item: GrayItem) -> Color {
        match item {
            GrayItem::Str(id) => self.strings.color(id),
            GrayItem::VecNode(id) => self.vec_nodes.color(id),
            GrayItem::Vector(id) => self.vectors.color(id),
            GrayItem::MapNode(id) => self.map_nodes.color(id),
            GrayItem::Map(id) => self.maps.color(id),
            GrayItem::Seq(id) => self.seqs.color(id),
            GrayItem::Local(id) => self.locals.color(id),
            GrayItem::Closure(id) => self.closures.color(id),
            GrayItem::Proto(id) => self.prototypes.color(id),
            GrayItem::NativeData(id) => self.native_data.color(id),
        }
    }

    fn set_color_of(&mut self, item: GrayItem, color: Color) {
        match item {
            GrayItem::Str(id) => self.strings.set_color(id, color),
            GrayItem::VecNode(id) => self.vec_nodes.set_color(id, color),
            GrayItem::Vector(id) => self.vectors.set_color(id, color),
            GrayItem::MapNode(id) => self.map_nodes.set_color(id, color),
            GrayItem::Map(id) => self.maps.set_color(id, color),
            GrayItem::Seq(id) => self.seqs.set_color(id, color),
            GrayItem::Local(id) => self.locals.set_color(id, color),
            GrayItem::Closure(id) => self.closures.set_color(id, color),
            GrayItem::Proto(id) => self.prototypes.set_color(id, color),
            GrayItem::NativeData(id) => self.native_data.set_color(id, color),
        }
    }

    fn add_to_gray(&mut self, item: GrayItem) {
        if self.color_of(item) == Color::White {
            self.set_color_of(item, Color::Gray);
            self.gray.push(item);
        }
    }

    fn gray_value(&mut self, v: Value) {
        let item = match v {
            Value::Str(id) => GrayItem::Str(id),
            Value::Function(id) => GrayItem::Closure(id),
            Value::Vector(id) => GrayItem::Vector(id),
            Value::Map(id) => GrayItem::Map(id),
            Value::Local(id) => GrayItem::Local(id),
            Value::Seq(id) => GrayItem::Seq(id),
            Value::NativeData(id) => GrayItem::NativeData(id),
            _ => return,
        };
        self.add_to_gray(item);
    }

    /// Roots: every live operand-stack slot, the globals map, the string
    /// table (here: every currently-interned string -- the original's
    /// string table is itself a persistent map that the root-graying walks
    /// transitively; ours grays every bucketed id directly, which is
    /// observably the same "every interned string survives every cycle").
    pub fn gc_begin(&mut self, stack: &[Value], globals: Option<MapId>) {
        self.gray.clear();
        for &v in stack {
            self.gray_value(v);
        }
        if let Some(g) = globals {
            self.add_to_gray(GrayItem::Map(g));
        }
        let ids: Vec<StrId> = self.string_table.all_ids().collect();
        for id in ids {
            self.add_to_gray(GrayItem::Str(id));
        }
    }

    pub fn gray_stack_is_empty(&self) -> bool {
        self.gray.is_empty()
    }

    /// Drains the gray stack to empty, per `scan()`'s actual loop.
    pub fn gc_scan(&mut self) {
        while let Some(item) = self.gray.pop() {
            if self.color_of(item) == Color::Black {
                continue;
            }
            self.set_color_of(item, Color::Black);
            self.visit_children(item);
        }
    }

    fn visit_children(&mut self, item: GrayItem) {
        match item {
            GrayItem::Str(_) => {}
            GrayItem::NativeData(_) => {}
            GrayItem::Local(id) => {
                if let Some(&v) = self.locals.get(id) {
                    self.gray_value(v);
                }
            }
            GrayItem::Vector(id) => {
                if let Some(pv) = self.vectors.get(id) {
                    let (root, tail) = (pv.root, pv.tail);
                    self.add_to_gray(GrayItem::VecNode(root));
                    self.add_to_gray(GrayItem::VecNode(tail));
                }
            }
            GrayItem::VecNode(id) => {
                if let Some(node) = self.vec_nodes.get(id) {
                    match node {
                        VecNode::Branch(children) => {
                            let children = children.clone();
                            for c in children {
                                self.add_to_gray(GrayItem::VecNode(c));
                            }
                        }
                        VecNode::Leaf(values) => {
                            let values = values.clone();
                            for v in values {
                                self.gray_value(v);
                            }
                        }
                    }
                }
            }
            GrayItem::Map(id) => {
                if let Some(data) = self.maps.get(id) {
                    self.add_to_gray(GrayItem::MapNode(data.root));
                }
            }
            GrayItem::MapNode(id) => {
                if let Some(node) = self.map_nodes.get(id) {
                    match node {
                        MapNode::Empty => {}
                        MapNode::Leaf { key, val, .. } => {
                            let (k, v) = (*key, *val);
                            self.gray_value(k);
                            self.gray_value(v);
                        }
                        MapNode::Collision { leaves, .. } => {
                            let leaves = leaves.clone();
                            for l in leaves {
                                self.add_to_gray(GrayItem::MapNode(l));
                            }
                        }
                        MapNode::Indexed { children, .. } | MapNode::Full { children, .. } => {
                            let children = children.clone();
                            for c in children {
                                self.add_to_gray(GrayItem::MapNode(c));
                            }
                        }
                    }
                }
            }
            GrayItem::Seq(id) => {
                if let Some(node) = self.seqs.get(id) {
                    match node {
                        SeqNode::Cell { first, rest } => {
                            let (f, r) = (*first, *rest);
                            self.gray_value(f);
                            self.gray_value(r);
                        }
                        SeqNode::Iter { source, .. } => match source {
                            SeqSource::Vector(v) => {
                                let v = *v;
                                self.add_to_gray(GrayItem::Vector(v));
                            }
                            SeqSource::Str(s) => {
                                let s = *s;
                                self.add_to_gray(GrayItem::Str(s));
                            }
                        },
                    }
                }
            }
            GrayItem::Closure(id) => {
                if let Some(closure) = self.closures.get(id) {
                    let proto = closure.prototype;
                    let consts: Vec<StrId> = closure
                        .constants
                        .iter()
                        .filter_map(|c| match c {
                            ResolvedConstant::Str(s) => Some(*s),
                            _ => None,
                        })
                        .collect();
                    let upvalues = closure.upvalues.clone();
                    self.add_to_gray(GrayItem::Proto(proto));
                    for s in consts {
                        self.add_to_gray(GrayItem::Str(s));
                    }
                    for v in upvalues {
                        self.gray_value(v);
                    }
                }
            }
            GrayItem::Proto(id) => {
                if let Some(proto) = self.prototypes.get(id) {
                    let subs = proto.sub_prototypes.clone();
                    for p in subs {
                        self.add_to_gray(GrayItem::Proto(p));
                    }
                }
            }
        }
    }

    /// Walks every arena in slot order, frees every White slot, repaints
    /// every surviving slot White. Returns the number of objects freed.
    pub fn gc_end(&mut self) -> usize {
        let freed = self.strings.sweep()
            + self.vec_nodes.sweep()
            + self.vectors.sweep()
            + self.map_nodes.sweep()
            + self.maps.sweep()
            + self.seqs.sweep()
            + self.locals.sweep()
            + self.closures.sweep()
            + self.prototypes.sweep()
            + self.native_data.sweep();
        self.string_table.retain_live(&self.strings);
        self.stats.objects_freed += freed as u64;
        freed
    }

    /// One incremental pulse: if a cycle is in flight, keep draining the
    /// gray stack; otherwise start a new cycle once live objects exceed
    /// the threshold. Matches `gc_trace`.
    pub fn gc_trace(&mut self, stack: &[Value], globals: Option<MapId>) {
        if self.num_objects() > self.alive_threshold {
            if self.gray_stack_is_empty() {
                tracing::trace!(live = self.num_objects(), threshold = self.alive_threshold, "gc cycle begin");
                self.gc_begin(stack, globals);
            }
            self.gc_scan();
            if self.gray_stack_is_empty() {
                let freed = self.gc_end();
                self.stats.cycles_run += 1;
                tracing::trace!(freed, live = self.num_objects(), "gc cycle end");
            }
        }
    }

    /// Full blocking collection: one complete begin/scan/end cycle to
    /// quiescence, bypassing the live-object threshold. Matches `su_gc`.
    pub fn gc_full(&mut self, stack: &[Value], globals: Option<MapId>) {
        tracing::debug!(live = self.num_objects(), "full gc begin");
        self.gc_begin(stack, globals);
        self.gc_scan();
        let freed = self.gc_end();
        self.stats.cycles_run += 1;
        tracing::debug!(freed, live = self.num_objects(), "full gc end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use crate::vector;

    #[test]
    fn full_gc_collects_unreachable_vector() {
        let mut heap = Heap::new();
        {
            let mut a = heap.vec_arenas();
            let mut v = vector::create_empty(&mut a);
            v = vector::push(&mut a, v, Value::Number(1.0));
            let _ = v; // becomes unreachable once the stack is empty
        }
        let before = heap.num_objects();
        assert!(before > 0);
        heap.gc_full(&[], None);
        assert_eq!(heap.num_objects(), 0);
    }

    #[test]
    fn full_gc_keeps_reachable_vector() {
        let mut heap = Heap::new();
        let v = {
            let mut a = heap.vec_arenas();
            let mut v = vector::create_empty(&mut a);
            v = vector::push(&mut a, v, Value::Number(1.0));
            v
        };
        let stack = [Value::Vector(v)];
        heap.gc_full(&stack, None);
        assert!(heap.num_objects() > 0);
        let a = heap.vec_arenas();
        assert_eq!(vector::index(&a, v, 0).unwrap().as_num(), 1.0);
    }

    #[test]
    fn full_gc_keeps_map_reachable_through_globals() {
        let mut heap = Heap::new();
        let key = Value::Number(1.0);
        let hash = map::hash_of(&key);
        let m = {
            let mut a = heap.map_arenas();
            let m = map::create_empty(&mut a);
            map::insert(&mut a, m, hash, key, Value::Number(2.0))
        };
        heap.gc_full(&[], Some(m));
        let a = heap.map_arenas();
        assert_eq!(map::find(&a, m, hash, &key), Value::Number(2.0));
    }
}
