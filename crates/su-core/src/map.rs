//! Persistent hash-array-mapped trie (HAMT), grounded in `seq.c`'s node
//! family (`leaf_node_set`, `collision_node_set`, `idx_node_set`,
//! `full_node_set` and their `_without`/`_find` counterparts) and
//! `create_idx_node3`'s wrap-and-retry promotion helper.
//!
//! Each of the five node kinds in the original carries a vtable of four
//! function pointers (`set`, `without`, `find`, `get_hash`); here they are
//! one sum type dispatched by `match`, per the specification's note on
//! tagged-variant realizations of function-pointer-per-node polymorphism.

use crate::heap::{Arena, Id};
use crate::value::{hash_value, value_eq, Value};

const BITS: u32 = 5;
const BRANCH: usize = 1 << BITS; // 32

pub enum MapNode {
    Empty,
    Leaf {
        hash: u32,
        key: Value,
        val: Value,
    },
    /// Leaves sharing one hash but comparing unequal as keys.
    Collision {
        hash: u32,
        leaves: Vec<MapNodeId>,
    },
    Indexed {
        bitmap: u32,
        shift: u32,
        children: Vec<MapNodeId>,
    },
    Full {
        shift: u32,
        children: Vec<MapNodeId>,
    },
}

pub type MapNodeId = Id<MapNode>;

pub struct PMapData {
    pub count: usize,
    pub root: MapNodeId,
}

pub type MapId = Id<PMapData>;

pub struct MapArenas<'a> {
    pub nodes: &'a mut Arena<MapNode>,
    pub maps: &'a mut Arena<PMapData>,
}

pub fn length(maps: &Arena<PMapData>, m: MapId) -> usize {
    maps.get(m).expect("dangling map id").count
}

pub fn create_empty(a: &mut MapArenas) -> MapId {
    let root = a.nodes.insert(MapNode::Empty);
    a.maps.insert(PMapData { count: 0, root })
}

fn popcount(x: u32) -> u32 {
    x.count_ones()
}

fn bit_for(hash: u32, shift: u32) -> u32 {
    1 << ((hash >> shift) & (BRANCH as u32 - 1))
}

/// Returns the new root and whether a fresh key was added (for count
/// bookkeeping), mirroring `set`'s `added_leaf` out-parameter.
fn set_node(
    a: &mut MapArenas,
    node: MapNodeId,
    shift: u32,
    hash: u32,
    key: Value,
    val: Value,
) -> (MapNodeId, bool) {
    match a.nodes.get(node).expect("dangling node") {
        MapNode::Empty => {
            let leaf = a.nodes.insert(MapNode::Leaf { hash, key, val });
            (leaf, true)
        }
        MapNode::Leaf {
            hash: h,
            key: k,
            val: v,
        } => {
            let (h, k, v) = (*h, *k, *v);
            if h == hash {
                if value_eq(&k, &key) {
                    if value_eq(&v, &val) {
                        (node, false)
                    } else {
                        (a.nodes.insert(MapNode::Leaf { hash, key, val }), false)
                    }
                } else {
                    let other_leaf = a.nodes.insert(MapNode::Leaf {
                        hash: h,
                        key: k,
                        val: v,
                    });
                    let new_leaf = a.nodes.insert(MapNode::Leaf { hash, key, val });
                    let collision = a.nodes.insert(MapNode::Collision {
                        hash,
                        leaves: vec![other_leaf, new_leaf],
                    });
                    (collision, true)
                }
            } else {
                let wrapped = wrap_as_indexed(a, node, h, shift);
                set_node(a, wrapped, shift, hash, key, val)
            }
        }
        MapNode::Collision {
            hash: h,
            leaves,
        } => {
            let h = *h;
            let leaves = leaves.clone();
            if hash == h {
                let mut new_leaves = Vec::with_capacity(leaves.len() + 1);
                let mut replaced = false;
                for leaf_id in &leaves {
                    if let MapNode::Leaf { key: k, .. } = a.nodes.get(*leaf_id).unwrap() {
                        if value_eq(k, &key) {
                            new_leaves.push(a.nodes.insert(MapNode::Leaf { hash, key, val }));
                            replaced = true;
                            continue;
                        }
                    }
                    new_leaves.push(*leaf_id);
                }
                let added = !replaced;
                if added {
                    new_leaves.push(a.nodes.insert(MapNode::Leaf { hash, key, val }));
                }
                (
                    a.nodes.insert(MapNode::Collision {
                        hash,
                        leaves: new_leaves,
                    }),
                    added,
                )
            } else {
                let wrapped = wrap_as_indexed(a, node, h, shift);
                set_node(a, wrapped, shift, hash, key, val)
            }
        }
        MapNode::Indexed {
            bitmap,
            shift: node_shift,
            children,
        } => {
            let bitmap = *bitmap;
            let node_shift = *node_shift;
            let children = children.clone();
            let bit = bit_for(hash, node_shift);
            let pos = popcount(bitmap & (bit - 1)) as usize;
            if bitmap & bit != 0 {
                let child = children[pos];
                let (new_child, added) =
                    set_node(a, child, node_shift + BITS, hash, key, val);
                let mut new_children = children;
                new_children[pos] = new_child;
                (
                    a.nodes.insert(MapNode::Indexed {
                        bitmap,
                        shift: node_shift,
                        children: new_children,
                    }),
                    added,
                )
            } else {
                let leaf = a.nodes.insert(MapNode::Leaf { hash, key, val });
                let mut new_children = children;
                new_children.insert(pos, leaf);
                let new_bitmap = bitmap | bit;
                if new_bitmap == u32::MAX || new_children.len() == BRANCH {
                    (
                        a.nodes.insert(MapNode::Full {
                            shift: node_shift,
                            children: new_children,
                        }),
                        true,
                    )
                } else {
                    (
                        a.nodes.insert(MapNode::Indexed {
                            bitmap: new_bitmap,
                            shift: node_shift,
                            children: new_children,
                        }),
                        true,
                    )
                }
            }
        }
        MapNode::Full {
            shift: node_shift,
            children,
        } => {
            let node_shift = *node_shift;
            let children = children.clone();
            let idx = ((hash >> node_shift) & (BRANCH as u32 - 1)) as usize;
            let (new_child, added) =
                set_node(a, children[idx], node_shift + BITS, hash, key, val);
            let mut new_children = children;
            new_children[idx] = new_child;
            (
                a.nodes.insert(MapNode::Full {
                    shift: node_shift,
                    children: new_children,
                }),
                added,
            )
        }
    }
}

/// Wraps a single existing leaf/collision node (hashing to `existing_hash`)
/// inside a fresh indexed node at `shift`, so a second `set` at a
/// different hash can descend normally. Mirrors `create_idx_node3`.
fn wrap_as_indexed(a: &mut MapArenas, existing: MapNodeId, existing_hash: u32, shift: u32) -> MapNodeId {
    let bit = bit_for(existing_hash, shift);
    a.nodes.insert(MapNode::Indexed {
        bitmap: bit,
        shift,
        children: vec![existing],
    })
}

pub fn insert(a: &mut MapArenas, m: MapId, hash: u32, key: Value, val: Value) -> MapId {
    let (count, root) = {
        let data = a.maps.get(m).expect("dangling map id");
        (data.count, data.root)
    };
    let (new_root, added) = set_node(a, root, 0, hash, key, val);
    a.maps.insert(PMapData {
        count: if added { count + 1 } else { count },
        root: new_root,
    })
}

/// Looks up `key`/`hash` in `m`; returns `Value::Invalid` on a miss,
/// matching the original's outer-API "INVALID signals absent" convention.
pub fn find(a: &MapArenas, m: MapId, hash: u32, key: &Value) -> Value {
    let root = a.maps.get(m).expect("dangling map id").root;
    find_node(a, root, hash, key)
}

fn find_node(a: &MapArenas, node: MapNodeId, hash: u32, key: &Value) -> Value {
    match a.nodes.get(node).expect("dangling node") {
        MapNode::Empty => Value::Invalid,
        MapNode::Leaf { hash: h, key: k, val } => {
            if *h == hash && value_eq(k, key) {
                *val
            } else {
                Value::Invalid
            }
        }
        MapNode::Collision { hash: h, leaves } => {
            if *h != hash {
                return Value::Invalid;
            }
            for leaf_id in leaves {
                if let MapNode::Leaf { key: k, val, .. } = a.nodes.get(*leaf_id).unwrap() {
                    if value_eq(k, key) {
                        return *val;
                    }
                }
            }
            Value::Invalid
        }
        MapNode::Indexed {
            bitmap,
            shift,
            children,
        } => {
            let bit = bit_for(hash, *shift);
            if bitmap & bit == 0 {
                return Value::Invalid;
            }
            let pos = popcount(bitmap & (bit - 1)) as usize;
            find_node(a, children[pos], hash, key)
        }
        MapNode::Full { shift, children } => {
            let idx = ((hash >> shift) & (BRANCH as u32 - 1)) as usize;
            find_node(a, children[idx], hash, key)
        }
    }
}

pub fn has(a: &MapArenas, m: MapId, hash: u32, key: &Value) -> bool {
    !matches!(find(a, m, hash, key), Value::Invalid)
}

/// Removes `key`; returns the unchanged map if the key was absent.
pub fn remove(a: &mut MapArenas, m: MapId, hash: u32, key: &Value) -> MapId {
    let (count, root) = {
        let data = a.maps.get(m).expect("dangling map id");
        (data.count, data.root)
    };
    match without_node(a, root, hash, key) {
        Some(new_root) => a.maps.insert(PMapData {
            count: count - 1,
            root: new_root,
        }),
        None => m,
    }
}

/// `Ok` outer layer means "a leaf was actually removed"; `None` at the top
/// means "key absent, nothing changed." A `None` returned from a recursive
/// call to a parent is interpreted as "drop this slot," matching the
/// original's "removing the last leaf under a node returns null."
fn without_node(
    a: &mut MapArenas,
    node: MapNodeId,
    hash: u32,
    key: &Value,
) -> Option<MapNodeId> {
    match a.nodes.get(node).expect("dangling node") {
        MapNode::Empty => None,
        MapNode::Leaf { hash: h, key: k, .. } => {
            if *h == hash && value_eq(k, key) {
                Some(a.nodes.insert(MapNode::Empty))
            } else {
                None
            }
        }
        MapNode::Collision { hash: h, leaves } => {
            if *h != hash {
                return None;
            }
            let leaves = leaves.clone();
            let mut found = false;
            let mut remaining = Vec::with_capacity(leaves.len());
            for leaf_id in &leaves {
                if let MapNode::Leaf { key: k, .. } = a.nodes.get(*leaf_id).unwrap() {
                    if value_eq(k, key) {
                        found = true;
                        continue;
                    }
                }
                remaining.push(*leaf_id);
            }
            if !found {
                return None;
            }
            if remaining.len() == 1 {
                Some(remaining[0])
            } else {
                Some(a.nodes.insert(MapNode::Collision {
                    hash,
                    leaves: remaining,
                }))
            }
        }
        MapNode::Indexed {
            bitmap,
            shift,
            children,
        } => {
            let bitmap = *bitmap;
            let shift = *shift;
            let children = children.clone();
            let bit = bit_for(hash, shift);
            if bitmap & bit == 0 {
                return None;
            }
            let pos = popcount(bitmap & (bit - 1)) as usize;
            match without_node(a, children[pos], hash, key) {
                None => None,
                Some(replacement) => {
                    let is_empty = matches!(a.nodes.get(replacement).unwrap(), MapNode::Empty);
                    let mut new_children = children;
                    if is_empty {
                        new_children.remove(pos);
                        let new_bitmap = bitmap & !bit;
                        if new_children.is_empty() {
                            Some(a.nodes.insert(MapNode::Empty))
                        } else if new_children.len() == 1 {
                            Some(new_children[0])
                        } else {
                            Some(a.nodes.insert(MapNode::Indexed {
                                bitmap: new_bitmap,
                                shift,
                                children: new_children,
                            }))
                        }
                    } else {
                        new_children[pos] = replacement;
                        Some(a.nodes.insert(MapNode::Indexed {
                            bitmap,
                            shift,
                            children: new_children,
                        }))
                    }
                }
            }
        }
        MapNode::Full { shift, children } => {
            let shift = *shift;
            let children = children.clone();
            let idx = ((hash >> shift) & (BRANCH as u32 - 1)) as usize;
            match without_node(a, children[idx], hash, key) {
                None => None,
                Some(replacement) => {
                    let is_empty = matches!(a.nodes.get(replacement).unwrap(), MapNode::Empty);
                    if is_empty {
                        // Demote full -> indexed, clearing this slot.
                        let mut new_children = Vec::with_capacity(BRANCH - 1);
                        let mut bitmap = 0u32;
                        for (slot, &child) in children.iter().enumerate() {
                            if slot != idx {
                                new_children.push(child);
                                bitmap |= 1 << slot;
                            }
                        }
                        Some(a.nodes.insert(MapNode::Indexed {
                            bitmap,
                            shift,
                            children: new_children,
                        }))
                    } else {
                        let mut new_children = children;
                        new_children[idx] = replacement;
                        Some(a.nodes.insert(MapNode::Full {
                            shift,
                            children: new_children,
                        }))
                    }
                }
            }
        }
    }
}

pub fn hash_of(key: &Value) -> u32 {
    hash_value(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn arenas(nodes: &mut Arena<MapNode>, maps: &mut Arena<PMapData>) -> MapArenas<'_> {
        MapArenas { nodes, maps }
    }

    #[test]
    fn insert_then_find_roundtrips() {
        let mut nodes = Arena::new();
        let mut maps = Arena::new();
        let mut a = arenas(&mut nodes, &mut maps);
        let m = create_empty(&mut a);
        let k = Value::Number(1.0);
        let v = Value::Number(2.0);
        let m2 = insert(&mut a, m, hash_of(&k), k, v);
        assert_eq!(find(&a, m2, hash_of(&k), &k), v);
        assert_eq!(length(a.maps, m2), 1);
    }

    #[test]
    fn remove_then_find_is_absent() {
        let mut nodes = Arena::new();
        let mut maps = Arena::new();
        let mut a = arenas(&mut nodes, &mut maps);
        let m = create_empty(&mut a);
        let k = Value::Number(1.0);
        let v = Value::Number(2.0);
        let m2 = insert(&mut a, m, hash_of(&k), k, v);
        let m3 = remove(&mut a, m2, hash_of(&k), &k);
        assert_eq!(find(&a, m3, hash_of(&k), &k), Value::Invalid);
        assert_eq!(length(a.maps, m3), 0);
    }

    #[test]
    fn colliding_hashes_build_a_collision_node() {
        let mut nodes = Arena::new();
        let mut maps = Arena::new();
        let mut a = arenas(&mut nodes, &mut maps);
        let m = create_empty(&mut a);
        // Two distinct keys forced to the same hash bucket.
        let k1 = Value::Number(1.0);
        let k2 = Value::Number(2.0);
        let fake_hash = 42u32;
        let m2 = insert(&mut a, m, fake_hash, k1, Value::Number(10.0));
        let m3 = insert(&mut a, m2, fake_hash, k2, Value::Number(20.0));
        assert_eq!(length(a.maps, m3), 2);
        assert_eq!(find(&a, m3, fake_hash, &k1), Value::Number(10.0));
        assert_eq!(find(&a, m3, fake_hash, &k2), Value::Number(20.0));
        let root = a.maps.get(m3).unwrap().root;
        assert!(matches!(a.nodes.get(root).unwrap(), MapNode::Collision { .. }));
    }
}
