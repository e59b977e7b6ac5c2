//! Arena-backed heap.
//!
//! The original VM links every heap object into one singly-linked list
//! (`gc_t::next`) via a raw pointer embedded in each object's header, and
//! frees by `free(obj)`. This implementation keeps the same *shape* --
//! "every allocation lives in a place the collector can walk, colored, and
//! reclaim" -- but represents it as one typed arena per object kind rather
//! than an intrusive pointer list, per the design note in the specification
//! about realizing the tracing-GC contract through "an arena + index."
//!
//! An `Id<T>` is a generational index: a freed-and-reused slot gets a new
//! generation, so a stale id (one nobody should still be holding, because
//! the GC only frees unreachable objects) is detectable rather than
//! silently aliasing whatever now occupies that slot.

use std::marker::PhantomData;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    White,
    Gray,
    Black,
}

pub struct Id<T> {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: `T` itself need not be Copy/Eq/Hash for the id to be.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}
impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Id<T> {}
impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({}, gen {})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied {
        color: Color,
        generation: u32,
        value: T,
    },
    Free {
        generation: u32,
        next: Option<u32>,
    },
}

/// A typed, colored, generational arena: one per GC object kind.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free_head: None,
            live: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn insert(&mut self, value: T) -> Id<T> {
        self.live += 1;
        match self.free_head {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                let generation = match *slot {
                    Slot::Free { generation, next } => {
                        self.free_head = next;
                        generation
                    }
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                *slot = Slot::Occupied {
                    color: Color::White,
                    generation,
                    value,
                };
                Id {
                    index: idx,
                    generation,
                    _marker: PhantomData,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    color: Color::White,
                    generation: 0,
                    value,
                });
                Id {
                    index,
                    generation: 0,
                    _marker: PhantomData,
                }
            }
        }
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied {
                generation, value, ..
            }) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied {
                generation, value, ..
            }) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn color(&self, id: Id<T>) -> Color {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied {
                generation, color, ..
            }) if *generation == id.generation => *color,
            _ => Color::White,
        }
    }

    pub fn set_color(&mut self, id: Id<T>, color: Color) {
        if let Some(Slot::Occupied {
            generation,
            color: slot_color,
            ..
        }) = self.slots.get_mut(id.index as usize)
        {
            if *generation == id.generation {
                *slot_color = color;
            }
        }
    }

    /// Sweep: drop every White slot, repaint every surviving slot White.
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            let white = matches!(&self.slots[idx], Slot::Occupied { color: Color::White, .. });
            if white {
                let generation = match &self.slots[idx] {
                    Slot::Occupied { generation, .. } => *generation,
                    Slot::Free { .. } => unreachable!(),
                };
                self.slots[idx] = Slot::Free {
                    generation: generation.wrapping_add(1),
                    next: self.free_head,
                };
                self.free_head = Some(idx as u32);
                self.live -= 1;
                freed += 1;
            } else if let Slot::Occupied { color, .. } = &mut self.slots[idx] {
                *color = Color::White;
            }
        }
        freed
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match slot {
            Slot::Occupied {
                generation, value, ..
            } => Some((
                Id {
                    index: idx as u32,
                    generation: *generation,
                    _marker: PhantomData,
                },
                value,
            )),
            Slot::Free { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_roundtrip() {
        let mut a: Arena<i32> = Arena::new();
        let id = a.insert(42);
        assert_eq!(a.get(id), Some(&42));
        assert_eq!(a.live_count(), 1);
    }

    #[test]
    fn stale_id_detected_after_reuse() {
        let mut a: Arena<i32> = Arena::new();
        let id1 = a.insert(1);
        a.set_color(id1, Color::White); // still white -> swept
        let freed = a.sweep();
        assert_eq!(freed, 1);
        let id2 = a.insert(2);
        assert_eq!(id2.index, id1.index);
        assert_ne!(id2.generation, id1.generation);
        assert_eq!(a.get(id1), None);
        assert_eq!(a.get(id2), Some(&2));
    }

    #[test]
    fn sweep_keeps_black_and_repaints_white() {
        let mut a: Arena<i32> = Arena::new();
        let id = a.insert(7);
        a.set_color(id, Color::Black);
        let freed = a.sweep();
        assert_eq!(freed, 0);
        assert_eq!(a.get(id), Some(&7));
        assert_eq!(a.color(id), Color::White);
    }
}
