//! Registry of live dynamically created primitives.
//!
//! Backends register each record they allocate and receive a token that
//! becomes the handle value. A token packs a slot index and the slot's
//! generation; retiring a slot bumps its generation, so a token minted for an
//! earlier occupant stops resolving even after the slot (or the record's
//! address) is reused. Lookups and frees through such a token are skipped,
//! which makes release idempotent.
//!
//! Token layout, low to high bits:
//!
//! ```text
//! | 1 tag bit | generation (half word - 1) | slot index + 1 (half word) |
//! ```
//!
//! The tag bit is always set, so tokens never collide with the (aligned)
//! addresses of fallback statics or with null.

use std::collections::VecDeque;
use std::sync::OnceLock;

use parking_lot::RwLock;

/// What a registered slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Primitive {
    Mutex,
    CondVar,
}

const TOKEN_TAG: usize = 1;
const INDEX_SHIFT: u32 = usize::BITS / 2;
const GENERATION_MASK: usize = (1 << (INDEX_SHIFT - 1)) - 1;
// Largest encodable `index + 1`.
const MAX_SLOTS: usize = usize::MAX >> INDEX_SHIFT;

fn encode(index: usize, generation: usize) -> usize {
    ((index + 1) << INDEX_SHIFT) | ((generation & GENERATION_MASK) << 1) | TOKEN_TAG
}

fn decode(token: usize) -> Option<(usize, usize)> {
    if token & TOKEN_TAG == 0 {
        return None;
    }
    let index = (token >> INDEX_SHIFT).checked_sub(1)?;
    Some((index, (token >> 1) & GENERATION_MASK))
}

#[derive(Debug)]
struct Slot {
    generation: usize,
    // Exposed record address; meaningful only while `primitive` is set.
    record: usize,
    primitive: Option<Primitive>,
}

#[derive(Debug, Default)]
struct Slab {
    slots: Vec<Slot>,
    // Retired slots, reused oldest first.
    vacant: VecDeque<usize>,
    live: usize,
}

/// Token -> record table.
#[derive(Debug, Default)]
pub(crate) struct LiveRegistry {
    slab: RwLock<Slab>,
}

impl LiveRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a freshly initialized primitive and return its token, or `None`
    /// when every slot is taken.
    pub(crate) fn register<T>(&self, record: *mut T, primitive: Primitive) -> Option<usize> {
        let mut guard = self.slab.write();
        let slab = &mut *guard;
        let index = match slab.vacant.pop_front() {
            Some(index) => index,
            None if slab.slots.len() < MAX_SLOTS => {
                slab.slots.push(Slot {
                    generation: 0,
                    record: 0,
                    primitive: None,
                });
                slab.slots.len() - 1
            }
            None => return None,
        };
        let slot = &mut slab.slots[index];
        slot.record = record.expose_provenance();
        slot.primitive = Some(primitive);
        slab.live += 1;
        Some(encode(index, slot.generation))
    }

    /// The record named by `token`, if it is live and holds `primitive`.
    pub(crate) fn resolve<T>(&self, token: usize, primitive: Primitive) -> Option<*mut T> {
        let (index, generation) = decode(token)?;
        let slab = self.slab.read();
        let slot = slab.slots.get(index)?;
        (slot.generation == generation && slot.primitive == Some(primitive))
            .then(|| std::ptr::with_exposed_provenance_mut(slot.record))
    }

    /// Retire `token` if it is live and holds `primitive`, returning the
    /// record whose release the caller now owns.
    pub(crate) fn retire<T>(&self, token: usize, primitive: Primitive) -> Option<*mut T> {
        let (index, generation) = decode(token)?;
        let mut guard = self.slab.write();
        let slab = &mut *guard;
        let slot = slab.slots.get_mut(index)?;
        if slot.generation != generation || slot.primitive != Some(primitive) {
            return None;
        }
        slot.primitive = None;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        let record = std::mem::take(&mut slot.record);
        slab.vacant.push_back(index);
        slab.live -= 1;
        Some(std::ptr::with_exposed_provenance_mut(record))
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.read().live
    }
}

static GLOBAL_LIVE: OnceLock<LiveRegistry> = OnceLock::new();

/// Process-wide registry shared by every backend instance.
pub(crate) fn global_live() -> &'static LiveRegistry {
    GLOBAL_LIVE.get_or_init(LiveRegistry::new)
}

/// Number of dynamically created primitives not yet freed.
///
/// Fallback primitives are not counted.
#[must_use]
pub fn live_primitive_count() -> usize {
    global_live().len()
}
