use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ClassRef, MethodRef, ObjectRef};

/// Contents of the reference shadow of a slot.
#[derive(Debug, Clone)]
pub enum Reference {
    Object(ObjectRef),
    Method(MethodRef),
    Class(ClassRef),
}

impl Reference {
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Reference::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&MethodRef> {
        match self {
            Reference::Method(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArenaCreateInfo {
    /// Capacity in slots.
    pub size: usize,
}

impl Default for ArenaCreateInfo {
    fn default() -> Self {
        Self { size: 1 << 20 }
    }
}

/// Slot storage for every interpreter stack.
///
/// Each slot has an integer shadow (also read as u32 and f32 through bit
/// reinterpretation) and a reference shadow. Which shadow is meaningful
/// depends on the kind of the value stored there; the arena itself does not
/// track it.
pub struct Arena {
    i4: Vec<i32>,
    o4: Vec<Option<Reference>>,
    top: usize,
}

pub type SharedArena = Arc<Mutex<Arena>>;

impl Arena {
    pub fn new(info: &ArenaCreateInfo) -> Self {
        Self {
            i4: vec![0; info.size],
            o4: vec![None; info.size],
            top: 0,
        }
    }

    pub fn shared(info: &ArenaCreateInfo) -> SharedArena {
        Arc::new(Mutex::new(Self::new(info)))
    }

    pub fn capacity(&self) -> usize {
        self.i4.len()
    }

    /// Slots handed out so far.
    pub fn allocated(&self) -> usize {
        self.top
    }

    /// Reserve `size` slots and return the base address. Regions are never
    /// reclaimed. Running out of slots is fatal.
    pub fn allocate(&mut self, size: usize) -> usize {
        let base = self.top;
        let end = base.checked_add(size).filter(|end| *end <= self.capacity());
        let Some(end) = end else {
            log::error!(
                "arena exhausted: requested {size} slots with {} of {} in use",
                self.top,
                self.capacity()
            );
            panic!("arena exhausted");
        };
        self.top = end;
        log::debug!("arena: allocated [{base}, {end})");
        base
    }

    #[inline(always)]
    pub fn i4(&self, addr: usize) -> i32 {
        self.i4[addr]
    }

    #[inline(always)]
    pub fn set_i4(&mut self, addr: usize, value: i32) {
        self.i4[addr] = value;
    }

    #[inline(always)]
    pub fn u4(&self, addr: usize) -> u32 {
        self.i4[addr] as u32
    }

    #[inline(always)]
    pub fn set_u4(&mut self, addr: usize, value: u32) {
        self.i4[addr] = value as i32;
    }

    #[inline(always)]
    pub fn f4(&self, addr: usize) -> f32 {
        f32::from_bits(self.u4(addr))
    }

    #[inline(always)]
    pub fn set_f4(&mut self, addr: usize, value: f32) {
        self.set_u4(addr, value.to_bits());
    }

    /// Two-slot integer, low word first.
    pub fn i8(&self, addr: usize) -> i64 {
        let low = self.u4(addr) as u64;
        let high = self.u4(addr + 1) as u64;
        ((high << 32) | low) as i64
    }

    pub fn set_i8(&mut self, addr: usize, value: i64) {
        self.set_u4(addr, value as u32);
        self.set_u4(addr + 1, ((value as u64) >> 32) as u32);
    }

    pub fn f8(&self, addr: usize) -> f64 {
        f64::from_bits(self.i8(addr) as u64)
    }

    pub fn set_f8(&mut self, addr: usize, value: f64) {
        self.set_i8(addr, value.to_bits() as i64);
    }

    #[inline(always)]
    pub fn o4(&self, addr: usize) -> Option<&Reference> {
        self.o4[addr].as_ref()
    }

    #[inline(always)]
    pub fn set_o4(&mut self, addr: usize, value: Option<Reference>) {
        self.o4[addr] = value;
    }

    /// Clear the reference shadow, returning what it held.
    #[inline(always)]
    pub fn take_o4(&mut self, addr: usize) -> Option<Reference> {
        self.o4[addr].take()
    }

    /// Object stored in the reference shadow, if any.
    pub fn object(&self, addr: usize) -> Option<ObjectRef> {
        self.o4(addr).and_then(Reference::as_object).cloned()
    }

    /// Copy both shadows of a slot.
    pub fn copy_slot(&mut self, from: usize, to: usize) {
        self.i4[to] = self.i4[from];
        self.o4[to] = self.o4[from].clone();
    }
}
