//! Reference-counted table of owned resources behind opaque handles.
//!
//! Callers only ever hold `Handle<T>` values; the table owns the resource
//! and is the only place it can be destroyed. Freed ids go through a FIFO
//! queue and come back with a bumped generation, so an old copy of a handle
//! never resolves to whatever reuses its id.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::log::Logger;
use crate::{gpu_debug, gpu_trace, gpu_warn};

const SOURCE: &str = "gpucore::HandleTable";

// ===== HANDLE =====

/// Opaque, copyable reference to a resource owned by a `HandleTable<T>`
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self { index, generation, _marker: PhantomData }
    }

    /// Id inside the table
    pub fn index(&self) -> u32 {
        self.index
    }

    /// How many times the id had been recycled when this handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

// ===== TABLE =====

struct HandleEntry<T> {
    resource: T,
    ref_count: u32,
    is_valid: bool,
}

struct HandleSlot<T> {
    generation: u32,
    entry: Option<HandleEntry<T>>,
}

struct TableState<T> {
    slots: Vec<HandleSlot<T>>,
    free_ids: VecDeque<u32>,
}

impl<T> TableState<T> {
    fn entry(&self, handle: Handle<T>) -> Option<&HandleEntry<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: Handle<T>) -> Option<&mut HandleEntry<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Remove the entry and queue its id for reuse
    fn retire(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_ids.push_back(handle.index);
        Some(entry.resource)
    }
}

type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

/// Maps handles to owned resources with reference counting
///
/// A resource is reachable through `get` only while its entry is valid.
/// It is destroyed when the reference count reaches zero, through the
/// destructor given at construction (plain drop by default). Destructors
/// always run after the table lock has been released.
pub struct HandleTable<T> {
    state: Mutex<TableState<T>>,
    destructor: Option<Destructor<T>>,
    logger: Arc<dyn Logger>,
}

impl<T> HandleTable<T> {
    /// Create a table that drops resources when they are destroyed
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: Vec::new(),
                free_ids: VecDeque::new(),
            }),
            destructor: None,
            logger,
        }
    }

    /// Create a table that hands destroyed resources to `destructor`
    pub fn with_destructor(
        logger: Arc<dyn Logger>,
        destructor: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: Vec::new(),
                free_ids: VecDeque::new(),
            }),
            destructor: Some(Box::new(destructor)),
            logger,
        }
    }

    fn destroy(&self, resource: T) {
        match &self.destructor {
            Some(destructor) => destructor(resource),
            None => drop(resource),
        }
    }

    /// Take ownership of `resource` and return a handle with one reference
    pub fn create(&self, resource: T) -> Handle<T> {
        let mut state = self.state.lock();
        let entry = HandleEntry { resource, ref_count: 1, is_valid: true };
        let handle = match state.free_ids.pop_front() {
            Some(index) => {
                let slot = &mut state.slots[index as usize];
                slot.entry = Some(entry);
                Handle::new(index, slot.generation)
            }
            None => {
                let index = state.slots.len() as u32;
                state.slots.push(HandleSlot { generation: 0, entry: Some(entry) });
                Handle::new(index, 0)
            }
        };
        drop(state);
        gpu_trace!(self.logger, SOURCE, "Created {:?}", handle);
        handle
    }

    /// Whether `handle` refers to a live, valid entry
    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.state.lock().entry(handle).is_some_and(|e| e.is_valid)
    }

    /// Run `f` on the resource while holding the table lock
    ///
    /// Returns None if the handle is stale or has been invalidated.
    pub fn with<R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = self.state.lock();
        let entry = state.entry(handle).filter(|e| e.is_valid)?;
        Some(f(&entry.resource))
    }

    /// Add a reference. Fails on stale or invalidated handles.
    pub fn add_ref(&self, handle: Handle<T>) -> bool {
        let added = match self.state.lock().entry_mut(handle) {
            Some(entry) if entry.is_valid => {
                entry.ref_count += 1;
                true
            }
            _ => false,
        };
        if !added {
            gpu_warn!(self.logger, SOURCE, "add_ref on invalid {:?}", handle);
        }
        added
    }

    /// Drop a reference; the last one destroys the resource
    ///
    /// Also accepted on invalidated entries so remaining holders can finish
    /// the cleanup. Returns false on stale handles.
    pub fn release(&self, handle: Handle<T>) -> bool {
        let (known, destroyed) = {
            let mut state = self.state.lock();
            match state.entry_mut(handle) {
                None => (false, None),
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count == 0 {
                        (true, state.retire(handle))
                    } else {
                        (true, None)
                    }
                }
            }
        };
        if !known {
            gpu_warn!(self.logger, SOURCE, "release on stale {:?}", handle);
            return false;
        }
        if let Some(resource) = destroyed {
            gpu_trace!(self.logger, SOURCE, "Destroying {:?}", handle);
            self.destroy(resource);
        }
        true
    }

    /// Make the handle unusable now, destroy once unreferenced
    ///
    /// `get` and `is_valid` fail immediately; outstanding references can
    /// still be released. If no references remain the resource is destroyed
    /// right away. Returns false on stale or already invalidated handles.
    pub fn invalidate(&self, handle: Handle<T>) -> bool {
        let (known, destroyed) = {
            let mut state = self.state.lock();
            match state.entry_mut(handle) {
                Some(entry) if entry.is_valid => {
                    entry.is_valid = false;
                    if entry.ref_count == 0 {
                        (true, state.retire(handle))
                    } else {
                        (true, None)
                    }
                }
                _ => (false, None),
            }
        };
        if let Some(resource) = destroyed {
            self.destroy(resource);
        }
        known
    }

    /// Current reference count, None for stale handles
    pub fn ref_count(&self, handle: Handle<T>) -> Option<u32> {
        self.state.lock().entry(handle).map(|e| e.ref_count)
    }

    /// Handles of all valid entries
    pub fn active_handles(&self) -> Vec<Handle<T>> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.as_ref().is_some_and(|e| e.is_valid))
            .map(|(index, slot)| Handle::new(index as u32, slot.generation))
            .collect()
    }

    /// Number of valid entries
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.entry.as_ref().is_some_and(|e| e.is_valid))
            .count()
    }

    /// Invalidated entries still waiting for their last release
    pub fn pending_destroy_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.entry.as_ref().is_some_and(|e| !e.is_valid))
            .count()
    }

    /// Number of ids ever minted; ids never exceed this bound
    pub fn high_water_mark(&self) -> u32 {
        self.state.lock().slots.len() as u32
    }

    /// Destroy every live entry regardless of reference counts
    ///
    /// Returns how many resources were destroyed. Existing handles become stale.
    pub fn destroy_all(&self) -> usize {
        let resources: Vec<T> = {
            let mut state = self.state.lock();
            let live: Vec<Handle<T>> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.entry.is_some())
                .map(|(index, slot)| Handle::new(index as u32, slot.generation))
                .collect();
            live.into_iter().filter_map(|h| state.retire(h)).collect()
        };
        let count = resources.len();
        if count > 0 {
            gpu_debug!(self.logger, SOURCE, "Destroying {} remaining entries", count);
        }
        for resource in resources {
            self.destroy(resource);
        }
        count
    }
}

impl<T: Clone> HandleTable<T> {
    /// Clone of the resource, None if the handle is stale or invalidated
    pub fn get(&self, handle: Handle<T>) -> Option<T> {
        self.with(handle, T::clone)
    }
}

impl<T> Drop for HandleTable<T> {
    fn drop(&mut self) {
        let leaked = self.destroy_all();
        if leaked > 0 {
            gpu_warn!(self.logger, SOURCE, "Dropped table with {} live entries", leaked);
        }
    }
}

#[cfg(test)]
#[path = "handle_table_tests.rs"]
mod tests;
