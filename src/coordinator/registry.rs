//! # Handle Registry
//!
//! Concurrent map from a session handle to the state of its in-flight
//! operation, shared by consumer-side code and native callback threads.
//!
//! The registry never overwrites: a second `register` for a live handle is
//! refused, and [`HandleRegistry::take`] is the only removal path. A guard
//! returned by [`HandleRegistry::peek`] holds the entry's shard read lock, so a
//! concurrent `take` on the same handle waits until the guard is dropped.

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use thiserror::Error;

use crate::ffi::types::SessionHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an operation is already in flight for {handle}")]
    AlreadyInFlight { handle: SessionHandle },
}

#[derive(Debug)]
pub struct HandleRegistry<S> {
    entries: DashMap<SessionHandle, S>,
}

impl<S> Default for HandleRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> HandleRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert the state for a new operation. Refuses to replace a live entry.
    pub fn register(&self, handle: SessionHandle, state: S) -> Result<(), RegistryError> {
        match self.entries.entry(handle) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyInFlight { handle }),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    /// Atomically remove and return the entry. Returns `None` once it is gone.
    pub fn take(&self, handle: SessionHandle) -> Option<S> {
        self.entries.remove(&handle).map(|(_, state)| state)
    }

    /// Remove the entry only if `predicate` accepts it
    pub fn take_if(&self, handle: SessionHandle, predicate: impl FnOnce(&S) -> bool) -> Option<S> {
        self.entries
            .remove_if(&handle, |_, state| predicate(state))
            .map(|(_, state)| state)
    }

    /// Non-removing lookup. Do not call `take` for the same handle while holding the guard.
    pub fn peek(&self, handle: SessionHandle) -> Option<Ref<'_, SessionHandle, S>> {
        self.entries.get(&handle)
    }

    /// Snapshot of the handles with a registered entry
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn handle(raw: usize) -> SessionHandle {
        SessionHandle::from_raw(raw)
    }

    #[test]
    fn test_register_refuses_duplicate() {
        let registry = HandleRegistry::new();
        registry.register(handle(1), "first").unwrap();

        let err = registry.register(handle(1), "second").unwrap_err();
        assert_eq!(err, RegistryError::AlreadyInFlight { handle: handle(1) });

        // The original entry is untouched
        assert_eq!(*registry.peek(handle(1)).unwrap(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_is_exactly_once() {
        let registry = HandleRegistry::new();
        registry.register(handle(3), 42u32).unwrap();

        assert_eq!(registry.take(handle(3)), Some(42));
        assert_eq!(registry.take(handle(3)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_peek_after_take_observes_nothing() {
        let registry = HandleRegistry::new();
        registry.register(handle(5), String::from("state")).unwrap();
        registry.take(handle(5));
        assert!(registry.peek(handle(5)).is_none());
    }

    #[test]
    fn test_take_if_respects_predicate() {
        let registry = HandleRegistry::new();
        registry.register(handle(9), 7u64).unwrap();

        assert_eq!(registry.take_if(handle(9), |v| *v == 8), None);
        assert!(registry.contains(handle(9)));
        assert_eq!(registry.take_if(handle(9), |v| *v == 7), Some(7));
    }

    #[test]
    fn test_handles_lists_registered_entries() {
        let registry = HandleRegistry::new();
        registry.register(handle(1), ()).unwrap();
        registry.register(handle(2), ()).unwrap();
        registry.take(handle(1));

        assert_eq!(registry.handles(), vec![handle(2)]);
    }

    #[test]
    fn test_concurrent_take_resolves_once() {
        let registry = Arc::new(HandleRegistry::new());
        registry.register(handle(11), ()).unwrap();
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if registry.take(handle(11)).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize),
        Take(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..4).prop_map(Op::Register),
            (1usize..4).prop_map(Op::Take),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_entry_per_handle(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let registry = HandleRegistry::new();
            let mut model = std::collections::HashSet::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Register(raw) => {
                        let accepted = registry.register(handle(raw), step).is_ok();
                        prop_assert_eq!(accepted, model.insert(raw));
                    }
                    Op::Take(raw) => {
                        let taken = registry.take(handle(raw)).is_some();
                        prop_assert_eq!(taken, model.remove(&raw));
                    }
                }
                prop_assert_eq!(registry.len(), model.len());
            }
        }
    }
}
