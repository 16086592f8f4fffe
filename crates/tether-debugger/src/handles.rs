use std::collections::{HashMap, VecDeque};

/// Largest reference handed out. Many hosts parse `variablesReference` as an `i32`.
pub const MAX_VARIABLES_REFERENCE: i64 = i32::MAX as i64;

/// Default bound on live handles within one pause.
pub const DEFAULT_MAX_HANDLES: usize = 10_000;

/// Maps synthetic `variablesReference` integers to native handles.
///
/// Handles are stop-scoped: [`HandleTable::clear`] drops every entry when the
/// debuggee resumes. References keep counting up across clears, so a stale
/// reference resolves to nothing instead of to an unrelated object until the
/// counter wraps at [`MAX_VARIABLES_REFERENCE`]. After a wrap, allocation skips
/// references that are still live.
#[derive(Debug)]
pub struct HandleTable<T> {
    next_reference: i64,
    generation: u64,
    entries: HashMap<i64, T>,
    fifo: VecDeque<i64>,
    max_entries: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_HANDLES)
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            next_reference: 1,
            generation: 0,
            entries: HashMap::new(),
            fifo: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Register `handle` and return its reference (always > 0).
    pub fn alloc(&mut self, handle: T) -> i64 {
        // Live entries are bounded by `max_entries`, so a free slot exists.
        let mut reference = self.advance();
        while self.entries.contains_key(&reference) {
            reference = self.advance();
        }

        self.entries.insert(reference, handle);
        self.fifo.push_back(reference);
        while self.fifo.len() > self.max_entries {
            if let Some(evicted) = self.fifo.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        reference
    }

    fn advance(&mut self) -> i64 {
        let reference = self.next_reference;
        self.next_reference = if reference >= MAX_VARIABLES_REFERENCE {
            1
        } else {
            reference + 1
        };
        reference
    }

    pub fn get(&self, reference: i64) -> Option<&T> {
        self.entries.get(&reference)
    }

    /// Invalidate every outstanding reference.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.fifo.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Bumped by every [`HandleTable::clear`]; lets callers detect a resume that
    /// happened while they were awaiting a lookup.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
