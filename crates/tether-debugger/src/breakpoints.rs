use std::collections::{BTreeMap, HashMap};

use crate::model::Breakpoint;

/// Tracks live breakpoints per source under a full-replace policy: after
/// [`BreakpointReconciler::replace`] the set for that source is exactly the
/// list passed in.
#[derive(Debug, Default)]
pub struct BreakpointReconciler {
    next_local: u64,
    by_source: BTreeMap<String, Vec<Breakpoint>>,
    owner: HashMap<String, String>,
}

impl BreakpointReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh fallback id for a breakpoint the adapter gave no id for.
    pub fn local_id(&mut self) -> String {
        self.next_local += 1;
        format!("local-{}", self.next_local)
    }

    /// Replace the set for `source`, returning the previous set.
    pub fn replace(&mut self, source: &str, breakpoints: Vec<Breakpoint>) -> Vec<Breakpoint> {
        let previous = self.take(source);
        for bp in &breakpoints {
            self.owner.insert(bp.id.clone(), source.to_string());
        }
        if !breakpoints.is_empty() {
            self.by_source.insert(source.to_string(), breakpoints);
        }
        previous
    }

    /// Drop every breakpoint for `source`.
    pub fn take(&mut self, source: &str) -> Vec<Breakpoint> {
        let previous = self.by_source.remove(source).unwrap_or_default();
        for bp in &previous {
            self.owner.remove(&bp.id);
        }
        previous
    }

    pub fn source_of(&self, id: &str) -> Option<&str> {
        self.owner.get(id).map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Option<&Breakpoint> {
        let source = self.owner.get(id)?;
        self.by_source.get(source)?.iter().find(|bp| bp.id == id)
    }

    /// Remove one breakpoint by id, returning it.
    pub fn remove(&mut self, id: &str) -> Option<Breakpoint> {
        let source = self.owner.remove(id)?;
        let list = self.by_source.get_mut(&source)?;
        let index = list.iter().position(|bp| bp.id == id)?;
        let removed = list.remove(index);
        if list.is_empty() {
            self.by_source.remove(&source);
        }
        Some(removed)
    }

    /// Update a tracked breakpoint in place (e.g. a late resolution). Returns
    /// false for ids this reconciler does not own.
    pub fn update(&mut self, breakpoint: Breakpoint) -> bool {
        let Some(source) = self.owner.get(&breakpoint.id) else {
            return false;
        };
        let Some(slot) = self
            .by_source
            .get_mut(source)
            .and_then(|list| list.iter_mut().find(|bp| bp.id == breakpoint.id))
        else {
            return false;
        };
        *slot = breakpoint;
        true
    }

    pub fn for_source(&self, source: &str) -> &[Breakpoint] {
        self.by_source
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every live breakpoint, grouped by source in source order.
    pub fn all(&self) -> Vec<Breakpoint> {
        self.by_source.values().flatten().cloned().collect()
    }
}
