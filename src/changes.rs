//! The [`Changes`] value: four disjoint ordered sets of [`Endpoint`]s that
//! the plan calculator, policies, and registries all operate on.

use crate::endpoint::Endpoint;

/// Four disjoint ordered sets of endpoints. `update_old[i]` and
/// `update_new[i]` always share a key (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub create: Vec<Endpoint>,
    pub update_old: Vec<Endpoint>,
    pub update_new: Vec<Endpoint>,
    pub delete: Vec<Endpoint>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.update_old.is_empty()
            && self.update_new.is_empty()
            && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.create.len() + self.update_old.len() + self.update_new.len() + self.delete.len()
    }

    /// Number of discrete update pairs (`update_old`/`update_new` are kept
    /// in lockstep, so either length works).
    pub fn update_len(&self) -> usize {
        self.update_old.len()
    }
}
