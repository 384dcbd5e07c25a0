//! Policies rewrite a computed [`Changes`] value. The plan calculator
//! applies each configured policy, in order, after computing the raw diff
//! (spec.md §4.C, §4.D step 5).

use crate::changes::Changes;

/// Which half of each action list a [`Policy::Shape`] keeps; used to stage
/// rollouts across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    First,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Identity: keep create, update, and delete as computed.
    Sync,
    /// Drop `delete`.
    UpsertOnly,
    /// Drop `delete`, `update_old`, and `update_new`.
    CreateOnly,
    /// Limit each action list to its first/last half, for staged rollouts.
    Shape(Half),
}

impl Policy {
    pub fn apply(&self, mut changes: Changes) -> Changes {
        match self {
            Policy::Sync => changes,
            Policy::UpsertOnly => {
                changes.delete.clear();
                changes
            }
            Policy::CreateOnly => {
                changes.delete.clear();
                changes.update_old.clear();
                changes.update_new.clear();
                changes
            }
            Policy::Shape(half) => {
                changes.create = take_half(changes.create, *half);
                let pairs = changes.update_old.len();
                let kept: Vec<usize> = half_indices(pairs, *half);
                changes.update_old = select(changes.update_old, &kept);
                changes.update_new = select(changes.update_new, &kept);
                changes.delete = take_half(changes.delete, *half);
                changes
            }
        }
    }
}

fn half_indices(len: usize, half: Half) -> Vec<usize> {
    let mid = len.div_ceil(2);
    match half {
        Half::First => (0..mid).collect(),
        Half::Last => (mid..len).collect(),
    }
}

fn take_half<T>(items: Vec<T>, half: Half) -> Vec<T> {
    let keep = half_indices(items.len(), half);
    select(items, &keep)
}

fn select<T>(items: Vec<T>, indices: &[usize]) -> Vec<T> {
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| indices.contains(i))
        .map(|(_, v)| v)
        .collect()
}

/// Apply a sequence of policies in order (spec.md §4.D step 5).
pub fn apply_all(policies: &[Policy], changes: Changes) -> Changes {
    policies.iter().fold(changes, |c, p| p.apply(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, RecordType};

    fn ep(name: &str) -> Endpoint {
        Endpoint::new(name, RecordType::A, vec!["1.1.1.1".to_string()])
    }

    #[test]
    fn sync_is_identity() {
        let changes = Changes {
            create: vec![ep("a")],
            delete: vec![ep("b")],
            ..Default::default()
        };
        let out = Policy::Sync.apply(changes.clone());
        assert_eq!(out, changes);
    }

    #[test]
    fn upsert_only_drops_delete() {
        let changes = Changes {
            create: vec![ep("a")],
            delete: vec![ep("b")],
            ..Default::default()
        };
        let out = Policy::UpsertOnly.apply(changes);
        assert!(out.delete.is_empty());
        assert_eq!(out.create.len(), 1);
    }

    #[test]
    fn create_only_drops_delete_and_updates() {
        let changes = Changes {
            create: vec![ep("a")],
            update_old: vec![ep("b")],
            update_new: vec![ep("b")],
            delete: vec![ep("c")],
        };
        let out = Policy::CreateOnly.apply(changes);
        assert!(out.delete.is_empty());
        assert!(out.update_old.is_empty());
        assert!(out.update_new.is_empty());
        assert_eq!(out.create.len(), 1);
    }

    #[test]
    fn shape_keeps_paired_update_indices() {
        let changes = Changes {
            update_old: vec![ep("a"), ep("b"), ep("c")],
            update_new: vec![ep("a2"), ep("b2"), ep("c2")],
            ..Default::default()
        };
        let out = Policy::Shape(Half::First).apply(changes);
        assert_eq!(out.update_old.len(), out.update_new.len());
        assert_eq!(out.update_old[0].dns_name, "a");
        assert_eq!(out.update_new[0].dns_name, "a2");
    }
}
