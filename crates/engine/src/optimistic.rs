use std::collections::HashMap;
use std::hash::Hash;

use parley_protocol::{MessageId, Reaction};

/// Monotonic id of one optimistic action. Never reset, not even by `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct OverlayEntry<V> {
    value: V,
    ticket: Ticket,
}

/// Receipt of an applied action, handed back when persistence resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending<K, V> {
    pub key: K,
    pub value: V,
    /// Effective value immediately before this action.
    pub previous: V,
    previous_from_base: bool,
    ticket: Ticket,
}

impl<K, V> Pending<K, V> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<V, T, E> {
    /// Latest action for the key succeeded; fold `value` into the base state.
    Committed { value: V, confirmed: T },
    /// Succeeded, but a newer action for the same key is still in charge.
    Superseded { confirmed: T },
    /// Failed; the overlay shows `restored` again.
    Reverted { restored: V, error: E },
}

/// Optimistic values layered over a base state the overlay does not own.
///
/// The cycle is: `apply` writes the new value before any I/O, the caller
/// persists, then `settle` either hands the value over to the base state or
/// rolls the overlay back to what was shown right before the action.
#[derive(Debug)]
pub struct OptimisticOverlay<K, V> {
    entries: HashMap<K, OverlayEntry<V>>,
    next_ticket: u64,
}

impl<K, V> Default for OptimisticOverlay<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_ticket: 0,
        }
    }
}

impl<K, V> OptimisticOverlay<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Overlay value if present, else the caller's base value.
    pub fn effective(&self, key: &K, base: V) -> V {
        self.get(key).cloned().unwrap_or(base)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn apply(&mut self, key: K, value: V, base: V) -> Pending<K, V> {
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        let (previous, previous_from_base) = match self.entries.get(&key) {
            Some(entry) => (entry.value.clone(), false),
            None => (base, true),
        };

        self.entries.insert(
            key.clone(),
            OverlayEntry {
                value: value.clone(),
                ticket,
            },
        );

        Pending {
            key,
            value,
            previous,
            previous_from_base,
            ticket,
        }
    }

    pub fn settle<T, E>(&mut self, pending: &Pending<K, V>, result: Result<T, E>) -> Settlement<V, T, E> {
        match result {
            Ok(confirmed) => {
                let latest = self
                    .entries
                    .get(&pending.key)
                    .is_some_and(|entry| entry.ticket == pending.ticket);
                if !latest {
                    return Settlement::Superseded { confirmed };
                }
                self.entries.remove(&pending.key);
                Settlement::Committed {
                    value: pending.value.clone(),
                    confirmed,
                }
            }
            Err(error) => {
                let drop_entry = match self.entries.get_mut(&pending.key) {
                    Some(entry) if entry.ticket == pending.ticket && pending.previous_from_base => {
                        true
                    }
                    Some(entry) => {
                        entry.value = pending.previous.clone();
                        false
                    }
                    None => false,
                };
                if drop_entry {
                    self.entries.remove(&pending.key);
                }
                Settlement::Reverted {
                    restored: pending.previous.clone(),
                    error,
                }
            }
        }
    }
}

pub type ReactionOverlay = OptimisticOverlay<MessageId, Option<Reaction>>;

/// Clicking the active reaction clears it; anything else selects it.
pub fn toggle_target(effective: Option<Reaction>, requested: Reaction) -> Option<Reaction> {
    if effective == Some(requested) {
        None
    } else {
        Some(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> MessageId {
        MessageId::new(raw)
    }

    #[test]
    fn toggle_clears_matching_and_sets_otherwise() {
        assert_eq!(toggle_target(Some(Reaction::Like), Reaction::Like), None);
        assert_eq!(
            toggle_target(Some(Reaction::Like), Reaction::Dislike),
            Some(Reaction::Dislike)
        );
        assert_eq!(toggle_target(None, Reaction::Like), Some(Reaction::Like));
    }

    #[test]
    fn commit_hands_value_to_base_and_drops_entry() {
        let mut overlay = ReactionOverlay::new();
        let pending = overlay.apply(id("a1"), Some(Reaction::Like), None);
        assert_eq!(overlay.get(&id("a1")), Some(&Some(Reaction::Like)));

        let settlement = overlay.settle::<_, ()>(&pending, Ok("stored"));
        assert_eq!(
            settlement,
            Settlement::Committed {
                value: Some(Reaction::Like),
                confirmed: "stored"
            }
        );
        assert!(overlay.is_empty());
    }

    #[test]
    fn failure_reverts_to_value_before_the_action_despite_newer_toggle() {
        let mut overlay = ReactionOverlay::new();
        let first = overlay.apply(id("a1"), Some(Reaction::Like), None);
        let second = overlay.apply(id("a1"), None, None);
        assert_eq!(second.previous, Some(Reaction::Like));

        let settlement = overlay.settle::<(), _>(&first, Err("offline"));
        assert_eq!(
            settlement,
            Settlement::Reverted {
                restored: None,
                error: "offline"
            }
        );
        assert_eq!(overlay.effective(&id("a1"), Some(Reaction::Dislike)), None);

        let settlement = overlay.settle::<_, ()>(&second, Ok(()));
        assert!(matches!(settlement, Settlement::Committed { value: None, .. }));
        assert!(overlay.is_empty());
    }

    #[test]
    fn older_success_is_superseded_by_newer_action() {
        let mut overlay = ReactionOverlay::new();
        let first = overlay.apply(id("a1"), Some(Reaction::Like), None);
        let _second = overlay.apply(id("a1"), Some(Reaction::Dislike), None);

        let settlement = overlay.settle::<_, ()>(&first, Ok(()));
        assert_eq!(settlement, Settlement::Superseded { confirmed: () });
        assert_eq!(overlay.get(&id("a1")), Some(&Some(Reaction::Dislike)));
    }

    #[test]
    fn failed_sole_action_falls_back_to_base() {
        let mut overlay = OptimisticOverlay::<u32, &str>::new();
        let pending = overlay.apply(7, "draft", "saved");
        overlay.settle::<(), _>(&pending, Err(()));

        assert!(overlay.is_empty());
        assert_eq!(overlay.effective(&7, "saved"), "saved");
    }

    #[test]
    fn settling_after_clear_changes_nothing() {
        let mut overlay = ReactionOverlay::new();
        let pending = overlay.apply(id("a1"), Some(Reaction::Like), None);
        overlay.clear();

        assert!(matches!(
            overlay.settle::<_, ()>(&pending, Ok(())),
            Settlement::Superseded { .. }
        ));
        assert!(overlay.is_empty());
    }
}
