//! Display ordering of the transfer list
//!
//! Active transfers sit at the front, most recently activated first.
//! Failed and canceled ones sit right after the active block. Queued and
//! complete transfers keep their place.

use super::item::TransferState;

/// Where the item at `index` should move, or `None` to leave it.
///
/// The returned position applies after the item has been removed from
/// the list.
pub(crate) fn target_position(states: &[TransferState], index: usize) -> Option<usize> {
    let state = states.get(index)?;

    let target = if state.is_active() {
        0
    } else if state.is_retryable() {
        let last_active = states
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != index && s.is_active())
            .map(|(i, _)| i)
            .last();
        match last_active {
            // Indices past `index` shift down by one once it is removed
            Some(last) if last > index => last,
            Some(last) => last + 1,
            None => 0,
        }
    } else {
        return None;
    };

    (target != index).then_some(target)
}

/// Move the item at `index` according to `target_position`
pub(crate) fn reposition<T>(items: &mut Vec<T>, states: &[TransferState], index: usize) -> bool {
    match target_position(states, index) {
        Some(target) if index < items.len() => {
            let item = items.remove(index);
            items.insert(target.min(items.len()), item);
            true
        }
        _ => false,
    }
}
