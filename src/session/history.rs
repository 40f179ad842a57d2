//! Pairing-aware history window
//!
//! History is a sequence of units: a plain message, or an assistant
//! message declaring calls together with exactly one result per call id.
//! Pruning drops whole units from the front; leading system messages
//! are always kept.

use crate::models::{Message, MessageRole};
use std::collections::HashSet;
use tracing::warn;

/// Index ranges of the units after the leading system messages.
/// Malformed call groups and orphan results are not part of any unit.
fn units(history: &[Message], start: usize) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut i = start;

    while i < history.len() {
        let msg = &history[i];

        if msg.declares_calls() {
            let expected: HashSet<&str> = msg.calls.iter().map(|c| c.call_id.as_str()).collect();
            let mut seen = HashSet::new();
            let mut j = i + 1;
            while j < history.len()
                && history[j].role == MessageRole::CapabilityResult
                && seen.len() < expected.len()
            {
                match history[j].call_id.as_deref() {
                    Some(id) if expected.contains(id) && seen.insert(id) => j += 1,
                    _ => break,
                }
            }

            if seen.len() == expected.len() && expected.len() == msg.calls.len() {
                units.push((i, j));
            } else {
                warn!(position = i, "Dropping incompletely paired call group from history");
                // skip the group and any results that belong to it
                while j < history.len() && history[j].role == MessageRole::CapabilityResult {
                    j += 1;
                }
            }
            i = j;
        } else if msg.role == MessageRole::CapabilityResult {
            warn!(position = i, "Dropping orphan capability result from history");
            i += 1;
        } else {
            units.push((i, i + 1));
            i += 1;
        }
    }

    units
}

fn leading_system_count(history: &[Message]) -> usize {
    history
        .iter()
        .take_while(|m| m.role == MessageRole::System)
        .count()
}

/// Trim `history` in place to at most `cap` messages, never splitting a
/// call/result unit. Returns how many messages were removed.
pub fn prune_history(history: &mut Vec<Message>, cap: usize) -> usize {
    let original = history.len();
    let pinned = leading_system_count(history);
    let units = units(history, pinned);

    let mut budget = cap.saturating_sub(pinned);
    let mut kept: Vec<(usize, usize)> = Vec::new();
    for &(start, end) in units.iter().rev() {
        let size = end - start;
        if size > budget {
            break;
        }
        budget -= size;
        kept.push((start, end));
    }
    kept.reverse();

    let mut retained: Vec<Message> = Vec::with_capacity(cap.min(original));
    retained.extend(history.drain(..pinned));
    let mut rest: Vec<Option<Message>> = history.drain(..).map(Some).collect();
    for (start, end) in kept {
        for slot in &mut rest[start - pinned..end - pinned] {
            if let Some(msg) = slot.take() {
                retained.push(msg);
            }
        }
    }

    *history = retained;
    original - history.len()
}

/// Pruned copy of `history`, as shown to the oracle
pub fn window(history: &[Message], cap: usize) -> Vec<Message> {
    let mut view = history.to_vec();
    prune_history(&mut view, cap);
    view
}

/// Every call group is complete and immediately followed by its results,
/// and no result appears outside a group.
pub fn is_well_paired(history: &[Message]) -> bool {
    let mut i = 0;
    while i < history.len() {
        let msg = &history[i];
        if msg.declares_calls() {
            let mut pending: HashSet<&str> = msg.calls.iter().map(|c| c.call_id.as_str()).collect();
            if pending.len() != msg.calls.len() {
                return false;
            }
            let mut j = i + 1;
            while !pending.is_empty() {
                match history.get(j) {
                    Some(r) if r.role == MessageRole::CapabilityResult => {
                        match r.call_id.as_deref() {
                            Some(id) if pending.remove(id) => j += 1,
                            _ => return false,
                        }
                    }
                    _ => return false,
                }
            }
            i = j;
        } else if msg.role == MessageRole::CapabilityResult {
            return false;
        } else {
            i += 1;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallDescriptor;
    use serde_json::json;

    fn calls(ids: &[&str]) -> Message {
        Message::assistant_calls(
            ids.iter()
                .map(|id| CallDescriptor {
                    call_id: id.to_string(),
                    name: "order_lookup".to_string(),
                    params: json!({"order_id": "ORD-1"}),
                })
                .collect(),
        )
    }

    #[test]
    fn test_prune_keeps_system_and_newest() {
        let mut history = vec![Message::system("be helpful")];
        for i in 0..10 {
            history.push(Message::user(format!("q{}", i)));
            history.push(Message::assistant(format!("a{}", i)));
        }

        let removed = prune_history(&mut history, 5);
        assert_eq!(removed, 16);
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].role, MessageRole::System);
        assert_eq!(history.last().unwrap().content, "a9");
    }

    #[test]
    fn test_prune_drops_whole_pair_at_boundary() {
        let mut history = vec![
            Message::user("track ORD-1"),
            calls(&["c1", "c2"]),
            Message::capability_result("c1", "{}"),
            Message::capability_result("c2", "{}"),
            Message::assistant("shipped"),
        ];

        // the 3-message group does not fit beside the answer, so it goes entirely
        prune_history(&mut history, 3);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "shipped");
        assert!(is_well_paired(&history));

        let mut history = vec![
            Message::user("track ORD-1"),
            calls(&["c1"]),
            Message::capability_result("c1", "{}"),
            Message::assistant("shipped"),
        ];
        prune_history(&mut history, 3);
        assert_eq!(history.len(), 3);
        assert!(history[0].declares_calls());
        assert!(is_well_paired(&history));
    }

    #[test]
    fn test_prune_repairs_malformed_history() {
        let mut history = vec![
            Message::capability_result("ghost", "{}"),
            Message::user("hi"),
            calls(&["c1", "c2"]),
            Message::capability_result("c1", "{}"),
            Message::user("still there?"),
        ];
        assert!(!is_well_paired(&history));

        prune_history(&mut history, 40);
        assert!(is_well_paired(&history));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_pairing_rejects_interleaved_message() {
        let history = vec![
            calls(&["c1"]),
            Message::assistant("too early"),
            Message::capability_result("c1", "{}"),
        ];
        assert!(!is_well_paired(&history));
    }
}
