//! Repeated-call detection within one turn
//!
//! Independent of the iteration bound: that one catches slow drift,
//! this one catches the oracle asking for the same thing again and again.

use crate::models::call_signature;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug)]
pub struct LoopGuard {
    max_repeats: u32,
    seen: HashMap<String, u32>,
}

impl LoopGuard {
    pub fn new(max_repeats: u32) -> Self {
        Self {
            max_repeats,
            seen: HashMap::new(),
        }
    }

    /// Record a whole batch of requests, or return the first signature
    /// that would exceed the allowed repeats. A rejected batch records
    /// nothing.
    pub fn admit<'a, I>(&mut self, requests: I) -> std::result::Result<(), String>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut pending: Vec<(String, u32)> = Vec::new();

        for (name, params) in requests {
            let signature = call_signature(name, params);
            let already = self.seen.get(&signature).copied().unwrap_or(0);
            let count = match pending.iter_mut().find(|(s, _)| *s == signature) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.1
                }
                None => {
                    pending.push((signature.clone(), already + 1));
                    already + 1
                }
            };
            if count > self.max_repeats {
                return Err(signature);
            }
        }

        for (signature, count) in pending {
            self.seen.insert(signature, count);
        }
        Ok(())
    }

    pub fn count(&self, name: &str, params: &Value) -> u32 {
        self.seen
            .get(&call_signature(name, params))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_third_identical_request_trips() {
        let mut guard = LoopGuard::new(2);
        let params = json!({"order_id": "ORD-1"});

        assert!(guard.admit([("order_lookup", &params)]).is_ok());
        assert!(guard.admit([("order_lookup", &params)]).is_ok());
        let tripped = guard.admit([("order_lookup", &params)]).unwrap_err();
        assert!(tripped.starts_with("order_lookup("));
        assert_eq!(guard.count("order_lookup", &params), 2);
    }

    #[test]
    fn test_duplicates_inside_one_batch_count() {
        let mut guard = LoopGuard::new(2);
        let params = json!({"order_id": "ORD-1"});
        let other = json!({"order_id": "ORD-2"});

        assert!(guard
            .admit([("order_lookup", &params), ("order_lookup", &params), ("order_lookup", &params)])
            .is_err());
        // rejected batch left no trace
        assert_eq!(guard.count("order_lookup", &params), 0);
        assert!(guard.admit([("order_lookup", &params), ("order_lookup", &other)]).is_ok());
    }
}
