//! Lightweight signals read from the raw user input
//!
//! Only identifiers and coarse intents; understanding the request is
//! the oracle's job.

use crate::session::ProcessKind;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ORDER_ID: Regex = Regex::new(r"(?i)\bORD[-_]?(\d+)\b").unwrap();
    static ref ORDER_ID_EXACT: Regex = Regex::new(r"(?i)^ORD[-_]?(\d+)$").unwrap();
    /// "order number 12345", "order no. 12345", "order #12345", "order number is 12345"
    static ref ORDER_NUMBER: Regex =
        Regex::new(r"(?i)\border\s*(?:number|no\.?|#|id)\s*(?:is\s+|:\s*)?#?(\d+)\b").unwrap();
    /// Whole phrases only, never the bare verb
    static ref CANCELLATION: Regex = Regex::new(
        r"(?i)\b(?:cancel\s+(?:that|this)|never\s*mind|changed\s+my\s+mind|don'?t\s+want|forget\s+it)\b"
    )
    .unwrap();
    static ref TRACKING: Regex =
        Regex::new(r"(?i)\btrack|\bwhere\s+is\b|\bwhere's\s+my\b|\border\s+status\b").unwrap();
    static ref RETURN: Regex = Regex::new(r"(?i)\breturn").unwrap();
    static ref REFUND: Regex = Regex::new(r"(?i)\brefund").unwrap();
    static ref REPLACEMENT: Regex = Regex::new(r"(?i)\breplac").unwrap();
    /// Six digits not glued to an id prefix such as `ORD-`
    static ref VERIFICATION_CODE: Regex = Regex::new(r"(?:^|[^\w-])(\d{6})\b").unwrap();
    static ref EMAIL: Regex =
        Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap();
}

/// Canonical `ORD-<digits>` form of an id written as `ORD-1`, `ord_1`
/// or `ORD1`. `None` when `raw` is not an order id as a whole.
pub fn normalize_order_id(raw: &str) -> Option<String> {
    ORDER_ID_EXACT
        .captures(raw.trim())
        .map(|caps| format!("ORD-{}", &caps[1]))
}

/// First order id mentioned anywhere in `text`, in either the `ORD-`
/// form or spelled out as an order number
pub fn find_order_id(text: &str) -> Option<String> {
    let prefixed = ORDER_ID.captures(text);
    let spelled = ORDER_NUMBER.captures(text);

    let caps = match (prefixed, spelled) {
        (Some(a), Some(b)) => {
            if a.get(0).map(|m| m.start()) <= b.get(0).map(|m| m.start()) {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some(format!("ORD-{}", &caps[1]))
}

pub fn is_cancellation(text: &str) -> bool {
    CANCELLATION.is_match(text)
}

/// Process the user is starting, if the wording says so
pub fn detect_process(text: &str) -> Option<ProcessKind> {
    if RETURN.is_match(text) {
        Some(ProcessKind::Return)
    } else if REFUND.is_match(text) {
        Some(ProcessKind::Refund)
    } else if REPLACEMENT.is_match(text) {
        Some(ProcessKind::Replacement)
    } else if TRACKING.is_match(text) {
        Some(ProcessKind::Tracking)
    } else {
        None
    }
}

/// A standalone six-digit token, as typed when reading back a code
pub fn find_verification_code(text: &str) -> Option<String> {
    VERIFICATION_CODE
        .captures(text)
        .map(|caps| caps[1].to_string())
}

pub fn find_email(text: &str) -> Option<String> {
    EMAIL
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|candidate| crate::capabilities::is_plausible_email(candidate))
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSignals {
    pub order_id: Option<String>,
    pub process: Option<ProcessKind>,
    pub cancel: bool,
}

pub fn analyze(text: &str) -> InputSignals {
    let cancel = is_cancellation(text);
    InputSignals {
        order_id: find_order_id(text),
        process: if cancel { None } else { detect_process(text) },
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_forms() {
        assert_eq!(find_order_id("where is ORD-12345?"), Some("ORD-12345".to_string()));
        assert_eq!(find_order_id("order ord_777 please"), Some("ORD-777".to_string()));
        assert_eq!(find_order_id("my ORDER ORD42 is late"), Some("ORD-42".to_string()));
        assert_eq!(find_order_id("ordinary words only"), None);
        assert_eq!(normalize_order_id(" ord12345 "), Some("ORD-12345".to_string()));
        assert_eq!(normalize_order_id("ORD-12a"), None);
    }

    #[test]
    fn test_spelled_out_order_number() {
        assert_eq!(
            find_order_id("my order number 12345 is late"),
            Some("ORD-12345".to_string())
        );
        assert_eq!(find_order_id("my order number is 12345"), Some("ORD-12345".to_string()));
        assert_eq!(find_order_id("Order #555 never arrived"), Some("ORD-555".to_string()));
        assert_eq!(find_order_id("order no. 77, please"), Some("ORD-77".to_string()));
    }

    #[test]
    fn test_order_id_needs_word_boundary() {
        assert_eq!(find_order_id("see RECORD5"), None);
        assert_eq!(find_order_id("BORD-12 and ORD-9X"), None);
        assert_eq!(find_order_id("see RECORD5, then ORD-8"), Some("ORD-8".to_string()));
    }

    #[test]
    fn test_process_detection() {
        assert_eq!(detect_process("I want to return this"), Some(ProcessKind::Return));
        assert_eq!(detect_process("refund please"), Some(ProcessKind::Refund));
        assert_eq!(detect_process("can you replace it"), Some(ProcessKind::Replacement));
        assert_eq!(detect_process("track my order"), Some(ProcessKind::Tracking));
        assert_eq!(detect_process("hello"), None);
    }

    #[test]
    fn test_cancellation_suppresses_process() {
        let signals = analyze("never mind, cancel the return for ORD-1");
        assert!(signals.cancel);
        assert_eq!(signals.process, None);
        assert_eq!(signals.order_id, Some("ORD-1".to_string()));
    }

    #[test]
    fn test_cancelling_an_order_is_not_a_change_of_mind() {
        let signals = analyze("can I cancel my order ORD-1 and get a refund");
        assert!(!signals.cancel);
        assert_eq!(signals.process, Some(ProcessKind::Refund));

        assert!(is_cancellation("cancel that please"));
        assert!(is_cancellation("I changed my mind"));
        assert!(is_cancellation("I don't want it anymore"));
    }

    #[test]
    fn test_code_and_email() {
        assert_eq!(find_verification_code("my code is 482913."), Some("482913".to_string()));
        assert_eq!(find_verification_code("482913"), Some("482913".to_string()));
        assert_eq!(find_verification_code("ORD-123456"), None);
        assert_eq!(find_verification_code("1234567"), None);
        assert_eq!(
            find_email("it's Jane.Doe@Example.com, thanks"),
            Some("jane.doe@example.com".to_string())
        );
    }
}
