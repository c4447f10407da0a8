//! Small helpers shared across the engine: key derivation, state label
//! validation, and deterministic identifiers.

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

lazy_static! {
    static ref STATE_LABEL: Regex = Regex::new(r"^[A-Z][A-Z\d_]*$").expect("valid regex");
    static ref DECLARED_KEY: Regex = Regex::new(r"^[a-z][a-z\d_-]*$").expect("valid regex");
}

/// Returns true when `label` is an upper-case state token such as `IN_REVIEW`.
pub fn is_state_label(label: &str) -> bool {
    STATE_LABEL.is_match(label)
}

/// Returns true for stage, role and step keys such as `credit-check`.
///
/// Keys never contain `:` or `#`, which [`scoped_id`] names use as separators.
pub fn is_declared_key(key: &str) -> bool {
    DECLARED_KEY.is_match(key)
}

/// Kebab-case a display title: `"Loan Application"` and `"LoanApplication"`
/// both become `"loan-application"`.
pub fn kebab_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower && !out.ends_with('-') {
                out.push('-');
            }
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch.to_ascii_lowercase());
        } else {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            prev_lower = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Deterministic id for a record scoped to a workflow instance.
pub fn scoped_id(workflow_id: &Uuid, name: &str) -> Uuid {
    Uuid::new_v5(workflow_id, name.as_bytes())
}
