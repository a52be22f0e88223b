//! `{{name}}` placeholder substitution.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::core::utils::normalize_identifier;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("placeholder pattern"));

/// Renders `template`, replacing every `{{name}}` found in `vars`.
///
/// Unknown names are left in place as literal placeholders. With
/// `identifier_casing`, names are normalized before lookup; the keys of
/// `vars` must already be normalized the same way.
pub fn resolve(template: &str, vars: &HashMap<String, String>, identifier_casing: bool) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let raw = &caps[1];
            let value = if identifier_casing {
                vars.get(&normalize_identifier(raw))
            } else {
                vars.get(raw)
            };
            match value {
                Some(v) => v.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
