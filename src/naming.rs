use once_cell::sync::Lazy;
use regex::Regex;

static NON_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").unwrap());
static CAMEL_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());

/// Normalizes a table or column name into lower snake_case.
///
/// Runs of characters outside `[a-z0-9_]` collapse into a single underscore
/// and a leading digit gets an underscore prefix, so any key found in source
/// data maps to a valid SQL identifier.
pub fn normalize_identifier(name: &str) -> String {
    let spaced = CAMEL_BOUNDARY.replace_all(name.trim(), "${1}_${2}");
    let lowered = spaced.to_lowercase();
    let cleaned = NON_IDENT.replace_all(&lowered, "_");
    let cleaned = cleaned.trim_matches('_');
    let mut ident = if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    };
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// Joins a parent table/column path with a nested key, used for flattened
/// object columns and child table names.
pub fn nested_identifier(parent: &str, key: &str) -> String {
    format!("{}__{}", parent, normalize_identifier(key))
}
