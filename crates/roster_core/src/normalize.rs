//! Text normalization applied before comparing names, usernames and emails.

use unicode_normalization::UnicodeNormalization;

/// Decompose to compatibility form and keep only printable ASCII.
pub fn strip_unicode(value: &str) -> String {
    value
        .nfkd()
        .filter(|ch| (' '..='~').contains(ch))
        .collect()
}
