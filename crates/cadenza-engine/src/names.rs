//! Unique plugin names.
//!
//! Plugin names double as patchbay group names, so they must be unique and
//! must not contain the characters used to build full port names.

/// Longest name kept before a `" (N)"` suffix is added.
pub const MAX_PLUGIN_NAME_LENGTH: usize = 121;

const NO_NAME: &str = "(No name)";

/// Return `name`, sanitized and disambiguated against `existing`.
///
/// A colliding name gets a `" (2)"` suffix; a name that already ends in a
/// one or two digit suffix has that number incremented instead (`" (9)"`
/// becomes `" (10)"`). The lookup restarts after every change, so the result
/// never collides with any entry of `existing`.
pub fn unique_plugin_name<S: AsRef<str>>(name: &str, existing: &[S]) -> String {
    let name = if name.is_empty() { NO_NAME } else { name };
    let mut candidate = truncate(name, MAX_PLUGIN_NAME_LENGTH).replace([':', '/'], ".");

    while existing.iter().any(|other| other.as_ref() == candidate) {
        candidate = bump_suffix(&candidate);
    }
    candidate
}

fn truncate(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Next candidate after `name` collided.
fn bump_suffix(name: &str) -> String {
    let bytes = name.as_bytes();
    let len = bytes.len();

    // "name (N)"
    if len >= 5
        && bytes[len - 4] == b' '
        && bytes[len - 3] == b'('
        && bytes[len - 2].is_ascii_digit()
        && bytes[len - 1] == b')'
    {
        let number = bytes[len - 2] - b'0';
        let base = &name[..len - 4];
        return if number == 9 {
            format!("{base} (10)")
        } else {
            format!("{base} ({})", number + 1)
        };
    }

    // "name (NN)"
    if len >= 6
        && bytes[len - 5] == b' '
        && bytes[len - 4] == b'('
        && bytes[len - 3].is_ascii_digit()
        && bytes[len - 2].is_ascii_digit()
        && bytes[len - 1] == b')'
    {
        let (mut tens, mut units) = (bytes[len - 3] - b'0', bytes[len - 2] - b'0');
        if units == 9 {
            units = 0;
            tens += 1;
        } else {
            units += 1;
        }
        if tens <= 9 {
            let base = &name[..len - 5];
            return format!("{base} ({tens}{units})");
        }
    }

    format!("{name} (2)")
}
