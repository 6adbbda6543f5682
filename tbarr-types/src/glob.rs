//! POSIX-style glob matching for include/exclude source globs (§4.4) and
//! catalog wildcard path search (§4.3).
//!
//! `*` matches within a path component, `**` matches across components
//! (including zero components), `?` matches a single character, and `/`
//! is always a literal component separator -- it is never produced by `*`
//! or `?`.

/// Returns true if `path` matches `pattern` under the semantics above.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_components(&pattern, &path)
}

fn match_components(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            if pattern.len() == 1 {
                return true;
            }
            // `**` may consume zero or more path components.
            for skip in 0..=path.len() {
                if match_components(&pattern[1..], &path[skip..]) {
                    return true;
                }
            }
            false
        }
        Some(head) => {
            if path.is_empty() {
                return false;
            }
            component_match(head, path[0]) && match_components(&pattern[1..], &path[1..])
        }
    }
}

/// Matches a single path component against a pattern component containing
/// `*` and `?` wildcards (no `/`, since components never contain it).
fn component_match(pattern: &str, component: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let component: Vec<char> = component.chars().collect();
    component_match_inner(&pattern, &component)
}

fn component_match_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            for skip in 0..=text.len() {
                if component_match_inner(&pattern[1..], &text[skip..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => !text.is_empty() && component_match_inner(&pattern[1..], &text[1..]),
        Some(c) => {
            !text.is_empty() && text[0] == *c && component_match_inner(&pattern[1..], &text[1..])
        }
    }
}

/// True if `path` matches any pattern in `includes` (or `includes` is
/// empty), and no pattern in `excludes`, per the ordered include-then-exclude
/// rule of §4.4.
pub fn passes_filters(path: &str, includes: &[String], excludes: &[String]) -> bool {
    let included = includes.is_empty() || includes.iter().any(|p| glob_match(p, path));
    if !included {
        return false;
    }
    !excludes.iter().any(|p| glob_match(p, path))
}

/// Translates a `*`/`?` glob into a SQL `LIKE` pattern, escaping existing
/// `%`, `_`, and the escape character itself. Used by the catalog's
/// substring/wildcard path search (§4.3), which has no use for `**`
/// (catalog paths are flat relative paths, not filtered by directory
/// depth).
pub fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '*' => out.push('%'),
            '?' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}
