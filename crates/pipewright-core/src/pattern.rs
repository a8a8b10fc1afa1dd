//! Glob matching for branch and ref filters.
//!
//! `*` matches any run of characters except `/`, `**` matches any run
//! including `/`, `?` matches one character other than `/`.

pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

/// True when any pattern matches. An empty pattern list matches everything.
pub fn any_match(patterns: &[String], text: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| glob_match(p, text))
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            let (deep, rest) = if pattern.get(1) == Some(&'*') {
                (true, &pattern[2..])
            } else {
                (false, &pattern[1..])
            };
            for i in 0..=text.len() {
                if match_from(rest, &text[i..]) {
                    return true;
                }
                if i < text.len() && !deep && text[i] == '/' {
                    return false;
                }
            }
            false
        }
        Some('?') => {
            matches!(text.first(), Some(c) if *c != '/') && match_from(&pattern[1..], &text[1..])
        }
        Some(c) => text.first() == Some(c) && match_from(&pattern[1..], &text[1..]),
    }
}
