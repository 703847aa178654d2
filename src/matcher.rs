//! Token matcher for negative rules.
//!
//! A pattern is a set of tokens separated by whitespace or `+`. An article
//! matches when every token appears, case-insensitively, somewhere in its
//! title, content, domain or URL. Tokens are plain substrings, so `cat`
//! matches `concatenate`.

/// Split a rule pattern into lower-cased tokens.
pub fn tokenize_pattern(pattern: &str) -> Vec<String> {
    pattern
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '+')
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical stored form of a pattern: its tokens joined by single spaces.
pub fn normalize_pattern(pattern: &str) -> String {
    tokenize_pattern(pattern).join(" ")
}

pub fn matches(pattern: &str, title: &str, content: &str, domain: &str, url: &str) -> bool {
    let tokens = tokenize_pattern(pattern);
    if tokens.is_empty() {
        return false;
    }
    let haystack = [title, content, domain, url].join(" ").to_lowercase();
    tokens.iter().all(|tok| haystack.contains(tok.as_str()))
}
