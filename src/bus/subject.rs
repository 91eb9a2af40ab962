//! Hierarchical subject names and wildcard pattern matching.
//!
//! Subjects are dot-separated token paths (`iot.data.sensor-1.temperature`).
//! Subscription patterns may use `*` to match exactly one token and `>` to
//! match one or more trailing tokens. `>` is only legal as the final token.

/// Check that a concrete (publish) subject is well formed: non-empty tokens,
/// no wildcard characters.
pub fn valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|tok| !tok.is_empty() && tok != "*" && tok != ">" && !tok.contains(char::is_whitespace))
}

/// Check that a subscription pattern is well formed. `>` must be last.
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, tok) in tokens.iter().enumerate() {
        if tok.is_empty() || tok.contains(char::is_whitespace) {
            return false;
        }
        if *tok == ">" && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

/// Token-wise wildcard match of `subject` against `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(subject_matches("iot.data.dev.temp", "iot.data.dev.temp"));
        assert!(!subject_matches("iot.data.dev.temp", "iot.data.dev.rpm"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("iot.data.*.temp", "iot.data.dev.temp"));
        assert!(!subject_matches("iot.data.*.temp", "iot.data.a.b.temp"));
        assert!(!subject_matches("iot.data.*", "iot.data"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("iot.data.>", "iot.data.dev.temp"));
        assert!(subject_matches("iot.data.>", "iot.data.dev"));
        // `>` requires at least one more token
        assert!(!subject_matches("iot.data.>", "iot.data"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[test]
    fn pattern_validation() {
        assert!(valid_pattern("iot.data.>"));
        assert!(valid_pattern("iot.*.x"));
        assert!(!valid_pattern("iot.>.x"));
        assert!(!valid_pattern("iot..x"));
        assert!(!valid_pattern(""));
    }

    #[test]
    fn subject_validation() {
        assert!(valid_subject("iot.data.dev.temp"));
        assert!(!valid_subject("iot.data.*.temp"));
        assert!(!valid_subject("iot.data..temp"));
        assert!(!valid_subject("iot.da ta"));
    }
}
