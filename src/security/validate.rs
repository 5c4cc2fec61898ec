//! Stateless input checks used by the auth and profile handlers.

use std::sync::OnceLock;

use regex::Regex;

/// Shortest password accepted by [`validate_password`]
pub const MIN_PASSWORD_LEN: usize = 8;

/// Characters that satisfy the "special character" password rule
pub const PASSWORD_SPECIALS: &str = "!@#$%^&*(),.?\":{}|<>";

/// Escape characters with meaning in HTML so user input can be echoed
/// back safely.
#[must_use]
pub fn sanitize_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

/// Loose structural email check: `local@domain.tld` without whitespace
#[must_use]
pub fn validate_email(email: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
        .is_match(email)
}

/// Password rule violations, empty when the password is acceptable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordCheck {
    /// One message per failed rule
    pub errors: Vec<String>,
}

impl PasswordCheck {
    /// Whether every rule passed
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check a password against the strength rules
#[must_use]
pub fn validate_password(password: &str) -> PasswordCheck {
    let mut errors = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("Password must contain at least one number".to_string());
    }
    if !password.chars().any(|c| PASSWORD_SPECIALS.contains(c)) {
        errors.push("Password must contain at least one special character".to_string());
    }

    PasswordCheck { errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_escapes_markup() {
        assert_eq!(
            sanitize_input(r#"<script>alert('x')</script>"#),
            "&lt;script&gt;alert(&#x27;x&#x27;)&lt;&#x2F;script&gt;"
        );
    }

    #[test]
    fn sanitize_escapes_ampersand_first() {
        assert_eq!(sanitize_input("a&lt;b"), "a&amp;lt;b");
        assert_eq!(sanitize_input(r#"say "hi""#), "say &quot;hi&quot;");
    }

    #[test]
    fn sanitize_leaves_plain_text() {
        assert_eq!(sanitize_input("BTC 42000"), "BTC 42000");
    }

    #[test]
    fn email_shapes() {
        assert!(validate_email("trader@example.com"));
        assert!(validate_email("a.b+c@sub.example.io"));
        assert!(!validate_email("trader@example"));
        assert!(!validate_email("trader example.com"));
        assert!(!validate_email("tra der@example.com"));
        assert!(!validate_email("@example.com"));
        assert!(!validate_email("a@@example.com"));
    }

    #[test]
    fn strong_password_passes() {
        assert!(validate_password("Hodl2Moon!").is_valid());
    }

    #[test]
    fn weak_password_lists_every_failure() {
        let check = validate_password("abc");
        assert!(!check.is_valid());
        assert_eq!(
            check.errors,
            vec![
                "Password must be at least 8 characters long".to_string(),
                "Password must contain at least one uppercase letter".to_string(),
                "Password must contain at least one number".to_string(),
                "Password must contain at least one special character".to_string(),
            ]
        );
    }

    #[test]
    fn special_character_rule_uses_fixed_set() {
        let check = validate_password("Abcdefg1-");
        assert_eq!(
            check.errors,
            vec!["Password must contain at least one special character".to_string()]
        );
    }
}
