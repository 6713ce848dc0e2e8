//! Human-entered verification codes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Sms,
    Captcha,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Sms => "sms",
            CodeKind::Captcha => "captcha",
        }
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sms" => Ok(CodeKind::Sms),
            "captcha" => Ok(CodeKind::Captcha),
            other => Err(format!("unknown code kind '{other}'")),
        }
    }
}

/// A pending wait for one code. At most one exists per (subject, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub subject: String,
    pub kind: CodeKind,
    pub created_at: DateTime<Utc>,
    /// Set once a waiter attaches.
    pub timeout_at: Option<DateTime<Utc>>,
}

/// A code published by an operator. Consumed by exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMessage {
    pub subject: String,
    pub kind: CodeKind,
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

/// Channel name for a (subject, kind) pair: `codes:{subject}:{kind}`.
///
/// Characters outside `[A-Za-z0-9@._-]` in the subject are replaced with `_`.
pub fn channel_name(subject: &str, kind: CodeKind) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("codes:{sanitized}:{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("user1", CodeKind::Sms, "codes:user1:sms")]
    #[case::email("ops@example.ru", CodeKind::Captcha, "codes:ops@example.ru:captcha")]
    #[case::spaces_and_colons("a b:c", CodeKind::Sms, "codes:a_b_c:sms")]
    #[case::cyrillic("оператор", CodeKind::Sms, "codes:________:sms")]
    fn channel_names_are_sanitized(
        #[case] subject: &str,
        #[case] kind: CodeKind,
        #[case] expected: &str,
    ) {
        assert_eq!(channel_name(subject, kind), expected);
    }

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!("SMS".parse::<CodeKind>().unwrap(), CodeKind::Sms);
        assert_eq!("captcha".parse::<CodeKind>().unwrap(), CodeKind::Captcha);
        assert!("email".parse::<CodeKind>().is_err());
    }
}
