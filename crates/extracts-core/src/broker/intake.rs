//! Inbound code delivery: raw operator input in, published code out.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::CodeBroker;
use crate::domain::CodeKind;

static SMS_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid regex literal"));

/// Pull the code out of raw input.
///
/// SMS bodies contribute their first run of digits ("Код: 482913" -> "482913").
/// CAPTCHA answers are taken verbatim, minus surrounding whitespace.
pub fn extract_code(kind: CodeKind, raw: &str) -> Option<String> {
    match kind {
        CodeKind::Sms => SMS_DIGITS.find(raw).map(|m| m.as_str().to_string()),
        CodeKind::Captcha => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// 0 or 1.
    pub recipients: usize,
    pub success: bool,
    /// Extracted code, if any.
    pub code: Option<String>,
}

/// Endpoint operators (or an SMS gateway) call to hand in codes.
#[derive(Clone)]
pub struct CodeIntake {
    broker: Arc<CodeBroker>,
}

impl CodeIntake {
    pub fn new(broker: Arc<CodeBroker>) -> Self {
        Self { broker }
    }

    pub fn deliver(&self, subject: &str, kind: CodeKind, raw: &str) -> DeliveryReceipt {
        let Some(code) = extract_code(kind, raw) else {
            tracing::warn!(subject, %kind, "no code found in delivered text");
            return DeliveryReceipt {
                recipients: 0,
                success: false,
                code: None,
            };
        };
        let recipients = self.broker.publish(subject, kind, &code);
        tracing::info!(subject, %kind, recipients, "code delivered");
        DeliveryReceipt {
            recipients,
            success: true,
            code: Some(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ports::SystemClock;
    use rstest::rstest;

    #[rstest]
    #[case::bare("482913", Some("482913"))]
    #[case::sms_body("Код подтверждения: 482913. Никому не сообщайте", Some("482913"))]
    #[case::first_run_wins("12 then 345", Some("12"))]
    #[case::no_digits("hello", None)]
    fn sms_extraction(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(extract_code(CodeKind::Sms, raw).as_deref(), expected);
    }

    #[rstest]
    #[case::verbatim(" aB3x9 ", Some("aB3x9"))]
    #[case::keeps_digits_and_letters("12 ab", Some("12 ab"))]
    #[case::blank("   ", None)]
    fn captcha_extraction(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(extract_code(CodeKind::Captcha, raw).as_deref(), expected);
    }

    #[tokio::test]
    async fn delivery_reports_recipients() {
        let broker = Arc::new(CodeBroker::new(Arc::new(SystemClock)));
        let intake = CodeIntake::new(Arc::clone(&broker));

        let receipt = intake.deliver("user1", CodeKind::Sms, "Code 482913");
        assert_eq!(receipt.recipients, 0);
        assert!(receipt.success);

        broker.subscribe("user1", CodeKind::Sms).unwrap();
        let receipt = intake.deliver("user1", CodeKind::Sms, "Code 482913");
        assert_eq!(receipt.recipients, 1);
        assert_eq!(receipt.code.as_deref(), Some("482913"));

        let code = broker
            .wait_for_code("user1", CodeKind::Sms, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(code, "482913");
    }

    #[tokio::test]
    async fn text_without_a_code_is_not_published() {
        let broker = Arc::new(CodeBroker::new(Arc::new(SystemClock)));
        broker.subscribe("user1", CodeKind::Sms).unwrap();
        let receipt = CodeIntake::new(Arc::clone(&broker)).deliver("user1", CodeKind::Sms, "no code");
        assert!(!receipt.success);
        assert!(broker.is_subscribed("user1", CodeKind::Sms));
    }
}
