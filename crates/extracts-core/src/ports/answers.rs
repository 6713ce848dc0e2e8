//! Answer Store for anomaly ("prove you are human") questions.

use async_trait::async_trait;

use super::RepositoryError;

/// Canonical key form of a question: lowercase, whitespace collapsed, trimmed.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Keyed by normalized question text plus subject.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    /// Answer for `question` asked of `subject`, if an operator has provided one.
    ///
    /// An unknown question is recorded as unanswered so operators can fill it in.
    async fn lookup(&self, question: &str, subject: &str) -> Result<Option<String>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_question("  Как  зовут\tВашу\nсобаку? "),
            "как зовут вашу собаку?"
        );
        assert_eq!(normalize_question("What   IS your PET?"), "what is your pet?");
    }
}
