//! Message classification.
//!
//! The [`Classifier`] trait is the seam for whatever assigns an
//! [`EmailLabel`] to a message. [`KeywordClassifier`] is a rule-based
//! implementation used when no external classifier is wired in.

use async_trait::async_trait;

use crate::domain::{EmailLabel, NormalizedMessage};

/// Number of body characters inspected by classifiers.
pub const BODY_SAMPLE_CHARS: usize = 1000;

/// Assigns a label to a message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies one message.
    async fn classify(&self, message: &NormalizedMessage) -> anyhow::Result<EmailLabel>;
}

/// Phrase rules, checked in order. The first label with a matching phrase wins.
const RULES: &[(EmailLabel, &[&str])] = &[
    (
        EmailLabel::OutOfOffice,
        &["out of office", "out of the office", "automatic reply", "auto-reply", "on vacation"],
    ),
    (
        EmailLabel::MeetingBooked,
        &["booked the meeting", "meeting scheduled", "meeting confirmed", "invitation:", "see you then"],
    ),
    (
        EmailLabel::Spam,
        &["you've won", "claim your prize", "click here", "unsubscribe now", "act now"],
    ),
    (
        EmailLabel::NotInterested,
        &["not interested", "not looking", "no longer interested", "remove me"],
    ),
    (
        EmailLabel::Interested,
        &["interested", "schedule a call", "book a demo", "pricing", "tell me more"],
    ),
];

/// Classifies by matching known phrases in the subject and body.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Returns the label for the given subject and body text.
    pub fn label_for(subject: &str, body: &str) -> EmailLabel {
        let sample: String = body.chars().take(BODY_SAMPLE_CHARS).collect();
        let haystack = format!("{}\n{}", subject, sample).to_lowercase();

        RULES
            .iter()
            .find(|(_, phrases)| phrases.iter().any(|p| haystack.contains(p)))
            .map(|(label, _)| *label)
            .unwrap_or(EmailLabel::NotInterested)
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, message: &NormalizedMessage) -> anyhow::Result<EmailLabel> {
        Ok(Self::label_for(&message.subject, &message.body_text))
    }
}
