//! Classification labels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category assigned to a message by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmailLabel {
    #[serde(rename = "Interested")]
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    #[serde(rename = "Spam")]
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
}

impl EmailLabel {
    /// All labels, in the order classifiers are asked to choose from.
    pub const ALL: [EmailLabel; 5] = [
        Self::Interested,
        Self::MeetingBooked,
        Self::NotInterested,
        Self::Spam,
        Self::OutOfOffice,
    ];

    /// Human-readable name, as stored and sent to webhooks.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interested => "Interested",
            Self::MeetingBooked => "Meeting Booked",
            Self::NotInterested => "Not Interested",
            Self::Spam => "Spam",
            Self::OutOfOffice => "Out of Office",
        }
    }

    /// Parses free-form classifier output, falling back to
    /// [`EmailLabel::NotInterested`] for anything unrecognized.
    pub fn parse_lenient(text: &str) -> Self {
        text.parse().unwrap_or(Self::NotInterested)
    }
}

impl fmt::Display for EmailLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when text names no known label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for EmailLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches(|c| c == '"' || c == '.');
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_labels() {
        assert_eq!("Interested".parse(), Ok(EmailLabel::Interested));
        assert_eq!(" meeting booked.".parse(), Ok(EmailLabel::MeetingBooked));
        assert_eq!("\"Out of Office\"".parse(), Ok(EmailLabel::OutOfOffice));
    }

    #[test]
    fn unknown_text_falls_back() {
        assert!("maybe".parse::<EmailLabel>().is_err());
        assert_eq!(EmailLabel::parse_lenient("maybe"), EmailLabel::NotInterested);
    }

    #[test]
    fn serializes_with_display_names() {
        let json = serde_json::to_string(&EmailLabel::MeetingBooked).unwrap();
        assert_eq!(json, "\"Meeting Booked\"");
        for label in EmailLabel::ALL {
            assert_eq!(label.to_string(), label.as_str());
        }
    }
}
