//! Raw message normalization.
//!
//! Turns an RFC 5322 payload into a [`NormalizedMessage`] using `mail-parser`.
//! Missing structural fields fall back to empty values; only payloads that are
//! not recognizable as a message at all are rejected.

use chrono::{DateTime, Utc};
use mail_parser::{Addr, Message, MessageParser, MessagePart, MimeHeaders};
use uuid::Uuid;

use crate::domain::{AccountId, Address, Attachment, MessageId, NormalizedMessage};

/// Domain used for generated message ids.
const GENERATED_ID_DOMAIN: &str = "mailsync.local";

/// Errors produced for payloads that cannot be normalized.
///
/// These are per-message: callers skip the message and continue the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not a MIME message")]
    Malformed,

    #[error("payload has no header section")]
    MissingHeaders,
}

/// Normalizes a raw payload synced from `folder` of `account_id`.
pub fn normalize(
    raw: &[u8],
    account_id: &AccountId,
    folder: &str,
) -> Result<NormalizedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }
    check_header_section(raw)?;

    let message = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Malformed)?;

    if message.headers().is_empty() {
        return Err(ParseError::MissingHeaders);
    }

    let (id, id_generated) = match message.message_id().filter(|id| !id.trim().is_empty()) {
        Some(id) => (MessageId::from(id.trim()), false),
        None => (generate_message_id(), true),
    };

    let from = extract_from(&message).into_iter().next().unwrap_or_default();

    let date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Ok(NormalizedMessage {
        id,
        id_generated,
        account_id: account_id.clone(),
        folder: folder.to_string(),
        subject: message.subject().unwrap_or_default().to_string(),
        from,
        to: extract_to(&message),
        cc: extract_cc(&message),
        body_text: message
            .body_text(0)
            .map(|s| s.into_owned())
            .unwrap_or_default(),
        body_html: message
            .body_html(0)
            .map(|s| s.into_owned())
            .unwrap_or_default(),
        date,
        attachments: message.attachments().map(describe_attachment).collect(),
    })
}

/// Checks that the payload opens with RFC 5322 header fields.
///
/// Every line up to the first blank line must be a `name: value` field with a
/// printable, space-free name, or a folded continuation of the previous field.
/// `mail-parser` accepts arbitrary text as a header, so this runs first.
fn check_header_section(raw: &[u8]) -> Result<(), ParseError> {
    let mut fields = 0usize;

    for line in raw.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if fields == 0 {
                return Err(ParseError::MissingHeaders);
            }
            continue;
        }

        let name = match line.iter().position(|b| *b == b':') {
            Some(colon) => &line[..colon],
            None => return Err(ParseError::Malformed),
        };
        if name.is_empty() || !name.iter().all(|b| (33..=126).contains(b)) {
            return Err(ParseError::Malformed);
        }
        fields += 1;
    }

    if fields == 0 {
        return Err(ParseError::MissingHeaders);
    }
    Ok(())
}

/// Builds an id from the current time and a random component.
///
/// Unique within a run; a restart derives a different id for the same message.
fn generate_message_id() -> MessageId {
    MessageId::from(format!(
        "{}-{}@{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        GENERATED_ID_DOMAIN
    ))
}

fn parse_address(addr: &Addr) -> Address {
    Address {
        email: addr.address().unwrap_or("").to_string(),
        name: addr.name().map(|s| s.to_string()),
    }
}

fn collect_addresses(address: Option<&mail_parser::Address>) -> Vec<Address> {
    let Some(address) = address else {
        return Vec::new();
    };

    if let Some(list) = address.as_list() {
        return list.iter().map(parse_address).collect();
    }

    address
        .as_group()
        .map(|groups| {
            groups
                .iter()
                .flat_map(|group| group.addresses.iter())
                .map(parse_address)
                .collect()
        })
        .unwrap_or_default()
}

fn extract_from(message: &Message) -> Vec<Address> {
    collect_addresses(message.from())
}

fn extract_to(message: &Message) -> Vec<Address> {
    collect_addresses(message.to())
}

fn extract_cc(message: &Message) -> Vec<Address> {
    collect_addresses(message.cc())
}

fn describe_attachment(part: &MessagePart) -> Attachment {
    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Attachment {
        filename: part.attachment_name().unwrap_or("unnamed").to_string(),
        content_type,
        size_bytes: part.contents().len() as u64,
    }
}
