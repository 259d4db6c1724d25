//! Report attachment extraction from raw RFC 822 messages.

use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::debug;

use crate::report::ContainerKind;

/// A qualifying attachment pulled out of a message.
#[derive(Debug, Clone)]
pub struct ReportAttachment {
    /// 1-based position among the qualifying attachments of the message.
    pub index: usize,
    pub filename: Option<String>,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub hint: Option<ContainerKind>,
}

/// Parsed envelope data plus the report attachments of one message.
#[derive(Debug, Clone, Default)]
pub struct ExtractedMessage {
    pub message_id: Option<String>,
    pub attachments: Vec<ReportAttachment>,
}

/// Parses a raw message and returns its report attachments.
///
/// Returns `None` when the message cannot be parsed at all. Attachments larger
/// than `max_size` bytes are skipped.
pub fn extract_report_attachments(raw: &[u8], max_size: u64) -> Option<ExtractedMessage> {
    let message = MessageParser::default().parse(raw)?;
    let mut attachments = Vec::new();

    for part in message.parts.iter() {
        let content = match &part.body {
            PartType::Binary(data) | PartType::InlineBinary(data) => data.as_ref(),
            PartType::Text(text) => text.as_bytes(),
            _ => continue,
        };

        let mime_type = mime_type_of(part);
        let filename = part.attachment_name().map(str::to_string);

        let hint = filename
            .as_deref()
            .and_then(ContainerKind::from_filename)
            .or_else(|| ContainerKind::from_mime_type(&mime_type));
        if hint.is_none() || !is_attachment(part) {
            continue;
        }

        if content.len() as u64 > max_size {
            debug!(
                filename = filename.as_deref().unwrap_or("(unnamed)"),
                size = content.len(),
                "Skipping oversized attachment"
            );
            continue;
        }

        attachments.push(ReportAttachment {
            index: attachments.len() + 1,
            filename,
            mime_type,
            content: content.to_vec(),
            hint,
        });
    }

    Some(ExtractedMessage {
        message_id: message.message_id().map(normalize_message_id),
        attachments,
    })
}

/// A part counts as an attachment when it is declared as one, carries a
/// filename, or is a non-text leaf. Plain `text/xml` bodies are accepted too,
/// since some reporters send the report inline.
fn is_attachment(part: &MessagePart) -> bool {
    if part
        .content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
    {
        return true;
    }
    if part.attachment_name().is_some() {
        return true;
    }
    match part.content_type() {
        Some(ct) if ct.ctype().eq_ignore_ascii_case("text") => ct
            .subtype()
            .is_some_and(|sub| sub.eq_ignore_ascii_case("xml")),
        Some(ct) => !matches!(ct.ctype().to_ascii_lowercase().as_str(), "multipart" | "message"),
        None => false,
    }
}

fn mime_type_of(part: &MessagePart) -> String {
    part.content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "application/octet-stream".to_string())
        .to_ascii_lowercase()
}

/// Strips whitespace and the surrounding angle brackets of a Message-ID.
pub fn normalize_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}
