//! Message normalization.
//!
//! Turns raw mail into an [`Envelope`] that can be handed to the relay: the
//! recipients are derived from the headers, the envelope sender is forced to
//! the forwarder address and the header block is rewritten so replies still
//! reach the original sender.

use crate::error::Error;
use crate::utils::{extract_address, first_mailbox, header_addresses};
use mailparse::{MailHeader, MailHeaderMap, SingleInfo, parse_headers, parse_mail};

const RECIPIENT_HEADERS: [&str; 3] = ["To", "Cc", "Bcc"];

/// Addresses the normalizer forces into every envelope.
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    /// Envelope sender of every relayed message.
    pub forwarder_address: String,
    /// Recipient used when no recipient can be derived from the headers.
    pub fallback_recipient: String,
}

/// Sender recovered from the original `From` header.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalSender {
    pub display_name: Option<String>,
    pub addr: String,
}

impl From<SingleInfo> for OriginalSender {
    fn from(single: SingleInfo) -> Self {
        Self {
            display_name: single.display_name,
            addr: single.addr,
        }
    }
}

/// Represents an SMTP envelope with sender, recipients, and rewritten message data.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub original_from: Option<OriginalSender>,
    pub data: Vec<u8>,
}

/// Normalizes a raw message into a deliverable [`Envelope`].
///
/// The recipients are the union of all `To`, `Cc` and `Bcc` headers in the
/// order they appear, unless an `X-Forwarded-To` header is present, in which
/// case its first address is the only recipient. If nothing can be derived,
/// the fallback recipient of `policy` is used, so the result is never empty.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if the header block or MIME structure
/// can't be decoded, and [`Error::EmptyMessage`] if there are no headers at all.
pub fn normalize(raw: &[u8], policy: &AddressPolicy) -> Result<Envelope, Error> {
    let (headers, body_offset) = parse_headers(raw)?;
    if headers.is_empty() {
        return Err(Error::EmptyMessage);
    }
    // Only checks that the MIME structure is decodable.
    parse_mail(raw)?;

    let original_from = headers
        .get_first_header("From")
        .and_then(first_mailbox)
        .filter(|single| single.addr.contains('@'))
        .map(OriginalSender::from);
    match &original_from {
        Some(sender) => log::debug!("Original sender: {}", sender.addr),
        None => log::info!("No usable From header, masking sender with forwarder address"),
    }

    let rcpt_to = collect_recipients(&headers, policy);
    let data = rewrite(raw, &headers, body_offset, original_from.as_ref(), policy);

    Ok(Envelope {
        mail_from: policy.forwarder_address.clone(),
        rcpt_to,
        original_from,
        data,
    })
}

fn is_recipient_header(header: &MailHeader) -> bool {
    let key = header.get_key_ref();
    RECIPIENT_HEADERS
        .iter()
        .any(|name| key.eq_ignore_ascii_case(name))
}

fn collect_recipients(headers: &[MailHeader], policy: &AddressPolicy) -> Vec<String> {
    if let Some(forwarded) = headers
        .get_first_value("X-Forwarded-To")
        .as_deref()
        .and_then(extract_address)
    {
        log::debug!("X-Forwarded-To overrides recipients with <{forwarded}>");
        return vec![forwarded];
    }

    let recipients: Vec<String> = headers
        .iter()
        .filter(|header| is_recipient_header(header))
        .flat_map(header_addresses)
        .collect();

    if recipients.is_empty() {
        log::info!(
            "No recipients found, using fallback <{}>",
            policy.fallback_recipient
        );
        return vec![policy.fallback_recipient.clone()];
    }
    recipients
}

/// Rebuilds the header block and appends the body.
///
/// `Bcc` is never transmitted. If the original sender is known, `Reply-To`
/// points at it and `From` stays verbatim; otherwise `From` is replaced by
/// the forwarder address. The result always uses CRLF line endings, as
/// required on the SMTP wire.
fn rewrite(
    raw: &[u8],
    headers: &[MailHeader],
    body_offset: usize,
    original_from: Option<&OriginalSender>,
    policy: &AddressPolicy,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(raw.len() + 128);
    for header in headers {
        let key = header.get_key_ref();
        let dropped = key.eq_ignore_ascii_case("Bcc")
            || (original_from.is_some() && key.eq_ignore_ascii_case("Reply-To"))
            || (original_from.is_none() && key.eq_ignore_ascii_case("From"));
        if dropped {
            continue;
        }
        push_header(&mut data, &key, header.get_value_raw());
    }

    match original_from {
        Some(sender) => push_header(&mut data, "Reply-To", sender.addr.as_bytes()),
        None => push_header(&mut data, "From", policy.forwarder_address.as_bytes()),
    }

    data.extend_from_slice(b"\r\n");
    push_crlf(&mut data, raw.get(body_offset..).unwrap_or_default());
    data
}

fn push_header(data: &mut Vec<u8>, key: &str, value: &[u8]) {
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(b": ");
    // Folded values keep their original line breaks.
    push_crlf(data, value);
    data.extend_from_slice(b"\r\n");
}

/// Appends `input`, turning every bare LF into CRLF.
fn push_crlf(data: &mut Vec<u8>, input: &[u8]) {
    let mut previous = None;
    for &byte in input {
        if byte == b'\n' && previous != Some(b'\r') {
            data.push(b'\r');
        }
        data.push(byte);
        previous = Some(byte);
    }
}
