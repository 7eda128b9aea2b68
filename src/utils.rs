use mailparse::{MailAddr, MailAddrList, MailHeader, SingleInfo};

/// Flattens a parsed address list into single mailboxes, expanding groups in place.
fn flatten(list: &MailAddrList) -> impl Iterator<Item = SingleInfo> + '_ {
    list.iter().flat_map(|addr| match addr {
        MailAddr::Single(single) => vec![single.clone()],
        MailAddr::Group(group) => group.addrs.clone(),
    })
}

/// Extracts every address found in an address header such as `To` or `Cc`.
///
/// Returns an empty list if the header value can't be parsed.
pub fn header_addresses(header: &MailHeader) -> Vec<String> {
    match mailparse::addrparse_header(header) {
        Ok(list) => flatten(&list)
            .map(|single| single.addr)
            .filter(|addr| !addr.is_empty())
            .collect(),
        Err(e) => {
            log::debug!("Skipping unparseable {} header: {}", header.get_key(), e);
            Vec::new()
        }
    }
}

/// Extracts the first mailbox found in an address header, keeping its display name.
///
/// Return `None` if parsing fails.
pub fn first_mailbox(header: &MailHeader) -> Option<SingleInfo> {
    mailparse::addrparse_header(header)
        .ok()
        .and_then(|list| flatten(&list).find(|single| !single.addr.is_empty()))
}

/// Extracts the first email address found in a raw header value.
///
/// Return `None` if parsing fails.
///
/// Returns the first address if multiple are present.
pub fn extract_address(input: &str) -> Option<String> {
    mailparse::addrparse(input.trim())
        .ok()
        .and_then(|list| {
            flatten(&list)
                .map(|single| single.addr)
                .find(|addr| !addr.is_empty())
        })
}
