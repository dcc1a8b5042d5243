//! PROPFIND request body and Multi-Status parsing
//!
//! The engine requests a fixed property set per directory; the response is
//! a `207 Multi-Status` XML document with one `d:response` per resource.
//! Identity properties a server fails to return stay `None` in the parsed
//! entry; discovery decides whether that is an error.

use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::Reader;

use davdrive_core::ports::RemoteError;

/// The property set requested for every PROPFIND.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:getetag/>
    <oc:id/>
    <oc:permissions/>
    <oc:checksums/>
    <oc:size/>
  </d:prop>
</d:propfind>
"#;

/// One parsed `d:response`, still keyed by raw href
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    pub href: String,
    pub is_collection: bool,
    pub size: u64,
    pub modtime: i64,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub permissions: Option<String>,
    pub checksum_header: Option<String>,
}

#[derive(Debug, Default)]
struct PropstatProps {
    status_ok: bool,
    is_collection: bool,
    content_length: Option<u64>,
    modified: Option<i64>,
    etag: Option<String>,
    file_id: Option<String>,
    permissions: Option<String>,
    checksum_header: Option<String>,
}

/// Strips the surrounding weak-validator quotes from an etag value.
fn normalize_etag(raw: &str) -> String {
    raw.trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

/// Parses a `207 Multi-Status` body into raw entries.
///
/// Any XML-level failure, including a truncated document, maps to
/// [`RemoteError::InvalidXml`].
pub fn parse_multistatus(xml: &str) -> Result<Vec<RawEntry>, RemoteError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut depth: i64 = 0;
    let mut saw_multistatus = false;

    let mut entry: Option<RawEntry> = None;
    let mut propstat: Option<PropstatProps> = None;
    // Element the next text node belongs to.
    let mut current_field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"multistatus" => saw_multistatus = true,
                    b"response" => entry = Some(RawEntry::default()),
                    b"propstat" => propstat = Some(PropstatProps::default()),
                    b"href" | b"status" | b"getcontentlength" | b"getlastmodified"
                    | b"getetag" | b"id" | b"permissions" | b"checksum" | b"size" => {
                        current_field = Some(name);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(ps) = propstat.as_mut() {
                        ps.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(ref t)) => {
                let Some(field) = current_field.as_deref() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|_| RemoteError::InvalidXml)?
                    .into_owned();
                match field {
                    b"href" => {
                        if let Some(en) = entry.as_mut() {
                            en.href = text;
                        }
                    }
                    b"status" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.status_ok = text.contains("200");
                        }
                    }
                    b"getcontentlength" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.content_length = text.parse().ok();
                        }
                    }
                    b"getlastmodified" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.modified = DateTime::parse_from_rfc2822(&text)
                                .ok()
                                .map(|dt| dt.timestamp());
                        }
                    }
                    b"getetag" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.etag = Some(normalize_etag(&text));
                        }
                    }
                    b"id" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.file_id = Some(text);
                        }
                    }
                    b"permissions" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.permissions = Some(text);
                        }
                    }
                    b"checksum" => {
                        if let Some(ps) = propstat.as_mut() {
                            ps.checksum_header = Some(text);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                depth -= 1;
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"propstat" => {
                        if let (Some(ps), Some(en)) = (propstat.take(), entry.as_mut()) {
                            if ps.status_ok {
                                en.is_collection |= ps.is_collection;
                                if let Some(len) = ps.content_length {
                                    en.size = len;
                                }
                                if let Some(modified) = ps.modified {
                                    en.modtime = modified;
                                }
                                en.etag = ps.etag.or(en.etag.take());
                                en.file_id = ps.file_id.or(en.file_id.take());
                                en.permissions = ps.permissions.or(en.permissions.take());
                                en.checksum_header =
                                    ps.checksum_header.or(en.checksum_header.take());
                            }
                        }
                    }
                    b"response" => {
                        if let Some(en) = entry.take() {
                            entries.push(en);
                        }
                    }
                    _ => {}
                }
                current_field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Err(RemoteError::InvalidXml),
        }
    }

    // A truncated body parses "successfully" up to the cut; the unclosed
    // elements give it away.
    if !saw_multistatus || depth != 0 || entry.is_some() {
        return Err(RemoteError::InvalidXml);
    }

    Ok(entries)
}
