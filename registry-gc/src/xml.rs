//! Minimal, dependency-free tag extraction for the object store's XML list
//! and error responses. The registry driver only ever needs a handful of
//! leaf values out of a `ListBucketResult`/`Error` document, so a real XML
//! parser would be more machinery than the job calls for.

/// Pull the text content of the first `<tag>...</tag>` at any depth.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let rel_end = xml[start..].find(&close)?;
    Some(xml[start..start + rel_end].to_string())
}

/// Pull the inner contents of every top-level `<tag>...</tag>` block,
/// in document order.
fn extract_all_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let body_start = start + open.len();
        match rest[body_start..].find(&close) {
            Some(rel_end) => {
                out.push(&rest[body_start..body_start + rel_end]);
                rest = &rest[body_start + rel_end + close.len()..];
            }
            None => break,
        }
    }
    out
}

#[derive(Debug, Default, PartialEq)]
pub struct ListPage {
    pub common_prefixes: Vec<String>,
    pub contents: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// Parse an S3 `ListBucketResult` (list-objects v1 shape: `Marker` /
/// `NextMarker`, not the v2 continuation-token shape).
pub fn parse_list_bucket_result(xml: &str) -> ListPage {
    let is_truncated = extract_tag(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_marker = extract_tag(xml, "NextMarker");
    let common_prefixes = extract_all_blocks(xml, "CommonPrefixes")
        .into_iter()
        .filter_map(|block| extract_tag(block, "Prefix"))
        .collect();
    let contents = extract_all_blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| extract_tag(block, "Key"))
        .collect();
    ListPage {
        common_prefixes,
        contents,
        is_truncated,
        next_marker,
    }
}

/// Pull `<Message>` out of an S3 `<Error>` document, if present.
pub fn parse_error_message(xml: &str) -> Option<String> {
    extract_tag(xml, "Message")
}
