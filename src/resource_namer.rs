//! Generated resource URLs
//!
//! A generated URL lives in the same directory as its (first) input and has
//! the shape `<leaf>.pagespeed.<filter-id>.<hash>.<ext>`. Combined resources
//! join their input leaves with `+`.

use crate::options::FilterId;
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Infix that marks a URL as generated by this engine
pub const PAGESPEED_INFIX: &str = ".pagespeed.";

/// Length of the content hash embedded in generated URLs
pub const HASH_LEN: usize = 10;

/// Broad resource category derived from a content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Css,
    Javascript,
    Image,
    Html,
    Other,
}

impl ResourceKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/css" => ResourceKind::Css,
            "application/javascript" | "text/javascript" | "application/x-javascript"
            | "application/ecmascript" | "text/ecmascript" => ResourceKind::Javascript,
            "text/html" | "application/xhtml+xml" => ResourceKind::Html,
            m if m.starts_with("image/") => ResourceKind::Image,
            _ => ResourceKind::Other,
        }
    }

    /// Whether the in-place recorder may capture this kind
    pub fn is_in_place_eligible(&self) -> bool {
        matches!(
            self,
            ResourceKind::Css | ResourceKind::Javascript | ResourceKind::Image
        )
    }
}

/// File extension to use for a content type
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match mime.as_str() {
        "text/css" => Some("css"),
        "application/javascript" | "text/javascript" | "application/x-javascript" => Some("js"),
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
        _ => None,
    }
}

/// Content type implied by a file extension
pub fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "css" => Some("text/css"),
        "js" => Some("application/javascript"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "ico" => Some("image/x-icon"),
        "html" | "htm" => Some("text/html"),
        _ => None,
    }
}

/// Hash of artifact content as embedded in generated URLs
pub fn content_hash(content: &[u8]) -> String {
    let mut hash = format!("{:016x}", xxh3_64(content));
    hash.truncate(HASH_LEN);
    hash
}

/// Decoded form of a generated URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedName {
    pub filter: FilterId,
    pub hash: String,
    pub ext: String,
    /// Absolute input URLs, in order
    pub inputs: Vec<Url>,
}

fn escape_leaf(leaf: &str) -> String {
    let mut out = String::with_capacity(leaf.len());
    for c in leaf.chars() {
        match c {
            ',' => out.push_str(",,"),
            '+' => out.push_str(",P"),
            '?' => out.push_str(",q"),
            '/' => out.push_str(",_"),
            '#' => out.push_str(",h"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_leaf(leaf: &str) -> Option<String> {
    let mut out = String::with_capacity(leaf.len());
    let mut chars = leaf.chars();
    while let Some(c) = chars.next() {
        if c != ',' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            ',' => out.push(','),
            'P' => out.push('+'),
            'q' => out.push('?'),
            '_' => out.push('/'),
            'h' => out.push('#'),
            _ => return None,
        }
    }
    Some(out)
}

fn directory_of(url: &Url) -> String {
    let s = url.as_str();
    let without_query = s.split(['?', '#']).next().unwrap_or(s);
    match without_query.rfind('/') {
        Some(pos) => without_query[..=pos].to_string(),
        None => without_query.to_string(),
    }
}

/// Leaf of `url` relative to `dir`, including any query
fn relative_leaf(url: &Url, dir: &str) -> String {
    let s = url.as_str();
    let s = s.split('#').next().unwrap_or(s);
    s.strip_prefix(dir).map(str::to_string).unwrap_or_else(|| {
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default()
    })
}

/// Whether `url` has the generated-resource shape
pub fn is_generated(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let leaf = path.rsplit('/').next().unwrap_or(path);
    leaf.contains(PAGESPEED_INFIX)
}

/// Build the canonical generated URL for `inputs` rewritten by `filter`
///
/// Inputs after the first must share its directory or a subdirectory of it.
pub fn encode(filter: FilterId, inputs: &[Url], hash: &str, ext: &str) -> Option<String> {
    let first = inputs.first()?;
    let dir = directory_of(first);
    let leaves: Vec<String> = inputs
        .iter()
        .map(|input| escape_leaf(&relative_leaf(input, &dir)))
        .collect();
    Some(format!(
        "{}{}{}{}.{}.{}",
        dir,
        leaves.join("+"),
        PAGESPEED_INFIX,
        filter.code(),
        hash,
        ext
    ))
}

/// Parse a generated URL back into its parts
pub fn decode(url: &Url) -> Option<GeneratedName> {
    let dir = directory_of(url);
    let leaf = url.as_str().strip_prefix(&dir)?;
    let leaf = leaf.split(['?', '#']).next().unwrap_or(leaf);
    let split = leaf.rfind(PAGESPEED_INFIX)?;
    let (encoded_inputs, tail) = (&leaf[..split], &leaf[split + PAGESPEED_INFIX.len()..]);

    let mut parts = tail.splitn(3, '.');
    let filter = FilterId::from_code(parts.next()?)?;
    let hash = parts.next()?.to_string();
    let ext = parts.next()?.to_string();
    if hash.is_empty() || ext.is_empty() || encoded_inputs.is_empty() {
        return None;
    }

    let base = Url::parse(&dir).ok()?;
    let inputs = encoded_inputs
        .split('+')
        .map(|part| unescape_leaf(part).and_then(|leaf| base.join(&leaf).ok()))
        .collect::<Option<Vec<Url>>>()?;

    Some(GeneratedName {
        filter,
        hash,
        ext,
        inputs,
    })
}
