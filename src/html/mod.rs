//! HTML tokens
//!
//! Tokens keep the exact source bytes they were lexed from. An unmodified
//! token serializes back to those bytes, so a document that passes through
//! the pipeline untouched is emitted byte-for-byte.

pub mod lexer;

pub use lexer::Lexer;

/// Elements whose content is raw text up to the matching end tag
pub const LITERAL_ELEMENTS: [&str; 5] = ["script", "style", "textarea", "title", "xmp"];

pub fn is_literal_element(name: &str) -> bool {
    LITERAL_ELEMENTS.iter().any(|l| l.eq_ignore_ascii_case(name))
}

/// Decode the handful of character references that matter for URLs
pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

pub fn escape_attribute(value: &str, quote: u8) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' if quote == b'"' => out.push_str("&quot;"),
            '\'' if quote == b'\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// One attribute of a start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    value: Option<String>,
    quote: Option<u8>,
    raw: Vec<u8>,
    changed: bool,
}

impl Attribute {
    pub(crate) fn parsed(name: String, value: Option<String>, quote: Option<u8>, raw: Vec<u8>) -> Self {
        Self {
            name,
            value,
            quote,
            raw,
            changed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decoded value
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        if !self.changed {
            out.extend_from_slice(&self.raw);
            return;
        }
        out.extend_from_slice(self.name.as_bytes());
        if let Some(value) = &self.value {
            let quote = self.quote.unwrap_or(b'"');
            out.push(b'=');
            out.push(quote);
            out.extend_from_slice(escape_attribute(value, quote).as_bytes());
            out.push(quote);
        }
    }
}

/// A start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    raw_name: String,
    attributes: Vec<Attribute>,
    self_closing: bool,
    raw: Vec<u8>,
    modified: bool,
    deleted: bool,
}

impl Element {
    pub(crate) fn parsed(
        raw_name: String,
        attributes: Vec<Attribute>,
        self_closing: bool,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            name: raw_name.to_ascii_lowercase(),
            raw_name,
            attributes,
            self_closing,
            raw,
            modified: false,
            deleted: false,
        }
    }

    /// Build a new element, e.g. for injection
    pub fn new(name: &str, attributes: &[(&str, &str)]) -> Self {
        let attributes = attributes
            .iter()
            .map(|(n, v)| Attribute {
                name: n.to_string(),
                value: Some(v.to_string()),
                quote: Some(b'"'),
                raw: Vec::new(),
                changed: true,
            })
            .collect();
        Self {
            name: name.to_ascii_lowercase(),
            raw_name: name.to_string(),
            attributes,
            self_closing: false,
            raw: Vec::new(),
            modified: true,
            deleted: false,
        }
    }

    /// Lowercase tag name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn self_closing(&self) -> bool {
        self.self_closing
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.value())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Set (or add) an attribute value
    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(attr) => {
                if attr.value.as_deref() == Some(value) {
                    return;
                }
                attr.value = Some(value.to_string());
                attr.changed = true;
            }
            None => self.attributes.push(Attribute {
                name: name.to_string(),
                value: Some(value.to_string()),
                quote: Some(b'"'),
                raw: Vec::new(),
                changed: true,
            }),
        }
        self.modified = true;
    }

    pub fn remove_attr(&mut self, name: &str) {
        let before = self.attributes.len();
        self.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
        if self.attributes.len() != before {
            self.modified = true;
        }
    }

    /// Drop the element from the output
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_modified(&self) -> bool {
        self.modified || self.deleted
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        if self.deleted {
            return;
        }
        if !self.modified {
            out.extend_from_slice(&self.raw);
            return;
        }
        out.push(b'<');
        out.extend_from_slice(self.raw_name.as_bytes());
        for attr in &self.attributes {
            out.push(b' ');
            attr.write_to(out);
        }
        if self.self_closing {
            out.extend_from_slice(b"/");
        }
        out.push(b'>');
    }
}

/// A lexed (or injected) unit of HTML
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Text, including the raw content of literal elements
    Characters(Vec<u8>),
    StartTag(Element),
    EndTag { name: String, raw: Vec<u8> },
    /// `<!-- ... -->` including the delimiters
    Comment(Vec<u8>),
    /// `<!DOCTYPE>`, `<?...?>`, CDATA and other markup declarations
    Directive(Vec<u8>),
}

impl Token {
    /// A new `<!--text-->` comment
    pub fn comment(text: &str) -> Self {
        Token::Comment(format!("<!--{}-->", text).into_bytes())
    }

    pub fn text(text: &str) -> Self {
        Token::Characters(text.as_bytes().to_vec())
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Token::StartTag(element) => Some(element),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Token::StartTag(element) => Some(element),
            _ => None,
        }
    }

    /// Lowercase name of an end tag
    pub fn end_tag_name(&self) -> Option<&str> {
        match self {
            Token::EndTag { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Token::Characters(bytes) | Token::Comment(bytes) | Token::Directive(bytes) => {
                out.extend_from_slice(bytes)
            }
            Token::StartTag(element) => element.write_to(out),
            Token::EndTag { raw, .. } => out.extend_from_slice(raw),
        }
    }
}

/// Serialize a token sequence
pub fn serialize(tokens: &[Token]) -> Vec<u8> {
    let mut out = Vec::new();
    for token in tokens {
        token.write_to(&mut out);
    }
    out
}
