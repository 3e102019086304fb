//! Streaming HTML lexer
//!
//! Bytes arrive in arbitrary chunks. The lexer emits every token it can
//! complete and keeps an unfinished construct buffered until more input (or
//! end of input) arrives. Malformed markup never fails: a stray `<` is text,
//! and a construct still open at end of input is emitted as text.

use super::{decode_entities, is_literal_element, Attribute, Element, Token};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Data,
    /// Inside a literal element, waiting for `</name`
    Literal(String),
}

enum Step {
    Token(Token, usize),
    Incomplete,
}

/// Incremental tokenizer
#[derive(Debug)]
pub struct Lexer {
    buf: Vec<u8>,
    state: State,
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c')
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl Lexer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: State::Data,
        }
    }

    /// Forget buffered input and state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Data;
    }

    /// Name of the literal element currently open, if any
    pub fn open_literal(&self) -> Option<&str> {
        match &self.state {
            State::Literal(name) => Some(name),
            State::Data => None,
        }
    }

    /// Bytes buffered awaiting completion
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Token>) {
        self.buf.extend_from_slice(chunk);
        self.drain(false, out);
    }

    /// Flush everything, treating unfinished constructs as text
    pub fn finish(&mut self, out: &mut Vec<Token>) {
        self.drain(true, out);
        if !self.buf.is_empty() {
            out.push(Token::Characters(std::mem::take(&mut self.buf)));
        }
        self.state = State::Data;
    }

    fn drain(&mut self, at_eof: bool, out: &mut Vec<Token>) {
        let mut pos = 0;
        while pos < self.buf.len() {
            if let State::Literal(name) = &self.state {
                let (end, closed) = self.scan_literal(pos, name, at_eof);
                if end > pos {
                    out.push(Token::Characters(self.buf[pos..end].to_vec()));
                }
                pos = end;
                if !closed {
                    break;
                }
                self.state = State::Data;
                continue;
            }

            if self.buf[pos] != b'<' {
                let end = find(&self.buf, b"<", pos).unwrap_or(self.buf.len());
                out.push(Token::Characters(self.buf[pos..end].to_vec()));
                pos = end;
                continue;
            }

            match self.lex_markup(pos, at_eof) {
                Step::Token(token, end) => {
                    if let Token::StartTag(element) = &token {
                        if !element.self_closing() && is_literal_element(element.name()) {
                            self.state = State::Literal(element.name().to_string());
                        }
                    }
                    out.push(token);
                    pos = end;
                }
                Step::Incomplete => break,
            }
        }
        self.buf.drain(..pos);
    }

    /// Find the end of literal content starting at `pos`
    ///
    /// Returns the end of the content that can be emitted and whether the
    /// closing tag was found there.
    fn scan_literal(&self, pos: usize, name: &str, at_eof: bool) -> (usize, bool) {
        let buf = &self.buf;
        let mut search = pos;
        while let Some(lt) = find(buf, b"</", search) {
            let name_end = lt + 2 + name.len();
            if name_end > buf.len() {
                // Possibly a split closing tag
                return if at_eof { (buf.len(), false) } else { (lt, false) };
            }
            if buf[lt + 2..name_end].eq_ignore_ascii_case(name.as_bytes()) {
                match buf.get(name_end) {
                    Some(&b) if is_space(b) || b == b'>' || b == b'/' => return (lt, true),
                    None if !at_eof => return (lt, false),
                    _ => {}
                }
            }
            search = lt + 2;
        }
        if at_eof {
            return (buf.len(), false);
        }
        // Hold back a trailing '<' that could begin the closing tag
        match buf[pos..].iter().rposition(|&b| b == b'<') {
            Some(p) if buf.len() - (pos + p) < name.len() + 3 => (pos + p, false),
            _ => (buf.len(), false),
        }
    }

    fn lex_markup(&self, pos: usize, at_eof: bool) -> Step {
        let buf = &self.buf;
        let rest = &buf[pos..];
        if rest.len() < 2 {
            return if at_eof {
                Step::Token(Token::Characters(rest.to_vec()), buf.len())
            } else {
                Step::Incomplete
            };
        }

        let delimited = |open_len: usize, close: &[u8], make: fn(Vec<u8>) -> Token| {
            match find(buf, close, pos + open_len) {
                Some(end) => {
                    let end = end + close.len();
                    Step::Token(make(buf[pos..end].to_vec()), end)
                }
                None => Step::Incomplete,
            }
        };

        match rest[1] {
            b'!' => {
                if rest.starts_with(b"<!--") {
                    delimited(4, &b"-->"[..], Token::Comment)
                } else if rest.len() < 4 && b"<!--".starts_with(rest) {
                    Step::Incomplete
                } else {
                    delimited(2, &b">"[..], Token::Directive)
                }
            }
            b'?' => delimited(2, &b">"[..], Token::Directive),
            b'/' => match rest.get(2) {
                Some(b) if b.is_ascii_alphabetic() => self.lex_end_tag(pos),
                Some(_) => Step::Token(Token::Characters(b"<".to_vec()), pos + 1),
                None => Step::Incomplete,
            },
            b if b.is_ascii_alphabetic() => self.lex_start_tag(pos),
            _ => Step::Token(Token::Characters(b"<".to_vec()), pos + 1),
        }
    }

    fn lex_end_tag(&self, pos: usize) -> Step {
        let buf = &self.buf;
        let Some(close) = find(buf, b">", pos) else {
            return Step::Incomplete;
        };
        let name_end = buf[pos + 2..close]
            .iter()
            .position(|&b| is_space(b) || b == b'/')
            .map(|p| pos + 2 + p)
            .unwrap_or(close);
        Step::Token(
            Token::EndTag {
                name: lossy(&buf[pos + 2..name_end]).to_ascii_lowercase(),
                raw: buf[pos..=close].to_vec(),
            },
            close + 1,
        )
    }

    fn lex_start_tag(&self, start: usize) -> Step {
        let buf = &self.buf;
        let len = buf.len();
        let mut pos = start + 1;
        while pos < len && !is_space(buf[pos]) && buf[pos] != b'>' && buf[pos] != b'/' {
            pos += 1;
        }
        let raw_name = lossy(&buf[start + 1..pos]);

        let mut attributes = Vec::new();
        let mut self_closing = false;
        loop {
            while pos < len && is_space(buf[pos]) {
                pos += 1;
            }
            if pos >= len {
                return Step::Incomplete;
            }
            match buf[pos] {
                b'>' => break,
                b'/' => {
                    if pos + 1 >= len {
                        return Step::Incomplete;
                    }
                    if buf[pos + 1] == b'>' {
                        self_closing = true;
                        pos += 1;
                        break;
                    }
                    pos += 1;
                    continue;
                }
                _ => {}
            }

            let attr_start = pos;
            pos += 1;
            while pos < len && !is_space(buf[pos]) && !matches!(buf[pos], b'=' | b'>' | b'/') {
                pos += 1;
            }
            let name = lossy(&buf[attr_start..pos]);

            let mut after_name = pos;
            while after_name < len && is_space(buf[after_name]) {
                after_name += 1;
            }
            if after_name >= len {
                return Step::Incomplete;
            }
            if buf[after_name] != b'=' {
                attributes.push(Attribute::parsed(
                    name,
                    None,
                    None,
                    buf[attr_start..pos].to_vec(),
                ));
                continue;
            }

            pos = after_name + 1;
            while pos < len && is_space(buf[pos]) {
                pos += 1;
            }
            if pos >= len {
                return Step::Incomplete;
            }
            let (value, quote) = match buf[pos] {
                q @ (b'"' | b'\'') => {
                    let Some(close) = find(buf, &[q], pos + 1) else {
                        return Step::Incomplete;
                    };
                    let value = lossy(&buf[pos + 1..close]);
                    pos = close + 1;
                    (value, Some(q))
                }
                _ => {
                    let value_start = pos;
                    while pos < len && !is_space(buf[pos]) && buf[pos] != b'>' {
                        pos += 1;
                    }
                    if pos >= len {
                        return Step::Incomplete;
                    }
                    (lossy(&buf[value_start..pos]), None)
                }
            };
            attributes.push(Attribute::parsed(
                name,
                Some(decode_entities(&value)),
                quote,
                buf[attr_start..pos].to_vec(),
            ));
        }

        let end = pos + 1;
        Step::Token(
            Token::StartTag(Element::parsed(
                raw_name,
                attributes,
                self_closing,
                buf[start..end].to_vec(),
            )),
            end,
        )
    }
}
