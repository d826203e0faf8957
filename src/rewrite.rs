//! Serve-time rewriting of recorded HTML and CSS so references resolve to sibling
//! resources of the same session.
//!
//! Both rewriters are small token scanners rather than regular expressions: they know
//! where comments, string literals and raw-text elements start and end, so URL-looking
//! text inside them is never touched.

use std::collections::HashMap;

use bytes::Bytes;
use url::Url;

use crate::session::{Resource, ResourceId, ResourceSummary, SessionId, is_css, is_html};

/// Maps captured source URLs to the path that serves the recorded copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiblingIndex {
    paths: HashMap<String, String>,
}

impl SiblingIndex {
    /// Builds the index in collection order. When a URL was captured more than once the
    /// earliest resource wins.
    pub fn from_resources(session: &SessionId, resources: &[ResourceSummary]) -> Self {
        let mut index = Self::default();
        for resource in resources {
            index.insert(&resource.url, serving_path(session, resource.id));
        }
        index
    }

    /// Keeps the existing entry when `url` is already indexed.
    pub fn insert(&mut self, url: &str, path: String) {
        self.paths.entry(url.to_owned()).or_insert(path);
    }

    pub fn lookup(&self, url: &str) -> Option<&str> {
        self.paths.get(url).map(String::as_str)
    }
}

pub fn serving_path(session: &SessionId, resource: ResourceId) -> String {
    format!("/api/sessions/{session}/resources/{resource}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub body: Bytes,
    pub content_type: String,
}

/// Produces the replay body of a stored resource.
pub fn render(resource: &Resource, payload: Bytes, index: &SiblingIndex) -> Rendered {
    let content_type = resource.meta.content_type.clone();
    let body = rewrite(&content_type, payload, &resource.meta.url, index);
    Rendered { body, content_type }
}

/// Rewrites HTML and CSS payloads; everything else, and payloads that are not valid
/// UTF-8, pass through unchanged.
pub fn rewrite(
    content_type: &str,
    payload: Bytes,
    source_url: &str,
    index: &SiblingIndex,
) -> Bytes {
    let rewriter: fn(&str, &str, &SiblingIndex) -> String = if is_html(content_type) {
        rewrite_html
    } else if is_css(content_type) {
        rewrite_css
    } else {
        return payload;
    };
    match std::str::from_utf8(&payload) {
        Ok(text) => Bytes::from(rewriter(text, source_url, index)),
        Err(_) => payload,
    }
}

pub fn rewrite_html(html: &str, source_url: &str, index: &SiblingIndex) -> String {
    let base = Url::parse(source_url).ok();
    let has_base_tag = Tokenizer::new(html)
        .any(|token| matches!(token, Token::StartTag(tag) if tag.is_named("base")));
    let mut inject_base = !has_base_tag;
    let mut out = String::with_capacity(html.len() + source_url.len() + 16);

    for token in Tokenizer::new(html) {
        match token {
            Token::Text(text) | Token::Markup(text) => out.push_str(text),
            Token::RawText { element, text } if element == "style" => {
                out.push_str(&rewrite_css(text, source_url, index));
            }
            Token::RawText { text, .. } => out.push_str(text),
            Token::StartTag(tag) => {
                if tag.is_named("meta") && tag.is_csp_meta() {
                    continue;
                }
                write_start_tag(&mut out, &tag, base.as_ref(), index);
                if inject_base && tag.is_named("head") {
                    out.push_str("<base href=\"");
                    out.push_str(&escape_attribute(source_url));
                    out.push_str("\">");
                    inject_base = false;
                }
            }
        }
    }
    out
}

pub fn rewrite_css(css: &str, source_url: &str, index: &SiblingIndex) -> String {
    let base = Url::parse(source_url).ok();
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(bytes.len(), |end| end + 2);
            }
            quote @ (b'"' | b'\'') => i = skip_css_string(bytes, i + 1, quote),
            b'u' | b'U' if starts_with_ci(bytes, i, b"url(") && !is_ident_byte_before(bytes, i) => {
                let Some(call) = parse_css_url(css, i) else {
                    i += 4;
                    continue;
                };
                if let Some(path) = resolve_sibling(call.reference, base.as_ref(), index) {
                    out.push_str(&css[copied..i]);
                    out.push_str("url(\"");
                    out.push_str(path);
                    out.push_str("\")");
                    copied = call.end;
                }
                i = call.end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&css[copied..]);
    out
}

struct CssUrl<'a> {
    reference: &'a str,
    /// Byte offset just past the closing parenthesis.
    end: usize,
}

fn parse_css_url(css: &str, start: usize) -> Option<CssUrl<'_>> {
    let bytes = css.as_bytes();
    let mut i = skip_whitespace(bytes, start + 4);
    let reference = match bytes.get(i) {
        Some(&quote @ (b'"' | b'\'')) => {
            let value_start = i + 1;
            let value_end = value_start + bytes[value_start..].iter().position(|&b| b == quote)?;
            i = value_end + 1;
            &css[value_start..value_end]
        }
        Some(_) => {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b')' && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            &css[value_start..i]
        }
        None => return None,
    };
    i = skip_whitespace(bytes, i);
    (bytes.get(i) == Some(&b')')).then_some(CssUrl {
        reference,
        end: i + 1,
    })
}

fn skip_css_string(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i + 1,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn is_ident_byte_before(bytes: &[u8], i: usize) -> bool {
    i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || matches!(bytes[i - 1], b'-' | b'_'))
}

/// Looks up the sibling for a root-relative or absolute http(s) reference. References
/// written relative to the current path are left to the injected `<base>`.
fn resolve_sibling<'i>(
    reference: &str,
    base: Option<&Url>,
    index: &'i SiblingIndex,
) -> Option<&'i str> {
    let decoded = decode_char_refs(reference.trim());
    let lowered = decoded.get(..8).unwrap_or(&decoded).to_ascii_lowercase();
    let is_absolute = lowered.starts_with("http://") || lowered.starts_with("https://");
    if !is_absolute && !decoded.starts_with('/') {
        return None;
    }
    if let Some(path) = index.lookup(&decoded) {
        return Some(path);
    }
    let resolved = match base {
        Some(base) => base.join(&decoded).ok()?,
        None if is_absolute => Url::parse(&decoded).ok()?,
        None => return None,
    };
    index.lookup(resolved.as_str())
}

fn write_start_tag(
    out: &mut String,
    tag: &StartTag<'_>,
    base: Option<&Url>,
    index: &SiblingIndex,
) {
    let mut copied = 0;
    for attribute in &tag.attributes {
        let Some(value) = &attribute.value else {
            continue;
        };
        if !(attribute.name.eq_ignore_ascii_case("src")
            || attribute.name.eq_ignore_ascii_case("href"))
        {
            continue;
        }
        if let Some(path) = resolve_sibling(value.raw, base, index) {
            out.push_str(&tag.source[copied..value.offset]);
            out.push_str(path);
            copied = value.offset + value.raw.len();
        }
    }
    out.push_str(&tag.source[copied..]);
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Decodes the character references that commonly appear inside URL attributes.
fn decode_char_refs(value: &str) -> String {
    if !value.contains('&') {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity.strip_prefix('#').and_then(|number| {
                    let code = match number.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => number.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            ch.map(|ch| (ch, semi + 1))
        });
        match decoded {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

const RAW_TEXT_ELEMENTS: [&str; 4] = ["script", "style", "textarea", "title"];

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    /// Comments, doctype, processing instructions and end tags. Copied verbatim.
    Markup(&'a str),
    StartTag(StartTag<'a>),
    RawText { element: &'static str, text: &'a str },
}

#[derive(Debug, PartialEq, Eq)]
struct StartTag<'a> {
    source: &'a str,
    name: &'a str,
    attributes: Vec<Attribute<'a>>,
    self_closing: bool,
}

impl StartTag<'_> {
    fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn is_csp_meta(&self) -> bool {
        self.attributes.iter().any(|attribute| {
            attribute.name.eq_ignore_ascii_case("http-equiv")
                && attribute.value.as_ref().is_some_and(|value| {
                    decode_char_refs(value.raw.trim()).eq_ignore_ascii_case("content-security-policy")
                })
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Attribute<'a> {
    name: &'a str,
    value: Option<AttributeValue<'a>>,
}

#[derive(Debug, PartialEq, Eq)]
struct AttributeValue<'a> {
    /// Value text without quotes, exactly as written.
    raw: &'a str,
    /// Byte offset of `raw` within the tag source.
    offset: usize,
}

struct Tokenizer<'a> {
    src: &'a str,
    pos: usize,
    raw_text: Option<&'static str>,
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            raw_text: None,
        }
    }

    fn markup_until(&mut self, end: usize) -> Token<'a> {
        let start = self.pos;
        self.pos = end;
        Token::Markup(&self.src[start..end])
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let bytes = self.src.as_bytes();
        let start = self.pos;

        if let Some(element) = self.raw_text.take() {
            let end = find_closing_tag(bytes, start, element).unwrap_or(bytes.len());
            if end > start {
                self.pos = end;
                return Some(Token::RawText {
                    element,
                    text: &self.src[start..end],
                });
            }
        }
        if start >= bytes.len() {
            return None;
        }

        let rest = &bytes[start..];
        if rest.starts_with(b"<!--") {
            let end = find(bytes, start + 4, b"-->").map_or(bytes.len(), |end| end + 3);
            return Some(self.markup_until(end));
        }
        let opens_tag = rest.len() > 1 && rest[0] == b'<';
        if opens_tag && matches!(rest[1], b'!' | b'?')
            || opens_tag && rest[1] == b'/' && rest.get(2).is_some_and(u8::is_ascii_alphabetic)
        {
            let end = find(bytes, start + 2, b">").map_or(bytes.len(), |end| end + 1);
            return Some(self.markup_until(end));
        }
        if opens_tag && rest[1].is_ascii_alphabetic() {
            let tag = parse_start_tag(self.src, start);
            self.pos = start + tag.source.len();
            if !tag.self_closing {
                self.raw_text = RAW_TEXT_ELEMENTS
                    .into_iter()
                    .find(|element| tag.is_named(element));
            }
            return Some(Token::StartTag(tag));
        }

        let end = find(bytes, start + 1, b"<").unwrap_or(bytes.len());
        self.pos = end;
        Some(Token::Text(&self.src[start..end]))
    }
}

fn parse_start_tag(src: &str, start: usize) -> StartTag<'_> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && !is_tag_delimiter(bytes[i]) {
        i += 1;
    }
    let name = &src[start + 1..i];

    let mut attributes = Vec::new();
    let end = loop {
        i = skip_whitespace(bytes, i);
        match bytes.get(i) {
            None => break bytes.len(),
            Some(b'>') => break i + 1,
            Some(b'/') => {
                i += 1;
                continue;
            }
            Some(_) => {}
        }

        let name_start = i;
        i += 1;
        while i < bytes.len() && !is_tag_delimiter(bytes[i]) && bytes[i] != b'=' {
            i += 1;
        }
        let attribute_name = &src[name_start..i];

        let after_name = skip_whitespace(bytes, i);
        if bytes.get(after_name) != Some(&b'=') {
            attributes.push(Attribute {
                name: attribute_name,
                value: None,
            });
            continue;
        }
        i = skip_whitespace(bytes, after_name + 1);
        let (value_start, value_end) = match bytes.get(i) {
            Some(&quote @ (b'"' | b'\'')) => {
                let value_start = i + 1;
                let value_end = find(bytes, value_start, &[quote]).unwrap_or(bytes.len());
                i = (value_end + 1).min(bytes.len());
                (value_start, value_end)
            }
            _ => {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                (value_start, i)
            }
        };
        attributes.push(Attribute {
            name: attribute_name,
            value: Some(AttributeValue {
                raw: &src[value_start..value_end],
                offset: value_start - start,
            }),
        });
    };

    let source = &src[start..end];
    StartTag {
        source,
        name,
        attributes,
        self_closing: source.ends_with("/>"),
    }
}

fn is_tag_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || byte == b'/' || byte == b'>'
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn starts_with_ci(bytes: &[u8], at: usize, prefix: &[u8]) -> bool {
    bytes
        .get(at..at + prefix.len())
        .is_some_and(|window| window.eq_ignore_ascii_case(prefix))
}

/// Start of the `</element` tag that ends a raw-text element.
fn find_closing_tag(bytes: &[u8], from: usize, element: &str) -> Option<usize> {
    let mut i = from;
    while let Some(candidate) = find(bytes, i, b"</") {
        let name_end = candidate + 2 + element.len();
        if starts_with_ci(bytes, candidate + 2, element.as_bytes())
            && bytes.get(name_end).is_none_or(|&b| is_tag_delimiter(b))
        {
            return Some(candidate);
        }
        i = candidate + 2;
    }
    None
}
