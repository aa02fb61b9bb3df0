//! Minimal XML tree decoder
//!
//! Endpoints in the path-based family answer with small, well-formed
//! documents such as:
//!
//! ```text
//! <XmlDoc resultId="3">
//!   <Status>
//!     <Call item="7">
//!       <Status>Connected</Status>
//!       <Direction>Incoming</Direction>
//!     </Call>
//!   </Status>
//! </XmlDoc>
//! ```
//!
//! Only elements, attributes, text, CDATA and the predefined/numeric
//! entities are understood. Prologs, comments and doctype declarations are
//! skipped. Name matching in the accessors is case-insensitive.

use crate::error::FramingError;

/// Maximum element nesting depth (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// A parsed XML element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    /// Element name as sent
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated, trimmed text content
    pub text: String,
    /// Child elements in document order
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: add an attribute
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Builder: set text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder: append a child element
    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `item` attribute, used by endpoints to index repeated elements
    pub fn item(&self) -> Option<&str> {
        self.attr("item")
    }

    /// First child element with the given name
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All child elements with the given name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }

    /// Text of the first child with the given name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}

/// Parse a complete document and return its root element
pub fn parse(input: &str) -> Result<XmlNode, FramingError> {
    let mut parser = Parser {
        src: input,
        pos: 0,
        depth: 0,
    };

    parser.skip_misc()?;
    if !parser.rest().starts_with('<') {
        return Err(FramingError::Malformed("no root element".into()));
    }
    let root = parser.parse_element()?;
    parser.skip_misc()?;

    if !parser.rest().trim().is_empty() {
        return Err(FramingError::Malformed("trailing data after root".into()));
    }

    Ok(root)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn eof(&self) -> FramingError {
        FramingError::Malformed("unexpected end of document".into())
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<(), FramingError> {
        match self.rest().find(terminator) {
            Some(idx) => {
                self.pos += idx + terminator.len();
                Ok(())
            }
            None => Err(self.eof()),
        }
    }

    /// Skip whitespace, prologs, comments and declarations
    fn skip_misc(&mut self) -> Result<(), FramingError> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn read_name(&mut self) -> Result<&'a str, FramingError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>' || c == '=')
            .ok_or_else(|| self.eof())?;
        if end == 0 {
            return Err(FramingError::Malformed(format!(
                "expected name at offset {}",
                self.pos
            )));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn parse_element(&mut self) -> Result<XmlNode, FramingError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(FramingError::Malformed("nesting too deep".into()));
        }

        // Consume '<'
        self.pos += 1;
        let mut node = XmlNode::new(self.read_name()?);

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                self.depth -= 1;
                return Ok(node);
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.is_empty() {
                return Err(self.eof());
            }
            let (name, value) = self.parse_attribute()?;
            node.attributes.push((name, value));
        }

        self.parse_content(&mut node)?;
        self.depth -= 1;
        Ok(node)
    }

    fn parse_attribute(&mut self) -> Result<(String, String), FramingError> {
        let name = self.read_name()?.to_string();
        self.skip_whitespace();
        if !self.rest().starts_with('=') {
            // Valueless attribute, tolerated
            return Ok((name, String::new()));
        }
        self.pos += 1;
        self.skip_whitespace();

        let quote = match self.rest().chars().next() {
            Some(q @ ('"' | '\'')) => q,
            Some(_) => {
                return Err(FramingError::Malformed(format!(
                    "unquoted value for attribute {}",
                    name
                )))
            }
            None => return Err(self.eof()),
        };
        self.pos += 1;

        let rest = self.rest();
        let end = rest.find(quote).ok_or_else(|| self.eof())?;
        let value = decode_entities(&rest[..end]);
        self.pos += end + 1;

        Ok((name, value))
    }

    fn parse_content(&mut self, node: &mut XmlNode) -> Result<(), FramingError> {
        let mut text = String::new();

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.eof());
            }

            if rest.starts_with("</") {
                self.pos += 2;
                let close = self.read_name()?;
                if !close.eq_ignore_ascii_case(&node.name) {
                    return Err(FramingError::Malformed(format!(
                        "expected </{}>, found </{}>",
                        node.name, close
                    )));
                }
                self.skip_past(">")?;
                node.text = text.trim().to_string();
                return Ok(());
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if let Some(cdata) = rest.strip_prefix("<![CDATA[") {
                let end = cdata.find("]]>").ok_or_else(|| self.eof())?;
                text.push_str(&cdata[..end]);
                self.pos += "<![CDATA[".len() + end + 3;
            } else if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with('<') {
                let child = self.parse_element()?;
                node.children.push(child);
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                text.push_str(&decode_entities(&rest[..end]));
                self.pos += end;
            }
        }
    }
}

/// Replace predefined and numeric character references
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                // Unknown entity, keep verbatim
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape text for inclusion in command arguments
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
