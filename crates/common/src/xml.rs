use std::fmt;
use std::io::{self, Write};

/// One structural event from a document. The persistence and query
/// (de)serializers consume exactly this surface and nothing else.
#[derive(Clone, Debug, PartialEq)]
pub enum XmlToken {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Close(String),
    Text(String),
}

#[derive(Debug)]
pub enum XmlError {
    Malformed(String),
    BadEntity(String),
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XmlError::Malformed(msg) => write!(f, "malformed markup: {}", msg),
            XmlError::BadEntity(ent) => write!(f, "bad entity reference: {}", ent),
        }
    }
}

impl std::error::Error for XmlError {}

/// Pull tokenizer over a UTF-8 document. Handles the declaration,
/// comments, self-closing elements, the five named entities and numeric
/// character references; everything fancier is rejected.
pub struct XmlTokenReader<'a> {
    input: &'a str,
    pos: usize,
    pending_close: Option<String>,
}

impl<'a> XmlTokenReader<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            pending_close: None,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_past(&mut self, marker: &str) -> Result<(), XmlError> {
        match self.rest().find(marker) {
            Some(idx) => {
                self.pos += idx + marker.len();
                Ok(())
            }
            None => Err(XmlError::Malformed(format!(
                "unterminated section, expected {:?}",
                marker
            ))),
        }
    }

    fn read_name(&mut self) -> Result<String, XmlError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_' || c == ':'))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(XmlError::Malformed(format!(
                "expected name at offset {}",
                self.pos
            )));
        }
        let name = rest[..end].to_string();
        self.pos += end;
        Ok(name)
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
    }

    fn read_attrs(&mut self) -> Result<(Vec<(String, String)>, bool), XmlError> {
        let mut attrs = Vec::new();
        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok((attrs, true));
            }
            if rest.starts_with('>') {
                self.pos += 1;
                return Ok((attrs, false));
            }
            if rest.is_empty() {
                return Err(XmlError::Malformed("unterminated element".to_string()));
            }
            let name = self.read_name()?;
            self.skip_ws();
            if !self.rest().starts_with('=') {
                return Err(XmlError::Malformed(format!(
                    "attribute {:?} missing value",
                    name
                )));
            }
            self.pos += 1;
            self.skip_ws();
            let quote = match self.rest().chars().next() {
                Some(q @ ('"' | '\'')) => q,
                _ => {
                    return Err(XmlError::Malformed(format!(
                        "attribute {:?} value not quoted",
                        name
                    )))
                }
            };
            self.pos += 1;
            let rest = self.rest();
            let end = rest.find(quote).ok_or_else(|| {
                XmlError::Malformed(format!("attribute {:?} value unterminated", name))
            })?;
            let value = decode_entities(&rest[..end])?;
            self.pos += end + 1;
            attrs.push((name, value));
        }
    }
}

impl Iterator for XmlTokenReader<'_> {
    type Item = Result<XmlToken, XmlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(name) = self.pending_close.take() {
            return Some(Ok(XmlToken::Close(name)));
        }
        loop {
            if self.rest().is_empty() {
                return None;
            }
            if self.rest().starts_with('<') {
                let rest = self.rest();
                if rest.starts_with("<?") {
                    if let Err(err) = self.skip_past("?>") {
                        return Some(Err(err));
                    }
                    continue;
                }
                if rest.starts_with("<!--") {
                    if let Err(err) = self.skip_past("-->") {
                        return Some(Err(err));
                    }
                    continue;
                }
                if rest.starts_with("<!") {
                    if let Err(err) = self.skip_past(">") {
                        return Some(Err(err));
                    }
                    continue;
                }
                if rest.starts_with("</") {
                    self.pos += 2;
                    let name = match self.read_name() {
                        Ok(name) => name,
                        Err(err) => return Some(Err(err)),
                    };
                    self.skip_ws();
                    if !self.rest().starts_with('>') {
                        return Some(Err(XmlError::Malformed(format!(
                            "unterminated close tag {:?}",
                            name
                        ))));
                    }
                    self.pos += 1;
                    return Some(Ok(XmlToken::Close(name)));
                }
                self.pos += 1;
                let name = match self.read_name() {
                    Ok(name) => name,
                    Err(err) => return Some(Err(err)),
                };
                let (attrs, self_closing) = match self.read_attrs() {
                    Ok(parsed) => parsed,
                    Err(err) => return Some(Err(err)),
                };
                if self_closing {
                    self.pending_close = Some(name.clone());
                }
                return Some(Ok(XmlToken::Open { name, attrs }));
            }
            let rest = self.rest();
            let end = rest.find('<').unwrap_or(rest.len());
            let raw = &rest[..end];
            self.pos += end;
            if raw.trim().is_empty() {
                continue;
            }
            return Some(match decode_entities(raw) {
                Ok(text) => Ok(XmlToken::Text(text)),
                Err(err) => Err(err),
            });
        }
    }
}

fn decode_entities(raw: &str) -> Result<String, XmlError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest
            .find(';')
            .ok_or_else(|| XmlError::BadEntity(rest.chars().take(12).collect()))?;
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                let ch = code
                    .and_then(char::from_u32)
                    .ok_or_else(|| XmlError::BadEntity(entity.to_string()))?;
                out.push(ch);
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn escape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Indented element writer matching what the token reader accepts.
pub struct XmlWriter<W: Write> {
    out: W,
    depth: usize,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, depth: 0 }
    }

    fn indent(&mut self) -> io::Result<()> {
        for _ in 0..self.depth {
            self.out.write_all(b"  ")?;
        }
        Ok(())
    }

    pub fn declaration(&mut self) -> io::Result<()> {
        writeln!(self.out, "<?xml version=\"1.0\" standalone=\"yes\"?>")
    }

    pub fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> io::Result<()> {
        self.indent()?;
        write!(self.out, "<{}", name)?;
        for (key, value) in attrs {
            write!(self.out, " {}=\"{}\"", key, escape_text(value))?;
        }
        writeln!(self.out, ">")?;
        self.depth += 1;
        Ok(())
    }

    pub fn close(&mut self, name: &str) -> io::Result<()> {
        self.depth = self.depth.saturating_sub(1);
        self.indent()?;
        writeln!(self.out, "</{}>", name)
    }

    pub fn element_text(&mut self, name: &str, text: &str) -> io::Result<()> {
        self.indent()?;
        writeln!(self.out, "<{}>{}</{}>", name, escape_text(text), name)
    }

    pub fn element_text_attrs(
        &mut self,
        name: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> io::Result<()> {
        self.indent()?;
        write!(self.out, "<{}", name)?;
        for (key, value) in attrs {
            write!(self.out, " {}=\"{}\"", key, escape_text(value))?;
        }
        writeln!(self.out, ">{}</{}>", escape_text(text), name)
    }

    pub fn empty(&mut self, name: &str) -> io::Result<()> {
        self.indent()?;
        writeln!(self.out, "<{}/>", name)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<XmlToken> {
        XmlTokenReader::new(input)
            .collect::<Result<Vec<_>, _>>()
            .expect("parse")
    }

    #[test]
    fn basic_document() {
        let toks = tokens(
            "<?xml version=\"1.0\"?>\n<root version=\"1.1\">\n  <item>a &amp; b</item>\n</root>",
        );
        assert_eq!(
            toks,
            vec![
                XmlToken::Open {
                    name: "root".to_string(),
                    attrs: vec![("version".to_string(), "1.1".to_string())],
                },
                XmlToken::Open {
                    name: "item".to_string(),
                    attrs: vec![],
                },
                XmlToken::Text("a & b".to_string()),
                XmlToken::Close("item".to_string()),
                XmlToken::Close("root".to_string()),
            ]
        );
    }

    #[test]
    fn self_closing_emits_both() {
        let toks = tokens("<a><b/></a>");
        assert_eq!(
            toks,
            vec![
                XmlToken::Open {
                    name: "a".to_string(),
                    attrs: vec![],
                },
                XmlToken::Open {
                    name: "b".to_string(),
                    attrs: vec![],
                },
                XmlToken::Close("b".to_string()),
                XmlToken::Close("a".to_string()),
            ]
        );
    }

    #[test]
    fn numeric_entities() {
        let toks = tokens("<t>&#65;&#x42;</t>");
        assert_eq!(toks[1], XmlToken::Text("AB".to_string()));
    }

    #[test]
    fn comments_skipped() {
        let toks = tokens("<a><!-- nothing --><b></b></a>");
        assert_eq!(toks.len(), 4);
    }

    #[test]
    fn unterminated_is_error() {
        let result: Result<Vec<_>, _> = XmlTokenReader::new("<a><b").collect();
        assert!(result.is_err());
    }

    #[test]
    fn writer_output_parses_back() {
        let mut w = XmlWriter::new(Vec::new());
        w.declaration().unwrap();
        w.open("root", &[("version", "1.1")]).unwrap();
        w.element_text("title", "Pink < Floyd").unwrap();
        w.empty("marker").unwrap();
        w.close("root").unwrap();
        let text = String::from_utf8(w.into_inner()).unwrap();
        let toks = tokens(&text);
        assert_eq!(toks.len(), 7);
        assert_eq!(toks[2], XmlToken::Text("Pink < Floyd".to_string()));
    }
}
