//! Placeholder expression parsing
//!
//! Parses placeholder expressions like:
//! - `${env:VAR}` - provider with key
//! - `${ssm:secret:/path}` - provider, resolver type and key
//! - `${file(config.json):db.host}` - provider with parameters
//! - `${env:VAR, "default"}` - fallback literal
//! - `${env:VAR, ${self:other}}` - fallback placeholder
//! - `${self:${opt:stage}.url}` - nested placeholders inside an address
//!
//! A `${...}` block whose body has neither a `:` nor a `(...)` pair is not a
//! placeholder and stays literal text (`${foo}` is a shell-style variable,
//! not ours). Placeholders owned by other tools (`${AWS::Region}`,
//! `${PROP('x')}`, `${iot:ClientId}`, `${!Literal}`) are skipped as well.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

/// Single-candidate providers that belong to other tools
const FOREIGN_PROVIDERS: &[&str] = &["AWS", "PROP", "iot"];

/// A parsed `${...}` expression
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    /// Raw source text including `${` and `}`
    pub original: String,
    /// Primary candidate followed by fallbacks, in declaration order
    pub candidates: Vec<Candidate>,
}

/// One resolution attempt inside a placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    /// A quoted or bare JSON literal; always succeeds
    Literal(Value),
    /// `provider(params):type:key`
    Reference(Reference),
    /// A fallback that is itself a whole placeholder
    Nested(Arc<Placeholder>),
}

/// A provider lookup
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub provider: String,
    pub params: Option<Vec<Template>>,
    pub resolver_type: Option<Template>,
    pub key: Option<Template>,
}

/// Text that may embed nested placeholders
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    /// Quoted parameter literal
    Literal(Value),
    Nested(Arc<Placeholder>),
}

impl Placeholder {
    /// Placeholders nested directly inside this one
    pub fn children(&self) -> Vec<Arc<Placeholder>> {
        let mut out = Vec::new();
        for candidate in &self.candidates {
            match candidate {
                Candidate::Literal(_) => {}
                Candidate::Nested(p) => out.push(Arc::clone(p)),
                Candidate::Reference(r) => {
                    for template in r.templates() {
                        out.extend(template.nested().cloned());
                    }
                }
            }
        }
        out
    }

    /// Direct references of this placeholder (not those of nested ones)
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.candidates.iter().filter_map(|c| match c {
            Candidate::Reference(r) => Some(r),
            _ => None,
        })
    }

    /// Provider names used anywhere in this placeholder, nested ones included
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.references().map(|r| r.provider.clone()).collect();
        for child in self.children() {
            names.extend(child.providers());
        }
        names.dedup();
        names
    }
}

impl Reference {
    /// Parameter, type and key templates in source order
    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.params
            .iter()
            .flatten()
            .chain(self.resolver_type.iter())
            .chain(self.key.iter())
    }

    /// Key text when it holds no nested placeholders
    pub fn static_key(&self) -> Option<String> {
        match &self.key {
            None => Some(String::new()),
            Some(t) => t.as_text(),
        }
    }
}

impl Template {
    pub fn text(s: impl Into<String>) -> Self {
        Template {
            parts: vec![TemplatePart::Text(s.into())],
        }
    }

    /// Placeholders embedded in this template
    pub fn nested(&self) -> impl Iterator<Item = &Arc<Placeholder>> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Nested(n) => Some(n),
            _ => None,
        })
    }

    /// Plain text, if the template has no nested placeholders or literals
    pub fn as_text(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(t) => out.push_str(t),
                _ => return None,
            }
        }
        Some(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                TemplatePart::Text(t) => write!(f, "{}", t)?,
                TemplatePart::Literal(v) => write!(f, "{}", v)?,
                TemplatePart::Nested(p) => write!(f, "{}", p.original)?,
            }
        }
        Ok(())
    }
}

/// Quick check for placeholder syntax
pub fn contains_placeholder(s: &str) -> bool {
    s.contains("${")
}

/// Parse every top-level placeholder in a document scalar.
///
/// Returns an empty list for text with no placeholders. Fails with a syntax
/// error when a placeholder is opened and never closed, or when one of its
/// candidates is malformed.
pub fn parse_scalar(text: &str) -> Result<Vec<Arc<Placeholder>>> {
    Ok(scan_scalar(text)?.into_iter().map(|(_, p)| p).collect())
}

/// Like [`parse_scalar`], with the byte range each placeholder occupies
pub fn scan_scalar(text: &str) -> Result<Vec<(Range<usize>, Arc<Placeholder>)>> {
    if !contains_placeholder(text) {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for (start, end) in find_spans(text)? {
        let raw = &text[start..end];
        if !looks_like_placeholder(raw) {
            continue;
        }
        if let Some(p) = parse_placeholder(raw)? {
            found.push((start..end, p));
        }
    }
    Ok(found)
}

/// Parse a single `${...}` block. `Ok(None)` means the block is skipped.
pub fn parse_placeholder(raw: &str) -> Result<Option<Arc<Placeholder>>> {
    let body = raw
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| Error::syntax(raw, "expected a ${...} block"))?;

    let segments = split_top_level(body, b',', false);

    if let Some(first) = segments.first() {
        let provider = leading_name(first.trim());
        if provider.starts_with('!') || (segments.len() == 1 && FOREIGN_PROVIDERS.contains(&provider)) {
            log::trace!("Skipping foreign placeholder {}", raw);
            return Ok(None);
        }
    }

    let candidates = segments
        .iter()
        .map(|s| parse_candidate(s, raw))
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(Arc::new(Placeholder {
        original: raw.to_string(),
        candidates,
    })))
}

/// A `${...}` block counts as a placeholder only with a `:` or a `(`/`)` pair
fn looks_like_placeholder(raw: &str) -> bool {
    let tail = raw.get(2..).unwrap_or("");
    tail.contains(':') || (tail.contains('(') && tail.contains(')'))
}

/// Byte ranges of top-level `${...}` blocks
fn find_spans(text: &str) -> Result<Vec<(usize, usize)>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if depth == 0 {
                start = Some(i);
            }
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' && depth > 0 {
            depth -= 1;
            if depth == 0 {
                if let Some(s) = start.take() {
                    spans.push((s, i + 1));
                }
            }
        }
        i += 1;
    }

    if let Some(s) = start {
        let tail = &text[s..];
        if depth > 0 && looks_like_placeholder(tail) {
            return Err(Error::syntax(tail, "unterminated placeholder, missing '}'"));
        }
    }

    Ok(spans)
}

/// Split on `sep` outside parentheses, nested `${...}` and quoted segments
fn split_top_level(body: &str, sep: u8, first_only: bool) -> Vec<&str> {
    let bytes = body.as_bytes();
    let mut parts = Vec::new();
    let mut parens = 0i32;
    let mut braces = 0usize;
    let mut seg_start = 0;
    let mut at_seg_start = true;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if at_seg_start {
            if b.is_ascii_whitespace() {
                i += 1;
                continue;
            }
            at_seg_start = false;
            if (b == b'"' || b == b'\'') && parens == 0 && braces == 0 {
                i += 1;
                while i < bytes.len() && bytes[i] != b {
                    if b == b'"' && bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
                continue;
            }
        }

        if b == b'$' && bytes.get(i + 1) == Some(&b'{') {
            braces += 1;
            i += 2;
            continue;
        }
        match b {
            b'}' if braces > 0 => braces -= 1,
            b'(' => parens += 1,
            b')' => parens -= 1,
            _ => {}
        }

        if b == sep && parens == 0 && braces == 0 {
            parts.push(&body[seg_start..i]);
            seg_start = i + 1;
            at_seg_start = true;
            if first_only {
                break;
            }
        }
        i += 1;
    }

    parts.push(body.get(seg_start..).unwrap_or(""));
    parts
}

/// Provider-name prefix of a candidate: text before the first `:`, `(` or `)`
fn leading_name(segment: &str) -> &str {
    let end = segment.find([':', '(', ')']).unwrap_or(segment.len());
    segment[..end].trim()
}

fn is_quoted(segment: &str) -> bool {
    segment.len() >= 2
        && (segment.starts_with('"') || segment.starts_with('\''))
        && (segment.ends_with('"') || segment.ends_with('\''))
}

/// `'raw'` is taken verbatim, `"json"` is a JSON string
fn parse_quoted(segment: &str, original: &str) -> Result<Value> {
    if segment.starts_with('\'') && segment.ends_with('\'') {
        return Ok(Value::String(segment[1..segment.len() - 1].to_string()));
    }
    serde_json::from_str::<Value>(segment)
        .map_err(|e| Error::syntax(original, format!("invalid literal {}: {}", segment, e)))
}

fn is_valid_provider_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Index of the `)` closing the `(` at position 0
fn matching_paren(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, b) in text.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// True when the whole segment is one `${...}` block
fn is_whole_placeholder(segment: &str) -> bool {
    segment.starts_with("${")
        && matches!(find_spans(segment).as_deref(), Ok([(0, end)]) if *end == segment.len())
}

fn parse_candidate(segment: &str, original: &str) -> Result<Candidate> {
    let seg = segment.trim();
    if seg.is_empty() {
        return Err(Error::syntax(original, "empty candidate in placeholder"));
    }

    if is_quoted(seg) {
        return parse_quoted(seg, original).map(Candidate::Literal);
    }

    if is_whole_placeholder(seg) && looks_like_placeholder(seg) {
        return Ok(match parse_placeholder(seg)? {
            Some(p) => Candidate::Nested(p),
            None => Candidate::Literal(Value::String(seg.to_string())),
        });
    }

    let name_end = seg.find([':', '(', ')']).unwrap_or(seg.len());
    let provider = seg[..name_end].trim();
    let rest = &seg[name_end..];

    let (params_text, address_text) = if rest.starts_with('(') {
        let close = matching_paren(rest)
            .ok_or_else(|| Error::syntax(original, "unbalanced parentheses"))?;
        let after = &rest[close + 1..];
        let address = if after.is_empty() {
            None
        } else if let Some(a) = after.strip_prefix(':') {
            Some(a)
        } else {
            return Err(Error::syntax(
                original,
                format!("unexpected '{}' after parameters", after),
            ));
        };
        (Some(&rest[1..close]), address)
    } else if let Some(a) = rest.strip_prefix(':') {
        (None, Some(a))
    } else if rest.is_empty() {
        (None, None)
    } else {
        return Err(Error::syntax(original, format!("unexpected '{}'", rest)));
    };

    // A bare name with neither parameters nor address is a JSON literal
    if params_text.is_none() && address_text.is_none() {
        return serde_json::from_str::<Value>(seg)
            .map(Candidate::Literal)
            .map_err(|_| {
                Error::syntax(
                    original,
                    format!("'{}' is neither a reference nor a valid literal", seg),
                )
            });
    }

    if !is_valid_provider_name(provider) {
        return Err(Error::syntax(
            original,
            format!("invalid provider name '{}'", provider),
        ));
    }

    let params = params_text
        .map(|text| {
            split_top_level(text, b',', false)
                .into_iter()
                .map(|p| parse_param(p.trim(), original))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let (resolver_type, key) = match address_text {
        None => (None, None),
        Some(address) => {
            let pieces = split_top_level(address, b':', true);
            match pieces.as_slice() {
                [ty, key] => {
                    let ty = if ty.is_empty() {
                        None
                    } else {
                        Some(parse_template(ty)?)
                    };
                    (ty, Some(parse_template(key)?))
                }
                _ => (None, Some(parse_template(address)?)),
            }
        }
    };

    Ok(Candidate::Reference(Reference {
        provider: provider.to_string(),
        params,
        resolver_type,
        key,
    }))
}

fn parse_param(text: &str, original: &str) -> Result<Template> {
    if is_quoted(text) {
        return Ok(Template {
            parts: vec![TemplatePart::Literal(parse_quoted(text, original)?)],
        });
    }
    parse_template(text)
}

/// Split text into literal runs and nested placeholders
fn parse_template(text: &str) -> Result<Template> {
    let mut parts = Vec::new();
    let mut cursor = 0;

    for (start, end) in find_spans(text)? {
        let raw = &text[start..end];
        if !looks_like_placeholder(raw) {
            continue;
        }
        let Some(nested) = parse_placeholder(raw)? else {
            continue;
        };
        if start > cursor {
            parts.push(TemplatePart::Text(text[cursor..start].to_string()));
        }
        parts.push(TemplatePart::Nested(nested));
        cursor = end;
    }

    if cursor < text.len() || parts.is_empty() {
        parts.push(TemplatePart::Text(text[cursor..].to_string()));
    }

    Ok(Template { parts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn one(text: &str) -> Arc<Placeholder> {
        let mut found = parse_scalar(text).unwrap();
        assert_eq!(found.len(), 1, "expected exactly one placeholder in {}", text);
        found.remove(0)
    }

    fn reference(c: &Candidate) -> &Reference {
        match c {
            Candidate::Reference(r) => r,
            other => panic!("expected reference, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_has_no_placeholders() {
        assert!(parse_scalar("hello world").unwrap().is_empty());
        assert!(parse_scalar("").unwrap().is_empty());
        assert!(!contains_placeholder("$ {x}"));
    }

    #[test]
    fn test_provider_and_key() {
        let p = one("${env:HOME}");
        assert_eq!(p.original, "${env:HOME}");
        let r = reference(&p.candidates[0]);
        assert_eq!(r.provider, "env");
        assert_eq!(r.resolver_type, None);
        assert_eq!(r.key, Some(Template::text("HOME")));
        assert_eq!(r.params, None);
    }

    #[test]
    fn test_provider_type_and_key() {
        let p = one("${vault:secret:path/to:thing}");
        let r = reference(&p.candidates[0]);
        assert_eq!(r.provider, "vault");
        assert_eq!(r.resolver_type, Some(Template::text("secret")));
        assert_eq!(r.key, Some(Template::text("path/to:thing")));
    }

    #[test]
    fn test_params() {
        let p = one("${mock(myParam, 'quoted', \"json\"):myKey}");
        let r = reference(&p.candidates[0]);
        assert_eq!(
            r.params,
            Some(vec![
                Template::text("myParam"),
                Template {
                    parts: vec![TemplatePart::Literal(Value::from("quoted"))]
                },
                Template {
                    parts: vec![TemplatePart::Literal(Value::from("json"))]
                },
            ])
        );
        assert_eq!(r.static_key(), Some("myKey".into()));
    }

    #[test]
    fn test_params_without_address() {
        let p = one("${file(./config.json)}");
        let r = reference(&p.candidates[0]);
        assert_eq!(r.provider, "file");
        assert_eq!(r.params, Some(vec![Template::text("./config.json")]));
        assert_eq!(r.key, None);
    }

    #[test]
    fn test_fallbacks() {
        let p = one("${env:MISSING, 'raw', \"json\", 42, true, null, ${self:other}}");
        assert_eq!(p.candidates.len(), 7);
        assert_eq!(p.candidates[1], Candidate::Literal(Value::from("raw")));
        assert_eq!(p.candidates[2], Candidate::Literal(Value::from("json")));
        assert_eq!(p.candidates[3], Candidate::Literal(Value::Integer(42)));
        assert_eq!(p.candidates[4], Candidate::Literal(Value::Bool(true)));
        assert_eq!(p.candidates[5], Candidate::Literal(Value::Null));
        match &p.candidates[6] {
            Candidate::Nested(n) => assert_eq!(n.original, "${self:other}"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quoted_fallback_may_contain_commas() {
        let p = one("${env:X, \"a, b\"}");
        assert_eq!(p.candidates.len(), 2);
        assert_eq!(p.candidates[1], Candidate::Literal(Value::from("a, b")));
    }

    #[test]
    fn test_reference_fallback() {
        let p = one("${env:A, env:B}");
        assert_eq!(reference(&p.candidates[1]).provider, "env");
    }

    #[test]
    fn test_nested_in_key_and_params() {
        let p = one("${mock(${mock:echo}):value:${self:k}}");
        let r = reference(&p.candidates[0]);
        assert_eq!(r.params.as_ref().unwrap()[0].nested().count(), 1);
        assert_eq!(r.resolver_type, Some(Template::text("value")));
        assert_eq!(r.key.as_ref().unwrap().nested().next().unwrap().original, "${self:k}");

        let children: Vec<String> = p.children().iter().map(|c| c.original.clone()).collect();
        assert_eq!(children, vec!["${mock:echo}", "${self:k}"]);
        assert_eq!(p.providers(), vec!["mock", "self"]);
    }

    #[test]
    fn test_nested_template_keeps_surrounding_text() {
        let p = one("${self:custom.${opt:stage}.url}");
        let key = reference(&p.candidates[0]).key.clone().unwrap();
        assert_eq!(key.parts.len(), 3);
        assert_eq!(key.to_string(), "custom.${opt:stage}.url");
        assert_eq!(key.as_text(), None);
    }

    #[test]
    fn test_multiple_placeholders_in_one_scalar() {
        let found = parse_scalar("${env:A}-${env:B}/${self:c}").unwrap();
        let originals: Vec<&str> = found.iter().map(|p| p.original.as_str()).collect();
        assert_eq!(originals, vec!["${env:A}", "${env:B}", "${self:c}"]);
    }

    #[test]
    fn test_scan_scalar_reports_spans() {
        let text = "${HOME} and ${env:USER}-${env:USER}";
        let spans: Vec<_> = scan_scalar(text).unwrap().into_iter().map(|(span, _)| span).collect();
        assert_eq!(spans, vec![12..23, 24..35]);
        assert_eq!(&text[spans[1].clone()], "${env:USER}");
    }

    #[test]
    fn test_non_placeholder_blocks_stay_literal() {
        assert!(parse_scalar("echo ${HOME}").unwrap().is_empty());
        let found = parse_scalar("${HOME} and ${env:USER}").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].original, "${env:USER}");
    }

    #[test]
    fn test_foreign_placeholders_are_skipped() {
        assert!(parse_scalar("arn:aws:s3:::${AWS::Region}").unwrap().is_empty());
        assert!(parse_scalar("${iot:Connection.Thing.ThingName}").unwrap().is_empty());
        assert!(parse_scalar("${PROP('Dim.FunctionName')}").unwrap().is_empty());
        assert!(parse_scalar("${!Ref:literal}").unwrap().is_empty());
        // With a fallback the AWS name is an ordinary provider
        assert_eq!(parse_scalar("${AWS:x, 'y'}").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_key() {
        let p = one("${self:}");
        assert_eq!(reference(&p.candidates[0]).static_key(), Some(String::new()));
    }

    #[test]
    fn test_unterminated_placeholder_is_syntax_error() {
        let err = parse_scalar("prefix ${env:HOME").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
        assert_eq!(err.expression.as_deref(), Some("${env:HOME"));
    }

    #[test]
    fn test_invalid_literal_is_syntax_error() {
        let err = parse_scalar("${env:A, not valid}").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
        assert_eq!(err.expression.as_deref(), Some("${env:A, not valid}"));
    }

    #[test]
    fn test_invalid_provider_name_is_syntax_error() {
        assert!(parse_scalar("${bad name:key}").is_err());
        assert!(parse_scalar("${env(a)b}").is_err());
        assert!(parse_scalar("${env(a:b}").is_err());
        assert!(parse_scalar("${env:A,}").is_err());
    }
}
