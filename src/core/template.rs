//! Bidirectional path templates
//!
//! A [`Template`] is built from a format string such as
//! `{Sequence.code}/{Shot.code}/v{version:03d}`. It renders a path from named
//! fields and parses a path back into those fields through a generated,
//! anchored regular expression.
//!
//! Placeholder specs follow `[0][width][.precision][type]` where type is one
//! of `d`, `f`, `e`, `g` (and their uppercase forms) or `s`. `{{` and `}}`
//! are literal braces.

use std::fmt;

use regex::Regex;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::core::store::Record;

/// Errors building, rendering or matching a template
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("invalid template '{template}': {message}")]
    Format { template: String, message: String },

    #[error("'{path}' does not match template '{template}'")]
    NoMatch { template: String, path: String },

    #[error("cannot read '{value}' as {kind} for field '{field}'")]
    Coerce {
        field: String,
        value: String,
        kind: &'static str,
    },

    #[error("missing field '{0}'")]
    MissingField(String),
}

/// Parsed `[0][width][.precision][type]` placeholder spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Spec {
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl Spec {
    fn parse(spec: &str) -> Option<Self> {
        let mut out = Spec::default();
        let mut rest = spec;

        if let Some(kind) = rest.chars().last().filter(|c| c.is_ascii_alphabetic()) {
            if !matches!(kind, 'd' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 's') {
                return None;
            }
            out.kind = Some(kind);
            rest = &rest[..rest.len() - 1];
        }

        let (width, precision) = match rest.split_once('.') {
            Some((w, p)) => (w, Some(p)),
            None => (rest, None),
        };

        if let Some(p) = precision {
            out.precision = Some(p.parse().ok()?);
        }
        if let Some(w) = width.strip_prefix('0') {
            out.zero = true;
            if !w.is_empty() {
                out.width = Some(w.parse().ok()?);
            }
        } else if !width.is_empty() {
            out.width = Some(width.parse().ok()?);
        }
        Some(out)
    }

    fn is_float(&self) -> bool {
        matches!(self.kind, Some('f' | 'F' | 'e' | 'E' | 'g' | 'G'))
    }

    /// Capture pattern for values rendered with this spec
    fn pattern(&self) -> &'static str {
        match self.kind {
            Some('d') if self.width.is_some() && !self.zero => r"\s*[-+]?\d+",
            Some('d') => r"[-+]?\d+",
            _ if self.is_float() => {
                r"\s*(?:[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?|[-+]?(?i:inf|nan))"
            }
            _ => ".+?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field { name: String, spec: Spec },
}

/// A bidirectional path template
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    regex: Regex,
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Template {
    pub fn new(source: &str) -> Result<Self, TemplateError> {
        let segments = parse_segments(source)?;

        let mut pattern = String::from("^");
        let mut group = 0;
        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Field { spec, .. } => {
                    pattern.push_str(&format!("(?P<g{}>{})", group, spec.pattern()));
                    group += 1;
                }
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| TemplateError::Format {
            template: source.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            source: source.to_string(),
            segments,
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Distinct field names in order of first appearance
    pub fn fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Field { name, .. } = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute field values; dotted names walk nested mappings
    pub fn render(&self, fields: &Record) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field { name, spec } => {
                    let value = lookup(fields, name)
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| TemplateError::MissingField(name.clone()))?;
                    out.push_str(&format_value(name, value, spec)?);
                }
            }
        }
        Ok(out)
    }

    /// Parse a path rendered by this template back into its fields
    pub fn match_path(&self, path: &str) -> Result<Record, TemplateError> {
        let captures = self.regex.captures(path).ok_or_else(|| TemplateError::NoMatch {
            template: self.source.clone(),
            path: path.to_string(),
        })?;

        let mut raw: Vec<(&str, &Spec, &str)> = Vec::new();
        let mut group = 0;
        for segment in &self.segments {
            if let Segment::Field { name, spec } = segment {
                let text = captures
                    .name(&format!("g{}", group))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                raw.push((name.as_str(), spec, text));
                group += 1;
            }
        }

        let mut out = Record::new();
        for (i, (name, spec, text)) in raw.iter().enumerate() {
            // A repeated placeholder must capture the same text every time
            if raw[..i].iter().any(|(n, _, t)| n == name && t != text) {
                return Err(TemplateError::NoMatch {
                    template: self.source.clone(),
                    path: path.to_string(),
                });
            }
            insert_dotted(&mut out, name, coerce(name, spec, text)?);
        }
        Ok(out)
    }
}

fn parse_segments(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let err = |message: &str| TemplateError::Format {
        template: source.to_string(),
        message: message.to_string(),
    };

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(err("single '}' outside a placeholder")),
            '{' => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => return Err(err("nested '{' in placeholder")),
                        Some(c) => body.push(c),
                        None => return Err(err("unclosed '{'")),
                    }
                }

                let (name, spec) = match body.split_once(':') {
                    Some((name, spec)) => (name.trim(), spec.trim()),
                    None => (body.trim(), ""),
                };
                if name.is_empty()
                    || name.split('.').any(|part| part.is_empty())
                    || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
                {
                    return Err(err(&format!("invalid field name '{}'", name)));
                }
                let spec =
                    Spec::parse(spec).ok_or_else(|| err(&format!("invalid format spec '{}'", spec)))?;

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field {
                    name: name.to_string(),
                    spec,
                });
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn lookup<'a>(fields: &'a Record, name: &str) -> Option<&'a JsonValue> {
    let mut parts = name.split('.');
    let mut value = fields.get(parts.next()?)?;
    for part in parts {
        value = match value {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn insert_dotted(out: &mut Record, name: &str, value: JsonValue) {
    let mut parts: Vec<&str> = name.split('.').collect();
    let last = parts.pop().unwrap_or(name);
    let mut map: &mut Map<String, JsonValue> = out;
    for part in parts {
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !entry.is_object() {
            *entry = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(inner) = entry else {
            return;
        };
        map = inner;
    }
    map.insert(last.to_string(), value);
}

fn coerce(name: &str, spec: &Spec, text: &str) -> Result<JsonValue, TemplateError> {
    let fail = |kind: &'static str| TemplateError::Coerce {
        field: name.to_string(),
        value: text.to_string(),
        kind,
    };
    let trimmed = text.trim();

    match spec.kind {
        Some('d') => trimmed.parse::<i64>().map(JsonValue::from).map_err(|_| fail("integer")),
        Some('s') => Ok(JsonValue::String(text.to_string())),
        _ if spec.is_float() => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| fail("float")),
        _ => {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(JsonValue::from(i));
            }
            if let Some(n) = text.parse::<f64>().ok().and_then(Number::from_f64) {
                return Ok(JsonValue::Number(n));
            }
            Ok(JsonValue::String(text.to_string()))
        }
    }
}

fn format_value(name: &str, value: &JsonValue, spec: &Spec) -> Result<String, TemplateError> {
    let fail = |kind: &'static str| TemplateError::Coerce {
        field: name.to_string(),
        value: value.to_string(),
        kind,
    };

    let body = match spec.kind {
        Some('d') => {
            let i = match value {
                JsonValue::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                JsonValue::String(s) => s.trim().parse().ok(),
                JsonValue::Bool(b) => Some(*b as i64),
                _ => None,
            }
            .ok_or_else(|| fail("integer"))?;
            return Ok(pad_number(i.to_string(), spec));
        }
        Some(kind) if spec.is_float() => {
            let f = match value {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| fail("float"))?;
            let precision = spec.precision.unwrap_or(6);
            let text = match kind.to_ascii_lowercase() {
                'f' => format!("{:.*}", precision, f),
                'e' => format_exponent(f, precision),
                _ => format_general(f, precision),
            };
            let text = if kind.is_ascii_uppercase() {
                text.to_uppercase()
            } else {
                text
            };
            return Ok(pad_number(text, spec));
        }
        _ => match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        },
    };

    let body = match spec.precision {
        Some(p) => body.chars().take(p).collect(),
        None => body,
    };
    Ok(match spec.width {
        Some(w) => format!("{:<w$}", body, w = w),
        None => body,
    })
}

/// Right-align a rendered number, zero-padding after the sign when requested
fn pad_number(text: String, spec: &Spec) -> String {
    let Some(width) = spec.width else {
        return text;
    };
    let len = text.chars().count();
    if len >= width {
        return text;
    }
    if spec.zero {
        let (sign, digits) = match text.strip_prefix(['-', '+']) {
            Some(rest) => (&text[..1], rest),
            None => ("", text.as_str()),
        };
        format!("{}{}{}", sign, "0".repeat(width - len), digits)
    } else {
        format!("{:>w$}", text, w = width)
    }
}

/// `1.5e+00` style exponent notation
fn format_exponent(f: f64, precision: usize) -> String {
    let text = format!("{:.*e}", precision, f);
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text,
    }
}

/// Shortest of fixed or exponent notation with `precision` significant digits
fn format_general(f: f64, precision: usize) -> String {
    if !f.is_finite() {
        return f.to_string();
    }
    let precision = precision.max(1);
    if f == 0.0 {
        return "0".to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if exp < -4 || exp >= precision as i32 {
        let text = format_exponent(f, precision - 1);
        match text.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{}", strip_zeros(mantissa), exp),
            None => text,
        }
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, f)).to_string()
    }
}

fn strip_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: JsonValue) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_render_simple() {
        let t = Template::new("{Sequence.code}/{Shot.code}/v{version:03d}").unwrap();
        let out = t
            .render(&fields(json!({
                "Sequence": {"code": "AA"},
                "Shot": {"code": "AA_010"},
                "version": 7
            })))
            .unwrap();
        assert_eq!(out, "AA/AA_010/v007");
    }

    #[test]
    fn test_render_float_and_width() {
        let t = Template::new("{a:.2f}|{c:6.1f}|{d:08.3f}|{e:5d}|{s:4s}|").unwrap();
        let out = t
            .render(&fields(json!({"a": 1.5, "c": 2.3, "d": -3.5, "e": 42, "s": "ab"})))
            .unwrap();
        assert_eq!(out, "1.50|   2.3|-003.500|   42|ab  |");
    }

    #[test]
    fn test_render_exponent_and_general() {
        let t = Template::new("{a:e}|{b:.2e}|{c:g}|{d:g}").unwrap();
        let out = t
            .render(&fields(json!({"a": 1500.0, "b": 0.00012, "c": 0.5, "d": 1234567.0})))
            .unwrap();
        assert_eq!(out, "1.500000e+03|1.20e-04|0.5|1.23457e+06");
    }

    #[test]
    fn test_render_missing_field() {
        let t = Template::new("{Shot.code}").unwrap();
        assert_eq!(
            t.render(&fields(json!({"Shot": {}}))),
            Err(TemplateError::MissingField("Shot.code".to_string()))
        );
    }

    #[test]
    fn test_escaped_braces() {
        let t = Template::new("{{{name}}}").unwrap();
        assert_eq!(t.render(&fields(json!({"name": "x"}))).unwrap(), "{x}");
        assert_eq!(t.match_path("{x}").unwrap(), fields(json!({"name": "x"})));
    }

    #[test]
    fn test_invalid_templates() {
        for bad in ["{", "}", "{}", "{a:q}", "{a..b}", "{a{b}}"] {
            assert!(
                matches!(Template::new(bad), Err(TemplateError::Format { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_match_coerces_by_spec() {
        let t = Template::new("{shot:s}_{version:03d}_{scale:f}_{other}").unwrap();
        let parsed = t.match_path("010_012_0.5_2.5").unwrap();
        assert_eq!(
            parsed,
            fields(json!({"shot": "010", "version": 12, "scale": 0.5, "other": 2.5}))
        );
    }

    #[test]
    fn test_match_untyped_falls_back_to_string() {
        let t = Template::new("{a}/{b}/{c}").unwrap();
        let parsed = t.match_path("12/1.5/abc").unwrap();
        assert_eq!(parsed, fields(json!({"a": 12, "b": 1.5, "c": "abc"})));
    }

    #[test]
    fn test_match_dotted_names_nest() {
        let t = Template::new("{Sequence.code}/{Shot.code}").unwrap();
        let parsed = t.match_path("AA/AA_010").unwrap();
        assert_eq!(
            parsed,
            fields(json!({"Sequence": {"code": "AA"}, "Shot": {"code": "AA_010"}}))
        );
    }

    #[test]
    fn test_match_failures() {
        let t = Template::new("v{version:d}").unwrap();
        assert!(matches!(t.match_path("vx"), Err(TemplateError::NoMatch { .. })));
        assert!(matches!(t.match_path("v1/extra"), Err(TemplateError::NoMatch { .. })));

        let t = Template::new("{n:d}").unwrap();
        assert!(matches!(
            t.match_path("99999999999999999999"),
            Err(TemplateError::Coerce { kind: "integer", .. })
        ));
    }

    #[test]
    fn test_repeated_fields_must_agree() {
        let t = Template::new("{code}/{code}.txt").unwrap();
        assert!(t.match_path("a/a.txt").is_ok());
        assert!(matches!(t.match_path("a/b.txt"), Err(TemplateError::NoMatch { .. })));
    }

    #[test]
    fn test_round_trip() {
        let t = Template::new(
            "{Project.name}/SEQ/{Sequence.code}/{Shot.code}/{step:s}/v{version:03d}/{Shot.code}_{frame:04d}.{scale:.2f}.{ext}",
        )
        .unwrap();
        let values = fields(json!({
            "Project": {"name": "demo"},
            "Sequence": {"code": "AA"},
            "Shot": {"code": "AA_010"},
            "step": "anim",
            "version": 3,
            "frame": 1001,
            "scale": 0.75,
            "ext": "exr"
        }));
        let path = t.render(&values).unwrap();
        assert_eq!(
            path,
            "demo/SEQ/AA/AA_010/anim/v003/AA_010_1001.0.75.exr"
        );
        assert_eq!(t.match_path(&path).unwrap(), values);
    }

    #[test]
    fn test_fields_in_order() {
        let t = Template::new("{b}/{a}/{b}").unwrap();
        assert_eq!(t.fields(), vec!["b", "a"]);
    }
}
