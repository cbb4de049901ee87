//! YAML error diagnostics pointing at the offending schema line

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// YAML syntax or shape error with source location
#[derive(Debug, Error, Diagnostic)]
#[error("invalid YAML in {filename}: {message}")]
#[diagnostic(code(tfs::yaml::syntax))]
pub struct YamlSyntaxError {
    #[source_code]
    src: NamedSource<String>,

    #[label("error here")]
    span: SourceSpan,

    #[help]
    help: Option<String>,

    filename: String,

    /// The underlying error message
    message: String,
}

impl YamlSyntaxError {
    /// Create a diagnostic from a serde_yml error
    pub fn from_serde_error(err: &serde_yml::Error, source: &str, filename: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let offset = line_col_to_offset(source, line, column);
        let message = err.to_string();
        let help = generate_help(&message);

        Self {
            src: NamedSource::new(filename, source.to_string()),
            span: SourceSpan::from(offset..offset.saturating_add(1)),
            help,
            filename: filename.to_string(),
            message,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Convert a 1-based line/column to a byte offset
fn line_col_to_offset(source: &str, line: usize, column: usize) -> usize {
    let mut current_line = 1;
    let mut line_start = 0;

    for (i, ch) in source.char_indices() {
        if current_line == line {
            break;
        }
        if ch == '\n' {
            current_line += 1;
            line_start = i + 1;
        }
    }
    if current_line < line {
        return source.len().saturating_sub(1);
    }

    let line_text = &source[line_start..];
    let line_len = line_text.find('\n').unwrap_or(line_text.len());
    line_text
        .char_indices()
        .nth(column.saturating_sub(1))
        .map(|(j, _)| line_start + j.min(line_len))
        .unwrap_or(line_start + line_len)
}

/// Suggestions for common schema authoring mistakes
fn generate_help(message: &str) -> Option<String> {
    let msg_lower = message.to_lowercase();

    if msg_lower.contains("unknown field") {
        return Some(
            "Schema nodes accept: type, entity_type, name, name_expr, name_format, condition, template, include, children, contents".to_string(),
        );
    }

    if msg_lower.contains("tab") {
        return Some(
            "YAML requires spaces for indentation, not tabs. Replace tabs with spaces.".to_string(),
        );
    }

    if msg_lower.contains("duplicate key") || msg_lower.contains("duplicate entry") {
        return Some("Each key can only appear once. Remove or rename the duplicate key.".to_string());
    }

    if msg_lower.contains("mapping values are not allowed") {
        return Some("You may be missing a space after ':' or have incorrect indentation.".to_string());
    }

    if msg_lower.contains("invalid type") {
        return Some(
            "`children` maps entity types to a file name or an inline node; `contents` is a list of the same".to_string(),
        );
    }

    if msg_lower.contains("found unexpected ':'") || msg_lower.contains("did not find expected") {
        return Some("Expressions containing ':' or '{' must be quoted".to_string());
    }

    None
}
