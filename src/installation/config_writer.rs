//! Render collected answers into the persisted Nix module.
//!
//! The module's attribute-set body is scanned, including values that are
//! literal attribute sets. Each addressed field that already has a
//! `path = value;` statement, at any depth, gets its value replaced in place.
//! Missing fields are added in a fixed order to the deepest set enclosing
//! them. Every other byte of the document is preserved.

use crate::error::WizardError;
use crate::installation::files::{self, StagedFile};
use crate::models::{Answers, WifiCredentials};
use crate::security::crypto::sha256_hex;
use crate::settings::WizardSettings;
use crate::utils::validation::validate_ssh_public_key;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};

/// Starting point when the document does not exist yet.
pub const MODULE_SKELETON: &str =
    "# Written by setup-tool during first boot.\n{ config, lib, pkgs, ... }:\n\n{\n}\n";

const DEFAULT_INDENT: &str = "  ";

pub const FIELD_HOSTNAME: &str = "networking.hostName";
pub const FIELD_TIMEZONE: &str = "time.timeZone";
pub const FIELD_ROOT_KEYS: &str = "users.users.root.openssh.authorizedKeys.keys";
pub const FIELD_PASSWORD_AUTH: &str = "services.openssh.settings.PasswordAuthentication";
pub const FIELD_WIFI_ENABLE: &str = "networking.wireless.enable";
pub const FIELD_WIFI_NETWORKS: &str = "networking.wireless.networks";

/// A fully rendered document and what changed relative to the previous one.
pub struct ConfigMutation {
    pub document: String,
    /// Fields whose existing statement was rewritten in place.
    pub overwritten: Vec<String>,
    /// Fields appended to the body.
    pub inserted: Vec<String>,
}

impl std::fmt::Debug for ConfigMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The document may hold a wifi passphrase.
        f.debug_struct("ConfigMutation")
            .field("document_len", &self.document.len())
            .field("overwritten", &self.overwritten)
            .field("inserted", &self.inserted)
            .finish()
    }
}

/// Document written to a temp file, not yet visible at the target path.
#[derive(Debug)]
pub struct StagedDocument {
    file: StagedFile,
    sha256: String,
}

impl StagedDocument {
    #[cfg(test)]
    pub fn temp_path(&self) -> &Path {
        self.file.temp_path()
    }

    /// Back up the previous document, rename into place, then re-read and
    /// compare the digest.
    pub fn commit(self) -> Result<Option<PathBuf>, WizardError> {
        let expected = self.sha256;
        let backup = files::backup_existing(self.file.target())?;
        if let Some(path) = backup.as_ref() {
            info!(
                "[PHASE: apply] [STEP: document] previous document saved as {:?}",
                path
            );
        }
        let target = self.file.commit()?;
        let written = std::fs::read(&target)
            .map_err(|e| WizardError::write(&target, format!("re-read failed: {}", e)))?;
        let actual = sha256_hex(&written);
        if actual != expected {
            return Err(WizardError::write(
                &target,
                format!("checksum mismatch (expected={}, actual={})", expected, actual),
            ));
        }
        info!(
            "[PHASE: apply] [STEP: document] committed {:?} (sha256={})",
            target, actual
        );
        Ok(backup)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigWriter {
    document: PathBuf,
    runner_attribute: String,
    token_file: PathBuf,
}

enum Value<'a> {
    Str(String),
    Bool(bool),
    List(Vec<String>),
    Networks(Option<&'a WifiCredentials>),
}

struct Field<'a> {
    path: Vec<String>,
    value: Value<'a>,
}

impl ConfigWriter {
    pub fn new(
        document: impl Into<PathBuf>,
        runner_attribute: impl Into<String>,
        token_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            document: document.into(),
            runner_attribute: runner_attribute.into(),
            token_file: token_file.into(),
        }
    }

    pub fn from_settings(settings: &WizardSettings) -> Self {
        Self::new(
            &settings.paths.document,
            &settings.runner.attribute,
            &settings.runner.token_file,
        )
    }

    pub fn document_path(&self) -> &Path {
        &self.document
    }

    /// Render against the document currently on disk (or the skeleton).
    pub fn render(&self, answers: &Answers) -> Result<ConfigMutation, WizardError> {
        let existing = match std::fs::read(&self.document) {
            Ok(bytes) => Some(String::from_utf8(bytes).map_err(|_| {
                WizardError::write(&self.document, "existing document is not valid UTF-8")
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(WizardError::write(
                    &self.document,
                    format!("read failed: {}", e),
                ))
            }
        };
        self.render_from(existing.as_deref(), answers)
    }

    /// Pure rendering step: same input and answers give the same bytes.
    pub fn render_from(
        &self,
        existing: Option<&str>,
        answers: &Answers,
    ) -> Result<ConfigMutation, WizardError> {
        let source = existing.unwrap_or(MODULE_SKELETON);
        let body = locate_body(source).map_err(|reason| {
            WizardError::write(&self.document, format!("cannot locate module body: {}", reason))
        })?;

        let fields = self.fields(answers);
        let mut edits: Vec<(usize, usize, String)> = Vec::new();
        let mut overwritten = Vec::new();
        let mut inserted = Vec::new();
        // (block, statements to add), in field order per block.
        let mut pending: Vec<(&Block, Vec<(String, &Value<'_>)>)> = Vec::new();

        for field in &fields {
            let name = render_path(&field.path);
            let mut found = Lookup {
                exact: Vec::new(),
                host: (&body, 0),
            };
            lookup(&body, &field.path, 0, &mut found).map_err(|reason| {
                WizardError::write(&self.document, format!("cannot edit {}: {}", name, reason))
            })?;

            match found.exact.first() {
                Some(stmt) => {
                    if found.exact.len() > 1 {
                        warn!(
                            "[PHASE: apply] [STEP: document] {} is assigned more than once; rewriting the first assignment only",
                            name
                        );
                    }
                    let stmt_indent = line_indent(source, stmt.start);
                    let value_start = stmt.eq.unwrap_or(stmt.start) + 1;
                    edits.push((
                        value_start,
                        stmt.end,
                        format!(" {}", render_value(&field.value, stmt_indent)),
                    ));
                    overwritten.push(name);
                }
                None => {
                    let (host, consumed) = found.host;
                    let relative = render_path(&field.path[consumed..]);
                    match pending.iter_mut().find(|(b, _)| std::ptr::eq(*b, host)) {
                        Some((_, list)) => list.push((relative, &field.value)),
                        None => pending.push((host, vec![(relative, &field.value)])),
                    }
                    inserted.push(name);
                }
            }
        }

        for (block, additions) in pending {
            edits.push(insertion(source, block, std::ptr::eq(block, &body), &additions));
        }

        edits.sort_by_key(|(start, _, _)| *start);
        let mut document = String::with_capacity(source.len() + 512);
        let mut cursor = 0;
        for (start, end, text) in edits {
            document.push_str(&source[cursor..start]);
            document.push_str(&text);
            cursor = end;
        }
        document.push_str(&source[cursor..]);

        debug!(
            "[PHASE: apply] [STEP: document] rendered (overwritten={}, inserted={}, bytes={})",
            overwritten.len(),
            inserted.len(),
            document.len()
        );

        Ok(ConfigMutation {
            document,
            overwritten,
            inserted,
        })
    }

    /// Write the rendered document to a temp file beside the target.
    pub fn stage(&self, mutation: &ConfigMutation) -> Result<StagedDocument, WizardError> {
        let file = files::stage(&self.document, mutation.document.as_bytes(), 0o644)?;
        Ok(StagedDocument {
            file,
            sha256: sha256_hex(mutation.document.as_bytes()),
        })
    }

    /// Render, stage and commit in one go.
    pub fn write(&self, answers: &Answers) -> Result<ConfigMutation, WizardError> {
        let mutation = self.render(answers)?;
        self.stage(&mutation)?.commit()?;
        Ok(mutation)
    }

    fn fields<'a>(&self, answers: &'a Answers) -> Vec<Field<'a>> {
        let mut fields = Vec::new();
        let field = |path: &str, value: Value<'a>| Field {
            path: path.split('.').map(str::to_string).collect(),
            value,
        };

        if let Some(hostname) = answers.hostname() {
            fields.push(field(FIELD_HOSTNAME, Value::Str(hostname.to_string())));
        }
        if let Some(timezone) = answers.timezone() {
            fields.push(field(FIELD_TIMEZONE, Value::Str(timezone.to_string())));
        }

        // Keys are re-validated here; password login is only turned off when
        // at least one of them survives.
        let keys: Vec<String> = answers
            .keys()
            .map(|set| {
                set.iter()
                    .filter(|e| e.valid)
                    .filter_map(|e| validate_ssh_public_key(&e.key).ok())
                    .collect()
            })
            .unwrap_or_default();
        let password_auth = keys.is_empty();
        fields.push(field(FIELD_ROOT_KEYS, Value::List(keys)));
        fields.push(field(FIELD_PASSWORD_AUTH, Value::Bool(password_auth)));

        let runner_path = |leaf: &str| Field {
            path: vec![
                "services".to_string(),
                "github-runners".to_string(),
                self.runner_attribute.clone(),
                leaf.to_string(),
            ],
            value: Value::Bool(false),
        };
        match answers.runner() {
            Some(runner) => {
                fields.push(Field {
                    value: Value::Bool(true),
                    ..runner_path("enable")
                });
                fields.push(Field {
                    value: Value::Str(runner.name.clone()),
                    ..runner_path("name")
                });
                fields.push(Field {
                    value: Value::Str(runner.url.url().to_string()),
                    ..runner_path("url")
                });
                fields.push(Field {
                    value: Value::Str(self.token_file.display().to_string()),
                    ..runner_path("tokenFile")
                });
                fields.push(Field {
                    value: Value::List(runner.labels.clone()),
                    ..runner_path("extraLabels")
                });
            }
            None => fields.push(runner_path("enable")),
        }

        let wifi = answers.wifi();
        fields.push(field(FIELD_WIFI_ENABLE, Value::Bool(wifi.is_some())));
        fields.push(field(FIELD_WIFI_NETWORKS, Value::Networks(wifi)));

        fields
    }
}

fn render_value(value: &Value<'_>, indent: &str) -> String {
    match value {
        Value::Str(s) => nix_string(s),
        Value::Bool(b) => b.to_string(),
        Value::List(items) if items.is_empty() => "[ ]".to_string(),
        Value::List(items) => {
            let mut out = String::from("[\n");
            for item in items {
                out.push_str(&format!("{}  {}\n", indent, nix_string(item)));
            }
            out.push_str(&format!("{}]", indent));
            out
        }
        Value::Networks(None) => "{ }".to_string(),
        Value::Networks(Some(wifi)) => format!(
            "{{ {}.psk = {}; }}",
            nix_string(&wifi.ssid),
            nix_string(wifi.passphrase.expose_secret())
        ),
    }
}

/// Double-quoted Nix string literal.
pub fn nix_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn is_plain_attr(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '\'' | '-'))
}

fn render_path(path: &[String]) -> String {
    path.iter()
        .map(|seg| {
            if is_plain_attr(seg) {
                seg.clone()
            } else {
                nix_string(seg)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Leading whitespace of the line holding `pos`, if nothing else precedes it.
fn line_indent(source: &str, pos: usize) -> &str {
    let line_start = source[..pos].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let prefix = &source[line_start..pos];
    if prefix.chars().all(|c| c == ' ' || c == '\t') {
        prefix
    } else {
        ""
    }
}

/// Leading whitespace of the line holding `pos`.
fn leading_ws(source: &str, pos: usize) -> &str {
    let line_start = source[..pos].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let line = &source[line_start..pos];
    &line[..line.len() - line.trim_start().len()]
}

/// One edit adding `additions` to `block`, just before its closing brace.
fn insertion(
    source: &str,
    block: &Block,
    top_level: bool,
    additions: &[(String, &Value<'_>)],
) -> (usize, usize, String) {
    let close = block.close;
    let line_start = source[..close].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let own_line = source[line_start..close].trim().is_empty();

    let indent = block
        .statements
        .first()
        .map(|s| line_indent(source, s.start))
        .filter(|i| !i.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if top_level {
                DEFAULT_INDENT.to_string()
            } else {
                format!("{}{}", leading_ws(source, close), DEFAULT_INDENT)
            }
        });

    if own_line || top_level {
        let mut text = String::new();
        for (path, value) in additions {
            text.push_str(&format!("{}{} = {};\n", indent, path, render_value(value, &indent)));
        }
        if own_line {
            (line_start, line_start, text)
        } else {
            (close, close, format!("\n{}", text))
        }
    } else {
        // `{ enable = false; }` stays on one line.
        let at = source[..close].trim_end().len();
        let mut text = String::new();
        for (path, value) in additions {
            text.push_str(&format!(" {} = {};", path, render_value(value, leading_ws(source, close))));
        }
        text.push(' ');
        (at, close, text)
    }
}

/// Where a field lives in the document.
struct Lookup<'s> {
    /// Statements binding exactly the field's path.
    exact: Vec<&'s Statement>,
    /// Deepest attribute set enclosing the path, and how many segments it covers.
    host: (&'s Block, usize),
}

/// Walk `block` and the attribute sets nested in it looking for `path`.
///
/// A prefix of the path bound to anything but a literal attribute set, or a
/// longer path already setting part of the field, cannot be edited safely.
fn lookup<'s>(
    block: &'s Block,
    path: &[String],
    consumed: usize,
    found: &mut Lookup<'s>,
) -> Result<(), String> {
    let rest = &path[consumed..];
    for stmt in &block.statements {
        let Some(own) = stmt.path.as_deref() else {
            continue;
        };
        if own == rest {
            found.exact.push(stmt);
        } else if rest.starts_with(own) {
            let depth = consumed + own.len();
            match &stmt.block {
                Some(inner) => {
                    if depth > found.host.1 {
                        found.host = (inner, depth);
                    }
                    lookup(inner, path, depth, found)?;
                }
                None => {
                    return Err(format!(
                        "{} is bound to an expression that is not an attribute set",
                        render_path(&path[..depth])
                    ))
                }
            }
        } else if own.starts_with(rest) {
            return Err(format!(
                "already partially set by {}",
                render_path(&[&path[..consumed], own].concat())
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Open(u8),
    Close(u8),
    Semi,
    Eq,
    Atom,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: Tok,
    pos: usize,
}

#[derive(Debug)]
struct Statement {
    /// Byte offset of the first token.
    start: usize,
    /// Offset of the binding `=`, if any (`inherit` has none).
    eq: Option<usize>,
    /// Offset of the terminating `;`.
    end: usize,
    path: Option<Vec<String>>,
    /// Value is a literal attribute set (`path = { ... };`).
    block: Option<Block>,
}

#[derive(Debug)]
struct Block {
    /// Offset of the closing brace.
    close: usize,
    statements: Vec<Statement>,
}

fn skip_line_comment(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(b: &[u8], i: usize) -> Result<usize, String> {
    let mut j = i + 2;
    while j + 1 < b.len() {
        if b[j] == b'*' && b[j + 1] == b'/' {
            return Ok(j + 2);
        }
        j += 1;
    }
    Err(format!("unterminated comment at byte {}", i))
}

fn skip_string(b: &[u8], i: usize) -> Result<usize, String> {
    let mut j = i + 1;
    while j < b.len() {
        match b[j] {
            b'\\' => j += 2,
            b'"' => return Ok(j + 1),
            b'$' if b.get(j + 1) == Some(&b'{') => j = skip_interpolation(b, j + 2)?,
            _ => j += 1,
        }
    }
    Err(format!("unterminated string at byte {}", i))
}

fn skip_indented_string(b: &[u8], i: usize) -> Result<usize, String> {
    let mut j = i + 2;
    while j < b.len() {
        if b[j..].starts_with(b"'''") || b[j..].starts_with(b"''$") {
            j += 3;
        } else if b[j..].starts_with(b"''\\") {
            j = (j + 4).min(b.len());
        } else if b[j..].starts_with(b"''") {
            return Ok(j + 2);
        } else if b[j..].starts_with(b"${") {
            j = skip_interpolation(b, j + 2)?;
        } else {
            j += 1;
        }
    }
    Err(format!("unterminated indented string at byte {}", i))
}

fn skip_interpolation(b: &[u8], start: usize) -> Result<usize, String> {
    let mut depth = 1usize;
    let mut j = start;
    while j < b.len() {
        match b[j] {
            b'{' => {
                depth += 1;
                j += 1;
            }
            b'}' => {
                depth -= 1;
                j += 1;
                if depth == 0 {
                    return Ok(j);
                }
            }
            b'"' => j = skip_string(b, j)?,
            b'\'' if b.get(j + 1) == Some(&b'\'') => j = skip_indented_string(b, j)?,
            b'#' => j = skip_line_comment(b, j),
            b'/' if b.get(j + 1) == Some(&b'*') => j = skip_block_comment(b, j)?,
            _ => j += 1,
        }
    }
    Err(format!("unterminated interpolation at byte {}", start))
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let b = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        let pos = i;
        let token = |kind| Token { kind, pos };
        match c {
            b'#' => i = skip_line_comment(b, i),
            b'/' if b.get(i + 1) == Some(&b'*') => i = skip_block_comment(b, i)?,
            b'"' => {
                out.push(token(Tok::Atom));
                i = skip_string(b, i)?;
            }
            b'\'' if b.get(i + 1) == Some(&b'\'') => {
                out.push(token(Tok::Atom));
                i = skip_indented_string(b, i)?;
            }
            b'{' | b'[' | b'(' => {
                out.push(token(Tok::Open(c)));
                i += 1;
            }
            b'}' | b']' | b')' => {
                out.push(token(Tok::Close(c)));
                i += 1;
            }
            b';' => {
                out.push(token(Tok::Semi));
                i += 1;
            }
            b'=' if b.get(i + 1) == Some(&b'=') => {
                out.push(token(Tok::Atom));
                i += 2;
            }
            b'=' if i > 0 && matches!(b[i - 1], b'!' | b'<' | b'>') => {
                out.push(token(Tok::Atom));
                i += 1;
            }
            b'=' => {
                out.push(token(Tok::Eq));
                i += 1;
            }
            c if c.is_ascii_whitespace() => i += 1,
            _ => {
                out.push(token(Tok::Atom));
                i += 1;
            }
        }
    }
    Ok(out)
}

fn matching(open: u8) -> u8 {
    match open {
        b'{' => b'}',
        b'[' => b']',
        _ => b')',
    }
}

/// Split an attribute path (`a."b c".d`) into unquoted segments.
fn parse_attr_path(text: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = text.trim().chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                while let Some(q) = chars.next() {
                    match q {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    'r' => '\r',
                                    other => other,
                                });
                            }
                        }
                        '"' => break,
                        other => current.push(other),
                    }
                }
            }
            '.' => segments.push(std::mem::take(&mut current)),
            c if c.is_whitespace() => {}
            other => current.push(other),
        }
    }
    segments.push(current);
    if segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

/// The body may follow a function header (`:`), `let ... in`, `rec` or `with x;`.
fn opens_module_body(src: &str, prev: usize) -> bool {
    let b = src.as_bytes();
    if matches!(b[prev], b':' | b';') {
        return true;
    }
    let mut start = prev;
    while start > 0 && b[start - 1].is_ascii_alphanumeric() {
        start -= 1;
    }
    matches!(&src[start..=prev], "in" | "rec")
}

/// Find the module's top-level attribute set and its statements.
///
/// The body is the last brace group at nesting depth zero, and nothing may
/// follow it. A function header (`{ config, ... }:`) is therefore skipped.
fn locate_body(src: &str) -> Result<Block, String> {
    let tokens = lex(src)?;

    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut last_group: Option<(usize, usize)> = None;
    for (idx, tok) in tokens.iter().enumerate() {
        match tok.kind {
            Tok::Open(c) => stack.push((c, idx)),
            Tok::Close(c) => {
                let (open, open_idx) = stack
                    .pop()
                    .ok_or_else(|| format!("unbalanced '{}' at byte {}", c as char, tok.pos))?;
                if matching(open) != c {
                    return Err(format!("mismatched '{}' at byte {}", c as char, tok.pos));
                }
                if stack.is_empty() && open == b'{' {
                    last_group = Some((open_idx, idx));
                }
            }
            _ => {}
        }
    }
    if let Some((open, _)) = stack.last() {
        return Err(format!("unclosed '{}'", *open as char));
    }

    let (open_idx, close_idx) = last_group.ok_or_else(|| "no attribute set found".to_string())?;
    if close_idx + 1 != tokens.len() {
        return Err("document does not end with an attribute set".to_string());
    }
    if open_idx > 0 && !opens_module_body(src, tokens[open_idx - 1].pos) {
        return Err("top-level attribute set is part of a larger expression".to_string());
    }

    Ok(Block {
        close: tokens[close_idx].pos,
        statements: parse_statements(src, &tokens[open_idx + 1..close_idx]),
    })
}

/// Statements of an attribute-set body, given the tokens between its braces.
fn parse_statements(src: &str, tokens: &[Token]) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut depth = 0usize;
    let mut first: Option<usize> = None;
    let mut eq: Option<usize> = None;
    for (idx, tok) in tokens.iter().enumerate() {
        match tok.kind {
            Tok::Open(_) => {
                first.get_or_insert(idx);
                depth += 1;
            }
            Tok::Close(_) => depth = depth.saturating_sub(1),
            Tok::Eq if depth == 0 => {
                first.get_or_insert(idx);
                eq.get_or_insert(idx);
            }
            Tok::Semi if depth == 0 => {
                let start = tokens[first.take().unwrap_or(idx)].pos;
                let eq_idx = eq.take();
                let path = eq_idx.and_then(|e| parse_attr_path(&src[start..tokens[e].pos]));
                let block = eq_idx.and_then(|e| nested_block(src, &tokens[e + 1..idx]));
                statements.push(Statement {
                    start,
                    eq: eq_idx.map(|e| tokens[e].pos),
                    end: tok.pos,
                    path,
                    block,
                });
            }
            _ => {
                first.get_or_insert(idx);
            }
        }
    }
    statements
}

/// The value tokens form exactly one `{ ... }` group.
fn nested_block(src: &str, value: &[Token]) -> Option<Block> {
    let (open, rest) = value.split_first()?;
    let (close, inner) = rest.split_last()?;
    if open.kind != Tok::Open(b'{') || close.kind != Tok::Close(b'}') {
        return None;
    }
    let mut depth = 0usize;
    for tok in inner {
        match tok.kind {
            Tok::Open(_) => depth += 1,
            Tok::Close(_) if depth == 0 => return None,
            Tok::Close(_) => depth -= 1,
            _ => {}
        }
    }
    Some(Block {
        close: close.pos,
        statements: parse_statements(src, inner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, KeyProvenance, KeySet, RunnerConfig, SshKeyEntry, UrlSource};
    use crate::test_support::sample_key;
    use secrecy::SecretString;

    fn writer(dir: &Path) -> ConfigWriter {
        ConfigWriter::new(
            dir.join("setup.nix"),
            "device",
            "/var/lib/github-runner/.runner_token",
        )
    }

    fn keyset(keys: &[String]) -> KeySet {
        let mut set = KeySet::new();
        for k in keys {
            set.insert(SshKeyEntry::valid(k.clone(), KeyProvenance::Pasted));
        }
        set
    }

    fn base_answers(keys: &[String]) -> Answers {
        let mut answers = Answers::new();
        answers.set(Answer::SshKeys(keyset(keys)));
        answers.set(Answer::Runner(None));
        answers.set(Answer::Hostname("pi4-lab-01".into()));
        answers.set(Answer::Timezone("Europe/Zurich".into()));
        answers.set(Answer::Wifi(None));
        answers
    }

    #[test]
    fn missing_document_starts_from_skeleton_in_fixed_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let key = sample_key("ssh-ed25519", 1, "alice");
        let m = w.render(&base_answers(&[key.clone()])).expect("render");

        assert!(m.overwritten.is_empty());
        assert_eq!(m.inserted.len(), 7);
        let expected = format!(
            "# Written by setup-tool during first boot.\n{{ config, lib, pkgs, ... }}:\n\n{{\n  \
networking.hostName = \"pi4-lab-01\";\n  \
time.timeZone = \"Europe/Zurich\";\n  \
users.users.root.openssh.authorizedKeys.keys = [\n    \"{}\"\n  ];\n  \
services.openssh.settings.PasswordAuthentication = false;\n  \
services.github-runners.device.enable = false;\n  \
networking.wireless.enable = false;\n  \
networking.wireless.networks = {{ }};\n}}\n",
            key
        );
        assert_eq!(m.document, expected);
    }

    #[test]
    fn rendering_is_deterministic_and_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let keys = vec![sample_key("ssh-ed25519", 1, "a"), sample_key("ssh-rsa", 2, "b")];
        let answers = base_answers(&keys);

        let first = w.render_from(None, &answers).expect("render");
        let second = w.render_from(None, &answers).expect("render");
        assert_eq!(first.document, second.document);

        let again = w
            .render_from(Some(&first.document), &answers)
            .expect("render onto itself");
        assert_eq!(again.document, first.document);
        assert!(again.inserted.is_empty());
        assert_eq!(again.overwritten.len(), first.inserted.len());
    }

    #[test]
    fn key_list_follows_insertion_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let k1 = sample_key("ssh-ed25519", 9, "first");
        let k2 = sample_key("ecdsa-sha2-nistp256", 3, "second");
        let doc = w
            .render_from(None, &base_answers(&[k1.clone(), k2.clone(), k1.clone()]))
            .expect("render")
            .document;
        let p1 = doc.find(&k1).expect("k1 rendered");
        let p2 = doc.find(&k2).expect("k2 rendered");
        assert!(p1 < p2);
        assert_eq!(doc.matches(&k1).count(), 1);
    }

    #[test]
    fn empty_key_set_never_disables_password_login() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let doc = w.render_from(None, &base_answers(&[])).expect("render").document;
        assert!(doc.contains("users.users.root.openssh.authorizedKeys.keys = [ ];"));
        assert!(doc.contains("services.openssh.settings.PasswordAuthentication = true;"));

        let mut answers = Answers::new();
        answers.set(Answer::Hostname("h".into()));
        let doc = w.render_from(None, &answers).expect("render").document;
        assert!(doc.contains("PasswordAuthentication = true;"));
    }

    #[test]
    fn renderer_revalidates_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        // Marked valid but structurally broken: must not count as a usable key.
        let doc = w
            .render_from(None, &base_answers(&["ssh-ed25519 AAAA broken".to_string()]))
            .expect("render")
            .document;
        assert!(!doc.contains("broken"));
        assert!(doc.contains("PasswordAuthentication = true;"));
    }

    #[test]
    fn existing_statements_are_rewritten_and_other_bytes_kept() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let existing = "{ pkgs, ... }:\n{\n  # keep; { me\n  environment.systemPackages = [ pkgs.git ];\n  networking.hostName = \"old\"; # trailing\n  services.foo.script = ''\n    a } b ; ${pkgs.hello} ''${x}\n  '';\n  time.timeZone = /* inline */ \"UTC\";\n  services.openssh.settings.PasswordAuthentication = true;\n  users.users.root.openssh.authorizedKeys.keys = [ ];\n  services.github-runners.device.enable = false;\n  networking.wireless = { enable = false; };\n}\n";

        let m = w.render_from(Some(existing), &base_answers(&[])).expect("render");

        let expected = "{ pkgs, ... }:\n{\n  # keep; { me\n  environment.systemPackages = [ pkgs.git ];\n  networking.hostName = \"pi4-lab-01\"; # trailing\n  services.foo.script = ''\n    a } b ; ${pkgs.hello} ''${x}\n  '';\n  time.timeZone = \"Europe/Zurich\";\n  services.openssh.settings.PasswordAuthentication = true;\n  users.users.root.openssh.authorizedKeys.keys = [ ];\n  services.github-runners.device.enable = false;\n  networking.wireless = { enable = false; networks = { }; };\n}\n";
        assert_eq!(m.document, expected);
        assert_eq!(
            m.overwritten,
            vec![
                FIELD_HOSTNAME,
                FIELD_TIMEZONE,
                FIELD_ROOT_KEYS,
                FIELD_PASSWORD_AUTH,
                "services.github-runners.device.enable",
                FIELD_WIFI_ENABLE,
            ]
        );
        assert_eq!(m.inserted, vec![FIELD_WIFI_NETWORKS]);
    }

    #[test]
    fn fields_inside_nested_attribute_sets_are_rewritten_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let key = sample_key("ssh-ed25519", 4, "ops");
        let existing = "{ ... }:\n{\n  services.openssh = {\n    enable = true;\n    settings.PasswordAuthentication = true;\n  };\n  networking = {\n    hostName = \"old\";\n    wireless = {\n      enable = true;\n    };\n  };\n}\n";

        let m = w.render_from(Some(existing), &base_answers(&[key])).expect("render");

        assert_eq!(m.document.matches("PasswordAuthentication").count(), 1);
        assert!(m
            .document
            .contains("    settings.PasswordAuthentication = false;\n"));
        assert!(m.document.contains("    hostName = \"pi4-lab-01\";\n"));
        assert!(m
            .document
            .contains("      enable = false;\n      networks = { };\n    };\n"));
        assert_eq!(m.document.matches("hostName").count(), 1);
        assert!(m.overwritten.contains(&FIELD_PASSWORD_AUTH.to_string()));
        assert!(m.overwritten.contains(&FIELD_HOSTNAME.to_string()));
        assert!(m.inserted.contains(&FIELD_WIFI_NETWORKS.to_string()));
        assert!(!m.inserted.contains(&FIELD_PASSWORD_AUTH.to_string()));

        // Rendering the result again only rewrites, never adds.
        let again = w
            .render_from(Some(&m.document), &base_answers(&[sample_key("ssh-ed25519", 4, "ops")]))
            .expect("render again");
        assert!(again.inserted.is_empty());
        assert_eq!(again.document, m.document);
    }

    #[test]
    fn prefix_bound_to_other_expression_is_a_write_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let answers = base_answers(&[]);
        for doc in [
            "{\n  services.openssh = import ./ssh.nix;\n}\n",
            "{\n  networking.wireless = lib.mkForce { enable = true; };\n}\n",
            "{\n  networking.wireless.networks.\"home\".psk = \"x\";\n}\n",
        ] {
            let err = w.render_from(Some(doc), &answers).expect_err(doc);
            assert!(matches!(err, WizardError::Write { .. }), "{}", doc);
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn quoted_attribute_paths_are_matched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let existing = "{\n  networking.\"hostName\" = \"old\";\n}\n";
        let m = w.render_from(Some(existing), &base_answers(&[])).expect("render");
        assert!(m.document.starts_with("{\n  networking.\"hostName\" = \"pi4-lab-01\";\n"));
    }

    #[test]
    fn enabled_runner_and_wifi_are_rendered() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let mut answers = base_answers(&[]);
        answers.set(Answer::Runner(Some(RunnerConfig {
            name: "pi4-01".into(),
            labels: vec!["nixos".into(), "pi4".into()],
            url: UrlSource::Literal(url::Url::parse("https://github.com/org/repo").expect("url")),
            token: Some(SecretString::from("TOKENVALUE123456")),
        })));
        answers.set(Answer::Wifi(Some(WifiCredentials {
            ssid: "Lab \"5G\" ${x}".into(),
            passphrase: SecretString::from("correct horse"),
        })));

        let doc = w.render_from(None, &answers).expect("render").document;
        assert!(doc.contains("services.github-runners.device.enable = true;"));
        assert!(doc.contains("services.github-runners.device.name = \"pi4-01\";"));
        assert!(doc.contains("services.github-runners.device.url = \"https://github.com/org/repo\";"));
        assert!(doc.contains(
            "services.github-runners.device.tokenFile = \"/var/lib/github-runner/.runner_token\";"
        ));
        assert!(doc.contains("services.github-runners.device.extraLabels = [\n    \"nixos\"\n    \"pi4\"\n  ];"));
        assert!(!doc.contains("TOKENVALUE123456"));
        assert!(doc.contains("networking.wireless.enable = true;"));
        assert!(doc.contains(
            "networking.wireless.networks = { \"Lab \\\"5G\\\" \\${x}\".psk = \"correct horse\"; };"
        ));
    }

    #[test]
    fn unlocatable_body_is_a_write_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let answers = base_answers(&[]);
        for doc in [
            "let x = 1; in x\n",
            "{ a = 1; \n",
            "{ a = \"unterminated; }\n",
            "{ config, ... }:\n",
            "{ a = 1; } // { b = 2; }\n",
        ] {
            let err = w.render_from(Some(doc), &answers).expect_err(doc);
            assert!(err.is_fatal(), "{}", doc);
        }
    }

    #[test]
    fn uncommitted_stage_leaves_document_intact() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        std::fs::write(w.document_path(), "{\n}\n").expect("seed");

        let m = w.render(&base_answers(&[])).expect("render");
        let staged = w.stage(&m).expect("stage");
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());
        drop(staged);

        assert!(!temp.exists());
        assert_eq!(
            std::fs::read_to_string(w.document_path()).expect("read"),
            "{\n}\n"
        );
    }

    #[test]
    fn write_commits_rendered_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        let m = w.write(&base_answers(&[])).expect("write");
        assert_eq!(
            std::fs::read_to_string(w.document_path()).expect("read"),
            m.document
        );
    }

    #[test]
    fn commit_backs_up_previous_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let w = writer(tmp.path());
        std::fs::write(w.document_path(), "{\n  networking.hostName = \"old\";\n}\n")
            .expect("seed");

        let m = w.render(&base_answers(&[])).expect("render");
        let backup = w
            .stage(&m)
            .expect("stage")
            .commit()
            .expect("commit")
            .expect("backup created");

        assert_eq!(
            std::fs::read_to_string(&backup).expect("read backup"),
            "{\n  networking.hostName = \"old\";\n}\n"
        );
        assert!(backup
            .to_string_lossy()
            .starts_with(&format!("{}.backup.", w.document_path().display())));
        assert_eq!(
            std::fs::read_to_string(w.document_path()).expect("read"),
            m.document
        );
    }

    #[test]
    fn nix_string_escapes_interpolation_and_quotes() {
        assert_eq!(nix_string("a\"b\\c${d}$e"), "\"a\\\"b\\\\c\\${d}$e\"");
        assert_eq!(
            render_path(&[
                "services".into(),
                "github-runners".into(),
                "my runner".into()
            ]),
            "services.github-runners.\"my runner\""
        );
    }
}
