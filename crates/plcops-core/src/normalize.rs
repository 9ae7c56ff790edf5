//! Canonical rewriting of exported controller artifacts.
//!
//! Exports carry metadata that changes on every run without any change to
//! the program: creation/modification timestamps, and a redirection block
//! whose entries come out in arbitrary order with arbitrary whitespace.
//! [`ArtifactNormalizer`] rewrites both into a fixed form so that equal
//! programs produce byte-identical files.

use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ExportError;

/// Value written in place of every volatile timestamp.
pub const EPOCH_SENTINEL: &str = "1970-01-01T00:00:00";

/// Indentation of rebuilt block entries.
const ENTRY_INDENT: &str = "        ";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Names of the volatile fields and the reorderable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeRules {
    /// Attributes whose values are replaced with [`EPOCH_SENTINEL`].
    pub timestamp_attributes: Vec<String>,
    /// Tag of the reorderable metadata block.
    pub block_tag: String,
    /// Tag of the self-closing entries inside the block.
    pub entry_tag: String,
    /// Attribute entries are sorted by.
    pub key_attribute: String,
}

impl NormalizeRules {
    /// Rules for PLCopen XML exports.
    pub fn plcopen() -> Self {
        Self {
            timestamp_attributes: vec![
                "creationDateTime".to_string(),
                "modificationDateTime".to_string(),
            ],
            block_tag: "PlaceholderRedirections".to_string(),
            entry_tag: "PlaceholderRedirection".to_string(),
            key_attribute: "Placeholder".to_string(),
        }
    }
}

impl Default for NormalizeRules {
    fn default() -> Self {
        Self::plcopen()
    }
}

/// A normalized artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// SHA-256 of the normalized bytes, lowercase hex.
    pub content_hash: String,
    /// Whether normalization rewrote the file.
    pub rewritten: bool,
}

impl Artifact {
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..12.min(self.content_hash.len())]
    }
}

/// Rewrites exported text into canonical form.
#[derive(Debug, Clone)]
pub struct ArtifactNormalizer {
    rules: NormalizeRules,
    timestamps: Vec<(Regex, String)>,
    self_closing_block: Regex,
    block: Regex,
    bare_block: Regex,
    entry: Regex,
    key: Regex,
    whitespace: Regex,
    entry_close: Regex,
}

impl Default for ArtifactNormalizer {
    fn default() -> Self {
        Self::new(NormalizeRules::plcopen())
    }
}

impl ArtifactNormalizer {
    pub fn new(rules: NormalizeRules) -> Self {
        let timestamps = rules
            .timestamp_attributes
            .iter()
            .map(|attr| {
                let name = regex::escape(attr);
                (
                    compile(&format!(r#"\b{name}="[^"]*""#)),
                    format!(r#"{attr}="{EPOCH_SENTINEL}""#),
                )
            })
            .collect();

        let block_tag = regex::escape(&rules.block_tag);
        let entry_tag = regex::escape(&rules.entry_tag);
        let key = regex::escape(&rules.key_attribute);

        Self {
            timestamps,
            self_closing_block: compile(&format!(r"<{block_tag}\b[^>]*/\s*>")),
            block: compile(&format!(r"(?s)<{block_tag}\b[^>]*>.*?</{block_tag}\s*>")),
            bare_block: compile(&format!(r"^<{block_tag}\s*>\s*</{block_tag}\s*>$")),
            entry: compile(&format!(
                r#"<{entry_tag}(?:\s+[^\s=/>]+\s*=\s*(?:"[^"]*"|'[^']*'))*\s*/\s*>"#
            )),
            key: compile(&format!(r#"\s{key}="([^"]*)""#)),
            whitespace: compile(r"\s+"),
            entry_close: compile(r"\s*/\s*>$"),
            rules,
        }
    }

    pub fn rules(&self) -> &NormalizeRules {
        &self.rules
    }

    /// Normalize the file at `path` in place.
    ///
    /// Returns `true` when the file was rewritten. Text is decoded as UTF-8
    /// (a leading byte-order mark is dropped) and falls back to Latin-1 when
    /// the bytes are not valid UTF-8; the same encoding is used to write back.
    pub fn normalize(&self, path: &Path) -> Result<bool, ExportError> {
        Ok(self.normalize_artifact(path)?.rewritten)
    }

    /// Like [`normalize`](Self::normalize) but also hashes the result.
    pub fn normalize_artifact(&self, path: &Path) -> Result<Artifact, ExportError> {
        let raw = std::fs::read(path).map_err(|source| io_error(path, source))?;
        let (text, encoding) = decode(&raw);

        let normalized = self.normalize_text(&text);
        let bytes = encoding.encode(&normalized);
        let rewritten = bytes != raw;

        if rewritten {
            std::fs::write(path, &bytes).map_err(|source| io_error(path, source))?;
            info!(path = %path.display(), "normalized volatile metadata");
        } else {
            debug!(path = %path.display(), "artifact already normalized");
        }

        Ok(Artifact {
            path: path.to_path_buf(),
            content_hash: hex::encode(Sha256::digest(&bytes)),
            rewritten,
        })
    }

    /// Canonical form of `text`. Pure and idempotent.
    pub fn normalize_text(&self, text: &str) -> String {
        let mut text = text.to_string();

        for (pattern, replacement) in &self.timestamps {
            text = pattern
                .replace_all(&text, regex::NoExpand(replacement))
                .into_owned();
        }

        text = self
            .self_closing_block
            .replace_all(&text, regex::NoExpand(&self.empty_block()))
            .into_owned();

        let blocks: Vec<_> = self.block.find_iter(&text).map(|m| m.range()).collect();
        match blocks.as_slice() {
            [] => {}
            [range] => match self.rebuild_block(&text[range.clone()]) {
                Some(rebuilt) => text.replace_range(range.clone(), &rebuilt),
                None => warn!(
                    tag = %self.rules.block_tag,
                    "metadata block holds more than self-closing entries, leaving it untouched"
                ),
            },
            _ => {
                warn!(
                    tag = %self.rules.block_tag,
                    count = blocks.len(),
                    "more than one metadata block, leaving them untouched"
                );
            }
        }

        text
    }

    fn empty_block(&self) -> String {
        format!("<{0}>\n</{0}>", self.rules.block_tag)
    }

    /// Sorted, deduplicated form of `block`, or `None` when the block holds
    /// anything besides whitespace and self-closing entries.
    fn rebuild_block(&self, block: &str) -> Option<String> {
        let residue = self.entry.replace_all(block, "");
        if !self.bare_block.is_match(&residue) {
            return None;
        }

        let mut entries: Vec<String> = self
            .entry
            .find_iter(block)
            .map(|m| self.canonical_entry(m.as_str()))
            .collect();

        entries.sort_by(|a, b| {
            self.entry_key(a)
                .cmp(self.entry_key(b))
                .then_with(|| a.cmp(b))
        });
        entries.dedup();

        if entries.is_empty() {
            return Some(self.empty_block());
        }

        let tag = &self.rules.block_tag;
        let mut out = format!("<{tag}>\n");
        for entry in &entries {
            out.push_str(ENTRY_INDENT);
            out.push_str(entry);
            out.push('\n');
        }
        out.push_str(&format!("</{tag}>"));
        Some(out)
    }

    fn canonical_entry(&self, entry: &str) -> String {
        let collapsed = self.whitespace.replace_all(entry.trim(), " ");
        self.entry_close
            .replace(&collapsed, regex::NoExpand(" />"))
            .into_owned()
    }

    fn entry_key<'a>(&self, entry: &'a str) -> &'a str {
        self.key
            .captures(entry)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or(entry)
    }
}

fn compile(pattern: &str) -> Regex {
    // Patterns are built from escaped names, so they are always valid.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid normalizer pattern {pattern}: {e}"))
}

fn io_error(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

fn decode(raw: &[u8]) -> (String, Encoding) {
    let body = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), Encoding::Utf8),
        Err(_) => (body.iter().map(|&b| char::from(b)).collect(), Encoding::Latin1),
    }
}
