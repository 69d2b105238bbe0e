//! Fully-qualified model names: `[host/][namespace/]model[:tag]`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

pub const DEFAULT_HOST: &str = "registry.ollama.ai";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

const MAX_PART_LEN: usize = 80;
const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelName {
    host: String,
    namespace: String,
    model: String,
    tag: String,
}

impl ModelName {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Display form with default host and namespace dropped, e.g. `demo:latest`.
    pub fn short(&self) -> String {
        match (
            self.host == DEFAULT_HOST,
            self.namespace == DEFAULT_NAMESPACE,
        ) {
            (true, true) => format!("{}:{}", self.model, self.tag),
            (true, false) => format!("{}/{}:{}", self.namespace, self.model, self.tag),
            _ => self.to_string(),
        }
    }

    /// Lock/registry key: the full name.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Derive an import name from a file path: the sanitised file stem,
    /// falling back to `fallback` (usually `general.name`).
    pub fn derive(path: &Path, fallback: Option<&str>) -> Result<Self, StoreError> {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if let Some(name) = sanitize(stem) {
            return name.parse();
        }
        if let Some(name) = fallback.and_then(sanitize) {
            return name.parse();
        }
        Err(StoreError::InvalidModelName {
            name: path.display().to_string(),
            reason: "cannot derive a model name from the file name or metadata".into(),
        })
    }
}

/// Replace characters outside `[A-Za-z0-9_.-]` with `-`, trim leading
/// non-alphanumerics and lowercase the result.
fn sanitize(raw: &str) -> Option<String> {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let trimmed = trimmed.trim_end_matches('-');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_PART_LEN).collect())
}

fn check_part(full: &str, what: &str, part: &str, max: usize, allow_colon: bool) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::InvalidModelName {
        name: full.to_string(),
        reason,
    };
    if part.is_empty() || part.len() > max {
        return Err(invalid(format!("{what} must be 1..={max} characters")));
    }
    if !part.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid(format!("{what} must start with a letter or digit")));
    }
    let ok = part
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') || (allow_colon && c == ':'));
    if !ok {
        return Err(invalid(format!("{what} contains characters outside [A-Za-z0-9_.-]")));
    }
    Ok(())
}

impl FromStr for ModelName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, tag) = match s.rsplit_once(':') {
            // A colon inside the host part (`host:port/ns/model`) is not a tag.
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => (s, DEFAULT_TAG),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let (host, namespace, model) = match parts.as_slice() {
            [model] => (DEFAULT_HOST, DEFAULT_NAMESPACE, *model),
            [namespace, model] => (DEFAULT_HOST, *namespace, *model),
            [host, namespace, model] => (*host, *namespace, *model),
            _ => {
                return Err(StoreError::InvalidModelName {
                    name: s.to_string(),
                    reason: "expected [host/][namespace/]model[:tag]".into(),
                });
            }
        };

        check_part(s, "host", host, MAX_PART_LEN, true)?;
        check_part(s, "namespace", namespace, MAX_PART_LEN, false)?;
        check_part(s, "model", model, MAX_PART_LEN, false)?;
        check_part(s, "tag", tag, MAX_TAG_LEN, false)?;

        Ok(Self {
            host: host.to_string(),
            namespace: namespace.to_string(),
            model: model.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}:{}", self.host, self.namespace, self.model, self.tag)
    }
}

impl Serialize for ModelName {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.short())
    }
}

impl<'de> Deserialize<'de> for ModelName {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
