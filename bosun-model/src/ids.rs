use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{IdError, Result};

const SEPARATOR: char = ':';

/// Type tag carried by every entity ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    System,
    Workspace,
    Project,
    Job,
    JobMetrics,
    Process,
    ProcessGroup,
    ProcessMetrics,
    LogEntry,
    LogMetrics,
}

impl EntityKind {
    pub const ALL: [EntityKind; 10] = [
        EntityKind::System,
        EntityKind::Workspace,
        EntityKind::Project,
        EntityKind::Job,
        EntityKind::JobMetrics,
        EntityKind::Process,
        EntityKind::ProcessGroup,
        EntityKind::ProcessMetrics,
        EntityKind::LogEntry,
        EntityKind::LogMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::System => "System",
            EntityKind::Workspace => "Workspace",
            EntityKind::Project => "Project",
            EntityKind::Job => "Job",
            EntityKind::JobMetrics => "JobMetrics",
            EntityKind::Process => "Process",
            EntityKind::ProcessGroup => "ProcessGroup",
            EntityKind::ProcessMetrics => "ProcessMetrics",
            EntityKind::LogEntry => "LogEntry",
            EntityKind::LogMetrics => "LogMetrics",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| IdError::UnknownKind(s.to_string()))
    }
}

/// Opaque, self-describing entity identifier.
///
/// The raw form is `Kind:part1:part2...` (components escape `%` and `:`),
/// base64url-encoded without padding. Equality and hashing operate on the
/// encoded string, so two IDs built from the same kind and components are
/// always equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

/// Result of decoding an [`EntityId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedId {
    pub kind: EntityKind,
    pub parts: Vec<String>,
}

impl EntityId {
    pub fn new<I, S>(kind: EntityKind, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = String::from(kind.as_str());
        for part in parts {
            raw.push(SEPARATOR);
            escape_into(part.as_ref(), &mut raw);
        }
        EntityId(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }

    /// Wraps a client-supplied ID after checking it decodes.
    pub fn parse(encoded: impl Into<String>) -> Result<Self> {
        let id = EntityId(encoded.into());
        id.decode()?;
        Ok(id)
    }

    pub fn decode(&self) -> Result<DecodedId> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .map_err(|err| IdError::Encoding(err.to_string()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| IdError::Malformed(format!("{} is not utf-8", self.0)))?;

        let mut segments = raw.split(SEPARATOR);
        let kind = segments
            .next()
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| IdError::Malformed(format!("{raw} has no kind")))?
            .parse::<EntityKind>()?;
        let parts = segments.map(unescape).collect::<Result<Vec<_>>>()?;
        if parts.is_empty() {
            return Err(IdError::Malformed(format!("{raw} has no identifier")));
        }

        Ok(DecodedId { kind, parts })
    }

    pub fn kind(&self) -> Result<EntityKind> {
        self.decode().map(|decoded| decoded.kind)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn escape_into(part: &str, out: &mut String) {
    for ch in part.chars() {
        match ch {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%3A"),
            other => out.push(other),
        }
    }
}

fn unescape(part: &str) -> Result<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos..pos + 3);
        match escape {
            Some("%25") => out.push('%'),
            Some("%3A") => out.push(SEPARATOR),
            _ => {
                return Err(IdError::Malformed(format!(
                    "invalid escape sequence in {part}"
                )));
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_kind_and_parts() {
        let id = EntityId::new(EntityKind::Project, ["acme", "api:v2", "100%"]);
        let decoded = id.decode().expect("decode");

        assert_eq!(decoded.kind, EntityKind::Project);
        assert_eq!(decoded.parts, vec!["acme", "api:v2", "100%"]);
    }

    #[test]
    fn same_components_yield_same_id() {
        let a = EntityId::new(EntityKind::Job, ["7"]);
        let b = EntityId::new(EntityKind::Job, [String::from("7")]);
        let c = EntityId::new(EntityKind::Process, ["7"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            EntityId::parse("!!not-base64!!"),
            Err(IdError::Encoding(_))
        ));

        let unknown = URL_SAFE_NO_PAD.encode("Spaceship:1");
        assert_eq!(
            EntityId::parse(unknown),
            Err(IdError::UnknownKind("Spaceship".into()))
        );

        let bare = URL_SAFE_NO_PAD.encode("Job");
        assert!(matches!(EntityId::parse(bare), Err(IdError::Malformed(_))));

        let bad_escape = URL_SAFE_NO_PAD.encode("Job:1%2");
        assert!(matches!(
            EntityId::parse(bad_escape),
            Err(IdError::Malformed(_))
        ));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = EntityId::new(EntityKind::LogEntry, ["1"]);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.as_str()));
    }
}
