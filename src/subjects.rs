//! Subject hierarchy, stream names and durable consumer names.
//!
//! Subjects follow `[prefix.]<domain>.<org_id>.<suffix>`:
//!
//! | Domain    | Suffixes                                   |
//! |-----------|--------------------------------------------|
//! | entities  | `created`, `updated`, `deleted`, `status`  |
//! | events    | free-form notification suffix (`alert`)    |
//! | telemetry | `<entity_id>`                              |
//! | commands  | `<entity_id>`, `broadcast`                 |
//!
//! `<domain>.>` is each stream's catch-all filter.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Suffix for entity creation subjects.
pub const SUFFIX_CREATED: &str = "created";
/// Suffix for entity update subjects.
pub const SUFFIX_UPDATED: &str = "updated";
/// Suffix for entity deletion subjects.
pub const SUFFIX_DELETED: &str = "deleted";
/// Suffix for entity status change subjects.
pub const SUFFIX_STATUS: &str = "status";
/// Suffix for organization-wide commands.
pub const SUFFIX_BROADCAST: &str = "broadcast";

/// Errors raised while building subjects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("Subject token for {field} is empty")]
    EmptyToken { field: &'static str },

    #[error("Subject token for {field} contains '{found}': {token:?}")]
    InvalidToken {
        field: &'static str,
        token: String,
        found: char,
    },
}

/// Ensure a value can be embedded as a single subject token.
///
/// Tokens may not be empty and may not contain separators, wildcards or
/// whitespace; otherwise an org id like `acme.>` would widen the subject.
pub fn validate_token(field: &'static str, token: &str) -> Result<(), SubjectError> {
    if token.is_empty() {
        return Err(SubjectError::EmptyToken { field });
    }
    if let Some(found) = token
        .chars()
        .find(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace())
    {
        return Err(SubjectError::InvalidToken {
            field,
            token: token.to_string(),
            found,
        });
    }
    Ok(())
}

/// The four message domains. Each maps to exactly one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Entities,
    Events,
    Telemetry,
    Commands,
}

impl Domain {
    /// All domains, in stream declaration order.
    pub const ALL: [Domain; 4] = [
        Domain::Entities,
        Domain::Events,
        Domain::Telemetry,
        Domain::Commands,
    ];

    /// Subject token for the domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Entities => "entities",
            Domain::Events => "events",
            Domain::Telemetry => "telemetry",
            Domain::Commands => "commands",
        }
    }

    /// JetStream stream name.
    pub fn stream_name(&self) -> &'static str {
        match self {
            Domain::Entities => "CONSTELLATION_ENTITIES",
            Domain::Events => "CONSTELLATION_EVENTS",
            Domain::Telemetry => "CONSTELLATION_TELEMETRY",
            Domain::Commands => "CONSTELLATION_COMMANDS",
        }
    }

    /// Durable consumer name used by the domain's worker.
    pub fn consumer_name(&self) -> &'static str {
        match self {
            Domain::Entities => "entity-processor",
            Domain::Events => "event-processor",
            Domain::Telemetry => "telemetry-processor",
            Domain::Commands => "command-processor",
        }
    }

    /// Worker name used in logs and health reports.
    pub fn worker_name(&self) -> &'static str {
        match self {
            Domain::Entities => "EntityWorker",
            Domain::Events => "EventWorker",
            Domain::Telemetry => "TelemetryWorker",
            Domain::Commands => "CommandWorker",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("Unknown domain: {}", s))
    }
}

/// Builds subjects, optionally under a shared prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectSpace {
    prefix: Option<String>,
}

impl SubjectSpace {
    /// Create a subject space. Empty prefixes are treated as absent.
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix
                .map(|p| p.trim_matches('.'))
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Root subject of a domain, e.g. `entities` or `constellation.entities`.
    pub fn root(&self, domain: Domain) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, domain.as_str()),
            None => domain.as_str().to_string(),
        }
    }

    /// Catch-all filter for a domain: `<root>.>`.
    pub fn wildcard(&self, domain: Domain) -> String {
        format!("{}.>", self.root(domain))
    }

    fn org_subject(&self, domain: Domain, org_id: &str, suffix: &str) -> Result<String, SubjectError> {
        validate_token("org_id", org_id)?;
        Ok(format!("{}.{}.{}", self.root(domain), org_id, suffix))
    }

    pub fn entity_created(&self, org_id: &str) -> Result<String, SubjectError> {
        self.org_subject(Domain::Entities, org_id, SUFFIX_CREATED)
    }

    pub fn entity_updated(&self, org_id: &str) -> Result<String, SubjectError> {
        self.org_subject(Domain::Entities, org_id, SUFFIX_UPDATED)
    }

    pub fn entity_deleted(&self, org_id: &str) -> Result<String, SubjectError> {
        self.org_subject(Domain::Entities, org_id, SUFFIX_DELETED)
    }

    pub fn entity_status(&self, org_id: &str) -> Result<String, SubjectError> {
        self.org_subject(Domain::Entities, org_id, SUFFIX_STATUS)
    }

    /// Notification subject on the events stream.
    pub fn event(&self, org_id: &str, suffix: &str) -> Result<String, SubjectError> {
        validate_token("suffix", suffix)?;
        self.org_subject(Domain::Events, org_id, suffix)
    }

    /// Telemetry subject for one entity.
    pub fn telemetry(&self, org_id: &str, entity_id: &str) -> Result<String, SubjectError> {
        validate_token("entity_id", entity_id)?;
        self.org_subject(Domain::Telemetry, org_id, entity_id)
    }

    /// Command subject addressed to one entity.
    pub fn command(&self, org_id: &str, entity_id: &str) -> Result<String, SubjectError> {
        validate_token("entity_id", entity_id)?;
        self.org_subject(Domain::Commands, org_id, entity_id)
    }

    /// Command subject addressed to every entity of an organization.
    pub fn command_broadcast(&self, org_id: &str) -> Result<String, SubjectError> {
        self.org_subject(Domain::Commands, org_id, SUFFIX_BROADCAST)
    }

    /// Resolve which domain a concrete subject belongs to.
    pub fn domain_of(&self, subject: &str) -> Option<Domain> {
        let rest = match &self.prefix {
            Some(prefix) => subject.strip_prefix(prefix.as_str())?.strip_prefix('.')?,
            None => subject,
        };
        let token = rest.split('.').next()?;
        token.parse().ok()
    }
}

/// Whether two subject filters can match a common subject.
///
/// Follows NATS wildcard rules: `*` matches one token, a trailing `>`
/// matches one or more tokens.
pub fn filters_overlap(a: &str, b: &str) -> bool {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();

    let mut i = 0;
    loop {
        match (left.get(i), right.get(i)) {
            (Some(&">"), Some(_)) | (Some(_), Some(&">")) => return true,
            (Some(l), Some(r)) => {
                if *l != "*" && *r != "*" && l != r {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
        i += 1;
    }
}
