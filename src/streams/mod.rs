//! Durable stream catalog.
//!
//! One stream per [`Domain`], each tuned for its traffic:
//!
//! | Stream                  | Retention  | Discard | Msgs | Bytes  | Age | Msg size | Dup window |
//! |-------------------------|------------|---------|------|--------|-----|----------|------------|
//! | CONSTELLATION_ENTITIES  | limits     | old     | 100k | 256MB  | 7d  | 1MB      | 2m         |
//! | CONSTELLATION_EVENTS    | work-queue | old     | 50k  | 128MB  | 24h | 256KB    | 2m         |
//! | CONSTELLATION_TELEMETRY | interest   | old     | 25k  | 64MB   | 1h  | 64KB     | 30s        |
//! | CONSTELLATION_COMMANDS  | work-queue | new     | 10k  | 32MB   | 15m | 32KB     | 1m         |
//!
//! Commands discard new messages when full; the publisher receives the
//! rejection as `BusError::Overflow`.

mod registry;

pub use registry::{DeclareOutcome, StreamRegistry};

use std::collections::HashSet;
use std::time::Duration;

use async_nats::jetstream::stream::{self, DiscardPolicy, RetentionPolicy, StorageType};

use crate::config::{StreamOverride, StreamsConfig};
use crate::subjects::{filters_overlap, Domain, SubjectSpace};

const KB: i64 = 1024;
const MB: i64 = 1024 * KB;
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Catalog validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate stream name: {0}")]
    DuplicateName(String),

    #[error("Stream {0} has no subjects")]
    NoSubjects(String),

    #[error("Subjects of {first} ('{first_subject}') and {second} ('{second_subject}') overlap")]
    Overlap {
        first: String,
        first_subject: String,
        second: String,
        second_subject: String,
    },

    #[error("Stream {stream} has an invalid limit: {reason}")]
    InvalidLimit { stream: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep messages until a limit evicts them.
    Limits,
    /// Remove messages once acknowledged.
    WorkQueue,
    /// Keep messages only while a consumer is interested.
    Interest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    Old,
    New,
}

/// Desired configuration of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDefinition {
    pub domain: Domain,
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub discard: Discard,
    pub max_messages: i64,
    pub max_bytes: i64,
    pub max_age: Duration,
    pub max_message_size: i32,
    pub duplicate_window: Duration,
    pub replicas: usize,
    pub allow_rollup: bool,
    pub allow_direct: bool,
}

impl StreamDefinition {
    /// Built-in tuning for a domain.
    pub fn canonical(domain: Domain, subjects: &SubjectSpace) -> Self {
        let base = Self {
            domain,
            name: domain.stream_name().to_string(),
            subjects: vec![subjects.wildcard(domain)],
            retention: Retention::Limits,
            discard: Discard::Old,
            max_messages: 0,
            max_bytes: 0,
            max_age: Duration::ZERO,
            max_message_size: 0,
            duplicate_window: Duration::ZERO,
            replicas: 1,
            allow_rollup: false,
            allow_direct: false,
        };

        match domain {
            Domain::Entities => Self {
                retention: Retention::Limits,
                max_messages: 100_000,
                max_bytes: 256 * MB,
                max_age: 7 * 24 * HOUR,
                max_message_size: MB as i32,
                duplicate_window: 2 * MINUTE,
                allow_rollup: true,
                allow_direct: true,
                ..base
            },
            Domain::Events => Self {
                retention: Retention::WorkQueue,
                max_messages: 50_000,
                max_bytes: 128 * MB,
                max_age: 24 * HOUR,
                max_message_size: (256 * KB) as i32,
                duplicate_window: 2 * MINUTE,
                allow_direct: true,
                ..base
            },
            Domain::Telemetry => Self {
                retention: Retention::Interest,
                max_messages: 25_000,
                max_bytes: 64 * MB,
                max_age: HOUR,
                max_message_size: (64 * KB) as i32,
                duplicate_window: Duration::from_secs(30),
                allow_rollup: true,
                allow_direct: true,
                ..base
            },
            Domain::Commands => Self {
                retention: Retention::WorkQueue,
                discard: Discard::New,
                max_messages: 10_000,
                max_bytes: 32 * MB,
                max_age: 15 * MINUTE,
                max_message_size: (32 * KB) as i32,
                duplicate_window: MINUTE,
                ..base
            },
        }
    }

    /// Apply configured limit overrides.
    pub fn with_override(mut self, limits: &StreamOverride) -> Self {
        if let Some(v) = limits.max_messages {
            self.max_messages = v;
        }
        if let Some(v) = limits.max_bytes {
            self.max_bytes = v;
        }
        if let Some(v) = limits.max_age_secs {
            self.max_age = Duration::from_secs(v);
        }
        if let Some(v) = limits.max_message_size {
            self.max_message_size = v;
        }
        if let Some(v) = limits.duplicate_window_secs {
            self.duplicate_window = Duration::from_secs(v);
        }
        self
    }

    pub fn to_config(&self) -> stream::Config {
        stream::Config {
            name: self.name.clone(),
            subjects: self.subjects.clone(),
            retention: match self.retention {
                Retention::Limits => RetentionPolicy::Limits,
                Retention::WorkQueue => RetentionPolicy::WorkQueue,
                Retention::Interest => RetentionPolicy::Interest,
            },
            discard: match self.discard {
                Discard::Old => DiscardPolicy::Old,
                Discard::New => DiscardPolicy::New,
            },
            max_messages: self.max_messages,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
            max_message_size: self.max_message_size,
            duplicate_window: self.duplicate_window,
            num_replicas: self.replicas,
            storage: StorageType::File,
            allow_rollup: self.allow_rollup,
            allow_direct: self.allow_direct,
            ..Default::default()
        }
    }

    /// Whether an existing stream already carries every managed setting.
    pub fn matches(&self, existing: &stream::Config) -> bool {
        let mut wanted = self.subjects.clone();
        let mut actual = existing.subjects.clone();
        wanted.sort();
        actual.sort();

        let retention = matches!(
            (self.retention, &existing.retention),
            (Retention::Limits, RetentionPolicy::Limits)
                | (Retention::WorkQueue, RetentionPolicy::WorkQueue)
                | (Retention::Interest, RetentionPolicy::Interest)
        );
        let discard = matches!(
            (self.discard, &existing.discard),
            (Discard::Old, DiscardPolicy::Old) | (Discard::New, DiscardPolicy::New)
        );

        wanted == actual
            && retention
            && discard
            && matches!(existing.storage, StorageType::File)
            && self.max_messages == existing.max_messages
            && self.max_bytes == existing.max_bytes
            && self.max_age == existing.max_age
            && self.max_message_size == existing.max_message_size
            && self.duplicate_window == existing.duplicate_window
            && self.replicas == existing.num_replicas
            && self.allow_rollup == existing.allow_rollup
            && self.allow_direct == existing.allow_direct
    }

    fn check_limits(&self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidLimit {
            stream: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.max_messages <= 0 {
            return Err(invalid("max_messages must be positive"));
        }
        if self.max_bytes <= 0 {
            return Err(invalid("max_bytes must be positive"));
        }
        if self.max_message_size <= 0 || i64::from(self.max_message_size) > self.max_bytes {
            return Err(invalid("max_message_size must be positive and within max_bytes"));
        }
        if self.duplicate_window.is_zero() || self.duplicate_window > self.max_age {
            return Err(invalid("duplicate_window must be positive and within max_age"));
        }
        if self.replicas == 0 {
            return Err(invalid("replicas must be at least 1"));
        }
        Ok(())
    }
}

/// The set of streams declared at startup.
#[derive(Debug, Clone)]
pub struct StreamCatalog {
    subjects: SubjectSpace,
    definitions: Vec<StreamDefinition>,
}

impl StreamCatalog {
    /// The four canonical streams, with configured overrides applied.
    pub fn from_config(config: &StreamsConfig) -> Self {
        let subjects = SubjectSpace::new(config.subject_prefix.as_deref());
        let definitions = Domain::ALL
            .into_iter()
            .map(|domain| {
                let definition = StreamDefinition {
                    replicas: config.replicas,
                    ..StreamDefinition::canonical(domain, &subjects)
                };
                match config.overrides.get(&domain) {
                    Some(limits) => definition.with_override(limits),
                    None => definition,
                }
            })
            .collect();
        Self {
            subjects,
            definitions,
        }
    }

    pub fn subjects(&self) -> &SubjectSpace {
        &self.subjects
    }

    pub fn definitions(&self) -> &[StreamDefinition] {
        &self.definitions
    }

    pub fn get(&self, domain: Domain) -> Option<&StreamDefinition> {
        self.definitions.iter().find(|d| d.domain == domain)
    }

    /// Check names, limits and that no two streams claim the same subjects.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut names = HashSet::new();
        for definition in &self.definitions {
            if !names.insert(definition.name.as_str()) {
                return Err(CatalogError::DuplicateName(definition.name.clone()));
            }
            if definition.subjects.is_empty() {
                return Err(CatalogError::NoSubjects(definition.name.clone()));
            }
            definition.check_limits()?;
        }

        for (i, first) in self.definitions.iter().enumerate() {
            for second in &self.definitions[i + 1..] {
                for a in &first.subjects {
                    for b in &second.subjects {
                        if filters_overlap(a, b) {
                            return Err(CatalogError::Overlap {
                                first: first.name.clone(),
                                first_subject: a.clone(),
                                second: second.name.clone(),
                                second_subject: b.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for StreamCatalog {
    fn default() -> Self {
        Self::from_config(&StreamsConfig::default())
    }
}
