use async_nats::jetstream::{
    self,
    context::{GetStreamError, GetStreamErrorKind},
    ErrorCode,
};
use tracing::{debug, info};

use super::{StreamCatalog, StreamDefinition};
use crate::bus::{BusError, Result};

/// Outcome of [`StreamRegistry::declare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Declares streams, creating or updating them in place.
#[derive(Clone)]
pub struct StreamRegistry {
    jetstream: jetstream::Context,
}

impl StreamRegistry {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }

    /// Create the stream if absent, update it if its settings drifted.
    ///
    /// A stream that already matches is left alone, so repeat declarations
    /// never touch the broker's configuration.
    pub async fn declare(&self, definition: &StreamDefinition) -> Result<DeclareOutcome> {
        match self.jetstream.get_stream(&definition.name).await {
            Ok(stream) => {
                if definition.matches(&stream.cached_info().config) {
                    debug!(stream = %definition.name, "Stream up to date");
                    return Ok(DeclareOutcome::Unchanged);
                }

                self.jetstream
                    .update_stream(definition.to_config())
                    .await
                    .map_err(|e| BusError::Stream {
                        name: definition.name.clone(),
                        message: format!("Failed to update stream: {}", e),
                    })?;
                info!(
                    stream = %definition.name,
                    subjects = ?definition.subjects,
                    "Updated stream configuration"
                );
                Ok(DeclareOutcome::Updated)
            }
            Err(e) if !stream_not_found(&e) => Err(BusError::Stream {
                name: definition.name.clone(),
                message: format!("Stream lookup failed: {}", e),
            }),
            Err(_) => {
                self.jetstream
                    .create_stream(definition.to_config())
                    .await
                    .map_err(|e| BusError::Stream {
                        name: definition.name.clone(),
                        message: format!("Failed to create stream: {}", e),
                    })?;
                info!(
                    stream = %definition.name,
                    subjects = ?definition.subjects,
                    "Created stream"
                );
                Ok(DeclareOutcome::Created)
            }
        }
    }

    /// Declare every stream of the catalog in order, stopping at the first failure.
    pub async fn declare_all(
        &self,
        catalog: &StreamCatalog,
    ) -> Result<Vec<(String, DeclareOutcome)>> {
        catalog.validate().map_err(|e| BusError::Stream {
            name: "catalog".to_string(),
            message: e.to_string(),
        })?;

        let mut outcomes = Vec::with_capacity(catalog.definitions().len());
        for definition in catalog.definitions() {
            let outcome = self.declare(definition).await?;
            outcomes.push((definition.name.clone(), outcome));
        }
        Ok(outcomes)
    }
}

fn stream_not_found(error: &GetStreamError) -> bool {
    matches!(
        error.kind(),
        GetStreamErrorKind::JetStream(e) if e.error_code() == ErrorCode::STREAM_NOT_FOUND
    )
}
