use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{budget::DatasetId, noise::NoiseParameters, record::Record};

/// What the orchestrator asks a record source for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub dataset_id: DatasetId,
    /// Opaque schema description understood by the source.
    pub schema: serde_json::Value,
    pub hint: Option<String>,
    pub batch_size: usize,
    /// Noise the source must apply to any aggregate it conditions on.
    pub noise: Option<NoiseParameters>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("record source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("record source timed out after {0:?}")]
    SourceTimeout(Duration),
}

/// External generator of candidate rows. May be slow and may fail; the
/// orchestrator never retries on its behalf.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Record>, SourceError>;
}

#[async_trait]
impl<T: RecordSource + ?Sized> RecordSource for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Record>, SourceError> {
        (**self).generate(request).await
    }
}

/// Serves a fixed set of rows, truncated to the requested batch size.
#[derive(Clone, Debug, Default)]
pub struct StaticRecordSource {
    records: Vec<Record>,
}

impl StaticRecordSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Record>, SourceError> {
        Ok(self.records.iter().take(request.batch_size).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_source_truncates_to_batch_size() {
        let rows: Vec<Record> = (0..5)
            .map(|i| serde_json::from_value(json!({"id": i})).unwrap())
            .collect();
        let source: Arc<dyn RecordSource> = Arc::new(StaticRecordSource::new(rows));
        let request = GenerationRequest {
            dataset_id: DatasetId::new("d"),
            schema: json!({"id": "integer"}),
            hint: None,
            batch_size: 3,
            noise: None,
        };
        assert_eq!(source.generate(&request).await.unwrap().len(), 3);
    }
}
