//! Remote snapshot store speaking to the relay server's snapshot API.
//!
//! `GET /api/snapshots/:document_id` answers 404 for a board that was never saved;
//! `PUT` replaces the row. Bodies carry the row value exactly as stored, so the same
//! base64 / hex-literal decoding applies.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode_row, encode_row, SnapshotStore, StorageError, StorageResult};
use crate::sync::Snapshot;

/// Wire body of the snapshot API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBody {
    pub document_id: String,
    pub snapshot: String,
}

#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, document_id: &str) -> String {
        format!(
            "{}/api/snapshots/{}",
            self.base_url.trim_end_matches('/'),
            document_id
        )
    }
}

fn remote(err: reqwest::Error) -> StorageError {
    StorageError::Remote(err.to_string())
}

#[async_trait]
impl SnapshotStore for HttpStore {
    async fn load(&self, document_id: &str) -> StorageResult<Option<Snapshot>> {
        let response = self
            .client
            .get(self.url_for(document_id))
            .send()
            .await
            .map_err(remote)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: SnapshotBody = response
            .error_for_status()
            .map_err(remote)?
            .json()
            .await
            .map_err(remote)?;

        decode_row(document_id, body.snapshot.as_bytes()).map(Some)
    }

    async fn save(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let body = SnapshotBody {
            document_id: document_id.to_string(),
            snapshot: encode_row(snapshot),
        };

        self.client
            .put(self.url_for(document_id))
            .json(&body)
            .send()
            .await
            .map_err(remote)?
            .error_for_status()
            .map_err(remote)?;

        debug!("Saved snapshot for {} remotely", document_id);
        Ok(())
    }
}
