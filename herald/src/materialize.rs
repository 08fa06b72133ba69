use std::sync::Arc;

use crate::job::{JobId, NotificationPayload};
use crate::queue::{KeySpace, PayloadStore};

/// Why a claimed job could not be turned into a payload.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// The payload key does not exist.
    #[error("payload missing for job {job_id}")]
    Orphaned { job_id: JobId },

    /// The store could not be read.
    #[error("payload store read failed for job {job_id}: {source:#}")]
    Store {
        job_id: JobId,
        #[source]
        source: anyhow::Error,
    },

    /// The payload exists but is not a valid notification record.
    #[error("malformed payload for job {job_id}: {source}")]
    Malformed {
        job_id: JobId,
        #[source]
        source: serde_json::Error,
    },
}

impl MaterializeError {
    pub fn job_id(&self) -> &JobId {
        match self {
            MaterializeError::Orphaned { job_id }
            | MaterializeError::Store { job_id, .. }
            | MaterializeError::Malformed { job_id, .. } => job_id,
        }
    }

    /// Store failures may succeed on a later attempt; the rest never will.
    pub fn is_transient(&self) -> bool {
        matches!(self, MaterializeError::Store { .. })
    }
}

/// Loads and consumes the payload of a claimed job.
pub struct JobMaterializer<S: PayloadStore + ?Sized> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S: PayloadStore + ?Sized> std::fmt::Debug for JobMaterializer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMaterializer")
            .field("store_type", &std::any::type_name::<S>())
            .field("keys", &self.keys)
            .finish()
    }
}

impl<S: PayloadStore + ?Sized> JobMaterializer<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Fetch, delete and decode the payload of `job_id`.
    ///
    /// Once the fetch has returned, found or not, the key is deleted before
    /// decoding so malformed payloads do not linger. A failed fetch leaves the
    /// key untouched; callers that give up on the job follow with
    /// [`discard`](Self::discard).
    pub async fn materialize(
        &self,
        job_id: &JobId,
    ) -> Result<NotificationPayload, MaterializeError> {
        let key = self.keys.payload_key(job_id);

        let fetched = match self.store.fetch(&key).await {
            Ok(fetched) => fetched,
            Err(source) => {
                let err = MaterializeError::Store {
                    job_id: job_id.clone(),
                    source,
                };
                tracing::warn!(job_id = %job_id, "{err}");
                return Err(err);
            }
        };

        if let Err(err) = self.store.delete(&key).await {
            tracing::warn!(job_id = %job_id, key = %key, "payload delete failed: {err:#}");
        }

        let Some(raw) = fetched else {
            let err = MaterializeError::Orphaned {
                job_id: job_id.clone(),
            };
            tracing::warn!(job_id = %job_id, "orphan job, payload missing; skipping");
            return Err(err);
        };

        NotificationPayload::from_json(&raw).map_err(|source| {
            let err = MaterializeError::Malformed {
                job_id: job_id.clone(),
                source,
            };
            tracing::error!(job_id = %job_id, "{err}");
            err
        })
    }

    /// Best-effort delete of the payload of a job that will not be sent.
    pub async fn discard(&self, job_id: &JobId) {
        let key = self.keys.payload_key(job_id);
        match self.store.delete(&key).await {
            Ok(()) => tracing::debug!(job_id = %job_id, "payload discarded"),
            Err(err) => tracing::warn!(
                job_id = %job_id,
                key = %key,
                "payload delete failed: {err:#}"
            ),
        }
    }
}
