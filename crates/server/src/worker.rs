use async_trait::async_trait;
use common::{stable_id, MediaRecord, StorageLocator, TranscodeState};
use library::Library;
use tracing::{info, warn};

use crate::jobs::{Job, JobError, JobHandler};
use crate::object_store::ObjectStore;
use crate::scan::{enrich_media, run_scan, ScanError};
use crate::state::AppState;
use crate::transcode::{TranscodeEngine, TranscodeSource, QUALITY_LADDER};

/// Executes queued jobs against the shared server state.
pub struct PipelineJobs {
    state: AppState,
}

impl PipelineJobs {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for PipelineJobs {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::Scan => match run_scan(&self.state).await {
                Ok(_) => Ok(()),
                Err(ScanError::InProgress) => {
                    info!("Scan job skipped, a scan is already running");
                    Ok(())
                }
                Err(err) => Err(JobError::Failed(err.to_string())),
            },
            Job::Transcode { media_id } => {
                transcode_media(
                    &self.state.library,
                    &self.state.transcoder,
                    self.state.object_store.as_deref(),
                    media_id,
                )
                .await
            }
            Job::Enrich { media_id, replace } => {
                match enrich_media(&self.state.library, &self.state.resolver, media_id, *replace)
                    .await
                {
                    Ok(Some(result)) => {
                        if result.updated {
                            info!("Metadata updated for {}", media_id);
                        }
                        Ok(())
                    }
                    Ok(None) => {
                        warn!("Enrich job for missing media {}", media_id);
                        Ok(())
                    }
                    Err(err) => Err(JobError::Failed(err.to_string())),
                }
            }
        }
    }

    async fn on_exhausted(&self, job: &Job) {
        let media_id = match job {
            Job::Transcode { media_id } => media_id,
            _ => return,
        };
        let record = match self.state.library.get_media(media_id) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!("Failed to load {} after transcode failure: {}", media_id, err);
                return;
            }
        };
        let state = settled_state(&record);
        if let Err(err) = self.state.library.set_transcode_state(media_id, state) {
            warn!("Failed to record transcode outcome for {}: {}", media_id, err);
        }
    }
}

/// State a record falls back to once its transcode job gives up. Renditions
/// from earlier runs still count.
fn settled_state(record: &MediaRecord) -> TranscodeState {
    let present = QUALITY_LADDER
        .iter()
        .filter(|rendition| record.renditions.contains_key(rendition.label))
        .count();
    if present == 0 {
        TranscodeState::Failed
    } else if present == QUALITY_LADDER.len() {
        TranscodeState::Complete
    } else {
        TranscodeState::PartiallyComplete
    }
}

/// Produces the quality ladder for one record. Renditions are persisted as
/// they land; the final state depends on how many made it.
pub async fn transcode_media(
    library: &Library,
    engine: &TranscodeEngine,
    object_store: Option<&dyn ObjectStore>,
    media_id: &str,
) -> Result<(), JobError> {
    let record = match library.get_media(media_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("Transcode job for missing media {}", media_id);
            return Ok(());
        }
        Err(err) => return Err(JobError::Failed(err.to_string())),
    };
    library
        .set_transcode_state(media_id, TranscodeState::InProgress)
        .map_err(|err| JobError::Failed(err.to_string()))?;

    let locator = StorageLocator::parse(&record.storage_path)
        .map_err(|err| JobError::Failed(err.to_string()))?;
    let source = match &locator {
        StorageLocator::Local(path) => TranscodeSource::File(path.clone()),
        StorageLocator::Remote { bucket, key } => {
            let store = object_store.ok_or_else(|| {
                JobError::Failed("object store not configured".to_string())
            })?;
            TranscodeSource::Object { store, bucket, key }
        }
    };

    let digest = stable_id(&record.storage_path);
    let base = &digest[..16];
    info!("Transcoding '{}' ({})", record.title, media_id);
    let produced = engine
        .transcode(&source, base, |label, url| {
            library.add_rendition(media_id, label, url).map(|_| ())
        })
        .await
        .map_err(|err| JobError::Failed(err.to_string()))?;

    if produced.is_empty() {
        return Err(JobError::Failed("no renditions produced".to_string()));
    }
    let state = if produced.len() == engine.ladder_len() {
        TranscodeState::Complete
    } else {
        TranscodeState::PartiallyComplete
    };
    library
        .set_transcode_state(media_id, state)
        .map_err(|err| JobError::Failed(err.to_string()))?;
    info!(
        "Transcode of {} finished with {} renditions",
        media_id,
        produced.len()
    );
    Ok(())
}
