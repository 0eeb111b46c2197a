use std::sync::Arc;
use std::time::Duration;

use genstudio_contracts::events::EventSink;
use genstudio_contracts::jobs::JobHandle;
use serde_json::json;

use crate::backend::{DownloadedAsset, VideoBackend};
use crate::clock::{CancellationToken, Sleeper};
use crate::emit;
use crate::error::{StudioError, StudioResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Waiting { attempt: u32 },
    Polling { attempt: u32 },
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { uri: String, asset: DownloadedAsset },
    /// The job finished but produced no downloadable result.
    CompletedWithoutResult,
}

pub struct JobPoller {
    backend: Arc<dyn VideoBackend>,
    interval: Duration,
    max_attempts: u32,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
    state: PollerState,
}

impl JobPoller {
    pub fn new(
        backend: Arc<dyn VideoBackend>,
        interval: Duration,
        max_attempts: u32,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            interval,
            max_attempts: max_attempts.max(1),
            sleeper,
            events,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// Waits one interval before every status check, then downloads the
    /// result once the job reports done with a URI. Poll failures are not
    /// retried.
    pub fn wait(&mut self, handle: &JobHandle, cancel: &CancellationToken) -> StudioResult<PollOutcome> {
        let result = self.run(handle, cancel);
        self.state = if result.is_ok() {
            PollerState::Completed
        } else {
            PollerState::Failed
        };
        if let Err(err) = &result {
            emit(
                self.events.as_ref(),
                "job_failed",
                json!({
                    "name": handle.as_str(),
                    "kind": err.kind().as_str(),
                    "error": err.to_string(),
                }),
            );
        }
        result
    }

    fn run(&mut self, handle: &JobHandle, cancel: &CancellationToken) -> StudioResult<PollOutcome> {
        for attempt in 1..=self.max_attempts {
            self.state = PollerState::Waiting { attempt };
            if !self.sleeper.sleep(self.interval, cancel) || cancel.is_cancelled() {
                return Err(StudioError::Cancelled);
            }

            self.state = PollerState::Polling { attempt };
            let status = self.backend.job_status(handle)?;
            emit(
                self.events.as_ref(),
                "job_poll",
                json!({ "name": handle.as_str(), "attempt": attempt, "done": status.done }),
            );

            if let Some(error) = status.error {
                return Err(StudioError::JobFailed(error));
            }
            if !status.done {
                continue;
            }

            let Some(uri) = status.uri else {
                emit(
                    self.events.as_ref(),
                    "job_completed",
                    json!({ "name": handle.as_str(), "attempts": attempt, "uri": null }),
                );
                return Ok(PollOutcome::CompletedWithoutResult);
            };
            emit(
                self.events.as_ref(),
                "job_completed",
                json!({ "name": handle.as_str(), "attempts": attempt, "uri": uri }),
            );
            let asset = self.backend.download_asset(&uri)?;
            emit(
                self.events.as_ref(),
                "asset_downloaded",
                json!({
                    "uri": uri,
                    "size_bytes": asset.bytes.len(),
                    "content_type": asset.content_type,
                }),
            );
            return Ok(PollOutcome::Completed { uri, asset });
        }
        Err(StudioError::PollTimeout {
            attempts: self.max_attempts,
        })
    }
}
