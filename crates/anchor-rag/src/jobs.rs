//! Pipeline job tracking.
//!
//! The tracker is the single mutator of job records. Async executions
//! register a job before the pipeline spawns and update it on terminal
//! completion; cancellation flips a per-job watch flag that the pipeline
//! checks between batches.

use crate::types::{JobStatus, PipelineCounters, PipelineJob, PipelineRequest, Progress};
use anchor::ids::{new_id, JOB_PREFIX};
use anchor::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::watch;

struct TrackedJob {
    job: PipelineJob,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<String, TrackedJob>>,
}

impl JobTracker {
    pub fn new() -> JobTracker {
        JobTracker::default()
    }

    /// Register a pending job; returns its id and the cancel receiver the
    /// pipeline watches.
    pub fn register(&self, request: PipelineRequest) -> (String, watch::Receiver<bool>) {
        let now = Utc::now();
        let id = new_id(JOB_PREFIX);
        let (cancel, cancel_rx) = watch::channel(false);
        let job = PipelineJob {
            id: id.clone(),
            integration_id: request.integration_id.clone(),
            status: JobStatus::Pending,
            progress: Progress::default(),
            request,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs
            .write()
            .insert(id.clone(), TrackedJob { job, cancel });
        (id, cancel_rx)
    }

    pub fn get(&self, job_id: &str) -> Result<PipelineJob> {
        self.jobs
            .read()
            .get(job_id)
            .map(|tracked| tracked.job.clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    pub fn list(&self) -> Vec<PipelineJob> {
        let mut all: Vec<PipelineJob> = self
            .jobs
            .read()
            .values()
            .map(|tracked| tracked.job.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn mark_running(&self, job_id: &str) {
        self.update(job_id, |job| job.status = JobStatus::Running);
    }

    pub fn update_progress(&self, job_id: &str, progress: Progress) {
        self.update(job_id, |job| job.progress = progress);
    }

    pub fn complete(&self, job_id: &str, counters: PipelineCounters) {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress.documents_processed = counters.processed;
            job.progress.documents_failed = counters.failed;
            job.progress.embeddings_stored = counters.stored_embeddings;
            job.result = Some(counters.clone());
        });
    }

    pub fn fail(&self, job_id: &str, error: &Error) {
        let message = error.to_string();
        self.update(job_id, move |job| {
            job.status = JobStatus::Failed;
            let mut counters = job.result.take().unwrap_or_default();
            counters.errors.push(message.clone());
            job.result = Some(counters);
        });
    }

    /// Request cancellation. In-flight batches finish; new batches are
    /// not started.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let jobs = self.jobs.read();
        let tracked = jobs
            .get(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        let _ = tracked.cancel.send(true);
        Ok(())
    }

    fn update(&self, job_id: &str, mutate: impl FnOnce(&mut PipelineJob)) {
        if let Some(tracked) = self.jobs.write().get_mut(job_id) {
            mutate(&mut tracked.job);
            tracked.job.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcessingOptions, SourceSpec, TargetSpec};

    fn request() -> PipelineRequest {
        PipelineRequest {
            integration_id: "integration_t".into(),
            source: SourceSpec {
                database_id: "db_a".into(),
                table: "t".into(),
                batch_size: 100,
            },
            target: TargetSpec {
                database_id: "db_b".into(),
                collection: "embeddings".into(),
            },
            options: ProcessingOptions::default(),
        }
    }

    #[test]
    fn jobs_progress_through_states() {
        let tracker = JobTracker::new();
        let (id, cancel) = tracker.register(request());
        assert!(id.starts_with("job_"));
        assert_eq!(tracker.get(&id).unwrap().status, JobStatus::Pending);
        assert!(!*cancel.borrow());

        tracker.mark_running(&id);
        assert_eq!(tracker.get(&id).unwrap().status, JobStatus::Running);

        tracker.complete(
            &id,
            PipelineCounters {
                processed: 10,
                stored_embeddings: 20,
                failed: 0,
                errors: Vec::new(),
            },
        );
        let job = tracker.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.embeddings_stored, 20);
    }

    #[test]
    fn cancel_flips_the_watch_flag() {
        let tracker = JobTracker::new();
        let (id, cancel) = tracker.register(request());
        tracker.cancel(&id).unwrap();
        assert!(*cancel.borrow());
        assert!(tracker.cancel("job_missing").is_err());
    }
}
