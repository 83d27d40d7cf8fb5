//! Work cache: reuse finished results, compute each fingerprint at most once.
//!
//! The cache sits in front of another [`Worker`]. A request whose result is
//! already in its slot is answered straight away. A request identical to one
//! that is still running attaches to it and shares its outcome. Otherwise the
//! request is rewritten to produce its output inside a fresh slot and passed
//! downstream. A failed computation leaves nothing behind.

mod folder;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

pub use folder::CacheFolder;

use crate::daemon::{WorkContext, Worker};
use crate::error::Error;
use crate::fsutil;
use crate::log::ParentLog;
use crate::model::{Cacheable, Fingerprint};
use crate::progress::{self, FanOutReporter, ProgressEvent, ProgressReporter, host_information};
use crate::telemetry::metrics;

struct Waiter<W> {
    work: W,
    reporter: Arc<dyn ProgressReporter>,
}

/// One computation in flight and everyone waiting for it.
struct Flight<W> {
    fanout: Arc<FanOutReporter>,
    waiters: Vec<Waiter<W>>,
}

enum Role {
    Leader(Arc<FanOutReporter>),
    Follower,
}

pub struct WorkCache<W> {
    folder: CacheFolder,
    downstream: Arc<dyn Worker<W>>,
    in_flight: Arc<Mutex<HashMap<Fingerprint, Flight<W>>>>,
    file_wait: Duration,
}

impl<W> Clone for WorkCache<W> {
    fn clone(&self) -> Self {
        Self {
            folder: self.folder.clone(),
            downstream: Arc::clone(&self.downstream),
            in_flight: Arc::clone(&self.in_flight),
            file_wait: self.file_wait,
        }
    }
}

impl<W: Cacheable> WorkCache<W> {
    /// `file_wait` bounds how long a finished computation may take to make
    /// its outputs visible in the slot.
    pub fn new(folder: CacheFolder, downstream: Arc<dyn Worker<W>>, file_wait: Duration) -> Self {
        Self {
            folder,
            downstream,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            file_wait,
        }
    }

    pub fn folder(&self) -> &CacheFolder {
        &self.folder
    }

    pub fn is_work_in_progress(&self) -> bool {
        !self.table().is_empty()
    }

    /// Requests currently waiting on `fingerprint`, the leader included.
    pub fn attached_requests(&self, fingerprint: &Fingerprint) -> usize {
        self.table()
            .get(fingerprint)
            .map_or(0, |flight| flight.waiters.len())
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Fingerprint, Flight<W>>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attach to a running computation, or register a new one.
    fn join_or_lead(&self, work: &W, fingerprint: &Fingerprint, ctx: &WorkContext) -> Role {
        let mut table = self.table();
        let waiter = Waiter {
            work: work.clone(),
            reporter: Arc::clone(&ctx.reporter),
        };
        if let Some(flight) = table.get_mut(fingerprint) {
            flight.fanout.attach(Arc::clone(&ctx.reporter));
            flight.waiters.push(waiter);
            return Role::Follower;
        }
        let fanout = Arc::new(FanOutReporter::new(Arc::clone(&ctx.reporter)));
        table.insert(
            fingerprint.clone(),
            Flight {
                fanout: Arc::clone(&fanout),
                waiters: vec![waiter],
            },
        );
        Role::Leader(fanout)
    }

    fn take_waiters(&self, fingerprint: &Fingerprint) -> Vec<Waiter<W>> {
        self.table()
            .remove(fingerprint)
            .map(|flight| flight.waiters)
            .unwrap_or_default()
    }

    fn finish_success(&self, fingerprint: &Fingerprint, slot: &Path) {
        for Waiter { work, reporter } in self.take_waiters(fingerprint) {
            work.report_cached_result(slot, &*reporter);
            match work.publish_result_files(slot) {
                Ok(()) => reporter.report_success(),
                Err(e) => reporter.report_failure(Arc::new(e)),
            }
        }
    }

    fn finish_failure(&self, fingerprint: &Fingerprint, error: Arc<Error>) {
        for waiter in self.take_waiters(fingerprint) {
            waiter.reporter.report_failure(Arc::clone(&error));
        }
    }

    fn count_lookup(&self, work: &W, result: &'static str) {
        metrics::cache_lookups().add(
            1,
            &[
                KeyValue::new("work_type", work.work_type().to_string()),
                KeyValue::new("result", result),
            ],
        );
    }

    async fn lead(
        &self,
        work: W,
        fingerprint: Fingerprint,
        fanout: Arc<FanOutReporter>,
        log: Arc<dyn ParentLog>,
    ) {
        fanout.report_start(&host_information());

        match self.folder.lookup(&work) {
            Ok(Some(slot)) => {
                self.count_lookup(&work, "hit");
                info!(fingerprint = %fingerprint, slot = %slot.display(), "cache hit");
                self.finish_success(&fingerprint, &slot);
                return;
            }
            Ok(None) => self.count_lookup(&work, "miss"),
            Err(e) => {
                self.count_lookup(&work, "miss");
                warn!(fingerprint = %fingerprint, error = %e, "cache lookup failed, recomputing");
            }
        }

        match self.compute(&work, &fanout, log).await {
            Ok(slot) => {
                info!(fingerprint = %fingerprint, slot = %slot.display(), "cached new result");
                self.finish_success(&fingerprint, &slot);
            }
            Err(error) => {
                warn!(fingerprint = %fingerprint, %error, "computation failed");
                self.finish_failure(&fingerprint, error);
            }
        }
    }

    async fn compute(
        &self,
        work: &W,
        fanout: &FanOutReporter,
        log: Arc<dyn ParentLog>,
    ) -> Result<PathBuf, Arc<Error>> {
        let slot = self.folder.begin(work).map_err(Arc::new)?;
        let packet = work.translate_to_cache_packet(&slot);

        let (reporter, mut events) = progress::channel();
        reporter.report_start(&host_information());
        let downstream = Arc::clone(&self.downstream);
        let ctx = WorkContext { reporter, log };
        tokio::spawn(async move { downstream.process_request(packet, ctx).await });

        let mut outcome = Ok(());
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::Start { .. } => {}
                ProgressEvent::Progress(info) => fanout.report_progress(info),
                ProgressEvent::Success => outcome = Ok(()),
                ProgressEvent::Failure(error) => outcome = Err(error),
            }
        }

        let outcome = match outcome {
            Ok(()) => {
                let outputs: Vec<PathBuf> =
                    work.output_files().iter().map(|f| slot.join(f)).collect();
                fsutil::wait_for_files(&outputs, self.file_wait)
                    .await
                    .into_result()
                    .and_then(|()| self.folder.commit(&slot))
                    .map_err(Arc::new)
            }
            Err(error) => Err(error),
        };

        if outcome.is_err() {
            if let Err(e) = self.folder.abandon(&slot) {
                warn!(slot = %slot.display(), error = %e, "cannot remove failed cache slot");
            }
        }
        outcome.map(|()| slot)
    }
}

#[async_trait]
impl<W: Cacheable> Worker<W> for WorkCache<W> {
    async fn process_request(&self, work: W, ctx: WorkContext) {
        let fingerprint = work.fingerprint();
        let fanout = match self.join_or_lead(&work, &fingerprint, &ctx) {
            Role::Leader(fanout) => fanout,
            Role::Follower => {
                self.count_lookup(&work, "coalesced");
                debug!(fingerprint = %fingerprint, "attached to running computation");
                return;
            }
        };

        // Detached from our caller: the other waiters depend on it finishing.
        let this = self.clone();
        let key = fingerprint.clone();
        let log = Arc::clone(&ctx.log);
        let leader = tokio::spawn(async move { this.lead(work, key, fanout, log).await });
        if let Err(e) = leader.await {
            self.finish_failure(
                &fingerprint,
                Arc::new(Error::Cache(format!("cache computation crashed: {e}"))),
            );
        }
    }
}
