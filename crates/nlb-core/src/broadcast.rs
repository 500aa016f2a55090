//! Broadcast delivery engine.
//!
//! A job fans one payload out to the entire user population. At most one job
//! may be awaiting content or running at any time; a second start is refused,
//! never queued. Delivery is strictly sequential across recipients so the
//! outbound rate stays under the transport's ceiling and cancellation points
//! are deterministic: the cancellation token is observed between recipients,
//! never mid-send, and a failed recipient never aborts the job.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::{ChatId, MessageRef},
    formatting::render_progress,
    messaging::port::MessagingPort,
    store::UserStore,
    Result,
};

/// Identifier of a broadcast job within this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

/// Content delivered to every recipient. Captured once at `supply_content`
/// and immutable for the duration of the job.
#[derive(Clone, Debug)]
pub enum BroadcastPayload {
    Text(String),
    Photo {
        file_id: String,
        caption: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    AwaitingContent,
    Running,
    Cancelled,
    Finished,
}

impl JobState {
    pub fn label(self) -> &'static str {
        match self {
            JobState::AwaitingContent => "awaiting content",
            JobState::Running => "running",
            JobState::Cancelled => "cancelled",
            JobState::Finished => "finished",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(JobId),
    /// Another job is awaiting content or running; the request is refused,
    /// not queued.
    Refused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A job that was still awaiting content was dropped; the engine is idle.
    CancelledPending,
    /// The running job was flagged; the delivery loop stops at the next
    /// recipient boundary. Repeating the cancel is a no-op with the same answer.
    CancelledRunning,
    NoActiveJob,
}

/// Point-in-time view of a job's counters.
///
/// `total` is the population estimate taken at start; `sent + failed` is the
/// number of recipients actually visited and is the authoritative completion
/// signal.
#[derive(Clone, Copy, Debug)]
pub struct ProgressSnapshot {
    pub job: JobId,
    pub state: JobState,
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct BroadcastConfig {
    /// Delay applied after each delivery attempt.
    pub per_recipient_delay: Duration,
    /// Minimum spacing between progress edits in the operator's chat.
    pub progress_interval: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            per_recipient_delay: Duration::from_millis(50),
            progress_interval: Duration::from_secs(3),
        }
    }
}

struct Job {
    state: JobState,
    sent: u64,
    failed: u64,
    total: u64,
    started_at: DateTime<Utc>,
    operator: ChatId,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    active: Option<JobId>,
    last: Option<JobId>,
    jobs: HashMap<JobId, Job>,
}

struct EngineInner {
    store: Arc<dyn UserStore>,
    messenger: Arc<dyn MessagingPort>,
    cfg: BroadcastConfig,
    state: Mutex<EngineState>,
}

#[derive(Clone)]
pub struct BroadcastEngine {
    inner: Arc<EngineInner>,
}

/// Compare-and-swap state transition; the single-flight and terminal
/// invariants all reduce to this check.
fn transition(job: &mut Job, from: JobState, to: JobState) -> bool {
    if job.state == from {
        job.state = to;
        true
    } else {
        false
    }
}

fn snapshot_of(id: JobId, job: &Job) -> ProgressSnapshot {
    ProgressSnapshot {
        job: id,
        state: job.state,
        sent: job.sent,
        failed: job.failed,
        total: job.total,
        started_at: job.started_at,
    }
}

impl BroadcastEngine {
    pub fn new(
        store: Arc<dyn UserStore>,
        messenger: Arc<dyn MessagingPort>,
        cfg: BroadcastConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                messenger,
                cfg,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Begin a new job for `operator`, refusing if one is already active.
    /// The job waits in `AwaitingContent` until `supply_content`.
    pub async fn start(&self, operator: ChatId) -> Result<StartOutcome> {
        let id = {
            let mut st = self.inner.state.lock().await;
            if let Some(active) = st.active {
                let busy = st.jobs.get(&active).map(|j| {
                    matches!(j.state, JobState::AwaitingContent | JobState::Running)
                });
                if busy == Some(true) {
                    return Ok(StartOutcome::Refused);
                }
            }

            st.next_id += 1;
            let id = JobId(st.next_id);
            st.jobs.insert(
                id,
                Job {
                    state: JobState::AwaitingContent,
                    sent: 0,
                    failed: 0,
                    total: 0,
                    started_at: Utc::now(),
                    operator,
                    cancel: CancellationToken::new(),
                    handle: None,
                },
            );
            st.active = Some(id);
            id
        };

        // Population count is snapshotted for progress display only; the
        // delivery loop iterates a live cursor.
        match self.inner.store.count().await {
            Ok(total) => {
                let mut st = self.inner.state.lock().await;
                if let Some(job) = st.jobs.get_mut(&id) {
                    job.total = total;
                }
                Ok(StartOutcome::Started(id))
            }
            Err(e) => {
                let mut st = self.inner.state.lock().await;
                st.jobs.remove(&id);
                if st.active == Some(id) {
                    st.active = None;
                }
                Err(e)
            }
        }
    }

    /// Attach the payload and begin delivery. Returns `false` if the job is
    /// not awaiting content (already running, cancelled or unknown).
    pub async fn supply_content(&self, id: JobId, payload: BroadcastPayload) -> bool {
        {
            let mut st = self.inner.state.lock().await;
            let Some(job) = st.jobs.get_mut(&id) else {
                return false;
            };
            if !transition(job, JobState::AwaitingContent, JobState::Running) {
                return false;
            }
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.deliver(id, payload).await });

        let mut st = self.inner.state.lock().await;
        if let Some(job) = st.jobs.get_mut(&id) {
            job.handle = Some(handle);
        }
        true
    }

    /// Cancel the active job. Messages already sent are not retracted;
    /// cancelling twice is a no-op.
    pub async fn cancel(&self) -> CancelOutcome {
        let mut st = self.inner.state.lock().await;
        let Some(id) = st.active else {
            return CancelOutcome::NoActiveJob;
        };

        let outcome = match st.jobs.get_mut(&id) {
            Some(job) => match job.state {
                JobState::AwaitingContent => {
                    job.state = JobState::Cancelled;
                    job.cancel.cancel();
                    CancelOutcome::CancelledPending
                }
                JobState::Running | JobState::Cancelled => {
                    job.state = JobState::Cancelled;
                    job.cancel.cancel();
                    CancelOutcome::CancelledRunning
                }
                JobState::Finished => CancelOutcome::NoActiveJob,
            },
            None => CancelOutcome::NoActiveJob,
        };

        if outcome != CancelOutcome::CancelledRunning {
            // Pending jobs drop back to idle; a finished or missing entry
            // should not stay active either.
            st.active = None;
            if st.jobs.contains_key(&id) {
                st.last = Some(id);
            }
        }
        outcome
    }

    /// The active job awaiting content from `operator`, if any. The router
    /// uses this to treat the operator's next message as the payload.
    pub async fn pending_for(&self, operator: ChatId) -> Option<JobId> {
        let st = self.inner.state.lock().await;
        let id = st.active?;
        let job = st.jobs.get(&id)?;
        (job.state == JobState::AwaitingContent && job.operator == operator).then_some(id)
    }

    /// Snapshot of the active job, falling back to the most recently
    /// completed one.
    pub async fn status(&self) -> Option<ProgressSnapshot> {
        let st = self.inner.state.lock().await;
        let id = st.active.or(st.last)?;
        st.jobs.get(&id).map(|j| snapshot_of(id, j))
    }

    pub async fn snapshot(&self, id: JobId) -> Option<ProgressSnapshot> {
        let st = self.inner.state.lock().await;
        st.jobs.get(&id).map(|j| snapshot_of(id, j))
    }

    /// Wait for a job's delivery task to finish (used by tests and shutdown).
    pub async fn join(&self, id: JobId) {
        let handle = {
            let mut st = self.inner.state.lock().await;
            st.jobs.get_mut(&id).and_then(|j| j.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn deliver(self, id: JobId, payload: BroadcastPayload) {
        let (operator, cancel) = {
            let st = self.inner.state.lock().await;
            let Some(job) = st.jobs.get(&id) else { return };
            (job.operator, job.cancel.clone())
        };

        // Progress message in the operator's chat; its failures never abort
        // the job.
        let progress_msg: Option<MessageRef> = match self.snapshot(id).await {
            Some(snap) => self
                .inner
                .messenger
                .send_html(operator, &render_progress(&snap))
                .await
                .ok(),
            None => None,
        };
        let mut last_edit = Instant::now();

        let mut cursor = match self.inner.store.all_users().await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(job = id.0, "broadcast could not open the user cursor: {e}");
                self.finalize(id, progress_msg).await;
                return;
            }
        };

        loop {
            // Cooperative cancellation: checked once per recipient, never
            // mid-send.
            if cancel.is_cancelled() {
                break;
            }
            let Some(next) = cursor.next().await else {
                break;
            };
            let user = match next {
                Ok(user) => user,
                Err(e) => {
                    debug!(job = id.0, "user cursor error, skipping entry: {e}");
                    continue;
                }
            };

            match self.deliver_one(user.id.chat(), &payload).await {
                Ok(()) => self.bump(id, true).await,
                Err(e) => {
                    // Blocked recipient, deactivated account, transport error:
                    // counted, never propagated.
                    debug!(job = id.0, recipient = user.id.0, "delivery failed: {e}");
                    self.bump(id, false).await;
                }
            }

            if !self.inner.cfg.per_recipient_delay.is_zero() {
                sleep(self.inner.cfg.per_recipient_delay).await;
            }

            if let Some(msg) = progress_msg {
                if last_edit.elapsed() >= self.inner.cfg.progress_interval {
                    if let Some(snap) = self.snapshot(id).await {
                        let _ = self
                            .inner
                            .messenger
                            .edit_html(msg, &render_progress(&snap))
                            .await;
                    }
                    last_edit = Instant::now();
                }
            }
        }

        self.finalize(id, progress_msg).await;
    }

    async fn deliver_one(&self, chat: ChatId, payload: &BroadcastPayload) -> Result<()> {
        match payload {
            BroadcastPayload::Text(text) => {
                self.inner.messenger.send_html(chat, text).await?;
            }
            BroadcastPayload::Photo { file_id, caption } => {
                self.inner
                    .messenger
                    .send_photo(chat, file_id, caption.as_deref())
                    .await?;
            }
        }
        Ok(())
    }

    async fn bump(&self, id: JobId, delivered: bool) {
        let mut st = self.inner.state.lock().await;
        if let Some(job) = st.jobs.get_mut(&id) {
            if delivered {
                job.sent += 1;
            } else {
                job.failed += 1;
            }
        }
    }

    async fn finalize(&self, id: JobId, progress_msg: Option<MessageRef>) {
        let snap = {
            let mut st = self.inner.state.lock().await;
            if let Some(job) = st.jobs.get_mut(&id) {
                // No-op when the job was already cancelled.
                transition(job, JobState::Running, JobState::Finished);
            }
            if st.active == Some(id) {
                st.active = None;
                st.last = Some(id);
            }
            st.jobs.get(&id).map(|j| snapshot_of(id, j))
        };

        let Some(snap) = snap else { return };
        info!(
            job = id.0,
            state = snap.state.label(),
            sent = snap.sent,
            failed = snap.failed,
            total = snap.total,
            "broadcast finished"
        );

        // Final counts are reported even when cancelled; best-effort.
        let report = render_progress(&snap);
        match progress_msg {
            Some(msg) => {
                if self.inner.messenger.edit_html(msg, &report).await.is_err() {
                    let _ = self.inner.messenger.send_html(msg.chat_id, &report).await;
                }
            }
            None => {
                let operator = {
                    let st = self.inner.state.lock().await;
                    st.jobs.get(&id).map(|j| j.operator)
                };
                if let Some(operator) = operator {
                    let _ = self.inner.messenger.send_html(operator, &report).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, UserId};
    use crate::messaging::types::MessagingCapabilities;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    const OPERATOR: ChatId = ChatId(1000);

    #[derive(Default)]
    struct FakeMessenger {
        attempts: StdMutex<Vec<(i64, String)>>,
        photo_attempts: StdMutex<Vec<(i64, String, Option<String>)>>,
        edits: StdMutex<Vec<String>>,
        fail_chats: StdMutex<HashSet<i64>>,
        fail_edits: bool,
        cancel_after: Option<usize>,
        engine: OnceLock<BroadcastEngine>,
        next_id: AtomicI32,
    }

    impl FakeMessenger {
        fn alloc(&self, chat_id: ChatId) -> MessageRef {
            MessageRef {
                chat_id,
                message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            }
        }

        fn delivery_attempts(&self) -> Vec<i64> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .map(|(chat, _)| *chat)
                .filter(|chat| *chat != OPERATOR.0)
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_html: true,
                supports_edit: true,
                supports_media: true,
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            self.attempts
                .lock()
                .unwrap()
                .push((chat_id.0, html.to_string()));

            if chat_id != OPERATOR {
                if let (Some(limit), Some(engine)) = (self.cancel_after, self.engine.get()) {
                    let delivered = self.delivery_attempts().len();
                    if delivered == limit {
                        engine.cancel().await;
                    }
                }
            }

            if self.fail_chats.lock().unwrap().contains(&chat_id.0) {
                return Err(crate::Error::External("blocked by recipient".to_string()));
            }
            Ok(self.alloc(chat_id))
        }

        async fn send_photo(
            &self,
            chat_id: ChatId,
            file_id: &str,
            caption_html: Option<&str>,
        ) -> Result<MessageRef> {
            self.photo_attempts.lock().unwrap().push((
                chat_id.0,
                file_id.to_string(),
                caption_html.map(|s| s.to_string()),
            ));
            if self.fail_chats.lock().unwrap().contains(&chat_id.0) {
                return Err(crate::Error::External("blocked by recipient".to_string()));
            }
            Ok(self.alloc(chat_id))
        }

        async fn edit_html(&self, _msg: MessageRef, html: &str) -> Result<()> {
            if self.fail_edits {
                return Err(crate::Error::External("edit rejected".to_string()));
            }
            self.edits.lock().unwrap().push(html.to_string());
            Ok(())
        }
    }

    fn test_cfg() -> BroadcastConfig {
        BroadcastConfig {
            per_recipient_delay: Duration::ZERO,
            progress_interval: Duration::ZERO,
        }
    }

    async fn populated_store(n: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=n {
            store.create_if_absent(UserId(id), 2).await.unwrap();
        }
        store
    }

    async fn started(engine: &BroadcastEngine) -> JobId {
        match engine.start(OPERATOR).await.unwrap() {
            StartOutcome::Started(id) => id,
            StartOutcome::Refused => panic!("start refused"),
        }
    }

    #[tokio::test]
    async fn one_failing_recipient_is_counted_not_fatal() {
        let store = populated_store(5).await;
        let messenger = Arc::new(FakeMessenger {
            fail_edits: true, // progress failures must be swallowed too
            ..Default::default()
        });
        messenger.fail_chats.lock().unwrap().insert(3);
        let engine = BroadcastEngine::new(store, messenger.clone(), test_cfg());

        let id = started(&engine).await;
        assert!(engine.supply_content(id, BroadcastPayload::Text("hello".into())).await);
        engine.join(id).await;

        let snap = engine.snapshot(id).await.unwrap();
        assert_eq!(snap.state, JobState::Finished);
        assert_eq!((snap.sent, snap.failed, snap.total), (4, 1, 5));
        assert_eq!(messenger.delivery_attempts().len(), 5);
    }

    #[tokio::test]
    async fn cancel_stops_at_the_next_recipient_boundary() {
        let store = populated_store(5).await;
        let messenger = Arc::new(FakeMessenger {
            cancel_after: Some(2),
            ..Default::default()
        });
        let engine = BroadcastEngine::new(store, messenger.clone(), test_cfg());
        messenger.engine.set(engine.clone()).ok();

        let id = started(&engine).await;
        assert!(engine.supply_content(id, BroadcastPayload::Text("hello".into())).await);
        engine.join(id).await;

        let snap = engine.snapshot(id).await.unwrap();
        assert_eq!(snap.state, JobState::Cancelled);
        assert_eq!(snap.sent + snap.failed, 2);
        assert_eq!(messenger.delivery_attempts().len(), 2);

        // Cancelling again is a no-op.
        assert_eq!(engine.cancel().await, CancelOutcome::NoActiveJob);
    }

    #[tokio::test]
    async fn second_start_is_refused_and_leaves_the_job_untouched() {
        let store = populated_store(3).await;
        let messenger = Arc::new(FakeMessenger::default());
        let engine = BroadcastEngine::new(store, messenger, test_cfg());

        let id = started(&engine).await;
        assert_eq!(engine.start(OPERATOR).await.unwrap(), StartOutcome::Refused);
        assert_eq!(engine.start(ChatId(2000)).await.unwrap(), StartOutcome::Refused);

        let snap = engine.snapshot(id).await.unwrap();
        assert_eq!(snap.state, JobState::AwaitingContent);
        assert_eq!(snap.total, 3);
    }

    #[tokio::test]
    async fn cancelling_a_pending_job_returns_the_engine_to_idle() {
        let store = populated_store(3).await;
        let messenger = Arc::new(FakeMessenger::default());
        let engine = BroadcastEngine::new(store, messenger.clone(), test_cfg());

        let id = started(&engine).await;
        assert_eq!(engine.cancel().await, CancelOutcome::CancelledPending);
        assert_eq!(engine.snapshot(id).await.unwrap().state, JobState::Cancelled);

        // A cancelled pending job accepts no content...
        assert!(!engine.supply_content(id, BroadcastPayload::Text("late".into())).await);
        assert!(messenger.delivery_attempts().is_empty());

        // ...and a fresh start succeeds.
        let second = started(&engine).await;
        assert_ne!(second, id);
    }

    #[tokio::test]
    async fn photo_payload_goes_through_the_media_path() {
        let store = populated_store(2).await;
        let messenger = Arc::new(FakeMessenger::default());
        let engine = BroadcastEngine::new(store, messenger.clone(), test_cfg());

        let id = started(&engine).await;
        assert!(
            engine
                .supply_content(
                    id,
                    BroadcastPayload::Photo {
                        file_id: "file-42".into(),
                        caption: Some("caption".into()),
                    },
                )
                .await
        );
        engine.join(id).await;

        let photos = messenger.photo_attempts.lock().unwrap();
        assert_eq!(photos.len(), 2);
        assert!(photos.iter().all(|(_, f, c)| f == "file-42" && c.as_deref() == Some("caption")));
        drop(photos);

        let snap = engine.snapshot(id).await.unwrap();
        assert_eq!((snap.sent, snap.failed), (2, 0));
    }

    #[tokio::test]
    async fn status_reports_the_last_job_after_completion() {
        let store = populated_store(1).await;
        let messenger = Arc::new(FakeMessenger::default());
        let engine = BroadcastEngine::new(store, messenger, test_cfg());

        assert!(engine.status().await.is_none());

        let id = started(&engine).await;
        assert!(engine.supply_content(id, BroadcastPayload::Text("x".into())).await);
        engine.join(id).await;

        let snap = engine.status().await.unwrap();
        assert_eq!(snap.job, id);
        assert_eq!(snap.state, JobState::Finished);
    }
}
