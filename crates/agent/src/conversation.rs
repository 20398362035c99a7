use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use threadline_core::config::CollisionPolicy;
use threadline_core::domain::event::InboundEvent;
use threadline_core::domain::run::RunId;
use threadline_core::domain::thread::{
    transition, HistoryEntry, ThreadEvent, ThreadKey, ThreadState, ThreadTransitionError,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("thread `{0}` has an active run; history is frozen until it ends")]
    ThreadBusy(ThreadKey),
    #[error("run `{run_id}` is not the active run of thread `{thread_key}`")]
    UnknownRun { thread_key: ThreadKey, run_id: RunId },
    #[error(transparent)]
    Transition(#[from] ThreadTransitionError),
}

/// Everything a run needs, captured atomically when it was admitted.
#[derive(Clone, Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub thread_key: ThreadKey,
    pub event: InboundEvent,
    /// History including the triggering user message.
    pub snapshot: Vec<HistoryEntry>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl RunHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
pub enum RunAdmission {
    Started(RunHandle),
    /// Collision policy `reject`: the event waits behind the active run.
    Queued { position: usize },
    /// Collision policy `preempt`: the active run was asked to stop and the
    /// event starts once it settles.
    Preempting { cancelled_run: RunId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// Entries produced by the run, committed to history in order.
    Completed { entries: Vec<HistoryEntry> },
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct ConversationThread {
    history: Vec<HistoryEntry>,
    sequence: u64,
    state: ThreadState,
    active: Option<ActiveRun>,
    pending: VecDeque<InboundEvent>,
    last_activity: Instant,
}

impl ConversationThread {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            sequence: 0,
            state: ThreadState::Idle,
            active: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn push(&mut self, entry: HistoryEntry) -> u64 {
        self.history.push(entry);
        self.sequence += 1;
        self.sequence
    }

    fn apply(&mut self, event: ThreadEvent) -> Result<(), ThreadTransitionError> {
        self.state = transition(self.state, event)?;
        Ok(())
    }

    fn start_run(
        &mut self,
        thread_key: &ThreadKey,
        event: InboundEvent,
    ) -> Result<RunHandle, ContextError> {
        self.apply(ThreadEvent::RunStarted)?;
        self.push(HistoryEntry::user(event.author.clone(), event.prompt_text()));

        let run_id = RunId::generate();
        let cancel = CancellationToken::new();
        self.active = Some(ActiveRun { run_id: run_id.clone(), cancel: cancel.clone() });
        self.last_activity = Instant::now();

        Ok(RunHandle {
            run_id,
            thread_key: thread_key.clone(),
            event,
            snapshot: self.history.clone(),
            cancel,
            started_at: Utc::now(),
        })
    }

    fn is_evictable(&self, max_idle: Duration) -> bool {
        self.state == ThreadState::Idle
            && self.active.is_none()
            && self.pending.is_empty()
            && self.last_activity.elapsed() >= max_idle
    }
}

/// Owns every thread's conversation state. All mutation goes through here,
/// under one lock, so admission, settlement and eviction never interleave.
#[derive(Debug)]
pub struct ConversationStore {
    policy: CollisionPolicy,
    threads: Mutex<HashMap<ThreadKey, ConversationThread>>,
}

impl ConversationStore {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self { policy, threads: Mutex::new(HashMap::new()) }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Appends outside of a run. Returns the thread's new sequence number.
    pub async fn append(
        &self,
        thread_key: &ThreadKey,
        entry: HistoryEntry,
    ) -> Result<u64, ContextError> {
        let mut threads = self.threads.lock().await;
        let thread = threads.entry(thread_key.clone()).or_insert_with(ConversationThread::new);
        if thread.state != ThreadState::Idle {
            return Err(ContextError::ThreadBusy(thread_key.clone()));
        }

        thread.last_activity = Instant::now();
        Ok(thread.push(entry))
    }

    pub async fn begin_run(&self, event: InboundEvent) -> Result<RunAdmission, ContextError> {
        let thread_key = event.thread_key.clone();
        let mut threads = self.threads.lock().await;
        let thread = threads.entry(thread_key.clone()).or_insert_with(|| {
            debug!(event_name = "context.thread.created", thread_key = %thread_key, "thread created");
            ConversationThread::new()
        });

        if thread.state == ThreadState::Idle {
            let handle = thread.start_run(&thread_key, event)?;
            info!(
                event_name = "context.run.started",
                thread_key = %thread_key,
                run_id = %handle.run_id,
                history_len = handle.snapshot.len(),
                "run started"
            );
            return Ok(RunAdmission::Started(handle));
        }

        thread.last_activity = Instant::now();
        match self.policy {
            CollisionPolicy::Reject => {
                thread.pending.push_back(event);
                let position = thread.pending.len();
                info!(
                    event_name = "context.run.queued",
                    thread_key = %thread_key,
                    position,
                    "thread busy, event queued"
                );
                Ok(RunAdmission::Queued { position })
            }
            CollisionPolicy::Preempt => {
                let active = thread.active.as_ref().ok_or_else(|| {
                    ContextError::Transition(ThreadTransitionError::InvalidTransition {
                        state: thread.state,
                        event: ThreadEvent::CancelRequested,
                    })
                })?;
                let cancelled_run = active.run_id.clone();
                active.cancel.cancel();
                thread.apply(ThreadEvent::CancelRequested)?;
                thread.pending.clear();
                thread.pending.push_back(event);
                info!(
                    event_name = "context.run.preempted",
                    thread_key = %thread_key,
                    run_id = %cancelled_run,
                    "newer event pre-empts active run"
                );
                Ok(RunAdmission::Preempting { cancelled_run })
            }
        }
    }

    /// Settles the run and, when an event is waiting, atomically starts the
    /// next run for the same thread.
    pub async fn end_run(
        &self,
        handle: &RunHandle,
        outcome: RunOutcome,
    ) -> Result<Option<RunHandle>, ContextError> {
        let mut threads = self.threads.lock().await;
        let unknown = || ContextError::UnknownRun {
            thread_key: handle.thread_key.clone(),
            run_id: handle.run_id.clone(),
        };
        let thread = threads.get_mut(&handle.thread_key).ok_or_else(unknown)?;
        match &thread.active {
            Some(active) if active.run_id == handle.run_id => {}
            _ => return Err(unknown()),
        }

        let status = match outcome {
            RunOutcome::Completed { entries } => {
                for entry in entries {
                    thread.push(entry);
                }
                if thread.state == ThreadState::Running {
                    thread.apply(ThreadEvent::RunCompleted)?;
                } else {
                    thread.apply(ThreadEvent::RunSettled)?;
                }
                "completed"
            }
            RunOutcome::Cancelled => {
                if thread.state == ThreadState::Running {
                    thread.apply(ThreadEvent::CancelRequested)?;
                }
                thread.apply(ThreadEvent::RunSettled)?;
                "cancelled"
            }
            RunOutcome::Failed { reason } => {
                warn!(
                    event_name = "context.run.failed",
                    thread_key = %handle.thread_key,
                    run_id = %handle.run_id,
                    reason = %reason,
                    "run failed, partial output discarded"
                );
                thread.apply(ThreadEvent::RunFailed)?;
                thread.apply(ThreadEvent::RunSettled)?;
                "failed"
            }
        };

        thread.active = None;
        thread.last_activity = Instant::now();
        info!(
            event_name = "context.run.ended",
            thread_key = %handle.thread_key,
            run_id = %handle.run_id,
            status,
            sequence = thread.sequence,
            "run ended"
        );

        match thread.pending.pop_front() {
            Some(next) => {
                let next_handle = thread.start_run(&handle.thread_key, next)?;
                info!(
                    event_name = "context.run.started",
                    thread_key = %handle.thread_key,
                    run_id = %next_handle.run_id,
                    history_len = next_handle.snapshot.len(),
                    "pending event started"
                );
                Ok(Some(next_handle))
            }
            None => Ok(None),
        }
    }

    /// Requests cancellation of the thread's active run. Returns false when
    /// the thread has no run to cancel.
    pub async fn cancel(&self, thread_key: &ThreadKey) -> Result<bool, ContextError> {
        let mut threads = self.threads.lock().await;
        let Some(thread) = threads.get_mut(thread_key) else {
            return Ok(false);
        };
        let Some(active) = thread.active.as_ref() else {
            return Ok(false);
        };

        active.cancel.cancel();
        let run_id = active.run_id.clone();
        thread.apply(ThreadEvent::CancelRequested)?;
        info!(
            event_name = "context.run.cancel_requested",
            thread_key = %thread_key,
            run_id = %run_id,
            "run cancellation requested"
        );
        Ok(true)
    }

    /// Cancels every active run and drops queued events. Used at shutdown.
    pub async fn cancel_all(&self) -> usize {
        let mut threads = self.threads.lock().await;
        let mut cancelled = 0;
        for thread in threads.values_mut() {
            thread.pending.clear();
            let Some(active) = thread.active.as_ref() else {
                continue;
            };
            active.cancel.cancel();
            if thread.apply(ThreadEvent::CancelRequested).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drops threads idle for at least `max_idle`. A thread with an active or
    /// queued run is never evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut threads = self.threads.lock().await;
        let before = threads.len();
        threads.retain(|thread_key, thread| {
            let evict = thread.is_evictable(max_idle);
            if evict {
                debug!(event_name = "context.thread.evicted", thread_key = %thread_key, "idle thread evicted");
            }
            !evict
        });
        before - threads.len()
    }

    pub async fn history(&self, thread_key: &ThreadKey) -> Vec<HistoryEntry> {
        let threads = self.threads.lock().await;
        threads.get(thread_key).map(|thread| thread.history.clone()).unwrap_or_default()
    }

    pub async fn state(&self, thread_key: &ThreadKey) -> Option<ThreadState> {
        let threads = self.threads.lock().await;
        threads.get(thread_key).map(|thread| thread.state)
    }

    pub async fn sequence(&self, thread_key: &ThreadKey) -> u64 {
        let threads = self.threads.lock().await;
        threads.get(thread_key).map(|thread| thread.sequence).unwrap_or(0)
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.lock().await.len()
    }

    pub async fn active_run_count(&self) -> usize {
        let threads = self.threads.lock().await;
        threads.values().filter(|thread| thread.active.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use threadline_core::config::CollisionPolicy;
    use threadline_core::domain::event::InboundEvent;
    use threadline_core::domain::thread::{HistoryEntry, ThreadKey, ThreadState};

    use super::{ContextError, ConversationStore, RunAdmission, RunHandle, RunOutcome};

    fn event(thread: &str, id: &str, text: &str) -> InboundEvent {
        InboundEvent::new(id, ThreadKey::new("C1", thread), "U1", text)
    }

    async fn start(store: &ConversationStore, event: InboundEvent) -> RunHandle {
        match store.begin_run(event).await.expect("begin run") {
            RunAdmission::Started(handle) => handle,
            other => panic!("expected run to start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_run_commits_entries_and_returns_to_idle() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let handle = start(&store, event("T1", "E1", "hello")).await;

        assert_eq!(handle.snapshot.len(), 1);
        assert_eq!(handle.snapshot[0].text(), Some("hello"));
        assert_eq!(store.state(&handle.thread_key).await, Some(ThreadState::Running));

        let next = store
            .end_run(
                &handle,
                RunOutcome::Completed { entries: vec![HistoryEntry::assistant("hi there")] },
            )
            .await
            .expect("end run");

        assert!(next.is_none());
        assert_eq!(store.state(&handle.thread_key).await, Some(ThreadState::Idle));
        let history = store.history(&handle.thread_key).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), Some("hi there"));
        assert_eq!(store.sequence(&handle.thread_key).await, 2);
    }

    #[tokio::test]
    async fn failed_run_discards_partial_output() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let handle = start(&store, event("T1", "E1", "hello")).await;

        store
            .end_run(&handle, RunOutcome::Failed { reason: "model unavailable".to_string() })
            .await
            .expect("end run");

        let history = store.history(&handle.thread_key).await;
        assert_eq!(history.len(), 1, "only the user message survives a failed run");
        assert_eq!(store.state(&handle.thread_key).await, Some(ThreadState::Idle));
    }

    #[tokio::test]
    async fn reject_policy_queues_events_fifo() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let first = start(&store, event("T1", "E1", "one")).await;

        let second = store.begin_run(event("T1", "E2", "two")).await.expect("second");
        let third = store.begin_run(event("T1", "E3", "three")).await.expect("third");
        assert!(matches!(second, RunAdmission::Queued { position: 1 }));
        assert!(matches!(third, RunAdmission::Queued { position: 2 }));
        assert!(!first.is_cancelled());

        let next = store
            .end_run(&first, RunOutcome::Completed { entries: vec![HistoryEntry::assistant("1")] })
            .await
            .expect("end first")
            .expect("second run starts");
        assert_eq!(next.event.event_id, "E2");
        let texts = next.snapshot.iter().filter_map(HistoryEntry::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["one", "1", "two"]);

        let last = store
            .end_run(&next, RunOutcome::Completed { entries: Vec::new() })
            .await
            .expect("end second")
            .expect("third run starts");
        assert_eq!(last.event.event_id, "E3");
    }

    #[tokio::test]
    async fn preempt_policy_cancels_active_run_and_keeps_newest_event() {
        let store = ConversationStore::new(CollisionPolicy::Preempt);
        let first = start(&store, event("T1", "E1", "one")).await;

        let admission = store.begin_run(event("T1", "E2", "two")).await.expect("second");
        assert!(
            matches!(admission, RunAdmission::Preempting { ref cancelled_run } if *cancelled_run == first.run_id)
        );
        assert!(first.is_cancelled());
        assert_eq!(store.state(&first.thread_key).await, Some(ThreadState::Cancelling));

        store.begin_run(event("T1", "E3", "three")).await.expect("third");

        let next = store
            .end_run(&first, RunOutcome::Cancelled)
            .await
            .expect("settle")
            .expect("newest event starts");
        assert_eq!(next.event.event_id, "E3");
        assert_eq!(store.state(&first.thread_key).await, Some(ThreadState::Running));
    }

    #[tokio::test]
    async fn distinct_threads_are_isolated() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let a = start(&store, event("TA", "E1", "alpha")).await;
        let b = start(&store, event("TB", "E2", "beta")).await;

        store
            .end_run(&a, RunOutcome::Completed { entries: vec![HistoryEntry::assistant("A")] })
            .await
            .expect("end a");
        store
            .end_run(&b, RunOutcome::Completed { entries: vec![HistoryEntry::assistant("B")] })
            .await
            .expect("end b");

        let history_a = store.history(&a.thread_key).await;
        let history_b = store.history(&b.thread_key).await;
        assert!(history_a.iter().all(|entry| entry.text() != Some("beta")));
        assert!(history_b.iter().all(|entry| entry.text() != Some("alpha")));
    }

    #[tokio::test]
    async fn append_is_refused_while_a_run_is_active() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let handle = start(&store, event("T1", "E1", "hello")).await;

        let result = store.append(&handle.thread_key, HistoryEntry::system("note")).await;
        assert_eq!(result, Err(ContextError::ThreadBusy(handle.thread_key.clone())));
    }

    #[tokio::test]
    async fn stale_handle_cannot_end_a_newer_run() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let first = start(&store, event("T1", "E1", "one")).await;
        store.end_run(&first, RunOutcome::Cancelled).await.expect("settle");
        let _second = start(&store, event("T1", "E2", "two")).await;

        let result = store.end_run(&first, RunOutcome::Cancelled).await;
        assert!(matches!(result, Err(ContextError::UnknownRun { .. })));
    }

    #[tokio::test]
    async fn explicit_cancel_marks_run_cancelling() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let handle = start(&store, event("T1", "E1", "hello")).await;

        assert_eq!(store.cancel(&handle.thread_key).await, Ok(true));
        assert!(handle.is_cancelled());
        assert_eq!(store.state(&handle.thread_key).await, Some(ThreadState::Cancelling));

        store.end_run(&handle, RunOutcome::Cancelled).await.expect("settle");
        assert_eq!(store.cancel(&handle.thread_key).await, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_skips_threads_with_active_runs() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        let idle = start(&store, event("T1", "E1", "one")).await;
        store.end_run(&idle, RunOutcome::Cancelled).await.expect("settle");
        let busy = start(&store, event("T2", "E2", "two")).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 1);
        assert_eq!(store.thread_count().await, 1);
        assert_eq!(store.state(&busy.thread_key).await, Some(ThreadState::Running));

        let fresh = start(&store, event("T1", "E3", "again")).await;
        assert_eq!(fresh.snapshot.len(), 1, "evicted thread restarts with empty history");
    }

    #[tokio::test(start_paused = true)]
    async fn recently_active_threads_survive_eviction() {
        let store = ConversationStore::new(CollisionPolicy::Reject);
        store.append(&ThreadKey::new("C1", "T1"), HistoryEntry::system("seed")).await.expect("append");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 0);
    }
}
