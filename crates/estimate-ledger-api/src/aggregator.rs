use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use estimate_ledger_client::{FailureKind, VersionSource};
use estimate_ledger_core::{
    aggregate, matching_versions, resolve_identity, EstimateVersion, ParentKey, RecordIdentity,
    RecordKind, ScopePolicy, VersionedRecord,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::notice::{report, Origin};
use crate::poller::{spawn_poller, PollHandle};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Stale,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Stale => "stale",
        }
    }
}

/// One published aggregation of child records for an estimate.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateView<R> {
    pub run_id: String,
    pub estimate: ParentKey,
    pub kind: RecordKind,
    pub versions_consulted: usize,
    pub count: usize,
    pub digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub records: Vec<R>,
}

impl<R> AggregateView<R>
where
    R: VersionedRecord + Serialize,
{
    /// Run the merge pipeline over already fetched revisions.
    #[must_use]
    pub fn build(
        draft: &[Option<R>],
        versions: &[EstimateVersion],
        parent_key: &ParentKey,
        policy: &ScopePolicy,
    ) -> Self {
        let records = aggregate(draft, versions, parent_key, policy);
        Self {
            run_id: Ulid::new().to_string(),
            estimate: parent_key.clone(),
            kind: R::KIND,
            versions_consulted: matching_versions(versions, parent_key).len(),
            count: records.len(),
            digest: compute_view_digest(&records),
            generated_at: OffsetDateTime::now_utc(),
            records,
        }
    }
}

/// Digest over the ordered records; unchanged content yields the same value across runs.
fn compute_view_digest<R>(records: &[R]) -> String
where
    R: VersionedRecord + Serialize,
{
    let mut hasher = Sha256::new();
    for record in records {
        let marker = match resolve_identity(record) {
            RecordIdentity::Id(id) => format!("id:{id}"),
            RecordIdentity::Fallback(key) => format!("key:{key}"),
        };
        hasher.update(marker.as_bytes());
        match serde_json::to_vec(record) {
            Ok(body) => hasher.update(body),
            Err(err) => {
                // The identity marker alone still separates distinct records.
                tracing::warn!(
                    kind = %R::KIND,
                    identity = %marker,
                    error = %err,
                    "record could not be serialized for the view digest"
                );
            }
        }
        hasher.update([0_u8]);
    }

    let digest = hasher.finalize();
    format!("sha256:{digest:x}")
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateState<R> {
    pub phase: Phase,
    /// Ticket of the newest refresh that touched this state.
    pub ticket: u64,
    pub view: Option<AggregateView<R>>,
    pub last_error: Option<String>,
}

impl<R> Default for AggregateState<R> {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            ticket: 0,
            view: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published { count: usize, digest: String },
    Failed { kind: FailureKind, message: String },
    /// A newer refresh was initiated before this one completed.
    Superseded,
}

struct Inner<R, S> {
    source: S,
    policy: ScopePolicy,
    issued: AtomicU64,
    state: watch::Sender<AggregateState<R>>,
}

/// Fetches every revision of an estimate and publishes the merged child records.
///
/// Refreshes may overlap. Each one takes a ticket when it starts and its result
/// is published only while that ticket is still the newest, so the view always
/// reflects the most recently initiated refresh.
pub struct Aggregator<R, S> {
    inner: Arc<Inner<R, S>>,
}

impl<R, S> Clone for Aggregator<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, S> Aggregator<R, S>
where
    R: VersionedRecord + Serialize + Send + Sync + 'static,
    S: VersionSource + 'static,
{
    #[must_use]
    pub fn new(source: S, policy: ScopePolicy) -> Self {
        let (state, _) = watch::channel(AggregateState::default());
        Self {
            inner: Arc::new(Inner {
                source,
                policy,
                issued: AtomicU64::new(0),
                state,
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ScopePolicy {
        &self.inner.policy
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AggregateState<R>> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> AggregateState<R> {
        self.inner.state.borrow().clone()
    }

    /// Fetch, merge, and publish. Failures are logged and recorded on the state, never returned.
    pub async fn refresh(&self, parent_key: ParentKey, draft: Vec<Option<R>>) -> RefreshOutcome {
        let ticket = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_if_modified(|state| {
            if ticket < state.ticket {
                return false;
            }
            state.phase = Phase::Loading;
            state.ticket = ticket;
            true
        });

        // A blank key matches no revision; only the draft is aggregated.
        let fetched = if parent_key.is_blank() {
            Ok(Vec::new())
        } else {
            self.inner.source.fetch_versions(&parent_key).await
        };

        match fetched {
            Ok(versions) => {
                let view =
                    AggregateView::build(&draft, &versions, &parent_key, &self.inner.policy);
                let count = view.count;
                let digest = view.digest.clone();
                let run_id = view.run_id.clone();
                let published = self.publish(ticket, |state| {
                    state.phase = Phase::Ready;
                    state.view = Some(view);
                    state.last_error = None;
                });
                if !published {
                    return self.superseded(ticket, &parent_key);
                }
                tracing::info!(
                    estimate = %parent_key,
                    kind = %R::KIND,
                    run_id = %run_id,
                    count,
                    "published aggregate view"
                );
                RefreshOutcome::Published { count, digest }
            }
            Err(err) => {
                report(Origin::Background, &err);
                let kind = err.kind();
                let message = err.to_string();
                let recorded = message.clone();
                let published = self.publish(ticket, |state| {
                    state.phase = Phase::Stale;
                    state.last_error = Some(recorded);
                });
                if !published {
                    return self.superseded(ticket, &parent_key);
                }
                RefreshOutcome::Failed { kind, message }
            }
        }
    }

    /// Run [`Self::refresh`] as a detached task.
    pub fn spawn_refresh(
        &self,
        parent_key: ParentKey,
        draft: Vec<Option<R>>,
    ) -> JoinHandle<RefreshOutcome> {
        let aggregator = self.clone();
        tokio::spawn(async move { aggregator.refresh(parent_key, draft).await })
    }

    /// Refresh `parent_key` every `period` until the returned handle is stopped or dropped.
    ///
    /// # Errors
    /// Returns an error when `period` is zero.
    pub fn poll(
        &self,
        period: Duration,
        parent_key: ParentKey,
        draft: Vec<Option<R>>,
    ) -> anyhow::Result<PollHandle> {
        let aggregator = self.clone();
        spawn_poller(period, move || {
            let aggregator = aggregator.clone();
            let parent_key = parent_key.clone();
            let draft = draft.clone();
            async move {
                aggregator.refresh(parent_key, draft).await;
            }
        })
    }

    fn publish<F>(&self, ticket: u64, apply: F) -> bool
    where
        F: FnOnce(&mut AggregateState<R>),
    {
        self.inner.state.send_if_modified(|state| {
            if self.inner.issued.load(Ordering::SeqCst) != ticket {
                return false;
            }
            apply(state);
            true
        })
    }

    fn superseded(&self, ticket: u64, parent_key: &ParentKey) -> RefreshOutcome {
        tracing::debug!(
            estimate = %parent_key,
            ticket,
            latest = self.inner.issued.load(Ordering::SeqCst),
            "discarding superseded refresh"
        );
        RefreshOutcome::Superseded
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use estimate_ledger_client::ClientError;
    use estimate_ledger_core::{LooseValue, Receipt, Scope};

    use super::*;

    enum Step {
        Versions(Vec<EstimateVersion>, Duration),
        Fail(&'static str, Duration),
    }

    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Step>>,
        fallback: Vec<EstimateVersion>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                ..Self::default()
            }
        }
    }

    impl VersionSource for ScriptedSource {
        fn fetch_versions(
            &self,
            _parent_key: &ParentKey,
        ) -> impl Future<Output = Result<Vec<EstimateVersion>, ClientError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().ok().and_then(|mut script| script.pop_front());
            let fallback = self.fallback.clone();
            async move {
                match step {
                    Some(Step::Versions(versions, delay)) => {
                        tokio::time::sleep(delay).await;
                        Ok(versions)
                    }
                    Some(Step::Fail(message, delay)) => {
                        tokio::time::sleep(delay).await;
                        Err(ClientError::Application(message.to_string()))
                    }
                    None => Ok(fallback),
                }
            }
        }
    }

    fn receipt(vendor: &str, amount: i64, date: &str, owner: &str) -> Receipt {
        Receipt {
            vendor: Some(vendor.to_string()),
            amount: Some(LooseValue::from(amount)),
            date: Some(date.to_string()),
            created_by: Some(owner.to_string()),
            ..Receipt::default()
        }
    }

    fn version(estimate: &str, receipts: Vec<Receipt>) -> EstimateVersion {
        EstimateVersion {
            estimate_number: Some(LooseValue::from(estimate)),
            receipts: Some(receipts.into_iter().map(Some).collect()),
            ..EstimateVersion::default()
        }
    }

    fn e100_versions() -> Vec<EstimateVersion> {
        vec![
            version("E-100", vec![receipt("A", 10, "2024-01-01", "a@x.com")]),
            version(
                "E-100",
                vec![
                    receipt("A", 10, "2024-01-01", "a@x.com"),
                    receipt("B", 5, "2024-02-01", "a@x.com"),
                ],
            ),
            version("E-200", vec![receipt("Z", 1, "2024-05-01", "a@x.com")]),
        ]
    }

    fn vendors(state: &AggregateState<Receipt>) -> Vec<String> {
        match &state.view {
            Some(view) => {
                view.records.iter().filter_map(|record| record.vendor.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    fn aggregator(source: ScriptedSource) -> Aggregator<Receipt, ScriptedSource> {
        Aggregator::new(source, ScopePolicy::all())
    }

    // Test IDs: TAGR-001
    #[tokio::test]
    async fn refresh_publishes_merged_view_for_matching_revisions() {
        let agg = aggregator(ScriptedSource::new(vec![Step::Versions(
            e100_versions(),
            Duration::ZERO,
        )]));
        assert_eq!(agg.state().phase, Phase::Idle);

        let outcome = agg.refresh(ParentKey::new(" E-100 "), Vec::new()).await;
        assert!(matches!(outcome, RefreshOutcome::Published { count: 2, .. }));

        let state = agg.state();
        assert_eq!(state.phase, Phase::Ready);
        assert_eq!(vendors(&state), vec!["B".to_string(), "A".to_string()]);
        let Some(view) = state.view else {
            panic!("expected a published view");
        };
        assert_eq!(view.estimate.as_str(), "E-100");
        assert_eq!(view.kind, RecordKind::Receipt);
        assert_eq!(view.versions_consulted, 2);
        assert!(view.digest.starts_with("sha256:"));
        assert!(Ulid::from_string(&view.run_id).is_ok());
    }

    // Test IDs: TAGR-002
    #[tokio::test]
    async fn fetch_failure_keeps_previous_view_and_marks_state_stale() {
        let agg = aggregator(ScriptedSource::new(vec![
            Step::Versions(e100_versions(), Duration::ZERO),
            Step::Fail("Estimate is locked", Duration::ZERO),
            Step::Versions(e100_versions(), Duration::ZERO),
        ]));
        let key = ParentKey::new("E-100");

        agg.refresh(key.clone(), Vec::new()).await;
        let before = agg.state();

        let outcome = agg.refresh(key.clone(), Vec::new()).await;
        match outcome {
            RefreshOutcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Application);
                assert!(message.contains("Estimate is locked"));
            }
            other => panic!("expected failure outcome, got {other:?}"),
        }

        let stale = agg.state();
        assert_eq!(stale.phase, Phase::Stale);
        assert_eq!(stale.view, before.view);
        assert!(stale.last_error.is_some());

        agg.refresh(key, Vec::new()).await;
        let recovered = agg.state();
        assert_eq!(recovered.phase, Phase::Ready);
        assert_eq!(recovered.last_error, None);
    }

    // Test IDs: TAGR-003
    #[tokio::test]
    async fn slower_earlier_refresh_does_not_overwrite_newer_view() {
        let agg = aggregator(ScriptedSource::new(vec![
            Step::Versions(
                vec![version("E-100", vec![receipt("Old", 1, "2024-01-01", "a@x.com")])],
                Duration::from_millis(200),
            ),
            Step::Versions(
                vec![version("E-100", vec![receipt("New", 2, "2024-01-02", "a@x.com")])],
                Duration::from_millis(10),
            ),
        ]));
        let key = ParentKey::new("E-100");

        let first = agg.spawn_refresh(key.clone(), Vec::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = agg.refresh(key, Vec::new()).await;
        assert!(matches!(second, RefreshOutcome::Published { count: 1, .. }));

        match first.await {
            Ok(outcome) => assert_eq!(outcome, RefreshOutcome::Superseded),
            Err(err) => panic!("refresh task failed: {err}"),
        }
        assert_eq!(vendors(&agg.state()), vec!["New".to_string()]);
        assert_eq!(agg.state().phase, Phase::Ready);
    }

    // Test IDs: TAGR-004
    #[tokio::test]
    async fn blank_key_aggregates_draft_without_fetching() {
        let source = ScriptedSource::new(Vec::new());
        let calls = Arc::clone(&source.calls);
        let agg = aggregator(source);

        let draft = vec![Some(receipt("Draft", 3, "2024-04-01", "a@x.com")), None];
        let outcome = agg.refresh(ParentKey::new("   "), draft).await;

        assert!(matches!(outcome, RefreshOutcome::Published { count: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(vendors(&agg.state()), vec!["Draft".to_string()]);
    }

    // Test IDs: TAGR-005
    #[tokio::test]
    async fn subscribers_observe_published_state_and_scope_is_applied() {
        let agg: Aggregator<Receipt, ScriptedSource> = Aggregator::new(
            ScriptedSource::new(vec![Step::Versions(
                vec![version(
                    "E-100",
                    vec![
                        receipt("Mine", 1, "2024-01-01", "A@X.com"),
                        receipt("Theirs", 2, "2024-01-02", "b@x.com"),
                    ],
                )],
                Duration::ZERO,
            )]),
            ScopePolicy::self_only(Some("a@x.com"), None),
        );
        assert_eq!(agg.policy().scope, Scope::SelfOnly);
        let mut rx = agg.subscribe();

        let _task = agg.spawn_refresh(ParentKey::new("E-100"), Vec::new());
        let state = loop {
            if rx.changed().await.is_err() {
                panic!("aggregator dropped its sender");
            }
            let state = rx.borrow_and_update().clone();
            if state.phase == Phase::Ready {
                break state;
            }
        };

        assert_eq!(vendors(&state), vec!["Mine".to_string()]);
    }

    // Test IDs: TAGR-006
    #[tokio::test]
    async fn identical_content_yields_identical_digest() {
        let agg = aggregator(ScriptedSource::new(vec![
            Step::Versions(e100_versions(), Duration::ZERO),
            Step::Versions(e100_versions(), Duration::ZERO),
        ]));
        let key = ParentKey::new("E-100");

        let first = agg.refresh(key.clone(), Vec::new()).await;
        let second = agg.refresh(key, Vec::new()).await;
        match (first, second) {
            (
                RefreshOutcome::Published { digest: a, .. },
                RefreshOutcome::Published { digest: b, .. },
            ) => assert_eq!(a, b),
            other => panic!("expected two published views, got {other:?}"),
        }
    }

    // Test IDs: TAGR-007
    #[tokio::test]
    async fn poll_refreshes_until_handle_is_dropped() {
        let source = ScriptedSource {
            fallback: e100_versions(),
            ..ScriptedSource::default()
        };
        let calls = Arc::clone(&source.calls);
        let agg = aggregator(source);

        let handle = match agg.poll(Duration::from_millis(15), ParentKey::new("E-100"), Vec::new())
        {
            Ok(handle) => handle,
            Err(err) => panic!("poller should start: {err}"),
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(agg.state().phase, Phase::Ready);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);
    }

    #[derive(Debug, Clone)]
    struct Unserializable(&'static str);

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("record body is not representable"))
        }
    }

    impl VersionedRecord for Unserializable {
        const KIND: RecordKind = RecordKind::Receipt;

        fn record_id(&self) -> Option<String> {
            Some(self.0.to_string())
        }

        fn identity_fields(&self) -> Vec<String> {
            Vec::new()
        }

        fn owner(&self) -> Option<&str> {
            None
        }

        fn tags(&self) -> &[String] {
            &[]
        }

        fn occurred_at(&self) -> Option<&str> {
            None
        }

        fn collection(_version: &EstimateVersion) -> &[Option<Self>] {
            &[]
        }

        fn validate_for_submit(&self) -> Result<(), estimate_ledger_core::LedgerError> {
            Ok(())
        }
    }

    // Test IDs: TAGR-008
    #[test]
    fn digest_survives_records_that_fail_to_serialize() {
        let first = compute_view_digest(&[Unserializable("r-1")]);
        let again = compute_view_digest(&[Unserializable("r-1")]);
        let other = compute_view_digest(&[Unserializable("r-2")]);

        assert!(first.starts_with("sha256:"));
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_ne!(first, compute_view_digest::<Unserializable>(&[]));
    }
}
