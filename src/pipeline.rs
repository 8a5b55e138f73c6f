use crate::gateway::{BranchCountUpdater, UpdateOutcome};
use crate::record::MerchantUpdateRecord;
use crate::source::RecordSource;
use crate::types::{GatewayError, PipelineError, SourceError};
use log::{debug, error};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Smallest capacity tokio allows: one record waits while the previous one is applied.
const HANDOFF_CAPACITY: usize = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PipelineState {
    Idle,
    /// Producer and consumer are both started.
    Running,
    /// Input is finished and the channel closed; queued records are still being applied.
    Draining,
    Done,
}

/// Per-outcome tally of the records the consumer received.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct PipelineReport {
    pub received: u64,
    pub updated: u64,
    pub already_set: u64,
    pub not_found: u64,
    pub superseded: u64,
    pub failed: u64,
}

impl PipelineReport {
    fn record(&mut self, outcome: &Result<UpdateOutcome, GatewayError>) {
        self.received += 1;
        match outcome {
            Ok(UpdateOutcome::Updated) => self.updated += 1,
            Ok(UpdateOutcome::AlreadySet(_)) => self.already_set += 1,
            Ok(UpdateOutcome::NotFound) => self.not_found += 1,
            Ok(UpdateOutcome::Superseded) => self.superseded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed {} records: {} updated, {} already set, {} not found, {} superseded, {} failed",
            self.received,
            self.updated,
            self.already_set,
            self.not_found,
            self.superseded,
            self.failed
        )
    }
}

/// Streams records from a single producer to a single consumer that applies them in order.
pub struct Pipeline {
    updater: Arc<BranchCountUpdater>,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(updater: BranchCountUpdater) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            updater: Arc::new(updater),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn transition(&self, next: PipelineState) {
        debug!(target: "pipeline", "{:?} -> {next:?}", *self.state.borrow());
        self.state.send_replace(next);
    }

    /// Runs the source to exhaustion, applying every record it yields.
    ///
    /// An input error stops reading but records already handed over are still
    /// applied; the error is returned together with the report of what was done.
    pub async fn run<R>(&self, source: RecordSource<R>) -> Result<PipelineReport, PipelineError>
    where
        R: Read + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(HANDOFF_CAPACITY);

        let consumer = tokio::spawn(consume(self.updater.clone(), receiver));
        let producer = tokio::task::spawn_blocking(move || produce(source, sender));
        self.transition(PipelineState::Running);

        // The producer owns the only sender, so its exit closes the channel.
        let produced = producer.await;
        self.transition(PipelineState::Draining);

        let report = consumer.await;
        self.transition(PipelineState::Done);

        let report = report?;
        debug!(target: "pipeline", "Done: {report:?}");
        match produced? {
            Ok(()) => Ok(report),
            Err(source) => Err(PipelineError::Input { source, report }),
        }
    }
}

fn produce<R: Read>(
    source: RecordSource<R>,
    sender: mpsc::Sender<MerchantUpdateRecord>,
) -> Result<(), SourceError> {
    for record in source {
        let record = record?;
        if sender.blocking_send(record).is_err() {
            error!(target: "pipeline", "Consumer stopped, dropping remaining input");
            break;
        }
    }
    Ok(())
}

async fn consume(
    updater: Arc<BranchCountUpdater>,
    mut receiver: mpsc::Receiver<MerchantUpdateRecord>,
) -> PipelineReport {
    let mut report = PipelineReport::default();
    while let Some(record) = receiver.recv().await {
        debug!(target: "pipeline", "Handle merchant with retailer id {}", record.retailer_id);
        let outcome = updater
            .apply_branch_count(record.retailer_id, record.branch_count)
            .await;
        if let Err(err) = &outcome {
            error!(target: "pipeline", "{err}");
        }
        report.record(&outcome);
    }
    report
}

#[cfg(test)]
mod test {
    use crate::db::{InMemoryStore, MerchantRow, MerchantStore};
    use crate::gateway::test::{RecordingStore, StoreCall};
    use crate::gateway::BranchCountUpdater;
    use crate::pipeline::{Pipeline, PipelineReport, PipelineState};
    use crate::source::RecordSource;
    use crate::types::{BranchCount, PipelineError, RetailerID, SourceError, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Every lookup waits for a permit, so the consumer only advances when allowed.
    struct GatedStore {
        inner: InMemoryStore,
        gate: Semaphore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl MerchantStore for GatedStore {
        async fn find_merchant(&self, id: RetailerID) -> Result<Option<MerchantRow>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| StoreError::PoisonLock)?;
            permit.forget();
            self.inner.find_merchant(id).await
        }

        async fn set_branch_count(
            &self,
            id: RetailerID,
            branch_count: BranchCount,
        ) -> Result<bool, StoreError> {
            self.inner.set_branch_count(id, branch_count).await
        }
    }

    /// Counts the bytes the producer has pulled from the input.
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        read: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.read.fetch_add(n, Ordering::SeqCst);
            Ok(n)
        }
    }

    fn pipeline_over(store: Arc<RecordingStore>) -> Pipeline {
        Pipeline::new(BranchCountUpdater::new(store))
    }

    async fn run(
        pipeline: &Pipeline,
        input: &'static str,
    ) -> Result<PipelineReport, PipelineError> {
        pipeline.run(RecordSource::from_reader(input.as_bytes())).await
    }

    #[tokio::test]
    async fn test_updates_only_unset_rows() {
        let _ = env_logger::try_init();
        let store = Arc::new(RecordingStore::new(InMemoryStore::from_rows([
            (42, None),
            (43, Some(3)),
        ])));
        let pipeline = pipeline_over(store.clone());

        let report = run(&pipeline, "42,7\n43,9\n").await.unwrap();

        assert_eq!(
            store.inner.snapshot().unwrap(),
            HashMap::from([(42, Some(7)), (43, Some(3))])
        );
        assert_eq!(
            report,
            PipelineReport {
                received: 2,
                updated: 1,
                already_set: 1,
                ..PipelineReport::default()
            }
        );
        assert!(!store.calls().contains(&StoreCall::Set(43, 9)));
    }

    #[tokio::test]
    async fn test_missing_retailer() {
        let _ = env_logger::try_init();
        let store = Arc::new(RecordingStore::new(InMemoryStore::from_rows([(1, None)])));
        let pipeline = pipeline_over(store.clone());

        let report = run(&pipeline, "99,5\n").await.unwrap();

        assert_eq!(report.not_found, 1);
        assert_eq!(store.calls(), vec![StoreCall::Find(99)]);
        assert_eq!(store.inner.snapshot().unwrap(), HashMap::from([(1, None)]));
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = Arc::new(RecordingStore::new(InMemoryStore::from_rows([
            (1, None),
            (2, None),
            (3, Some(30)),
        ])));
        let pipeline = pipeline_over(store.clone());
        let input = "1,10\n2,20\n3,31\n4,40\n";

        run(&pipeline, input).await.unwrap();
        let after_first = store.inner.snapshot().unwrap();
        let second = run(&pipeline, input).await.unwrap();

        assert_eq!(store.inner.snapshot().unwrap(), after_first);
        assert_eq!(store.inner.writes(), 2);
        assert_eq!(second.updated, 0);
        assert_eq!(second.already_set, 3);
        assert_eq!(second.not_found, 1);
    }

    #[tokio::test]
    async fn test_applies_in_file_order() {
        let store = Arc::new(RecordingStore::new(InMemoryStore::from_rows([
            (5, None),
            (3, Some(1)),
            (9, None),
        ])));
        let pipeline = pipeline_over(store.clone());

        run(&pipeline, "5,50\n3,30\n7,70\n9,90\n").await.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Find(5),
                StoreCall::Set(5, 50),
                StoreCall::Find(3),
                StoreCall::Find(7),
                StoreCall::Find(9),
                StoreCall::Set(9, 90),
            ]
        );
    }

    #[tokio::test]
    async fn test_store_error_does_not_stop_batch() {
        let _ = env_logger::try_init();
        let mut store = RecordingStore::new(InMemoryStore::from_rows([
            (1, None),
            (2, None),
            (3, None),
        ]));
        store.broken.push(2);
        let store = Arc::new(store);
        let pipeline = pipeline_over(store.clone());

        let report = run(&pipeline, "1,1\n2,2\n3,3\n").await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 2);
        assert_eq!(
            store.inner.snapshot().unwrap(),
            HashMap::from([(1, Some(1)), (2, None), (3, Some(3))])
        );
    }

    #[tokio::test]
    async fn test_bad_line_stops_input_but_drains() {
        let _ = env_logger::try_init();
        let store = Arc::new(RecordingStore::new(InMemoryStore::from_rows([
            (1, None),
            (2, None),
            (3, None),
        ])));
        let pipeline = pipeline_over(store.clone());

        let result = run(&pipeline, "1,1\n2,2\nthree,3\n3,3\n").await;

        match result {
            Err(PipelineError::Input {
                source: SourceError::Csv(_),
                report,
            }) => {
                assert_eq!(report.received, 2);
                assert_eq!(report.updated, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            store.inner.snapshot().unwrap(),
            HashMap::from([(1, Some(1)), (2, Some(2)), (3, None)])
        );
        assert!(!store.calls().contains(&StoreCall::Find(3)));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let store = Arc::new(RecordingStore::new(InMemoryStore::new()));
        let pipeline = pipeline_over(store);
        let state = pipeline.subscribe();
        assert_eq!(*state.borrow(), PipelineState::Idle);

        let report = run(&pipeline, "").await.unwrap();

        assert_eq!(report, PipelineReport::default());
        assert_eq!(*state.borrow(), PipelineState::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_waits_for_consumer() {
        let _ = env_logger::try_init();
        const RECORDS: usize = 20_000;
        let input: String = (1..=RECORDS).map(|id| format!("{id},1\n")).collect();
        let total_bytes = input.len();
        let read = Arc::new(AtomicUsize::new(0));
        let source = RecordSource::from_reader(CountingReader {
            inner: Cursor::new(input.into_bytes()),
            read: read.clone(),
        });

        let store = Arc::new(GatedStore {
            inner: InMemoryStore::new(),
            gate: Semaphore::new(0),
            lookups: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(Pipeline::new(BranchCountUpdater::new(store.clone())));

        let mut observer = pipeline.subscribe();
        let seen = tokio::spawn(async move {
            let mut seen = Vec::new();
            while observer.changed().await.is_ok() {
                let state = *observer.borrow_and_update();
                seen.push(state);
                if state == PipelineState::Done {
                    break;
                }
            }
            seen
        });

        let mut state = pipeline.subscribe();
        let running = pipeline.clone();
        let run = tokio::spawn(async move { running.run(source).await });

        // First record is held in the store; one more can wait in the channel.
        while store.lookups.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*state.borrow(), PipelineState::Running);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert!(read.load(Ordering::SeqCst) < total_bytes / 2);

        // Let all but the last two records through: the producer can then finish.
        store.gate.add_permits(RECORDS - 2);
        state
            .wait_for(|s| *s == PipelineState::Draining)
            .await
            .unwrap();
        assert_eq!(read.load(Ordering::SeqCst), total_bytes);
        while store.lookups.load(Ordering::SeqCst) < RECORDS - 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.lookups.load(Ordering::SeqCst), RECORDS - 1);
        assert_eq!(*state.borrow(), PipelineState::Draining);

        store.gate.add_permits(2);
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.received, RECORDS as u64);
        assert_eq!(report.not_found, RECORDS as u64);
        assert_eq!(
            seen.await.unwrap(),
            vec![
                PipelineState::Running,
                PipelineState::Draining,
                PipelineState::Done
            ]
        );
    }

    #[test]
    fn test_report_summary() {
        let report = PipelineReport {
            received: 5,
            updated: 2,
            already_set: 1,
            not_found: 1,
            superseded: 0,
            failed: 1,
        };
        assert_eq!(
            report.to_string(),
            "Processed 5 records: 2 updated, 1 already set, 1 not found, 0 superseded, 1 failed"
        );
    }
}
