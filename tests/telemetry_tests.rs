// Pagekeeper - Telemetry pipeline integration tests
//
// Covers the flush policy end to end on virtual time:
// 1. Debounce and size threshold
// 2. Failure handling (re-queue, backoff, timeout)
// 3. Session gating and lifecycle

use async_trait::async_trait;
use chrono::Utc;
use pagekeeper::{
    BackoffPolicy, EnqueueAction, FlushOutcome, MemorySink, MetricContext, MetricObservation,
    MetricRecord, SinkError, StaticSession, TelemetryConfig, TelemetryPipeline, TelemetrySink,
};
use pagekeeper::recovery::MAX_BACKOFF_DELAY;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn record(id: impl Into<String>) -> MetricRecord {
    MetricRecord::from_observation(
        MetricObservation::new("LCP", 2100.0, id),
        MetricContext::new("/", "test"),
        Utc::now(),
    )
    .unwrap()
}

fn ids(records: &[MetricRecord]) -> Vec<String> {
    records.iter().map(|r| r.id().to_string()).collect()
}

fn started(config: TelemetryConfig, sink: Arc<dyn TelemetrySink>) -> TelemetryPipeline {
    let pipeline =
        TelemetryPipeline::new(config, sink, Arc::new(StaticSession::authenticated()));
    pipeline.init();
    pipeline
}

/// Sink that takes a fixed time to acknowledge
struct SlowSink {
    delay: Duration,
    inner: MemorySink,
    calls: AtomicUsize,
}

impl SlowSink {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: MemorySink::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TelemetrySink for SlowSink {
    async fn write(&self, batch: &[MetricRecord]) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.write(batch).await
    }
}

// ============================================================================
// Debounce / threshold
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_three_records_single_flush_at_seven_seconds() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = started(TelemetryConfig::default(), sink.clone());

    pipeline.enqueue(record("r0"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    pipeline.enqueue(record("r1"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    pipeline.enqueue(record("r2"));

    // t = 6.9s: last enqueue was at 2s, debounce is 5s
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(sink.attempts(), 0);

    // t = 7.1s
    tokio::time::sleep(Duration::from_millis(200)).await;
    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(ids(&batches[0]), vec!["r0", "r1", "r2"]);
    assert_eq!(pipeline.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_below_threshold_is_one_write() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = started(TelemetryConfig::default(), sink.clone());

    for i in 0..7 {
        assert_eq!(pipeline.enqueue(record(format!("m{i}"))), EnqueueAction::Scheduled);
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.attempts(), 1);
    assert_eq!(sink.records().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_size_threshold_flushes_immediately() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = started(TelemetryConfig::default(), sink.clone());

    for i in 0..9 {
        pipeline.enqueue(record(format!("m{i}")));
    }
    assert_eq!(pipeline.enqueue(record("m9")), EnqueueAction::Flushing);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 10);
    assert_eq!(pipeline.pending(), 0);

    // The cancelled debounce timer must not produce a second write
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sink.attempts(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_batch_retried_in_order() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(SinkError::Rejected {
        status: 503,
        reason: "maintenance".into(),
    });
    let config = TelemetryConfig {
        backoff: BackoffPolicy::Immediate,
        ..Default::default()
    };
    let pipeline = started(config, sink.clone());

    pipeline.enqueue(record("a"));
    pipeline.enqueue(record("b"));
    assert_eq!(pipeline.flush().await, FlushOutcome::Failed { count: 2 });

    pipeline.enqueue(record("c"));
    assert_eq!(ids(&pipeline.pending_records()), vec!["a", "b", "c"]);

    assert_eq!(pipeline.flush().await, FlushOutcome::Sent { count: 3 });
    assert_eq!(ids(&sink.records()), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_record_lost_under_random_failures() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let sink = Arc::new(MemorySink::new());
    let config = TelemetryConfig {
        backoff: BackoffPolicy::Immediate,
        ..Default::default()
    };
    let pipeline = started(config, sink.clone());

    let mut expected = Vec::new();
    for round in 0..200 {
        for j in 0..rng.gen_range(1..4) {
            let id = format!("{round}-{j}");
            expected.push(id.clone());
            pipeline.enqueue(record(id));
        }
        if rng.gen_bool(0.4) {
            sink.fail_next(SinkError::Network("flaky".into()));
        }
        if rng.gen_bool(0.5) {
            pipeline.flush().await;
        }
    }

    // Let timers and spawned flushes drain, then flush whatever is left
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        pipeline.flush().await;
        if pipeline.pending() == 0 && !pipeline.is_flushing() {
            break;
        }
    }

    assert_eq!(pipeline.pending(), 0);
    assert_eq!(ids(&sink.records()), expected);
    assert_eq!(pipeline.stats().sent as usize, expected.len());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_attempts() {
    let sink = Arc::new(MemorySink::new());
    for _ in 0..3 {
        sink.fail_next(SinkError::Network("down".into()));
    }
    let config = TelemetryConfig {
        backoff: BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60)),
        ..Default::default()
    };
    let pipeline = started(config, sink.clone());
    pipeline.enqueue(record("a"));
    assert_eq!(pipeline.flush().await, FlushOutcome::Failed { count: 1 });

    // Retries at +1s, then +2s, then +4s after that
    tokio::time::sleep(Duration::from_millis(1_050)).await;
    assert_eq!(sink.attempts(), 2);
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(sink.attempts(), 3);
    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(sink.attempts(), 4);

    assert_eq!(pipeline.pending(), 0);
    assert_eq!(pipeline.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_write_times_out() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(3600)));
    let config = TelemetryConfig {
        write_timeout_ms: 500,
        ..Default::default()
    };
    let pipeline = started(config, sink.clone());
    pipeline.enqueue(record("a"));

    assert_eq!(pipeline.flush().await, FlushOutcome::Failed { count: 1 });
    assert_eq!(pipeline.pending(), 1);
    assert!(!pipeline.is_flushing());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_flush_is_not_started_twice() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(1)));
    let pipeline = started(TelemetryConfig::default(), sink.clone());
    pipeline.enqueue(record("a"));
    pipeline.enqueue(record("b"));

    let background = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.flush().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.is_flushing());

    // Arrives while the first batch is on the wire
    pipeline.enqueue(record("c"));
    assert_eq!(pipeline.flush().await, FlushOutcome::InFlight);

    assert_eq!(background.await.unwrap(), FlushOutcome::Sent { count: 2 });
    assert_eq!(ids(&pipeline.pending_records()), vec!["c"]);

    // "c" goes out with its own debounce
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(ids(&sink.inner.records()), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_flush_waits_for_running_write() {
    let sink = Arc::new(SlowSink::new(Duration::from_secs(1)));
    let pipeline = started(TelemetryConfig::default(), sink.clone());
    pipeline.enqueue(record("first"));

    // A full batch arrives while the first write is on the wire
    let feeder = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            for i in 0..10 {
                pipeline.enqueue(record(format!("late{i}")));
            }
        })
    };

    assert_eq!(pipeline.flush().await, FlushOutcome::Sent { count: 1 });
    // Takes the flag before the follow-up task gets to run
    assert_eq!(pipeline.flush().await, FlushOutcome::Sent { count: 10 });
    feeder.await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pipeline.is_flushing());
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.inner.records().len(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_backoff_is_clamped() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(SinkError::Network("down".into()));
    let config = TelemetryConfig {
        backoff: BackoffPolicy::Fixed { delay_ms: u64::MAX },
        ..Default::default()
    };
    let pipeline = started(config, sink.clone());
    pipeline.enqueue(record("a"));

    assert_eq!(pipeline.flush().await, FlushOutcome::Failed { count: 1 });
    match pipeline.flush().await {
        FlushOutcome::BackingOff { retry_in } => assert!(retry_in <= MAX_BACKOFF_DELAY),
        other => panic!("expected backoff, got {other:?}"),
    }

    tokio::time::sleep(MAX_BACKOFF_DELAY + Duration::from_secs(1)).await;
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(sink.attempts(), 2);
}

// ============================================================================
// Session gating and lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_anonymous_metrics_do_not_accumulate() {
    let sink = Arc::new(MemorySink::new());
    let session = Arc::new(StaticSession::anonymous());
    let pipeline = TelemetryPipeline::new(TelemetryConfig::default(), sink.clone(), session.clone());
    pipeline.init();

    for i in 0..25 {
        pipeline.enqueue(record(format!("anon{i}")));
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(sink.attempts(), 0);
    assert_eq!(pipeline.stats().discarded, 25);

    session.set_active(true);
    pipeline.enqueue(record("signed-in"));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(ids(&sink.records()), vec!["signed-in"]);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_evicts_oldest() {
    let sink = Arc::new(MemorySink::new());
    let config = TelemetryConfig {
        batch_size: 2,
        max_queued: 3,
        ..Default::default()
    };
    let pipeline = TelemetryPipeline::new(config, sink, Arc::new(StaticSession::authenticated()));

    for id in ["a", "b", "c", "d", "e"] {
        assert_eq!(pipeline.enqueue(record(id)), EnqueueAction::Buffered);
    }

    assert_eq!(ids(&pipeline.pending_records()), vec!["c", "d", "e"]);
    assert_eq!(pipeline.stats().evicted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_ignores_backoff() {
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(SinkError::Network("down".into()));
    let pipeline = started(TelemetryConfig::default(), sink.clone());
    pipeline.enqueue(record("a"));
    pipeline.flush().await;

    assert_eq!(pipeline.dispose().await, FlushOutcome::Sent { count: 1 });
    assert_eq!(pipeline.dispose().await, FlushOutcome::Empty);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sink.attempts(), 2);
}
