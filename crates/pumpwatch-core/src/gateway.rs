use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::classify::{classify, BolusTracker};
use crate::config::{AlertThresholds, CycleTiming};
use crate::driver::{DriverError, TelemetrySource};
use crate::snapshot::Snapshot;
use crate::uplink::UploadSink;

/// Guard margin added to the computed wake-up delay so clock skew never
/// produces a wake-up just before the next reading exists.
const SCHEDULE_MARGIN_SECS: i64 = 10;

/// Clears the cycle-in-progress flag on every exit path, panics included.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Delay until the next cycle, derived from the reading's own timestamp:
/// the sensor reports every `update_interval`, so the next reading is due
/// at `sensor_ts + update_interval`. A negative delay (stale reading,
/// clock skew) falls back to the retry interval.
pub fn next_wake_delay(
    sensor_ts: DateTime<Utc>,
    now: DateTime<Utc>,
    timing: &CycleTiming,
) -> Duration {
    let interval = chrono::Duration::from_std(timing.update_interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let delay = (sensor_ts + interval) - now + chrono::Duration::seconds(SCHEDULE_MARGIN_SECS);
    delay.to_std().unwrap_or(timing.retry_interval)
}

/// Owns the fetch-correct-classify-upload cycle and all process-wide
/// mutable state: the reentrancy guard, the cycle counter and the
/// last-bolus tracker.
pub struct Gateway<S: TelemetrySource> {
    source: Mutex<S>,
    sinks: Mutex<Vec<Box<dyn UploadSink>>>,
    thresholds: AlertThresholds,
    timing: CycleTiming,
    cycle_active: AtomicBool,
    cycle_count: AtomicU64,
    bolus: Mutex<BolusTracker>,
}

impl<S: TelemetrySource> Gateway<S> {
    pub fn new(
        source: S,
        sinks: Vec<Box<dyn UploadSink>>,
        thresholds: AlertThresholds,
        timing: CycleTiming,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            sinks: Mutex::new(sinks),
            thresholds,
            timing,
            cycle_active: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            bolus: Mutex::new(BolusTracker::default()),
        }
    }

    pub fn timing(&self) -> &CycleTiming {
        &self.timing
    }

    /// Runs one fetch-correct-classify-upload pass and returns the delay
    /// until the next cycle should run.
    ///
    /// Returns `None` without side effects when a cycle is already in
    /// progress; the in-flight cycle's reschedule stands.
    pub async fn run_cycle(&self) -> Option<Duration> {
        let _guard = CycleGuard::acquire(&self.cycle_active)?;
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst);

        let delay = match self.fetch_with_retries(cycle).await {
            Some(raw) => {
                let corrected = raw.correct_drift();
                let now = Utc::now();
                debug!(
                    pump_time = %corrected.pump_time,
                    sensor_ts = %corrected.sensor_bgl_timestamp,
                    "drift corrected"
                );

                let derived = {
                    let mut tracker = self.bolus.lock().await;
                    classify(
                        &corrected,
                        &self.thresholds,
                        cycle,
                        &mut tracker,
                        now,
                        self.timing.update_interval,
                    )
                };

                let mut sinks = self.sinks.lock().await;
                for sink in sinks.iter_mut() {
                    if let Err(err) = sink.push(&corrected, &derived).await {
                        error!(sink = sink.name(), error = %err, "upload failed");
                    }
                }

                let delay = next_wake_delay(corrected.sensor_bgl_timestamp, now, &self.timing);
                info!(
                    cycle,
                    severity = ?derived.severity,
                    next_in_secs = delay.as_secs(),
                    "cycle complete"
                );
                delay
            }
            None => {
                error!(cycle, "unable to get data from pump");
                let mut sinks = self.sinks.lock().await;
                for sink in sinks.iter_mut() {
                    if let Err(err) = sink.push_outage().await {
                        error!(sink = sink.name(), error = %err, "outage report failed");
                    }
                }
                self.timing.retry_interval
            }
        };

        Some(delay)
    }

    async fn fetch_with_retries(&self, cycle: u64) -> Option<Snapshot> {
        let mut source = self.source.lock().await;
        for attempt in 1..=self.timing.max_retries {
            // An overrun fetch is just another retryable driver failure.
            let result = timeout(self.timing.fetch_timeout, source.fetch_snapshot())
                .await
                .unwrap_or(Err(DriverError::Timeout));
            match result {
                Ok(snapshot) => {
                    debug!(cycle, attempt, "snapshot fetched");
                    return Some(snapshot);
                }
                Err(err) => {
                    warn!(cycle, attempt, error = %err, "snapshot fetch failed");
                }
            }
            if attempt < self.timing.max_retries {
                sleep(self.timing.retry_delay).await;
            }
        }
        None
    }

    /// Best-effort sink teardown before process exit.
    pub async fn shutdown(&self) {
        let mut sinks = self.sinks.lock().await;
        for sink in sinks.iter_mut() {
            sink.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DerivedStatus;
    use crate::driver::DriverError;
    use crate::snapshot::{tests::sample_snapshot, CorrectedSnapshot};
    use crate::uplink::UplinkError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Notify;

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            low: 70,
            pre_low: 80,
            pre_high: 180,
            high: 250,
        }
    }

    struct ScriptedSource {
        script: VecDeque<Result<Snapshot, DriverError>>,
        calls: Arc<StdMutex<u32>>,
    }

    #[async_trait]
    impl TelemetrySource for ScriptedSource {
        async fn fetch_snapshot(&mut self) -> Result<Snapshot, DriverError> {
            *self.calls.lock().expect("calls lock") += 1;
            self.script.pop_front().unwrap_or(Err(DriverError::Timeout))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Pushed { battery_label: &'static str },
        Outage,
    }

    struct RecordingSink {
        events: Arc<StdMutex<Vec<SinkEvent>>>,
        fail: bool,
    }

    #[async_trait]
    impl UploadSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn push(
            &mut self,
            _snapshot: &CorrectedSnapshot,
            derived: &DerivedStatus,
        ) -> Result<(), UplinkError> {
            self.events.lock().expect("events lock").push(SinkEvent::Pushed {
                battery_label: derived.battery.label,
            });
            if self.fail {
                return Err(UplinkError::ConnectionLost("scripted".to_string()));
            }
            Ok(())
        }

        async fn push_outage(&mut self) -> Result<(), UplinkError> {
            self.events.lock().expect("events lock").push(SinkEvent::Outage);
            Ok(())
        }
    }

    fn gateway(
        script: Vec<Result<Snapshot, DriverError>>,
        sink_specs: &[bool],
    ) -> (
        Gateway<ScriptedSource>,
        Arc<StdMutex<u32>>,
        Arc<StdMutex<Vec<SinkEvent>>>,
    ) {
        let calls = Arc::new(StdMutex::new(0));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sinks = sink_specs
            .iter()
            .map(|fail| {
                Box::new(RecordingSink {
                    events: events.clone(),
                    fail: *fail,
                }) as Box<dyn UploadSink>
            })
            .collect();
        let source = ScriptedSource {
            script: script.into(),
            calls: calls.clone(),
        };
        (
            Gateway::new(source, sinks, thresholds(), CycleTiming::default()),
            calls,
            events,
        )
    }

    fn fresh_snapshot() -> Snapshot {
        let mut snap = sample_snapshot();
        // Keep the reading recent so the computed delay is the nominal one.
        snap.sensor_bgl_timestamp = Utc::now();
        snap.last_bolus_time = Utc::now();
        snap.pump_time = Utc::now();
        snap
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_outage_and_retry_interval() {
        let (gateway, calls, events) = gateway(
            vec![
                Err(DriverError::Timeout),
                Err(DriverError::Timeout),
                Err(DriverError::Timeout),
            ],
            &[false],
        );

        let delay = gateway.run_cycle().await.expect("not reentrant");

        assert_eq!(delay, Duration::from_secs(180));
        assert_eq!(*calls.lock().expect("calls"), 3);
        assert_eq!(*events.lock().expect("events"), vec![SinkEvent::Outage]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_the_cycle() {
        let (gateway, calls, events) = gateway(
            vec![Err(DriverError::Timeout), Ok(fresh_snapshot())],
            &[false],
        );

        let delay = gateway.run_cycle().await.expect("not reentrant");

        // Fresh reading: nominal 300 s cadence plus the 10 s margin.
        assert!(delay > Duration::from_secs(300), "delay was {delay:?}");
        assert_eq!(*calls.lock().expect("calls"), 2);
        assert_eq!(
            *events.lock().expect("events"),
            vec![SinkEvent::Pushed {
                battery_label: "PUMP BATTERY %"
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_does_not_block_the_other_sink() {
        let (gateway, _calls, events) = gateway(vec![Ok(fresh_snapshot())], &[true, false]);

        gateway.run_cycle().await.expect("not reentrant");

        // Both sinks were attempted despite the first one failing.
        assert_eq!(events.lock().expect("events").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_slot_alternates_across_cycles() {
        let (gateway, _calls, events) = gateway(
            vec![Ok(fresh_snapshot()), Ok(fresh_snapshot())],
            &[false],
        );

        gateway.run_cycle().await.expect("first");
        gateway.run_cycle().await.expect("second");

        let events = events.lock().expect("events");
        assert_eq!(
            *events,
            vec![
                SinkEvent::Pushed {
                    battery_label: "PUMP BATTERY %"
                },
                SinkEvent::Pushed {
                    battery_label: "SENSOR BATTERY %"
                },
            ]
        );
    }

    struct BlockingSource {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl TelemetrySource for BlockingSource {
        async fn fetch_snapshot(&mut self) -> Result<Snapshot, DriverError> {
            self.release.notified().await;
            Ok(sample_snapshot())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_driver_counts_as_a_failed_attempt() {
        // A source that never completes: every attempt must end in the
        // fetch timeout and the cycle must still reach its outage report.
        let events = Arc::new(StdMutex::new(Vec::new()));
        let gateway = Gateway::new(
            BlockingSource {
                release: Arc::new(Notify::new()),
            },
            vec![Box::new(RecordingSink {
                events: events.clone(),
                fail: false,
            }) as Box<dyn UploadSink>],
            thresholds(),
            CycleTiming::default(),
        );

        let delay = gateway.run_cycle().await.expect("not reentrant");

        assert_eq!(delay, Duration::from_secs(180));
        assert_eq!(*events.lock().expect("events"), vec![SinkEvent::Outage]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cycle_is_a_no_op() {
        let release = Arc::new(Notify::new());
        let gateway = Arc::new(Gateway::new(
            BlockingSource {
                release: release.clone(),
            },
            Vec::new(),
            thresholds(),
            CycleTiming::default(),
        ));

        let first = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.run_cycle().await }
        });
        // Let the first cycle take the guard and park inside the fetch.
        tokio::task::yield_now().await;

        assert!(gateway.run_cycle().await.is_none());

        release.notify_one();
        let delay = first.await.expect("join").expect("first cycle ran");
        assert!(delay >= Duration::from_secs(1));
    }

    #[test]
    fn next_wake_delay_adds_margin() {
        let timing = CycleTiming::default();
        let sensor_ts = Utc::now();
        let delay = next_wake_delay(sensor_ts, sensor_ts, &timing);
        assert_eq!(delay, Duration::from_secs(310));
    }

    #[test]
    fn next_wake_delay_falls_back_when_reading_is_stale() {
        let timing = CycleTiming::default();
        let now = Utc::now();
        let sensor_ts = now - chrono::Duration::seconds(400);
        assert_eq!(next_wake_delay(sensor_ts, now, &timing), Duration::from_secs(180));
    }
}
