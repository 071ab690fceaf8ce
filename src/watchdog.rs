/// Control-plane pollers that run alongside the supervised child.
///
/// The heartbeat writer, the abort poller and the optional resource sampler
/// each tick on a fixed interval until the run's stop signal fires. The abort
/// poller never kills anything itself: it reports the request once and the
/// supervisor, which owns the race, issues the kill.
use crate::config::TimingConfig;
use crate::log_writer::LogWriter;
use crate::resource_usage::ResourceSampler;
use crate::status::StatusChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle over the running pollers.
pub struct Watchdog {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the pollers for the child `pid`.
    ///
    /// Returns the handle and a receiver that resolves once if an abort is
    /// requested through the sentinel file.
    pub fn start(
        status: StatusChannel,
        log: Arc<LogWriter>,
        timing: &TimingConfig,
        pid: u32,
        sampler: Option<ResourceSampler>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (stop, stop_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = oneshot::channel();

        let mut tasks = vec![
            tokio::spawn(heartbeat_loop(
                status.clone(),
                Arc::clone(&log),
                timing.heartbeat_interval(),
                stop_rx.clone(),
            )),
            tokio::spawn(abort_loop(
                status.clone(),
                Arc::clone(&log),
                timing.abort_poll_interval(),
                stop_rx.clone(),
                abort_tx,
            )),
        ];
        if let Some(sampler) = sampler {
            tasks.push(tokio::spawn(resource_loop(
                status,
                log,
                sampler,
                pid,
                timing.resource_sample_interval(),
                stop_rx,
            )));
        }

        (Self { stop, tasks }, abort_rx)
    }

    /// Signal every poller to stop and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "watchdog task ended abnormally");
            }
        }
    }
}

/// Overwrite the alive file every `interval`, starting immediately.
pub async fn heartbeat_loop(
    status: StatusChannel,
    log: Arc<LogWriter>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = status.write_alive() {
                    log.warning(&format!("Unable to write alive file, error: {e}"));
                }
            }
        }
    }
    tracing::debug!("heartbeat stopped");
}

/// Check for the abort sentinel every `interval`; report the first hit and stop.
pub async fn abort_loop(
    status: StatusChannel,
    log: Arc<LogWriter>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    abort: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => match status.abort_requested() {
                Ok(true) => {
                    log.line("Got ABORT message");
                    let _ = abort.send(());
                    break;
                }
                Ok(false) => {}
                Err(e) => log.line(&format!("Unable to check for abort request, error: {e}")),
            }
        }
    }
    tracing::debug!("abort poller stopped");
}

/// Append one resource-usage record every `interval`. The first sample is
/// taken one interval after start so CPU counters have a baseline.
pub async fn resource_loop(
    status: StatusChannel,
    log: Arc<LogWriter>,
    sampler: ResourceSampler,
    pid: u32,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sampler = Some(sampler);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let Some(mut owned) = sampler.take() else { break };
                let joined = tokio::task::spawn_blocking(move || {
                    let sample = owned.sample(pid);
                    (owned, sample)
                })
                .await;
                let (owned, (record, warnings)) = match joined {
                    Ok(v) => v,
                    Err(e) => {
                        log.warning(&format!("Resource sampling failed, error: {e}"));
                        break;
                    }
                };
                sampler = Some(owned);

                let total = record.summed_usage();
                tracing::debug!(
                    pid,
                    processes = record.processes_resource_usage.len(),
                    memory_kb = total.memory_kb,
                    cpu_seconds = total.cpu_seconds,
                    "resource sample taken"
                );

                if let Err(e) = status.write_resource_usage(&record, &warnings) {
                    log.warning(&format!("Resource usage: {e}"));
                }
            }
        }
    }
    tracing::debug!("resource sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_writer::tests::SharedBuf;
    use crate::platform::OsFamily;
    use crate::status_dir::StatusDir;
    use tempfile::tempdir;

    fn fast_timing() -> TimingConfig {
        TimingConfig {
            heartbeat_interval_ms: 50,
            abort_poll_interval_ms: 50,
            resource_sample_interval_ms: 100,
            settle_delay_ms: 10,
        }
    }

    fn setup() -> (tempfile::TempDir, StatusChannel, Arc<LogWriter>, SharedBuf) {
        let dir = tempdir().unwrap();
        let status = StatusChannel::new(StatusDir::new(dir.path().join("status")));
        let buf = SharedBuf::default();
        let log = Arc::new(LogWriter::from_writer(buf.clone(), "\n"));
        (dir, status, log, buf)
    }

    #[tokio::test]
    async fn test_heartbeat_writes_until_stopped() {
        let (_dir, status, log, _buf) = setup();
        let (watchdog, _abort) =
            Watchdog::start(status.clone(), log, &fast_timing(), std::process::id(), None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let first = status.read_alive().unwrap();
        watchdog.stop().await;

        std::fs::remove_file(status.dir().alive()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!status.dir().alive().exists(), "heartbeat kept running");
        assert!(first <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_abort_request_is_reported_once() {
        let (_dir, status, log, buf) = setup();
        let (watchdog, abort) =
            Watchdog::start(status.clone(), log, &fast_timing(), std::process::id(), None);

        status.request_abort().unwrap();
        tokio::time::timeout(Duration::from_secs(2), abort)
            .await
            .expect("abort not reported in time")
            .unwrap();
        watchdog.stop().await;

        assert_eq!(buf.contents().matches("Got ABORT message").count(), 1);
    }

    #[tokio::test]
    async fn test_no_abort_without_sentinel() {
        let (_dir, status, log, _buf) = setup();
        let (watchdog, mut abort) =
            Watchdog::start(status, log, &fast_timing(), std::process::id(), None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(abort.try_recv().is_err());
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_resource_loop_appends_records() {
        let (_dir, status, log, _buf) = setup();
        let sampler = ResourceSampler::new(OsFamily::detect().unwrap());
        let (watchdog, _abort) = Watchdog::start(
            status.clone(),
            log,
            &fast_timing(),
            std::process::id(),
            Some(sampler),
        );

        tokio::time::sleep(Duration::from_millis(450)).await;
        watchdog.stop().await;

        let records = status.read_resource_usage().unwrap();
        assert!(!records.is_empty());
        assert!(records
            .iter()
            .all(|r| r.process_tree.as_ref().map(|t| t.pid) == Some(std::process::id())));
    }
}
