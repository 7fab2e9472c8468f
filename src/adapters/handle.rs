//! AdapterHandle - runs an AdapterLogic with retry and shutdown handling
//!
//! An adapter run that fails (amplifier not ready during setup, for example)
//! is retried from scratch with exponential backoff. Adapters never loop on
//! their own errors.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{BusEvent, SharedBus};

/// Backoff settings for failed adapter runs
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// A run lasting at least this long resets the delay to `initial_delay`
    pub stable_run_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            stable_run_threshold: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay to use after `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

pub struct AdapterHandle<T: AdapterLogic> {
    logic: Arc<T>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl<T: AdapterLogic> AdapterHandle<T> {
    pub fn new(logic: Arc<T>, bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self {
            logic,
            bus,
            shutdown,
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.logic.prefix()
    }

    pub fn logic(&self) -> &Arc<T> {
        &self.logic
    }

    /// Run once, without retry. Publishes `AdapterStopped` on exit.
    pub async fn run(self) -> Result<()> {
        let prefix = self.logic.prefix();
        info!("Starting adapter: {}", prefix);

        let result = self.run_once().await;
        self.stopped();
        result
    }

    /// Run until a clean exit or shutdown, retrying failed runs with
    /// exponential backoff. Publishes `AdapterStopped` on exit.
    pub async fn run_with_retry(self, config: RetryConfig) -> Result<()> {
        let prefix = self.logic.prefix();
        let mut delay = config.initial_delay;

        loop {
            if self.shutdown.is_cancelled() {
                info!("{}: shutdown before attempt", prefix);
                break;
            }

            let start = Instant::now();
            match self.run_once().await {
                Ok(()) => {
                    info!("{}: clean exit", prefix);
                    break;
                }
                Err(e) => {
                    let run_duration = start.elapsed();
                    if run_duration >= config.stable_run_threshold {
                        info!(
                            "{}: ran for {:?} before failure, resetting backoff",
                            prefix, run_duration
                        );
                        delay = config.initial_delay;
                    }

                    warn!("{}: {}, retrying in {:?}", prefix, e, delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!("{}: shutdown during backoff", prefix);
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {
                            delay = config.next_delay(delay);
                        }
                    }
                }
            }
        }

        self.stopped();
        Ok(())
    }

    fn stopped(&self) {
        let prefix = self.logic.prefix();
        self.bus.publish(BusEvent::AdapterStopped {
            adapter: prefix.to_string(),
        });
        info!("{}: stopped", prefix);
    }

    /// `Ok` on clean shutdown, `Err` when the run should be retried.
    /// `stop()` runs whichever way the run ended.
    async fn run_once(&self) -> Result<()> {
        let prefix = self.logic.prefix();

        if let Err(e) = self.logic.init().await {
            error!("{}: init failed: {}", prefix, e);
            return Err(e);
        }

        let mut rx = self.bus.subscribe();
        let ctx = AdapterContext {
            bus: self.bus.clone(),
            shutdown: self.shutdown.clone(),
        };

        let result = tokio::select! {
            result = self.logic.run(ctx) => {
                if let Err(e) = &result {
                    error!("{}: error: {}", prefix, e);
                }
                result
            }

            _ = async {
                while let Ok(event) = rx.recv().await {
                    if matches!(event, BusEvent::ShuttingDown { .. }) {
                        break;
                    }
                }
            } => {
                info!("{}: stopping due to ShuttingDown event", prefix);
                Ok(())
            }

            _ = self.shutdown.cancelled() => {
                info!("{}: cancelled via token", prefix);
                Ok(())
            }
        };

        self.logic.stop().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{create_bus, ZoneCommand};
    use crate::zone::{CommandOutcome, IgnoreReason};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `max_failures` times (like an amplifier that is not ready yet)
    /// then exits cleanly
    struct FlakySetup {
        attempts: Arc<AtomicUsize>,
        max_failures: usize,
    }

    impl FlakySetup {
        fn new(max_failures: usize) -> Self {
            Self {
                attempts: Arc::new(AtomicUsize::new(0)),
                max_failures,
            }
        }
    }

    #[async_trait]
    impl AdapterLogic for FlakySetup {
        fn prefix(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<()> {
            let count = self.attempts.fetch_add(1, Ordering::SeqCst);
            if count < self.max_failures {
                Err(anyhow::anyhow!("amplifier not ready (attempt {})", count + 1))
            } else {
                Ok(())
            }
        }

        async fn handle_command(
            &self,
            _zone_id: &str,
            _command: ZoneCommand,
        ) -> Result<CommandOutcome> {
            Ok(CommandOutcome::Ignored(IgnoreReason::NoClient))
        }
    }

    /// Runs until cancelled
    struct Idle;

    #[async_trait]
    impl AdapterLogic for Idle {
        fn prefix(&self) -> &'static str {
            "idle"
        }

        async fn run(&self, ctx: AdapterContext) -> Result<()> {
            ctx.shutdown.cancelled().await;
            Ok(())
        }

        async fn handle_command(
            &self,
            _zone_id: &str,
            _command: ZoneCommand,
        ) -> Result<CommandOutcome> {
            Ok(CommandOutcome::Sent)
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_retries_until_ready() {
        let adapter = FlakySetup::new(2);
        let attempts = adapter.attempts.clone();

        let handle = AdapterHandle::new(Arc::new(adapter), create_bus(), CancellationToken::new());
        handle.run_with_retry(fast_retry()).await.unwrap();

        // 2 failures + 1 success
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_run_reports_error() {
        let handle = AdapterHandle::new(
            Arc::new(FlakySetup::new(1)),
            create_bus(),
            CancellationToken::new(),
        );
        assert!(handle.run().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let adapter = FlakySetup::new(100);
        let attempts = adapter.attempts.clone();
        let shutdown = CancellationToken::new();

        let handle = AdapterHandle::new(Arc::new(adapter), create_bus(), shutdown.clone());
        let config = RetryConfig::new(Duration::from_secs(10), Duration::from_secs(60));
        let task = tokio::spawn(async move { handle.run_with_retry(config).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_attempt() {
        let adapter = FlakySetup::new(100);
        let attempts = adapter.attempts.clone();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let handle = AdapterHandle::new(Arc::new(adapter), create_bus(), shutdown);
        handle.run_with_retry(RetryConfig::default()).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutting_down_event_stops_run_and_acks() {
        let bus = create_bus();
        let mut rx = bus.subscribe();
        let handle = AdapterHandle::new(Arc::new(Idle), bus.clone(), CancellationToken::new());
        let task = tokio::spawn(async move { handle.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(BusEvent::ShuttingDown { reason: None });

        assert!(task.await.unwrap().is_ok());
        let mut acked = false;
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::AdapterStopped { adapter } = event {
                assert_eq!(adapter, "idle");
                acked = true;
            }
        }
        assert!(acked, "AdapterStopped should be published");
    }

    #[test]
    fn test_backoff_progression() {
        let config = RetryConfig::default();
        let mut delay = config.initial_delay;

        // 5 -> 10 -> 20 -> 40 -> 60 -> 60
        for expected_secs in [5, 10, 20, 40, 60, 60] {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = config.next_delay(delay);
        }
    }
}
