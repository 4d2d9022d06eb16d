//! Tests for the retry executor working with the breaker registry
//!
//! All tests run on a paused clock, so backoff sleeps and reset timeouts
//! complete instantly while keeping their exact durations.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::config::{BreakerConfig, ResilienceConfig};
    use crate::policy::{PolicyOverride, API_POLICY, NETWORK_POLICY};
    use crate::{
        CallError, ChannelSink, CircuitState, Error, Notification, OperationContext, Resilience,
        Severity,
    };

    fn resilience(failure_threshold: u32) -> (Resilience, UnboundedReceiver<Notification>) {
        let config = ResilienceConfig {
            breaker: BreakerConfig {
                failure_threshold,
                reset_timeout: Duration::from_secs(60),
            },
            ..ResilienceConfig::default()
        };
        let (sink, receiver) = ChannelSink::new();
        let resilience = Resilience::with_sink(config, Arc::new(sink)).unwrap();
        (resilience, receiver)
    }

    fn fast_network_policy(resilience: &Resilience, max_retries: u32) {
        assert!(resilience.policies().update(
            NETWORK_POLICY,
            PolicyOverride {
                max_retries: Some(max_retries),
                initial_delay: Some(Duration::from_millis(100)),
                max_delay: Some(Duration::from_secs(10)),
                backoff_multiplier: Some(2.0),
                jitter: Some(false),
                ..Default::default()
            },
        ));
    }

    fn drain(receiver: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            notifications.push(notification);
        }
        notifications
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_two_transient_failures() {
        let (resilience, mut receiver) = resilience(5);
        fast_network_policy(&resilience, 2);

        let context = OperationContext::new("GET /api/series", NETWORK_POLICY);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let result = resilience
            .execute(&context, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::connectivity("connection reset"))
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "elapsed {:?}", elapsed);

        let notifications = drain(&mut receiver);
        let delays: Vec<Duration> = notifications
            .iter()
            .filter_map(|n| n.retry.as_ref().map(|progress| progress.delay))
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(notifications.last().unwrap().severity, Severity::Success);

        let stats = resilience.stats().get("GET /api/series").unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(resilience.breakers().state("GET /api/series"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_without_retry() {
        let (resilience, mut receiver) = resilience(5);
        let context = OperationContext::new("GET /api/series/42", API_POLICY);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let result: crate::Result<()> = resilience
            .execute(&context, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::status(404, "Not Found"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        match result {
            Err(Error::Client {
                operation_id,
                attempts,
                source,
            }) => {
                assert_eq!(operation_id, "GET /api/series/42");
                assert_eq!(attempts, 1);
                assert_eq!(source.status_code(), Some(404));
            }
            other => panic!("expected a client error, got {:?}", other),
        }

        let notifications = drain(&mut receiver);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].severity, Severity::Error);
        assert!(notifications[0].retry.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitelisted_status_is_retried() {
        let (resilience, _receiver) = resilience(5);
        let context = OperationContext::new("GET /3/search/tv", API_POLICY);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = resilience
            .execute(&context, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CallError::status(429, "Too Many Requests"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling() {
        let (resilience, mut receiver) = resilience(2);
        fast_network_policy(&resilience, 0);
        let context = OperationContext::new("POST /api/scan", NETWORK_POLICY);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let result: crate::Result<()> = resilience
                .execute(&context, move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(CallError::status(503, "Service Unavailable"))
                    }
                })
                .await;
            assert!(matches!(result, Err(Error::RetryExhausted { attempts: 1, .. })));
        }
        assert_eq!(resilience.breakers().state("POST /api/scan"), CircuitState::Open);
        assert!(!resilience.health().healthy);

        let counter = Arc::clone(&calls);
        let result: crate::Result<()> = resilience
            .execute(&context, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the breaker listener reports the transition through the same sink
        let titles: Vec<String> = drain(&mut receiver).into_iter().map(|n| n.title).collect();
        assert!(titles.contains(&"Service paused".to_string()));
        assert!(titles.contains(&"Service unavailable".to_string()));

        tokio::time::advance(Duration::from_secs(61)).await;

        let result = resilience
            .execute(&context, || async { Ok::<_, CallError>("probe") })
            .await;
        assert_eq!(result.unwrap(), "probe");
        assert_eq!(resilience.breakers().state("POST /api/scan"), CircuitState::Closed);
        assert!(resilience.health().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_still_count_toward_breaker() {
        let (resilience, _receiver) = resilience(2);
        let context = OperationContext::new("GET /api/missing", API_POLICY);

        for _ in 0..2 {
            let result: crate::Result<()> = resilience
                .execute(&context, || async { Err(CallError::status(404, "Not Found")) })
                .await;
            assert!(matches!(result, Err(Error::Client { .. })));
        }

        assert_eq!(resilience.breakers().state("GET /api/missing"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (resilience, _receiver) = resilience(1);
        fast_network_policy(&resilience, 5);
        let context = OperationContext::new("GET /api/slow", NETWORK_POLICY);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let call = resilience.execute_with_cancel(&context, &cancel, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::connectivity("offline"))
            }
        });
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(call, canceller);

        match result {
            Err(Error::Cancelled { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = resilience.stats().get("GET /api/slow").unwrap();
        assert_eq!(stats.cancelled_count, 1);
        assert_eq!(stats.failure_count, 0);
        // cancellation is not a failure of the destination
        assert_eq!(resilience.breakers().state("GET /api/slow"), CircuitState::Closed);
        assert_eq!(resilience.health().active_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_attempt() {
        let (resilience, _receiver) = resilience(5);
        let context = OperationContext::new("POST /api/analyze-series", API_POLICY);
        let cancel = CancellationToken::new();

        let call = resilience.execute_with_cancel(&context, &cancel, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, CallError>(())
        });
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(call, canceller);

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_attempt() {
        let (resilience, _receiver) = resilience(5);
        let context = OperationContext::new("GET /api/series", NETWORK_POLICY);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = resilience
            .execute_with_cancel(&context, &cancel, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CallError>(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled { attempts: 0, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_half_open_slot() {
        let (resilience, _receiver) = resilience(1);
        fast_network_policy(&resilience, 0);
        let context = OperationContext::new("GET /api/flaky", NETWORK_POLICY);

        let result: crate::Result<()> = resilience
            .execute(&context, || async { Err(CallError::connectivity("reset")) })
            .await;
        assert!(result.is_err());
        assert_eq!(resilience.breakers().state("GET /api/flaky"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;

        let cancel = CancellationToken::new();
        let probe = resilience.execute_with_cancel(&context, &cancel, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, CallError>(())
        });
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(probe, canceller);
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(resilience.breakers().state("GET /api/flaky"), CircuitState::HalfOpen);

        let result = resilience
            .execute(&context, || async { Ok::<_, CallError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(resilience.breakers().state("GET /api/flaky"), CircuitState::Closed);
    }

    /// Opens "GET /x" with a threshold of one and waits out the cool-down
    async fn opened_and_cooled(resilience: &Resilience, context: &OperationContext) {
        let result: crate::Result<()> = resilience
            .execute(context, || async { Err(CallError::connectivity("reset")) })
            .await;
        assert!(result.is_err());
        assert_eq!(resilience.breakers().state("GET /x"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(61)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_future_releases_half_open_slot() {
        let (resilience, _receiver) = resilience(1);
        fast_network_policy(&resilience, 0);
        let context = OperationContext::new("GET /x", NETWORK_POLICY);
        opened_and_cooled(&resilience, &context).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            resilience.execute(&context, || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, CallError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(resilience.breakers().state("GET /x"), CircuitState::HalfOpen);
        assert_eq!(resilience.active_retries().len(), 0);

        let result = resilience
            .execute(&context, || async { Ok::<_, CallError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(resilience.breakers().state("GET /x"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_releases_half_open_slot() {
        let (resilience, _receiver) = resilience(1);
        fast_network_policy(&resilience, 0);
        let context = OperationContext::new("GET /x", NETWORK_POLICY);
        opened_and_cooled(&resilience, &context).await;

        let task = {
            let resilience = resilience.clone();
            let context = context.clone();
            tokio::spawn(async move {
                resilience
                    .execute(&context, || async {
                        if true {
                            panic!("operation blew up");
                        }
                        Ok::<_, CallError>(())
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        let result = resilience
            .execute(&context, || async { Ok::<_, CallError>(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(resilience.breakers().state("GET /x"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_from_before_opening_ignored_when_half_open() {
        let (resilience, _receiver) = resilience(1);
        fast_network_policy(&resilience, 0);
        let context = OperationContext::new("GET /x", NETWORK_POLICY);
        assert!(resilience.policies().update(
            NETWORK_POLICY,
            PolicyOverride {
                timeout: Some(Duration::from_secs(600)),
                ..Default::default()
            },
        ));

        // admitted while closed, fails long after the circuit has opened
        let slow = resilience.execute(&context, || async {
            tokio::time::sleep(Duration::from_secs(90)).await;
            Err::<(), _>(CallError::connectivity("reset"))
        });
        let rest = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let result: crate::Result<()> = resilience
                .execute(&context, || async { Err(CallError::connectivity("reset")) })
                .await;
            assert!(result.is_err());
            assert_eq!(resilience.breakers().state("GET /x"), CircuitState::Open);

            tokio::time::sleep(Duration::from_secs(61)).await;
            resilience
                .execute(&context, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, CallError>(())
                })
                .await
        };

        let (slow_result, probe_result) = tokio::join!(slow, rest);
        assert!(slow_result.is_err());
        assert!(probe_result.is_ok());
        assert_eq!(resilience.breakers().state("GET /x"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_independent() {
        let (resilience, _receiver) = resilience(3);
        fast_network_policy(&resilience, 1);

        let healthy = OperationContext::new("GET /api/healthy", NETWORK_POLICY);
        let failing = OperationContext::new("GET /api/failing", NETWORK_POLICY);

        let healthy_calls = (0..10).map(|_| {
            resilience.execute(&healthy, || async { Ok::<_, CallError>(()) })
        });
        let failing_calls = (0..10).map(|_| {
            resilience.execute(&failing, || async {
                Err::<(), _>(CallError::status(500, "Internal Server Error"))
            })
        });

        let (healthy_results, failing_results) =
            tokio::join!(join_all(healthy_calls), join_all(failing_calls));

        assert!(healthy_results.iter().all(Result::is_ok));
        assert!(failing_results.iter().all(Result::is_err));

        let report = resilience.health();
        assert_eq!(report.stats["GET /api/healthy"].success_count, 10);
        assert_eq!(report.stats["GET /api/healthy"].average_attempts(), 1.0);
        assert_eq!(report.circuits["GET /api/healthy"].state, CircuitState::Closed);
        assert_eq!(report.circuits["GET /api/failing"].state, CircuitState::Open);
        assert_eq!(report.open_circuits, vec!["GET /api/failing".to_string()]);
        assert_eq!(report.active_retries, 0);
    }
}
