//! # Library Summary
//!
//! Polls the dashboard backend for the cached series list and condenses it
//! into completion counts. Requests go through the [`InterceptingClient`],
//! so `/api/get-series` runs under the database policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::interceptor::{CallRequest, InterceptingClient, Transport};
use crate::types::Result;

/// Default refresh period of [`SeriesClient::watch`]
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

const GET_SERIES_PATH: &str = "/api/get-series";

/// Completion counts over the analyzed series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibrarySummary {
    pub total: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub critical: usize,
    /// Share of complete series among analyzed ones, one decimal
    pub completion_pct: f64,
    pub series: Vec<Value>,
}

impl Default for LibrarySummary {
    fn default() -> Self {
        Self::from_series(Vec::new())
    }
}

impl LibrarySummary {
    /// Series with an unknown or zero `totalEpisodes` count toward `total`
    /// only. Owned share >= 100% is complete, < 50% critical.
    pub fn from_series(series: Vec<Value>) -> Self {
        let mut complete = 0;
        let mut incomplete = 0;
        let mut critical = 0;

        for entry in &series {
            let total_episodes = entry
                .get("totalEpisodes")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            if total_episodes <= 0.0 {
                continue;
            }
            let owned = entry
                .get("episode_count")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            let pct = owned / total_episodes * 100.0;
            if pct >= 100.0 {
                complete += 1;
            } else if pct < 50.0 {
                critical += 1;
            } else {
                incomplete += 1;
            }
        }

        let analyzed = complete + incomplete + critical;
        let completion_pct = if analyzed > 0 {
            (complete as f64 / analyzed as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            total: series.len(),
            complete,
            incomplete,
            critical,
            completion_pct,
            series,
        }
    }
}

/// Reads the series list from the dashboard backend
#[derive(Debug)]
pub struct SeriesClient<T> {
    client: InterceptingClient<T>,
}

impl<T> Clone for SeriesClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<T: Transport + 'static> SeriesClient<T> {
    /// `base_url` is the backend root, e.g. `http://localhost:3000`
    pub fn new(client: InterceptingClient<T>, base_url: Url) -> Self {
        Self {
            client: client.with_base_url(base_url),
        }
    }

    /// Fetches the cached series; a body that is not an array counts as empty
    pub async fn fetch_series(&self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let request = CallRequest::post(GET_SERIES_PATH).with_label("Library refresh");
        let response = self.client.send_with_cancel(request, cancel).await?;

        match response.json::<Value>()? {
            Value::Array(series) => Ok(series),
            other => {
                debug!(kind = %json_kind(&other), "Series response is not a list");
                Ok(Vec::new())
            }
        }
    }

    pub async fn summary(&self, cancel: &CancellationToken) -> Result<LibrarySummary> {
        Ok(LibrarySummary::from_series(self.fetch_series(cancel).await?))
    }

    /// Refreshes the summary every `interval` until `cancel` fires. The
    /// first refresh happens immediately; failed refreshes are logged and
    /// keep the previous value.
    pub fn watch(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (watch::Receiver<Option<LibrarySummary>>, JoinHandle<()>) {
        let (sender, receiver) = watch::channel(None);
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match this.summary(&cancel).await {
                    Ok(summary) => {
                        debug!(
                            total = %summary.total,
                            complete = %summary.complete,
                            "Library summary refreshed"
                        );
                        if sender.send(Some(summary)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => warn!(error = %e, "Library refresh failed"),
                }
            }
        });

        (receiver, handle)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_buckets() {
        let summary = LibrarySummary::from_series(vec![
            json!({"name": "A", "totalEpisodes": 10, "episode_count": 10}),
            json!({"name": "B", "totalEpisodes": 10, "episode_count": 12}),
            json!({"name": "C", "totalEpisodes": 10, "episode_count": 5}),
            json!({"name": "D", "totalEpisodes": 10, "episode_count": 4}),
            json!({"name": "E", "totalEpisodes": 0, "episode_count": 3}),
            json!({"name": "F"}),
        ]);

        assert_eq!(summary.total, 6);
        assert_eq!(summary.complete, 2);
        assert_eq!(summary.incomplete, 1);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.completion_pct, 50.0);
    }

    #[test]
    fn test_completion_rounds_to_one_decimal() {
        let summary = LibrarySummary::from_series(vec![
            json!({"totalEpisodes": 3, "episode_count": 3}),
            json!({"totalEpisodes": 3, "episode_count": 2}),
            json!({"totalEpisodes": 3, "episode_count": 2}),
        ]);
        assert_eq!(summary.completion_pct, 33.3);
    }

    #[test]
    fn test_empty_library() {
        let summary = LibrarySummary::default();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.completion_pct, 0.0);
    }
}
