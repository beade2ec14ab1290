//! Grid carbon-intensity sampling.
//!
//! [`IntensityOracle`] is the single shared view of the grid for intake and
//! the scheduler loop. It polls an [`IntensitySource`], keeps the latest
//! reading plus a bounded ring of history, collapses concurrent refreshes
//! into one upstream request and degrades to the last known-good reading
//! when the provider is unavailable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::config::OracleConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::telemetry;

/// One reading of grid carbon intensity in gCO2eq/kWh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntensitySample {
    pub zone: String,
    pub intensity: f64,
    /// When this process obtained the reading.
    pub sampled_at: DateTime<Utc>,
    /// Timestamp reported by the provider.
    pub reported_at: DateTime<Utc>,
    /// Set on the copy returned by a failed refresh.
    #[serde(default)]
    pub stale: bool,
}

impl IntensitySample {
    pub fn new(zone: impl Into<String>, intensity: f64, reported_at: DateTime<Utc>) -> Self {
        Self {
            zone: zone.into(),
            intensity,
            sampled_at: Utc::now(),
            reported_at,
            stale: false,
        }
    }
}

/// Upstream provider of intensity readings for a fixed region.
#[async_trait]
pub trait IntensitySource: Send + Sync {
    /// Most recent reading.
    async fn latest(&self) -> anyhow::Result<IntensitySample>;

    /// Recent readings, oldest first.
    async fn history(&self) -> anyhow::Result<Vec<IntensitySample>>;
}

/// Electricity Maps v3 client scoped to one datacenter region.
pub struct ElectricityMapsSource {
    client: Client,
    config: OracleConfig,
    api_key: SecretString,
}

impl std::fmt::Debug for ElectricityMapsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectricityMapsSource")
            .field("base_url", &self.config.base_url)
            .field("region", &self.config.data_center_region)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestResponse {
    zone: String,
    carbon_intensity: f64,
    datetime: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    zone: String,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    carbon_intensity: Option<f64>,
    datetime: DateTime<Utc>,
}

impl ElectricityMapsSource {
    pub fn new(config: OracleConfig, api_key: SecretString) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("building electricity maps client")?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn query(&self) -> [(&'static str, String); 4] {
        [
            ("dataCenterRegion", self.config.data_center_region.clone()),
            ("dataCenterProvider", self.config.data_center_provider.clone()),
            ("disableEstimations", self.config.disable_estimations.to_string()),
            ("emissionFactorType", self.config.emission_factor_type.clone()),
        ]
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .header("auth-token", self.api_key.expose_secret())
            .query(&self.query())
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("electricity maps {path} returned {status}: {body}");
        }

        response
            .json::<T>()
            .await
            .with_context(|| format!("decoding {path} response"))
    }
}

#[async_trait]
impl IntensitySource for ElectricityMapsSource {
    async fn latest(&self) -> anyhow::Result<IntensitySample> {
        let body: LatestResponse = self.get("carbon-intensity/latest").await?;
        Ok(IntensitySample::new(
            body.zone,
            body.carbon_intensity,
            body.datetime,
        ))
    }

    async fn history(&self) -> anyhow::Result<Vec<IntensitySample>> {
        let body: HistoryResponse = self.get("carbon-intensity/history").await?;
        let zone = body.zone;
        let mut samples: Vec<IntensitySample> = body
            .history
            .into_iter()
            .filter_map(|entry| {
                entry
                    .carbon_intensity
                    .map(|ci| IntensitySample::new(zone.clone(), ci, entry.datetime))
            })
            .collect();
        samples.sort_by_key(|s| s.reported_at);
        Ok(samples)
    }
}

#[derive(Debug)]
struct OracleState {
    latest: Option<IntensitySample>,
    history: VecDeque<IntensitySample>,
    capacity: usize,
    last_success: Option<Instant>,
    /// The most recent refresh failed.
    degraded: bool,
}

impl OracleState {
    fn record(&mut self, sample: IntensitySample) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        self.latest = Some(sample);
    }
}

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<IntensitySample, String>>>;

/// Shared, cached view of grid intensity for one region.
pub struct IntensityOracle {
    source: Arc<dyn IntensitySource>,
    state: Arc<RwLock<OracleState>>,
    inflight: Mutex<Option<RefreshFuture>>,
    min_refresh_interval: Duration,
    events: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for IntensityOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("IntensityOracle")
            .field("latest", &state.latest)
            .field("history_len", &state.history.len())
            .field("capacity", &state.capacity)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish_non_exhaustive()
    }
}

impl IntensityOracle {
    pub fn new(source: Arc<dyn IntensitySource>, config: &OracleConfig) -> Self {
        Self {
            source,
            state: Arc::new(RwLock::new(OracleState {
                latest: None,
                history: VecDeque::with_capacity(config.history_capacity.max(1)),
                capacity: config.history_capacity.max(1),
                last_success: None,
                degraded: false,
            })),
            inflight: Mutex::new(None),
            min_refresh_interval: Duration::from_secs(config.min_refresh_interval_secs),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Seed the history ring from the provider's history endpoint.
    ///
    /// Failure is logged and otherwise ignored; the oracle still works from
    /// the first successful refresh.
    pub async fn prime(&self) -> usize {
        match self.source.history().await {
            Ok(samples) => {
                let count = samples.len();
                let mut state = self.state.write();
                for sample in samples {
                    state.record(sample);
                }
                debug!(count, "primed intensity history");
                count
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to prime intensity history");
                0
            }
        }
    }

    /// Poll the provider and return the new reading.
    ///
    /// Concurrent callers share one upstream request. On failure the last
    /// known-good reading is returned with `stale` set; only when no reading
    /// was ever obtained does this fail with `UpstreamUnavailable`.
    pub async fn refresh(&self) -> Result<IntensitySample> {
        if let Some(cached) = self.cached_within_interval() {
            return Ok(cached);
        }

        let shared = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = Self::poll(Arc::clone(&self.source), Arc::clone(&self.state))
                        .instrument(telemetry::refresh_span())
                        .boxed()
                        .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let outcome = shared.clone().await;

        // Exactly one of the callers sharing this poll clears the slot; it
        // alone reports a failure.
        let owner = {
            let mut slot = self.inflight.lock();
            if slot.as_ref().is_some_and(|f| f.ptr_eq(&shared)) {
                *slot = None;
                true
            } else {
                false
            }
        };

        match outcome {
            Ok(sample) => Ok(sample),
            Err(reason) => self.degraded(reason, owner).await,
        }
    }

    /// Latest reading without network access, flagged stale while the
    /// provider is failing.
    pub fn current(&self) -> Result<IntensitySample> {
        let state = self.state.read();
        let mut sample = state.latest.clone().ok_or_else(|| {
            SchedulerError::UpstreamUnavailable("no intensity sample obtained yet".into())
        })?;
        sample.stale = state.degraded;
        Ok(sample)
    }

    /// The last `n` retained readings, oldest first.
    pub fn history(&self, n: usize) -> Vec<IntensitySample> {
        let state = self.state.read();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_capacity(&self) -> usize {
        self.state.read().capacity
    }

    fn cached_within_interval(&self) -> Option<IntensitySample> {
        if self.min_refresh_interval.is_zero() {
            return None;
        }
        let state = self.state.read();
        match (state.last_success, state.latest.as_ref()) {
            (Some(at), Some(latest)) if at.elapsed() < self.min_refresh_interval => {
                Some(latest.clone())
            }
            _ => None,
        }
    }

    async fn poll(
        source: Arc<dyn IntensitySource>,
        state: Arc<RwLock<OracleState>>,
    ) -> std::result::Result<IntensitySample, String> {
        match source.latest().await {
            Ok(sample) => {
                {
                    let mut guard = state.write();
                    guard.record(sample.clone());
                    guard.last_success = Some(Instant::now());
                    guard.degraded = false;
                }
                telemetry::record_intensity(&sample.zone, sample.intensity);
                Ok(sample)
            }
            Err(err) => Err(format!("{err:#}")),
        }
    }

    async fn degraded(&self, reason: String, announce: bool) -> Result<IntensitySample> {
        let latest = {
            let mut state = self.state.write();
            state.degraded = true;
            state.latest.clone()
        };
        let Some(mut sample) = latest else {
            return Err(SchedulerError::UpstreamUnavailable(reason));
        };
        sample.stale = true;
        if !announce {
            return Ok(sample);
        }

        telemetry::record_degraded_signal(&sample.zone, &reason);
        if let Some(events) = &self.events {
            let event = SchedulerEvent::new(EventPayload::SignalDegraded {
                zone: sample.zone.clone(),
                reason,
            });
            if let Err(err) = events.publish(event).await {
                warn!("publish degraded signal failed: {err}");
            }
        }
        Ok(sample)
    }
}
