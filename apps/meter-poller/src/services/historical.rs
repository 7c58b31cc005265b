use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backfill::reconcile_history;
use crate::client::MeterClient;
use crate::error::BackfillError;
use crate::model::RestoredState;
use crate::observations::{Observations, SensorDescriptor, SensorSnapshot};
use crate::restore::{reconcile_on_start, Reconciliation, RestoreDecision, RestoreKind};
use crate::store::{HistoricalLog, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    pub fetched: usize,
    pub appended: usize,
}

pub struct HistoricalSensor {
    descriptor: SensorDescriptor,
    client: Arc<dyn MeterClient>,
    log: Arc<dyn HistoricalLog>,
    store: Arc<dyn StateStore>,
    observations: Observations,
    interval: Duration,
    max_age: chrono::Duration,
}

impl HistoricalSensor {
    pub fn new(
        descriptor: SensorDescriptor,
        client: Arc<dyn MeterClient>,
        log: Arc<dyn HistoricalLog>,
        store: Arc<dyn StateStore>,
        observations: Observations,
        interval: Duration,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            descriptor,
            client,
            log,
            store,
            observations,
            interval,
            max_age,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.descriptor.unique_id
    }

    /// Decides whether a backfill is due right away. The visible state always comes from the log.
    pub async fn reconcile_on_start<Tz: TimeZone>(
        &self,
        restored: Option<&RestoredState>,
        now: &DateTime<Tz>,
    ) -> Reconciliation {
        let reconciliation =
            reconcile_on_start(RestoreKind::Historical, restored, now, self.max_age);
        self.publish().await;
        reconciliation
    }

    pub async fn backfill<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<BackfillOutcome, BackfillError> {
        let entries = reconcile_history(self.client.as_ref(), now).await?;
        let appended = self.log.append(&entries)?;
        let outcome = BackfillOutcome {
            fetched: entries.len(),
            appended,
        };
        tracing::info!(
            sensor = %self.descriptor.unique_id,
            fetched = outcome.fetched,
            appended = outcome.appended,
            "historical log extended"
        );

        if let Some(latest) = self.log.latest() {
            let persisted = RestoredState {
                value: latest.value.to_string(),
                observed_at: now.with_timezone(&Utc),
            };
            if let Err(err) = self.store.save(&self.descriptor.unique_id, &persisted) {
                tracing::warn!(sensor = %self.descriptor.unique_id, error = %err, "failed to persist state");
            }
        }
        self.publish().await;
        Ok(outcome)
    }

    async fn publish(&self) {
        let mut snapshot = SensorSnapshot::new(self.descriptor.clone());
        if let Some(latest) = self.log.latest() {
            snapshot.value = Some(latest.value);
            snapshot.observed_at = Some(latest.period_start);
            snapshot.last_reset = Some(latest.metadata.last_reset);
        }
        self.observations.publish(snapshot).await;
    }

    /// Backfills on a fixed cadence. A forced decision runs the first pass immediately.
    pub async fn run(self, startup: RestoreDecision, cancel: CancellationToken) {
        let first = if startup.needs_refresh() {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let next_update_at = Utc::now()
                        + chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(err) = self.backfill(&Local::now()).await {
                        tracing::warn!(sensor = %self.descriptor.unique_id, error = %err, "historical backfill failed");
                    }
                    self.observations
                        .update(&self.descriptor.unique_id, |snapshot| {
                            snapshot.next_update_at = Some(next_update_at);
                        })
                        .await;
                }
            }
        }
        tracing::info!(sensor = %self.descriptor.unique_id, "historical sensor stopped");
    }
}
