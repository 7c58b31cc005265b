use chrono::{DateTime, Local, TimeZone, Utc};
use rand::Rng;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{FetchResult, MeterClient};
use crate::model::{CurrentReading, ObservedValue, RestoredState};
use crate::observations::{Observations, SensorDescriptor, SensorSnapshot};
use crate::restore::{reconcile_on_start, Reconciliation, RestoreKind};
use crate::scheduler::{PollScheduler, TimerHost, TimerToken};
use crate::store::StateStore;

enum Event {
    Fire(TimerToken),
    Refresh(FetchResult<CurrentReading>),
    Shutdown,
}

/// Live accumulated reading, refreshed once per hour at a jittered instant.
///
/// The runtime is the single owner of the value and the schedule. Fetches run
/// on their own tasks and report back through a channel, so a slow fetch never
/// delays re-arming.
pub struct AccumulatedSensor<T: TimerHost, R> {
    descriptor: SensorDescriptor,
    client: Arc<dyn MeterClient>,
    store: Arc<dyn StateStore>,
    observations: Observations,
    scheduler: PollScheduler<T, R>,
    current: ObservedValue,
    max_age: chrono::Duration,
    refresh_tx: mpsc::UnboundedSender<FetchResult<CurrentReading>>,
    refresh_rx: mpsc::UnboundedReceiver<FetchResult<CurrentReading>>,
}

impl<T: TimerHost, R: Rng> AccumulatedSensor<T, R> {
    pub fn new(
        descriptor: SensorDescriptor,
        client: Arc<dyn MeterClient>,
        store: Arc<dyn StateStore>,
        observations: Observations,
        scheduler: PollScheduler<T, R>,
        max_age: chrono::Duration,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            descriptor,
            client,
            store,
            observations,
            scheduler,
            current: ObservedValue::default(),
            max_age,
            refresh_tx,
            refresh_rx,
        }
    }

    pub fn current(&self) -> ObservedValue {
        self.current
    }

    pub fn scheduler(&self) -> &PollScheduler<T, R> {
        &self.scheduler
    }

    pub fn unique_id(&self) -> &str {
        &self.descriptor.unique_id
    }

    /// Adopts restored state, refreshes when it is missing or stale, and always arms the next poll.
    pub async fn reconcile_on_start<Tz>(
        &mut self,
        restored: Option<&RestoredState>,
        now: &DateTime<Tz>,
    ) -> Reconciliation
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let reconciliation =
            reconcile_on_start(RestoreKind::Accumulated, restored, now, self.max_age);
        if let Some(adopted) = reconciliation.adopted {
            self.current = adopted;
        }
        if reconciliation.decision.needs_refresh() {
            self.spawn_refresh();
        }
        self.scheduler.schedule_next(now);
        self.publish().await;
        reconciliation
    }

    /// Handles a wake-up: refresh in the background, then re-arm for the next hour.
    pub async fn on_fire<Tz>(&mut self, token: TimerToken, now: &DateTime<Tz>)
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let Some(fired) = self.scheduler.take_fired(token) else {
            return;
        };
        self.spawn_refresh();

        // A wall clock stepped back behind the armed instant would re-arm inside the same hour.
        let anchor = if now.with_timezone(&Utc) < fired.next_fire_at {
            fired.next_fire_at.with_timezone(&now.timezone())
        } else {
            now.clone()
        };
        self.scheduler.schedule_next(&anchor);
        self.publish().await;
    }

    fn spawn_refresh(&self) {
        let client = self.client.clone();
        let tx = self.refresh_tx.clone();
        tokio::spawn(async move {
            let result = client.fetch_current_reading().await;
            let _ = tx.send(result);
        });
    }

    /// Applies a fetch outcome. Errors keep the last known value.
    pub async fn apply_refresh(&mut self, result: FetchResult<CurrentReading>) {
        let reading = match result {
            Ok(reading) => reading,
            Err(err) => {
                tracing::error!(sensor = %self.descriptor.unique_id, error = %err, "error reading measure");
                return;
            }
        };

        if !self.current.apply(&reading) {
            tracing::warn!(
                sensor = %self.descriptor.unique_id,
                observed_at = %reading.observed_at,
                current = ?self.current.observed_at,
                "discarding reading older than current state"
            );
            return;
        }

        tracing::info!(
            sensor = %self.descriptor.unique_id,
            value = reading.value,
            unit = self.descriptor.unit,
            "state updated"
        );

        let persisted = RestoredState {
            value: reading.value.to_string(),
            observed_at: reading.observed_at,
        };
        if let Err(err) = self.store.save(&self.descriptor.unique_id, &persisted) {
            tracing::warn!(sensor = %self.descriptor.unique_id, error = %err, "failed to persist state");
        }
        self.publish().await;
    }

    /// Waits for the next in-flight refresh and applies it.
    pub async fn apply_next_refresh(&mut self) {
        if let Some(result) = self.refresh_rx.recv().await {
            self.apply_refresh(result).await;
        }
    }

    async fn publish(&self) {
        let mut snapshot = SensorSnapshot::new(self.descriptor.clone());
        snapshot.value = self.current.value;
        snapshot.observed_at = self.current.observed_at;
        snapshot.last_reset = Some(DateTime::<Utc>::UNIX_EPOCH);
        snapshot.next_update_at = self.scheduler.schedule().map(|s| s.next_fire_at);
        self.observations.publish(snapshot).await;
    }

    pub async fn run(
        mut self,
        mut fire_rx: mpsc::UnboundedReceiver<TimerToken>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => Event::Shutdown,
                token = fire_rx.recv() => match token {
                    Some(token) => Event::Fire(token),
                    None => Event::Shutdown,
                },
                Some(result) = self.refresh_rx.recv() => Event::Refresh(result),
            };

            match event {
                Event::Fire(token) => self.on_fire(token, &Local::now()).await,
                Event::Refresh(result) => self.apply_refresh(result).await,
                Event::Shutdown => break,
            }
        }

        self.scheduler.cancel();
        tracing::info!(sensor = %self.descriptor.unique_id, "accumulated sensor stopped");
    }
}
