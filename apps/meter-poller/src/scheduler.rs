//! Jittered hourly poll scheduling.
//!
//! Every installation picks a random minute and second inside
//! `[minute_min, minute_max)` of the hour so that meters are not all polled
//! at the same instant. At most one wake-up is armed per scheduler.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, SubsecRound, TimeZone, Timelike, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one armed wake-up. A fire event whose token is no longer armed is stale.
pub type TimerToken = u64;

pub trait TimerHost {
    type Handle;

    fn arm(&mut self, token: TimerToken, fire_at: DateTime<Utc>) -> Self::Handle;
    fn cancel(&mut self, handle: Self::Handle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    minute_min: u32,
    minute_max: u32,
}

impl ScheduleWindow {
    pub fn new(minute_min: u32, minute_max: u32) -> Result<Self> {
        if minute_max > 60 {
            bail!("update window upper bound {minute_max} exceeds 60 minutes");
        }
        if minute_min >= minute_max {
            bail!("update window [{minute_min}, {minute_max}) is empty");
        }
        Ok(Self {
            minute_min,
            minute_max,
        })
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub next_fire_at: DateTime<Utc>,
    pub token: TimerToken,
}

/// Draws the next fire instant for `now`. Always strictly after `now`.
pub fn next_fire_time<Tz: TimeZone, R: Rng>(
    window: &ScheduleWindow,
    now: &DateTime<Tz>,
    rng: &mut R,
) -> DateTime<Tz> {
    let minute = rng.gen_range(window.minute_min..window.minute_max);
    let second = rng.gen_range(0..60u32);

    let base = now.clone().trunc_subsecs(0);
    let current = i64::from(base.minute()) * 60 + i64::from(base.second());
    let mut offset = i64::from(minute) * 60 + i64::from(second) - current;
    if base.minute() >= window.minute_min {
        offset += 3600;
    }
    base + Duration::seconds(offset)
}

pub struct PollScheduler<T: TimerHost, R> {
    window: ScheduleWindow,
    timers: T,
    rng: R,
    armed: Option<(PollSchedule, T::Handle)>,
    next_token: TimerToken,
}

impl<T: TimerHost, R: Rng> PollScheduler<T, R> {
    pub fn new(window: ScheduleWindow, timers: T, rng: R) -> Self {
        Self {
            window,
            timers,
            rng,
            armed: None,
            next_token: 1,
        }
    }

    pub fn schedule(&self) -> Option<PollSchedule> {
        self.armed.as_ref().map(|(schedule, _)| *schedule)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    /// Cancels the armed wake-up, if any. Returns whether one was cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some((schedule, handle)) => {
                self.timers.cancel(handle);
                tracing::debug!(next_fire_at = %schedule.next_fire_at, "previous update cancelled");
                true
            }
            None => false,
        }
    }

    pub fn schedule_next<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> DateTime<Tz>
    where
        Tz::Offset: std::fmt::Display,
    {
        self.cancel();

        let next = next_fire_time(&self.window, now, &mut self.rng);
        let next_utc = next.with_timezone(&Utc);
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        let handle = self.timers.arm(token, next_utc);
        self.armed = Some((
            PollSchedule {
                next_fire_at: next_utc,
                token,
            },
            handle,
        ));

        let delay = next.clone() - now.clone();
        tracing::info!(
            delay_secs = delay.num_seconds(),
            next_update = %next,
            "next update scheduled"
        );
        next
    }

    /// Consumes the armed schedule when `token` is the one that fired.
    ///
    /// Returns `None` for stale tokens from a wake-up that was replaced after it fired.
    pub fn take_fired(&mut self, token: TimerToken) -> Option<PollSchedule> {
        match &self.armed {
            Some((schedule, _)) if schedule.token == token => {
                let schedule = *schedule;
                self.armed = None;
                Some(schedule)
            }
            _ => {
                tracing::debug!(token, "ignoring stale wake-up");
                None
            }
        }
    }
}

/// Timer host backed by the tokio runtime. Fired tokens are posted to `tx`.
pub struct TokioTimers {
    tx: mpsc::UnboundedSender<TimerToken>,
}

impl TokioTimers {
    pub fn new(tx: mpsc::UnboundedSender<TimerToken>) -> Self {
        Self { tx }
    }
}

impl TimerHost for TokioTimers {
    type Handle = JoinHandle<()>;

    fn arm(&mut self, token: TimerToken, fire_at: DateTime<Utc>) -> Self::Handle {
        let delay = (fire_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(token);
        })
    }

    fn cancel(&mut self, handle: Self::Handle) {
        handle.abort();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;

    /// Records armed and cancelled wake-ups instead of sleeping.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTimers {
        pub(crate) pending: BTreeMap<TimerToken, DateTime<Utc>>,
        pub(crate) cancelled: Vec<TimerToken>,
    }

    impl TimerHost for RecordingTimers {
        type Handle = TimerToken;

        fn arm(&mut self, token: TimerToken, fire_at: DateTime<Utc>) -> TimerToken {
            self.pending.insert(token, fire_at);
            token
        }

        fn cancel(&mut self, handle: TimerToken) {
            self.pending.remove(&handle);
            self.cancelled.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTimers;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scheduler(seed: u64) -> PollScheduler<RecordingTimers, StdRng> {
        PollScheduler::new(
            ScheduleWindow::new(50, 60).unwrap(),
            RecordingTimers::default(),
            StdRng::seed_from_u64(seed),
        )
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, s).unwrap()
    }

    #[test]
    fn window_rejects_empty_or_oversized_ranges() {
        assert!(ScheduleWindow::new(50, 50).is_err());
        assert!(ScheduleWindow::new(55, 50).is_err());
        assert!(ScheduleWindow::new(0, 61).is_err());
        assert!(ScheduleWindow::new(0, 60).is_ok());
    }

    #[test]
    fn before_window_stays_in_current_hour() {
        let mut scheduler = scheduler(7);
        let now = at(12, 10, 5);
        let next = scheduler.schedule_next(&now);
        assert_eq!(next.hour(), 12);
        assert!((50..60).contains(&next.minute()));
        assert!(next > now);
        assert_eq!(next.nanosecond(), 0);
    }

    #[test]
    fn inside_window_moves_to_next_hour() {
        let mut scheduler = scheduler(7);
        let now = at(13, 55, 0);
        let next = scheduler.schedule_next(&now);
        assert_eq!(next.hour(), 14);
        assert!((50..60).contains(&next.minute()));
    }

    #[test]
    fn next_fire_is_always_in_future_and_in_window() {
        let window = ScheduleWindow::new(20, 35).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let start = at(0, 0, 0);
        for step in 0..(24 * 60 * 4) {
            let now = start + Duration::seconds(step * 15) + Duration::milliseconds(750);
            let next = next_fire_time(&window, &now, &mut rng);
            assert!(next > now, "now={now} next={next}");
            assert!((20..35).contains(&next.minute()), "now={now} next={next}");
            let expected_hour = if now.minute() >= 20 {
                (now + Duration::hours(1)).hour()
            } else {
                now.hour()
            };
            assert_eq!(next.hour(), expected_hour, "now={now} next={next}");
        }
    }

    #[test]
    fn last_second_of_hour_rolls_over_day() {
        let window = ScheduleWindow::new(50, 60).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let next = next_fire_time(&window, &now, &mut rng);
        assert_eq!(next.date_naive().to_string(), "2025-01-01");
        assert_eq!(next.hour(), 0);
        assert!(next.minute() >= 50);
    }

    #[test]
    fn same_seed_gives_same_jitter() {
        let now = at(8, 0, 0);
        let a = scheduler(42).schedule_next(&now);
        let b = scheduler(42).schedule_next(&now);
        assert_eq!(a, b);
    }

    #[test]
    fn rescheduling_leaves_exactly_one_armed_timer() {
        let mut scheduler = scheduler(1);
        scheduler.schedule_next(&at(9, 0, 0));
        let first_token = scheduler.schedule().unwrap().token;
        let second = scheduler.schedule_next(&at(9, 1, 0));

        let timers = scheduler.timers();
        assert_eq!(timers.pending.len(), 1);
        assert_eq!(timers.cancelled, vec![first_token]);
        let schedule = scheduler.schedule().unwrap();
        assert_eq!(schedule.next_fire_at, second);
        assert_eq!(timers.pending.get(&schedule.token), Some(&second));
        assert_ne!(first_token, schedule.token);
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let mut scheduler = scheduler(5);
        scheduler.schedule_next(&at(9, 0, 0));
        let stale = scheduler.schedule().unwrap().token;
        scheduler.schedule_next(&at(9, 0, 1));
        let current = scheduler.schedule().unwrap().token;

        assert!(scheduler.take_fired(stale).is_none());
        assert!(scheduler.is_armed());
        let fired = scheduler.take_fired(current).unwrap();
        assert_eq!(fired.token, current);
        assert!(!scheduler.is_armed());
        assert!(scheduler.take_fired(current).is_none());
    }

    #[test]
    fn cancel_without_armed_timer_is_a_no_op() {
        let mut scheduler = scheduler(5);
        assert!(!scheduler.cancel());
        assert!(scheduler.timers().cancelled.is_empty());
    }

    #[test]
    fn local_timezone_keeps_wall_clock_window() {
        let tz = chrono_tz::Europe::Madrid;
        let window = ScheduleWindow::new(50, 60).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let now = tz.with_ymd_and_hms(2024, 7, 1, 12, 10, 5).unwrap();
        let next = next_fire_time(&window, &now, &mut rng);
        assert_eq!(next.hour(), 12);
        assert!(next.minute() >= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timers_post_token_and_abort_on_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TokioTimers::new(tx);

        let cancelled = timers.arm(1, Utc::now() + Duration::seconds(30));
        timers.cancel(cancelled);
        let _kept = timers.arm(2, Utc::now() + Duration::seconds(60));

        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_err());
    }
}
