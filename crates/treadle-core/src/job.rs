use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::exec::{Enactment, ProcessInstance, TokenId};
use crate::graph::{DelegateRef, TimerDef};

/// Retry budget for freshly created jobs. A job whose budget reaches zero
/// stays in the store for inspection but is never acquired again.
pub const DEFAULT_RETRIES: u32 = 3;

/// A persisted unit of deferred work: either a timer or a one-shot action.
/// Jobs carry their own optimistic version and pessimistic lock fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Optimistic concurrency stamp; bumped by the store on commit.
    pub version: i64,
    pub instance_id: Uuid,
    /// Owning token; `None` for instance-level work run on the root.
    pub token: Option<TokenId>,
    pub payload: JobPayload,
    pub due_at: DateTime<Utc>,
    pub retries: u32,
    /// Exclusive jobs of one instance are acquired and executed as a batch.
    pub exclusive: bool,
    /// Error chain of the last failed execution, if any.
    pub exception: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobPayload {
    /// Deferred delegate invocation.
    Action { action: DelegateRef },
    /// Scheduled timer, optionally repeating.
    Timer(TimerJob),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerJob {
    pub name: String,
    /// Transition to take after firing; skipped silently when the token's
    /// current node no longer offers it.
    pub transition: Option<String>,
    pub action: Option<DelegateRef>,
    pub repeat: Option<std::time::Duration>,
}

impl Job {
    /// Schedules a timer owned by `token`, due `def.delay` from now.
    pub fn timer(instance: &ProcessInstance, token: TokenId, def: &TimerDef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            instance_id: instance.id,
            token: Some(token),
            payload: JobPayload::Timer(TimerJob {
                name: def.name.clone(),
                transition: def.transition.clone(),
                action: def.action.clone(),
                repeat: def.repeat,
            }),
            due_at: due_after(now, interval(def.delay)),
            retries: DEFAULT_RETRIES,
            exclusive: false,
            exception: None,
            lock_owner: None,
            lock_time: None,
            created_at: now,
        }
    }

    /// Schedules a one-shot action, due immediately unless delayed.
    pub fn action(
        instance: &ProcessInstance,
        token: Option<TokenId>,
        action: DelegateRef,
        delay: Option<std::time::Duration>,
        exclusive: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            instance_id: instance.id,
            token,
            payload: JobPayload::Action { action },
            due_at: delay.map_or(now, |d| due_after(now, interval(d))),
            retries: DEFAULT_RETRIES,
            exclusive,
            exception: None,
            lock_owner: None,
            lock_time: None,
            created_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    /// Whether an executor may lock this job right now.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.is_locked() && self.retries > 0 && self.due_at <= now
    }

    pub fn timer_name(&self) -> Option<&str> {
        match &self.payload {
            JobPayload::Timer(t) => Some(&t.name),
            JobPayload::Action { .. } => None,
        }
    }

    /// Runs the job against an open enactment. `Ok(true)` means consumed:
    /// the caller deletes the row. A repeating timer pushes its successor
    /// row into the enactment's effects before reporting itself consumed.
    pub fn execute(&self, enactment: &mut Enactment<'_>) -> Result<bool> {
        match &self.payload {
            JobPayload::Action { action } => {
                let token = self.token.unwrap_or(enactment.instance().root);
                enactment.run_action(token, action, None)?;
                Ok(true)
            }
            JobPayload::Timer(timer) => {
                let token = self.token.ok_or_else(|| {
                    EngineError::State(format!("Timer job {} has no owning token", self.id))
                })?;
                let node_before = enactment.instance().token(token)?.node;
                enactment.fire_timer(token, timer)?;

                if let Some(repeat) = timer.repeat.filter(|r| !r.is_zero()) {
                    let t = enactment.instance().token(token)?;
                    if !t.has_ended() && t.node == node_before {
                        let successor = self.successor(repeat, Utc::now());
                        tracing::debug!(
                            timer = %timer.name,
                            due_at = %successor.due_at,
                            "Scheduling repeat timer successor"
                        );
                        enactment.schedule(successor);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Next occurrence of a repeating timer: a fresh row with the due date
    /// advanced by whole repeat intervals until it lands in the future, so
    /// a delayed firing catches up instead of bursting. Catch-up needs a
    /// positive step; definitions reject anything else at build time.
    fn successor(&self, repeat: std::time::Duration, now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            version: 0,
            due_at: next_occurrence(self.due_at, interval(repeat), now),
            retries: DEFAULT_RETRIES,
            exception: None,
            lock_owner: None,
            lock_time: None,
            created_at: now,
            ..self.clone()
        }
    }
}

fn interval(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Due-date arithmetic saturates at the far future rather than overflowing.
fn due_after(from: DateTime<Utc>, step: ChronoDuration) -> DateTime<Utc> {
    from.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One step past `from`, then skip whole steps until past `now`. The skip
/// count is computed, not iterated, and a non-positive step skips nothing,
/// so no step value can keep a worker busy here.
fn next_occurrence(from: DateTime<Utc>, step: ChronoDuration, now: DateTime<Utc>) -> DateTime<Utc> {
    let due = due_after(from, step);
    if step <= ChronoDuration::zero() || due > now {
        return due;
    }
    match ((now - due).num_nanoseconds(), step.num_nanoseconds()) {
        (Some(behind), Some(ns)) if ns > 0 => {
            let whole = behind / ns + 1;
            due_after(due, ChronoDuration::nanoseconds(ns.saturating_mul(whole)))
        }
        // spans beyond the nanosecond range lose phase alignment
        _ => due_after(now, step),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_timer_job(due_at: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            version: 0,
            instance_id: Uuid::new_v4(),
            token: Some(TokenId(0)),
            payload: JobPayload::Timer(TimerJob {
                name: "remind".to_string(),
                transition: None,
                action: None,
                repeat: Some(std::time::Duration::from_secs(10)),
            }),
            due_at,
            retries: DEFAULT_RETRIES,
            exclusive: false,
            exception: None,
            lock_owner: None,
            lock_time: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_acquirable_rules() {
        let now = Utc::now();
        let mut job = bare_timer_job(now - ChronoDuration::seconds(1));
        assert!(job.is_acquirable(now));

        job.lock_owner = Some("executor:0".to_string());
        assert!(!job.is_acquirable(now));
        job.lock_owner = None;

        job.retries = 0;
        assert!(!job.is_acquirable(now));
        job.retries = 1;

        job.due_at = now + ChronoDuration::seconds(5);
        assert!(!job.is_acquirable(now));
    }

    #[test]
    fn test_successor_catches_up_past_due() {
        let now = Utc::now();
        // three intervals behind; the successor must land in the future
        let job = bare_timer_job(now - ChronoDuration::seconds(35));
        let next = job.successor(std::time::Duration::from_secs(10), now);
        assert!(next.due_at > now);
        assert!(next.due_at <= now + ChronoDuration::seconds(10));
        assert_ne!(next.id, job.id);
        assert_eq!(next.retries, DEFAULT_RETRIES);
        assert!(next.lock_owner.is_none());
    }

    #[test]
    fn test_successor_zero_repeat_skips_catch_up() {
        let now = Utc::now();
        let job = bare_timer_job(now - ChronoDuration::seconds(35));
        // a degenerate step can never advance past now; the successor must
        // come back with the due date unchanged instead of looping
        let next = job.successor(std::time::Duration::ZERO, now);
        assert_eq!(next.due_at, job.due_at);
    }

    #[test]
    fn test_successor_catches_up_with_a_subsecond_repeat() {
        let now = Utc::now();
        // a day behind at nanosecond granularity; the skip must be computed
        let job = bare_timer_job(now - ChronoDuration::days(1));
        let next = job.successor(std::time::Duration::from_nanos(1), now);
        assert!(next.due_at > now);
        assert!(next.due_at <= now + ChronoDuration::seconds(1));
    }

    #[test]
    fn test_interval_saturates_instead_of_wrapping() {
        assert_eq!(interval(std::time::Duration::MAX), ChronoDuration::MAX);
        assert!(interval(std::time::Duration::MAX) > ChronoDuration::zero());
        assert_eq!(
            interval(std::time::Duration::from_secs(10)),
            ChronoDuration::seconds(10)
        );
    }

    #[test]
    fn test_due_date_saturates_at_the_far_future() {
        let far = due_after(Utc::now(), ChronoDuration::MAX);
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
        let near = due_after(Utc::now(), ChronoDuration::zero());
        assert!(near < far);
    }

    #[test]
    fn test_successor_resets_failure_state() {
        let now = Utc::now();
        let mut job = bare_timer_job(now);
        job.retries = 1;
        job.exception = Some("boom".to_string());
        job.lock_owner = Some("executor:1".to_string());
        job.lock_time = Some(now);

        let next = job.successor(std::time::Duration::from_secs(10), now);
        assert_eq!(next.retries, DEFAULT_RETRIES);
        assert!(next.exception.is_none());
        assert!(next.lock_owner.is_none());
        assert!(next.lock_time.is_none());
        assert_eq!(next.instance_id, job.instance_id);
    }
}
