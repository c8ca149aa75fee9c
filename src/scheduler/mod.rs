//! Scheduler (C): time-based jobs keyed by an externally supplied id.

mod sun;
pub mod trigger;

pub use trigger::{Interval, SunEvent, TriggerSpec};

use std::collections::HashMap;

use actix::prelude::*;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::warn;

use crate::configuration::AstralLocation;
use crate::errors::SchedulerError;

/// Sent to the job's owner each time it fires.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct JobFired {
    pub job_id: String,
}

#[derive(Message)]
#[rtype(result = "Result<(), SchedulerError>")]
pub struct ScheduleJob {
    pub job_id: String,
    pub trigger: TriggerSpec,
    pub recipient: Recipient<JobFired>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct RemoveJob {
    pub job_id: String,
}

struct Job {
    trigger: TriggerSpec,
    recipient: Recipient<JobFired>,
    handle: Option<SpawnHandle>,
}

pub struct SchedulerActor {
    timezone: Tz,
    location: Option<AstralLocation>,
    jobs: HashMap<String, Job>,
}

impl SchedulerActor {
    pub fn new(timezone: Tz, location: Option<AstralLocation>) -> Self {
        Self { timezone, location, jobs: HashMap::new() }
    }

    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    fn arm(&mut self, job_id: String, ctx: &mut Context<Self>) {
        let Some(job) = self.jobs.get(&job_id) else { return };
        let Some(next) = job.trigger.next_after(self.now(), self.location.as_ref()) else {
            self.jobs.remove(&job_id);
            return;
        };
        let delay = (next - self.now()).to_std().unwrap_or(std::time::Duration::ZERO);
        let fire_job_id = job_id.clone();
        let handle = ctx.run_later(delay, move |act, ctx| act.fire(fire_job_id.clone(), ctx));
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.handle = Some(handle);
        }
    }

    fn fire(&mut self, job_id: String, ctx: &mut Context<Self>) {
        let Some(job) = self.jobs.get(&job_id) else { return };
        if job.recipient.try_send(JobFired { job_id: job_id.clone() }).is_err() {
            warn!("scheduler: job `{job_id}` owner is gone, dropping registration");
            self.jobs.remove(&job_id);
            return;
        }
        match &job.trigger {
            TriggerSpec::Once(_) => {
                self.jobs.remove(&job_id);
            }
            _ => self.arm(job_id, ctx),
        }
    }
}

impl Actor for SchedulerActor {
    type Context = Context<Self>;
}

impl Handler<ScheduleJob> for SchedulerActor {
    type Result = Result<(), SchedulerError>;

    fn handle(&mut self, msg: ScheduleJob, ctx: &mut Self::Context) -> Self::Result {
        if self.jobs.contains_key(&msg.job_id) {
            return Err(SchedulerError::DuplicateJobId(msg.job_id));
        }
        msg.trigger.validate(self.now())?;
        self.jobs.insert(msg.job_id.clone(), Job { trigger: msg.trigger, recipient: msg.recipient, handle: None });
        self.arm(msg.job_id, ctx);
        Ok(())
    }
}

impl Handler<RemoveJob> for SchedulerActor {
    type Result = ();

    fn handle(&mut self, msg: RemoveJob, ctx: &mut Self::Context) -> Self::Result {
        // Idempotent: removing an unknown id is not an error (spec §4.3).
        if let Some(job) = self.jobs.remove(&msg.job_id) {
            if let Some(handle) = job.handle {
                ctx.cancel_future(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    #[test]
    fn past_datetime_rejected() {
        let now = Utc::now().with_timezone(&UTC);
        let spec = TriggerSpec::Once(now - chrono::Duration::seconds(5));
        assert_eq!(spec.validate(now), Err(SchedulerError::PastDatetime));
    }

    #[test]
    fn empty_interval_rejected() {
        let now = Utc::now().with_timezone(&UTC);
        let spec = TriggerSpec::Interval { interval: Interval::default(), start: None };
        assert_eq!(spec.validate(now), Err(SchedulerError::EmptyInterval));
    }

    #[test]
    fn daily_trigger_advances_to_tomorrow_when_past() {
        let now = UTC.timestamp_opt(1_700_000_000, 0).unwrap();
        let past_time = (now - chrono::Duration::hours(1)).time();
        let spec = TriggerSpec::Daily(past_time);
        let next = spec.next_after(now, None).unwrap();
        assert!(next > now);
        assert!(next - now < chrono::Duration::days(1) + chrono::Duration::hours(1));
    }
}
