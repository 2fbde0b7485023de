//! Per-project scheduler.
//!
//! One logical worker per project: each tick discovers the MRs assigned to
//! the bot, skips the ones cooling down, and drives exactly one job (single
//! or batch) to completion before sleeping. All per-MR ordering guarantees
//! live here.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{BotConfig, MergeOrder};
use crate::error::BotError;
use crate::models::{GitLabMergeRequest, GitLabProject};
use crate::services::batch_job::BatchMergeJob;
use crate::services::merge_job::{JobContext, JobOutcome, SingleMergeJob};

/// Cool-downs cap out at five minutes; a hot-looping platform race should
/// never push retries further out than that.
const COOLDOWN_CAP: Duration = Duration::from_secs(5 * 60);

struct CoolDown {
    until: Instant,
    backoff: Duration,
}

/// Per-MR exponential cool-downs.
#[derive(Default)]
struct CoolDowns {
    map: HashMap<i64, CoolDown>,
}

impl CoolDowns {
    /// Record a requeue: first time waits `hint`, repeats double, capped.
    fn note_requeue(&mut self, mr_iid: i64, hint: Duration, now: Instant) {
        let backoff = match self.map.get(&mr_iid) {
            Some(existing) => (existing.backoff * 2).max(hint).min(COOLDOWN_CAP),
            None => hint.min(COOLDOWN_CAP),
        };
        self.map.insert(
            mr_iid,
            CoolDown {
                until: now + backoff,
                backoff,
            },
        );
    }

    fn clear(&mut self, mr_iid: i64) {
        self.map.remove(&mr_iid);
    }

    fn is_ready(&self, mr_iid: i64, now: Instant) -> bool {
        match self.map.get(&mr_iid) {
            Some(cooldown) => now >= cooldown.until,
            None => true,
        }
    }

    /// Drop bookkeeping for MRs that are no longer candidates at all.
    fn retain(&mut self, live: &HashSet<i64>) {
        self.map.retain(|iid, _| live.contains(iid));
    }
}

pub struct ProjectLoop {
    ctx: JobContext,
    project: GitLabProject,
    merge_order: MergeOrder,
    branch_regexp: regex::Regex,
    source_branch_regexp: regex::Regex,
    batch: bool,
    batch_size: usize,
    poll_interval: Duration,
    idle_interval: Duration,
    cooldowns: CoolDowns,
}

impl ProjectLoop {
    pub fn new(ctx: JobContext, config: &BotConfig, project: GitLabProject) -> Self {
        Self {
            ctx,
            project,
            merge_order: config.merge_order,
            branch_regexp: config.branch_regexp.clone(),
            source_branch_regexp: config.source_branch_regexp.clone(),
            batch: config.batch,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            idle_interval: config.idle_interval,
            cooldowns: CoolDowns::default(),
        }
    }

    /// Run until cancelled. Errors (transient upstream, authorization)
    /// propagate to the supervisor, which decides between restart and
    /// disable.
    pub async fn run(mut self) -> Result<(), BotError> {
        let name = self.project.path_with_namespace.clone();
        log::info!("[loop {}] started", name);

        loop {
            if self.ctx.cancel.is_cancelled() {
                log::info!("[loop {}] stopping", name);
                return Ok(());
            }

            let candidates = self.discover().await?;
            let now = Instant::now();
            self.cooldowns
                .retain(&candidates.iter().map(|mr| mr.iid).collect());
            let ready: Vec<&GitLabMergeRequest> = candidates
                .iter()
                .filter(|mr| self.cooldowns.is_ready(mr.iid, now))
                .collect();

            if ready.is_empty() {
                if self.sleep(self.idle_interval).await.is_err() {
                    return Ok(());
                }
                continue;
            }

            log::info!("[loop {}] {} candidate(s) ready", name, ready.len());

            let batch_group = self.batch_group(&ready);
            if let Some(iids) = batch_group {
                let job = BatchMergeJob::new(self.ctx.clone(), self.project.clone(), iids);
                let result = job.execute().await;
                if result.cancelled {
                    return Ok(());
                }
                let now = Instant::now();
                for iid in &result.merged {
                    self.cooldowns.clear(*iid);
                }
                for iid in &result.rejected {
                    self.cooldowns.clear(*iid);
                }
                for iid in &result.requeued {
                    self.cooldowns
                        .note_requeue(*iid, Duration::from_secs(30), now);
                }
            } else {
                let first = ready[0];
                let job = SingleMergeJob::new(self.ctx.clone(), self.project.id, first.iid);
                match job.execute().await {
                    JobOutcome::Merged | JobOutcome::Rejected(_) => {
                        self.cooldowns.clear(first.iid);
                    }
                    JobOutcome::Requeue(delay) => {
                        self.cooldowns.note_requeue(first.iid, delay, Instant::now());
                    }
                    JobOutcome::Cancelled => return Ok(()),
                }
            }

            if self.sleep(self.poll_interval).await.is_err() {
                return Ok(());
            }
        }
    }

    /// MRs assigned to the bot on this project, in merge order.
    async fn discover(&self) -> Result<Vec<GitLabMergeRequest>, BotError> {
        let mrs = self.ctx.api.list_open_mrs(self.project.id).await?;
        let mut mine: Vec<GitLabMergeRequest> = mrs
            .into_iter()
            .filter(|mr| mr.is_assigned_to(self.ctx.bot_user.id))
            .filter(|mr| self.branch_regexp.is_match(&mr.target_branch))
            .filter(|mr| self.source_branch_regexp.is_match(&mr.source_branch))
            .collect();

        if self.merge_order == MergeOrder::AssignedAt {
            let mut stamped = Vec::with_capacity(mine.len());
            for mr in mine {
                let stamp = self.assigned_at(&mr).await?;
                stamped.push((stamp, mr));
            }
            stamped.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            mine = stamped.into_iter().map(|(_, mr)| mr).collect();
        }

        Ok(mine)
    }

    /// When the bot was last assigned, reconstructed from system notes.
    async fn assigned_at(&self, mr: &GitLabMergeRequest) -> Result<f64, BotError> {
        let needle = format!("assigned to @{}", self.ctx.bot_user.username);
        let notes = self.ctx.api.list_mr_notes(self.project.id, mr.iid).await?;
        let mut latest = 0.0f64;
        for note in notes {
            if note.body.contains(&needle) {
                if let Ok(stamp) = chrono::DateTime::parse_from_rfc3339(&note.created_at) {
                    let secs = stamp.timestamp() as f64;
                    if secs > latest {
                        latest = secs;
                    }
                }
            }
        }
        Ok(latest)
    }

    /// The leading group of same-target, non-fork candidates, when batching
    /// is on and there is more than one of them.
    fn batch_group(&self, ready: &[&GitLabMergeRequest]) -> Option<Vec<i64>> {
        if !self.batch {
            return None;
        }
        let target = &ready.first()?.target_branch;
        let group: Vec<i64> = ready
            .iter()
            .filter(|mr| &mr.target_branch == target && !mr.is_from_fork())
            .take(self.batch_size)
            .map(|mr| mr.iid)
            .collect();
        if group.len() >= 2 {
            Some(group)
        } else {
            None
        }
    }

    /// Cancellable sleep; Err means shutdown.
    async fn sleep(&self, duration: Duration) -> Result<(), ()> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_first_requeue_uses_hint() {
        let mut cooldowns = CoolDowns::default();
        let now = Instant::now();
        cooldowns.note_requeue(7, Duration::from_secs(30), now);
        assert!(!cooldowns.is_ready(7, now));
        assert!(!cooldowns.is_ready(7, now + Duration::from_secs(29)));
        assert!(cooldowns.is_ready(7, now + Duration::from_secs(30)));
    }

    #[test]
    fn test_cooldown_doubles_and_caps() {
        let mut cooldowns = CoolDowns::default();
        let now = Instant::now();
        cooldowns.note_requeue(7, Duration::from_secs(60), now);
        cooldowns.note_requeue(7, Duration::from_secs(60), now);
        // 60 -> 120
        assert!(!cooldowns.is_ready(7, now + Duration::from_secs(119)));
        assert!(cooldowns.is_ready(7, now + Duration::from_secs(120)));

        for _ in 0..10 {
            cooldowns.note_requeue(7, Duration::from_secs(60), now);
        }
        // Capped at five minutes.
        assert!(cooldowns.is_ready(7, now + COOLDOWN_CAP));
        assert!(!cooldowns.is_ready(7, now + COOLDOWN_CAP - Duration::from_secs(1)));
    }

    #[test]
    fn test_cooldown_cleared_on_completion() {
        let mut cooldowns = CoolDowns::default();
        let now = Instant::now();
        cooldowns.note_requeue(7, Duration::from_secs(300), now);
        cooldowns.clear(7);
        assert!(cooldowns.is_ready(7, now));
    }

    #[test]
    fn test_cooldown_retain_drops_stale() {
        let mut cooldowns = CoolDowns::default();
        let now = Instant::now();
        cooldowns.note_requeue(7, Duration::from_secs(300), now);
        cooldowns.note_requeue(8, Duration::from_secs(300), now);
        let live: HashSet<i64> = [8].into_iter().collect();
        cooldowns.retain(&live);
        assert!(cooldowns.is_ready(7, now));
        assert!(!cooldowns.is_ready(8, now));
    }

    #[test]
    fn test_ready_without_entry() {
        let cooldowns = CoolDowns::default();
        assert!(cooldowns.is_ready(1, Instant::now()));
    }
}
