//! Speculative batch merges.
//!
//! Several MRs targeting the same branch are pre-merged onto a scratch
//! branch so one CI run validates them together. On CI failure the batch is
//! bisected: the leading half retries, the trailing half requeues. The target
//! branch is never touched directly; every integration still goes through a
//! sha-pinned accept per MR, so a race with another writer requeues the batch
//! without corrupting anything.

use std::time::Duration;

use chrono::Utc;

use crate::error::BotError;
use crate::models::{GitLabMergeRequest, GitLabProject, PipelineStatus};
use crate::services::api::AcceptParams;
use crate::services::merge_job::JobContext;
use crate::services::policy::{self, PolicyInput, PolicyVerdict};

const CI_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Name of the scratch branch for a target.
pub fn batch_branch_for(target_branch: &str) -> String {
    format!("batch/{}", target_branch)
}

/// Per-MR results of one batch run; the loop feeds these into cool-downs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub merged: Vec<i64>,
    pub rejected: Vec<i64>,
    pub requeued: Vec<i64>,
    pub cancelled: bool,
}

impl BatchResult {
    fn requeue_all(&mut self, iids: impl IntoIterator<Item = i64>) {
        self.requeued.extend(iids);
    }
}

/// A candidate that survived validation and assembly.
struct Included {
    mr: GitLabMergeRequest,
    /// Head sha of the candidate's chain after rebasing onto the scratch tip.
    rebased_sha: String,
}

pub struct BatchMergeJob {
    ctx: JobContext,
    project: GitLabProject,
    candidate_iids: Vec<i64>,
}

impl BatchMergeJob {
    pub fn new(ctx: JobContext, project: GitLabProject, candidate_iids: Vec<i64>) -> Self {
        Self {
            ctx,
            project,
            candidate_iids,
        }
    }

    pub async fn execute(&self) -> BatchResult {
        let mut result = BatchResult::default();
        let run_result = self.run(&mut result).await;
        // The local scratch and source branches stay alive until the whole
        // batch is over; the merge phase pushes from them.
        self.cleanup_worktree().await;
        match run_result {
            Ok(()) => result,
            Err(BotError::Cancelled) => {
                result.cancelled = true;
                result
            }
            Err(err) => {
                log::warn!(
                    "[batch {}] aborted: {}",
                    self.project.path_with_namespace,
                    err
                );
                result
            }
        }
    }

    async fn cleanup_worktree(&self) {
        let mut worktree = self.ctx.worktree.lock().await;
        if let Err(err) = worktree
            .cleanup(self.project.id, &self.project.default_branch)
            .await
        {
            log::debug!(
                "[batch {}] worktree cleanup skipped: {}",
                self.project.path_with_namespace,
                err
            );
        }
    }

    async fn run(&self, result: &mut BatchResult) -> Result<(), BotError> {
        let mut pool = self.validate_candidates(result).await?;

        while pool.len() > 1 {
            let target_branch = pool[0].target_branch.clone();
            let included = self.assemble(&pool, &target_branch, result).await?;
            if included.is_empty() {
                // Nothing assembled cleanly; everything left requeues.
                result.requeue_all(pool.iter().map(|mr| mr.iid));
                return Ok(());
            }

            let batch_tip = included.last().map(|i| i.rebased_sha.clone()).unwrap_or_default();
            match self.wait_for_batch_ci(&batch_tip).await? {
                CiOutcome::Green => {
                    self.merge_included(included, result).await?;
                    self.cleanup_remote_branch(&target_branch).await;
                    return Ok(());
                }
                CiOutcome::Red(url) => {
                    self.cleanup_remote_branch(&target_branch).await;
                    let keep = pool.len() / 2;
                    if keep == 0 {
                        return Ok(());
                    }
                    log::info!(
                        "[batch {}] CI failed ({}), bisecting {} -> {}",
                        self.project.path_with_namespace,
                        url,
                        pool.len(),
                        keep
                    );
                    result.requeue_all(pool.split_off(keep).iter().map(|mr| mr.iid));
                    continue;
                }
                CiOutcome::Inconclusive => {
                    self.cleanup_remote_branch(&target_branch).await;
                    result.requeue_all(pool.iter().map(|mr| mr.iid));
                    return Ok(());
                }
            }
        }

        // A batch of one has no speculation to offer; the single-MR job with
        // its full rejection handling covers it on the next tick.
        result.requeue_all(pool.iter().map(|mr| mr.iid));
        Ok(())
    }

    /// Refetch and re-validate every candidate; keep the ones worth batching.
    async fn validate_candidates(
        &self,
        result: &mut BatchResult,
    ) -> Result<Vec<GitLabMergeRequest>, BotError> {
        let mut pool = Vec::new();
        let mut target: Option<String> = None;

        for &iid in &self.candidate_iids {
            let mr = self.ctx.api.get_mr(self.project.id, iid).await?;
            let approvals = self.ctx.api.get_approvals(self.project.id, iid).await?;

            let verdict = policy::evaluate(&PolicyInput {
                mr: &mr,
                project: &self.project,
                approvals: &approvals,
                source_branch_info: None,
                bot_user_id: self.ctx.bot_user.id,
                options: &self.ctx.options,
                now: Utc::now(),
            });
            match verdict {
                PolicyVerdict::Ok => {}
                PolicyVerdict::Drop(_) => continue,
                PolicyVerdict::RejectTerminal(reason) => {
                    self.reject(&mr, &reason).await;
                    result.rejected.push(iid);
                    continue;
                }
                PolicyVerdict::Requeue(_, _) => {
                    result.requeued.push(iid);
                    continue;
                }
            }

            // Forks need a dedicated remote per candidate; they go through
            // the single-MR path instead.
            if mr.is_from_fork() {
                result.requeued.push(iid);
                continue;
            }

            match &target {
                None => target = Some(mr.target_branch.clone()),
                Some(t) if *t != mr.target_branch => {
                    result.requeued.push(iid);
                    continue;
                }
                Some(_) => {}
            }

            pool.push(mr);
        }
        Ok(pool)
    }

    /// Build the scratch branch: rebase each candidate onto its tip in order,
    /// fast-forwarding the tip after each, then push it. Conflicting
    /// candidates are rejected and skipped.
    async fn assemble(
        &self,
        pool: &[GitLabMergeRequest],
        target_branch: &str,
        result: &mut BatchResult,
    ) -> Result<Vec<Included>, BotError> {
        let batch_branch = batch_branch_for(target_branch);
        let mut rejected_here: Vec<(GitLabMergeRequest, String)> = Vec::new();

        let assembled = {
            let mut worktree = self.ctx.worktree.lock().await;
            let assembled = async {
                worktree.prepare(&self.project).await?;
                worktree
                    .create_branch(
                        self.project.id,
                        &batch_branch,
                        &format!("origin/{}", target_branch),
                    )
                    .await?;

                let mut included: Vec<Included> = Vec::new();
                for mr in pool {
                    match worktree
                        .rebase(self.project.id, &mr.source_branch, &batch_branch, false)
                        .await
                    {
                        Ok(rebased_sha) => {
                            worktree
                                .fast_forward(self.project.id, &batch_branch, &rebased_sha)
                                .await?;
                            included.push(Included {
                                mr: mr.clone(),
                                rebased_sha,
                            });
                        }
                        Err(BotError::RebaseConflict { .. }) => {
                            rejected_here.push((
                                mr.clone(),
                                format!(
                                    "it conflicts with other changes heading for `{}`",
                                    target_branch
                                ),
                            ));
                        }
                        Err(other) => return Err(other),
                    }
                }

                if !included.is_empty() {
                    worktree
                        .push(self.project.id, &batch_branch, None, false, true, false)
                        .await?;
                }
                Ok(included)
            }
            .await;

            if assembled.is_err() {
                if let Err(cleanup_err) = worktree
                    .cleanup(self.project.id, &self.project.default_branch)
                    .await
                {
                    log::warn!(
                        "[batch {}] worktree cleanup failed: {}",
                        self.project.path_with_namespace,
                        cleanup_err
                    );
                }
            }
            assembled?
        };

        // Comments happen outside the worktree lock.
        for (mr, reason) in rejected_here {
            self.reject(&mr, &reason).await;
            result.rejected.push(mr.iid);
        }

        Ok(assembled)
    }

    /// One CI run validates the whole scratch branch.
    async fn wait_for_batch_ci(&self, batch_tip: &str) -> Result<CiOutcome, BotError> {
        let deadline = tokio::time::Instant::now() + self.ctx.options.ci_timeout;
        log::info!(
            "[batch {}] waiting for CI on {}",
            self.project.path_with_namespace,
            batch_tip
        );

        loop {
            let pipelines = self
                .ctx
                .api
                .list_pipelines(self.project.id, batch_tip)
                .await?;
            let newest = pipelines.iter().max_by_key(|p| p.id);

            if let Some(pipeline) = newest {
                match pipeline.status {
                    PipelineStatus::Success => return Ok(CiOutcome::Green),
                    PipelineStatus::Skipped if self.ctx.options.ci_skipped_is_success => {
                        return Ok(CiOutcome::Green)
                    }
                    PipelineStatus::Skipped
                    | PipelineStatus::Failed
                    | PipelineStatus::Canceled => {
                        return Ok(CiOutcome::Red(pipeline.web_url.clone()))
                    }
                    _ => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                log::warn!(
                    "[batch {}] CI took too long",
                    self.project.path_with_namespace
                );
                return Ok(CiOutcome::Inconclusive);
            }
            self.sleep_or_cancel(CI_POLL_INTERVAL).await?;
        }
    }

    /// Integrate the validated candidates in order: fast-forward each source
    /// branch to its rebased sha, then accept pinned to that sha. Any failure
    /// stops the batch; the remainder requeues untouched.
    async fn merge_included(
        &self,
        included: Vec<Included>,
        result: &mut BatchResult,
    ) -> Result<(), BotError> {
        let mut pending = included.into_iter();

        while let Some(item) = pending.next() {
            let mr = &item.mr;

            // Freshness check right before mutating anything for this MR.
            let fresh = self.ctx.api.get_mr(self.project.id, mr.iid).await?;
            if !fresh.is_assigned_to(self.ctx.bot_user.id) || !fresh.is_open() {
                log::info!("[batch] MR !{} changed state, stopping batch", mr.iid);
                result.requeued.push(mr.iid);
                result.requeue_all(pending.map(|i| i.mr.iid));
                return Ok(());
            }
            let Some(original_sha) = fresh.sha.clone() else {
                result.requeued.push(mr.iid);
                result.requeue_all(pending.map(|i| i.mr.iid));
                return Ok(());
            };

            // Move the source branch to the rebased chain.
            let push_result = {
                let mut worktree = self.ctx.worktree.lock().await;
                worktree
                    .push(
                        self.project.id,
                        &mr.source_branch,
                        Some(&original_sha),
                        false,
                        false,
                        self.ctx.options.batch_skip_ci,
                    )
                    .await
            };
            if let Err(err) = push_result {
                log::info!("[batch] could not update MR !{}: {}", mr.iid, err);
                result.requeued.push(mr.iid);
                result.requeue_all(pending.map(|i| i.mr.iid));
                return Ok(());
            }

            let params = AcceptParams {
                sha: item.rebased_sha.clone(),
                should_remove_source_branch: fresh.wants_source_branch_removed(),
                merge_when_pipeline_succeeds: false,
                squash: fresh.squash,
                squash_commit_message: None,
            };
            match self.ctx.api.accept_mr(self.project.id, mr.iid, &params).await {
                Ok(_) => {}
                Err(BotError::MergeRefused { refusal }) => {
                    // Successors build on this MR's commits, so a refusal
                    // (sha mismatch from another writer included) stops the
                    // whole remainder. Nothing on the target moved.
                    log::info!("[batch] accept of MR !{} refused: {}", mr.iid, refusal);
                    result.requeued.push(mr.iid);
                    result.requeue_all(pending.map(|i| i.mr.iid));
                    return Ok(());
                }
                Err(other) => {
                    result.requeued.push(mr.iid);
                    result.requeue_all(pending.map(|i| i.mr.iid));
                    log::warn!("[batch] accept of MR !{} failed: {}", mr.iid, other);
                    return Ok(());
                }
            }

            if !self.confirm_one(mr.iid).await? {
                result.requeued.push(mr.iid);
                result.requeue_all(pending.map(|i| i.mr.iid));
                return Ok(());
            }
            log::info!("[batch] MR !{} merged", mr.iid);
            result.merged.push(mr.iid);
        }
        Ok(())
    }

    /// Wait for one accepted MR to actually reach the merged state before the
    /// next candidate (whose chain builds on it) is integrated.
    async fn confirm_one(&self, mr_iid: i64) -> Result<bool, BotError> {
        let deadline = tokio::time::Instant::now() + CONFIRM_TIMEOUT;
        loop {
            let fresh = self.ctx.api.get_mr(self.project.id, mr_iid).await?;
            match fresh.state.as_str() {
                "merged" => return Ok(true),
                "closed" => return Ok(false),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            self.sleep_or_cancel(CONFIRM_POLL_INTERVAL).await?;
        }
    }

    async fn cleanup_remote_branch(&self, target_branch: &str) {
        let batch_branch = batch_branch_for(target_branch);
        if let Err(err) = self
            .ctx
            .api
            .delete_branch(self.project.id, &batch_branch)
            .await
        {
            log::debug!("could not delete {}: {}", batch_branch, err);
        }
    }

    async fn reject(&self, mr: &GitLabMergeRequest, reason: &str) {
        let text = format!("I couldn't merge this: {}.", reason);
        if let Err(err) = self.ctx.api.comment(self.project.id, mr.iid, &text).await {
            log::warn!("failed to comment on MR !{}: {}", mr.iid, err);
        }
        let assignees: Vec<i64> = if mr.author.id != self.ctx.bot_user.id {
            vec![mr.author.id]
        } else {
            Vec::new()
        };
        if let Err(err) = self
            .ctx
            .api
            .set_assignees(self.project.id, mr.iid, &assignees)
            .await
        {
            log::warn!("failed to unassign MR !{}: {}", mr.iid, err);
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration) -> Result<(), BotError> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(BotError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

enum CiOutcome {
    Green,
    Red(String),
    Inconclusive,
}
