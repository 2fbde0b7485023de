//! Single-MR merge job.
//!
//! Drives one merge request through fetch, validate, update branch, wait for
//! rebase, wait for CI, merge, confirm. Every decision is made on freshly
//! fetched platform state; the snapshot that created the job is never
//! trusted. All failures fold into a [`JobOutcome`] here, so the project
//! loop only ever sees outcomes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{MergeOptions, MergeStrategy};
use crate::error::{BotError, MergeRefusal};
use crate::models::{
    GitLabMergeRequest, GitLabProject, GitLabUser, MergeRequestApprovals, PipelineStatus,
};
use crate::services::api::{AcceptParams, GitlabApi};
use crate::services::policy::{self, PolicyInput, PolicyVerdict};
use crate::services::worktree::Worktree;

/// How long to sleep between CI poll iterations.
const CI_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long to sleep between rebase-status poll iterations.
const REBASE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts and spacing for the merge-status settling poll.
const MERGE_STATUS_ATTEMPTS: u32 = 3;
const MERGE_STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive accept refusals tolerated before rejecting for good.
const MAX_ACCEPT_REFUSALS: u32 = 3;
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline for the post-accept merged-state confirmation.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Requeue cool-down hints.
const REQUEUE_SHORT: Duration = Duration::from_secs(30);
const REQUEUE_TRANSIENT: Duration = Duration::from_secs(60);

/// What a finished job reports back to the project loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The MR is merged; the target advanced.
    Merged,
    /// Terminal: one comment was posted and the MR was handed back.
    Rejected(String),
    /// Not now; reconsider after the cool-down. Silent.
    Requeue(Duration),
    /// Shutdown; nothing was said or mutated.
    Cancelled,
}

/// Everything a job needs; deliberately narrow.
#[derive(Clone)]
pub struct JobContext {
    pub api: Arc<dyn GitlabApi>,
    pub worktree: Arc<Mutex<Box<dyn Worktree>>>,
    pub bot_user: GitLabUser,
    pub options: MergeOptions,
    pub cancel: CancellationToken,
}

/// One trailer rewrite to perform after the rebase.
struct TrailerStep {
    name: &'static str,
    values: Vec<String>,
    /// Rewrite the whole `origin/<target>..branch` range, or only the head
    /// commit (`branch^..branch`).
    whole_range: bool,
}

pub struct SingleMergeJob {
    ctx: JobContext,
    project_id: i64,
    mr_iid: i64,
}

impl SingleMergeJob {
    pub fn new(ctx: JobContext, project_id: i64, mr_iid: i64) -> Self {
        Self {
            ctx,
            project_id,
            mr_iid,
        }
    }

    /// Run the job to completion; never returns an error.
    pub async fn execute(&self) -> JobOutcome {
        match self.run().await {
            Ok(outcome) => outcome,
            Err(err) => self.outcome_from_error(err).await,
        }
    }

    async fn run(&self) -> Result<JobOutcome, BotError> {
        // Fetch: never trust the discovery snapshot.
        let mr = self.ctx.api.get_mr(self.project_id, self.mr_iid).await?;
        let project = self.ctx.api.get_project(mr.project_id).await?;
        let approvals = self
            .ctx
            .api
            .get_approvals(mr.project_id, mr.iid)
            .await?;
        let source_branch_info = match self
            .ctx
            .api
            .get_branch(mr.source_project_id, &mr.source_branch)
            .await
        {
            Ok(branch) => Some(branch),
            Err(BotError::Api {
                status_code: Some(404),
                ..
            }) => None,
            Err(other) => return Err(other),
        };

        // Validate.
        let verdict = policy::evaluate(&PolicyInput {
            mr: &mr,
            project: &project,
            approvals: &approvals,
            source_branch_info: source_branch_info.as_ref(),
            bot_user_id: self.ctx.bot_user.id,
            options: &self.ctx.options,
            now: Utc::now(),
        });
        match verdict {
            PolicyVerdict::Ok => {}
            PolicyVerdict::Drop(reason) => {
                log::info!("MR !{} dropped: {:?}", mr.iid, reason);
                return Ok(JobOutcome::Requeue(REQUEUE_SHORT));
            }
            PolicyVerdict::RejectTerminal(reason) => {
                return Ok(self.reject(&mr, &reason).await);
            }
            PolicyVerdict::Requeue(reason, delay) => {
                log::info!("MR !{} deferred: {}", mr.iid, reason);
                return Ok(JobOutcome::Requeue(delay));
            }
        }

        let Some(initial_sha) = mr.sha.clone() else {
            return Ok(JobOutcome::Requeue(REQUEUE_SHORT));
        };

        // Update the source branch according to the project's merge method.
        let expected_head = match self.effective_strategy(&project) {
            MergeStrategy::Merge => initial_sha.clone(),
            MergeStrategy::Rebase => {
                let plan = self.plan_trailers(&mr, &project, &approvals).await?;
                self.update_locally(&mr, &project, &initial_sha, plan)
                    .await?
            }
            MergeStrategy::GitlabRebase => self.update_remotely(&mr, &project).await?,
        };

        // Wait until the platform agrees on the new head.
        let mr = match self.wait_rebased(&mr, &expected_head).await? {
            Some(mr) => mr,
            None => return Ok(JobOutcome::Requeue(REQUEUE_SHORT)),
        };

        // A push may have reset approvals; restore them if we're allowed to.
        if self.ctx.options.impersonate_approvers && expected_head != initial_sha {
            self.reapprove(&mr, &approvals).await?;
        }

        // Wait for CI when either side demands it.
        let needs_ci = project.only_allow_merge_if_pipeline_succeeds
            || self.ctx.options.require_successful_ci;
        if needs_ci {
            if let Some(outcome) = self.wait_for_ci(&mr, &expected_head).await? {
                return Ok(outcome);
            }
        }

        // Merge.
        let remove_source = mr.wants_source_branch_removed()
            || project.remove_source_branch_after_merge.unwrap_or(false);
        match self
            .accept_with_retries(&mr, &expected_head, remove_source, needs_ci)
            .await?
        {
            Some(outcome) => return Ok(outcome),
            None => {}
        }

        // Confirm.
        self.confirm_merged(&mr, remove_source).await
    }

    /// What this job actually does to the source branch.
    ///
    /// A project that merges with merge commits needs no local rewriting, so
    /// the platform-side merge is enough there unless a green pipeline must
    /// match the target tip or trailers are requested. Projects with linear
    /// history (ff, rebase_merge) always go through the configured rebase.
    fn effective_strategy(&self, project: &GitLabProject) -> MergeStrategy {
        match self.ctx.options.strategy {
            MergeStrategy::Merge => MergeStrategy::Merge,
            configured => {
                if !project.requires_linear_history()
                    && !project.only_allow_merge_if_pipeline_succeeds
                    && !self.ctx.options.requests_commit_tagging()
                {
                    MergeStrategy::Merge
                } else {
                    configured
                }
            }
        }
    }

    /// Gather trailer values before touching the worktree; everything here is
    /// HTTP and must not run under the worktree lock.
    async fn plan_trailers(
        &self,
        mr: &GitLabMergeRequest,
        project: &GitLabProject,
        approvals: &MergeRequestApprovals,
    ) -> Result<Vec<TrailerStep>, BotError> {
        let options = &self.ctx.options;
        let mut plan = Vec::new();

        if options.add_reviewers {
            let values = self.reviewer_trailer_values(mr, approvals).await?;
            plan.push(TrailerStep {
                name: "Reviewed-by",
                values,
                whole_range: true,
            });
        }

        if options.add_tested && project.only_allow_merge_if_pipeline_succeeds {
            plan.push(TrailerStep {
                name: "Tested-by",
                values: vec![format!("{} <{}>", self.ctx.bot_user.name, mr.web_url)],
                whole_range: false,
            });
        }

        if options.add_part_of {
            plan.push(TrailerStep {
                name: "Part-of",
                values: vec![format!("<{}>", mr.web_url)],
                whole_range: true,
            });
        }

        Ok(plan)
    }

    /// Resolve approver identities for Reviewed-by trailers.
    ///
    /// Fails the MR when an approver has no public email, and when nobody but
    /// the commit authors approved.
    async fn reviewer_trailer_values(
        &self,
        mr: &GitLabMergeRequest,
        approvals: &MergeRequestApprovals,
    ) -> Result<Vec<String>, BotError> {
        let mut users = Vec::new();
        for uid in approvals.approver_ids() {
            users.push(self.ctx.api.user_by_id(uid).await?);
        }

        let commits = self.ctx.api.list_mr_commits(mr.project_id, mr.iid).await?;
        let author_emails: Vec<&str> = commits
            .iter()
            .filter_map(|c| c.author_email.as_deref())
            .collect();
        let self_reviewed = users
            .iter()
            .any(|u| matches!(&u.email, Some(email) if author_emails.contains(&email.as_str())));
        if self_reviewed && users.len() <= 1 {
            return Err(BotError::api(
                "commits require at least one independent reviewer",
            ));
        }

        let mut values = Vec::new();
        for user in &users {
            match &user.email {
                Some(email) => values.push(format!("{} <{}>", user.name, email)),
                None => {
                    return Err(BotError::api(format!(
                        "approver @{} has no public email, cannot write Reviewed-by",
                        user.username
                    )))
                }
            }
        }
        Ok(values)
    }

    /// Rebase + trailers + conditional push under the worktree lock.
    ///
    /// The lock is held for exactly this scope and covers no HTTP.
    async fn update_locally(
        &self,
        mr: &GitLabMergeRequest,
        project: &GitLabProject,
        initial_sha: &str,
        plan: Vec<TrailerStep>,
    ) -> Result<String, BotError> {
        let source_project = if mr.is_from_fork() {
            Some(self.ctx.api.get_project(mr.source_project_id).await?)
        } else {
            None
        };

        let mut worktree = self.ctx.worktree.lock().await;
        let result = self
            .update_locally_locked(
                worktree.as_mut(),
                mr,
                project,
                source_project.as_ref(),
                initial_sha,
                plan,
            )
            .await;
        if let Err(cleanup_err) = worktree
            .cleanup(project.id, &project.default_branch)
            .await
        {
            log::warn!(
                "worktree cleanup for {} failed: {}",
                project.path_with_namespace,
                cleanup_err
            );
        }
        result
    }

    async fn update_locally_locked(
        &self,
        worktree: &mut dyn Worktree,
        mr: &GitLabMergeRequest,
        project: &GitLabProject,
        source_project: Option<&GitLabProject>,
        initial_sha: &str,
        plan: Vec<TrailerStep>,
    ) -> Result<String, BotError> {
        worktree.prepare(project).await?;
        let from_fork = source_project.is_some();
        if let Some(source) = source_project {
            worktree.fetch_source(project.id, source).await?;
        }

        let target_ref = format!("origin/{}", mr.target_branch);
        let target_sha = worktree.rev_parse(project.id, &target_ref).await?;

        let rebased = worktree
            .rebase(project.id, &mr.source_branch, &target_ref, from_fork)
            .await?;
        if rebased == target_sha {
            return Err(BotError::api(format!(
                "these changes already exist in branch `{}`",
                mr.target_branch
            )));
        }

        let mut head = rebased;
        for step in &plan {
            let start: String = if step.whole_range {
                target_ref.clone()
            } else {
                format!("{}^", mr.source_branch)
            };
            head = worktree
                .rewrite_trailers(
                    project.id,
                    &mr.source_branch,
                    &start,
                    step.name,
                    &step.values,
                )
                .await?;
        }

        if head != initial_sha {
            worktree
                .push(
                    project.id,
                    &mr.source_branch,
                    Some(initial_sha),
                    from_fork,
                    false,
                    false,
                )
                .await?;
        }
        Ok(head)
    }

    /// Platform-side rebase: compute the expected result locally, then ask
    /// GitLab to do the actual rewrite.
    async fn update_remotely(
        &self,
        mr: &GitLabMergeRequest,
        project: &GitLabProject,
    ) -> Result<String, BotError> {
        let source_project = if mr.is_from_fork() {
            Some(self.ctx.api.get_project(mr.source_project_id).await?)
        } else {
            None
        };

        let expected = {
            let mut worktree = self.ctx.worktree.lock().await;
            let result = async {
                worktree.prepare(project).await?;
                if let Some(source) = source_project.as_ref() {
                    worktree.fetch_source(project.id, source).await?;
                }
                worktree
                    .rebase(
                        project.id,
                        &mr.source_branch,
                        &format!("origin/{}", mr.target_branch),
                        source_project.is_some(),
                    )
                    .await
            }
            .await;
            if let Err(cleanup_err) = worktree
                .cleanup(project.id, &project.default_branch)
                .await
            {
                log::warn!(
                    "worktree cleanup for {} failed: {}",
                    project.path_with_namespace,
                    cleanup_err
                );
            }
            result?
        };

        self.ctx.api.rebase_mr(mr.project_id, mr.iid).await?;
        Ok(expected)
    }

    /// Poll until the platform reports our head and no rebase in progress.
    ///
    /// Returns the refreshed MR, or None when the job must silently stop
    /// (reassigned away, vanished, or the wait timed out).
    async fn wait_rebased(
        &self,
        mr: &GitLabMergeRequest,
        expected_head: &str,
    ) -> Result<Option<GitLabMergeRequest>, BotError> {
        let deadline = tokio::time::Instant::now() + self.ctx.options.rebase_timeout;

        loop {
            let fresh = self.ctx.api.get_mr(mr.project_id, mr.iid).await?;

            if !fresh.is_assigned_to(self.ctx.bot_user.id) {
                log::info!("MR !{} was reassigned away mid-job, aborting", mr.iid);
                return Ok(None);
            }
            if !fresh.is_open() {
                log::info!("MR !{} left the open state mid-job", mr.iid);
                return Ok(None);
            }
            if fresh.sha.as_deref() == Some(expected_head) && !fresh.rebase_in_progress {
                return Ok(Some(fresh));
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!(
                    "MR !{} did not settle on {} in time",
                    mr.iid,
                    expected_head
                );
                return Ok(None);
            }
            self.sleep_or_cancel(REBASE_POLL_INTERVAL).await?;
        }
    }

    /// Wait for approvals to reset after our push, then restore them by
    /// approving as each original approver.
    async fn reapprove(
        &self,
        mr: &GitLabMergeRequest,
        approvals: &MergeRequestApprovals,
    ) -> Result<(), BotError> {
        let deadline = tokio::time::Instant::now() + self.ctx.options.approval_reset_timeout;
        loop {
            let fresh = self.ctx.api.get_approvals(mr.project_id, mr.iid).await?;
            if !fresh.sufficient() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // Approvals survived the push; nothing to restore.
                return Ok(());
            }
            self.sleep_or_cancel(Duration::from_secs(5)).await?;
        }

        log::info!("restoring approvals on MR !{}", mr.iid);
        for uid in approvals.approver_ids() {
            self.ctx
                .api
                .approve_mr(mr.project_id, mr.iid, Some(uid))
                .await?;
        }
        Ok(())
    }

    /// Poll pipelines for the pushed head. Returns Some(outcome) to end the
    /// job, None to proceed to the merge.
    async fn wait_for_ci(
        &self,
        mr: &GitLabMergeRequest,
        head: &str,
    ) -> Result<Option<JobOutcome>, BotError> {
        let deadline = tokio::time::Instant::now() + self.ctx.options.ci_timeout;
        log::info!("waiting for CI on MR !{} ({})", mr.iid, head);

        loop {
            let pipelines = self.ctx.api.list_pipelines(mr.project_id, head).await?;
            // Newest pipeline wins.
            let newest = pipelines.iter().max_by_key(|p| p.id);

            if let Some(pipeline) = newest {
                match pipeline.status {
                    PipelineStatus::Success => {
                        log::info!("CI for MR !{} passed: {}", mr.iid, pipeline.web_url);
                        return Ok(None);
                    }
                    PipelineStatus::Skipped => {
                        if self.ctx.options.ci_skipped_is_success {
                            log::info!("CI for MR !{} skipped, proceeding", mr.iid);
                            return Ok(None);
                        }
                        return Ok(Some(
                            self.reject(
                                mr,
                                &format!("CI was skipped: {}", pipeline.web_url),
                            )
                            .await,
                        ));
                    }
                    PipelineStatus::Failed => {
                        return Ok(Some(
                            self.reject(mr, &format!("CI failed: {}", pipeline.web_url))
                                .await,
                        ));
                    }
                    PipelineStatus::Canceled => {
                        return Ok(Some(
                            self.reject(
                                mr,
                                &format!("someone canceled the CI: {}", pipeline.web_url),
                            )
                            .await,
                        ));
                    }
                    // Manual stages need a human; waiting until the timeout
                    // requeues rather than rejects.
                    PipelineStatus::Manual
                    | PipelineStatus::Created
                    | PipelineStatus::WaitingForResource
                    | PipelineStatus::Preparing
                    | PipelineStatus::Pending
                    | PipelineStatus::Running
                    | PipelineStatus::Scheduled
                    | PipelineStatus::Unknown => {}
                }
            } else {
                log::warn!("no pipeline listed yet for {} on MR !{}", head, mr.iid);
            }

            if tokio::time::Instant::now() >= deadline {
                log::warn!("CI for MR !{} took too long, requeueing", mr.iid);
                return Ok(Some(JobOutcome::Requeue(REQUEUE_TRANSIENT)));
            }
            self.sleep_or_cancel(CI_POLL_INTERVAL).await?;
        }
    }

    /// Call accept, tolerating a bounded number of eventual-consistency
    /// refusals. Returns Some(outcome) to end the job, None to confirm.
    async fn accept_with_retries(
        &self,
        mr: &GitLabMergeRequest,
        head: &str,
        remove_source: bool,
        needs_ci: bool,
    ) -> Result<Option<JobOutcome>, BotError> {
        // Let the async merge_status settle before the first attempt.
        if let Some(outcome) = self.wait_merge_status(mr).await? {
            return Ok(Some(outcome));
        }

        let params = AcceptParams {
            sha: head.to_string(),
            should_remove_source_branch: remove_source,
            merge_when_pipeline_succeeds: needs_ci,
            squash: mr.squash,
            squash_commit_message: None,
        };

        let mut refusals = 0;
        loop {
            match self.ctx.api.accept_mr(mr.project_id, mr.iid, &params).await {
                Ok(_) => return Ok(None),
                Err(BotError::MergeRefused { refusal }) => match refusal {
                    MergeRefusal::ShaMismatch => {
                        // The MR moved under us; the loop will re-pick it.
                        log::info!("MR !{} moved while merging, requeueing", mr.iid);
                        return Ok(Some(JobOutcome::Requeue(REQUEUE_SHORT)));
                    }
                    MergeRefusal::NotMergeable | MergeRefusal::PipelineNotSucceeded => {
                        refusals += 1;
                        if refusals >= MAX_ACCEPT_REFUSALS {
                            return Ok(Some(
                                self.reject(
                                    mr,
                                    &format!("GitLab kept refusing to merge: {}", refusal),
                                )
                                .await,
                            ));
                        }
                        log::debug!(
                            "MR !{} refused ({}), retry {}/{}",
                            mr.iid,
                            refusal,
                            refusals,
                            MAX_ACCEPT_REFUSALS
                        );
                        self.sleep_or_cancel(ACCEPT_RETRY_INTERVAL).await?;

                        // Re-check we are still supposed to act.
                        let fresh = self.ctx.api.get_mr(mr.project_id, mr.iid).await?;
                        if !fresh.is_assigned_to(self.ctx.bot_user.id) || !fresh.is_open() {
                            return Ok(Some(JobOutcome::Requeue(REQUEUE_SHORT)));
                        }
                    }
                    MergeRefusal::BranchCannotBeMerged => {
                        return Ok(Some(
                            self.reject(mr, "it needs a manual rebase").await,
                        ));
                    }
                    MergeRefusal::Other(message) => {
                        return Ok(Some(self.reject(mr, &message).await));
                    }
                },
                Err(BotError::Api {
                    message,
                    status_code: Some(code),
                    ..
                }) if (400..500).contains(&code) => {
                    return Ok(Some(self.reject(mr, &message).await));
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Poll the asynchronous merge_status field out of `unchecked`.
    async fn wait_merge_status(
        &self,
        mr: &GitLabMergeRequest,
    ) -> Result<Option<JobOutcome>, BotError> {
        for _ in 0..MERGE_STATUS_ATTEMPTS {
            let fresh = self.ctx.api.get_mr(mr.project_id, mr.iid).await?;
            if !fresh.is_assigned_to(self.ctx.bot_user.id) {
                return Ok(Some(JobOutcome::Requeue(REQUEUE_SHORT)));
            }
            match fresh.merge_status.as_deref() {
                Some("cannot_be_merged") => {
                    return Ok(Some(
                        self.reject(mr, "GitLab believes this cannot be merged").await,
                    ));
                }
                Some("unchecked") => {
                    self.sleep_or_cancel(MERGE_STATUS_INTERVAL).await?;
                }
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Poll until the MR reports merged.
    async fn confirm_merged(
        &self,
        mr: &GitLabMergeRequest,
        remove_source: bool,
    ) -> Result<JobOutcome, BotError> {
        let deadline = tokio::time::Instant::now() + CONFIRM_TIMEOUT;

        loop {
            let fresh = self.ctx.api.get_mr(mr.project_id, mr.iid).await?;
            match fresh.state.as_str() {
                "merged" => break,
                "closed" => {
                    return Ok(self.reject(mr, "the merge vanished (MR was closed)").await);
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(JobOutcome::Requeue(REQUEUE_TRANSIENT));
            }
            self.sleep_or_cancel(CONFIRM_POLL_INTERVAL).await?;
        }

        if remove_source {
            match self
                .ctx
                .api
                .get_branch(mr.source_project_id, &mr.source_branch)
                .await
            {
                Err(BotError::Api {
                    status_code: Some(404),
                    ..
                }) => {}
                Ok(_) => {
                    log::warn!(
                        "source branch {} of MR !{} survived the merge",
                        mr.source_branch,
                        mr.iid
                    );
                }
                Err(err) => {
                    log::warn!(
                        "could not verify source branch deletion for MR !{}: {}",
                        mr.iid,
                        err
                    );
                }
            }
        }

        log::info!("MR !{} merged", mr.iid);
        Ok(JobOutcome::Merged)
    }

    /// Terminal rejection: exactly one comment, then hand the MR back to its
    /// author (or just unassign when the bot authored it).
    async fn reject(&self, mr: &GitLabMergeRequest, reason: &str) -> JobOutcome {
        let text = format!("I couldn't merge this: {}.", reason);
        if let Err(err) = self.ctx.api.comment(mr.project_id, mr.iid, &text).await {
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
            .set_assignees(mr.project_id, mr.iid, &assignees)
            .await
        {
            log::warn!("failed to unassign MR !{}: {}", mr.iid, err);
        }

        JobOutcome::Rejected(reason.to_string())
    }

    /// Map errors escaping the state machine into an outcome.
    async fn outcome_from_error(&self, err: BotError) -> JobOutcome {
        match err {
            BotError::Cancelled => JobOutcome::Cancelled,
            BotError::Network { .. } | BotError::Timeout { .. } => {
                log::warn!("MR !{}: transient failure: {}", self.mr_iid, err);
                JobOutcome::Requeue(REQUEUE_TRANSIENT)
            }
            BotError::RemoteMoved { .. } => {
                // Someone pushed while we were rebasing; retry against the
                // new tip next tick.
                log::info!("MR !{}: {}", self.mr_iid, err);
                JobOutcome::Requeue(REQUEUE_SHORT)
            }
            BotError::RebaseConflict { .. } => {
                self.reject_by_iid("it needs a manual rebase (I hit conflicts)")
                    .await
            }
            BotError::Git { ref message, ref stderr } => {
                log::error!("MR !{}: {} ({})", self.mr_iid, message, stderr.trim());
                self.reject_by_iid("I hit a git failure, check my logs").await
            }
            BotError::MergeRefused { refusal } => match refusal {
                MergeRefusal::ShaMismatch => JobOutcome::Requeue(REQUEUE_SHORT),
                other => self.reject_by_iid(&other.to_string()).await,
            },
            BotError::Unauthorized { .. } => {
                log::warn!("MR !{}: {}", self.mr_iid, err);
                JobOutcome::Requeue(REQUEUE_TRANSIENT)
            }
            BotError::Api {
                ref message,
                status_code,
                ..
            } => {
                if status_code == Some(404) {
                    // The MR (or something it references) is gone.
                    log::info!("MR !{} vanished: {}", self.mr_iid, message);
                    JobOutcome::Requeue(REQUEUE_SHORT)
                } else {
                    self.reject_by_iid(message).await
                }
            }
            BotError::Config { .. } => {
                log::error!("MR !{}: {}", self.mr_iid, err);
                JobOutcome::Requeue(REQUEUE_TRANSIENT)
            }
        }
    }

    /// Reject when we no longer hold a fresh MR payload.
    async fn reject_by_iid(&self, reason: &str) -> JobOutcome {
        match self.ctx.api.get_mr(self.project_id, self.mr_iid).await {
            Ok(mr) => self.reject(&mr, reason).await,
            Err(err) => {
                log::warn!(
                    "MR !{}: wanted to reject ({}) but could not fetch it: {}",
                    self.mr_iid,
                    reason,
                    err
                );
                JobOutcome::Rejected(reason.to_string())
            }
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration) -> Result<(), BotError> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(BotError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
