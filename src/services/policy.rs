//! Mergeability policy.
//!
//! Pure predicates over freshly fetched platform state. The job fetches
//! everything, the policy only decides; this keeps every rule unit-testable
//! without a platform.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::MergeOptions;
use crate::models::{
    GitLabBranch, GitLabMergeRequest, GitLabProject, MergeRequestApprovals, SquashOption,
};

/// Cool-down suggested when an embargo is active.
const EMBARGO_RETRY: Duration = Duration::from_secs(5 * 60);

/// Why an MR silently stops being a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Merged, closed, or otherwise not open anymore.
    NotOpen,
    /// The bot is no longer an assignee.
    NotAssigned,
}

/// Outcome of the policy checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Proceed with the merge attempt.
    Ok,
    /// Not a candidate; no comment, no cool-down bookkeeping.
    Drop(DropReason),
    /// Reject for good: post one comment and hand the MR back.
    RejectTerminal(String),
    /// Not now: leave the MR assigned and retry after the cool-down.
    Requeue(String, Duration),
}

/// Everything the policy looks at.
pub struct PolicyInput<'a> {
    pub mr: &'a GitLabMergeRequest,
    pub project: &'a GitLabProject,
    pub approvals: &'a MergeRequestApprovals,
    /// Source branch details, when the job fetched them.
    pub source_branch_info: Option<&'a GitLabBranch>,
    pub bot_user_id: i64,
    pub options: &'a MergeOptions,
    pub now: DateTime<Utc>,
}

/// Apply the checks in order; the first hit wins.
pub fn evaluate(input: &PolicyInput<'_>) -> PolicyVerdict {
    let mr = input.mr;

    if !mr.is_open() {
        return PolicyVerdict::Drop(DropReason::NotOpen);
    }

    if mr.work_in_progress {
        return PolicyVerdict::RejectTerminal("it is a draft".to_string());
    }

    if !mr.is_assigned_to(input.bot_user_id) {
        return PolicyVerdict::Drop(DropReason::NotAssigned);
    }

    if mr.author.id == input.bot_user_id {
        return PolicyVerdict::RejectTerminal(
            "I refuse to merge merge requests I authored myself".to_string(),
        );
    }

    if mr.sha.is_none() {
        return PolicyVerdict::RejectTerminal("it has no commits".to_string());
    }

    let left = input.approvals.approvals_left();
    if left > 0 {
        let approvers = input.approvals.approver_usernames();
        return PolicyVerdict::RejectTerminal(format!(
            "it is missing {} approval(s) (approved by: {})",
            left,
            if approvers.is_empty() {
                "nobody".to_string()
            } else {
                approvers.join(", ")
            }
        ));
    }

    // The strategies that rewrite the source branch need push access to it.
    let rewrites_source = input.options.requests_commit_tagging()
        || input.project.requires_linear_history();
    if rewrites_source {
        if let Some(branch) = input.source_branch_info {
            if !branch.pushable_by_developers() {
                return PolicyVerdict::RejectTerminal(
                    "I can't modify protected branches".to_string(),
                );
            }
        }
    }

    if input.project.only_allow_merge_if_all_discussions_are_resolved
        && !mr.blocking_discussions_resolved()
    {
        return PolicyVerdict::RejectTerminal(
            "it has unresolved discussions".to_string(),
        );
    }

    let will_squash =
        mr.squash || input.project.squash_option == Some(SquashOption::Always);
    if will_squash && input.options.requests_commit_tagging() {
        return PolicyVerdict::RejectTerminal(
            "squashing would discard my commit trailers".to_string(),
        );
    }

    if input.options.embargo.covers(input.now) {
        return PolicyVerdict::Requeue("merge embargo".to_string(), EMBARGO_RETRY);
    }

    PolicyVerdict::Ok
}
