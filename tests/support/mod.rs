//! In-memory fixtures: a scripted fake platform and a fake worktree.
//!
//! `FakeGitlab` holds the platform state behind a mutex and records every
//! mutation (comments, assignee changes, accepts, pushes) so tests can assert
//! on side effects. `FakeWorktree` emulates git with deterministic fake shas:
//! rebasing head `h` onto base `b` yields `h-on-b`, and re-rebasing an
//! already-rebased head is a no-op, mirroring real rebase idempotence.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mr_lander::config::{MergeOptions, MergeStrategy};
use mr_lander::error::{BotError, MergeRefusal};
use mr_lander::interval::IntervalUnion;
use mr_lander::models::{
    GitLabBranch, GitLabCommit, GitLabMergeRequest, GitLabPipeline, GitLabProject, GitLabUser,
    MergeMethod, MergeRequestApprovals, PipelineStatus,
};
use mr_lander::services::api::{AcceptParams, GitlabApi, MrNote};
use mr_lander::services::merge_job::JobContext;
use mr_lander::services::worktree::Worktree;

pub const BOT_USER_ID: i64 = 2;

/// Deterministic fake sha for a rebase of `head` onto `base`.
pub fn rebased_sha(head: &str, base: &str) -> String {
    if head == base || head.ends_with(&format!("-on-{}", base)) {
        head.to_string()
    } else {
        format!("{}-on-{}", head, base)
    }
}

#[derive(Debug, Clone)]
pub struct PushRecord {
    pub branch: String,
    pub pushed_sha: String,
    pub expected_remote_sha: Option<String>,
    pub force: bool,
    pub skip_ci: bool,
}

#[derive(Default)]
pub struct PlatformState {
    pub users: HashMap<i64, GitLabUser>,
    pub projects: HashMap<i64, GitLabProject>,
    pub mrs: HashMap<(i64, i64), GitLabMergeRequest>,
    pub approvals: HashMap<(i64, i64), MergeRequestApprovals>,
    pub pipelines: HashMap<(i64, String), Vec<GitLabPipeline>>,
    pub branches: HashMap<(i64, String), GitLabBranch>,
    /// Branch tips as the remote sees them, keyed by (project, branch).
    pub tips: HashMap<(i64, String), String>,

    // Recorded side effects.
    pub comments: Vec<(i64, i64, String)>,
    pub assignee_calls: Vec<(i64, i64, Vec<i64>)>,
    pub accept_calls: Vec<(i64, i64, AcceptParams)>,
    pub approve_calls: Vec<(i64, i64, Option<i64>)>,
    pub rebase_calls: Vec<(i64, i64)>,
    pub deleted_branches: Vec<(i64, String)>,
    pub pushes: Vec<PushRecord>,

    /// Scripted responses for accept; empty queue falls through to the
    /// default behavior (sha check, then merge).
    pub accept_script: VecDeque<Result<(), MergeRefusal>>,
    /// Emulate a reviewer pulling the MR back right after our push.
    pub unassign_on_push: bool,
    /// Emulate the platform invalidating approvals when the branch moves.
    pub reset_approvals_on_push: bool,
}

pub struct FakeGitlab {
    pub state: Mutex<PlatformState>,
}

impl FakeGitlab {
    pub fn new() -> Arc<Self> {
        let mut state = PlatformState::default();
        state.users.insert(BOT_USER_ID, user(BOT_USER_ID, "marge-bot"));
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn bot_user(&self) -> GitLabUser {
        self.state.lock().unwrap().users[&BOT_USER_ID].clone()
    }

    pub fn add_project(&self, project: GitLabProject) {
        let mut state = self.state.lock().unwrap();
        state.projects.insert(project.id, project);
    }

    pub fn add_mr(&self, mr: GitLabMergeRequest) {
        let mut state = self.state.lock().unwrap();
        state
            .approvals
            .entry((mr.project_id, mr.iid))
            .or_insert_with(|| MergeRequestApprovals {
                approvals_required: Some(0),
                approvals_left: Some(0),
                approved_by: Vec::new(),
            });
        state.mrs.insert((mr.project_id, mr.iid), mr);
    }

    pub fn set_approvals(&self, project_id: i64, mr_iid: i64, approvals: MergeRequestApprovals) {
        let mut state = self.state.lock().unwrap();
        state.approvals.insert((project_id, mr_iid), approvals);
    }

    pub fn set_tip(&self, project_id: i64, branch: &str, sha: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .tips
            .insert((project_id, branch.to_string()), sha.to_string());
    }

    pub fn tip(&self, project_id: i64, branch: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.tips.get(&(project_id, branch.to_string())).cloned()
    }

    pub fn seed_pipeline(&self, project_id: i64, sha: &str, status: PipelineStatus, url: &str) {
        let mut state = self.state.lock().unwrap();
        let list = state
            .pipelines
            .entry((project_id, sha.to_string()))
            .or_default();
        let id = 100 + list.len() as i64;
        list.push(GitLabPipeline {
            id,
            sha: sha.to_string(),
            ref_name: "irrelevant".to_string(),
            status,
            web_url: url.to_string(),
        });
    }

    pub fn script_accept(&self, response: Result<(), MergeRefusal>) {
        self.state.lock().unwrap().accept_script.push_back(response);
    }

    pub fn comments(&self) -> Vec<(i64, i64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn accept_calls(&self) -> Vec<(i64, i64, AcceptParams)> {
        self.state.lock().unwrap().accept_calls.clone()
    }

    pub fn mr_state(&self, project_id: i64, iid: i64) -> String {
        self.state.lock().unwrap().mrs[&(project_id, iid)]
            .state
            .clone()
    }

    pub fn mr_assignee_ids(&self, project_id: i64, iid: i64) -> Vec<i64> {
        self.state.lock().unwrap().mrs[&(project_id, iid)].assignee_ids()
    }

    /// What the fake worktree does when it "pushes".
    fn apply_push(
        &self,
        project_id: i64,
        branch: &str,
        pushed_sha: &str,
        expected_remote_sha: Option<&str>,
        force: bool,
        skip_ci: bool,
    ) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state.pushes.push(PushRecord {
            branch: branch.to_string(),
            pushed_sha: pushed_sha.to_string(),
            expected_remote_sha: expected_remote_sha.map(str::to_string),
            force,
            skip_ci,
        });

        let mr_key = state
            .mrs
            .iter()
            .find(|(_, mr)| mr.project_id == project_id && mr.source_branch == branch)
            .map(|(key, _)| *key);

        match mr_key {
            Some(key) => {
                let current = state.mrs[&key].sha.clone();
                if let Some(expected) = expected_remote_sha {
                    if current.as_deref() != Some(expected) {
                        return Err(BotError::RemoteMoved {
                            branch: branch.to_string(),
                        });
                    }
                }
                let unassign = state.unassign_on_push;
                let reset_approvals = state.reset_approvals_on_push;
                let mr = state.mrs.get_mut(&key).unwrap();
                mr.sha = Some(pushed_sha.to_string());
                if unassign {
                    mr.assignees.retain(|a| a.id != BOT_USER_ID);
                }
                if reset_approvals {
                    if let Some(approvals) = state.approvals.get_mut(&key) {
                        approvals.approvals_left = Some(1);
                    }
                }
            }
            None => {
                // Scratch branch: just move the remote tip.
                state
                    .tips
                    .insert((project_id, branch.to_string()), pushed_sha.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GitlabApi for FakeGitlab {
    async fn current_user(&self) -> Result<GitLabUser, BotError> {
        Ok(self.bot_user())
    }

    async fn user_by_id(&self, user_id: i64) -> Result<GitLabUser, BotError> {
        let state = self.state.lock().unwrap();
        state
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| BotError::api_full("user not found", 404, "/users"))
    }

    async fn list_projects(&self) -> Result<Vec<GitLabProject>, BotError> {
        let state = self.state.lock().unwrap();
        let mut projects: Vec<_> = state.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }

    async fn get_project(&self, project_id: i64) -> Result<GitLabProject, BotError> {
        let state = self.state.lock().unwrap();
        state
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| BotError::api_full("project not found", 404, "/projects"))
    }

    async fn list_open_mrs(&self, project_id: i64) -> Result<Vec<GitLabMergeRequest>, BotError> {
        let state = self.state.lock().unwrap();
        let mut mrs: Vec<_> = state
            .mrs
            .values()
            .filter(|mr| mr.project_id == project_id && mr.is_open())
            .cloned()
            .collect();
        mrs.sort_by_key(|mr| mr.iid);
        Ok(mrs)
    }

    async fn get_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<GitLabMergeRequest, BotError> {
        let state = self.state.lock().unwrap();
        state
            .mrs
            .get(&(project_id, mr_iid))
            .cloned()
            .ok_or_else(|| BotError::api_full("MR not found", 404, "/merge_requests"))
    }

    async fn list_mr_commits(
        &self,
        _project_id: i64,
        _mr_iid: i64,
    ) -> Result<Vec<GitLabCommit>, BotError> {
        Ok(Vec::new())
    }

    async fn list_mr_notes(
        &self,
        _project_id: i64,
        _mr_iid: i64,
    ) -> Result<Vec<MrNote>, BotError> {
        Ok(Vec::new())
    }

    async fn list_pipelines(
        &self,
        project_id: i64,
        sha: &str,
    ) -> Result<Vec<GitLabPipeline>, BotError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pipelines
            .get(&(project_id, sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_approvals(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<MergeRequestApprovals, BotError> {
        let state = self.state.lock().unwrap();
        state
            .approvals
            .get(&(project_id, mr_iid))
            .cloned()
            .ok_or_else(|| BotError::api_full("approvals not found", 404, "/approvals"))
    }

    async fn get_branch(
        &self,
        project_id: i64,
        branch: &str,
    ) -> Result<GitLabBranch, BotError> {
        let state = self.state.lock().unwrap();
        state
            .branches
            .get(&(project_id, branch.to_string()))
            .cloned()
            .ok_or_else(|| BotError::api_full("branch not found", 404, "/branches"))
    }

    async fn delete_branch(&self, project_id: i64, branch: &str) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state
            .deleted_branches
            .push((project_id, branch.to_string()));
        state.branches.remove(&(project_id, branch.to_string()));
        Ok(())
    }

    async fn comment(&self, project_id: i64, mr_iid: i64, body: &str) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state.comments.push((project_id, mr_iid, body.to_string()));
        Ok(())
    }

    async fn set_assignees(
        &self,
        project_id: i64,
        mr_iid: i64,
        assignee_ids: &[i64],
    ) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state
            .assignee_calls
            .push((project_id, mr_iid, assignee_ids.to_vec()));
        let assignees: Vec<GitLabUser> = assignee_ids
            .iter()
            .map(|id| {
                state
                    .users
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| user(*id, &format!("user-{}", id)))
            })
            .collect();
        if let Some(mr) = state.mrs.get_mut(&(project_id, mr_iid)) {
            mr.assignees = assignees;
        }
        Ok(())
    }

    async fn accept_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        params: &AcceptParams,
    ) -> Result<GitLabMergeRequest, BotError> {
        let mut state = self.state.lock().unwrap();
        state.accept_calls.push((project_id, mr_iid, params.clone()));

        if let Some(scripted) = state.accept_script.pop_front() {
            if let Err(refusal) = scripted {
                return Err(BotError::MergeRefused { refusal });
            }
        } else {
            let current = state
                .mrs
                .get(&(project_id, mr_iid))
                .and_then(|mr| mr.sha.clone());
            if current.as_deref() != Some(params.sha.as_str()) {
                return Err(BotError::MergeRefused {
                    refusal: MergeRefusal::ShaMismatch,
                });
            }
        }

        let target = state.mrs[&(project_id, mr_iid)].target_branch.clone();
        state
            .tips
            .insert((project_id, target), params.sha.clone());
        let mr = state.mrs.get_mut(&(project_id, mr_iid)).unwrap();
        mr.state = "merged".to_string();
        Ok(mr.clone())
    }

    async fn rebase_mr(&self, project_id: i64, mr_iid: i64) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state.rebase_calls.push((project_id, mr_iid));
        // The platform rebases the source branch onto the target tip.
        let tip = state.mrs.get(&(project_id, mr_iid)).and_then(|mr| {
            state
                .tips
                .get(&(project_id, mr.target_branch.clone()))
                .cloned()
        });
        if let (Some(tip), Some(mr)) = (tip, state.mrs.get_mut(&(project_id, mr_iid))) {
            if let Some(current) = mr.sha.clone() {
                mr.sha = Some(rebased_sha(&current, &tip));
            }
            mr.rebase_in_progress = false;
        }
        Ok(())
    }

    async fn approve_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        sudo_user_id: Option<i64>,
    ) -> Result<(), BotError> {
        let mut state = self.state.lock().unwrap();
        state.approve_calls.push((project_id, mr_iid, sudo_user_id));
        if let Some(approvals) = state.approvals.get_mut(&(project_id, mr_iid)) {
            let left = approvals.approvals_left.unwrap_or(0);
            approvals.approvals_left = Some((left - 1).max(0));
        }
        Ok(())
    }
}

/// Fake [`Worktree`]: branch heads are fake shas, every "push" goes through
/// the fake platform so state stays coherent.
pub struct FakeWorktree {
    platform: Arc<FakeGitlab>,
    /// Local branch heads, including scratch branches.
    branch_heads: HashMap<String, String>,
    /// Source branches whose rebase conflicts.
    pub conflict_branches: HashSet<String>,
}

impl FakeWorktree {
    pub fn new(platform: Arc<FakeGitlab>) -> Self {
        Self {
            platform,
            branch_heads: HashMap::new(),
            conflict_branches: HashSet::new(),
        }
    }

    /// Resolve a ref the way the fake repo sees it.
    fn resolve(&self, project_id: i64, rev: &str) -> Result<String, BotError> {
        if let Some(branch) = rev.strip_prefix("origin/") {
            return self
                .platform
                .tip(project_id, branch)
                .ok_or_else(|| BotError::git(format!("unknown remote branch {}", branch), ""));
        }
        if let Some(head) = self.branch_heads.get(rev) {
            return Ok(head.clone());
        }
        // Anything else is taken to be a literal sha.
        Ok(rev.to_string())
    }

    fn source_head(&self, project_id: i64, branch: &str) -> Result<String, BotError> {
        let state = self.platform.state.lock().unwrap();
        state
            .mrs
            .values()
            .find(|mr| mr.project_id == project_id && mr.source_branch == branch)
            .and_then(|mr| mr.sha.clone())
            .ok_or_else(|| BotError::git(format!("unknown source branch {}", branch), ""))
    }
}

#[async_trait]
impl Worktree for FakeWorktree {
    async fn prepare(&mut self, _project: &GitLabProject) -> Result<(), BotError> {
        Ok(())
    }

    async fn fetch_source(
        &mut self,
        _project_id: i64,
        _source_project: &GitLabProject,
    ) -> Result<(), BotError> {
        Ok(())
    }

    async fn rebase(
        &mut self,
        project_id: i64,
        source_branch: &str,
        onto_ref: &str,
        _from_fork: bool,
    ) -> Result<String, BotError> {
        if self.conflict_branches.contains(source_branch) {
            return Err(BotError::RebaseConflict {
                stderr: format!("CONFLICT in {}", source_branch),
            });
        }
        let head = self.source_head(project_id, source_branch)?;
        let base = self.resolve(project_id, onto_ref)?;
        let rebased = rebased_sha(&head, &base);
        self.branch_heads
            .insert(source_branch.to_string(), rebased.clone());
        Ok(rebased)
    }

    async fn rewrite_trailers(
        &mut self,
        _project_id: i64,
        branch: &str,
        _start_commit: &str,
        name: &str,
        _values: &[String],
    ) -> Result<String, BotError> {
        let head = self
            .branch_heads
            .get(branch)
            .cloned()
            .ok_or_else(|| BotError::git("branch not checked out", ""))?;
        let suffix = format!("+{}", name.to_lowercase());
        let tagged = if head.ends_with(&suffix) {
            head
        } else {
            format!("{}{}", head, suffix)
        };
        self.branch_heads.insert(branch.to_string(), tagged.clone());
        Ok(tagged)
    }

    async fn push(
        &mut self,
        project_id: i64,
        branch: &str,
        expect_remote_sha: Option<&str>,
        _to_source_remote: bool,
        force: bool,
        skip_ci: bool,
    ) -> Result<(), BotError> {
        let head = self
            .branch_heads
            .get(branch)
            .cloned()
            .ok_or_else(|| BotError::git("branch not checked out", ""))?;
        self.platform
            .apply_push(project_id, branch, &head, expect_remote_sha, force, skip_ci)
    }

    async fn rev_parse(&mut self, project_id: i64, rev: &str) -> Result<String, BotError> {
        self.resolve(project_id, rev)
    }

    async fn is_ancestor(
        &mut self,
        _project_id: i64,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, BotError> {
        // Fake shas encode their history: `a1-on-m0` descends from `m0`.
        Ok(descendant.contains(ancestor))
    }

    async fn create_branch(
        &mut self,
        project_id: i64,
        branch: &str,
        start_point: &str,
    ) -> Result<(), BotError> {
        let sha = self.resolve(project_id, start_point)?;
        self.branch_heads.insert(branch.to_string(), sha);
        Ok(())
    }

    async fn fast_forward(
        &mut self,
        _project_id: i64,
        branch: &str,
        to: &str,
    ) -> Result<String, BotError> {
        self.branch_heads
            .insert(branch.to_string(), to.to_string());
        Ok(to.to_string())
    }

    async fn cleanup(&mut self, _project_id: i64, _default_branch: &str) -> Result<(), BotError> {
        Ok(())
    }
}

// Fixture builders.

pub fn user(id: i64, username: &str) -> GitLabUser {
    GitLabUser {
        id,
        username: username.to_string(),
        name: username.to_string(),
        email: Some(format!("{}@example.com", username)),
        state: Some("active".to_string()),
        is_admin: None,
    }
}

pub fn project(id: i64, merge_method: MergeMethod) -> GitLabProject {
    GitLabProject {
        id,
        path_with_namespace: "group/widget".to_string(),
        default_branch: "main".to_string(),
        ssh_url_to_repo: "git@gitlab.example.com:group/widget.git".to_string(),
        http_url_to_repo: "https://gitlab.example.com/group/widget.git".to_string(),
        merge_method,
        only_allow_merge_if_pipeline_succeeds: true,
        only_allow_merge_if_all_discussions_are_resolved: false,
        squash_option: None,
        remove_source_branch_after_merge: None,
    }
}

pub fn merge_request(
    project_id: i64,
    iid: i64,
    source_branch: &str,
    target_branch: &str,
    sha: &str,
) -> GitLabMergeRequest {
    GitLabMergeRequest {
        id: iid * 100,
        iid,
        project_id,
        source_project_id: project_id,
        target_project_id: Some(project_id),
        title: format!("MR !{}", iid),
        state: "opened".to_string(),
        source_branch: source_branch.to_string(),
        target_branch: target_branch.to_string(),
        sha: Some(sha.to_string()),
        work_in_progress: false,
        squash: false,
        web_url: format!("https://gitlab.example.com/group/widget/-/merge_requests/{}", iid),
        author: user(9, "dev"),
        assignees: vec![user(BOT_USER_ID, "marge-bot")],
        merge_status: None,
        merge_error: None,
        rebase_in_progress: false,
        blocking_discussions_resolved: Some(true),
        force_remove_source_branch: None,
        should_remove_source_branch: None,
    }
}

pub fn merge_options() -> MergeOptions {
    MergeOptions {
        strategy: MergeStrategy::Rebase,
        add_tested: false,
        add_part_of: false,
        add_reviewers: false,
        impersonate_approvers: false,
        approval_reset_timeout: std::time::Duration::from_secs(0),
        embargo: IntervalUnion::empty(),
        ci_timeout: std::time::Duration::from_secs(30),
        rebase_timeout: std::time::Duration::from_secs(10),
        require_successful_ci: false,
        ci_skipped_is_success: true,
        batch_skip_ci: false,
    }
}

/// A ready-to-use job context over the fakes.
pub fn job_context(platform: &Arc<FakeGitlab>, worktree: FakeWorktree) -> JobContext {
    JobContext {
        api: platform.clone(),
        worktree: Arc::new(tokio::sync::Mutex::new(Box::new(worktree))),
        bot_user: platform.bot_user(),
        options: merge_options(),
        cancel: tokio_util::sync::CancellationToken::new(),
    }
}
