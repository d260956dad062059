//! # tandem-vcs
//!
//! The version-control command surface the sync orchestrator drives, and
//! [`GitCli`], which implements it by shelling out to `git`.

pub mod error;
pub mod git;

use async_trait::async_trait;

use tandem_core::{RelPath, Revision};

pub use error::VcsError;
pub use git::GitCli;

/// Operations the orchestrator needs from a repository.
///
/// Staging and unstaging take one path at a time so the caller decides how a
/// failure inside a batch is handled.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create the repository if needed, with `branch` as the initial branch.
    async fn init(&self, branch: &str) -> Result<(), VcsError>;

    /// Stage every file in the working tree.
    async fn stage_all(&self) -> Result<(), VcsError>;

    async fn stage(&self, path: &RelPath) -> Result<(), VcsError>;

    /// Remove `path` from the index, leaving the working tree alone.
    async fn unstage(&self, path: &RelPath) -> Result<(), VcsError>;

    /// Commit staged and tracked modifications. "Nothing to commit" is not an
    /// error; compare [`Vcs::current_revision`] before and after instead.
    async fn commit(&self, message: &str, allow_empty: bool) -> Result<(), VcsError>;

    /// `None` while the branch has no commits.
    async fn current_revision(&self) -> Result<Option<Revision>, VcsError>;

    /// Point remote `name` at `url`, replacing any previous definition.
    async fn set_remote(&self, name: &str, url: &str) -> Result<(), VcsError>;

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), VcsError>;
}
