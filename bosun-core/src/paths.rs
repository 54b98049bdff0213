use std::path::PathBuf;

/// Maps a project to the directory its checkout lives in.
///
/// Implemented for any `Fn(workspace_slug, repository, branch) -> PathBuf`.
pub trait ProjectPathResolver: Send + Sync {
    fn project_path(&self, workspace_slug: &str, repository: &str, branch: &str) -> PathBuf;
}

impl<F> ProjectPathResolver for F
where
    F: Fn(&str, &str, &str) -> PathBuf + Send + Sync,
{
    fn project_path(&self, workspace_slug: &str, repository: &str, branch: &str) -> PathBuf {
        self(workspace_slug, repository, branch)
    }
}
