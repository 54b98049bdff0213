use std::path::{Path, PathBuf};

use bosun_core::ProjectPathResolver;
use bosun_model::repository_name;

/// Lays checkouts out as `<root>/<workspace slug>/<repository name>`.
///
/// The branch does not take part in the path: one checkout per repository
/// and workspace.
#[derive(Debug, Clone)]
pub struct LayoutResolver {
    root: PathBuf,
}

impl LayoutResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ProjectPathResolver for LayoutResolver {
    fn project_path(&self, workspace_slug: &str, repository: &str, _branch: &str) -> PathBuf {
        self.root
            .join(workspace_slug)
            .join(repository_name(repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_workspace_and_repository_name() {
        let resolver = LayoutResolver::new("/home/dev/bosun/workspaces");
        assert_eq!(
            resolver.project_path("platform", "git@github.com:acme/api.git", "main"),
            PathBuf::from("/home/dev/bosun/workspaces/platform/api")
        );
        assert_eq!(
            resolver.project_path("platform", "https://example.com/acme/web/", "dev"),
            PathBuf::from("/home/dev/bosun/workspaces/platform/web")
        );
    }
}
