use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Oid, Repository, Signature, build::CheckoutBuilder};

use crate::config::FOREMAN_DIR;

/// Version-controlled view of the project tree.
pub trait Workspace: Send + Sync {
    /// Record the current tree and return a reference to it.
    fn snapshot(&self, label: &str) -> Result<String>;

    /// Whether `reference` resolves to a recorded tree.
    fn contains(&self, reference: &str) -> bool;

    /// Files that differ between the working tree and `reference`.
    fn changed_files(&self, reference: &str) -> Result<Vec<PathBuf>>;

    /// Make the working tree match `reference`.
    fn restore(&self, reference: &str) -> Result<()>;

    /// Drop the snapshot taken under `label`. Unknown labels are ignored.
    fn discard(&self, label: &str) -> Result<()>;
}

/// Git-backed workspace.
///
/// Snapshots are commits of the whole working tree (minus ignored files and
/// the `.foreman` directory) kept alive by a ref under
/// `refs/foreman/checkpoints/`. The user's branch and HEAD never move.
pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    pub fn open(root: &Path) -> Result<Self> {
        Repository::open(root).context("Failed to open git repository")?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open the repository at `root`, initializing one if none exists.
    ///
    /// Also makes `.foreman/` ignore itself so restores never remove the
    /// state database or checkpoint artifacts as untracked files.
    pub fn init_or_open(root: &Path) -> Result<Self> {
        if Repository::open(root).is_err() {
            Repository::init(root).context("Failed to initialize git repository")?;
            tracing::info!(root = %root.display(), "Initialized git repository");
        }
        let foreman = root.join(FOREMAN_DIR);
        let ignore = foreman.join(".gitignore");
        if !ignore.exists() {
            std::fs::create_dir_all(&foreman)
                .with_context(|| format!("Failed to create {}", foreman.display()))?;
            std::fs::write(&ignore, "*\n")
                .with_context(|| format!("Failed to write {}", ignore.display()))?;
        }
        Self::open(root)
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.root).context("Failed to open git repository")
    }

    fn find_tree<'r>(repo: &'r Repository, reference: &str) -> Result<git2::Tree<'r>> {
        let oid = Oid::from_str(reference)
            .with_context(|| format!("Invalid workspace reference '{}'", reference))?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Workspace reference {} not found", reference))?;
        commit.tree().context("Failed to read snapshot tree")
    }
}

impl Workspace for GitWorkspace {
    fn snapshot(&self, label: &str) -> Result<String> {
        let repo = self.repo()?;
        // The in-memory index is dropped without writing, so the user's
        // staging area is untouched.
        let mut index = repo.index().context("Failed to read git index")?;
        let mut skip_foreman = |path: &Path, _spec: &[u8]| -> i32 {
            if path.starts_with(FOREMAN_DIR) { 1 } else { 0 }
        };
        index
            .add_all(
                ["*"].iter(),
                git2::IndexAddOption::DEFAULT,
                Some(&mut skip_foreman as &mut git2::IndexMatchedPath<'_>),
            )
            .context("Failed to stage working tree")?;
        index
            .update_all(["*"].iter(), None)
            .context("Failed to record deletions")?;
        let tree_id = index.write_tree().context("Failed to write tree")?;
        let tree = repo.find_tree(tree_id)?;

        let sig = Signature::now("foreman", "foreman@localhost")?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let message = format!("[foreman] checkpoint {}", label);
        let commit_id = repo
            .commit(None, &sig, &sig, &message, &tree, &parents)
            .context("Failed to create snapshot commit")?;
        repo.reference(
            &format!("refs/foreman/checkpoints/{}", label),
            commit_id,
            true,
            &message,
        )
        .context("Failed to create snapshot ref")?;

        tracing::debug!(label, commit = %commit_id, "Workspace snapshot created");
        Ok(commit_id.to_string())
    }

    fn contains(&self, reference: &str) -> bool {
        self.repo()
            .ok()
            .is_some_and(|repo| Self::find_tree(&repo, reference).is_ok())
    }

    fn changed_files(&self, reference: &str) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let tree = Self::find_tree(&repo, reference)?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo
            .diff_tree_to_workdir(Some(&tree), Some(&mut opts))
            .context("Failed to diff workspace")?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            let path = match delta.status() {
                Delta::Deleted => delta.old_file().path(),
                _ => delta.new_file().path(),
            };
            if let Some(path) = path
                && !path.starts_with(FOREMAN_DIR)
            {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn restore(&self, reference: &str) -> Result<()> {
        let repo = self.repo()?;
        let tree = Self::find_tree(&repo, reference)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.checkout_tree(tree.as_object(), Some(&mut checkout))
            .with_context(|| format!("Failed to check out workspace reference {}", reference))?;
        tracing::info!(reference, "Workspace restored");
        Ok(())
    }

    fn discard(&self, label: &str) -> Result<()> {
        let repo = self.repo()?;
        let name = format!("refs/foreman/checkpoints/{}", label);
        match repo.find_reference(&name) {
            Ok(mut reference) => {
                reference
                    .delete()
                    .with_context(|| format!("Failed to delete {}", name))?;
                tracing::debug!(label, "Workspace snapshot discarded");
                Ok(())
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to look up {}", name)),
        }
    }
}
