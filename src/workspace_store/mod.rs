//! Workspace Store (§4.B) — a per-module, git-backed versioned file tree.
//!
//! Grounded directly against `git2`'s documented API (the pack carries no
//! full git2 example to imitate); method shapes follow the Workspace Store
//! operation list in §4.B.

use crate::error::{CoreError, Result};
use git2::{Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};

const PLATFORM_AUTHOR_NAME: &str = "ling-core platform";
const PLATFORM_AUTHOR_EMAIL: &str = "platform@ling-core.local";

pub struct CommitOptions<'a> {
    pub message: &'a str,
    pub author_name: Option<&'a str>,
    pub author_email: Option<&'a str>,
}

pub struct WorkspaceStore {
    base_path: PathBuf,
}

impl WorkspaceStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn root(&self, workspace_name: &str) -> PathBuf {
        self.base_path.join(workspace_name)
    }

    /// Materializes a new workspace from a kit's seed archive and commits
    /// the initial tree with a fixed synthetic author (§3 "initialized as
    /// a versioned store with one initial commit authored by the
    /// platform").
    ///
    /// `unpack` extracts `seed_bytes` into the freshly created workspace
    /// root — callers pass `kit::archive::extract` or an equivalent so the
    /// same path-traversal guard applies to workspace seeds as to kits.
    pub fn create<F>(&self, workspace_name: &str, seed_bytes: &[u8], unpack: F) -> Result<()>
    where
        F: FnOnce(&[u8], &Path) -> Result<()>,
    {
        let root = self.root(workspace_name);
        if root.exists() {
            return Err(CoreError::InvalidPath(format!(
                "workspace {workspace_name:?} already exists"
            )));
        }
        fs::create_dir_all(&root)
            .map_err(|e| CoreError::DbError(format!("failed to create {root:?}: {e}")))?;

        let result = self.create_inner(&root, seed_bytes, unpack);
        if result.is_err() {
            let _ = fs::remove_dir_all(&root);
        }
        result
    }

    fn create_inner<F>(&self, root: &Path, seed_bytes: &[u8], unpack: F) -> Result<()>
    where
        F: FnOnce(&[u8], &Path) -> Result<()>,
    {
        if !seed_bytes.is_empty() {
            unpack(seed_bytes, root)?;
        }
        let repo = Repository::init(root).map_err(|e| CoreError::DbError(e.to_string()))?;
        self.commit_all(
            &repo,
            CommitOptions {
                message: "initial commit",
                author_name: None,
                author_email: None,
            },
        )?;
        Ok(())
    }

    /// Lists every tracked file path relative to the workspace root,
    /// excluding the `.git` metadata directory.
    pub fn list_files(&self, workspace_name: &str) -> Result<Vec<String>> {
        let root = self.root(workspace_name);
        let mut out = Vec::new();
        self.walk(&root, &root, &mut out)?;
        Ok(out)
    }

    fn walk(&self, root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| CoreError::DbError(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::DbError(e.to_string()))?;
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                continue;
            }
            if path.is_dir() {
                self.walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_| CoreError::InvalidPath(format!("{path:?} not under {root:?}")))?;
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    pub fn delete(&self, workspace_name: &str) -> Result<()> {
        let root = self.root(workspace_name);
        if !root.is_dir() {
            return Err(CoreError::InvalidPath(format!(
                "workspace {workspace_name:?} does not exist"
            )));
        }
        fs::remove_dir_all(&root).map_err(|e| CoreError::DbError(e.to_string()))
    }

    /// Commits the current working tree state. Returns the new commit's
    /// object id as a hex string.
    pub fn commit(&self, workspace_name: &str, opts: CommitOptions<'_>) -> Result<String> {
        let repo = self.open_repo(workspace_name)?;
        self.commit_all(&repo, opts)
    }

    fn commit_all(&self, repo: &Repository, opts: CommitOptions<'_>) -> Result<String> {
        let mut index = repo.index().map_err(|e| CoreError::DbError(e.to_string()))?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(|e| CoreError::DbError(e.to_string()))?;
        index.write().map_err(|e| CoreError::DbError(e.to_string()))?;
        let tree_id = index.write_tree().map_err(|e| CoreError::DbError(e.to_string()))?;
        let tree = repo.find_tree(tree_id).map_err(|e| CoreError::DbError(e.to_string()))?;

        let signature = Signature::now(
            opts.author_name.unwrap_or(PLATFORM_AUTHOR_NAME),
            opts.author_email.unwrap_or(PLATFORM_AUTHOR_EMAIL),
        )
        .map_err(|e| CoreError::DbError(e.to_string()))?;

        let parent_commit = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();

        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, opts.message, &tree, &parents)
            .map_err(|e| CoreError::DbError(e.to_string()))?;
        Ok(oid.to_string())
    }

    /// Reads `rel_path` inside the workspace, subject to the same
    /// path-traversal guard as [`Self::update_file`].
    pub fn read_file(&self, workspace_name: &str, rel_path: &str) -> Result<Vec<u8>> {
        let root = self.root(workspace_name);
        let target = safe_join(&root, rel_path)?;
        fs::read(&target).map_err(|e| CoreError::InvalidPath(format!("reading {rel_path:?}: {e}")))
    }

    /// Writes `content` to `rel_path` inside the workspace. Creates a
    /// `.bak` sibling before writing and restores it if the write fails
    /// partway (§4.B, §8 round-trip property).
    pub fn update_file(&self, workspace_name: &str, rel_path: &str, content: &[u8]) -> Result<()> {
        let root = self.root(workspace_name);
        let target = safe_join(&root, rel_path)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::DbError(e.to_string()))?;
        }

        let backup = target.with_extension(backup_extension(&target));
        let had_original = target.exists();
        if had_original {
            fs::copy(&target, &backup).map_err(|e| CoreError::DbError(e.to_string()))?;
        }

        match fs::write(&target, content) {
            Ok(()) => {
                if had_original {
                    let _ = fs::remove_file(&backup);
                }
                Ok(())
            }
            Err(write_err) => {
                if had_original {
                    let _ = fs::rename(&backup, &target);
                } else {
                    let _ = fs::remove_file(&target);
                }
                Err(CoreError::DbError(format!(
                    "failed to write {target:?}: {write_err}"
                )))
            }
        }
    }

    /// Registers `child_path` (an existing directory elsewhere on disk) as
    /// a git submodule of `parent_workspace` at `sub_path`. Idempotent:
    /// re-adding the same `sub_path` is a no-op (§8 round-trip property).
    pub fn add_submodule(
        &self,
        parent_workspace: &str,
        child_url_or_path: &str,
        sub_path: &str,
    ) -> Result<()> {
        let repo = self.open_repo(parent_workspace)?;
        let root = self.root(parent_workspace);
        let target = safe_join(&root, sub_path)?;
        if target.exists() {
            return Ok(());
        }
        let mut submodule = repo
            .submodule(child_url_or_path, Path::new(sub_path), true)
            .map_err(|e| CoreError::DbError(e.to_string()))?;
        submodule
            .finalize()
            .map_err(|e| CoreError::DbError(e.to_string()))?;
        Ok(())
    }

    pub fn remove_submodule(&self, parent_workspace: &str, sub_path: &str) -> Result<()> {
        let root = self.root(parent_workspace);
        let target = safe_join(&root, sub_path)?;
        if !target.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&target).map_err(|e| CoreError::DbError(e.to_string()))?;

        let gitmodules = root.join(".gitmodules");
        if gitmodules.is_file() {
            let content = fs::read_to_string(&gitmodules).unwrap_or_default();
            let filtered: String = content
                .split("[submodule")
                .filter(|block| !block.contains(&format!("path = {sub_path}")))
                .enumerate()
                .map(|(i, block)| if i == 0 { block.to_string() } else { format!("[submodule{block}") })
                .collect();
            let _ = fs::write(&gitmodules, filtered);
        }
        Ok(())
    }

    pub fn get_active_branch(&self, workspace_name: &str) -> Result<String> {
        let repo = self.open_repo(workspace_name)?;
        let head = repo.head().map_err(|e| CoreError::DbError(e.to_string()))?;
        Ok(head
            .shorthand()
            .unwrap_or("HEAD")
            .to_string())
    }

    fn open_repo(&self, workspace_name: &str) -> Result<Repository> {
        let root = self.root(workspace_name);
        Repository::open(&root).map_err(|e| {
            CoreError::InvalidPath(format!("workspace {workspace_name:?} is not a repository: {e}"))
        })
    }
}

fn backup_extension(target: &Path) -> std::ffi::OsString {
    let mut ext = target
        .extension()
        .map(|e| e.to_os_string())
        .unwrap_or_default();
    if !ext.is_empty() {
        ext.push(".");
    }
    ext.push("bak");
    ext
}

/// Resolves `rel_path` against `root`, rejecting any path that would
/// escape it (§4.B "any `..` escape fails with `InvalidPath`").
fn safe_join(root: &Path, rel_path: &str) -> Result<PathBuf> {
    use std::path::Component;

    if Path::new(rel_path).is_absolute() {
        return Err(CoreError::InvalidPath(format!(
            "{rel_path:?} must be relative to the workspace root"
        )));
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(CoreError::InvalidPath(format!(
                    "{rel_path:?} escapes the workspace root"
                )))
            }
            other => {
                return Err(CoreError::InvalidPath(format!(
                    "{rel_path:?} contains disallowed component {other:?}"
                )))
            }
        }
    }
    if !resolved.starts_with(root) {
        return Err(CoreError::InvalidPath(format!(
            "{rel_path:?} escapes the workspace root"
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_unpack(_bytes: &[u8], _dest: &Path) -> Result<()> {
        Ok(())
    }

    #[test]
    fn create_initializes_a_repo_with_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.create("ws1", &[], noop_unpack).unwrap();
        let branch = store.get_active_branch("ws1").unwrap();
        assert!(!branch.is_empty());
    }

    #[test]
    fn update_file_round_trips_and_recovers_from_bak() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.create("ws1", &[], noop_unpack).unwrap();

        store.update_file("ws1", "a.txt", b"hello").unwrap();
        let content = fs::read(store.root("ws1").join("a.txt")).unwrap();
        assert_eq!(content, b"hello");

        store.update_file("ws1", "a.txt", b"world").unwrap();
        let content = fs::read(store.root("ws1").join("a.txt")).unwrap();
        assert_eq!(content, b"world");
        assert!(!store.root("ws1").join("a.txt.bak").exists());
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.create("ws1", &[], noop_unpack).unwrap();

        let err = store.update_file("ws1", "../escape.txt", b"x").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath(_)));
        let err = store.update_file("ws1", "foo/../../x", b"x").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath(_)));
    }

    #[test]
    fn list_files_excludes_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path().to_path_buf());
        store.create("ws1", &[], noop_unpack).unwrap();
        store.update_file("ws1", "a.txt", b"hi").unwrap();

        let files = store.list_files("ws1").unwrap();
        assert!(files.contains(&"a.txt".to_string()));
        assert!(!files.iter().any(|f| f.starts_with(".git")));
    }
}
