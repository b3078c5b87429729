//! Guards for file paths that end up inside a pushed repository.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Resolve `candidate` beneath `root`, rejecting absolute paths and anything that
/// escapes through `..` or a symlink.
pub fn normalize_under_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {}", candidate.display());
    }

    let root_canon = root
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", root.display()))?;
    let joined = root_canon.join(candidate);
    let canon = joined
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", joined.display()))?;

    if !canon.starts_with(&root_canon) {
        anyhow::bail!(
            "path escapes source directory ({}): {}",
            root_canon.display(),
            canon.display()
        );
    }

    Ok(canon)
}

/// Validate a repository-relative path and return it with `/` separators.
pub fn repo_path(candidate: &str) -> Result<String> {
    let path = Path::new(candidate);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("non UTF-8 path: {candidate}"))?,
            ),
            Component::CurDir => {}
            Component::ParentDir => anyhow::bail!("'..' is not allowed in {candidate}"),
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("absolute paths are not allowed: {candidate}")
            }
        }
    }
    if parts.is_empty() {
        anyhow::bail!("empty repository path");
    }
    Ok(parts.join("/"))
}

/// Every regular file under `root` (skipping `.git`), as `(repo_path, absolute_path)`
/// sorted by repository path.
pub fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        let absolute = normalize_under_root(root, relative)?;
        let repo = repo_path(&relative.to_string_lossy())?;
        files.push((repo, absolute));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
