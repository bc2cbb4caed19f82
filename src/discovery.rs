use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::ScanError;

/// Stands in for path separators in project directory names.
pub const SEPARATOR_SUBSTITUTE: char = '-';

/// Project directory name for a working directory: `/home/me/app` becomes `-home-me-app`.
pub fn project_dir_name(working_dir: &Path) -> String {
    let parts: Vec<String> = working_dir
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    let joined = parts.join(&SEPARATOR_SUBSTITUTE.to_string());
    if working_dir.has_root() {
        format!("{SEPARATOR_SUBSTITUTE}{joined}")
    } else {
        joined
    }
}

/// Best-effort reverse of [`project_dir_name`]. Hyphens inside names are not recoverable.
pub fn path_from_project_dir_name(dir_name: &str) -> PathBuf {
    match dir_name.strip_prefix(SEPARATOR_SUBSTITUTE) {
        Some(rest) => PathBuf::from(format!("/{}", rest.replace(SEPARATOR_SUBSTITUTE, "/"))),
        None => PathBuf::from(dir_name.replace(SEPARATOR_SUBSTITUTE, "/")),
    }
}

/// Where the logs for `working_dir` live under `projects_root`.
pub fn project_dir_for(projects_root: &Path, working_dir: &Path) -> PathBuf {
    let resolved = working_dir
        .canonicalize()
        .unwrap_or_else(|_| working_dir.to_path_buf());
    projects_root.join(project_dir_name(&resolved))
}

/// Human-facing project name. Prefers the shallowest, then shortest, working directory.
pub fn project_display_name(dir_name: &str, working_dirs: &[String]) -> String {
    let root = working_dirs
        .iter()
        .filter(|dir| !dir.trim().is_empty())
        .min_by_key(|dir| (Path::new(dir.as_str()).components().count(), dir.len()));
    if let Some(root) = root
        && let Some(name) = Path::new(root.as_str()).file_name()
    {
        return name.to_string_lossy().to_string();
    }
    match dir_name.strip_prefix(SEPARATOR_SUBSTITUTE) {
        Some(rest) => rest.replace(SEPARATOR_SUBSTITUTE, "/"),
        None => dir_name.to_string(),
    }
}

/// Transcript files directly inside a project directory, sorted by path. Symlinks are
/// listed as-is so a dangling one surfaces as a per-file failure.
pub fn list_source_files(project_dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !project_dir.is_dir() {
        return Err(ScanError::ProjectNotFound(project_dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(project_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| ScanError::Io {
            path: project_dir.to_path_buf(),
            source: err.into(),
        })?;
        if !entry.file_type().is_dir() && is_transcript(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Subdirectories of `projects_root` holding at least one transcript, sorted by path.
/// Entries that cannot be listed are kept so the project scan reports them as failures;
/// only readable directories without transcripts are left out.
pub fn list_project_dirs(projects_root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !projects_root.is_dir() {
        return Err(ScanError::ProjectNotFound(projects_root.to_path_buf()));
    }
    let mut dirs = Vec::new();
    for entry in WalkDir::new(projects_root).min_depth(1).max_depth(1) {
        let dir = match entry {
            Ok(entry) if entry.file_type().is_dir() => entry.into_path(),
            Ok(entry) if entry.path_is_symlink() && !entry.path().is_file() => entry.into_path(),
            Ok(_) => continue,
            Err(err) => match err.path() {
                Some(path) if err.depth() > 0 => path.to_path_buf(),
                _ => {
                    return Err(ScanError::Io {
                        path: projects_root.to_path_buf(),
                        source: err.into(),
                    });
                }
            },
        };
        match list_source_files(&dir) {
            Ok(files) if files.is_empty() => continue,
            Ok(_) => {}
            Err(err) => debug!(project = %dir.display(), error = %err, "keeping unlistable project"),
        }
        dirs.push(dir);
    }
    dirs.sort();
    Ok(dirs)
}

fn is_transcript(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("jsonl")
}
