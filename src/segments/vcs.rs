use crate::segments::threaded::{KeyedSegment, KeyedUpdate};
use crate::segments::{Chunk, SegmentContext, SegmentFunction, SegmentOutput, SegmentRegistry};
use crate::utils::PowerlineLogger;
use anyhow::Result;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub fn register(registry: &mut SegmentRegistry) {
    registry.register("vcs.branch", || {
        Arc::new(KeyedSegment::new(Branch)) as Arc<dyn SegmentFunction>
    });
}

/// Closest ancestor of `start` holding a `.git` entry.
pub fn find_repository_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Branch name, or the abbreviated commit id when HEAD is detached.
pub fn head_name(path: &Path) -> Result<Option<String>> {
    let repo = match gix::discover(path) {
        Ok(repo) => repo,
        Err(_) => return Ok(None),
    };
    if let Ok(Some(reference)) = repo.head_ref() {
        return Ok(Some(reference.name().shorten().to_string()));
    }
    // Unborn branch in a fresh repository has no commit.
    let detached = match repo.head_commit() {
        Ok(commit) => Some(commit.id().to_hex_with_len(7).to_string()),
        Err(_) => None,
    };
    Ok(detached)
}

/// Current branch, refreshed per repository.
pub struct Branch;

impl KeyedUpdate for Branch {
    /// Repository root, or the directory itself outside a repository.
    type Key = Option<PathBuf>;
    type Value = Option<String>;

    fn name(&self) -> &'static str {
        "branch"
    }

    fn key(&self, ctx: &SegmentContext<'_>, _args: &Map<String, Value>) -> Result<Option<PathBuf>> {
        Ok(ctx
            .info
            .cwd
            .as_deref()
            .map(|cwd| find_repository_root(cwd).unwrap_or_else(|| cwd.to_path_buf())))
    }

    fn compute(&self, _pl: &PowerlineLogger, key: &Option<PathBuf>, _previous: Option<&Option<String>>) -> Result<Option<String>> {
        match key {
            Some(dir) => head_name(dir),
            None => Ok(None),
        }
    }

    fn render_one(
        &self,
        branch: &Option<String>,
        _ctx: &SegmentContext<'_>,
        _args: &Map<String, Value>,
    ) -> Result<SegmentOutput> {
        let Some(branch) = branch else {
            return Ok(SegmentOutput::None);
        };
        Ok(SegmentOutput::Chunks(vec![
            Chunk::new(branch.clone()).with_groups(["branch"])
        ]))
    }

    fn default_interval(&self) -> Duration {
        Duration::from_secs(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::SegmentInfo;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_key_is_repository_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::create_dir_all(dir.path().join("src/deep")).unwrap();

        let pl = PowerlineLogger::new("test");
        let top = SegmentInfo {
            cwd: Some(dir.path().to_path_buf()),
            ..SegmentInfo::default()
        };
        let deep = SegmentInfo {
            cwd: Some(dir.path().join("src/deep")),
            ..SegmentInfo::default()
        };
        let key = |info: &SegmentInfo| {
            let ctx = SegmentContext { pl: &pl, info, run_once: true };
            Branch.key(&ctx, &Map::new()).unwrap()
        };
        assert_eq!(key(&top), key(&deep));
        assert_eq!(key(&top), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_unborn_head_has_no_name() {
        let dir = TempDir::new().unwrap();
        gix::init(dir.path()).unwrap();
        assert_eq!(head_name(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_without_directory_renders_nothing() {
        let pl = PowerlineLogger::new("test");
        let value = Branch.compute(&pl, &None, None).unwrap();
        assert_eq!(value, None);
        let info = SegmentInfo::default();
        let ctx = SegmentContext { pl: &pl, info: &info, run_once: true };
        assert!(Branch.render_one(&value, &ctx, &Map::new()).unwrap().is_none());
    }

    #[test]
    fn test_branch_chunk() {
        let pl = PowerlineLogger::new("test");
        let info = SegmentInfo::default();
        let ctx = SegmentContext { pl: &pl, info: &info, run_once: true };
        match Branch.render_one(&Some("main".to_string()), &ctx, &Map::new()).unwrap() {
            SegmentOutput::Chunks(chunks) => {
                assert_eq!(chunks[0].contents, "main");
                assert_eq!(chunks[0].highlight_groups, vec!["branch"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
