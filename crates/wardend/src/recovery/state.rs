//! On-disk agent state removed by tier-2 and higher recovery

use crate::registry::AgentDescriptor;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directories wiped for `agent`: its configured state dirs plus
/// `<state_root>/<name>/cache` and `<state_root>/<name>/tmp`
pub fn state_dirs(agent: &AgentDescriptor, state_root: &Path) -> Vec<PathBuf> {
    let base = state_root.join(&agent.name);
    let mut dirs = agent.state_dirs.clone();
    dirs.push(base.join("cache"));
    dirs.push(base.join("tmp"));
    dirs
}

/// Empty every state directory, recreating it afterwards. Missing
/// directories are created empty.
pub async fn clear_state(agent: &AgentDescriptor, state_root: &Path) -> Result<usize> {
    let mut cleared = 0;
    for dir in state_dirs(agent, state_root) {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => cleared += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to recreate {}", dir.display()))?;
        debug!(agent = %agent.name, dir = %dir.display(), "State cleared");
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_clear_state_empties_dirs() {
        let temp = TempDir::new().unwrap();
        let extra = temp.path().join("models");
        std::fs::create_dir_all(&extra).unwrap();
        std::fs::write(extra.join("weights.bin"), b"stale").unwrap();
        let cache = temp.path().join("root/memory/cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("entry"), b"stale").unwrap();

        let mut agent = AgentDescriptor::new("memory", 7100);
        agent.state_dirs.push(extra.clone());

        let cleared = clear_state(&agent, &temp.path().join("root")).await.unwrap();
        assert_eq!(cleared, 2);
        assert!(extra.exists());
        assert_eq!(std::fs::read_dir(&extra).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);
        assert!(temp.path().join("root/memory/tmp").exists());
    }
}
