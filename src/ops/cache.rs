//! Cache maintenance.

use std::path::PathBuf;

use anyhow::Result;

use crate::sources::ComponentCache;
use crate::util::GlobalContext;

/// Root of the shared component cache.
pub fn cache_path(gctx: &GlobalContext) -> PathBuf {
    gctx.cache_root().to_path_buf()
}

/// Delete everything in the cache, holding the cache lock.
pub fn clear_cache(gctx: &GlobalContext) -> Result<PathBuf> {
    let root = cache_path(gctx);
    ComponentCache::new(&root).clear()?;
    tracing::info!("cleared {}", root.display());
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::config::{EnvConfig, ENV_CACHE_PATH};
    use tempfile::TempDir;

    #[test]
    fn test_clear_cache() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        let env = EnvConfig::default().with_var(ENV_CACHE_PATH, root.display().to_string());
        let gctx = GlobalContext::with_env(tmp.path().to_path_buf(), env);

        std::fs::create_dir_all(root.join("abc/ex__cmp_1.0.0")).unwrap();
        std::fs::write(root.join("abc/ex__cmp_1.0.0/a.c"), "int a;").unwrap();

        assert_eq!(cache_path(&gctx), root);
        clear_cache(&gctx).unwrap();
        assert!(!root.join("abc").exists());

        // Clearing a missing cache is fine
        std::fs::remove_dir_all(&root).ok();
        clear_cache(&gctx).unwrap();
    }
}
