//! `compote cache` command
//!
//! Inspect and clear the shared component cache.

use anyhow::Result;

use crate::cli::{CacheArgs, CacheCommands};
use idf_component_manager::ops::{cache_path, clear_cache};
use idf_component_manager::util::GlobalContext;

pub fn execute(args: CacheArgs) -> Result<()> {
    let ctx = GlobalContext::new()?;

    match args.command {
        CacheCommands::Path => {
            println!("{}", cache_path(&ctx).display());
        }
        CacheCommands::Clear => {
            let root = clear_cache(&ctx)?;
            eprintln!("     Cleared {}", root.display());
        }
    }

    Ok(())
}
