//! `compote prepare` command

use anyhow::Result;

use crate::cli::PrepareArgs;
use idf_component_manager::ops::{prepare, CancelToken, PrepareOptions};
use idf_component_manager::util::GlobalContext;

pub fn execute(args: PrepareArgs, verbose: bool) -> Result<()> {
    let mut ctx = GlobalContext::new()?;
    ctx.set_verbose(verbose);

    let opts = PrepareOptions {
        manifest_path: args.manifest_path,
        lock_path: args.lock_path,
        target: args.target,
        idf_version: args.idf_version,
        sdkconfig_json: args.sdkconfig_json,
        jobs: args.jobs,
        progress: !verbose,
        cancel: CancelToken::new(),
    };

    let result = prepare(&args.project_dir, &ctx, &opts)?;

    if result.lock_reused {
        eprintln!("     Using {} components from {}", result.resolve.len(), result.lock_path.display());
    } else {
        eprintln!("    Resolved {} components", result.resolve.len());
    }
    for path in &result.removed {
        eprintln!("     Removed {}", path.display());
    }
    if result.lock_written {
        eprintln!("     Updated {}", result.lock_path.display());
    }

    Ok(())
}
