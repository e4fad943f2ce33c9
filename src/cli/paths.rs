//! `signal-sandbox paths`: where config, cleanup records and code dirs live.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    let rows = [
        ("config dir", paths.config_dir.clone()),
        ("config file", paths.config_file()),
        ("state dir", paths.state_dir.clone()),
        ("cleanup log", paths.cleanup_log()),
        ("reaper lock", paths.sweep_lock()),
        ("cache dir", paths.cache_dir.clone()),
        ("code dirs", paths.work_dir()),
    ];
    for (label, path) in rows {
        let marker = if path.exists() { ' ' } else { '-' };
        println!("{marker} {label:<12} {}", path.display());
    }
    println!();
    println!("('-' = not created yet; override with SIGNAL_SANDBOX_{{CONFIG,STATE,CACHE}}_DIR)");
    Ok(())
}
