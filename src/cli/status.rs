use anyhow::Result;

use crate::config::Config;
use crate::engine::Engine;

pub async fn run() -> Result<()> {
    let config = Config::load()?;
    let engine = Engine::from_config(&config)?;
    let facts = engine.health().await;

    println!("Isolation runtime:");
    match &facts.probe {
        Ok(probe) => {
            println!("  Reachable:    yes");
            println!(
                "  Version:      {} (floor {})",
                probe.version, config.runtime.version_floor
            );
            match probe.mem_total_bytes {
                Some(mem) => println!("  Host memory:  {} MiB", mem / (1024 * 1024)),
                None => println!("  Host memory:  unknown"),
            }
        }
        Err(e) => println!("  Reachable:    no ({})", e),
    }
    match &facts.live_instances {
        Ok(n) => println!(
            "  Live:         {} / {}",
            n, config.runtime.max_live_instances
        ),
        Err(e) => println!("  Live:         unknown ({})", e),
    }
    match &facts.seccomp_profile {
        Ok(()) => println!("  Seccomp:      {}", config.sandbox.seccomp_profile),
        Err(e) => println!("  Seccomp:      unusable ({})", e),
    }
    println!();

    let limits = config.resource_limits();
    println!("Sandbox:");
    println!("  Image:        {}", config.sandbox.image);
    println!("  User:         {}", config.sandbox.user);
    println!(
        "  Timeout:      {} (max {})",
        config.sandbox.default_timeout, config.sandbox.max_timeout
    );
    println!("  Memory:       {} MiB", config.sandbox.memory_mb);
    println!("  CPUs:         {}", limits.cpus);
    println!("  Max procs:    {}", limits.max_processes);
    println!("  Max files:    {}", limits.max_open_files);
    println!("  Scratch:      {} MiB", config.sandbox.scratch_mb);
    println!("  Network:      none");
    println!();

    let stats = engine.stats();
    println!("Engine:");
    println!("  Workers:      {}", stats.workers);
    println!(
        "  Reaper:       {} (every {}, max age {})",
        if config.reaper.enabled { "on" } else { "off" },
        config.reaper.interval,
        config.reaper.max_instance_age
    );

    Ok(())
}
