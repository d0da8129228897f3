//! geolock CLI - Main entry point.

use geolock::cli::{Cli, Commands, LockCommands};
use geolock::client::LockClient;
use geolock::config::GeolockConfig;
use geolock::lock::LockResult;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Server(args) => {
            let mut config = match &cli.config {
                Some(path) => GeolockConfig::from_file(path)?,
                None => GeolockConfig::development(),
            };
            args.apply(&mut config)?;
            if let Some(level) = cli.log_level {
                config.observability.log_level = level;
            }

            geolock::run(config).await?;
        }

        Commands::Lock { addr, command } => {
            let client = LockClient::new(addr);
            match command {
                LockCommands::Acquire { lock_id, client_id, timeout_ms } => {
                    let lock =
                        exit_on_failure(client.acquire(&lock_id, &client_id, timeout_ms).await);
                    println!("Acquired {}", lock.lock_id);
                    println!("  Holder: {} ({})", lock.holder_id, lock.holder_region);
                    println!("  Fencing token: {}", lock.fencing_token);
                    println!("  Expires in: {}ms", lock.ttl());
                }
                LockCommands::Release { lock_id, client_id, fencing_token } => {
                    exit_on_failure(client.release(&lock_id, &client_id, fencing_token).await);
                    println!("Released {}", lock_id);
                }
                LockCommands::Extend { lock_id, client_id, fencing_token, timeout_ms } => {
                    let lock = exit_on_failure(
                        client.extend(&lock_id, &client_id, fencing_token, timeout_ms).await,
                    );
                    println!("Extended {}; expires in {}ms", lock.lock_id, lock.ttl());
                }
                LockCommands::Check { lock_id } => {
                    let info = exit_on_failure(client.check(&lock_id).await);
                    println!("  Lock: {}", info.lock_id);
                    println!("  Holder: {} ({})", info.holder_id, info.holder_region);
                    println!("  Fencing token: {}", info.fencing_token);
                    println!("  TTL: {}ms", info.ttl_ms);
                }
                LockCommands::List => {
                    let locks = client.list().await?;
                    if locks.is_empty() {
                        println!("No locks held");
                    }
                    for info in locks {
                        println!(
                            "{}  {:>8}  {:>8}ms  {} ({})",
                            info.lock_id,
                            info.fencing_token,
                            info.ttl_ms,
                            info.holder_id,
                            info.holder_region
                        );
                    }
                }
            }
        }

        Commands::Status { addr } => {
            let client = LockClient::new(addr.clone());
            match client.status().await {
                Ok(status) => {
                    println!("Node status ({})", addr);
                    println!("  Region: {}", status.region_id);
                    println!("  Node: {}", status.raft.node_id);
                    println!("  State: {}", status.raft.state);
                    println!("  Term: {}", status.raft.term);
                    match status.raft.leader_id {
                        Some(leader) => println!("  Leader: {}", leader),
                        None => println!("  Leader: unknown"),
                    }
                    println!("  Commit index: {}", status.raft.commit_index);
                    println!("  Active locks: {}", status.active_locks);
                    println!("  Peer regions: {}", status.peer_regions.join(", "));
                }
                Err(e) => {
                    eprintln!("Failed to reach node: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("geolock {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Print a lock failure and exit non-zero. Retryable failures exit with 75
/// (EX_TEMPFAIL) so scripts can tell them apart.
fn exit_on_failure<T>(result: LockResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            eprintln!("{}", err);
            if let Some(holder) = &err.current_holder_id {
                eprintln!("  Current holder: {}", holder);
            }
            if let Some(token) = err.current_fencing_token {
                eprintln!("  Current fencing token: {}", token);
            }
            std::process::exit(if err.is_retryable() { 75 } else { 1 });
        }
    }
}
