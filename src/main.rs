use anyhow::Result;
use log::error;

use tasknest::client::DaemonClient;
use tasknest::config::Config;
use tasknest::remote::TaskFields;
use tasknest::storage::LocalStorage;
use tasknest::{daemon, logger, paths};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logger::init(&config.logging, &paths::log_path()?)?;

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("daemon") => {
            if let Err(e) = daemon::run(config).await {
                error!("Daemon exited with error: {e}");
                return Err(e);
            }
        }
        Some("add") => {
            let Some(content) = args.get(1) else {
                eprintln!("Usage: tasknest add <content> [list_id]");
                std::process::exit(2);
            };
            let list_id = args.get(2).map(String::as_str).unwrap_or("inbox");
            add_task(&config, content, list_id).await?;
        }
        Some("notify") => {
            DaemonClient::new()?.notify().await?;
        }
        Some("status") => {
            print_status().await?;
        }
        Some("stop") => {
            if DaemonClient::new()?.stop().await? {
                println!("Daemon stopping");
            } else {
                println!("Daemon is not running");
            }
        }
        Some("init-config") => {
            Config::generate_default_config(Config::get_default_config_path()?)?;
        }
        _ => {
            eprintln!("Usage: tasknest <daemon|add|notify|status|stop|init-config>");
            std::process::exit(2);
        }
    }

    Ok(())
}

/// Create a task in the default remote's local cache, then poke the daemon.
/// Works fully offline; the queued create is pushed whenever the remote is
/// reachable again.
async fn add_task(config: &Config, content: &str, list_id: &str) -> Result<()> {
    let remote_id = &config.remotes.default_remote;
    if remote_id.is_empty() {
        anyhow::bail!("No default_remote configured");
    }

    paths::ensure_data_dirs()?;
    let storage = LocalStorage::open(paths::remote_db_path(remote_id)?).await?;
    let task = storage.create_task(list_id, &TaskFields::new(content), None).await?;
    println!("Added task {} to list '{}'", task.uuid, list_id);

    DaemonClient::new()?.notify().await?;
    Ok(())
}

async fn print_status() -> Result<()> {
    let reply = DaemonClient::new()?.status().await?;

    if !reply.running {
        println!("Daemon is not running");
        return Ok(());
    }

    println!("Daemon running (pid {}), state: {}", reply.pid, reply.state);
    println!(
        "Heartbeat: {}",
        if reply.heartbeat_healthy { "healthy" } else { "stale" }
    );
    if let Some(last_sync) = &reply.last_sync {
        println!("Last sync: {last_sync} ({} cycles this session)", reply.sync_count);
    }
    for remote in &reply.remotes {
        let last = remote.last_result.as_deref().unwrap_or("never synced");
        println!(
            "  {}: {} pending, {} failed, last: {}",
            remote.id, remote.pending, remote.failed, last
        );
    }
    Ok(())
}
