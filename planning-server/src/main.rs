//! Planning server: WebSocket front-end for collaborative planning editing.
//!
//! ```text
//! planning-server --bind 0.0.0.0:9090 --data-dir ./planning_data
//! RUST_LOG=planning_collab=debug planning-server --memory
//! ```

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

use planning_collab::{CollabConfig, PlanningServer, ServerConfig};

/// Real-time collaboration server for funeral plannings
#[derive(Parser, Debug)]
#[command(version, about, name = "planning-server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for plannings and their operation logs
    #[arg(long, default_value = "planning_data")]
    data_dir: PathBuf,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long)]
    memory: bool,

    /// Quiet period in milliseconds before a changed planning is saved
    #[arg(long, default_value_t = 2000)]
    save_debounce_ms: u64,

    /// Consecutive failed saves before participants are told
    #[arg(long, default_value_t = 3)]
    save_failure_threshold: u32,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: (!self.memory).then(|| self.data_dir.clone()),
            collab: CollabConfig {
                save_debounce: Duration::from_millis(self.save_debounce_ms),
                save_failure_threshold: self.save_failure_threshold.max(1),
                ..CollabConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let server = PlanningServer::new(args.server_config())?;
    info!("Planning server starting on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            server.shutdown().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, flushing open plannings");
            server.shutdown().await;
            Ok(())
        }
    }
}
