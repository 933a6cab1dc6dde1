use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(about, long_about = None)]
pub struct CliArgs {
    /// Path to the TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, env = "DT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address for the HTTP API to listen on, e.g. `127.0.0.1:7878`
    #[arg(long, env = "DT_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Where the durable run state is mirrored
    #[arg(long)]
    pub state_path: Option<PathBuf>,

    /// Append every finished run to this JSON lines file
    #[arg(long)]
    pub history_path: Option<PathBuf>,

    /// Workload catalog to use instead of the built-in one
    #[arg(long)]
    pub workloads: Option<PathBuf>,

    /// Threshold table to use instead of the built-in one
    #[arg(long)]
    pub thresholds: Option<PathBuf>,

    /// Path to the fio binary. `DT_FIO_PATH` still takes precedence when set.
    #[arg(long)]
    pub fio_path: Option<PathBuf>,
}

impl CliArgs {
    /// Override values from the configuration file with any flags that were given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }
        if let Some(path) = &self.state_path {
            config.state.path = path.clone();
        }
        if let Some(path) = &self.history_path {
            config.state.history_path = Some(path.clone());
        }
        if let Some(path) = &self.workloads {
            config.catalog.workloads_path = Some(path.clone());
        }
        if let Some(path) = &self.thresholds {
            config.catalog.thresholds_path = Some(path.clone());
        }
        if let Some(path) = &self.fio_path {
            config.engine.path = Some(path.clone());
        }
    }
}
