mod daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::daemon::{
    run_storage_daemon, StorageDaemonRunOptions, DEFAULT_NODE_CONFIG_PATH,
    DEFAULT_TOPOLOGY_CONFIG_PATH,
};

fn usage() -> String {
    format!(
        "usage: storage_daemon [--node-config <path>] [--topology-config <path>]\n\
         defaults:\n\
         --node-config {}\n\
         --topology-config {}",
        DEFAULT_NODE_CONFIG_PATH, DEFAULT_TOPOLOGY_CONFIG_PATH
    )
}

fn parse_args() -> Result<StorageDaemonRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(|a| a == "-h" || a == "--help").unwrap_or(false) {
        return Err(usage());
    }

    let mut node_config_path = PathBuf::from(DEFAULT_NODE_CONFIG_PATH);
    let mut topology_config_path = PathBuf::from(DEFAULT_TOPOLOGY_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--node-config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --node-config".to_string())?;
                node_config_path = PathBuf::from(value);
            }
            "--topology-config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --topology-config".to_string())?;
                topology_config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(StorageDaemonRunOptions {
        node_config_path,
        topology_config_path,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_storage_daemon(options) {
        error!("run storage_daemon failed: {}", err);
        std::process::exit(1);
    }
}
