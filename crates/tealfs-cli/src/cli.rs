use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tealfs_rs::NodeConfig;

#[derive(Parser, Debug)]
#[command(name = "tealfs", about = "TealFS storage node (WebDAV + admin HTTP)")]
pub struct Args {
    #[arg(long, env = "TEALFS_CONFIG_DIR", default_value = "./tealfs-config")]
    pub config_dir: PathBuf,

    /// Node-to-node listen address; also what peers are told to dial.
    #[arg(long, env = "TEALFS_NODE_ADDRESS", default_value = "127.0.0.1:7000")]
    pub node_address: String,

    #[arg(long, env = "TEALFS_WEBDAV_ADDRESS", default_value = "127.0.0.1:8080")]
    pub webdav_address: String,

    #[arg(long, env = "TEALFS_ADMIN_ADDRESS", default_value = "127.0.0.1:8081")]
    pub admin_address: String,

    #[arg(long, env = "TEALFS_RECONNECT_INTERVAL_MS", default_value_t = 5000)]
    pub reconnect_interval_ms: u64,

    #[arg(long, env = "TEALFS_RECONNECT_JITTER_RATIO", default_value_t = 0.2)]
    pub reconnect_jitter_ratio: f64,

    #[arg(long, env = "TEALFS_CHANNEL_CAPACITY", default_value_t = 1024)]
    pub channel_capacity: usize,
}

impl Args {
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.config_dir.clone(), self.node_address.clone());
        config.reconnect_interval = Duration::from_millis(self.reconnect_interval_ms);
        config.reconnect_jitter_ratio = self.reconnect_jitter_ratio;
        config.channel_capacity = self.channel_capacity;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "tealfs",
            "--config-dir",
            "/tmp/n1",
            "--node-address",
            "127.0.0.1:9000",
            "--reconnect-interval-ms",
            "250",
        ])
        .unwrap();
        let config = args.node_config();
        assert_eq!(config.config_dir, PathBuf::from("/tmp/n1"));
        assert_eq!(config.node_address, "127.0.0.1:9000");
        assert_eq!(config.reconnect_interval, Duration::from_millis(250));
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(args.webdav_address, "127.0.0.1:8080");
    }
}
