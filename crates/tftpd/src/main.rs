//! TFTP Server - Main executable
//!
//! Serves and accepts files over TFTP from a single root directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tftp::{DirStore, TftpServer, TftpServerConfig, TransferConfig};

const DEFAULT_BIND: &str = "0.0.0.0:6969"; // use 6969 for non-root testing; redirect or run as root for :69
const DEFAULT_ROOT: &str = "./tftp_root";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server - RFC 1350 read and write transfers from a root directory",
    example = "Serve ./boot on the standard port:\n  {command_name} --bind 0.0.0.0:69 --root ./boot",
    example = "Tolerate slow clients:\n  {command_name} --root /srv/tftp --timeout 10 --retries 5"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'b',
        description = "server bind address",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(
        option,
        short = 'r',
        description = "root directory for served and uploaded files",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(
        option,
        short = 't',
        description = "seconds of silence before the last packet is resent",
        default = "3"
    )]
    timeout: u64,

    #[argh(
        option,
        description = "resends before a silent transfer is abandoned",
        default = "8"
    )]
    retries: usize,
}

impl CliConfig {
    fn into_server_config(self) -> Result<(TftpServerConfig, PathBuf)> {
        if self.timeout == 0 {
            bail!("--timeout must be at least one second");
        }

        let root = self
            .root
            .canonicalize()
            .with_context(|| format!("Invalid root directory: {}", self.root.display()))?;
        if !root.is_dir() {
            bail!("Root {} is not a directory", root.display());
        }

        let transfer_config = TransferConfig {
            timeout: Duration::from_secs(self.timeout),
            max_retries: self.retries,
            ..Default::default()
        };

        let config = TftpServerConfig {
            bind_address: self.bind,
            transfer_config,
        };

        Ok((config, root))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    let (config, root) = cli_config.into_server_config()?;

    tracing::info!("Starting TFTP server on {} with root: {}", config.bind_address, root.display());

    let mut server = TftpServer::new(config, DirStore::new(root));

    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn cli(root: PathBuf, timeout: u64) -> CliConfig {
        CliConfig {
            bind: "127.0.0.1:0".to_string(),
            root,
            timeout,
            retries: 4,
        }
    }

    #[test]
    fn test_cli_into_server_config() {
        let temp_dir = tempdir().unwrap();
        let (config, root) = cli(temp_dir.path().to_path_buf(), 5).into_server_config().unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:0");
        assert_eq!(config.transfer_config.timeout, Duration::from_secs(5));
        assert_eq!(config.transfer_config.max_retries, 4);
        assert_eq!(root, temp_dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        let temp_dir = tempdir().unwrap();
        assert!(cli(temp_dir.path().to_path_buf(), 0).into_server_config().is_err());
        assert!(cli(temp_dir.path().join("missing"), 3).into_server_config().is_err());

        let file = temp_dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(cli(file, 3).into_server_config().is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let parsed = CliConfig::from_args(&["tftpd"], &["--bind", "127.0.0.1:69", "-r", "/srv", "--retries", "2"]).unwrap();
        assert_eq!(parsed.bind, "127.0.0.1:69");
        assert_eq!(parsed.root, PathBuf::from("/srv"));
        assert_eq!(parsed.timeout, 3);
        assert_eq!(parsed.retries, 2);
    }
}
