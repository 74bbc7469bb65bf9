use std::path::PathBuf;

use clap::Parser;
use ninep::srv::{Config, serve};

mod hostfs;
use hostfs::HostFs;

/// A 9P2000 file server that exports a host directory tree.
#[derive(Debug, Parser)]
struct Cli {
    /// Log at debug level.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Listen address: `proto!host!port` for a network listener, `-` to
    /// serve one session over stdin/stdout, or a path to a character
    /// device to serve one session over.
    #[arg(short = 'p', long, default_value = "tcp!*!564")]
    address: String,

    /// Directory to export. Must already exist.
    exported_root: PathBuf,
}

async fn run(cli: Cli) -> ninep::Result<()> {
    let metadata = std::fs::metadata(&cli.exported_root).map_err(|e| {
        ninep::Error::path(format!(
            "{}: {}",
            cli.exported_root.display(),
            e
        ))
    })?;
    if !metadata.is_dir() {
        return Err(ninep::Error::path(format!(
            "{}: not a directory",
            cli.exported_root.display()
        )));
    }

    let exported_root = cli.exported_root.canonicalize()?;
    let user = std::env::var("USER").unwrap_or_else(|_| "none".to_owned());

    let config = Config {
        exported_root,
        debug: cli.debug,
        user: user.clone(),
    };

    log::info!("exporting {:?} as user {user}", config.exported_root);
    serve(HostFs { user }, config, &cli.address).await
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("ninepfs: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn refuses_a_missing_exported_root() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let cli = Cli {
            debug: false,
            address: "tcp!127.0.0.1!0".to_owned(),
            exported_root: missing,
        };
        assert!(run(cli).await.is_err());
    }

    #[tokio::test]
    async fn refuses_a_non_directory_exported_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        tokio::fs::write(&file, b"x").await.unwrap();
        let cli = Cli {
            debug: false,
            address: "tcp!127.0.0.1!0".to_owned(),
            exported_root: file,
        };
        assert!(run(cli).await.is_err());
    }
}
