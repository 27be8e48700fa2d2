//! Command-line surface: one binary, client or server depending on flags

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "Send a file or directory to a tarxfer server, or run one"
)]
pub struct Args {
    /// File or directory to send
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Receiver host
    #[arg(long = "dstHost", alias = "dst-host", value_name = "HOST")]
    pub dst_host: Option<String>,

    /// Receiver port
    #[arg(long = "dstPort", alias = "dst-port", value_name = "PORT")]
    pub dst_port: Option<u16>,

    /// Run as a receiver on this port (0 = client mode)
    #[arg(long = "serveOnPort", alias = "serve-on-port", default_value_t = 0)]
    pub serve_on_port: u16,

    /// Gzip the archive stream
    #[arg(long)]
    pub compress: bool,

    /// Directory received files are written under
    #[arg(long = "destDir", alias = "dest-dir", default_value = ".")]
    pub dest_dir: PathBuf,

    /// Append transfer events to this file (server mode)
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Hide per-file progress bars
    #[arg(long = "no-progress")]
    pub no_progress: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Serve {
        port: u16,
        destination: PathBuf,
        log_file: Option<PathBuf>,
    },
    Send {
        source: PathBuf,
        address: String,
        compress: bool,
        show_progress: bool,
    },
}

impl Args {
    /// A non-zero `--serveOnPort` selects server mode; otherwise all three
    /// client flags are required.
    pub fn mode(&self) -> Result<Mode> {
        if self.serve_on_port != 0 {
            return Ok(Mode::Serve {
                port: self.serve_on_port,
                destination: self.dest_dir.clone(),
                log_file: self.log_file.clone(),
            });
        }
        let (Some(file), Some(host), Some(port)) = (&self.file, &self.dst_host, self.dst_port)
        else {
            bail!("client mode needs --file, --dstHost and --dstPort (or use --serveOnPort)");
        };
        Ok(Mode::Send {
            source: file.clone(),
            address: format!("{}:{}", host, port),
            compress: self.compress,
            show_progress: !self.no_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_flags_resolve_to_send() {
        let args = Args::try_parse_from([
            "tarxfer",
            "--file",
            "/tmp/src",
            "--dstHost",
            "localhost",
            "--dstPort=45454",
            "--compress",
        ])
        .unwrap();
        assert_eq!(
            args.mode().unwrap(),
            Mode::Send {
                source: PathBuf::from("/tmp/src"),
                address: "localhost:45454".into(),
                compress: true,
                show_progress: true,
            }
        );
    }

    #[test]
    fn serve_port_wins() {
        let args = Args::try_parse_from([
            "tarxfer",
            "--serve-on-port",
            "45454",
            "--file",
            "ignored",
        ])
        .unwrap();
        assert_eq!(
            args.mode().unwrap(),
            Mode::Serve {
                port: 45454,
                destination: PathBuf::from("."),
                log_file: None,
            }
        );
    }

    #[test]
    fn incomplete_client_flags_fail() {
        let args = Args::try_parse_from(["tarxfer", "--file", "x"]).unwrap();
        assert!(args.mode().is_err());
    }
}
