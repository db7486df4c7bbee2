//! Runtime control over a named pipe.
//!
//! Line-oriented, whitespace-separated. Commands resolve through a small
//! registry so new verbs slot in without touching the reader; parsed
//! commands travel over a channel to the acceptor, which owns all pool
//! state.
use crate::error::{Result, TunnelError};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Commands accepted over the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// `fec <ds> <ps>`
    ReconfigureFec {
        data_shards: usize,
        parity_shards: usize,
    },
}

type CommandParser = fn(&[&str]) -> ControlCommand;

/// Known commands; extend here when the grammar grows.
const COMMANDS: &[(&str, CommandParser)] = &[("fec", parse_fec)];

fn parse_fec(args: &[&str]) -> ControlCommand {
    // lenient numeric parsing: malformed fields become zero
    let data_shards = args.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let parity_shards = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    ControlCommand::ReconfigureFec {
        data_shards,
        parity_shards,
    }
}

/// Parse one line. Unknown commands are logged and discarded; blank
/// lines are skipped silently.
pub fn parse_line(line: &str) -> Option<ControlCommand> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    let args: Vec<&str> = parts.collect();
    for (name, parser) in COMMANDS {
        if head.contains(name) {
            return Some(parser(&args));
        }
    }
    warn!("Unknown call");
    None
}

/// Replace whatever sits at `path` with a fresh fifo (mode 0666), then
/// feed parsed commands into `commands` until the receiving side goes
/// away. Creation or open failure is fatal to the caller.
pub async fn run_fifo_reader(path: PathBuf, commands: mpsc::Sender<ControlCommand>) -> Result<()> {
    let _ = std::fs::remove_file(&path);
    mkfifo(&path, Mode::from_bits_truncate(0o666))
        .map_err(|e| TunnelError::control(format!("mkfifo {}: {}", path.display(), e)))?;
    info!("open named pipe file for read: {}", path.display());
    loop {
        // blocks until a writer shows up
        let file = tokio::fs::File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(command) = parse_line(&line) {
                        if commands.send(command).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("control pipe read: {}", e);
                    break;
                }
            }
        }
        // writer went away; don't spin on reopen
        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fec_command() {
        assert_eq!(
            parse_line("fec 20 5"),
            Some(ControlCommand::ReconfigureFec {
                data_shards: 20,
                parity_shards: 5
            })
        );
    }

    #[test]
    fn test_malformed_numbers_become_zero() {
        assert_eq!(
            parse_line("fec twenty 5"),
            Some(ControlCommand::ReconfigureFec {
                data_shards: 0,
                parity_shards: 5
            })
        );
        assert_eq!(
            parse_line("fec"),
            Some(ControlCommand::ReconfigureFec {
                data_shards: 0,
                parity_shards: 0
            })
        );
    }

    #[test]
    fn test_unknown_and_blank_lines() {
        assert_eq!(parse_line("windows 256 256"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_fifo_reader_end_to_end() {
        let dir = std::env::temp_dir().join(format!("udptun-fifo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("control.pipe");

        let (tx, mut rx) = mpsc::channel(8);
        let reader = tokio::spawn(run_fifo_reader(path.clone(), tx));

        // wait for the fifo node to exist
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut pipe = std::fs::OpenOptions::new()
                .write(true)
                .open(&writer_path)
                .unwrap();
            pipe.write_all(b"bogus command\nfec 20 5\n").unwrap();
        })
        .await
        .unwrap();

        let command = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("command timed out")
            .expect("reader hung up");
        assert_eq!(
            command,
            ControlCommand::ReconfigureFec {
                data_shards: 20,
                parity_shards: 5
            }
        );

        reader.abort();
        std::fs::remove_dir_all(&dir).ok();
    }
}
