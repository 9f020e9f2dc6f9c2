//! A stand-in game for exercising the server end to end.
//!
//! Accepts the same launch arguments as a real game, connects to the
//! socket given by `-webtiles-socket`, greets the player, and echoes each
//! line of input back. A few lines are commands:
//!
//! - `quit` exits with status 0
//! - `crash` exits with status 3
//! - `close` closes the socket and keeps running
//! - `leave` closes the socket, then exits with status 0 a second later
//! - `stall` keeps the socket open but never reads from it again
//!
//! With `-ignore-hup` among its options it survives SIGHUP, so only a kill
//! stops it.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Default)]
struct Args {
    name: String,
    socket: Option<PathBuf>,
    ignore_hup: bool,
}

fn parse_args(args: impl Iterator<Item = String>) -> Args {
    let mut parsed = Args::default();
    let mut args = args.skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-name" => parsed.name = args.next().unwrap_or_default(),
            "-webtiles-socket" => parsed.socket = args.next().map(PathBuf::from),
            "-ignore-hup" => parsed.ignore_hup = true,
            "-rc" | "-macro" | "-morgue" => {
                args.next();
            }
            _ => {}
        }
    }
    parsed
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let args = parse_args(std::env::args());
    let Some(socket) = args.socket else {
        eprintln!("echo game: -webtiles-socket is required");
        std::process::exit(2);
    };

    // Installing a handler replaces the default action, which is to exit.
    let _hangup = if args.ignore_hup {
        Some(signal(SignalKind::hangup())?)
    } else {
        None
    };

    let stream = UnixStream::connect(&socket).await?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("welcome {}\r\n", args.name).as_bytes())
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "quit" => {
                writer.write_all(b"bye\r\n").await?;
                std::process::exit(0);
            }
            "crash" => {
                eprintln!("echo game: crashing on request");
                std::process::exit(3);
            }
            "close" => {
                drop(writer);
                drop(lines);
                std::future::pending::<()>().await;
                return Ok(());
            }
            "leave" => {
                drop(writer);
                drop(lines);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                std::process::exit(0);
            }
            "stall" => {
                writer.write_all(b"stalled\r\n").await?;
                std::future::pending::<()>().await;
                return Ok(());
            }
            other => {
                writer.write_all(format!("echo: {other}\r\n").as_bytes()).await?;
            }
        }
    }

    // The server hung up; behave like a game that saves and exits.
    Ok(())
}
