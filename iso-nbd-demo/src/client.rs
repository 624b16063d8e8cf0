extern crate iso_nbd;
extern crate stderrlog;
extern crate tokio;

use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use iso_nbd::Client;

// Reads a byte range from an export and writes it to stdout or a file, which is
// enough to check that a server is serving the expected image:
// $ cargo run --bin iso-nbd-client -- ubuntu.iso --offset 32768 --length 2048 | xxd | head

/// Reads a byte range from a read-only NBD export.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Name of the export to read.
    export: String,

    /// Address of the NBD server.
    #[arg(long, default_value = "localhost:10809")]
    server: String,

    /// Byte offset to begin reading at.
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Number of bytes to read; defaults to the remainder of the export.
    #[arg(long)]
    length: Option<u64>,

    /// Write the data to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Increase log verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// The largest amount of data requested from the server at once.
const CHUNK: u64 = 1 << 20;

#[tokio::main]
async fn main() -> iso_nbd::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .module("iso_nbd")
        .color(stderrlog::ColorChoice::Never)
        .verbosity(1 + cli.verbose as usize)
        .init()?;

    let mut conn = Client::connect(cli.server.as_str())
        .await?
        .export(&cli.export)
        .await?
        .ok_or_else(|| format!("server refused export {:?}", cli.export))?;

    let size = conn.size();
    info!("export {:?}: {} bytes", cli.export, size);

    let end = match cli.length {
        Some(length) => cli.offset.saturating_add(length).min(size),
        None => size,
    };

    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin> = match &cli.output {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let mut offset = cli.offset;
    while offset < end {
        let length = (end - offset).min(CHUNK) as u32;
        let data = conn.read(offset, length).await?;
        if data.is_empty() {
            break;
        }

        out.write_all(&data).await?;
        offset += data.len() as u64;
    }

    out.flush().await?;
    conn.disconnect().await
}
