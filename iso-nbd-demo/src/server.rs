extern crate iso_nbd;
extern crate stderrlog;
extern crate tokio;

use clap::Parser;
use log::info;
use std::path::PathBuf;

use iso_nbd::{ExportDir, Server};

// Useful snippets for testing:
//
// Serve a directory of ISO images:
// $ cargo run --release -- --root /srv/iso -vv
//
// In another terminal, hand an export off to the Linux kernel NBD client,
// mount it, then disconnect:
// $ sudo modprobe nbd && sudo nbd-client -N ubuntu.iso ::1 /dev/nbd0 && sudo mount -o ro /dev/nbd0 /mnt
// $ sudo umount /mnt && sudo nbd-client -d /dev/nbd0

/// Exports the disk images in a directory as read-only NBD devices.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Directory whose files are served, addressed by relative path.
    #[arg(long)]
    root: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "[::]:10809")]
    listen: String,

    /// Increase log verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all log output.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> iso_nbd::Result<()> {
    let cli = Cli::parse();

    // Warnings and errors are shown by default.
    stderrlog::new()
        .module("iso_nbd")
        .module(module_path!())
        .color(stderrlog::ColorChoice::Never)
        .quiet(cli.quiet)
        .verbosity(1 + cli.verbose as usize)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let exports = ExportDir::new(&cli.root)?;
    let server = Server::bind(cli.listen.as_str(), exports).await?;

    let stop = server.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, no longer accepting connections");
            stop.stop();
        }
    });

    server.run().await
}
