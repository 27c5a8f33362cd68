//! graphsync-cli - send one command to a graphsync server
//!
//! Usage:
//!   graphsync-cli ws://127.0.0.1:8765 LOGIN '{"graph":"demo"}'
//!   graphsync-cli ws://127.0.0.1:8765 FILES_UPDATE '<refs>' --login '{}' -f report.pdf
//!   graphsync-cli ws://127.0.0.1:8765 FILES_FETCH '<refs>' --login '{}' --out ./downloads
//!
//! Each invocation opens its own connection, so a LOGIN does not carry over
//! to the next call. `--login` sends one first on the same connection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graphsync::{Client, Response};

#[derive(Parser, Debug)]
#[command(name = "graphsync-cli", version, about = "Send one command to a graphsync server")]
struct Opts {
    /// Server URL, e.g. ws://127.0.0.1:8765
    url: String,

    /// Command verb (LOGIN, ADD, TRIPLES, FILES_UPDATE, ...)
    command: String,

    /// Command payload; "-" reads it from stdin
    #[arg(default_value = "")]
    payload: String,

    /// Attach a file (repeatable)
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,

    /// Save response files into this directory
    #[arg(long)]
    out: Option<PathBuf>,

    /// Send LOGIN with this payload before the command
    #[arg(long)]
    login: Option<String>,
}

fn read_payload(arg: String) -> Result<String> {
    if arg != "-" {
        return Ok(arg);
    }
    std::io::read_to_string(std::io::stdin()).context("cannot read payload from stdin")
}

/// Copy response files out of the call's temp directory.
fn save_files(response: &Response, out: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out)?;
    let mut saved = Vec::new();
    for file in &response.files {
        let dest = out.join(&file.name);
        std::fs::copy(&file.path, &dest)?;
        saved.push(dest);
    }
    Ok(saved)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "graphsync=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let opts = Opts::parse();
    let payload = read_payload(opts.payload)?;
    let out = opts.out;

    let mut client = Client::new(opts.url);
    if let Some(login) = &opts.login {
        client.login(login).await.context("login failed")?;
    }
    let (text, saved) = client
        .send_with(&opts.command, &payload, &opts.files, |response| {
            let saved = match &out {
                Some(dir) => save_files(&response, dir),
                None => Ok(Vec::new()),
            };
            (response.text, saved)
        })
        .await
        .context("request failed")?;
    client.close().await?;

    println!("{}", text);
    for path in saved.context("cannot save response files")? {
        eprintln!("saved {}", path.display());
    }

    if text.starts_with("ERROR:") {
        std::process::exit(1);
    }
    Ok(())
}
