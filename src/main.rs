use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::sync::broadcast::error::RecvError;

use mailcatch::utils::init_logging;
use mailcatch::{FileMessageStore, Server, ServerConfig};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "mailcatch",
    about = "A local SMTP server that captures outgoing mail for inspection"
)]
pub struct Opt {
    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "127.0.0.1")]
    pub address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Name announced in the greeting and HELO/EHLO replies
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Directory to save received messages
    #[structopt(long = "data", default_value = "messages", parse(from_os_str))]
    pub data_dir: PathBuf,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log every command and reply
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Seconds without a complete line before a connection is dropped
    #[structopt(long = "idle-timeout", default_value = "1200")]
    pub idle_timeout: u64,

    /// Seconds between idle connection sweeps
    #[structopt(long = "sweep-interval", default_value = "300")]
    pub sweep_interval: u64,

    /// Seconds between status log lines
    #[structopt(long = "status-interval", default_value = "1200")]
    pub status_interval: u64,

    /// Keep connections that send a buffer full of NUL bytes
    #[structopt(long = "no-nul-guard")]
    pub no_nul_guard: bool,
}

impl Opt {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            hostname: self.hostname.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            status_interval: Duration::from_secs(self.status_interval),
            drop_nul_flood: !self.no_nul_guard,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    init_logging(opt.verbose, opt.log_file.as_deref())?;

    let store = Arc::new(FileMessageStore::new(&opt.data_dir)?);
    let server = Server::new(opt.server_config(), store);

    server
        .bind(&opt.address, opt.port)
        .await
        .context("Invalid listen address")?;
    server
        .start()
        .await
        .with_context(|| format!("Failed to start on {}:{}", opt.address, opt.port))?;

    println!("[INFO] mailcatch v{}", env!("CARGO_PKG_VERSION"));
    println!("[INFO] PID: {}", std::process::id());
    if let Some(addr) = server.local_addr() {
        println!("[INFO] Listening on {}", addr);
    }
    println!("[INFO] Saving messages to {:?}", opt.data_dir);
    println!("[INFO] Press Ctrl+C to stop");

    let mut received = server.subscribe();
    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = received.recv() => match message {
                Ok(message) => {
                    count += 1;
                    println!(
                        "[INFO] Message #{} from <{}> to {:?} saved as {}",
                        count, message.mail_from, message.recipients, message.message.id
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("[WARNING] {} notifications dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    server.stop().await;
    Ok(())
}
