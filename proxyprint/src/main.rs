//! proxyprint: tunneling TCP proxy that can print relayed traffic.
//!
//! Flags mirror the config file fields; a set flag always wins and the file
//! (via `--cfg`) only fills in what was left unset.

use clap::{Parser, Subcommand};
use proxyprint::{Config, PrintStatus, ProxyHandle};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "proxyprint")]
#[command(about = "Tunneling TCP proxy that can print relayed traffic in a variety of ways")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Network address to listen for clients on
    #[arg(long, default_value = "")]
    listen: String,
    /// Network address of the backend server to connect to
    #[arg(long, default_value = "")]
    connect: String,
    /// Network address of a remote proxyprint session to tunnel to
    #[arg(long, default_value = "")]
    tunnel: String,
    /// Network address to listen for tunneling servers on
    #[arg(long, default_value = "")]
    listen_servers: String,
    /// How to print data read from the client (0=off, 1=string, 2=bytes, 3=hex, 4=HEX)
    #[arg(long, default_value_t = PrintStatus::None)]
    client_print: PrintStatus,
    /// How to print data read from the server (0=off, 1=string, 2=bytes, 3=hex, 4=HEX)
    #[arg(long, default_value_t = PrintStatus::None)]
    server_print: PrintStatus,
    /// File to write client print output to (defaults to stdout)
    #[arg(long, default_value = "")]
    client_print_file: String,
    /// File to write server print output to (defaults to stdout)
    #[arg(long, default_value = "")]
    server_print_file: String,
    /// Size of the buffer used to copy data (defaults to 32768)
    #[arg(long)]
    buffer: Option<u64>,
    /// How many outbound tunnels may be waiting for servers at once
    #[arg(long, default_value_t = 0)]
    max_waiting_tunnels: usize,
    /// How many tunneling servers may be accepted/queued at once
    #[arg(long, default_value_t = 0)]
    max_accepted_servers: usize,
    /// How many seconds a client waits for a tunnel pairing before giving up
    #[arg(long, default_value_t = 0)]
    tunnel_wait: u64,
    /// Environment variable naming the tunnel password source ("file:" prefix
    /// reads the password from the file the variable points at)
    #[arg(long, default_value = "")]
    pwd_env_name: String,
    /// Fail at startup if the password environment variable is absent
    #[arg(long)]
    require_pwd_env_exists: bool,
    /// File to output logs to (defaults to stderr)
    #[arg(long, default_value = "")]
    log: String,
    /// Network address to run the HTTP monitor server on
    #[arg(long, default_value = "")]
    monitor_server: String,
    /// Path to a JSON config file filling in unset flags
    #[arg(long)]
    cfg: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a blank config file template to the given path
    Generate {
        /// Where to write the template
        path: PathBuf,
    },
}

impl Cli {
    /// Turns the parsed flags into a partial [`Config`] for the file merge.
    /// An omitted `--buffer` is left unset (zero) so the config file or the
    /// default can fill it in; an explicit `--buffer 0` is a fatal error.
    fn into_config(self) -> Result<Config, proxyprint::ConfigError> {
        if self.buffer == Some(0) {
            return Err(proxyprint::ConfigError::ZeroBuffer);
        }
        Ok(Config {
            listen: self.listen,
            connect: self.connect,
            tunnel: self.tunnel,
            listen_servers: self.listen_servers,
            client_print: self.client_print,
            server_print: self.server_print,
            client_print_file: self.client_print_file,
            server_print_file: self.server_print_file,
            buffer: self.buffer.unwrap_or(0),
            max_waiting_tunnels: self.max_waiting_tunnels,
            max_accepted_servers: self.max_accepted_servers,
            tunnel_wait_secs: self.tunnel_wait,
            pwd_env_name: self.pwd_env_name,
            require_pwd_env_exists: self.require_pwd_env_exists,
            log: self.log,
            monitor_server: self.monitor_server,
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Generate { path }) = &cli.command {
        Config::write_template(path)?;
        println!("wrote config template to {}", path.display());
        return Ok(());
    }

    let cfg_path = cli.cfg.clone();
    let mut config = cli.into_config()?;
    if let Some(path) = cfg_path {
        let file = Config::load_file(&path)?;
        config.fill_empty_from(&file);
    }
    config.normalize();

    init_logging(&config.log)?;

    let handle = ProxyHandle::start(config).await?;
    if let Some(addr) = handle.client_addr() {
        println!("listening for clients on {addr}");
    }
    if let Some(addr) = handle.servers_addr() {
        println!("listening for tunneling servers on {addr}");
    }
    if let Some(addr) = handle.monitor_addr() {
        println!("monitor running on {addr}");
    }

    let runtime = handle.runtime().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("shutting down; interrupt again to force exit");
            runtime.shutdown().await;
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(1);
            }
        }
    });

    handle.wait().await?;
    Ok(())
}


fn init_logging(log_file: &str) -> eyre::Result<()> {
    if log_file.is_empty() {
        tracing_subscriber::fmt::init();
        return Ok(());
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    tracing_subscriber::fmt()
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
