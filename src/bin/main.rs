use clap::{Parser, Subcommand};
use log::{info, warn};
use rspeed::{Client, Config, Server};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rspeed")]
#[command(about = "Network speed-test server and client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the speed-test server
    Serve {
        /// Address to listen on (overrides LISTEN_ADDRESS)
        #[arg(short, long)]
        listen: Option<String>,

        /// Download chunk size in bytes (overrides CHUNK_SIZE_BYTES)
        #[arg(short = 'l', long)]
        chunk_size: Option<usize>,

        /// Server identifier (overrides SERVER_ID)
        #[arg(long)]
        server_id: Option<String>,

        /// Address advertised to clients (overrides PUBLIC_URL)
        #[arg(long)]
        public_url: Option<String>,
    },

    /// Measure round-trip time to a server
    Ping {
        /// Server address, e.g. 127.0.0.1:8080
        server: String,

        /// Number of pings to send
        #[arg(short, long, default_value = "4")]
        count: u32,
    },

    /// List the servers a server knows about
    Servers {
        /// Server address to query
        server: String,

        /// Maximum number of entries (0 for all)
        #[arg(short = 'n', long, default_value = "0")]
        limit: i32,
    },

    /// Show the client address as seen by the server
    Ip {
        /// Server address to query
        server: String,
    },

    /// Measure download throughput
    Download {
        /// Server address to connect to
        server: String,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Requested chunk size in bytes
        #[arg(short = 'l', long)]
        length: Option<i64>,
    },

    /// Measure upload throughput
    Upload {
        /// Server address to connect to
        server: String,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Chunk size in bytes
        #[arg(short = 'l', long, default_value = "65536")]
        length: usize,
    },
}

/// Cancels `token` on Ctrl-C or, on Unix, SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            chunk_size,
            server_id,
            public_url,
        } => {
            let mut config = Config::from_env()?;
            if let Some(addr) = listen {
                config = config.with_listen_addr(addr);
            }
            if let Some(size) = chunk_size {
                config = config.with_chunk_size(size);
            }
            if let Some(id) = server_id {
                config = config.with_server_id(id);
            }
            if let Some(url) = public_url {
                config = config.with_public_url(url);
            }

            info!(
                "Starting server {} ({}, {}, {})",
                config.server_id, config.region, config.city, config.country
            );
            let server = Server::new(config)?;

            let shutdown = CancellationToken::new();
            cancel_on_signal(shutdown.clone());
            server.run(shutdown).await?;
        }

        Commands::Ping { server, count } => {
            let client = Client::new(server);
            for seq in 1..=count {
                let rtt = client.ping().await?;
                println!("seq={} rtt={:.3} ms", seq, rtt.as_secs_f64() * 1000.0);
            }
        }

        Commands::Servers { server, limit } => {
            let client = Client::new(server);
            for info in client.get_servers(limit).await? {
                println!(
                    "{}  {}  {}/{}/{}",
                    info.id, info.url, info.region, info.city, info.country
                );
            }
        }

        Commands::Ip { server } => {
            let client = Client::new(server);
            let location = client.get_client_ip().await?;
            println!("{} ({}, {})", location.ip, location.city, location.country);
        }

        Commands::Download {
            server,
            time,
            length,
        } => {
            let client = Client::new(server);
            cancel_on_signal(client.cancellation_token().clone());

            let report = client.download(length, Duration::from_secs(time)).await?;
            println!(
                "Download: {} bytes in {:.2} s = {:.2} Mbps",
                report.bytes,
                report.duration.as_secs_f64(),
                report.megabits_per_second()
            );
        }

        Commands::Upload {
            server,
            time,
            length,
        } => {
            let client = Client::new(server);
            cancel_on_signal(client.cancellation_token().clone());

            let report = client.upload(length, Duration::from_secs(time)).await?;
            println!(
                "Upload: {} bytes in {:.2} s = {:.2} Mbps",
                report.bytes,
                report.duration.as_secs_f64(),
                report.megabits_per_second()
            );
        }
    }

    Ok(())
}
