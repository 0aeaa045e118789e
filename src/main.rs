use clap::{Parser, Subcommand};
use lancast::common::ServerConfig;
use lancast::crypto::keys::{salt_from_base64, EncryptionKey};
use lancast::metrics::AtomicMetrics;
use lancast::receive::{ParallelUploader, ReceiveOptions, Receiver, UploadOptions};
use lancast::server::ServerInstance;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lancast")]
#[command(about = "Peer-to-peer LAN file and text transfer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a file or directory for one download
    Send {
        #[arg(help = "File or directory to send")]
        path: PathBuf,

        #[arg(long, help = "Require this password (arms encryption)")]
        password: Option<String>,

        #[arg(long, value_name = "MBPS", help = "Cap outbound speed per client")]
        rate_limit: Option<u64>,

        #[arg(long, default_value_t = 0, help = "Port to listen on (0 = pick)")]
        port: u16,
    },

    /// Serve an inline text snippet
    Text {
        text: String,

        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Accept uploads from peers into a directory
    Host {
        #[arg(help = "Directory uploads land in")]
        dir: PathBuf,

        #[arg(long)]
        password: Option<String>,

        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Fetch from a sender URL
    Receive {
        url: String,

        #[arg(long, help = "Output path (defaults to the announced name)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Replace an existing output file")]
        overwrite: bool,

        #[arg(long, help = "Password the sender configured")]
        password: Option<String>,
    },

    /// Push files to a host URL
    Push {
        url: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lancast=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Send {
            path,
            password,
            rate_limit,
            port,
        } => {
            anyhow::ensure!(path.exists(), "file not found: {}", path.display());
            let mut config = ServerConfig::send_file(path);
            config.password = password;
            config.rate_limit_mbps = rate_limit;
            config.port = port;
            serve(config).await
        }

        Commands::Text { text, port } => {
            let mut config = ServerConfig::send_text(text);
            config.port = port;
            serve(config).await
        }

        Commands::Host {
            dir,
            password,
            port,
        } => {
            let mut config = ServerConfig::host(dir);
            config.password = password;
            config.port = port;
            serve(config).await
        }

        Commands::Receive {
            url,
            output,
            overwrite,
            password,
        } => {
            let receiver = Receiver::new();
            let mut opts = ReceiveOptions::new(url.clone());
            opts.output = output;
            opts.overwrite = overwrite;
            opts.key = resolve_key(&receiver, &url, password).await?;

            let outcome = receiver.download(opts).await?;
            println!("Received {} ({} bytes)", outcome.path, outcome.bytes);
            Ok(())
        }

        Commands::Push { url, files } => {
            let uploader = ParallelUploader::new();
            let summary = uploader.upload(UploadOptions::new(url, files)).await?;
            for file in summary.files {
                println!("Sent {} ({} bytes, {} chunks)", file.filename, file.bytes, file.chunks);
            }
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let metrics = AtomicMetrics::new();
    let instance = ServerInstance::start(config, metrics).await?;

    println!("Share this URL: {}", instance.share_url());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    instance.shutdown().await;
    Ok(())
}

/// Work out the decryption key for a protected download: run the
/// handshake when possible, fall back to deriving from the announced salt.
async fn resolve_key(
    receiver: &Receiver,
    url: &str,
    password: Option<String>,
) -> anyhow::Result<Option<EncryptionKey>> {
    let Some(base) = base_url(url) else {
        return Ok(None);
    };

    let info = match receiver.fetch_encrypt_info(&base).await {
        Ok(info) => info,
        Err(_) => return Ok(None),
    };
    if !info.encrypted {
        return Ok(None);
    }

    let password =
        password.ok_or_else(|| anyhow::anyhow!("this download is protected; pass --password"))?;

    match receiver.pake_handshake(&base, &password).await {
        Ok(key) => Ok(Some(key)),
        Err(e) => {
            // Handshake endpoints may be gated; the salt route still works
            tracing::debug!(error = %e, "handshake failed, deriving from salt");
            let salt = info
                .salt
                .ok_or_else(|| anyhow::anyhow!("sender announced encryption but no salt"))?;
            let salt = salt_from_base64(&salt)?;
            Ok(Some(EncryptionKey::derive(&password, &salt)))
        }
    }
}

fn base_url(url: &str) -> Option<String> {
    let scheme_end = url.find("://")? + 3;
    let host_end = url[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(url.len());
    Some(url[..host_end].to_string())
}
