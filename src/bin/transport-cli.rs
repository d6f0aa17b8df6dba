use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use transport_core::net::tls::TlsClient;
use transport_core::transport::reader::{self, StreamReader, DEFAULT_READ_LIMIT};
use transport_core::transport::{Transport, TransportBuilder, TransportOptions};

#[derive(Parser)]
#[command(name = "transport-cli")]
#[command(about = "Client for the transport-core echo server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    #[command(flatten)]
    tls: TlsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TlsArgs {
    /// CA certificate (PEM) to trust; enables TLS
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Name to verify the server certificate against
    #[arg(long, default_value = "localhost")]
    server_name: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the echo
    Send { message: String },
    /// Stream bytes through the echo server, honoring backpressure
    Flood {
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        bytes: usize,
        #[arg(long, default_value_t = 16 * 1024)]
        chunk: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (transport, mut reader) = open(cli.addr, &cli.tls).await?;
    if let Some(session) = transport.tls_session() {
        eprintln!(
            "TLS {} {}",
            session.protocol_version.as_deref().unwrap_or("?"),
            session.cipher_suite.as_deref().unwrap_or("?")
        );
    }

    match cli.command {
        Commands::Send { message } => {
            transport.write(message.clone().into_bytes())?;
            let echoed = reader.read_exact(message.len()).await?;
            println!("{}", String::from_utf8_lossy(&echoed));
        }
        Commands::Flood { bytes, chunk } => {
            let chunk = chunk.max(1);
            let started = Instant::now();
            let consumer = tokio::spawn(async move {
                let mut received = 0usize;
                while received < bytes {
                    match reader.read().await? {
                        Some(data) => received += data.len(),
                        None => break,
                    }
                }
                Ok::<_, transport_core::TransportError>(received)
            });

            let block = vec![0x5Au8; chunk];
            let mut sent = 0usize;
            let mut pauses = 0usize;
            while sent < bytes {
                let n = chunk.min(bytes - sent);
                transport.write(block[..n].to_vec())?;
                sent += n;
                if transport.flow_state() == transport_core::transport::FlowState::Paused {
                    pauses += 1;
                    transport.drain().await?;
                }
            }

            let received = consumer.await??;
            let elapsed = started.elapsed();
            println!(
                "sent {} bytes, echoed {} bytes in {:?} ({} backpressure pauses, {:.1} MiB/s)",
                sent,
                received,
                elapsed,
                pauses,
                received as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON)
            );
        }
    }

    transport.close(None).await;
    Ok(())
}

async fn open(addr: SocketAddr, tls: &TlsArgs) -> Result<(Transport, StreamReader), Box<dyn std::error::Error>> {
    let (protocol, reader) = reader::channel(DEFAULT_READ_LIMIT);
    let builder = TransportBuilder::new(TransportOptions::default());
    let transport = match &tls.ca {
        Some(ca) => {
            TlsClient::from_ca_file(ca)?
                .open(builder, addr, &tls.server_name, protocol)
                .await?
        }
        None => builder.connect(addr, protocol).await?,
    };
    Ok((transport, reader))
}
