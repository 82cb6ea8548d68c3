//! # NUT Simulator
//!
//! Servidor NUT de desenvolvimento com três UPS simulados cujos valores
//! variam com o tempo. Responde `LIST UPS`, `LIST VAR`, `SET VAR`,
//! `LOGIN` e `LOGOUT`.
//!
//! ## Uso
//! ```bash
//! nut_simulator                  # 0.0.0.0:3493
//! nut_simulator --port 3494 --tick 1
//! ```

mod fleet;

use anyhow::Context;
use clap::Parser;
use fleet::Fleet;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ups_core::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "nut_simulator", version, about = "Servidor NUT simulado para desenvolvimento")]
struct Cli {
    /// Endereço de escuta
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Porta TCP
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Intervalo entre atualizações dos valores (segundos)
    #[arg(long, default_value_t = 2)]
    tick: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("Falha ao escutar em {}:{}", cli.host, cli.port))?;
    let fleet = Arc::new(Mutex::new(Fleet::demo()));
    let cancel = CancellationToken::new();

    println!();
    println!("══════════════════════════════════════════════");
    println!("   🔋 NUT SIMULATOR – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  Escutando: {}", listener.local_addr()?);
    println!("  UPS:       {}", fleet.lock().len());
    println!("  Tick:      {}s", cli.tick.max(1));
    println!("══════════════════════════════════════════════");
    println!();

    // ── Variação dos valores ──
    let drift = {
        let fleet = Arc::clone(&fleet);
        let cancel = cancel.clone();
        let every = Duration::from_secs(cli.tick.max(1));
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => fleet.lock().tick(&mut rng),
                }
            }
        })
    };

    // ── Conexões ──
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C recebido, encerrando");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let fleet = Arc::clone(&fleet);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, peer, fleet, cancel).await {
                            warn!("[{peer}] Conexão encerrada com erro: {e}");
                        }
                    });
                }
                Err(e) => error!("Falha ao aceitar conexão: {e}"),
            },
        }
    }

    cancel.cancel();
    if let Err(e) = drift.await {
        error!("Tarefa de simulação terminou com erro: {e}");
    }
    Ok(())
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    fleet: Arc<Mutex<Fleet>>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    debug!("[{peer}] Conectado");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let reply = fleet.lock().handle_command(&line);
        debug!("[{peer}] {} → {} bytes", line.trim(), reply.text().len());
        write.write_all(reply.text().as_bytes()).await?;
        if reply.closes() {
            break;
        }
    }

    debug!("[{peer}] Desconectado");
    Ok(())
}
