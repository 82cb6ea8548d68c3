//! # UPS Monitor
//!
//! Consulta servidores NUT, avalia as regras de alerta de cada UPS e
//! envia notificações pelos canais configurados.
//!
//! ## Uso
//! ```bash
//! ups_monitor                          # config.toml ao lado do executável
//! ups_monitor --config /etc/ups.toml   # caminho explícito
//! ups_monitor --test-notify            # testa os canais e sai
//! ```

mod client;
mod notifier;
mod poller;
mod reload;

use anyhow::{Context, bail};
use clap::Parser;
use notifier::{HttpTransport, Notifier};
use poller::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ups_core::AppConfig;

/// Limite por requisição HTTP de notificação.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "ups_monitor",
    version,
    about = "Monitor de UPS via NUT com alertas e notificações"
)]
struct Cli {
    /// Caminho do config.toml (padrão: ao lado do executável)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Envia uma notificação de teste para todos os canais habilitados e sai
    #[arg(long)]
    test_notify: bool,

    /// Intervalo de verificação do config.toml para recarga (segundos)
    #[arg(long, default_value_t = 5)]
    reload_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // ── Carregar config ──
    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_create(&config_path)
        .with_context(|| format!("Falha ao carregar {}", config_path.display()))?;
    for issue in config.rule_issues() {
        warn!("Regra incompleta: {issue}");
    }

    let transport = HttpTransport::new(HTTP_TIMEOUT).context("Falha ao criar cliente HTTP")?;
    let notifier = Arc::new(Notifier::new(transport));

    // ── Teste de notificação ──
    if cli.test_notify {
        let delivery = notifier
            .send_all(
                config.notifications.active_urls(),
                "Test Notification",
                "This is a test notification from ups_monitor.",
            )
            .await;
        info!(
            "Teste de notificação: {} entregue(s), {} falha(s)",
            delivery.delivered, delivery.failed
        );
        if delivery.delivered == 0 {
            bail!("Nenhum canal entregou a notificação de teste");
        }
        return Ok(());
    }

    // ── Banner ──
    let server = &config.nut_server;
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ⚡ UPS MONITOR – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  Servidor:  {}:{}", server.host, server.port);
    println!("  Intervalo: {}s", server.poll_interval().as_secs());
    println!("  Canais:    {}", config.notifications.active_urls().count());
    println!("  Config:    {}", config_path.display());
    println!("══════════════════════════════════════════════");
    println!();

    // ── Tarefas ──
    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let cancel = CancellationToken::new();

    let reloader = reload::spawn_reloader(
        config_path,
        config_tx,
        Duration::from_secs(cli.reload_interval.max(1)),
        cancel.clone(),
    );
    let scheduler = tokio::spawn(Scheduler::new(config_rx, notifier).run(cancel.clone()));

    shutdown_signal().await;
    info!("Sinal de encerramento recebido");
    cancel.cancel();

    if let Err(e) = scheduler.await {
        error!("Scheduler terminou com erro: {e}");
    }
    if let Err(e) = reloader.await {
        error!("Recarga de configuração terminou com erro: {e}");
    }
    info!("Encerrado");
    Ok(())
}

/// Ctrl+C em qualquer plataforma; SIGTERM também no Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Falha ao instalar handler de Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Falha ao instalar handler de SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
