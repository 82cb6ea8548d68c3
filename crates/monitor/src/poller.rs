//! Polling por dispositivo e o scheduler que mantém uma tarefa por UPS.
//!
//! Ciclo de cada dispositivo:
//! `idle → fetching → parsing → evaluating → (notifying) → idle`.
//! O intervalo é lido da configuração no início de cada ciclo. Falha de
//! conexão vira veredicto "no data"; não há backoff, só a próxima volta.

use crate::client::NutClient;
use crate::notifier::{DispatchOutcome, Notifier, Transport};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ups_core::config::NotificationsConfig;
use ups_core::{AlertEvaluator, AlertVerdict, AppConfig, TelemetrySample, VerdictKind};

/// Espera antes de reiniciar um poller que entrou em pânico.
const RESTART_DELAY: Duration = Duration::from_secs(5);
/// Intervalo entre redescobertas de dispositivos no servidor.
const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Resultado de um ciclo.
#[derive(Debug)]
pub struct CycleReport {
    pub sample: TelemetrySample,
    pub verdict: AlertVerdict,
    pub dispatch: Option<DispatchOutcome>,
}

// ──────────────────────────────────────────────
// DevicePoller
// ──────────────────────────────────────────────

pub struct DevicePoller<T> {
    device: String,
    config: watch::Receiver<Arc<AppConfig>>,
    evaluator: Arc<Mutex<AlertEvaluator>>,
    notifier: Arc<Notifier<T>>,
}

impl<T: Transport> DevicePoller<T> {
    pub fn new(
        device: impl Into<String>,
        config: watch::Receiver<Arc<AppConfig>>,
        evaluator: Arc<Mutex<AlertEvaluator>>,
        notifier: Arc<Notifier<T>>,
    ) -> Self {
        Self {
            device: device.into(),
            config,
            evaluator,
            notifier,
        }
    }

    /// Roda até `cancel`; o cancelamento é observado entre ciclos.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("[{}] Poller iniciado", self.device);
        while !cancel.is_cancelled() {
            let config = Arc::clone(&self.config.borrow_and_update());
            let report = self.run_cycle(&config).await;
            debug!(
                "[{}] Ciclo concluído: {:?}, {} variáveis, notificação entregue: {}",
                self.device,
                report.verdict.kind,
                report.sample.len(),
                report.dispatch.as_ref().is_some_and(DispatchOutcome::delivered)
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.nut_server.poll_interval()) => {}
            }
        }
        info!("[{}] Poller encerrado", self.device);
    }

    /// Um ciclo completo: busca, avaliação e, se preciso, notificação.
    pub async fn run_cycle(&self, config: &AppConfig) -> CycleReport {
        let client = NutClient::from_config(&config.nut_server);
        let sample = match client.fetch_vars(&self.device).await {
            Ok(sample) => sample,
            Err(e) => {
                error!("[{}] Erro ao consultar servidor NUT: {e}", self.device);
                TelemetrySample::new()
            }
        };

        let device_config = config.device(&self.device);
        let verdict = self
            .evaluator
            .lock()
            .evaluate(&self.device, &sample, &device_config);

        let dispatch = if should_notify(&verdict, &config.notifications) {
            let title = format!("UPS alert: {}", self.device);
            let outcome = self
                .notifier
                .notify(&self.device, &title, &verdict.message, &config.notifications)
                .await;
            Some(outcome)
        } else {
            None
        };

        CycleReport {
            sample,
            verdict,
            dispatch,
        }
    }
}

fn should_notify(verdict: &AlertVerdict, notifications: &NotificationsConfig) -> bool {
    verdict.is_alerting
        && (verdict.kind != VerdictKind::NoData || notifications.notify_on_connection_error)
}

// ──────────────────────────────────────────────
// Scheduler
// ──────────────────────────────────────────────

/// Descobre dispositivos e mantém um supervisor por dispositivo.
///
/// O conjunto monitorado é sempre `ups_devices` mais o último `LIST UPS`
/// bem-sucedido; dispositivos que saem desse conjunto têm o poller
/// cancelado e o estado de alerta descartado.
pub struct Scheduler<T> {
    config: watch::Receiver<Arc<AppConfig>>,
    evaluator: Arc<Mutex<AlertEvaluator>>,
    notifier: Arc<Notifier<T>>,
}

/// Pollers em execução, cada um com seu token filho.
type Running = HashMap<String, CancellationToken>;

impl<T: Transport> Scheduler<T> {
    pub fn new(config: watch::Receiver<Arc<AppConfig>>, notifier: Arc<Notifier<T>>) -> Self {
        Self {
            config,
            evaluator: Arc::new(Mutex::new(AlertEvaluator::new())),
            notifier,
        }
    }

    #[cfg(test)]
    pub fn evaluator(&self) -> Arc<Mutex<AlertEvaluator>> {
        Arc::clone(&self.evaluator)
    }

    /// Roda até `cancel` e aguarda todos os pollers terminarem.
    pub async fn run(self, cancel: CancellationToken) {
        let mut updates = self.config.clone();
        let mut tasks = JoinSet::new();
        let mut discoveries = JoinSet::new();
        let mut running = Running::new();
        let mut announced = BTreeSet::new();
        let mut watching = true;

        let mut rediscovery = tokio::time::interval(REDISCOVERY_INTERVAL);
        rediscovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let config = Arc::clone(&updates.borrow_and_update());
        self.reconcile(&config, &announced, &mut running, &mut tasks, &cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rediscovery.tick() => {
                    // Uma descoberta por vez; a próxima espera o próximo tick
                    if discoveries.is_empty() {
                        let client = NutClient::from_config(&updates.borrow().nut_server);
                        discoveries.spawn(async move { client.list_devices().await });
                    }
                }
                Some(result) = discoveries.join_next() => {
                    match result {
                        Ok(Ok(listed)) => {
                            let mut names = BTreeSet::new();
                            for listing in listed {
                                if !announced.contains(&listing.name) {
                                    info!(
                                        "Dispositivo descoberto: {} ({})",
                                        listing.name, listing.description
                                    );
                                }
                                names.insert(listing.name);
                            }
                            announced = names;
                            let config = Arc::clone(&updates.borrow());
                            self.reconcile(&config, &announced, &mut running, &mut tasks, &cancel);
                        }
                        Ok(Err(e)) => warn!("Falha na descoberta de dispositivos: {e}"),
                        Err(e) => error!("Descoberta terminou inesperadamente: {e}"),
                    }
                    if running.is_empty() {
                        warn!(
                            "Nenhum dispositivo para monitorar; nova tentativa em \
                             {REDISCOVERY_INTERVAL:?}"
                        );
                    }
                }
                changed = updates.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Canal de recarga fechado; conjunto de dispositivos fixo");
                        watching = false;
                        continue;
                    }
                    let config = Arc::clone(&updates.borrow_and_update());
                    self.reconcile(&config, &announced, &mut running, &mut tasks, &cancel);
                }
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        error!("Supervisor terminou inesperadamente: {e}");
                    }
                }
            }
        }

        discoveries.abort_all();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Supervisor terminou inesperadamente: {e}");
            }
        }
        info!("Scheduler encerrado");
    }

    /// Inicia pollers para dispositivos novos e cancela os que saíram.
    fn reconcile(
        &self,
        config: &AppConfig,
        announced: &BTreeSet<String>,
        running: &mut Running,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let wanted: BTreeSet<&str> = config
            .ups_devices
            .keys()
            .chain(announced)
            .map(String::as_str)
            .collect();

        running.retain(|device, token| {
            if wanted.contains(device.as_str()) {
                return true;
            }
            info!("[{device}] Fora da configuração; encerrando monitoramento");
            token.cancel();
            false
        });

        for device in wanted {
            if !running.contains_key(device) {
                self.spawn_device(tasks, running, device.to_string(), cancel);
            }
        }
    }

    fn spawn_device(
        &self,
        tasks: &mut JoinSet<()>,
        running: &mut Running,
        device: String,
        cancel: &CancellationToken,
    ) {
        info!("[{device}] Iniciando monitoramento");
        let token = cancel.child_token();
        running.insert(device.clone(), token.clone());

        let config = self.config.clone();
        let evaluator = Arc::clone(&self.evaluator);
        let notifier = Arc::clone(&self.notifier);
        tasks.spawn(async move {
            let start = {
                let device = device.clone();
                let evaluator = Arc::clone(&evaluator);
                let token = token.clone();
                move || {
                    let poller = DevicePoller::new(
                        device.clone(),
                        config.clone(),
                        Arc::clone(&evaluator),
                        Arc::clone(&notifier),
                    );
                    poller.run(token.clone())
                }
            };
            supervise(&device, &token, start).await;
            evaluator.lock().forget(&device);
        });
    }
}

/// Mantém o poller de um dispositivo vivo: pânico em um ciclo não
/// derruba os demais dispositivos nem o próprio.
async fn supervise<F, Fut>(device: &str, cancel: &CancellationToken, mut start: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match tokio::spawn(start()).await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!("[{device}] Poller entrou em pânico; reiniciando em {RESTART_DELAY:?}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
            }
            Err(e) => {
                warn!("[{device}] Poller cancelado: {e}");
                break;
            }
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{
        closed_port, spawn_fake_nut, spawn_recording_nut, spawn_stalling_nut, spawn_unlisted_nut,
        var_requests,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use crate::notifier::Delivery;
    use crate::notifier::test_support::RecordingTransport;
    use ups_core::config::{AlertMode, BasicAlerts, DeviceConfig, NotificationUrl, ThresholdRule};

    const APC: &[(&str, &str)] = &[
        ("battery.charge", "40"),
        ("battery.runtime", "2856"),
        ("ups.load", "15"),
        ("ups.status", "OL"),
    ];

    fn app_config(port: u16) -> AppConfig {
        let mut config = AppConfig::default();
        config.nut_server.port = port;
        config.nut_server.timeout = 2;
        config.notifications.urls = vec![NotificationUrl {
            url: "ntfy://ups".into(),
            enabled: true,
        }];
        config.ups_devices.insert(
            "apc".into(),
            DeviceConfig {
                alert_mode: AlertMode::Basic,
                basic_alerts: Some(BasicAlerts {
                    battery_charge: Some(ThresholdRule {
                        enabled: true,
                        min: Some(90.0),
                        max: None,
                        message: None,
                    }),
                    ..Default::default()
                }),
                formula_alert: None,
            },
        );
        config
    }

    fn poller(
        device: &str,
        config: AppConfig,
    ) -> (DevicePoller<RecordingTransport>, Arc<Notifier<RecordingTransport>>) {
        let (_tx, rx) = watch::channel(Arc::new(config));
        let notifier = Arc::new(Notifier::new(RecordingTransport::default()));
        let poller = DevicePoller::new(
            device,
            rx,
            Arc::new(Mutex::new(AlertEvaluator::new())),
            Arc::clone(&notifier),
        );
        (poller, notifier)
    }

    /// Espera `cond` ficar verdadeira, verificando a cada 50 ms.
    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..1000 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn start_scheduler(
        config: AppConfig,
    ) -> (
        watch::Sender<Arc<AppConfig>>,
        Arc<Mutex<AlertEvaluator>>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = watch::channel(Arc::new(config));
        let notifier = Arc::new(Notifier::new(RecordingTransport::default()));
        let scheduler = Scheduler::new(rx, notifier);
        let evaluator = scheduler.evaluator();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        (tx, evaluator, cancel, handle)
    }

    #[tokio::test]
    async fn low_charge_alerts_and_notifies() {
        let addr = spawn_fake_nut(&[("apc", APC)]).await;
        let config = app_config(addr.port());
        let (poller, notifier) = poller("apc", config.clone());

        let report = poller.run_cycle(&config).await;
        assert_eq!(report.sample.number("battery.charge"), Some(40.0));
        assert!(report.verdict.is_alerting);
        assert!(report.verdict.message.contains("40.0"), "{}", report.verdict.message);
        assert_eq!(
            report.dispatch,
            Some(DispatchOutcome::Attempted(Delivery {
                delivered: 1,
                failed: 0
            }))
        );

        let sent = notifier.transport().sent.lock();
        assert_eq!(sent[0].headers, vec![("Title", "UPS alert: apc".to_string())]);
    }

    #[tokio::test]
    async fn unreachable_server_is_no_data() {
        let port = closed_port().await;
        let mut config = app_config(port);
        // Regras irrelevantes: sem dados o veredicto é sempre "no data"
        config.ups_devices.clear();
        let (poller, _) = poller("apc", config.clone());

        let report = poller.run_cycle(&config).await;
        assert!(report.sample.is_empty());
        assert_eq!(report.verdict.kind, VerdictKind::NoData);
        assert!(report.verdict.message.contains("no data"));
        assert!(report.dispatch.is_some());
    }

    #[tokio::test]
    async fn connection_errors_can_skip_notification() {
        let port = closed_port().await;
        let mut config = app_config(port);
        config.notifications.notify_on_connection_error = false;
        let (poller, notifier) = poller("apc", config.clone());

        let report = poller.run_cycle(&config).await;
        assert!(report.verdict.is_alerting);
        assert!(report.dispatch.is_none());
        assert_eq!(notifier.transport().count(), 0);
    }

    #[tokio::test]
    async fn healthy_device_does_not_notify() {
        let eaton: &[(&str, &str)] = &[("battery.charge", "100"), ("ups.status", "OL")];
        let addr = spawn_fake_nut(&[("eaton", eaton)]).await;
        let config = app_config(addr.port());
        let (poller, notifier) = poller("eaton", config.clone());

        let report = poller.run_cycle(&config).await;
        assert!(!report.verdict.is_alerting, "{}", report.verdict.message);
        assert!(report.dispatch.is_none());
        assert_eq!(notifier.transport().count(), 0);
    }

    #[tokio::test]
    async fn poller_stops_on_cancel() {
        let addr = spawn_fake_nut(&[("apc", APC)]).await;
        let (poller, notifier) = poller("apc", app_config(addr.port()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        // Primeiro ciclo notifica, depois o poller dorme no intervalo
        for _ in 0..100 {
            if notifier.transport().count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(notifier.transport().count(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller não terminou após cancelamento")
            .unwrap();
    }

    #[tokio::test]
    async fn scheduler_polls_discovered_devices() {
        let addr = spawn_fake_nut(&[("apc", APC), ("eaton", &[("battery.charge", "100")])]).await;
        let (_tx, rx) = watch::channel(Arc::new(app_config(addr.port())));
        let notifier = Arc::new(Notifier::new(RecordingTransport::default()));
        let scheduler = Scheduler::new(rx, notifier);
        let evaluator = scheduler.evaluator();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        let mut seen = false;
        for _ in 0..100 {
            {
                let evaluator = evaluator.lock();
                seen = evaluator.state("apc").is_some() && evaluator.state("eaton").is_some();
            }
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "ambos os dispositivos deveriam ter sido avaliados");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler não terminou após cancelamento")
            .unwrap();
    }

    #[tokio::test]
    async fn scheduler_spawns_devices_added_by_reload() {
        let addr = spawn_unlisted_nut(&[("late", APC)]).await;
        let mut config = app_config(addr.port());
        config.ups_devices.clear();
        let (tx, rx) = watch::channel(Arc::new(config.clone()));
        let notifier = Arc::new(Notifier::new(RecordingTransport::default()));
        let scheduler = Scheduler::new(rx, notifier);
        let evaluator = scheduler.evaluator();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        let mut reloaded = config;
        reloaded
            .ups_devices
            .insert("late".into(), DeviceConfig::default());
        tx.send_replace(Arc::new(reloaded));

        let mut seen = false;
        for _ in 0..100 {
            seen = evaluator.lock().state("late").is_some();
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "dispositivo novo deveria ter um poller");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler não terminou após cancelamento")
            .unwrap();
    }

    #[tokio::test]
    async fn scheduler_stops_devices_removed_by_reload() {
        let addr = spawn_unlisted_nut(&[("apc", APC), ("retired", APC)]).await;
        let mut config = app_config(addr.port());
        config
            .ups_devices
            .insert("retired".into(), DeviceConfig::default());
        let (tx, evaluator, cancel, handle) = start_scheduler(config.clone());

        assert!(
            wait_for(|| {
                let evaluator = evaluator.lock();
                evaluator.state("apc").is_some() && evaluator.state("retired").is_some()
            })
            .await,
            "ambos os dispositivos deveriam ter sido avaliados"
        );

        config.ups_devices.remove("retired");
        tx.send_replace(Arc::new(config));

        // O estado só é descartado depois que o poller termina
        assert!(
            wait_for(|| evaluator.lock().state("retired").is_none()).await,
            "poller do dispositivo removido deveria ter terminado"
        );
        assert!(evaluator.lock().state("apc").is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler não terminou após cancelamento")
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_device_does_not_delay_others() {
        let addr = spawn_stalling_nut(&[("slow", APC), ("apc", APC)], &["slow"]).await;
        let mut config = app_config(addr.port());
        config.ups_devices.insert("slow".into(), DeviceConfig::default());
        let started = std::time::Instant::now();
        let (_tx, evaluator, cancel, handle) = start_scheduler(config);

        assert!(wait_for(|| evaluator.lock().state("apc").is_some()).await);
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert!(evaluator.lock().state("slow").is_none());

        // O poller de "slow" só observa o cancelamento ao fim da requisição
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler não terminou após cancelamento")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_is_not_blocked_by_discovery() {
        // Aceita a conexão e nunca responde ao LIST UPS
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                open.push(stream);
            }
        });

        let mut config = app_config(port);
        config.ups_devices.clear();
        config.nut_server.timeout = 30;
        let (_tx, _evaluator, cancel, handle) = start_scheduler(config);

        assert!(wait_for(|| accepted.load(Ordering::SeqCst) > 0).await);
        let started = std::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("descoberta em andamento segurou o scheduler")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_read_at_each_cycle() {
        let (addr, log) = spawn_recording_nut(&[("apc", APC)]).await;
        let mut config = app_config(addr.port());
        config.nut_server.check_interval = 5;
        let (tx, rx) = watch::channel(Arc::new(config.clone()));
        let notifier = Arc::new(Notifier::new(RecordingTransport::default()));
        let poller = DevicePoller::new(
            "apc",
            rx,
            Arc::new(Mutex::new(AlertEvaluator::new())),
            notifier,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        assert!(wait_for(|| !var_requests(&log, "apc").is_empty()).await);
        // O ciclo atual já dorme 5 s; o novo intervalo vale a partir do próximo
        config.nut_server.check_interval = 30;
        tx.send_replace(Arc::new(config));

        assert!(wait_for(|| var_requests(&log, "apc").len() >= 3).await);
        let times = var_requests(&log, "apc");
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(
            (Duration::from_secs(5)..Duration::from_secs(6)).contains(&first_gap),
            "{first_gap:?}"
        );
        assert!(
            (Duration::from_secs(30)..Duration::from_secs(31)).contains(&second_gap),
            "{second_gap:?}"
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_after_panic() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let cancel = CancellationToken::new();
        let began = tokio::time::Instant::now();

        supervise("apc", &cancel, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    panic!("falha no ciclo {attempt}");
                }
            }
        })
        .await;

        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert!(began.elapsed() >= RESTART_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_gives_up_on_cancel() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let supervised = supervise("apc", &cancel, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { panic!("sempre falha"); }
        });
        tokio::join!(supervised, async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
