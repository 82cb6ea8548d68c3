//! Notificações – canais por URL com esquema, transporte HTTP e cooldown.
//!
//! Cada canal é independente: a falha de um não impede os demais. O
//! cooldown é reservado antes do envio e devolvido se nenhum canal
//! entregar a mensagem.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ups_core::config::{CooldownScope, NotificationsConfig};
use url::Url;

/// Aviso prefixado às mensagens cortadas no limite do canal.
pub const SHORTENED_NOTICE: &str = "this message had to be shortened:\n";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Esquema de notificação não suportado: '{0}'")]
    UnsupportedScheme(String),

    #[error("URL de notificação inválida ({scheme}://…): {reason}")]
    InvalidUrl { scheme: String, reason: String },

    #[error("Falha HTTP: {0}")]
    Http(reqwest::Error),

    #[error("{channel} respondeu HTTP {status}")]
    Status { channel: &'static str, status: u16 },
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        // A URL pode conter tokens (Telegram, Discord)
        Self::Http(e.without_url())
    }
}

// ──────────────────────────────────────────────
// Canais
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Channel {
    /// `ntfy://topic`, `ntfy://host/topic`, `ntfys://host/topic`
    Ntfy { endpoint: Url },
    /// `tgram://bot_token/chat_id`
    Telegram { endpoint: Url, chat_id: String },
    /// `discord://webhook_id/webhook_token`
    Discord { endpoint: Url },
    /// `json://host/path`, `jsons://host/path`
    Json { endpoint: Url },
}

/// Corpo de uma requisição de saída.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
}

/// Requisição POST pronta para o transporte.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub channel: &'static str,
    pub endpoint: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl Channel {
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let raw = raw.trim();
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Err(DispatchError::InvalidUrl {
                scheme: String::new(),
                reason: "esquema ausente".into(),
            });
        };
        let scheme = scheme.to_ascii_lowercase();
        let rest = rest.trim_end_matches('/');
        let invalid = |reason: &str| DispatchError::InvalidUrl {
            scheme: scheme.clone(),
            reason: reason.to_string(),
        };
        let url = |s: String| Url::parse(&s).map_err(|e| invalid(&e.to_string()));

        match scheme.as_str() {
            "ntfy" | "ntfys" => {
                if rest.is_empty() {
                    return Err(invalid("tópico ausente"));
                }
                let endpoint = match (rest.contains('/'), scheme.as_str()) {
                    (false, _) => url(format!("https://ntfy.sh/{rest}"))?,
                    (true, "ntfy") => url(format!("http://{rest}"))?,
                    (true, _) => url(format!("https://{rest}"))?,
                };
                Ok(Self::Ntfy { endpoint })
            }
            "tgram" => {
                let (token, chat_id) =
                    two_parts(rest).ok_or_else(|| invalid("esperado tgram://token/chat_id"))?;
                let endpoint = url(format!("https://api.telegram.org/bot{token}/sendMessage"))?;
                Ok(Self::Telegram {
                    endpoint,
                    chat_id: chat_id.to_string(),
                })
            }
            "discord" => {
                let (id, token) =
                    two_parts(rest).ok_or_else(|| invalid("esperado discord://id/token"))?;
                let endpoint = url(format!("https://discord.com/api/webhooks/{id}/{token}"))?;
                Ok(Self::Discord { endpoint })
            }
            "json" | "jsons" => {
                if rest.is_empty() {
                    return Err(invalid("host ausente"));
                }
                let http = if scheme == "jsons" { "https" } else { "http" };
                Ok(Self::Json {
                    endpoint: url(format!("{http}://{rest}"))?,
                })
            }
            _ => Err(DispatchError::UnsupportedScheme(scheme.clone())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ntfy { .. } => "ntfy",
            Self::Telegram { .. } => "telegram",
            Self::Discord { .. } => "discord",
            Self::Json { .. } => "json",
        }
    }

    /// Tamanho máximo do corpo, em caracteres.
    pub fn body_limit(&self) -> usize {
        match self {
            Self::Ntfy { .. } | Self::Telegram { .. } => 4096,
            Self::Discord { .. } => 2000,
            Self::Json { .. } => 1900,
        }
    }

    pub fn build_request(&self, title: &str, message: &str) -> Outbound {
        let limit = self.body_limit();
        let (endpoint, headers, body) = match self {
            Self::Ntfy { endpoint } => (
                endpoint.clone(),
                vec![("Title", title.to_string())],
                Body::Text(shorten(message, limit)),
            ),
            Self::Telegram { endpoint, chat_id } => (
                endpoint.clone(),
                Vec::new(),
                Body::Json(json!({
                    "chat_id": chat_id,
                    "text": shorten(&format!("{title}\n{message}"), limit),
                })),
            ),
            Self::Discord { endpoint } => (
                endpoint.clone(),
                Vec::new(),
                Body::Json(json!({
                    "content": shorten(&format!("**{title}**\n{message}"), limit),
                })),
            ),
            Self::Json { endpoint } => (
                endpoint.clone(),
                Vec::new(),
                Body::Json(json!({
                    "title": title,
                    "message": shorten(message, limit),
                    "type": "failure",
                })),
            ),
        };
        Outbound {
            channel: self.kind(),
            endpoint,
            headers,
            body,
        }
    }
}

fn two_parts(rest: &str) -> Option<(&str, &str)> {
    let (first, second) = rest.split_once('/')?;
    (!first.is_empty() && !second.is_empty() && !second.contains('/')).then_some((first, second))
}

/// Corta `message` para caber em `limit` caracteres, com o aviso na frente.
pub fn shorten(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message.to_string();
    }
    let keep = limit.saturating_sub(SHORTENED_NOTICE.chars().count());
    let mut out = String::from(SHORTENED_NOTICE);
    out.extend(message.chars().take(keep));
    out
}

// ──────────────────────────────────────────────
// Transporte
// ──────────────────────────────────────────────

/// Envio de uma requisição; separado para os testes não usarem rede.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Outbound) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ups_monitor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: Outbound) -> Result<(), DispatchError> {
        let mut builder = self.client.post(request.endpoint);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        builder = match request.body {
            Body::Text(text) => builder.body(text),
            Body::Json(value) => builder.json(&value),
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                channel: request.channel,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Cooldown
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CooldownKey {
    Global,
    Device(String),
}

impl CooldownKey {
    pub fn new(scope: CooldownScope, device: &str) -> Self {
        match scope {
            CooldownScope::PerDevice => Self::Device(device.to_string()),
            CooldownScope::Global => Self::Global,
        }
    }
}

/// Janela reservada; devolvida com [`CooldownGate::release`] se o envio falhar.
#[derive(Debug)]
pub struct Reservation {
    key: CooldownKey,
    taken: Instant,
    previous: Option<Instant>,
}

/// Horário do último envio por chave.
#[derive(Debug, Default)]
pub struct CooldownGate {
    last_sent: Mutex<HashMap<CooldownKey, Instant>>,
}

impl CooldownGate {
    /// Reserva a janela atomicamente, ou retorna o tempo restante.
    pub fn try_reserve(
        &self,
        key: &CooldownKey,
        cooldown: Duration,
    ) -> Result<Reservation, Duration> {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock();
        if let Some(last) = last_sent.get(key) {
            let elapsed = now.duration_since(*last);
            if elapsed < cooldown {
                return Err(cooldown - elapsed);
            }
        }
        let previous = last_sent.insert(key.clone(), now);
        Ok(Reservation {
            key: key.clone(),
            taken: now,
            previous,
        })
    }

    pub fn release(&self, reservation: Reservation) {
        let mut last_sent = self.last_sent.lock();
        // Uma reserva mais nova para a mesma chave prevalece
        if last_sent.get(&reservation.key) != Some(&reservation.taken) {
            return;
        }
        match reservation.previous {
            Some(previous) => last_sent.insert(reservation.key, previous),
            None => last_sent.remove(&reservation.key),
        };
    }
}

// ──────────────────────────────────────────────
// Dispatcher
// ──────────────────────────────────────────────

/// Contagem de canais de um envio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Disabled,
    NoChannels,
    Suppressed { remaining: Duration },
    Attempted(Delivery),
}

impl DispatchOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Attempted(d) if d.delivered > 0)
    }
}

pub struct Notifier<T> {
    transport: T,
    gate: CooldownGate,
}

impl<T: Transport> Notifier<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            gate: CooldownGate::default(),
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Envia para todas as URLs, sem cooldown.
    pub async fn send_all<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
        title: &str,
        message: &str,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for raw in urls {
            let result = match Channel::parse(raw) {
                Ok(channel) => {
                    let kind = channel.kind();
                    self.transport
                        .send(channel.build_request(title, message))
                        .await
                        .map(|()| kind)
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(kind) => {
                    info!("Notificação enviada via {kind}");
                    delivery.delivered += 1;
                }
                Err(e) => {
                    warn!("Falha ao notificar: {e}");
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }

    /// Envia um alerta de `device` respeitando habilitação e cooldown.
    pub async fn notify(
        &self,
        device: &str,
        title: &str,
        message: &str,
        config: &NotificationsConfig,
    ) -> DispatchOutcome {
        if !config.enabled {
            debug!("[{device}] notificações desabilitadas");
            return DispatchOutcome::Disabled;
        }
        let urls: Vec<&str> = config.active_urls().collect();
        if urls.is_empty() {
            debug!("[{device}] nenhum canal de notificação habilitado");
            return DispatchOutcome::NoChannels;
        }

        let key = CooldownKey::new(config.cooldown_scope, device);
        let reservation = match self.gate.try_reserve(&key, config.cooldown_duration()) {
            Ok(reservation) => reservation,
            Err(remaining) => {
                debug!("[{device}] notificação suprimida (cooldown, faltam {remaining:?})");
                return DispatchOutcome::Suppressed { remaining };
            }
        };

        let delivery = self.send_all(urls, title, message).await;
        if delivery.delivered == 0 {
            warn!("[{device}] nenhum canal entregou a notificação; cooldown liberado");
            self.gate.release(reservation);
        }
        DispatchOutcome::Attempted(delivery)
    }
}

// ──────────────────────────────────────────────
// Transporte de teste
// ──────────────────────────────────────────────
