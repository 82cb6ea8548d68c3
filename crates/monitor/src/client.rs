//! Cliente assíncrono do servidor NUT.
//!
//! Uma conexão TCP por requisição, sem pool. Conexão e leitura
//! compartilham um único prazo (`timeout`): um servidor que mantém o
//! socket aberto nunca segura o chamador além dele.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use ups_core::TelemetrySample;
use ups_core::config::NutServerConfig;
use ups_core::protocol::{self, DeviceListing, Request, ServerError};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Falha ao conectar em {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sem resposta de {addr} em {timeout:?}")]
    TimedOut { addr: String, timeout: Duration },

    #[error("Erro de I/O com o servidor NUT: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug, Clone)]
pub struct NutClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl NutClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn from_config(config: &NutServerConfig) -> Self {
        Self::new(config.host.clone(), config.port, config.request_timeout())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Envia `request` e retorna a resposta textual.
    ///
    /// A leitura termina no marcador `END LIST`, numa linha `ERR`, no
    /// fechamento do socket ou no prazo. Se o prazo vence com dados
    /// parciais, eles são retornados.
    pub async fn request(&self, request: &Request) -> Result<String, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = || ClientError::TimedOut {
            addr: self.addr(),
            timeout: self.timeout,
        };

        let mut stream = timeout_at(deadline, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| timed_out())?
            .map_err(|source| ClientError::Connect {
                addr: self.addr(),
                source,
            })?;

        timeout_at(deadline, stream.write_all(request.encode().as_bytes()))
            .await
            .map_err(|_| timed_out())??;

        let mut raw = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Err(_) if raw.is_empty() => return Err(timed_out()),
                Err(_) => {
                    warn!(
                        "Resposta incompleta de {} após {:?} ({} bytes)",
                        self.addr(),
                        self.timeout,
                        raw.len()
                    );
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    raw.extend_from_slice(&buf[..n]);
                    if request.is_complete(&String::from_utf8_lossy(&raw)) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(ClientError::Io(e)),
            }
        }

        let text = String::from_utf8_lossy(&raw).into_owned();
        debug!("← {} bytes de {}", text.len(), self.addr());
        protocol::check_server_error(&text)?;
        Ok(text)
    }

    /// `LIST UPS`: dispositivos anunciados pelo servidor.
    pub async fn list_devices(&self) -> Result<Vec<DeviceListing>, ClientError> {
        let raw = self.request(&Request::ListUps).await?;
        Ok(protocol::parse_device_list(&raw))
    }

    /// `LIST VAR <device>`: amostra atual do dispositivo.
    pub async fn fetch_vars(&self, device: &str) -> Result<TelemetrySample, ClientError> {
        let raw = self.request(&Request::ListVar(device.to_string())).await?;
        Ok(protocol::parse_variables(&raw, device))
    }
}

// ──────────────────────────────────────────────
// Servidor NUT falso para testes
// ──────────────────────────────────────────────
