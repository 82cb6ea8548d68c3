//! # UPS Core
//!
//! Crate compartilhada com o núcleo de monitoramento de UPS: tipos de
//! telemetria, protocolo texto do NUT, configuração TOML e avaliação de
//! alertas. Não faz I/O de rede.
//!
//! ## Módulos
//! - [`types`] – Amostras de telemetria e veredictos
//! - [`protocol`] – Requisições e parser de respostas NUT
//! - [`config`] – Configuração unificada via TOML
//! - [`formula`] – Expressões de alerta (lexer, AST, avaliação)
//! - [`alerts`] – Avaliador de regras e estado por dispositivo

pub mod types;
pub mod protocol;
pub mod config;
pub mod formula;
pub mod alerts;

// Re-exports convenientes
pub use types::{AlertVerdict, TelemetrySample, TelemetryValue, VerdictKind};
pub use protocol::{Request, DEFAULT_PORT};
pub use config::{AppConfig, ConfigError, DeviceConfig, NotificationsConfig};
pub use alerts::AlertEvaluator;
