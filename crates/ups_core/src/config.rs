//! Configuração unificada via TOML.
//!
//! Cada seção vira uma struct tipada e validada uma única vez no
//! carregamento; o núcleo nunca altera a configuração.

use crate::formula::Formula;
use crate::protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Piso do intervalo de polling, evita busy-loop por configuração.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 5;

/// Erros de carregamento/validação da configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Erro ao parsear configuração: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Configuração inválida: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ──────────────────────────────────────────────
// Servidor NUT
// ──────────────────────────────────────────────

/// Conexão com o servidor NUT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutServerConfig {
    pub host: String,
    pub port: u16,
    /// Intervalo entre ciclos de polling (segundos, mínimo 5)
    pub check_interval: u64,
    /// Limite de conexão + leitura por requisição (segundos)
    pub timeout: u64,
}

impl Default for NutServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            check_interval: 15,
            timeout: 5,
        }
    }
}

impl NutServerConfig {
    /// Intervalo efetivo, com o piso aplicado.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval.max(MIN_CHECK_INTERVAL_SECS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}

// ──────────────────────────────────────────────
// Notificações
// ──────────────────────────────────────────────

/// Escopo da janela de cooldown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// Uma janela por dispositivo.
    #[default]
    PerDevice,
    /// Uma janela única para o processo (limita a caixa de entrada do operador).
    Global,
}

/// Um canal de notificação endereçado por URL com esquema (`ntfy://`, `tgram://`…).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationUrl {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    /// Segundos mínimos entre duas notificações
    pub cooldown: u64,
    pub cooldown_scope: CooldownScope,
    /// Notificar também quando o servidor não responde
    pub notify_on_connection_error: bool,
    pub urls: Vec<NotificationUrl>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: 60,
            cooldown_scope: CooldownScope::default(),
            notify_on_connection_error: true,
            urls: Vec::new(),
        }
    }
}

impl NotificationsConfig {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    /// URLs habilitadas e não vazias.
    pub fn active_urls(&self) -> impl Iterator<Item = &str> {
        self.urls
            .iter()
            .filter(|u| u.enabled)
            .map(|u| u.url.trim())
            .filter(|u| !u.is_empty())
    }
}

// ──────────────────────────────────────────────
// Regras de alerta por dispositivo
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertMode {
    #[default]
    Basic,
    Formula,
}

/// Regra de limiar (mínimo e/ou máximo).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdRule {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Regra de status aceitável do UPS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRule {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptable: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Alerta só quando o status muda (borda, não nível)
    pub alert_when_status_changed: bool,
}

impl StatusRule {
    /// `None` quando a lista de status aceitáveis não foi definida.
    pub fn accepts(&self, status: &str) -> Option<bool> {
        let acceptable = self.acceptable.as_ref()?;
        Some(
            acceptable
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(status.trim())),
        )
    }
}

/// As cinco regras do modo básico.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAlerts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_charge: Option<ThresholdRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ThresholdRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<ThresholdRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_voltage: Option<ThresholdRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ups_status: Option<StatusRule>,
}

/// Expressão booleana sobre o vocabulário fixo de variáveis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormulaRule {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub alert_mode: AlertMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_alerts: Option<BasicAlerts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula_alert: Option<FormulaRule>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            alert_mode: AlertMode::Basic,
            basic_alerts: Some(BasicAlerts {
                battery_charge: Some(ThresholdRule {
                    enabled: true,
                    min: Some(90.0),
                    max: None,
                    message: Some("UPS battery charge below minimum threshold".into()),
                }),
                runtime: Some(ThresholdRule {
                    enabled: true,
                    min: Some(15.0),
                    max: None,
                    message: Some("UPS runtime below minimum threshold".into()),
                }),
                load: Some(ThresholdRule {
                    enabled: true,
                    min: None,
                    max: Some(50.0),
                    message: Some("UPS load exceeds maximum threshold".into()),
                }),
                input_voltage: Some(ThresholdRule {
                    enabled: false,
                    min: Some(110.0),
                    max: Some(130.0),
                    message: Some("UPS input voltage outside acceptable range".into()),
                }),
                ups_status: Some(StatusRule {
                    enabled: true,
                    acceptable: Some(vec!["ol".into(), "online".into()]),
                    message: Some("UPS status not in acceptable list".into()),
                    alert_when_status_changed: false,
                }),
            }),
            formula_alert: Some(FormulaRule {
                expression:
                    "(battery_charge < 90 or actual_runtime_minutes < 20) and ups_load > 20".into(),
                message: Some(
                    "UPS load: {ups_load}%, charge: {battery_charge}%, \
                     runtime: {actual_runtime_minutes:.1f} mins"
                        .into(),
                ),
            }),
        }
    }
}

impl DeviceConfig {
    /// Regras habilitadas sem os limites exigidos.
    ///
    /// Não impede o carregamento: o avaliador ainda reporta cada uma como
    /// veredicto "config error" a cada ciclo.
    pub fn rule_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.alert_mode != AlertMode::Basic {
            return issues;
        }
        let Some(basic) = &self.basic_alerts else {
            issues.push("basic_alerts não definido".to_string());
            return issues;
        };

        let bounds = [
            ("battery_charge", &basic.battery_charge, true, false),
            ("runtime", &basic.runtime, true, false),
            ("load", &basic.load, false, true),
            ("input_voltage", &basic.input_voltage, true, true),
        ];
        for (name, rule, needs_min, needs_max) in bounds {
            let Some(rule) = rule.as_ref().filter(|r| r.enabled) else {
                continue;
            };
            if needs_min && rule.min.is_none() {
                issues.push(format!("basic_alerts.{name}.min ausente"));
            }
            if needs_max && rule.max.is_none() {
                issues.push(format!("basic_alerts.{name}.max ausente"));
            }
        }
        if let Some(status) = basic.ups_status.as_ref().filter(|r| r.enabled) {
            if status.acceptable.is_none() {
                issues.push("basic_alerts.ups_status.acceptable ausente".to_string());
            }
        }
        issues
    }
}

// ──────────────────────────────────────────────
// Raiz
// ──────────────────────────────────────────────

/// Configuração raiz do monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub nut_server: NutServerConfig,
    pub notifications: NotificationsConfig,
    /// Regras por dispositivo; dispositivos descobertos e ausentes aqui
    /// usam [`DeviceConfig::default`].
    pub ups_devices: BTreeMap<String, DeviceConfig>,
}

impl AppConfig {
    /// Parseia e valida uma configuração TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Carrega e valida um arquivo existente.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuração carregada de {}", path.display());
        Ok(config)
    }

    /// Carrega o arquivo ou, se não existir, grava e retorna a configuração padrão.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::try_load(path);
        }
        info!("Usando configuração padrão");
        let config = AppConfig::default();
        config.save(path)?;
        Ok(config)
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Regras do dispositivo, ou as padrão se ele não estiver configurado.
    pub fn device(&self, name: &str) -> Cow<'_, DeviceConfig> {
        match self.ups_devices.get(name) {
            Some(config) => Cow::Borrowed(config),
            None => Cow::Owned(DeviceConfig::default()),
        }
    }

    /// Problemas de regras de todos os dispositivos, prefixados pelo nome.
    pub fn rule_issues(&self) -> Vec<String> {
        self.ups_devices
            .iter()
            .flat_map(|(name, device)| {
                device
                    .rule_issues()
                    .into_iter()
                    .map(move |issue| format!("{name}: {issue}"))
            })
            .collect()
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.nut_server.host.trim().is_empty() {
            errors.push("nut_server.host não pode ser vazio".into());
        }
        if self.nut_server.port == 0 {
            errors.push("nut_server.port não pode ser 0".into());
        }
        if self.nut_server.check_interval == 0 {
            errors.push("nut_server.check_interval não pode ser 0".into());
        }
        if self.nut_server.timeout == 0 {
            errors.push("nut_server.timeout não pode ser 0".into());
        }

        for (i, entry) in self.notifications.urls.iter().enumerate() {
            if entry.enabled && !entry.url.contains("://") {
                errors.push(format!(
                    "notifications.urls[{i}]: URL sem esquema: '{}'",
                    entry.url
                ));
            }
        }

        for (name, device) in &self.ups_devices {
            if device.alert_mode != AlertMode::Formula {
                continue;
            }
            if let Some(rule) = &device.formula_alert {
                if let Err(e) = Formula::parse(&rule.expression) {
                    errors.push(format!("ups_devices.{name}.formula_alert.expression: {e}"));
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        let errors = config.validate();
        assert!(errors.is_empty(), "Erros: {:?}", errors);
        assert!(DeviceConfig::default().rule_issues().is_empty());
    }

    #[test]
    fn roundtrip_toml() {
        let mut config = AppConfig::default();
        config.ups_devices.insert("apc".into(), DeviceConfig::default());
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial = r#"
[nut_server]
host = "10.0.10.101"

[ups_devices.apc.basic_alerts.battery_charge]
enabled = true
min = 50
"#;
        let config = AppConfig::from_toml_str(partial).unwrap();
        assert_eq!(config.nut_server.host, "10.0.10.101");
        assert_eq!(config.nut_server.port, 3493);
        assert_eq!(config.notifications.cooldown, 60);
        assert_eq!(config.notifications.cooldown_scope, CooldownScope::PerDevice);

        let apc = config.device("apc");
        assert_eq!(apc.alert_mode, AlertMode::Basic);
        let basic = apc.basic_alerts.as_ref().unwrap();
        assert_eq!(basic.battery_charge.as_ref().unwrap().min, Some(50.0));
        assert!(basic.runtime.is_none());
        // Seção de fórmula ausente herda o padrão
        assert!(apc.formula_alert.is_some());
    }

    #[test]
    fn unknown_device_gets_defaults() {
        let config = AppConfig::default();
        assert_eq!(*config.device("eaton"), DeviceConfig::default());
    }

    #[test]
    fn poll_interval_has_floor() {
        let server = NutServerConfig {
            check_interval: 1,
            ..Default::default()
        };
        assert_eq!(server.poll_interval(), Duration::from_secs(5));
        let server = NutServerConfig {
            check_interval: 30,
            ..Default::default()
        };
        assert_eq!(server.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_invalid_server_and_urls() {
        let raw = r#"
[nut_server]
host = ""
port = 0

[[notifications.urls]]
url = "not-a-url"
"#;
        match AppConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3, "{errors:?}"),
            other => panic!("esperava Invalid, veio {other:?}"),
        }
    }

    #[test]
    fn rejects_formula_syntax_errors_at_load() {
        let raw = r#"
[ups_devices.apc]
alert_mode = "formula"
[ups_devices.apc.formula_alert]
expression = "ups_load > "
"#;
        assert!(matches!(
            AppConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_deeply_nested_formula_at_load() {
        let expression = format!("{}ups_load{} > 1", "(".repeat(1_500), ")".repeat(1_500));
        let raw = format!(
            "[ups_devices.apc]\nalert_mode = \"formula\"\n\
             [ups_devices.apc.formula_alert]\nexpression = \"{expression}\"\n"
        );
        // Pilha do tamanho de um worker do tokio
        let result = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || AppConfig::from_toml_str(&raw))
            .unwrap()
            .join()
            .unwrap();
        match result {
            Err(ConfigError::Invalid(errors)) => {
                assert!(errors[0].contains("nested too deeply"), "{errors:?}")
            }
            other => panic!("esperava Invalid, veio {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_alert_mode() {
        let raw = "[ups_devices.apc]\nalert_mode = \"fuzzy\"\n";
        assert!(matches!(
            AppConfig::from_toml_str(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn reports_missing_bounds() {
        let raw = r#"
[ups_devices.apc.basic_alerts.load]
enabled = true
[ups_devices.apc.basic_alerts.input_voltage]
enabled = true
min = 100
[ups_devices.apc.basic_alerts.ups_status]
enabled = true
"#;
        let config = AppConfig::from_toml_str(raw).unwrap();
        let issues = config.rule_issues();
        assert_eq!(issues.len(), 3, "{issues:?}");
        assert!(issues.iter().all(|i| i.starts_with("apc: ")));
    }

    #[test]
    fn active_urls_skip_disabled_and_blank() {
        let notifications = NotificationsConfig {
            urls: vec![
                NotificationUrl { url: "ntfy://a".into(), enabled: true },
                NotificationUrl { url: "ntfy://b".into(), enabled: false },
                NotificationUrl { url: "  ".into(), enabled: true },
            ],
            ..Default::default()
        };
        assert_eq!(notifications.active_urls().collect::<Vec<_>>(), vec!["ntfy://a"]);
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let created = AppConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let reloaded = AppConfig::try_load(&path).unwrap();
        assert_eq!(created, reloaded);
    }
}
