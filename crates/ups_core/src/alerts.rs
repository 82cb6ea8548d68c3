//! Avaliação de alertas – modo básico (limiares) e modo fórmula.
//!
//! O [`AlertEvaluator`] guarda o estado de deduplicação de cada
//! dispositivo (último status visto) em um mapa próprio, nunca
//! compartilhado entre dispositivos.

use crate::config::{AlertMode, BasicAlerts, DeviceConfig, FormulaRule, StatusRule, ThresholdRule};
use crate::formula::{Formula, UpsEnv, format_number, render_template};
use crate::types::{AlertVerdict, TelemetrySample};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Estado mutável de um dispositivo entre ciclos.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAlertState {
    /// Último status não vazio avaliado pela regra de status.
    pub last_status: Option<String>,
}

/// Resultado de uma regra básica.
#[derive(Debug, Clone, PartialEq)]
enum Finding {
    Breach(String),
    ConfigError(String),
}

// ──────────────────────────────────────────────
// Avaliador
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AlertEvaluator {
    states: HashMap<String, DeviceAlertState>,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estado registrado para `device`, se ele já foi avaliado.
    pub fn state(&self, device: &str) -> Option<&DeviceAlertState> {
        self.states.get(device)
    }

    /// Descarta o estado de um dispositivo que deixou de ser monitorado.
    pub fn forget(&mut self, device: &str) -> bool {
        self.states.remove(device).is_some()
    }

    /// Avalia uma amostra contra as regras do dispositivo.
    ///
    /// Amostra vazia vira veredicto "no data" sem tocar o estado do
    /// dispositivo.
    pub fn evaluate(
        &mut self,
        device: &str,
        sample: &TelemetrySample,
        config: &DeviceConfig,
    ) -> AlertVerdict {
        if sample.is_empty() {
            warn!("[{device}] sem dados do servidor NUT");
            return AlertVerdict::no_data(device);
        }

        let env = UpsEnv::from_sample(sample);
        let state = self.states.entry(device.to_string()).or_default();

        let verdict = match config.alert_mode {
            AlertMode::Basic => evaluate_basic(device, config.basic_alerts.as_ref(), &env, state),
            AlertMode::Formula => evaluate_formula(device, config.formula_alert.as_ref(), &env),
        };

        if verdict.is_alerting {
            warn!("[{device}] {}", verdict.message);
        } else {
            info!("[{device}] {}", verdict.message);
        }
        verdict
    }
}

fn ok_message(env: &UpsEnv) -> String {
    format!(
        "ups ok: {:.1} min runtime, {}% load, {}% charge",
        env.actual_runtime_minutes,
        format_number(env.ups_load),
        format_number(env.battery_charge)
    )
}

// ──────────────────────────────────────────────
// Modo básico
// ──────────────────────────────────────────────

fn evaluate_basic(
    device: &str,
    basic: Option<&BasicAlerts>,
    env: &UpsEnv,
    state: &mut DeviceAlertState,
) -> AlertVerdict {
    let Some(basic) = basic else {
        error!("[{device}] configuração obrigatória ausente: basic_alerts");
        return AlertVerdict::config_error(
            device,
            "ups alert: config error - basic_alerts not specified",
        );
    };

    let findings: Vec<Finding> = [
        enabled(&basic.battery_charge).and_then(|r| check_battery_charge(device, r, env)),
        enabled(&basic.runtime).and_then(|r| check_runtime(device, r, env)),
        enabled(&basic.load).and_then(|r| check_load(device, r, env)),
        enabled(&basic.input_voltage).and_then(|r| check_input_voltage(device, r, env)),
        basic
            .ups_status
            .as_ref()
            .filter(|r| r.enabled)
            .and_then(|r| check_ups_status(device, r, env, state)),
    ]
    .into_iter()
    .flatten()
    .collect();

    if findings.is_empty() {
        return AlertVerdict::ok(device, ok_message(env));
    }

    let has_config_error = findings.iter().any(|f| matches!(f, Finding::ConfigError(_)));
    let parts: Vec<String> = findings
        .into_iter()
        .map(|f| match f {
            Finding::Breach(msg) | Finding::ConfigError(msg) => msg,
        })
        .collect();
    let message = format!("ups alert: {}", parts.join("; "));

    if has_config_error {
        AlertVerdict::config_error(device, message)
    } else {
        AlertVerdict::alert(device, message)
    }
}

fn enabled(rule: &Option<ThresholdRule>) -> Option<&ThresholdRule> {
    rule.as_ref().filter(|r| r.enabled)
}

fn missing(device: &str, path: &str, message: &str) -> Option<Finding> {
    error!("[{device}] configuração obrigatória ausente: basic_alerts.{path}");
    Some(Finding::ConfigError(format!("config error: {message}")))
}

/// Mensagem configurada ou o texto padrão da regra.
fn rule_message<'a>(
    device: &str,
    name: &str,
    message: &'a Option<String>,
    fallback: &'a str,
) -> &'a str {
    match message.as_deref() {
        Some(msg) => msg,
        None => {
            warn!("[{device}] configuração ausente: basic_alerts.{name}.message");
            fallback
        }
    }
}

fn check_battery_charge(device: &str, rule: &ThresholdRule, env: &UpsEnv) -> Option<Finding> {
    let Some(min) = rule.min else {
        return missing(device, "battery_charge.min", "battery_charge.min not specified");
    };
    if env.battery_charge >= min {
        return None;
    }
    let message = rule_message(
        device,
        "battery_charge",
        &rule.message,
        "battery charge below threshold",
    );
    Some(Finding::Breach(format!(
        "{message} ({:.1}% < {}%)",
        env.battery_charge,
        format_bound(min)
    )))
}

fn check_runtime(device: &str, rule: &ThresholdRule, env: &UpsEnv) -> Option<Finding> {
    let Some(min) = rule.min else {
        return missing(device, "runtime.min", "runtime.min not specified");
    };
    if env.actual_runtime_minutes >= min {
        return None;
    }
    let message = rule_message(device, "runtime", &rule.message, "runtime below minimum threshold");
    Some(Finding::Breach(format!(
        "{message} ({:.1}min < {}min)",
        env.actual_runtime_minutes,
        format_bound(min)
    )))
}

fn check_load(device: &str, rule: &ThresholdRule, env: &UpsEnv) -> Option<Finding> {
    let Some(max) = rule.max else {
        return missing(device, "load.max", "load.max not specified");
    };
    if env.ups_load <= max {
        return None;
    }
    let message = rule_message(device, "load", &rule.message, "ups load exceeds maximum threshold");
    Some(Finding::Breach(format!(
        "{message} ({:.1}% > {}%)",
        env.ups_load,
        format_bound(max)
    )))
}

fn check_input_voltage(device: &str, rule: &ThresholdRule, env: &UpsEnv) -> Option<Finding> {
    let (Some(min), Some(max)) = (rule.min, rule.max) else {
        return missing(device, "input_voltage.min/max", "voltage min/max not specified");
    };
    // Sem leitura de tensão (variável ausente ou 0)
    if env.input_voltage <= 0.0 {
        return None;
    }
    if (min..=max).contains(&env.input_voltage) {
        return None;
    }
    let message = rule_message(
        device,
        "input_voltage",
        &rule.message,
        "input voltage outside acceptable range",
    );
    Some(Finding::Breach(format!("{message} ({:.1}v)", env.input_voltage)))
}

fn check_ups_status(
    device: &str,
    rule: &StatusRule,
    env: &UpsEnv,
    state: &mut DeviceAlertState,
) -> Option<Finding> {
    let status = env.ups_status.as_str();
    let Some(accepted) = rule.accepts(status) else {
        return missing(
            device,
            "ups_status.acceptable",
            "acceptable ups statuses not defined",
        );
    };
    if status.is_empty() {
        return None;
    }

    let previous = state.last_status.replace(status.to_string());
    if accepted {
        return None;
    }
    if rule.alert_when_status_changed && previous.as_deref() == Some(status) {
        debug!("[{device}] status inalterado: {status} (sem alerta)");
        return None;
    }

    let message = rule_message(
        device,
        "ups_status",
        &rule.message,
        "ups status not in acceptable list",
    );
    Some(Finding::Breach(format!("{message} ({status})")))
}

/// Limites configurados aparecem como o operador os escreveu (`90`, `12.5`).
fn format_bound(value: f64) -> String {
    format!("{value}")
}

// ──────────────────────────────────────────────
// Modo fórmula
// ──────────────────────────────────────────────

fn evaluate_formula(device: &str, rule: Option<&FormulaRule>, env: &UpsEnv) -> AlertVerdict {
    let Some(rule) = rule else {
        error!("[{device}] configuração obrigatória ausente: formula_alert");
        return AlertVerdict::config_error(
            device,
            "ups alert: config error - formula_alert not specified",
        );
    };
    let expression = rule.expression.trim();
    if expression.is_empty() {
        error!("[{device}] configuração obrigatória ausente: formula_alert.expression");
        return AlertVerdict::config_error(
            device,
            "ups alert: config error - formula expression not specified",
        );
    }

    // A mensagem é resolvida antes da expressão: variável inválida no
    // template alerta mesmo que a condição seja falsa.
    let alert_message = match &rule.message {
        Some(template) => match render_template(template, env) {
            Ok(msg) => msg,
            Err(e) => {
                error!("[{device}] {e}");
                return AlertVerdict::evaluation_error(device, format!("ups alert: {e}"));
            }
        },
        None => {
            warn!("[{device}] configuração ausente: formula_alert.message");
            "ups alert: formula conditions not met".to_string()
        }
    };

    match Formula::parse(expression).and_then(|formula| formula.evaluate(env)) {
        Ok(true) => AlertVerdict::alert(device, alert_message),
        Ok(false) => AlertVerdict::ok(device, ok_message(env)),
        Err(e) => {
            error!("[{device}] erro ao avaliar fórmula '{expression}': {e}");
            AlertVerdict::evaluation_error(
                device,
                format!("ups alert: error evaluating formula '{expression}': {e}"),
            )
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TelemetryValue, VerdictKind};

    fn sample(pairs: &[(&str, &str)]) -> TelemetrySample {
        pairs
            .iter()
            .map(|(k, v)| (*k, TelemetryValue::coerce(v)))
            .collect()
    }

    fn healthy() -> Vec<(&'static str, &'static str)> {
        vec![
            ("battery.charge", "100"),
            ("battery.runtime", "2856"),
            ("ups.load", "30"),
            ("input.voltage", "120.0"),
            ("ups.status", "OL"),
        ]
    }

    fn with(overrides: &[(&'static str, &'static str)]) -> TelemetrySample {
        let mut pairs = healthy();
        for &(key, value) in overrides {
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => pairs.push((key, value)),
            }
        }
        sample(&pairs)
    }

    fn charge_only(min: Option<f64>) -> DeviceConfig {
        DeviceConfig {
            alert_mode: AlertMode::Basic,
            basic_alerts: Some(BasicAlerts {
                battery_charge: Some(ThresholdRule {
                    enabled: true,
                    min,
                    max: None,
                    message: Some("UPS battery charge below minimum threshold".into()),
                }),
                ..Default::default()
            }),
            formula_alert: None,
        }
    }

    fn status_only(changed_only: bool) -> DeviceConfig {
        DeviceConfig {
            alert_mode: AlertMode::Basic,
            basic_alerts: Some(BasicAlerts {
                ups_status: Some(StatusRule {
                    enabled: true,
                    acceptable: Some(vec!["ol".into(), "online".into()]),
                    message: None,
                    alert_when_status_changed: changed_only,
                }),
                ..Default::default()
            }),
            formula_alert: None,
        }
    }

    fn formula(expression: &str, message: Option<&str>) -> DeviceConfig {
        DeviceConfig {
            alert_mode: AlertMode::Formula,
            basic_alerts: None,
            formula_alert: Some(FormulaRule {
                expression: expression.into(),
                message: message.map(Into::into),
            }),
        }
    }

    #[test]
    fn healthy_sample_is_ok_with_defaults() {
        let mut evaluator = AlertEvaluator::new();
        let verdict = evaluator.evaluate("apc", &sample(&healthy()), &DeviceConfig::default());
        assert!(!verdict.is_alerting, "{}", verdict.message);
        assert_eq!(verdict.kind, VerdictKind::Ok);
        assert_eq!(verdict.message, "ups ok: 47.6 min runtime, 30.0% load, 100.0% charge");
    }

    #[test]
    fn charge_boundary() {
        let mut evaluator = AlertEvaluator::new();
        let config = charge_only(Some(90.0));

        let at_min = evaluator.evaluate("apc", &with(&[("battery.charge", "90")]), &config);
        assert!(!at_min.is_alerting);

        let below = evaluator.evaluate("apc", &with(&[("battery.charge", "89")]), &config);
        assert!(below.is_alerting);
        assert_eq!(below.kind, VerdictKind::Alert);
    }

    #[test]
    fn charge_message_has_one_decimal() {
        let mut evaluator = AlertEvaluator::new();
        let verdict = evaluator.evaluate(
            "apc",
            &with(&[("battery.charge", "40")]),
            &charge_only(Some(90.0)),
        );
        assert!(verdict.is_alerting);
        assert_eq!(
            verdict.message,
            "ups alert: UPS battery charge below minimum threshold (40.0% < 90%)"
        );
    }

    #[test]
    fn missing_bound_is_config_error() {
        let mut evaluator = AlertEvaluator::new();
        let verdict = evaluator.evaluate("apc", &sample(&healthy()), &charge_only(None));
        assert!(verdict.is_alerting);
        assert_eq!(verdict.kind, VerdictKind::ConfigError);
        assert!(verdict.message.contains("config error"), "{}", verdict.message);
    }

    #[test]
    fn missing_basic_section_is_config_error() {
        let config = DeviceConfig {
            basic_alerts: None,
            ..Default::default()
        };
        let verdict = AlertEvaluator::new().evaluate("apc", &sample(&healthy()), &config);
        assert_eq!(verdict.kind, VerdictKind::ConfigError);
    }

    #[test]
    fn multiple_breaches_are_joined() {
        let mut evaluator = AlertEvaluator::new();
        let overrides = [
            ("battery.charge", "40"),
            ("battery.runtime", "300"),
            ("ups.load", "75"),
            ("ups.status", "OB DISCHRG"),
        ];
        let verdict = evaluator.evaluate("apc", &with(&overrides), &DeviceConfig::default());
        assert_eq!(verdict.kind, VerdictKind::Alert);
        assert!(verdict.message.starts_with("ups alert: "));
        assert_eq!(verdict.message.matches("; ").count(), 3, "{}", verdict.message);
        assert!(verdict.message.contains("(5.0min < 15min)"));
        assert!(verdict.message.contains("(75.0% > 50%)"));
        assert!(verdict.message.contains("(ob dischrg)"));
    }

    #[test]
    fn input_voltage_range() {
        let config = DeviceConfig {
            alert_mode: AlertMode::Basic,
            basic_alerts: Some(BasicAlerts {
                input_voltage: Some(ThresholdRule {
                    enabled: true,
                    min: Some(110.0),
                    max: Some(130.0),
                    message: None,
                }),
                ..Default::default()
            }),
            formula_alert: None,
        };
        let mut evaluator = AlertEvaluator::new();
        assert!(!evaluator.evaluate("apc", &sample(&healthy()), &config).is_alerting);

        let high = evaluator.evaluate("apc", &with(&[("input.voltage", "140.2")]), &config);
        assert_eq!(
            high.message,
            "ups alert: input voltage outside acceptable range (140.2v)"
        );

        // Sem leitura de tensão a regra não dispara
        let none = evaluator.evaluate("apc", &with(&[("input.voltage", "0")]), &config);
        assert!(!none.is_alerting);
    }

    #[test]
    fn status_level_triggered_by_default() {
        let mut evaluator = AlertEvaluator::new();
        let config = status_only(false);
        let on_battery = with(&[("ups.status", "OB")]);
        assert!(evaluator.evaluate("apc", &on_battery, &config).is_alerting);
        assert!(evaluator.evaluate("apc", &on_battery, &config).is_alerting);
    }

    #[test]
    fn status_change_suppression() {
        let mut evaluator = AlertEvaluator::new();
        let config = status_only(true);

        let ob = with(&[("ups.status", "OB")]);
        let lb = with(&[("ups.status", "OB LB")]);

        let alerts = [&ob, &ob, &lb, &lb]
            .into_iter()
            .map(|s| evaluator.evaluate("apc", s, &config).is_alerting)
            .collect::<Vec<_>>();
        assert_eq!(alerts, vec![true, false, true, false]);
        assert_eq!(
            evaluator.state("apc").and_then(|s| s.last_status.as_deref()),
            Some("ob lb")
        );
    }

    #[test]
    fn status_recovery_resets_suppression() {
        let mut evaluator = AlertEvaluator::new();
        let config = status_only(true);
        let ob = with(&[("ups.status", "OB")]);
        let ol = with(&[("ups.status", "OL")]);

        assert!(evaluator.evaluate("apc", &ob, &config).is_alerting);
        assert!(!evaluator.evaluate("apc", &ol, &config).is_alerting);
        assert!(evaluator.evaluate("apc", &ob, &config).is_alerting);
    }

    #[test]
    fn status_state_is_per_device() {
        let mut evaluator = AlertEvaluator::new();
        let config = status_only(true);
        let ob = with(&[("ups.status", "OB")]);

        assert!(evaluator.evaluate("apc", &ob, &config).is_alerting);
        // Mesmo status em outro dispositivo não é suprimido
        assert!(evaluator.evaluate("eaton", &ob, &config).is_alerting);
        assert!(!evaluator.evaluate("apc", &ob, &config).is_alerting);
        assert!(!evaluator.evaluate("eaton", &ob, &config).is_alerting);
    }

    #[test]
    fn empty_sample_is_no_data_and_keeps_state() {
        let mut evaluator = AlertEvaluator::new();
        let verdict = evaluator.evaluate("apc", &TelemetrySample::new(), &DeviceConfig::default());
        assert!(verdict.is_alerting);
        assert_eq!(verdict.kind, VerdictKind::NoData);
        assert!(evaluator.state("apc").is_none());
    }

    #[test]
    fn forgotten_device_starts_over() {
        let mut evaluator = AlertEvaluator::new();
        evaluator.evaluate("apc", &sample(&healthy()), &DeviceConfig::default());
        assert!(evaluator.state("apc").is_some());

        assert!(evaluator.forget("apc"));
        assert!(evaluator.state("apc").is_none());
        assert!(!evaluator.forget("apc"));
    }

    #[test]
    fn formula_alerts_with_rendered_message() {
        let config = DeviceConfig {
            alert_mode: AlertMode::Formula,
            ..Default::default()
        };
        let verdict = AlertEvaluator::new().evaluate(
            "apc",
            &with(&[("battery.charge", "40"), ("battery.runtime", "600")]),
            &config,
        );
        assert_eq!(verdict.kind, VerdictKind::Alert);
        assert_eq!(
            verdict.message,
            "UPS load: 30.0%, charge: 40.0%, runtime: 10.0 mins"
        );
    }

    #[test]
    fn formula_false_is_ok() {
        let config = formula("ups_load > 90", Some("load {ups_load}"));
        let verdict = AlertEvaluator::new().evaluate("apc", &sample(&healthy()), &config);
        assert!(!verdict.is_alerting);
    }

    #[test]
    fn formula_fails_closed() {
        let mut evaluator = AlertEvaluator::new();
        let healthy = sample(&healthy());

        let unknown = evaluator.evaluate("apc", &healthy, &formula("ups_temp > 40", Some("x")));
        assert!(unknown.is_alerting);
        assert_eq!(unknown.kind, VerdictKind::EvaluationError);
        assert!(unknown.message.contains("ups_temp"), "{}", unknown.message);

        let traversal = formula("ups_status.__class__", Some("x"));
        assert_eq!(
            evaluator.evaluate("apc", &healthy, &traversal).kind,
            VerdictKind::EvaluationError
        );

        let bad_template = formula("ups_load > 90", Some("load {ups_power}"));
        let verdict = evaluator.evaluate("apc", &healthy, &bad_template);
        assert!(verdict.is_alerting);
        assert_eq!(
            verdict.message,
            "ups alert: invalid variable in formula message: 'ups_power'"
        );
    }

    #[test]
    fn formula_missing_pieces() {
        let mut evaluator = AlertEvaluator::new();
        let healthy = sample(&healthy());

        let no_rule = DeviceConfig {
            alert_mode: AlertMode::Formula,
            basic_alerts: None,
            formula_alert: None,
        };
        assert_eq!(
            evaluator.evaluate("apc", &healthy, &no_rule).kind,
            VerdictKind::ConfigError
        );

        assert_eq!(
            evaluator.evaluate("apc", &healthy, &formula("  ", None)).kind,
            VerdictKind::ConfigError
        );

        let no_message = evaluator.evaluate("apc", &healthy, &formula("ups_load > 1", None));
        assert_eq!(no_message.message, "ups alert: formula conditions not met");
    }
}
