//! Definição de tipos para telemetria de UPS e veredictos de alerta.
//!
//! Uma [`TelemetrySample`] é produzida a cada ciclo de polling de um
//! dispositivo e consumida uma única vez pelo avaliador de alertas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ──────────────────────────────────────────────
// Valores
// ──────────────────────────────────────────────

/// Valor de uma variável NUT após coerção numérica.
///
/// A coerção segue ordem fixa: inteiro, depois float, depois texto cru.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    /// Converte o valor textual recebido do servidor.
    ///
    /// `"15"` vira [`TelemetryValue::Int`], `"27.3"` vira
    /// [`TelemetryValue::Float`] e qualquer outra coisa fica como texto.
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(int) = trimmed.parse::<i64>() {
            return Self::Int(int);
        }
        if let Ok(float) = trimmed.parse::<f64>() {
            return Self::Float(float);
        }
        Self::Text(trimmed.to_string())
    }

    /// Valor numérico, se houver.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            // Floats inteiros mantêm o ponto decimal para não voltarem como Int
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ──────────────────────────────────────────────
// Amostra
// ──────────────────────────────────────────────

/// Amostra de telemetria de um dispositivo: nome da variável → valor.
///
/// Nomes seguem o namespace com pontos do NUT (`battery.charge`, `ups.status`…).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    values: BTreeMap<String, TelemetryValue>,
}

impl TelemetrySample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&TelemetryValue> {
        self.values.get(key)
    }

    /// Valor numérico de uma variável; texto e ausência retornam `None`.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(TelemetryValue::as_f64)
    }

    /// Representação textual de uma variável, qualquer que seja o tipo.
    pub fn text(&self, key: &str) -> Option<String> {
        self.values.get(key).map(ToString::to_string)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TelemetryValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert(&mut self, key: String, value: TelemetryValue) {
        self.values.insert(key, value);
    }
}

impl<K: Into<String>> FromIterator<(K, TelemetryValue)> for TelemetrySample {
    fn from_iter<I: IntoIterator<Item = (K, TelemetryValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

// ──────────────────────────────────────────────
// Veredicto
// ──────────────────────────────────────────────

/// Categoria do veredicto, para distinguir erros de configuração de
/// alertas reais de telemetria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Ok,
    Alert,
    ConfigError,
    EvaluationError,
    NoData,
}

/// Resultado da avaliação de um dispositivo em um ciclo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertVerdict {
    pub device: String,
    pub is_alerting: bool,
    pub message: String,
    pub kind: VerdictKind,
}

impl AlertVerdict {
    pub fn ok(device: &str, message: impl Into<String>) -> Self {
        Self::with_kind(device, VerdictKind::Ok, message)
    }

    pub fn alert(device: &str, message: impl Into<String>) -> Self {
        Self::with_kind(device, VerdictKind::Alert, message)
    }

    pub fn config_error(device: &str, message: impl Into<String>) -> Self {
        Self::with_kind(device, VerdictKind::ConfigError, message)
    }

    pub fn evaluation_error(device: &str, message: impl Into<String>) -> Self {
        Self::with_kind(device, VerdictKind::EvaluationError, message)
    }

    /// Veredicto para um ciclo sem resposta (ou com resposta vazia) do servidor.
    pub fn no_data(device: &str) -> Self {
        Self::with_kind(
            device,
            VerdictKind::NoData,
            format!("ups alert: no data from nut server for '{device}'"),
        )
    }

    fn with_kind(device: &str, kind: VerdictKind, message: impl Into<String>) -> Self {
        Self {
            device: device.to_string(),
            is_alerting: kind != VerdictKind::Ok,
            message: message.into(),
            kind,
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
