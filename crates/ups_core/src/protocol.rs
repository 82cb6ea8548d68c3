//! Protocolo texto do servidor NUT (Network UPS Tools).
//!
//! Requisições terminam em CRLF; respostas são blocos de linhas:
//!
//! ```text
//! LIST UPS\r\n            →  BEGIN LIST UPS
//!                            UPS apc "Back-UPS RS 1350MS"
//!                            END LIST UPS
//!
//! LIST VAR apc\r\n        →  BEGIN LIST VAR apc
//!                            VAR apc battery.charge "100"
//!                            END LIST VAR apc
//! ```
//!
//! O parser é tolerante: linhas fora do padrão são ignoradas, pois o
//! servidor pode intercalar linhas informativas e o enquadramento
//! `BEGIN`/`END` pode estar ausente.

use crate::types::{TelemetrySample, TelemetryValue};
use std::collections::BTreeMap;
use tracing::trace;

/// Porta padrão do `upsd`.
pub const DEFAULT_PORT: u16 = 3493;

/// Requisições suportadas pelo cliente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Descoberta de dispositivos.
    ListUps,
    /// Variáveis de um dispositivo.
    ListVar(String),
}

impl Request {
    /// Linha de requisição pronta para o socket.
    pub fn encode(&self) -> String {
        match self {
            Self::ListUps => "LIST UPS\r\n".to_string(),
            Self::ListVar(device) => format!("LIST VAR {device}\r\n"),
        }
    }

    /// Linha que fecha o bloco de resposta desta requisição.
    pub fn end_marker(&self) -> String {
        match self {
            Self::ListUps => "END LIST UPS".to_string(),
            Self::ListVar(device) => format!("END LIST VAR {device}"),
        }
    }

    /// Indica se `raw` já contém a resposta completa: o marcador de fim
    /// ou uma linha `ERR`.
    pub fn is_complete(&self, raw: &str) -> bool {
        let end = self.end_marker();
        raw.lines().map(str::trim).any(|line| {
            line.eq_ignore_ascii_case(&end) || line.starts_with("ERR ")
        })
    }
}

/// Resposta `ERR <código>` do servidor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("servidor NUT respondeu ERR {code}")]
pub struct ServerError {
    pub code: String,
}

/// Retorna erro se a resposta for uma linha `ERR`.
pub fn check_server_error(raw: &str) -> Result<(), ServerError> {
    let first = raw.lines().map(str::trim).find(|line| !line.is_empty());
    match first.and_then(|line| line.strip_prefix("ERR ")) {
        Some(code) => Err(ServerError {
            code: code.trim().to_string(),
        }),
        None => Ok(()),
    }
}

/// Dispositivo anunciado por `LIST UPS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub name: String,
    pub description: String,
}

/// Extrai os dispositivos de uma resposta `LIST UPS`.
pub fn parse_device_list(raw: &str) -> Vec<DeviceListing> {
    raw.lines()
        .filter_map(|line| {
            let rest = keyword(line.trim(), "UPS")?;
            let (name, rest) = next_token(rest)?;
            let description = parse_quoted(rest).unwrap_or_default();
            Some(DeviceListing {
                name: name.to_string(),
                description,
            })
        })
        .collect()
}

/// Extrai as variáveis de `device` de uma resposta `LIST VAR`.
///
/// Resposta vazia ou malformada produz amostra vazia.
pub fn parse_variables(raw: &str, device: &str) -> TelemetrySample {
    let mut sample = TelemetrySample::new();
    for (line_device, key, value) in raw.lines().filter_map(parse_var_line) {
        if line_device == device {
            sample.insert(key.to_string(), TelemetryValue::coerce(&value));
        }
    }
    sample
}

/// Agrupa por dispositivo as variáveis de uma resposta que cobre vários.
pub fn parse_all_variables(raw: &str) -> BTreeMap<String, TelemetrySample> {
    let mut devices: BTreeMap<String, TelemetrySample> = BTreeMap::new();
    for (device, key, value) in raw.lines().filter_map(parse_var_line) {
        devices
            .entry(device.to_string())
            .or_default()
            .insert(key.to_string(), TelemetryValue::coerce(&value));
    }
    devices
}

/// Formata uma linha `VAR` (lado servidor).
pub fn format_var_line(device: &str, key: &str, value: &str) -> String {
    format!("VAR {device} {key} \"{}\"", escape(value))
}

/// Formata uma linha `UPS` (lado servidor).
pub fn format_ups_line(name: &str, description: &str) -> String {
    format!("UPS {name} \"{}\"", escape(description))
}

fn parse_var_line(line: &str) -> Option<(&str, &str, String)> {
    let line = line.trim();
    let Some(rest) = keyword(line, "VAR") else {
        if !line.is_empty() {
            trace!("linha ignorada: {line}");
        }
        return None;
    };
    let (device, rest) = next_token(rest)?;
    let (key, rest) = next_token(rest)?;
    let value = parse_quoted(rest)?;
    Some((device, key, value))
}

/// Remove `word` do início da linha, exigindo espaço em seguida.
fn keyword<'a>(line: &'a str, word: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(word)?;
    rest.starts_with(char::is_whitespace).then(|| rest.trim_start())
}

fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() || s.starts_with('"') {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], s[end..].trim_start()))
}

/// Lê `"valor"` com os escapes `\"` e `\\`; nada além de espaço pode
/// vir depois das aspas de fechamento.
fn parse_quoted(s: &str) -> Option<String> {
    let mut chars = s.trim().chars();
    if chars.next()? != '"' {
        return None;
    }
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => {
                return chars.as_str().trim().is_empty().then_some(out);
            }
            other => out.push(other),
        }
    }
    None
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_VAR: &str = "BEGIN LIST VAR apc\n\
        VAR apc battery.charge \"100\"\n\
        VAR apc battery.voltage \"27.3\"\n\
        VAR apc ups.status \"OL\"\n\
        VAR apc ups.test.result \"No test initiated\"\n\
        END LIST VAR apc\n";

    #[test]
    fn requests_are_crlf_terminated() {
        assert_eq!(Request::ListUps.encode(), "LIST UPS\r\n");
        assert_eq!(Request::ListVar("apc".into()).encode(), "LIST VAR apc\r\n");
    }

    #[test]
    fn parses_typed_variables() {
        let sample = parse_variables(LIST_VAR, "apc");
        assert_eq!(sample.len(), 4);
        assert_eq!(sample.get("battery.charge"), Some(&TelemetryValue::Int(100)));
        assert_eq!(sample.get("battery.voltage"), Some(&TelemetryValue::Float(27.3)));
        assert_eq!(sample.get("ups.status"), Some(&TelemetryValue::Text("OL".into())));
        assert_eq!(
            sample.get("ups.test.result"),
            Some(&TelemetryValue::Text("No test initiated".into()))
        );
    }

    #[test]
    fn ignores_other_devices_and_noise() {
        let raw = "garbage line\nVAR eaton ups.load \"12\"\n\
                   VAR apc ups.load \"30\"\nVAR apc broken\n";
        let sample = parse_variables(raw, "apc");
        assert_eq!(sample.len(), 1);
        assert_eq!(sample.number("ups.load"), Some(30.0));
    }

    #[test]
    fn malformed_or_empty_yields_empty_sample() {
        assert!(parse_variables("", "apc").is_empty());
        assert!(parse_variables("ERR UNKNOWN-UPS\n", "apc").is_empty());
        assert!(parse_variables("VAR apc ups.load \"30\" trailing\n", "apc").is_empty());
        assert!(parse_variables("VARapc ups.load \"30\"\n", "apc").is_empty());
    }

    #[test]
    fn handles_escaped_quotes() {
        let raw = r#"VAR apc ups.mfr "ACME \"Power\" \\ Co""#;
        let sample = parse_variables(raw, "apc");
        assert_eq!(sample.text("ups.mfr").as_deref(), Some(r#"ACME "Power" \ Co"#));

        let line = format_var_line("apc", "ups.mfr", r#"ACME "Power" \ Co"#);
        assert_eq!(parse_variables(&line, "apc"), sample);
    }

    #[test]
    fn groups_multi_device_response() {
        let raw = "VAR apc ups.load \"30\"\nVAR eaton ups.load \"12\"\n\
                   VAR eaton ups.status \"OB\"\n";
        let devices = parse_all_variables(raw);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices["eaton"].len(), 2);
        assert_eq!(devices["apc"].number("ups.load"), Some(30.0));
    }

    #[test]
    fn device_list_tolerates_missing_framing() {
        let framed = "BEGIN LIST UPS\nUPS apc \"Back-UPS RS 1350MS\"\n\
                      UPS eaton \"Eaton 5P\"\nEND LIST UPS\n";
        let bare = "UPS apc \"Back-UPS RS 1350MS\"\nUPS eaton \"Eaton 5P\"\n";
        let expected = parse_device_list(framed);
        assert_eq!(expected.len(), 2);
        assert_eq!(expected[0].name, "apc");
        assert_eq!(expected[1].description, "Eaton 5P");
        assert_eq!(parse_device_list(bare), expected);
    }

    #[test]
    fn completion_detection() {
        let req = Request::ListVar("apc".into());
        assert!(!req.is_complete("BEGIN LIST VAR apc\nVAR apc ups.load \"1\"\n"));
        assert!(req.is_complete(LIST_VAR));
        assert!(req.is_complete("ERR UNKNOWN-UPS\n"));
        assert!(Request::ListUps.is_complete("BEGIN LIST UPS\nEND LIST UPS\n"));
    }

    #[test]
    fn detects_server_errors() {
        assert_eq!(
            check_server_error("ERR UNKNOWN-UPS\n"),
            Err(ServerError {
                code: "UNKNOWN-UPS".into()
            })
        );
        assert!(check_server_error(LIST_VAR).is_ok());
        assert!(check_server_error("").is_ok());
    }
}
