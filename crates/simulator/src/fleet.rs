//! Frota simulada de UPS e o interpretador de comandos NUT.
//!
//! Os valores derivam a cada tick: carga oscila, tensão de entrada varia
//! em torno da nominal e, de vez em quando, um UPS perde a energia e passa
//! a descarregar a bateria até a energia voltar.

use rand::Rng;
use std::collections::BTreeMap;
use tracing::info;
use ups_core::protocol::{format_ups_line, format_var_line};

/// Resposta a um comando; `Close` encerra a conexão após o envio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Close(String),
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(t) | Self::Close(t) => t,
        }
    }

    pub fn closes(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

fn line(s: &str) -> Reply {
    Reply::Text(format!("{s}\n"))
}

// ──────────────────────────────────────────────
// Dispositivo
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimulatedUps {
    vars: BTreeMap<String, String>,
    initial_runtime: f64,
}

impl SimulatedUps {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let initial_runtime = vars
            .get("battery.runtime")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        Self {
            vars,
            initial_runtime,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn num(&self, key: &str) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    fn on_battery(&self) -> bool {
        self.get("ups.status")
            .is_some_and(|s| s.split_whitespace().any(|flag| flag == "OB" || flag == "LB"))
    }

    /// Avança a simulação em um passo.
    pub fn tick<R: Rng>(&mut self, name: &str, rng: &mut R) {
        let load = (self.num("ups.load") + f64::from(rng.gen_range(-2i32..=2))).clamp(5.0, 100.0);
        self.set("ups.load", format!("{load:.0}"));

        let voltage = if self.num("input.voltage.nominal") == 120.0 {
            rng.gen_range(118.5..=121.5)
        } else {
            rng.gen_range(218.0..=222.0)
        };

        if self.on_battery() {
            self.set("input.voltage", "0.0");
            let charge = self.num("battery.charge");
            if charge > 0.0 {
                self.set("battery.charge", format!("{:.0}", charge - 1.0));
                let runtime = (self.num("battery.runtime") * 0.95).floor().max(0.0);
                self.set("battery.runtime", format!("{runtime:.0}"));
                let volts = self.num("battery.voltage") - 0.05;
                self.set("battery.voltage", format!("{volts:.2}"));
            }
            if self.num("battery.charge") <= self.num("battery.charge.low") {
                self.set("ups.status", "OB LB");
            }
            if rng.gen_ratio(1, 50) {
                info!("[{name}] energia restabelecida");
                self.set("ups.status", "OL CHRG");
                self.set("input.transfer.reason", "input voltage out of range");
            }
            return;
        }

        self.set("input.voltage", format!("{voltage:.1}"));
        let charge = self.num("battery.charge");
        if charge < 100.0 {
            self.set("battery.charge", format!("{:.0}", (charge + 1.0).min(100.0)));
            let runtime = (self.num("battery.runtime") * 1.05).floor().min(self.initial_runtime);
            self.set("battery.runtime", format!("{runtime:.0}"));
        } else if self.get("ups.status") == Some("OL CHRG") {
            self.set("ups.status", "OL");
        }

        let cap = self.num("battery.voltage.nominal") * 1.14;
        let volts = self.num("battery.voltage");
        if volts < cap {
            self.set("battery.voltage", format!("{:.2}", (volts + 0.05).min(cap)));
        }

        if rng.gen_ratio(1, 200) {
            info!("[{name}] queda de energia simulada");
            self.set("ups.status", "OB DISCHRG");
            self.set("input.transfer.reason", "simulated power loss");
        }
    }
}

// ──────────────────────────────────────────────
// Frota
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Fleet {
    devices: BTreeMap<String, SimulatedUps>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, ups: SimulatedUps) {
        self.devices.insert(name.to_string(), ups);
    }

    pub fn device(&self, name: &str) -> Option<&SimulatedUps> {
        self.devices.get(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Três UPS de fabricantes diferentes, 120 V e 220 V.
    pub fn demo() -> Self {
        let mut fleet = Self::new();
        fleet.insert(
            "apc",
            SimulatedUps::new(&[
                ("battery.charge", "100"),
                ("battery.charge.low", "10"),
                ("battery.charge.warning", "50"),
                ("battery.date", "2025/01/10"),
                ("battery.runtime", "2856"),
                ("battery.runtime.low", "120"),
                ("battery.type", "PbAc"),
                ("battery.voltage", "27.3"),
                ("battery.voltage.nominal", "24.0"),
                ("device.mfr", "American Power Conversion"),
                ("device.model", "Back-UPS RS 1350MS"),
                ("device.serial", "3B2026X27482"),
                ("device.type", "ups"),
                ("driver.name", "usbhid-ups"),
                ("driver.version", "2.8.2"),
                ("input.sensitivity", "medium"),
                ("input.transfer.high", "144"),
                ("input.transfer.low", "88"),
                ("input.transfer.reason", "input voltage out of range"),
                ("input.voltage", "120.0"),
                ("input.voltage.nominal", "120"),
                ("ups.beeper.status", "enabled"),
                ("ups.firmware", "951.e4 .D"),
                ("ups.load", "15"),
                ("ups.mfr", "American Power Conversion"),
                ("ups.model", "Back-UPS RS 1350MS"),
                ("ups.realpower.nominal", "810"),
                ("ups.status", "OL"),
                ("ups.test.result", "No test initiated"),
                ("ups.timer.shutdown", "-1"),
            ]),
        );
        fleet.insert(
            "cyberpower",
            SimulatedUps::new(&[
                ("battery.charge", "100"),
                ("battery.charge.low", "20"),
                ("battery.charge.warning", "40"),
                ("battery.date", "2026/05/20"),
                ("battery.runtime", "3600"),
                ("battery.runtime.low", "300"),
                ("battery.type", "PbAc"),
                ("battery.voltage", "13.7"),
                ("battery.voltage.nominal", "12.0"),
                ("device.mfr", "CyberPower Systems"),
                ("device.model", "CP1500PFCLCD"),
                ("device.serial", "CT5827B40192"),
                ("device.type", "ups"),
                ("driver.name", "usbhid-ups"),
                ("driver.version", "2.8.2"),
                ("input.sensitivity", "low"),
                ("input.transfer.high", "139"),
                ("input.transfer.low", "91"),
                ("input.transfer.reason", "input voltage out of range"),
                ("input.voltage", "119.5"),
                ("input.voltage.nominal", "120"),
                ("ups.beeper.status", "disabled"),
                ("ups.firmware", "CR007.e1.1"),
                ("ups.load", "30"),
                ("ups.mfr", "CyberPower Systems"),
                ("ups.model", "CP1500PFCLCD"),
                ("ups.realpower.nominal", "900"),
                ("ups.status", "OL"),
                ("ups.test.result", "No test initiated"),
                ("ups.timer.shutdown", "-1"),
            ]),
        );
        fleet.insert(
            "eaton220",
            SimulatedUps::new(&[
                ("battery.charge", "100"),
                ("battery.charge.low", "15"),
                ("battery.charge.warning", "30"),
                ("battery.date", "2027/02/01"),
                ("battery.runtime", "4500"),
                ("battery.runtime.low", "600"),
                ("battery.type", "Li-Ion"),
                ("battery.voltage", "54.6"),
                ("battery.voltage.nominal", "48.0"),
                ("device.mfr", "Eaton"),
                ("device.model", "5P 1550 R 220V"),
                ("device.serial", "G201E4C02987"),
                ("device.type", "ups"),
                ("driver.name", "usbhid-ups"),
                ("driver.version", "2.8.2"),
                ("input.sensitivity", "high"),
                ("input.transfer.high", "264"),
                ("input.transfer.low", "176"),
                ("input.transfer.reason", "input voltage out of range"),
                ("input.voltage", "220.5"),
                ("input.voltage.nominal", "220"),
                ("ups.beeper.status", "enabled"),
                ("ups.firmware", "02.14.0017"),
                ("ups.load", "55"),
                ("ups.mfr", "Eaton"),
                ("ups.model", "5P 1550 R 220V"),
                ("ups.realpower.nominal", "1100"),
                ("ups.status", "OL"),
                ("ups.test.result", "No test initiated"),
                ("ups.timer.shutdown", "-1"),
            ]),
        );
        fleet
    }

    pub fn tick<R: Rng>(&mut self, rng: &mut R) {
        for (name, ups) in &mut self.devices {
            ups.tick(name, rng);
        }
    }

    /// Interpreta uma linha do cliente e monta a resposta.
    pub fn handle_command(&mut self, raw: &str) -> Reply {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let upper: Vec<String> = parts.iter().map(|p| p.to_ascii_uppercase()).collect();
        let words: Vec<&str> = upper.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["LIST", "UPS"] => self.list_ups(),
            ["LIST", "VAR", _] => self.list_var(&parts[2].to_ascii_lowercase()),
            ["LIST", "VAR", ..] => line("ERR INVALID-ARGUMENT"),
            ["SET", "VAR", _, _, _, ..] => self.set_var(parts[2], parts[3], &parts[4..].join(" ")),
            ["SET", "VAR", ..] => line("ERR INVALID-ARGUMENT"),
            ["LOGIN", ..] | ["USERNAME", ..] | ["PASSWORD", ..] => line("OK"),
            ["LOGOUT"] => Reply::Close("OK Goodbye\n".into()),
            [] => line("ERR INVALID-ARGUMENT"),
            _ => line("ERR UNKNOWN-COMMAND"),
        }
    }

    fn list_ups(&self) -> Reply {
        let mut out = String::from("BEGIN LIST UPS\n");
        for (name, ups) in &self.devices {
            let description = ups.get("device.model").unwrap_or("Simulated UPS");
            out.push_str(&format_ups_line(name, description));
            out.push('\n');
        }
        out.push_str("END LIST UPS\n");
        Reply::Text(out)
    }

    fn list_var(&self, name: &str) -> Reply {
        let Some(ups) = self.devices.get(name) else {
            return line("ERR UNKNOWN-UPS");
        };
        let mut out = format!("BEGIN LIST VAR {name}\n");
        for (key, value) in &ups.vars {
            out.push_str(&format_var_line(name, key, value));
            out.push('\n');
        }
        out.push_str(&format!("END LIST VAR {name}\n"));
        Reply::Text(out)
    }

    fn set_var(&mut self, name: &str, key: &str, value: &str) -> Reply {
        let Some(ups) = self.devices.get_mut(name) else {
            return line("ERR UNKNOWN-UPS");
        };
        if ups.get(key).is_none() {
            return line("ERR VAR-NOT-SUPPORTED");
        }
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        info!("[{name}] SET VAR {key} = {value}");
        ups.set(key, value);
        line("OK")
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
