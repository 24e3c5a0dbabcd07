// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{bail, Context, Result};
use configparser::ini::Ini;
use std::path::Path;

/// Channels per mux card. The card hardware has four UARTs; everything in
/// this crate clamps terminal counts to this range.
pub const MAX_TERMINALS: usize = 4;

/// Card type string recognized in the `[.../io/slot-N]` section.
pub const CARD_TYPE_MXD: &str = "2236 MXD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    None,
    #[default]
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Wire-level flow control selection for a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    None,
    #[default]
    XonXoff,
    RtsCts,
}

/// Settings handed to the serial driver when a port is opened.
///
/// This is a plain record: it is validated when loaded from the INI and is
/// immutable for the lifetime of an open port (reconnection reuses the
/// snapshot taken at open time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Hardware flow control (RTS/CTS). The terminals this card serves do
    /// not use it; off by default.
    pub hw_flow_control: bool,
    /// Driver-level XON/XOFF, layered under the application watermarks.
    pub sw_flow_control: bool,
    pub tx_queue_size: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::Odd,
            hw_flow_control: false,
            sw_flow_control: false,
            tx_queue_size: 8192,
        }
    }
}

/// One terminal line of the terminal server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalPortConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub hw_flow_control: bool,
    pub sw_flow_control: bool,
    pub enabled: bool,
    /// Receive FIFO depth for the channel bound to this terminal.
    pub rx_fifo_size: usize,
    pub tx_queue_size: usize,
    /// Watermarks, percent of `rx_fifo_size`.
    pub xoff_threshold_percent: usize,
    pub xon_threshold_percent: usize,
}

impl Default for TerminalPortConfig {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            parity: Parity::Odd,
            stop_bits: StopBits::One,
            hw_flow_control: false,
            sw_flow_control: true,
            enabled: false,
            rx_fifo_size: 2048,
            tx_queue_size: 8192,
            xoff_threshold_percent: 75,
            xon_threshold_percent: 25,
        }
    }
}

impl TerminalPortConfig {
    pub fn to_serial_config(&self) -> SerialConfig {
        SerialConfig {
            port_name: self.port_name.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
            hw_flow_control: self.hw_flow_control,
            sw_flow_control: self.sw_flow_control,
            tx_queue_size: self.tx_queue_size,
        }
    }

    /// "/dev/ttyUSB0 at 19200 baud, 8O1, XON/XOFF"
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::None => 'N',
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let flow = match (self.hw_flow_control, self.sw_flow_control) {
            (true, true) => "RTS/CTS+XON/XOFF",
            (true, false) => "RTS/CTS",
            (false, true) => "XON/XOFF",
            (false, false) => "no flow control",
        };
        format!(
            "{} at {} baud, {}{}{}, {}",
            self.port_name, self.baud_rate, self.data_bits, parity, stop, flow
        )
    }
}

/// Per-terminal card settings from `[.../io/slot-N/cardcfg]`.
///
/// An empty `com_port` means the terminal is served by an in-process
/// terminal (or a session attached at runtime) rather than a card-owned
/// serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTerminalCfg {
    pub com_port: String,
    pub baud_rate: u32,
    pub flow_control: bool,
    pub sw_flow_control: bool,
}

impl Default for CardTerminalCfg {
    fn default() -> Self {
        Self {
            com_port: String::new(),
            baud_rate: 19200,
            flow_control: false,
            sw_flow_control: false,
        }
    }
}

/// Configuration of one mux card: addressing identity plus the per-terminal
/// serial bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardConfig {
    pub addr: u16,
    pub num_terminals: usize,
    pub terminals: [CardTerminalCfg; MAX_TERMINALS],
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            addr: 0x00,
            num_terminals: 1,
            terminals: Default::default(),
        }
    }
}

impl CardConfig {
    /// Load from `[<subgroup>]` (type/addr) and `[<subgroup>/cardcfg]`.
    pub fn load_ini(ini: &Ini, subgroup: &str) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(ty) = get_str(ini, subgroup, "type") {
            if ty != CARD_TYPE_MXD {
                bail!("section [{}] has type '{}', expected '{}'", subgroup, ty, CARD_TYPE_MXD);
            }
        }
        if let Some(addr) = get_str(ini, subgroup, "addr") {
            cfg.addr = parse_u16(&addr)
                .with_context(|| format!("invalid addr '{}' in [{}]", addr, subgroup))?;
        }

        let sub = format!("{}/cardcfg", subgroup);
        if let Some(n) = get_int(ini, &sub, "numTerminals")? {
            cfg.num_terminals = (n.max(1) as usize).min(MAX_TERMINALS);
        }
        for (k, term) in cfg.terminals.iter_mut().enumerate() {
            if let Some(port) = get_str(ini, &sub, &format!("terminal{}_com_port", k)) {
                term.com_port = port;
            }
            if let Some(baud) = get_int(ini, &sub, &format!("terminal{}_baud_rate", k))? {
                term.baud_rate = baud as u32;
            }
            if let Some(fc) = get_int(ini, &sub, &format!("terminal{}_flow_control", k))? {
                term.flow_control = fc != 0;
            }
            if let Some(sfc) = get_int(ini, &sub, &format!("terminal{}_sw_flow_control", k))? {
                term.sw_flow_control = sfc != 0;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize back into the same sections `load_ini` reads.
    pub fn save_ini(&self, ini: &mut Ini, subgroup: &str) {
        ini.set(subgroup, "type", Some(format!("\"{}\"", CARD_TYPE_MXD)));
        ini.set(subgroup, "addr", Some(format!("0x{:03X}", self.addr)));

        let sub = format!("{}/cardcfg", subgroup);
        ini.set(&sub, "numTerminals", Some(self.num_terminals.to_string()));
        for (k, term) in self.terminals.iter().enumerate() {
            ini.set(&sub, &format!("terminal{}_com_port", k), Some(term.com_port.clone()));
            ini.set(&sub, &format!("terminal{}_baud_rate", k), Some(term.baud_rate.to_string()));
            ini.set(
                &sub,
                &format!("terminal{}_flow_control", k),
                Some(if term.flow_control { "1" } else { "0" }.to_string()),
            );
            ini.set(
                &sub,
                &format!("terminal{}_sw_flow_control", k),
                Some(if term.sw_flow_control { "1" } else { "0" }.to_string()),
            );
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_terminals < 1 || self.num_terminals > MAX_TERMINALS {
            bail!("numTerminals must be 1..={}, got {}", MAX_TERMINALS, self.num_terminals);
        }
        for (k, term) in self.terminals.iter().enumerate().take(self.num_terminals) {
            if term.baud_rate == 0 {
                bail!("terminal{}_baud_rate must be non-zero", k);
            }
        }
        Ok(())
    }

    /// A change of terminal count or port binding requires tearing the card
    /// down; baud or flow-control tweaks can be applied to a live card.
    pub fn needs_reboot(&self, other: &Self) -> bool {
        if self.num_terminals != other.num_terminals || self.addr != other.addr {
            return true;
        }
        self.terminals
            .iter()
            .zip(other.terminals.iter())
            .any(|(a, b)| a.com_port != b.com_port)
    }
}

/// Top-level terminal server configuration (`[terminal_server]` plus one
/// `[terminal_server/termK]` section per line).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mxd_io_addr: u16,
    pub num_terminals: usize,
    pub terminals: [TerminalPortConfig; MAX_TERMINALS],
    pub capture_dir: String,
    pub capture_enabled: bool,
    pub web_server_enabled: bool,
    pub web_server_port: u16,
    pub ini_path: String,
    pub debug_wakeups: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut terminals: [TerminalPortConfig; MAX_TERMINALS] = Default::default();
        for (i, t) in terminals.iter_mut().enumerate() {
            t.port_name = format!("/dev/ttyUSB{}", i);
        }
        Self {
            mxd_io_addr: 0x00,
            num_terminals: 1,
            terminals,
            capture_dir: String::new(),
            capture_enabled: false,
            web_server_enabled: false,
            web_server_port: 8080,
            ini_path: String::new(),
            debug_wakeups: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path.as_ref())
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("failed to read INI file {:?}", path.as_ref()))?;
        let mut cfg = Self::from_ini(&ini)?;
        cfg.ini_path = path.as_ref().to_string_lossy().into_owned();
        Ok(cfg)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(addr) = get_str(ini, "terminal_server", "mxd_io_addr") {
            cfg.mxd_io_addr = parse_u16(&addr)
                .with_context(|| format!("invalid mxd_io_addr '{}'", addr))?;
        }
        if let Some(n) = get_int(ini, "terminal_server", "num_terms")? {
            cfg.num_terminals = (n.max(1) as usize).min(MAX_TERMINALS);
        }
        if let Some(dir) = get_str(ini, "terminal_server", "capture_dir") {
            cfg.capture_enabled = !dir.is_empty();
            cfg.capture_dir = dir;
        }

        for (k, term) in cfg.terminals.iter_mut().enumerate() {
            let section = format!("terminal_server/term{}", k);
            let Some(port) = get_str(ini, &section, "port") else {
                continue;
            };
            term.port_name = port;
            term.enabled = true;

            if let Some(baud) = get_int(ini, &section, "baud")? {
                term.baud_rate = baud as u32;
            }
            if let Some(data) = get_int(ini, &section, "data")? {
                if data != 7 && data != 8 {
                    bail!("[{}] data must be 7 or 8, got {}", section, data);
                }
                term.data_bits = data as u8;
            }
            if let Some(parity) = get_str(ini, &section, "parity") {
                term.parity = match parity.as_str() {
                    "odd" | "O" => Parity::Odd,
                    "even" | "E" => Parity::Even,
                    "none" | "N" => Parity::None,
                    other => bail!("[{}] unknown parity '{}'", section, other),
                };
            }
            if let Some(stop) = get_int(ini, &section, "stop")? {
                term.stop_bits = match stop {
                    1 => StopBits::One,
                    2 => StopBits::Two,
                    other => bail!("[{}] stop must be 1 or 2, got {}", section, other),
                };
            }
            if let Some(flow) = get_str(ini, &section, "flow") {
                let flow = match flow.as_str() {
                    "none" => FlowControl::None,
                    "xonxoff" => FlowControl::XonXoff,
                    "rtscts" => FlowControl::RtsCts,
                    other => bail!("[{}] unknown flow '{}'", section, other),
                };
                term.hw_flow_control = flow == FlowControl::RtsCts;
                term.sw_flow_control = flow == FlowControl::XonXoff;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_terminals < 1 || self.num_terminals > MAX_TERMINALS {
            bail!("num_terms must be 1..={}, got {}", MAX_TERMINALS, self.num_terminals);
        }
        for term in self.terminals.iter().take(self.num_terminals) {
            if term.enabled && term.baud_rate == 0 {
                bail!("terminal '{}' has zero baud rate", term.port_name);
            }
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        tracing::info!("terminal server configuration:");
        tracing::info!("  MXD I/O address: 0x{:02x}", self.mxd_io_addr);
        tracing::info!("  terminals: {}", self.num_terminals);
        if self.capture_enabled {
            tracing::info!("  capture directory: {}", self.capture_dir);
        }
        if self.web_server_enabled {
            tracing::info!("  web configuration: port {}", self.web_server_port);
        }
        for (i, term) in self.terminals.iter().enumerate().take(self.num_terminals) {
            if term.enabled {
                tracing::info!("  terminal {}: {}", i, term.describe());
            } else {
                tracing::info!("  terminal {}: disabled", i);
            }
        }
    }
}

/// Fetch a string value, stripping one layer of surrounding double quotes
/// (the Windows-style INI files this reads quote string values).
fn get_str(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key).map(|v| {
        let v = v.trim();
        if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
            v[1..v.len() - 1].to_string()
        } else {
            v.to_string()
        }
    })
}

fn get_int(ini: &Ini, section: &str, key: &str) -> Result<Option<i64>> {
    match get_str(ini, section, key) {
        None => Ok(None),
        Some(v) => {
            let parsed = if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16)
            } else {
                v.parse::<i64>()
            };
            parsed
                .map(Some)
                .with_context(|| format!("invalid integer '{}' for {} in [{}]", v, key, section))
        }
    }
}

fn parse_u16(v: &str) -> Result<u16> {
    let parsed = if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        v.parse::<u16>()
    };
    parsed.with_context(|| format!("invalid address '{}'", v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_ini(contents: &str) -> Ini {
        let mut ini = Ini::new();
        ini.read(contents.to_string()).unwrap();
        ini
    }

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.num_terminals, 1);
        assert_eq!(cfg.terminals[2].port_name, "/dev/ttyUSB2");
        assert!(!cfg.terminals[0].enabled);
        assert_eq!(cfg.terminals[0].rx_fifo_size, 2048);
        assert_eq!(cfg.terminals[0].tx_queue_size, 8192);
    }

    #[test]
    fn test_server_from_ini() {
        let ini = load_ini(
            r#"
[terminal_server]
mxd_io_addr = 0x00
num_terms = 2
capture_dir = /tmp/captures

[terminal_server/term0]
port = /dev/ttyUSB0
baud = 19200
data = 8
parity = odd
stop = 1
flow = xonxoff

[terminal_server/term1]
port = /dev/ttyUSB1
baud = 9600
parity = none
flow = none
"#,
        );
        let cfg = ServerConfig::from_ini(&ini).unwrap();
        assert_eq!(cfg.num_terminals, 2);
        assert!(cfg.capture_enabled);
        assert_eq!(cfg.capture_dir, "/tmp/captures");

        let t0 = &cfg.terminals[0];
        assert!(t0.enabled);
        assert_eq!(t0.baud_rate, 19200);
        assert_eq!(t0.parity, Parity::Odd);
        assert!(t0.sw_flow_control);
        assert!(!t0.hw_flow_control);

        let t1 = &cfg.terminals[1];
        assert_eq!(t1.baud_rate, 9600);
        assert_eq!(t1.parity, Parity::None);
        assert!(!t1.sw_flow_control);

        assert!(!cfg.terminals[2].enabled);
    }

    #[test]
    fn test_num_terms_clamped() {
        let ini = load_ini("[terminal_server]\nnum_terms = 9\n");
        let cfg = ServerConfig::from_ini(&ini).unwrap();
        assert_eq!(cfg.num_terminals, MAX_TERMINALS);

        let ini = load_ini("[terminal_server]\nnum_terms = 0\n");
        let cfg = ServerConfig::from_ini(&ini).unwrap();
        assert_eq!(cfg.num_terminals, 1);
    }

    #[test]
    fn test_bad_parity_rejected() {
        let ini = load_ini(
            "[terminal_server/term0]\nport = /dev/ttyUSB0\nparity = sometimes\n",
        );
        let err = ServerConfig::from_ini(&ini).unwrap_err();
        assert!(err.to_string().contains("parity"));
    }

    #[test]
    fn test_bad_data_bits_rejected() {
        let ini = load_ini("[terminal_server/term0]\nport = /dev/ttyUSB0\ndata = 9\n");
        let err = ServerConfig::from_ini(&ini).unwrap_err();
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn test_card_config_roundtrip() {
        let mut cfg = CardConfig {
            addr: 0x40,
            num_terminals: 3,
            ..Default::default()
        };
        cfg.terminals[0].com_port = "/dev/ttyUSB0".to_string();
        cfg.terminals[0].sw_flow_control = true;

        let mut ini = Ini::new();
        cfg.save_ini(&mut ini, "config/io/slot-3");

        let loaded = CardConfig::load_ini(&ini, "config/io/slot-3").unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_card_type_mismatch() {
        let ini = load_ini("[config/io/slot-1]\ntype = \"6312 printer\"\naddr = 0x215\n");
        let err = CardConfig::load_ini(&ini, "config/io/slot-1").unwrap_err();
        assert!(err.to_string().contains("2236 MXD"));
    }

    #[test]
    fn test_needs_reboot() {
        let a = CardConfig::default();

        let mut b = a.clone();
        b.terminals[0].baud_rate = 9600;
        assert!(!a.needs_reboot(&b));

        b.terminals[1].com_port = "/dev/ttyUSB9".to_string();
        assert!(a.needs_reboot(&b));

        let mut c = a.clone();
        c.num_terminals = 4;
        assert!(a.needs_reboot(&c));
    }

    #[test]
    fn test_describe() {
        let term = TerminalPortConfig {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(term.describe(), "/dev/ttyUSB0 at 19200 baud, 8O1, XON/XOFF");
    }
}
