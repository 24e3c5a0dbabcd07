// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use configparser::ini::Ini;
use termmux_config::{CardConfig, Parity, ServerConfig, StopBits};

#[test]
fn server_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("termmux.ini");
    std::fs::write(
        &path,
        r#"
[terminal_server]
mxd_io_addr = 0x00
num_terms = 4
capture_dir =

[terminal_server/term0]
port = /dev/ttyUSB0

[terminal_server/term3]
port = /dev/ttyACM0
baud = 38400
data = 7
parity = even
stop = 2
flow = rtscts
"#,
    )
    .unwrap();

    let cfg = ServerConfig::from_file(&path).unwrap();
    assert_eq!(cfg.num_terminals, 4);
    assert!(!cfg.capture_enabled);
    assert_eq!(cfg.ini_path, path.to_string_lossy());

    // term0 takes all defaults except the port binding
    let t0 = &cfg.terminals[0];
    assert!(t0.enabled);
    assert_eq!(t0.baud_rate, 19200);
    assert_eq!(t0.data_bits, 8);
    assert_eq!(t0.parity, Parity::Odd);
    assert_eq!(t0.stop_bits, StopBits::One);
    assert!(t0.sw_flow_control);

    // unbound lines stay disabled
    assert!(!cfg.terminals[1].enabled);
    assert!(!cfg.terminals[2].enabled);

    let t3 = &cfg.terminals[3];
    assert_eq!(t3.port_name, "/dev/ttyACM0");
    assert_eq!(t3.baud_rate, 38400);
    assert_eq!(t3.data_bits, 7);
    assert_eq!(t3.parity, Parity::Even);
    assert_eq!(t3.stop_bits, StopBits::Two);
    assert!(t3.hw_flow_control);
    assert!(!t3.sw_flow_control);
}

#[test]
fn missing_file_is_an_error() {
    let err = ServerConfig::from_file("/nonexistent/termmux.ini").unwrap_err();
    assert!(format!("{:#}", err).contains("termmux.ini"));
}

#[test]
fn card_config_survives_a_file_trip() {
    let mut cfg = CardConfig {
        addr: 0x00,
        num_terminals: 2,
        ..Default::default()
    };
    cfg.terminals[0].com_port = "/dev/ttyUSB0".to_string();
    cfg.terminals[0].baud_rate = 19200;
    cfg.terminals[0].sw_flow_control = true;
    cfg.terminals[1].com_port = "/dev/ttyUSB1".to_string();

    let mut ini = Ini::new();
    cfg.save_ini(&mut ini, "config/io/slot-2");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("card.ini");
    ini.write(&path).unwrap();

    let mut reloaded = Ini::new();
    reloaded.load(&path).unwrap();
    let loaded = CardConfig::load_ini(&reloaded, "config/io/slot-2").unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn quoted_card_type_is_accepted() {
    let mut ini = Ini::new();
    ini.read(
        "[config/io/slot-1]\ntype = \"2236 MXD\"\naddr = 0x040\n[config/io/slot-1/cardcfg]\nnumTerminals = 2\n"
            .to_string(),
    )
    .unwrap();
    let cfg = CardConfig::load_ini(&ini, "config/io/slot-1").unwrap();
    assert_eq!(cfg.addr, 0x40);
    assert_eq!(cfg.num_terminals, 2);
}
