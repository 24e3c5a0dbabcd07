// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Feed a line of keystrokes to channel 0 through an in-process terminal
//! session and print what the card's firmware echoes back.
//!
//! ```sh
//! cargo run -p termmux-core --example terminal_echo
//! ```

use std::sync::Arc;
use termmux_config::CardConfig;
use termmux_core::{InProcessSession, NullHost, System, TermMux, SERIAL_CHAR_DELAY_NS};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cfg = CardConfig {
        num_terminals: 1,
        ..Default::default()
    };
    let card = TermMux::new(&cfg, Box::new(NullHost::new())).expect("card");
    let mut system = System::new(card);

    let shared = system.card().shared();
    let keys = Arc::clone(&shared);
    let (session, screen) =
        InProcessSession::new("demo", Arc::new(move |b| keys.queue_rx_byte(0, b)));
    system
        .card_mut()
        .set_session(0, Some(session.clone()))
        .expect("bind session");

    let line = b"READY\r";
    for &b in line {
        session.key_from_terminal(b);
    }

    // one character time per byte, plus slack for the polling firmware
    system.run_virtual((line.len() as u64 + 4) * SERIAL_CHAR_DELAY_NS);

    let echoed: Vec<u8> = screen.try_iter().collect();
    println!(
        "typed {:?}, terminal displays {:?}",
        String::from_utf8_lossy(line),
        String::from_utf8_lossy(&echoed)
    );
    assert_eq!(echoed, line);
}
