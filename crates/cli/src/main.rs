// TermMux - Serial Terminal Multiplexer Bridge
// Copyright (C) 2026 The termmux developers
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! `termmux-server`: multi-port terminal server connecting physical
//! RS-232 terminals (via USB-serial adapters) to the emulated mux card.
//!
//! One thread runs the emulation; per-port RX workers live inside the
//! serial driver. The loop below multiplexes the card's virtual-time
//! deadlines with wall-clock maintenance through a single monotonic
//! timerfd, so an idle server sleeps instead of spinning.

use anyhow::{Context, Result};
use clap::Parser;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use termmux_config::{CardConfig, ServerConfig, MAX_TERMINALS};
use termmux_core::serial::{CaptureCallback, Direction, SerialPort};
use termmux_core::{MuxShared, NullHost, SerialSession, Session, System, TermMux};
use tracing::{debug, error, info, warn};

const SLICE: Duration = Duration::from_millis(30);
const INPUT_RESPONSE_CAP: Duration = Duration::from_millis(50);
const STATS_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_INI: &str = "termmux.ini";

static RUNNING: AtomicBool = AtomicBool::new(true);
static DUMP_STATUS: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: i32) {
    if sig == Signal::SIGUSR1 as i32 {
        DUMP_STATUS.store(true, Ordering::SeqCst);
    } else {
        RUNNING.store(false, Ordering::SeqCst);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "termmux-server",
    about = "Multi-port terminal server for physical serial terminals",
    version
)]
struct Cli {
    /// Load configuration from this INI file (default: termmux.ini)
    #[arg(long, value_name = "PATH")]
    ini: Option<PathBuf>,

    /// Enable the external web configuration interface
    #[arg(long)]
    web_config: bool,

    /// Web configuration port (implies --web-config)
    #[arg(long, value_name = "N")]
    web_port: Option<u16>,

    /// Log main-loop wake-up reasons
    #[arg(long)]
    debug_wakeups: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug_wakeups {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("termmux terminal server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&cli)?;
    config.validate()?;
    config.print_summary();

    install_signal_handlers()?;

    let card_cfg = CardConfig {
        addr: config.mxd_io_addr,
        num_terminals: config.num_terminals,
        ..Default::default()
    };
    let card = TermMux::new(&card_cfg, Box::new(NullHost::new()))
        .context("failed to build the mux card")?;
    info!(
        "{} card at base address 0x{:02x}",
        card.name(),
        config.mxd_io_addr
    );

    let mut system = System::new(card);
    let shared = system.card().shared();

    let mut sessions: Vec<Option<Arc<SerialSession>>> = vec![None; MAX_TERMINALS];
    for i in 0..config.num_terminals {
        connect_terminal(i, &config, &shared, &mut system, &mut sessions);
    }

    if config.web_server_enabled {
        // the control server is an external collaborator; its reload
        // requests are honored by the loop below when present
        info!(
            "web configuration (port {}) is not built into this binary",
            config.web_server_port
        );
    }

    info!("system ready for terminal connections, press Ctrl+C to shut down");
    run_loop(&mut system, &mut config, &mut sessions)?;

    info!("main loop exited, cleaning up sessions");
    for i in 0..MAX_TERMINALS {
        if sessions[i].take().is_some() {
            let _ = system.card_mut().set_session(i, None);
        }
    }
    info!("shutdown complete");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.ini {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("configuration error in {:?}", path))?,
        None => {
            if Path::new(DEFAULT_INI).exists() {
                ServerConfig::from_file(DEFAULT_INI)
                    .with_context(|| format!("configuration error in {}", DEFAULT_INI))?
            } else {
                info!("no {} found, using defaults", DEFAULT_INI);
                ServerConfig::default()
            }
        }
    };

    if cli.web_config || cli.web_port.is_some() {
        config.web_server_enabled = true;
    }
    if let Some(port) = cli.web_port {
        config.web_server_port = port;
    }
    config.debug_wakeups = cli.debug_wakeups;
    Ok(config)
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1] {
        unsafe { sigaction(sig, &action) }
            .with_context(|| format!("failed to install {:?} handler", sig))?;
    }
    Ok(())
}

/// Open the configured device for terminal `i` and bind a session for it.
/// Missing device files and failed opens are logged and left for the 30 s
/// retry pass.
fn connect_terminal(
    i: usize,
    config: &ServerConfig,
    shared: &Arc<MuxShared>,
    system: &mut System,
    sessions: &mut [Option<Arc<SerialSession>>],
) {
    let term = &config.terminals[i];
    if term.port_name.is_empty() {
        info!("terminal {} has no port configured, skipping", i);
        return;
    }
    if !term.enabled {
        info!("terminal {} disabled in configuration, skipping", i);
        return;
    }

    if !Path::new(&term.port_name).exists() {
        warn!(
            "serial device {} does not exist, terminal {} will connect when it appears",
            term.port_name, i
        );
        info!("check the USB-serial adapter and dialout group permissions");
        return;
    }

    info!("setting up terminal {}: {}", i, term.describe());
    let port = SerialPort::new();
    if !port.open(&term.to_serial_config()) {
        warn!("failed to open {} for terminal {}, will retry", term.port_name, i);
        return;
    }

    if config.capture_enabled && !config.capture_dir.is_empty() {
        port.set_capture_callback(Some(capture_callback(i, &config.capture_dir)));
        info!("terminal {} capture enabled to {}", i, config.capture_dir);
    }

    let rx_shared = Arc::clone(shared);
    let session = SerialSession::new(port, Arc::new(move |byte| rx_shared.queue_rx_byte(i, byte)));
    if system.card_mut().set_session(i, Some(session.clone())).is_ok() {
        sessions[i] = Some(session);
        info!("terminal {} connected", i);
    }
}

/// Per-terminal capture tap writing raw RX and TX streams to
/// `termN_rx.log` / `termN_tx.log` under the capture directory.
fn capture_callback(term: usize, capture_dir: &str) -> CaptureCallback {
    let dir = capture_dir.to_string();
    let files: Mutex<[Option<File>; 2]> = Mutex::new([None, None]);
    Box::new(move |byte, direction| {
        let idx = if direction == Direction::Rx { 0 } else { 1 };
        let suffix = if direction == Direction::Rx { "rx" } else { "tx" };
        let mut files = files.lock().unwrap();
        if files[idx].is_none() {
            let path = format!("{}/term{}_{}.log", dir, term, suffix);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => files[idx] = Some(f),
                Err(e) => {
                    warn!("cannot open capture file {}: {}", path, e);
                    return;
                }
            }
        }
        if let Some(f) = files[idx].as_mut() {
            let _ = f.write_all(&[byte]);
            let _ = f.flush();
        }
    })
}

fn run_loop(
    system: &mut System,
    config: &mut ServerConfig,
    sessions: &mut Vec<Option<Arc<SerialSession>>>,
) -> Result<()> {
    let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)
        .context("failed to create timerfd")?;

    let mut next_slice = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_retry = Instant::now();

    while RUNNING.load(Ordering::SeqCst) {
        if DUMP_STATUS.swap(false, Ordering::SeqCst) {
            dump_runtime_status(sessions);
        }

        // configuration reloads happen here and only here, never on a
        // control-server thread
        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            reload_configuration(system, config, sessions);
        }

        if !system.on_idle() {
            break;
        }

        let now = Instant::now();

        // steady slice cadence; bounded catch-up if we fell behind
        if next_slice <= now {
            let mut catchup = 0;
            loop {
                next_slice += SLICE;
                catchup += 1;
                if catchup > 10 {
                    next_slice = now + SLICE;
                    break;
                }
                if next_slice > now {
                    break;
                }
            }
        } else {
            next_slice += SLICE;
        }

        let mut deadline = next_slice;
        if let Some(ms) = system.ms_until_next_timer() {
            // floor of 1 ms so an overdue timer cannot become a busy loop
            deadline = deadline.min(now + Duration::from_millis(ms.max(1)));
        }
        deadline = deadline
            .min(last_stats + STATS_INTERVAL)
            .min(last_retry + RETRY_INTERVAL)
            .min(now + INPUT_RESPONSE_CAP);

        if deadline > now {
            let sleep_start = now;
            let expected = deadline - now;
            wait_until_deadline(&timer, expected);

            if config.debug_wakeups {
                let actual = sleep_start.elapsed();
                let reason = if actual + Duration::from_millis(1) >= expected {
                    if deadline == next_slice {
                        "time_slice"
                    } else if system.has_pending_timers() {
                        "timer_expired"
                    } else {
                        "periodic_maintenance"
                    }
                } else {
                    "early_wake"
                };
                debug!(
                    "woke after {} ms (expected {} ms), reason: {}",
                    actual.as_millis(),
                    expected.as_millis(),
                    reason
                );
            }
        }

        let now = Instant::now();
        if now.duration_since(last_stats) >= STATS_INTERVAL {
            emit_session_stats(sessions);
            last_stats = now;
        }
        if now.duration_since(last_retry) >= RETRY_INTERVAL {
            retry_terminals(system, config, sessions);
            last_retry = now;
        }
    }
    Ok(())
}

/// Arm the timerfd and wait for it. Signals interrupt the wait, which is
/// exactly what the loop wants.
fn wait_until_deadline(timer: &TimerFd, dur: Duration) {
    if timer
        .set(
            Expiration::OneShot(TimeSpec::from_duration(dur)),
            TimerSetTimeFlags::empty(),
        )
        .is_err()
    {
        std::thread::sleep(dur);
        return;
    }

    let mut fds = [PollFd::new(timer.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::NONE) {
        Ok(n) if n > 0 => {
            if fds[0]
                .revents()
                .unwrap_or(PollFlags::empty())
                .contains(PollFlags::POLLIN)
            {
                // acknowledge the expiration
                let _ = timer.wait();
            }
        }
        _ => {
            // interrupted by a signal; the loop re-checks its flags
        }
    }
}

/// JSON runtime snapshot on stdout, triggered by SIGUSR1.
fn dump_runtime_status(sessions: &[Option<Arc<SerialSession>>]) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let terminals: Vec<serde_json::Value> = sessions
        .iter()
        .enumerate()
        .map(|(i, session)| match session {
            Some(s) if s.is_active() => {
                let (rx, tx) = s.stats();
                serde_json::json!({
                    "id": i,
                    "active": true,
                    "rx_bytes": rx,
                    "tx_bytes": tx,
                    "description": s.describe(),
                })
            }
            _ => serde_json::json!({ "id": i, "active": false }),
        })
        .collect();

    let status = serde_json::json!({
        "timestamp": timestamp,
        "status": "running",
        "terminals": terminals,
    });
    println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
    let _ = std::io::stdout().flush();
}

fn emit_session_stats(sessions: &[Option<Arc<SerialSession>>]) {
    info!("session stats:");
    for (i, session) in sessions.iter().enumerate() {
        if let Some(s) = session {
            if s.is_active() {
                let (rx, tx) = s.stats();
                info!("  terminal {}: RX={} TX={} bytes", i, rx, tx);
            }
        }
    }
}

/// Re-open serial ports whose device files have appeared since startup.
fn retry_terminals(
    system: &mut System,
    config: &ServerConfig,
    sessions: &mut [Option<Arc<SerialSession>>],
) {
    let shared = system.card().shared();
    for i in 0..config.num_terminals {
        if sessions[i].is_some() {
            continue;
        }
        let term = &config.terminals[i];
        if term.port_name.is_empty() || !term.enabled {
            continue;
        }
        if !Path::new(&term.port_name).exists() {
            continue;
        }
        info!("attempting to reconnect terminal {} to {}", i, term.port_name);
        connect_terminal(i, config, &shared, system, sessions);
    }
}

/// Reload the INI and rebuild terminal bindings. Configuration errors keep
/// the running config.
fn reload_configuration(
    system: &mut System,
    config: &mut ServerConfig,
    sessions: &mut Vec<Option<Arc<SerialSession>>>,
) {
    info!("reload requested, performing safe reconfiguration");
    let path = if config.ini_path.is_empty() {
        DEFAULT_INI.to_string()
    } else {
        config.ini_path.clone()
    };

    let mut new_config = match ServerConfig::from_file(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("reload failed: {:#}", e);
            return;
        }
    };
    new_config.web_server_enabled = config.web_server_enabled;
    new_config.web_server_port = config.web_server_port;
    new_config.debug_wakeups = config.debug_wakeups;

    for i in 0..MAX_TERMINALS {
        if sessions[i].take().is_some() {
            let _ = system.card_mut().set_session(i, None);
        }
    }

    *config = new_config;
    let shared = system.card().shared();
    for i in 0..config.num_terminals {
        connect_terminal(i, config, &shared, system, sessions);
    }
    info!("configuration reloaded from {}", path);
}
