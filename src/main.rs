use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use tokio::sync::broadcast;

use puck_rs::scanner::{PuckScanner, ScanConfig};
use puck_rs::session::SessionConfig;
use puck_rs::types::ConnectionState;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=puck_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Discover and connect ──────────────────────────────────────────────────
    let scanner = PuckScanner::new(ScanConfig::default());
    info!("Scanning for a puck …");
    let device = scanner.find_first().await?;
    info!("Found {} ({})", device.name, device.id);

    let session = Arc::new(device.into_session(SessionConfig::default()));
    session.connect().await?;
    info!("Connected. Press Ctrl-C or type 'q' + Enter to quit.\n");
    info!("Commands (type + Enter):");
    info!("  q        – quit");
    info!("  e  /  d  – enable / disable the movement stream");
    info!("  p<ms>    – set sampling period, e.g. p500");
    info!("  r        – read sampling period back from the device");
    info!("  b        – read battery level\n");

    // ── Telemetry printers ────────────────────────────────────────────────────
    let mut gyro = session.gyro();
    tokio::spawn(async move {
        loop {
            match gyro.recv().await {
                Ok(v) => println!("[GYRO]    x={:7.0}  y={:7.0}  z={:7.0}", v.x, v.y, v.z),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Gyro printer lagged by {n} samples")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut battery = session.battery();
    tokio::spawn(async move {
        while battery.changed().await.is_ok() {
            if let Some(level) = *battery.borrow_and_update() {
                println!("[BATTERY] {level}%");
            }
        }
    });

    let mut rssi = session.rssi();
    tokio::spawn(async move {
        while rssi.changed().await.is_ok() {
            if let Some(dbm) = *rssi.borrow_and_update() {
                println!("[RSSI]    {dbm} dBm");
            }
        }
    });

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let session_cmd = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            match line.as_str() {
                "q" => {
                    info!("Quit requested.");
                    if let Err(e) = session_cmd.disconnect().await {
                        error!("Disconnect error: {e}");
                    }
                    break;
                }
                "e" => {
                    if let Err(e) = session_cmd.enable_gyro().await {
                        error!("Enable error: {e}");
                    }
                }
                "d" => {
                    if let Err(e) = session_cmd.disable_gyro().await {
                        error!("Disable error: {e}");
                    }
                }
                "r" => match session_cmd.read_gyro_period().await {
                    Ok(period) => info!("Sampling period: {period:?}"),
                    Err(e) => error!("Period read error: {e}"),
                },
                "b" => match session_cmd.read_battery_level().await {
                    Ok(level) => info!("Battery: {level}%"),
                    Err(e) => error!("Battery read error: {e}"),
                },
                cmd if cmd.starts_with('p') => match cmd[1..].parse::<u64>() {
                    Ok(ms) => {
                        let period = Duration::from_millis(ms);
                        match session_cmd.write_gyro_period(period).await {
                            Ok(()) => info!("Sampling period set to {period:?}"),
                            Err(e) => error!("Period write error: {e}"),
                        }
                    }
                    Err(_) => warn!("Usage: p<milliseconds>, e.g. p500"),
                },
                other => warn!("Unknown command: '{other}'"),
            }
        }
    });

    // ── Wait for the session to end ───────────────────────────────────────────
    let mut state = session.connection_state();
    loop {
        if *state.borrow_and_update() == ConnectionState::Disconnected {
            break;
        }
        if state.changed().await.is_err() {
            break;
        }
    }

    info!("Session ended – exiting.");
    Ok(())
}
