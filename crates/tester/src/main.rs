//! usb-bulk-echo
//!
//! Console tester for USB bulk echo firmware. Waits for an allow-listed
//! device, lets the operator pick one and runs the loop-back echo test.

use anyhow::{Context, Result};
use bulk::{AllowedDeviceId, CancelToken, DeviceIndex};
use clap::Parser;
use common::setup_logging;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tester::build_registry;
use tester::config::TesterConfig;
use tester::shell::{Shell, ShellOptions, list_devices};
use tester::usb::RusbBackend;
use tokio::signal;
use tracing::{info, warn};

/// How long the shell gets to notice Ctrl-C before the process exits
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Exit status after an interrupt the shell could not observe
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "usb-bulk-echo")]
#[command(author, version, about = "USB bulk echo tester")]
#[command(long_about = "
Console tester for USB bulk echo firmware. Waits until an allowed device is
attached, lists the candidates, and runs a loop-back test that writes packets
to the device and checks they come back unchanged.

EXAMPLES:
    # Interactive session with the default allow-list
    usb-bulk-echo

    # Test a different device
    usb-bulk-echo --allow 0x1234:0x5678

    # Unattended: first device, 1000 packets, no retry prompt
    usb-bulk-echo --device 0 --repeats 1000 --once

    # Sweep all packet sizes ten times and report throughput
    usb-bulk-echo --device 0 --sweep --repeats 10 --once

    # List attached allowed devices as JSON
    usb-bulk-echo --list-devices --json

CONFIGURATION:
    The tester looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-bulk-echo/tester.toml
    3. /etc/usb-bulk-echo/tester.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached allowed devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Also allow this device (VID:PID, e.g. 0x8765:0x1234); repeatable
    #[arg(short, long = "allow", value_name = "VID:PID")]
    allow: Vec<AllowedDeviceId>,

    /// Device index to test instead of asking
    #[arg(short, long, value_name = "N")]
    device: Option<u32>,

    /// Echo packets per run instead of asking (sweep passes with --sweep)
    #[arg(short, long, value_name = "N")]
    repeats: Option<u32>,

    /// Echo every packet size from 1 to 64 bytes with a data compare
    #[arg(long)]
    sweep: bool,

    /// Run the test once without offering a retry
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.save_config {
        let config = TesterConfig::default();
        let path = TesterConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = if let Some(ref path) = args.config {
        TesterConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        TesterConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.tester.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-bulk-echo v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let backend = RusbBackend::new().context("Failed to initialize USB")?;
    let registry = build_registry(backend, &config, &args.allow)?;

    if args.list_devices {
        let count = list_devices(&registry, args.json, &mut io::stdout().lock())?;
        info!("Listed {} device(s)", count);
        return Ok(ExitCode::SUCCESS);
    }

    let options = ShellOptions {
        device: args.device.map(DeviceIndex),
        repeats: args.repeats,
        once: args.once,
        sweep: args.sweep,
    };
    let cancel = CancelToken::new();
    let shell_cancel = cancel.clone();

    // Console I/O and USB transfers block, so the shell runs off the runtime
    let mut shell = tokio::task::spawn_blocking(move || {
        Shell::new(
            &registry,
            &config,
            options,
            shell_cancel,
            io::stdin().lock(),
            io::stdout().lock(),
        )
        .run()
    });

    let summary = tokio::select! {
        joined = &mut shell => joined.context("Shell task failed")??,
        _ = signal::ctrl_c() => {
            info!("Interrupted, stopping...");
            cancel.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut shell).await {
                Ok(joined) => joined.context("Shell task failed")??,
                Err(_) => {
                    warn!("Shell still waiting for console input, exiting");
                    std::process::exit(INTERRUPTED_EXIT);
                }
            }
        }
    };

    info!(
        "Done: {:?}, {} run(s), exit code {}",
        summary.exit,
        summary.runs,
        summary.exit_code()
    );
    Ok(ExitCode::from(summary.exit_code()))
}
