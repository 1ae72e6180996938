// mmlib test application -- CLI tool for exercising the AT engine against a
// real modem or a scripted mock transport.
//
// Usage:
//   mmlib-test-app --port /dev/ttyUSB2 send I +CGMI +CGSN
//   mmlib-test-app --port /dev/ttyUSB2 --init "E0 V1" --init "+CMEE=1" send +CSQ
//   mmlib-test-app --port /dev/ttyUSB2 monitor --duration 60
//   mmlib-test-app --port /dev/ttyUSB2 monitor --pattern '\r\n\+CREG: \d\r\n'
//   mmlib-test-app --port /dev/ttyUSB2 probe ^SGPSS=? +CNMI=?
//   mmlib-test-app --port /dev/ttyUSB2 stress --count 500
//   mmlib-test-app --port /dev/ttyUSB3 --gps-port /dev/ttyUSB1 gps --source nmea --duration 30
//   mmlib-test-app --port /dev/ttyUSB2 power-off
//   mmlib-test-app --mock send +CGMI

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use mmlib::{PortFlags, PortKind};
use mmlib::at::{AtCommand, AtPort, AtPortBuilder, encode_command};
use mmlib::modem::{
    BaseModem, EngineGpsLocation, GenericLocation, LocationGathering, LocationSources, PowerDown,
};
use mmlib_test_harness::MockTransport;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// mmlib test application -- talks AT to a modem from the command line.
#[derive(Parser)]
#[command(name = "mmlib-test-app", version, about)]
struct Cli {
    /// AT port device node (e.g. /dev/ttyUSB2, /dev/ttyACM0).
    /// Required unless --mock is used.
    #[arg(long, env = "MMLIB_PORT")]
    port: Option<String>,

    /// NMEA data port, for the `gps` command.
    #[arg(long)]
    gps_port: Option<String>,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Terminate commands with CR LF instead of CR.
    #[arg(long)]
    crlf: bool,

    /// Command to run when the port opens (repeatable, e.g. --init "E0 V1").
    #[arg(long = "init")]
    init: Vec<String>,

    /// Per-command reply timeout in seconds.
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// Use a scripted mock transport instead of a serial port.
    /// Every command gets an `OK`; useful to check CLI wiring.
    #[arg(long)]
    mock: bool,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send AT commands one after the other and print the replies.
    Send {
        /// Commands, with or without the AT prefix.
        #[arg(required = true)]
        commands: Vec<String>,

        /// Accept cached replies for repeated commands.
        #[arg(long)]
        cached: bool,
    },

    /// Print unsolicited messages and port events as they arrive.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Extra URC regex to report (repeatable).
        #[arg(long = "pattern")]
        patterns: Vec<String>,
    },

    /// Probe test-form commands and report which ones the modem supports.
    Probe {
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Stress test: back-to-back commands, then report throughput.
    Stress {
        #[arg(long, default_value_t = 100)]
        count: u32,

        #[arg(long, default_value = "+CSQ")]
        command: String,
    },

    /// Start the GPS engine, print NMEA traces, then stop it.
    Gps {
        #[arg(long, default_value = "nmea", value_enum)]
        source: GpsSource,

        /// Seconds to keep the engine running.
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Power the modem down and wait for its confirmation.
    PowerOff,
}

#[derive(Clone, Copy, ValueEnum)]
enum GpsSource {
    Nmea,
    Raw,
    Unmanaged,
}

impl From<GpsSource> for LocationSources {
    fn from(source: GpsSource) -> Self {
        match source {
            GpsSource::Nmea => LocationSources::GPS_NMEA,
            GpsSource::Raw => LocationSources::GPS_RAW,
            GpsSource::Unmanaged => LocationSources::GPS_UNMANAGED,
        }
    }
}

/// URCs every modem tends to send; `monitor` reports them by default.
const COMMON_URCS: &[&str] = &[
    r"\r\n\+C(?:REG|GREG|EREG|5GREG): [^\r\n]*\r\n",
    r"\r\n\+CIEV: [^\r\n]*\r\n",
    r"\r\n\+CMTI: [^\r\n]*\r\n",
    r"\r\n\+CUSD: [^\r\n]*\r\n",
    r"\r\nRING\r\n",
    r"\r\n\^[A-Z]+(?::[^\r\n]*)?\r\n",
];

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn timeout(cli: &Cli) -> Duration {
    Duration::from_secs(cli.timeout)
}

fn port_builder(cli: &Cli) -> AtPortBuilder {
    AtPortBuilder::new()
        .baud_rate(cli.baud)
        .flags(PortFlags::PRIMARY | PortFlags::GPS_CONTROL)
        .send_lf(cli.crlf)
        .init_sequence(cli.init.iter().cloned())
}

/// Script an `OK` for every command the chosen subcommand will send.
fn mock_transport(cli: &Cli) -> Result<MockTransport> {
    let mut mock = MockTransport::new();
    let script = |mock: &mut MockTransport, command: &str, reply: &[u8]| {
        mock.expect(&encode_command(command, false, cli.crlf), reply);
    };

    for command in &cli.init {
        script(&mut mock, command, b"\r\nOK\r\n");
    }
    match &cli.command {
        Command::Send { commands, cached } => {
            let mut seen = Vec::new();
            for command in commands {
                if *cached && seen.contains(command) {
                    continue;
                }
                script(&mut mock, command, b"\r\nOK\r\n");
                seen.push(command.clone());
            }
        }
        Command::Probe { commands } => {
            for command in commands {
                script(&mut mock, command, b"\r\nOK\r\n");
            }
        }
        Command::Stress { count, command } => {
            for _ in 0..*count {
                script(&mut mock, command, b"\r\nOK\r\n");
            }
        }
        Command::Monitor { .. } => {}
        Command::PowerOff => script(&mut mock, "+QPOWD=1", b"\r\nOK\r\n\r\nPOWERED DOWN\r\n"),
        Command::Gps { .. } => bail!("the gps command needs a real modem"),
    }
    Ok(mock)
}

async fn open_port(cli: &Cli) -> Result<AtPort> {
    if cli.mock {
        let mock = mock_transport(cli)?;
        let handle = mock.handle();
        let port = port_builder(cli)
            .device("mock")
            .build_with_transport(Box::new(mock))
            .await
            .context("failed to open mock port")?;
        if matches!(cli.command, Command::Monitor { .. }) {
            tokio::spawn(async move {
                for urc in [&b"\r\n+CREG: 1\r\n"[..], b"\r\n+CIEV: 2,3\r\n", b"\r\nRING\r\n"] {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    handle.inject(urc);
                }
            });
        }
        println!("Opened mock port");
        return Ok(port);
    }

    let device = cli
        .port
        .as_deref()
        .context("--port is required when not using --mock")?;
    let port = port_builder(cli)
        .device(device)
        .build()
        .await
        .with_context(|| format!("failed to open {device} at {} baud", cli.baud))?;
    println!("Opened {device} at {} baud", cli.baud);
    Ok(port)
}

async fn build_modem(cli: &Cli) -> Result<BaseModem> {
    let port = open_port(cli).await?;
    let device = cli.port.clone().unwrap_or_else(|| "mock".into());
    let mut builder = BaseModem::builder(&device).grab_port(PortKind::At, port);

    if let Some(gps) = &cli.gps_port {
        let gps = AtPortBuilder::new()
            .device(gps)
            .baud_rate(cli.baud)
            .remove_echo(false)
            .build()
            .await
            .with_context(|| format!("failed to open {} port {gps}", PortKind::Gps))?;
        gps.close().await?;
        builder = builder.grab_port(PortKind::Gps, gps);
    }
    Ok(builder.build()?)
}

/// Token cancelled on Ctrl-C or once `duration_secs` (if non-zero) elapsed.
fn run_for(duration_secs: u64) -> CancellationToken {
    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        let elapsed = async {
            if duration_secs > 0 {
                tokio::time::sleep(Duration::from_secs(duration_secs)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = elapsed => {}
        }
        stop.cancel();
    });
    token
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_send(modem: &BaseModem, commands: &[String], cached: bool, timeout: Duration) -> Result<()> {
    let mut failures = 0;
    for command in commands {
        let start = Instant::now();
        match modem.at_command(command, timeout, cached).await {
            Ok(reply) => {
                println!("{command} ({} ms)", start.elapsed().as_millis());
                for line in reply.lines() {
                    println!("  {line}");
                }
            }
            Err(e) => {
                println!("{command} failed: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} commands failed", commands.len());
    }
    Ok(())
}

async fn cmd_monitor(port: &AtPort, duration_secs: u64, patterns: &[String]) -> Result<()> {
    for pattern in COMMON_URCS.iter().copied().chain(patterns.iter().map(String::as_str)) {
        port.add_unsolicited_handler(pattern, |m| {
            println!("[urc] {}", m.text().trim());
            Ok(())
        })
        .with_context(|| format!("invalid pattern {pattern:?}"))?;
    }

    let mut events = port.subscribe();
    let stop = run_for(duration_secs);
    println!("Monitoring unsolicited messages (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => println!("[event] {event:?}"),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} events"),
                Err(RecvError::Closed) => {
                    println!("Port closed.");
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn cmd_probe(modem: &BaseModem, commands: &[String]) -> Result<()> {
    for command in commands {
        let support = modem.probe_feature(command, command).await;
        println!("{command:<20} {support}");
    }
    Ok(())
}

async fn cmd_stress(port: &AtPort, count: u32, command: &str, timeout: Duration) -> Result<()> {
    println!("Stress test: {count} x {command}");

    // Queue everything up front; the IO task keeps them in order.
    let start = Instant::now();
    let replies: Vec<_> = (0..count)
        .map(|_| port.queue_command(AtCommand::new(command).timeout(timeout)))
        .collect();

    let mut failures = 0u32;
    for (i, reply) in replies.into_iter().enumerate() {
        if let Err(e) = reply.await {
            eprintln!("[{}/{count}] {command} failed: {e}", i + 1);
            failures += 1;
        }
    }

    let elapsed = start.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        f64::from(count) / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!();
    println!("Results:");
    println!("  Commands:  {count}");
    println!("  Failures:  {failures}");
    println!("  Elapsed:   {:.3} s", elapsed.as_secs_f64());
    println!("  Rate:      {rate:.1} commands/sec");

    if failures > 0 {
        bail!("{failures} out of {count} commands failed");
    }
    Ok(())
}

async fn cmd_gps(modem: Arc<BaseModem>, source: LocationSources, duration_secs: u64) -> Result<()> {
    let location = EngineGpsLocation::new(Arc::clone(&modem), GenericLocation::new());
    let sources = location.load_capabilities().await?;
    println!("Location sources: {sources:?}");
    if !sources.contains(source) {
        bail!("modem does not support {source:?}");
    }

    let mut nmea = location.subscribe_nmea();
    location.enable_gathering(source).await?;
    println!("GPS engine started");

    let stop = run_for(duration_secs);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            sentence = nmea.recv() => match sentence {
                Ok(sentence) => println!("{sentence}"),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} sentences"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    location.disable_gathering(source).await?;
    println!("GPS engine stopped");
    Ok(())
}

async fn cmd_power_off(modem: &BaseModem) -> Result<()> {
    let start = Instant::now();
    PowerDown::default().run(modem).await.context("power down failed")?;
    println!("Modem powered down after {:.1} s", start.elapsed().as_secs_f64());
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.mock && cli.port.is_some() {
        bail!("--port and --mock are mutually exclusive");
    }
    if cli.gps_port.is_some() && !matches!(cli.command, Command::Gps { .. }) {
        bail!("--gps-port is only used by the gps command");
    }

    let modem = Arc::new(build_modem(&cli).await?);
    let port = modem.best_at_port()?.clone();

    let result = match &cli.command {
        Command::Send { commands, cached } => cmd_send(&modem, commands, *cached, timeout(&cli)).await,
        Command::Monitor { duration, patterns } => cmd_monitor(&port, *duration, patterns).await,
        Command::Probe { commands } => cmd_probe(&modem, commands).await,
        Command::Stress { count, command } => cmd_stress(&port, *count, command, timeout(&cli)).await,
        Command::Gps { source, duration } => {
            cmd_gps(Arc::clone(&modem), (*source).into(), *duration).await
        }
        Command::PowerOff => cmd_power_off(&modem).await,
    };

    modem.shutdown().await.ok();
    result
}
