mod config;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use config::MonitorConfig;
use sos_core::activity::export_filename as activity_filename;
use sos_core::alert::ConsoleAlertSink;
use sos_core::audio::{SilentSink, TerminalBell};
use sos_core::device::spawn_scheduler;
use sos_core::emergency::{LoggingNotifier, PanicOutcome};
use sos_core::serial::{export_filename as session_filename, BoxedReader, BoxedWriter};
use sos_core::weather::{WeatherProvider, WeatherStatus};
use sos_core::{
    AudioSink, CoreConfig, KeyValueStore, LogQuery, MemoryStore, QoSLevel, RocksStore,
    SerialMonitor, SerialSource, Sinks, SosConnect, Topic,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "sos-monitor")]
#[command(author, version, about = "Serial stream monitor with emergency keyword alerting")]
#[command(propagate_version = true)]
struct Cli {
    /// TOML config file (default: $SOS_MONITOR_CONFIG or ./sos_monitor.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep all state in memory instead of the data directory
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a device stream
    Run {
        /// Serial device path, e.g. /dev/ttyUSB0
        #[arg(long, conflicts_with_all = ["tcp", "stdin"])]
        device: Option<PathBuf>,

        /// Serial-over-TCP bridge address, e.g. 192.168.1.20:4000
        #[arg(long, conflicts_with = "stdin")]
        tcp: Option<String>,

        /// Read the stream from stdin
        #[arg(long)]
        stdin: bool,

        /// Override the configured baud rate
        #[arg(long)]
        baud: Option<u32>,
    },

    /// Show which alert a piece of text would raise
    Scan {
        text: String,
    },

    /// Inspect the alert log
    Alerts {
        #[command(subcommand)]
        command: AlertCommands,
    },

    /// Export or restore the activity log
    Activity {
        #[command(subcommand)]
        command: ActivityCommands,
    },

    /// Current weather for a place
    Weather {
        location: String,
    },
}

#[derive(Subcommand)]
enum AlertCommands {
    /// List logged alerts, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Acknowledge an alert (default: newest unacknowledged)
    Ack {
        id: Option<String>,
    },
    /// Clear the alert log
    Clear,
    /// Write the alert log as JSON
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Replace the alert log from a JSON export
    Import {
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum ActivityCommands {
    Export {
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Replace the activity log from a JSON export
    Import {
        input: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,sos_core=info,sos_monitor=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut cfg = MonitorConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Scan { text } => {
            cmd_scan(&cfg, &text);
            Ok(())
        }
        Commands::Weather { location } => cmd_weather(&cfg, &location).await,
        Commands::Run {
            device,
            tcp,
            stdin,
            baud,
        } => {
            if let Some(b) = baud {
                cfg.serial.baud_rate = b;
            }
            let source = match (device, tcp, stdin) {
                (Some(path), _, _) => SerialSource::Device(path),
                (None, Some(addr), _) => SerialSource::Tcp(addr),
                (None, None, true) => SerialSource::Stdin,
                (None, None, false) => {
                    return Err("choose a source: --device PATH, --tcp ADDR or --stdin".into())
                }
            };
            let app = build_app(&cfg, cli.ephemeral).await?;
            let result = cmd_run(&app, &cfg, source).await;
            app.shutdown().await?;
            result
        }
        Commands::Alerts { command } => {
            let app = build_app(&cfg, cli.ephemeral).await?;
            cmd_alerts(&app, command).await
        }
        Commands::Activity { command } => {
            let app = build_app(&cfg, cli.ephemeral).await?;
            cmd_activity(&app, command).await
        }
    }
}

async fn build_app(cfg: &MonitorConfig, ephemeral: bool) -> Result<SosConnect, BoxError> {
    let store: Arc<dyn KeyValueStore> = if ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        std::fs::create_dir_all(&cfg.data_dir)?;
        Arc::new(RocksStore::open(&cfg.data_dir)?)
    };
    let audio: Arc<dyn AudioSink> = if cfg.sound {
        Arc::new(TerminalBell)
    } else {
        Arc::new(SilentSink)
    };
    let sinks = Sinks {
        alert: Arc::new(ConsoleAlertSink),
        audio,
        contacts: Arc::new(LoggingNotifier),
    };
    let core = CoreConfig {
        scanner: cfg.scanner.clone(),
        activity: cfg.activity.clone(),
        panic: cfg.panic.clone(),
    };
    Ok(SosConnect::new(store, cfg.keywords.clone(), core, sinks).await?)
}

fn cmd_scan(cfg: &MonitorConfig, text: &str) {
    match cfg.keywords.scan(text) {
        Some(entry) => println!("{} {} - {}", entry.icon, entry.title, entry.message),
        None => println!("No alert"),
    }
    let all = cfg.keywords.matches(text);
    if all.len() > 1 {
        println!("All matches in table order:");
        for entry in all {
            println!("  {:<10} {}", entry.keyword, entry.title);
        }
    }
}

async fn cmd_weather(cfg: &MonitorConfig, location: &str) -> Result<(), BoxError> {
    let provider = WeatherProvider::with_config(cfg.weather.clone());
    match provider.status(location).await {
        WeatherStatus::Available(report) => println!("{}", report.summary()),
        WeatherStatus::Unavailable(reason) => println!("Weather unavailable ({})", reason),
    }
    Ok(())
}

async fn cmd_alerts(app: &SosConnect, command: AlertCommands) -> Result<(), BoxError> {
    let mut alerts = app.alerts.lock().await;
    match command {
        AlertCommands::List { limit } => {
            let recent = alerts.recent(limit);
            if recent.is_empty() {
                println!("No alerts logged");
            }
            for a in recent {
                let status = if a.acknowledged { "ack" } else { "NEW" };
                println!(
                    "{}  [{}] {} {}  ({})",
                    a.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    status,
                    a.icon,
                    a.title,
                    a.id
                );
            }
        }
        AlertCommands::Ack { id } => {
            let id = match id {
                Some(id) => id,
                None => match alerts.alerts().into_iter().rev().find(|a| !a.acknowledged) {
                    Some(a) => a.id,
                    None => {
                        println!("Nothing to acknowledge");
                        return Ok(());
                    }
                },
            };
            match alerts.acknowledge_id(&id).await {
                Some(a) => println!("Acknowledged {} ({})", a.title, a.id),
                None => println!("No unacknowledged alert with id {}", id),
            }
        }
        AlertCommands::Clear => {
            alerts.clear_log();
            println!("Alert log cleared");
        }
        AlertCommands::Export { out } => {
            let json = alerts.export_json()?;
            write_or_print(out.as_deref(), &json).await?;
        }
        AlertCommands::Import { input } => {
            let json = tokio::fs::read_to_string(&input).await?;
            let n = alerts.import_json(&json)?;
            println!("Imported {} alerts", n);
        }
    }
    Ok(())
}

async fn cmd_activity(app: &SosConnect, command: ActivityCommands) -> Result<(), BoxError> {
    let (format, out) = match command {
        ActivityCommands::Export { format, out } => (format, out),
        ActivityCommands::Import { input } => {
            let json = tokio::fs::read_to_string(&input).await?;
            let n = app.activity.lock().await.import_json(&json)?;
            println!("Imported {} log entries", n);
            return Ok(());
        }
    };
    let activity = app.activity.lock().await;
    let query = LogQuery::default();
    let (content, ext) = match format {
        ExportFormat::Csv => match activity.export_csv(&query) {
            Some(csv) => (csv, "csv"),
            None => {
                println!("No logs to export");
                return Ok(());
            }
        },
        ExportFormat::Json => (activity.export_json(&query)?, "json"),
    };
    let out = out.unwrap_or_else(|| PathBuf::from(activity_filename(ext, Utc::now())));
    tokio::fs::write(&out, content).await?;
    println!("Wrote {}", out.display());
    Ok(())
}

async fn write_or_print(out: Option<&Path>, content: &str) -> Result<(), BoxError> {
    match out {
        Some(path) => {
            tokio::fs::write(path, content).await?;
            println!("Wrote {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

enum Control {
    Continue,
    Quit,
}

async fn cmd_run(app: &SosConnect, cfg: &MonitorConfig, source: SerialSource) -> Result<(), BoxError> {
    app.start().await?;

    let monitor = SerialMonitor::new(app, cfg.serial.clone());
    let (ctl_tx, mut ctl_rx) = mpsc::channel::<String>(32);

    // With --stdin the terminal carries both the stream and the control
    // lines, so split them here.
    let (reader, writer, feed): (BoxedReader, Option<BoxedWriter>, Option<BoxedWriter>) =
        match source {
            SerialSource::Stdin => {
                let (stream_end, feed_end) = tokio::io::duplex(cfg.serial.read_buffer_size.max(64));
                let reader: BoxedReader = Box::new(stream_end);
                let feed: BoxedWriter = Box::new(feed_end);
                (reader, None, Some(feed))
            }
            ref other => {
                let (r, w) = other.open().await?;
                (r, w, None)
            }
        };
    let stdin_task = tokio::spawn(read_terminal(ctl_tx, feed));

    let (_sub, mut serial_rx) = app
        .event_bus
        .subscribe(
            Topic::Serial,
            vec!["serial.disconnected".to_string()],
            QoSLevel::Batched,
        )
        .await?;

    let connection = monitor.attach(&source.to_string(), reader, writer).await;
    let scheduler = spawn_scheduler(Arc::clone(&app.device), cfg.scheduler.clone());
    let weather = cfg.weather_location.clone().map(|loc| {
        let provider = WeatherProvider::with_config(cfg.weather.clone());
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(provider.config().refresh_secs));
            loop {
                interval.tick().await;
                match provider.status(&loc).await {
                    WeatherStatus::Available(r) => info!(target: "weather", "{}", r.summary()),
                    WeatherStatus::Unavailable(_) => info!(target: "weather", "Weather unavailable"),
                }
            }
        })
    });

    eprintln!(
        "Monitoring {} at {}. Type :help for commands.",
        source,
        cfg.serial.describe()
    );

    let mut terminal_open = true;
    let stream_ended = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(target: "sos_monitor", "Shutting down...");
                break false;
            }
            Some(_) = serial_rx.recv() => break true,
            line = ctl_rx.recv(), if terminal_open => match line {
                Some(line) => {
                    if let Control::Quit = handle_control(app, &monitor, &line).await {
                        break false;
                    }
                }
                None => terminal_open = false,
            },
        }
    };

    scheduler.abort();
    if let Some(w) = weather {
        w.abort();
    }
    stdin_task.abort();
    if stream_ended {
        connection.closed().await?;
    } else {
        connection.disconnect().await?;
    }
    Ok(())
}

/// Forward terminal lines: `:`-prefixed ones (and everything, when there is
/// no stream feed) become control lines, the rest go to `feed`.
async fn read_terminal(ctl: mpsc::Sender<String>, mut feed: Option<BoxedWriter>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "sos_monitor", error = %e, "Terminal read failed");
                break;
            }
        };
        match feed.as_mut() {
            Some(w) if !line.starts_with(':') => {
                let data = format!("{}\n", line);
                if let Err(e) = w.write_all(data.as_bytes()).await {
                    warn!(target: "sos_monitor", error = %e, "Stream feed closed");
                    break;
                }
            }
            _ => {
                if ctl.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
    // Dropping the feed ends the stream.
    if let Some(mut w) = feed {
        let _ = w.shutdown().await;
    }
}

async fn handle_control(app: &SosConnect, monitor: &SerialMonitor, line: &str) -> Control {
    let line = line.trim();
    if line.is_empty() {
        return Control::Continue;
    }
    let Some(cmd) = line.strip_prefix(':') else {
        if let Err(e) = app.device.lock().await.send_command(line, true).await {
            eprintln!("Command not sent: {}", e);
        }
        return Control::Continue;
    };

    let mut parts = cmd.split_whitespace();
    match parts.next().unwrap_or_default() {
        "ack" => match app.alerts.lock().await.acknowledge().await {
            Some(a) => {
                app.activity.lock().await.log_user(
                    "Alert acknowledged",
                    serde_json::json!({ "alert_id": a.id, "title": a.title }),
                );
            }
            None => eprintln!("No active alert"),
        },
        "panic" => {
            let immediate = parts.next() == Some("now");
            match app.panic.activate(immediate).await {
                PanicOutcome::Triggered(r) => eprintln!("Emergency triggered ({})", r.id),
                PanicOutcome::CountdownStarted { seconds } => {
                    eprintln!("Panic in {} s. Type :cancel to abort.", seconds)
                }
                PanicOutcome::AlreadyActive => eprintln!("Panic countdown already running"),
            }
        }
        "cancel" => {
            if !app.panic.cancel().await {
                eprintln!("No panic countdown running");
            }
        }
        "save" => {
            let text = monitor.session().lock().await.export_text();
            match text {
                Some(text) => {
                    let name = session_filename(Utc::now());
                    match tokio::fs::write(&name, text).await {
                        Ok(()) => eprintln!("Saved {}", name),
                        Err(e) => error!(target: "sos_monitor", error = %e, "Failed to save session"),
                    }
                }
                None => eprintln!("No data to save!"),
            }
        }
        "clear" => monitor.session().lock().await.clear(),
        "status" => {
            let alerts = app.alerts.lock().await;
            let current = alerts
                .current()
                .map(|a| format!("ALERTING: {} {}", a.icon, a.title))
                .unwrap_or_else(|| "idle".to_string());
            let unread = app.notifications.lock().await.unread_count();
            let session = monitor.session().lock().await.len();
            eprintln!(
                "{} | {} alerts logged | {} session chunks | {} unread notifications",
                current,
                alerts.alerts().len(),
                session,
                unread
            );
        }
        "quit" | "q" => return Control::Quit,
        _ => eprintln!(
            ":ack  :panic [now]  :cancel  :save  :clear  :status  :quit  (other lines are sent to the device)"
        ),
    }
    Control::Continue
}
