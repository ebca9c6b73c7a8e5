//! daq_scope - record, inspect and replay timer device event logs.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use daq_scope::adapters::SerialAdapter;
use daq_scope::config::ScopeConfig;
use daq_scope::data::export::{export_text, TimeFormat, TimeRange};
use daq_scope::data::log_reader::PagedLogReader;
use daq_scope::data::sample::{SampleValue, ValueWidth};
use daq_scope::metadata::LogInfo;
use daq_scope::session::{LiveSession, LogTarget};
use daq_scope::view::{format_period, TriggerWindow, ViewPoller, ViewState};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daq_scope")]
#[command(about = "Capture and replay event streams from a serial timer device")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    /// Local wall-clock time
    Absolute,
    /// Microseconds since the first record
    Relative,
}

impl From<ExportFormat> for TimeFormat {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Absolute => TimeFormat::Absolute,
            ExportFormat::Relative => TimeFormat::Relative,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Record from the device until interrupted
    Record {
        /// Serial port, overriding the configuration
        #[arg(short, long)]
        port: Option<String>,

        /// Output file; a temporary file is used if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<f64>,
    },

    /// Show the channel table and time range of a log
    Info {
        /// Log file
        file: PathBuf,
    },

    /// Export a log as tab-separated text
    Export {
        /// Log file
        file: PathBuf,

        /// Time column format
        #[arg(short, long, value_enum, default_value = "absolute")]
        format: ExportFormat,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List serial ports
    Scan,

    /// Follow a log through the trigger window
    Watch {
        /// Log file
        file: PathBuf,

        /// Where the window state is kept between runs
        #[arg(long)]
        state: Option<PathBuf>,

        /// Stop after this many poll ticks
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Write the default configuration
    InitConfig {
        /// Destination (defaults to the user config directory)
        path: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ScopeConfig> {
    let config = match path {
        Some(path) => ScopeConfig::load_from(path),
        None => ScopeConfig::load(),
    };
    config.context("Failed to load configuration")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path, force } = &cli.command {
        init_tracing("info");
        return init_config(path.clone().unwrap_or_else(ScopeConfig::default_path), *force);
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Record {
            port,
            output,
            seconds,
        } => {
            let target = match output {
                Some(path) => LogTarget::Named(path),
                None => LogTarget::Temporary,
            };
            let limit = seconds.map(Duration::from_secs_f64);
            match config.value_width() {
                ValueWidth::Bits8 => record::<u8>(&config, port, &target, limit).await,
                ValueWidth::Bits16 => record::<u16>(&config, port, &target, limit).await,
            }
        }
        Commands::Info { file } => info_command(&config, &file),
        Commands::Export {
            file,
            format,
            output,
        } => {
            let info = LogInfo::inspect(&file, config.value_width())?;
            match info.metadata.width {
                ValueWidth::Bits8 => export::<u8>(&config, &file, &info, format.into(), output),
                ValueWidth::Bits16 => export::<u16>(&config, &file, &info, format.into(), output),
            }
        }
        Commands::Scan => {
            let ports = SerialAdapter::available_ports()?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
            Ok(())
        }
        Commands::Watch { file, state, ticks } => {
            let info = LogInfo::inspect(&file, config.value_width())?;
            let state = state.unwrap_or_else(|| file.with_extension("view.json"));
            match info.metadata.width {
                ValueWidth::Bits8 => watch::<u8>(&config, &file, &info, &state, ticks).await,
                ValueWidth::Bits16 => watch::<u16>(&config, &file, &info, &state, ticks).await,
            }
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to replace it)",
            path.display()
        ));
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let text = toml::to_string_pretty(&ScopeConfig::default())
        .context("Failed to serialize default configuration")?;
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn record<T: SampleValue>(
    config: &ScopeConfig,
    port: Option<String>,
    target: &LogTarget,
    limit: Option<Duration>,
) -> Result<()> {
    let port = port
        .or_else(|| Some(config.capture.port.clone()).filter(|p| !p.is_empty()))
        .ok_or_else(|| anyhow!("No serial port given; set capture.port or use --port"))?;
    let mut adapter = SerialAdapter::new(port, config.capture.baud_rate);
    adapter.open()?;

    let session = LiveSession::<T>::start(adapter, target, config)?;
    let window = TriggerWindow::new(
        session.open_reader(config.reader)?,
        config.channel_count(),
        config.view.period,
        config.view.trigger,
    );
    let mut poller = ViewPoller::new(window).with_device(session.device()?);

    let started = Instant::now();
    let mut ticker = tokio::time::interval(config.view.poll_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in poller.tick(Instant::now()) {
                    info!(?event, "view");
                }
                if session.is_finished() {
                    info!("device ended the session");
                    break;
                }
                if limit.is_some_and(|limit| started.elapsed() >= limit) {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    poller.detach_device();
    drop(poller);
    let recording = session.stop()?;
    let summary = recording.summary();
    println!(
        "{}: {} records ({} from device), ended by {:?}",
        recording.file().path().display(),
        summary.records_written,
        summary.wire_records,
        summary.end_reason
    );
    if recording.file().is_temporary() {
        warn!("recording was temporary and is discarded; use --output to keep it");
    }
    recording.close();
    Ok(())
}

fn open_reader<T: SampleValue>(
    config: &ScopeConfig,
    file: &Path,
    info: &LogInfo,
) -> Result<PagedLogReader<T>> {
    let mut reader = PagedLogReader::<T>::open(file, config.reader)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    reader.set_limit(info.data_end);
    Ok(reader)
}

fn info_command(config: &ScopeConfig, file: &Path) -> Result<()> {
    let info = LogInfo::inspect(file, config.value_width())?;
    println!("file:     {}", file.display());
    println!("width:    {}", info.metadata.width);
    println!(
        "metadata: {}",
        if info.inferred { "none (channels inferred)" } else { "present" }
    );
    for pin in &info.metadata.pins {
        println!("pin {:>3}  {:<16} {}", pin.index, pin.name, pin.pin_type);
    }
    let range = match info.metadata.width {
        ValueWidth::Bits8 => TimeRange::of(&mut open_reader::<u8>(config, file, &info)?),
        ValueWidth::Bits16 => TimeRange::of(&mut open_reader::<u16>(config, file, &info)?),
    };
    match range {
        Some(range) => println!(
            "range:    {range} [fits {}]",
            format_period(range.span()).trim()
        ),
        None => println!("range:    empty"),
    }
    Ok(())
}

fn export<T: SampleValue>(
    config: &ScopeConfig,
    file: &Path,
    info: &LogInfo,
    format: TimeFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut reader = open_reader::<T>(config, file, info)?;
    let lines = match output {
        Some(path) => {
            let out = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            export_text(&mut reader, &info.metadata.pins, format, BufWriter::new(out))?
        }
        None => export_text(
            &mut reader,
            &info.metadata.pins,
            format,
            BufWriter::new(io::stdout().lock()),
        )?,
    };
    info!(lines, "export complete");
    Ok(())
}

fn load_state(path: &Path) -> Option<ViewState> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable view state");
            None
        }
    }
}

fn save_state(path: &Path, state: &ViewState) -> Result<()> {
    let text = serde_json::to_string_pretty(state)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

async fn watch<T: SampleValue>(
    config: &ScopeConfig,
    file: &Path,
    info: &LogInfo,
    state_path: &Path,
    ticks: Option<u64>,
) -> Result<()> {
    let reader = open_reader::<T>(config, file, info)?;
    let mut window = TriggerWindow::new(
        reader,
        info.metadata.channel_count(),
        config.view.period,
        config.view.trigger,
    );
    if let Some(state) = load_state(state_path) {
        debug!(?state, "view state restored");
        window.restore(&state);
    }
    let mut poller = ViewPoller::new(window);

    let mut ticker = tokio::time::interval(config.view.poll_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut shown = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in poller.tick(Instant::now()) {
                    info!(?event, "view");
                }
                let state = poller.window().state();
                if shown != Some(state) {
                    println!(
                        "[{} .. {}) {}{}{}",
                        state.first,
                        state.last,
                        format_period(state.period),
                        if state.frozen { " frozen" } else { "" },
                        if state.armed { "" } else { " disarmed" },
                    );
                    for (index, channel) in poller.window().channels().iter().enumerate() {
                        let value = channel.value.map_or("?".to_string(), |v| v.to_string());
                        println!("  {index:>3}: {value}");
                    }
                    shown = Some(state);
                }
                if ticks.is_some_and(|ticks| poller.ticks() >= ticks) {
                    break;
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    save_state(state_path, &poller.window().state())
}
