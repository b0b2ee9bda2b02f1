use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use ctrlhub_midi::backend_virtual::LAUNCHPAD_PRO_IDENTITY;
use ctrlhub_midi::device::ReportHandler;
use ctrlhub_midi::{
    BackendReport, DeviceId, DeviceInfo, DeviceManager, ManagerConfig, MessageRecord,
    MidiBackend, VirtualBackend, VirtualPeer,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ManagerConfig::try_load(path)?,
        None => ManagerConfig::load(),
    };
    if let Commands::Config(args) = &cli.command {
        return show_config(&config, args);
    }

    let (backend, demo) = open_backend(cli.virtual_devices)?;
    let manager = DeviceManager::new(backend, config).context("failed to start device manager")?;
    let result = match cli.command {
        Commands::List => list(&manager),
        Commands::Watch(args) => watch(&manager, args),
        Commands::Record(args) => record(&manager, args),
        Commands::Config(_) => Ok(()),
    };
    drop(demo);
    result
}

#[derive(Parser)]
#[command(author, version, about = "Inspect and record MIDI controllers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Use simulated controllers instead of hardware.
    #[arg(long = "virtual", global = true)]
    virtual_devices: bool,
    /// Load the manager configuration from this file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair ports, verify every device and print the table.
    List,
    /// Print device and message events as they happen.
    Watch(WatchArgs),
    /// Record channel messages from every available device.
    Record(RecordArgs),
    /// Print the effective configuration.
    Config(ConfigArgs),
}

#[derive(Args)]
struct WatchArgs {
    /// Stop after this many seconds instead of running forever.
    #[arg(long)]
    seconds: Option<u64>,
}

#[derive(Args)]
struct RecordArgs {
    /// Recording length in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Write the recording here instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    /// Also write the configuration to the user config directory.
    #[arg(long)]
    save: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn open_backend(virtual_devices: bool) -> Result<(Arc<dyn MidiBackend>, Option<Demo>)> {
    if virtual_devices {
        let backend = VirtualBackend::new();
        let demo = Demo::start(backend.clone())?;
        return Ok((Arc::new(backend), Some(demo)));
    }
    hardware_backend().map(|backend| (backend, None))
}

#[cfg(feature = "midir-backend")]
fn hardware_backend() -> Result<Arc<dyn MidiBackend>> {
    Ok(Arc::new(ctrlhub_midi::MidirBackend::new()))
}

#[cfg(not(feature = "midir-backend"))]
fn hardware_backend() -> Result<Arc<dyn MidiBackend>> {
    anyhow::bail!("built without a hardware backend, use --virtual")
}

fn list(manager: &DeviceManager) -> Result<()> {
    manager.refresh()?;
    let config = manager.config();
    let deadline = Instant::now() + config.verify_delay() + config.verify_timeout();
    while Instant::now() < deadline
        && !manager
            .get_devices()
            .iter()
            .all(|info| info.status.is_terminal())
    {
        thread::sleep(Duration::from_millis(20));
    }

    let devices = manager.get_devices();
    if devices.is_empty() {
        println!("No paired MIDI devices found.");
        return Ok(());
    }
    for info in devices {
        print_device(&info);
    }
    Ok(())
}

fn print_device(info: &DeviceInfo) {
    let name = if info.display_name.is_empty() {
        "-"
    } else {
        info.display_name.as_str()
    };
    println!(
        "{:<6} {:<28} {:<12} {} / {}",
        info.id.to_string(),
        name,
        info.status.to_string(),
        info.input.name,
        info.output.name
    );
}

fn watch(manager: &DeviceManager, args: WatchArgs) -> Result<()> {
    let (tx, rx) = unbounded::<String>();
    forward_events(manager, tx);
    manager.refresh()?;
    manager.start_hotplug()?;

    let deadline = args
        .seconds
        .map(|seconds| Instant::now() + Duration::from_secs(seconds));
    loop {
        let timeout = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left
            }
            None => Duration::from_secs(1),
        };
        match rx.recv_timeout(timeout) {
            Ok(line) => println!("{line}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn forward_events(manager: &DeviceManager, tx: Sender<String>) {
    let sink = tx.clone();
    manager.on_device_added(Arc::new(move |info: &DeviceInfo| {
        let _ = sink.send(format!("added    {} {}", info.id, info.display_name));
    }));
    let sink = tx.clone();
    manager.on_device_removed(Arc::new(move |info: &DeviceInfo| {
        let _ = sink.send(format!("removed  {} {}", info.id, info.display_name));
    }));
    let sink = tx.clone();
    manager.on_midi_message(Arc::new(move |id: DeviceId, bytes: &[u8]| {
        let _ = sink.send(format!("message  {id} {bytes:02X?}"));
    }));
    let sink = tx.clone();
    let errors: Arc<ReportHandler> = Arc::new(move |report: &BackendReport| {
        let _ = sink.send(format!("error    {report}"));
    });
    manager.on_error(errors);
    let warnings: Arc<ReportHandler> = Arc::new(move |report: &BackendReport| {
        let _ = tx.send(format!("warning  {report}"));
    });
    manager.on_warning(warnings);
}

#[derive(Serialize)]
struct DeviceRecording {
    device: String,
    messages: Vec<MessageRecord>,
}

fn record(manager: &DeviceManager, args: RecordArgs) -> Result<()> {
    manager.refresh()?;
    manager.start_hotplug()?;
    manager.start_recording();
    tracing::info!(seconds = args.seconds, "recording");
    thread::sleep(Duration::from_secs(args.seconds));
    manager.stop_recording();

    let recording: Vec<DeviceRecording> = manager
        .recorded()
        .into_iter()
        .map(|(device, messages)| DeviceRecording { device, messages })
        .collect();
    let json = serde_json::to_string_pretty(&recording)?;
    match args.output {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn show_config(config: &ManagerConfig, args: &ConfigArgs) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if args.save {
        config.save();
    }
    Ok(())
}

/// Simulated controllers for `--virtual`: a Launchpad Pro playing a scale,
/// an unrecognised synth and a box that never answers.
struct Demo {
    stop_tx: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Demo {
    const PLAYER_INPUT: &'static str = "Launchpad Pro In";

    fn start(backend: VirtualBackend) -> Result<Self> {
        backend.plug(VirtualPeer::new("Launchpad Pro").with_identity(&LAUNCHPAD_PRO_IDENTITY));
        backend.plug(VirtualPeer::new("Mystery Synth").with_identity(&[0x00, 0x21, 0x09, 0x01]));
        backend.plug(VirtualPeer::new("Mute Box"));

        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("ctrlhub-demo".into())
            .spawn(move || {
                let scale = [60u8, 62, 64, 65, 67, 69, 71, 72];
                for note in scale.iter().copied().cycle() {
                    backend.inject(Self::PLAYER_INPUT, &[0x90, note, 100]);
                    match stop_rx.recv_timeout(Duration::from_millis(200)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    backend.inject(Self::PLAYER_INPUT, &[0x80, note, 0]);
                }
            })
            .context("failed to spawn demo thread")?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(handle),
        })
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
