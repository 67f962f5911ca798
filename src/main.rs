//! ScreenPilot - vision-gated automation for a remote Android app
//!
//! Main entry point for the command-line application.
//!
//! # Overview
//!
//! The binary wires the library together for one subcommand:
//! - `run`: heartbeat loop plus watchdog, unattended
//! - `campaign`: repeated missions under a stop policy
//! - `classify`: classify one frame (device or PNG file) and print the result
//! - `tap`: one visibility-gated tap on a registry label
//! - `blind-tap`: a bounded repeating tap on the queued path
//! - `watchdog`: only the liveness supervisor
//!
//! # Execution Flow
//!
//! 1. Parse arguments, load `settings.yaml` from the config directory
//! 2. Initialize logging → `logs/<prefix>.<date>`
//! 3. Create tokio runtime with 4 worker threads
//! 4. Install the Ctrl-C handler that raises the process-wide interrupt
//! 5. Run the subcommand until it finishes or is interrupted
//! 6. Log the metrics summary and shut the runtime down with a 5s timeout

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use screenpilot::models::{MissionEvent, Point};
use screenpilot::services::{
    AdbDevice, BlindTapper, CampaignHooks, DeviceExecutor, EventSink, FrameSource, HandlerTable, Heartbeat,
    ImmediateInput, MissionRunner, PerceptionEngine, StopPolicy, TapQueue, Watchdog,
    WatchdogConfig, run_campaign,
};
use screenpilot::services::signal::sleep_or_cancel;
use screenpilot::{APP_NAME, ConfigManager, Metrics, Settings, StateManager, VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "screenpilot", version, about = "Vision-gated automation for a remote Android app")]
struct Cli {
    /// Directory holding settings.yaml, clickmap.json and state_definitions.yaml
    #[arg(long, global = true, default_value = "config")]
    config_dir: Utf8PathBuf,

    /// Log at debug level (includes per-fingerprint match records)
    #[arg(long, global = true)]
    debug: bool,

    /// Log to file only
    #[arg(long, global = true)]
    no_console: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Heartbeat loop with the watchdog alongside
    Run {
        /// Do not supervise or restart the app
        #[arg(long)]
        no_restart: bool,
    },

    /// Repeat the mission until a stop condition is met
    Campaign {
        #[arg(long)]
        max_runs: Option<u32>,

        /// Seconds
        #[arg(long)]
        max_duration: Option<u64>,

        /// Poll and classify, but send no input
        #[arg(long)]
        dry_run: bool,

        /// Mission file inside the config directory
        #[arg(long)]
        mission: Option<String>,
    },

    /// Classify a single frame
    Classify {
        /// PNG to classify instead of a fresh device capture
        #[arg(long)]
        image: Option<Utf8PathBuf>,
    },

    /// Tap a registry label if it is on screen
    Tap { key: String },

    /// Tap one point repeatedly through the queued path
    BlindTap {
        /// Registry entry whose static tap point is used
        #[arg(long, required_unless_present = "x", conflicts_with = "x")]
        key: Option<String>,

        #[arg(long, requires = "y")]
        x: Option<u32>,

        #[arg(long, requires = "x")]
        y: Option<u32>,

        /// Seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Milliseconds between taps
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Only supervise the app
    Watchdog {
        /// Seconds between checks
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let mut settings = config_manager.load_settings()?;
    settings.logging.debug |= cli.debug;
    settings.logging.console &= !cli.no_console;

    let _guard = screenpilot::logging::setup_logging(&settings.logging)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("screenpilot-worker")
        .build()?;

    tracing::info!("Tokio runtime initialized with {} worker threads", 4);

    let metrics = Arc::new(Metrics::new());
    let result = runtime.block_on(execute(cli.command, config_manager, settings, metrics.clone()));

    metrics.log_summary();
    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Application shutdown complete");

    result.inspect_err(|e| tracing::error!("{:#}", e))
}

/// Everything a device-facing subcommand needs.
struct App {
    config: ConfigManager,
    settings: Settings,
    metrics: Arc<Metrics>,
    device: Arc<AdbDevice>,
    perception: Arc<PerceptionEngine>,
    state: StateManager,
    interrupt: watch::Receiver<bool>,
}

impl App {
    fn load(
        config: ConfigManager,
        settings: Settings,
        metrics: Arc<Metrics>,
        interrupt: watch::Receiver<bool>,
    ) -> Result<Self> {
        let template_dir = config.config_dir().join(&settings.perception.template_dir);
        let perception = PerceptionEngine::load(&config, &template_dir)
            .context("Failed to load perception data")?;
        tracing::info!(
            "Perception loaded: {} fingerprints, {} states, {} overlays",
            perception.registry().len(),
            perception.definitions().states().len(),
            perception.definitions().overlays().len()
        );

        let state = StateManager::new();
        state.set_exec_mode(settings.heartbeat.exec_mode);

        Ok(Self {
            device: Arc::new(AdbDevice::new(&settings.device)),
            perception: Arc::new(perception),
            config,
            settings,
            metrics,
            state,
            interrupt,
        })
    }

    fn executor(&self) -> Arc<dyn DeviceExecutor> {
        self.device.clone()
    }

    fn input(&self) -> ImmediateInput {
        let frames: Arc<dyn FrameSource> = self.device.clone();
        ImmediateInput::new(
            frames,
            self.executor(),
            self.perception.clone(),
            self.metrics.clone(),
        )
    }

    fn watchdog(&self, interval: Option<u64>) -> Watchdog {
        let mut config =
            WatchdogConfig::from_settings(&self.settings.watchdog, &self.settings.device.app_id);
        if let Some(secs) = interval {
            config.interval = Duration::from_secs(secs);
        }
        Watchdog::new(self.executor(), self.state.clone(), self.metrics.clone(), config)
    }

    /// Start the watchdog in the background; returns its stop switch.
    fn spawn_watchdog(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.watchdog(None).run(stop_rx));
        (stop_tx, handle)
    }
}

async fn stop_watchdog(watchdog: Option<(watch::Sender<bool>, JoinHandle<()>)>) {
    if let Some((stop_tx, handle)) = watchdog {
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            tracing::error!("Watchdog task join error: {}", e);
        }
    }
}

async fn execute(
    command: Command,
    config: ConfigManager,
    settings: Settings,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let (interrupt_tx, interrupt) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping at the next check point");
            let _ = interrupt_tx.send(true);
        }
    });

    if let Command::Classify { image: Some(path) } = &command {
        return classify_file(&config, &settings, path);
    }

    let app = App::load(config, settings, metrics, interrupt)?;
    match command {
        Command::Run { no_restart } => run_heartbeat(&app, no_restart).await,
        Command::Campaign {
            max_runs,
            max_duration,
            dry_run,
            mission,
        } => run_campaign_command(&app, max_runs, max_duration, dry_run, mission).await,
        Command::Classify { .. } => {
            let frame = app.input().capture().await.context("Capture failed")?;
            print_detection(&app.perception, &frame)
        }
        Command::Tap { key } => {
            let outcome = app.input().tap_label(&key).await;
            println!("{:?}", outcome);
            if !outcome.is_success() {
                bail!("Tap on {} did not happen", key);
            }
            Ok(())
        }
        Command::BlindTap {
            key,
            x,
            y,
            duration,
            interval,
        } => blind_tap(&app, key, x.zip(y), duration, interval).await,
        Command::Watchdog { interval } => {
            app.watchdog(interval).run(app.interrupt.clone()).await;
            Ok(())
        }
    }
}

fn classify_file(config: &ConfigManager, settings: &Settings, path: &Utf8Path) -> Result<()> {
    let template_dir = config.config_dir().join(&settings.perception.template_dir);
    let perception = PerceptionEngine::load(config, &template_dir)?;
    let frame = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path))?
        .to_luma8();
    print_detection(&perception, &frame)
}

fn print_detection(perception: &PerceptionEngine, frame: &screenpilot::services::Frame) -> Result<()> {
    let detection = perception.classify(frame)?;
    println!("{}", serde_json::to_string_pretty(&detection)?);
    Ok(())
}

async fn run_heartbeat(app: &App, no_restart: bool) -> Result<()> {
    let supervise = app.settings.watchdog.enabled && !no_restart;
    let watchdog = supervise.then(|| app.spawn_watchdog());

    let heartbeat = Heartbeat::new(
        app.input(),
        app.state.clone(),
        HandlerTable::with_defaults(&app.settings.heartbeat),
        app.settings.heartbeat.clone(),
    );
    let result = heartbeat.run(app.interrupt.clone()).await;

    stop_watchdog(watchdog).await;
    result.context("Heartbeat stopped on an ambiguous classification")
}

async fn run_campaign_command(
    app: &App,
    max_runs: Option<u32>,
    max_duration: Option<u64>,
    dry_run: bool,
    mission: Option<String>,
) -> Result<()> {
    let file = mission.unwrap_or_else(|| app.settings.mission.definition_file.clone());
    let mission = app.config.load_mission_config(&file)?;

    let mut policy = StopPolicy::from(&app.settings.campaign);
    if max_runs.is_some() {
        policy.max_runs = max_runs;
    }
    if let Some(secs) = max_duration {
        policy.max_duration = Some(Duration::from_secs(secs));
    }

    let supervise = app.settings.watchdog.enabled && !dry_run;
    let watchdog = supervise.then(|| app.spawn_watchdog());

    let log_event = |event: &MissionEvent| -> anyhow::Result<()> {
        tracing::debug!("Event: {:?}", event);
        Ok(())
    };
    let on_event: EventSink<'_> = &log_event;
    let hooks = CampaignHooks {
        on_event: Some(on_event),
        dry_run,
        ..Default::default()
    };

    let runner = MissionRunner::new(app.input(), app.interrupt.clone());
    let result = run_campaign(&runner, &mission, &policy, hooks).await;

    stop_watchdog(watchdog).await;
    let result = result?;
    for (outcome, count) in result.outcomes.iter().filter(|(_, n)| **n > 0) {
        println!("{:<22} {}", outcome, count);
    }
    println!("runs: {}  elapsed: {:.1}s", result.runs, result.total_elapsed.as_secs_f64());
    Ok(())
}

async fn blind_tap(
    app: &App,
    key: Option<String>,
    xy: Option<(u32, u32)>,
    duration: Option<u64>,
    interval: Option<u64>,
) -> Result<()> {
    let (point, label) = match (key, xy) {
        (Some(key), _) => {
            let point = app
                .perception
                .registry()
                .get(&key)
                .and_then(|fp| fp.static_tap_point())
                .with_context(|| format!("{} has no static tap point", key))?;
            (point, key)
        }
        (None, Some((x, y))) => (Point::new(x, y), format!("({}, {})", x, y)),
        (None, None) => bail!("Either --key or --x/--y is required"),
    };

    let dispatch = &app.settings.dispatch;
    let duration = duration.map_or_else(|| dispatch.blind_tap_duration(), Duration::from_secs);
    let interval = interval.map_or_else(|| dispatch.blind_tap_interval(), Duration::from_millis);

    let queue = TapQueue::spawn(app.executor(), dispatch.queue_pacing(), app.metrics.clone());
    let tapper = BlindTapper::new(queue.sender());
    tapper.start(point, &label, duration, interval);

    let mut interrupt = app.interrupt.clone();
    while tapper.is_active() {
        if sleep_or_cancel(Duration::from_millis(200), &mut interrupt).await {
            break;
        }
    }
    let taps = tapper.stop().await.unwrap_or(0);
    queue.shutdown().await;

    println!("{} taps queued on {}", taps, label);
    Ok(())
}
