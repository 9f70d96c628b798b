//! zm_detect
//!
//! Invoked by the event server (or ZoneMinder's EventStartCommand) for every
//! alarm:
//!
//! ```text
//! zm_detect -c /etc/zm/objectconfig.yml -e <eid> -m <mid> -r "<cause>" -n
//! ```
//!
//! Prints `<prefix>detected:<labels>--SPLIT--<json>` when something was found
//! and nothing otherwise.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use log::LevelFilter;

use zmes_hook::detect::{BackendRegistry, DetectionResult, Dispatcher, Target};
use zmes_hook::output::{format_detection, SPLIT};
use zmes_hook::platform::{self, PlatformClient, ZmApiClient};
use zmes_hook::{ConfigResolver, HookError, Result, RunContext, VERSION};

#[derive(Parser, Debug)]
#[command(name = "zm_detect", about = "Object detection hook for ZoneMinder events", disable_version_flag = true)]
struct Cli {
    /// Config file with path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Event ID to analyze
    #[arg(short, long)]
    eventid: Option<String>,

    /// Where to store objects.json (looked up from the API when omitted)
    #[arg(short = 'p', long)]
    eventpath: Option<PathBuf>,

    /// Monitor ID, selects the per-monitor overrides
    #[arg(short, long)]
    monitorid: Option<String>,

    /// Path for debug images
    #[arg(short, long)]
    output_path: Option<PathBuf>,

    /// Analyze a local file instead of an event
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Alarm cause reported by the platform
    #[arg(short, long)]
    reason: Option<String>,

    /// Update the event notes with the prediction
    #[arg(short, long)]
    notes: bool,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,

    /// Override detection results with fake labels, e.g. "dog,person"
    #[arg(long)]
    fakeit: Option<String>,

    /// Print version information
    #[arg(short = 'v', long)]
    version: bool,

    /// Print only the version number
    #[arg(long)]
    bareversion: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    if cli.version {
        println!("app:{}", VERSION);
        return ExitCode::SUCCESS;
    }
    if cli.bareversion {
        println!("{}", VERSION);
        return ExitCode::SUCCESS;
    }
    if cli.config.is_none() {
        eprintln!("--config required");
        return ExitCode::FAILURE;
    }
    if cli.file.is_none() && cli.eventid.is_none() {
        eprintln!("--eventid required");
        return ExitCode::FAILURE;
    }

    init_logging(&cli);
    log::debug!("zm_detect {} invoked: {}", VERSION, std::env::args().collect::<Vec<_>>().join(" "));

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::SUCCESS
        }
    }
}

fn logger_name(cli: &Cli) -> String {
    match &cli.monitorid {
        Some(mid) => format!("zmesdetect_m{}", mid),
        None => "zmesdetect".to_string(),
    }
}

/// `RUST_LOG` wins; otherwise debug output is switched on by `--debug` or
/// later by `pyzm_overrides.log_debug`
fn init_logging(cli: &Cli) {
    let name = logger_name(cli);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format(move |buf, record| {
            writeln!(buf, "{} {}[{}] {}", buf.timestamp(), name, record.level(), record.args())
        })
        .init();

    if std::env::var_os("RUST_LOG").is_none() && !cli.debug {
        log::set_max_level(LevelFilter::Info);
    }
}

fn config_resolver<'a>(cli: &Cli) -> ConfigResolver<'a> {
    let mut resolver = ConfigResolver::new(cli.config.clone().unwrap_or_default());
    if let Some(mid) = &cli.monitorid {
        resolver = resolver.monitor(mid.trim());
    }
    if let Some(reason) = &cli.reason {
        resolver = resolver.reason(reason.as_str());
    }
    resolver
}

fn needs_platform(cli: &Cli, ctx: &RunContext) -> bool {
    let config = &ctx.config;
    let zones = config.is_yes("import_zm_zones") && cli.monitorid.is_some();
    let event_actions = cli.eventid.is_some()
        && (cli.notes
            || config.is_yes("tag_detected_objects")
            || (config.is_yes("write_image_to_zm") && cli.eventpath.is_none()));
    zones || event_actions
}

fn connect_platform(ctx: &RunContext) -> Option<ZmApiClient> {
    match ZmApiClient::from_config(&ctx.config) {
        Ok(client) => Some(client),
        Err(e) => {
            log::error!("Could not connect to the ZoneMinder API: {}", e);
            None
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut ctx = config_resolver(cli).resolve()?;
    if ctx.config.log_debug() && std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(LevelFilter::Debug);
    }

    let zm = if needs_platform(cli, &ctx) {
        connect_platform(&ctx)
    } else {
        None
    };
    if let Some(client) = &zm {
        if ctx.config.is_yes("import_zm_zones") && cli.monitorid.is_some() {
            ctx = config_resolver(cli).platform(client).resolve()?;
        }
    }

    let wait = ctx.config.wait_secs();
    if wait > 0 {
        log::debug!("Waiting {} seconds before detection...", wait);
        std::thread::sleep(Duration::from_secs(wait));
    }

    let target = match (&cli.file, &cli.eventid) {
        (Some(file), _) => Target::file(file),
        (None, Some(eid)) => Target::event(eid.trim()),
        (None, None) => return Err(HookError::config("either a file or an event id is required")),
    };

    // Local inference backends are provided by the host integration
    let dispatcher = Dispatcher::from_context(&ctx, BackendRegistry::new())?;
    let mut result = match dispatcher.run(&target) {
        Ok(outcome) => outcome.result,
        Err(e) => {
            log::error!("Detection failed: {}", e);
            DetectionResult::empty("snapshot")
        }
    };

    if let Some(fake) = &cli.fakeit {
        let labels: Vec<String> = fake
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        log::debug!("Overriding detection with fake labels: {:?}", labels);
        result.fake(&labels);
    }

    if result.is_empty() {
        log::debug!("No detection data");
        return Ok(());
    }

    let output = format_detection(&result, &ctx.config)?;
    let prediction = output.split(SPLIT).next().unwrap_or_default();
    log::info!("Prediction string:{}", prediction);
    println!("{}", output);

    post_detection(cli, &ctx, &result, prediction, zm.as_ref().map(|c| c as &dyn PlatformClient));
    Ok(())
}

/// Side effects after the result was printed; failures are only logged
fn post_detection(
    cli: &Cli,
    ctx: &RunContext,
    result: &DetectionResult,
    prediction: &str,
    client: Option<&dyn PlatformClient>,
) {
    let config = &ctx.config;

    if config.is_yes("write_debug_image") {
        log::debug!(
            "Debug image drawing is not built in, skipping (output path: {:?})",
            cli.output_path
        );
    }

    if config.is_yes("write_image_to_zm") {
        match event_dir(cli, ctx, client) {
            Some(dir) => {
                if let Err(e) = platform::write_objects_json(&dir, result) {
                    log::error!("Error writing objects.json: {}", e);
                }
            }
            None => log::debug!("No event path available, skipping write_image_to_zm"),
        }
    }

    let (Some(eid), Some(client)) = (cli.eventid.as_deref(), client) else {
        return;
    };

    if cli.notes {
        if let Err(e) = platform::update_notes(client, eid, prediction) {
            log::error!("Error updating notes: {}", e);
        }
    }

    if config.is_yes("tag_detected_objects") {
        let labels: Vec<String> = result.labels().into_iter().map(String::from).collect();
        log::debug!("Tagging event {} with labels: {:?}", eid, labels);
        if let Err(e) = client.tag_event(eid, &labels) {
            log::error!("Error tagging event: {}", e);
        }
    }

    if config.is_yes("create_animation") {
        log::debug!(
            "Animation ({}) is not built in, skipping",
            config.get_str("animation_types").unwrap_or_default()
        );
    }
}

fn event_dir(cli: &Cli, ctx: &RunContext, client: Option<&dyn PlatformClient>) -> Option<PathBuf> {
    if let Some(path) = &cli.eventpath {
        return Some(path.clone());
    }
    let (eid, client) = (cli.eventid.as_deref()?, client?);
    let retries = ctx.config.get_int("event_path_retries").unwrap_or(3).max(1) as u32;
    let delay = Duration::from_secs(ctx.config.get_int("event_path_retry_delay").unwrap_or(2).max(0) as u64);
    match platform::resolve_event_path(client, eid, retries, delay) {
        Ok(path) => Some(path),
        Err(e) => {
            log::error!("Could not resolve event path: {}", e);
            None
        }
    }
}
