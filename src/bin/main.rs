//! ocr-bridge CLI - Drive an OCR worker from the command line
//!
//! Usage:
//!   ocr-bridge process <image> [--region x,y,w,h] [--option key=value]...
//!   ocr-bridge status
//!
//! Examples:
//!   ocr-bridge --worker ./ocr-worker process scan.png
//!   ocr-bridge process scan.png --region 10,20,300,80 --option language=eng
//!   ocr-bridge --config ocr-bridge.toml status

use clap::{Parser, Subcommand};
use ocr_bridge::channel::{
    listener, ChannelEvent, CommandChannel, ImagePayload, InitOptions, ProcessOptions,
    ProcessSpawner, Region,
};
use ocr_bridge::config::{Settings, SettingsError};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ocr-bridge")]
#[command(about = "ocr-bridge - Drive an isolated OCR worker over a command channel")]
#[command(version)]
struct Cli {
    /// Config file (defaults to OCR_BRIDGE_CONFIG, ./ocr-bridge.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker executable (overrides worker.path)
    #[arg(short, long, global = true)]
    worker: Option<PathBuf>,

    /// Preferred inference backend passed to INIT
    #[arg(short, long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize text in an image
    Process {
        /// Path to the image file
        image: PathBuf,

        /// Only process this region, as x,y,width,height
        #[arg(short, long, value_parser = parse_region)]
        region: Option<Region>,

        /// Worker option as key=value (value parsed as JSON when possible)
        #[arg(short, long = "option", value_parser = parse_option)]
        options: Vec<(String, Value)>,
    },

    /// Initialize the worker and print its status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Config error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    ocr_bridge::logging::init(&settings.logging);

    let channel = match build_channel(&settings, cli.worker) {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Config error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut init = InitOptions::default();
    if let Some(backend) = cli.backend {
        init = init.with_backend(backend);
    }

    let code = match cli.command {
        Commands::Process {
            image,
            region,
            options,
        } => cmd_process(&channel, init, &image, region, options).await,
        Commands::Status => cmd_status(&channel, init).await,
    };

    channel.dispose().await;
    code
}

fn load_settings(path: Option<&Path>) -> Result<Settings, SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn build_channel(settings: &Settings, worker: Option<PathBuf>) -> Result<CommandChannel, SettingsError> {
    let spawner = match worker {
        Some(path) => ProcessSpawner::new(path).with_args(settings.worker.args.clone()),
        None => settings.spawner()?,
    };
    Ok(CommandChannel::with_config(spawner, settings.channel_config()?))
}

async fn cmd_process(
    channel: &CommandChannel,
    init: InitOptions,
    image: &Path,
    region: Option<Region>,
    options: Vec<(String, Value)>,
) -> ExitCode {
    let data = match fs::read(image) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading image '{}': {}", image.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let payload = ImagePayload::encoded(mime_type(image), data);

    if let Err(e) = channel.initialize(init).await {
        eprintln!("Worker failed to initialize: {}", e);
        return ExitCode::FAILURE;
    }

    let progress = listener(|event| {
        if let ChannelEvent::Progress { update, .. } = event {
            eprintln!("[{:>3.0}%] {}", update.progress * 100.0, update.message);
        }
    });

    if let Err(e) = channel.load_resources(Some(progress.clone())).await {
        eprintln!("Failed to load models: {}", e);
        return ExitCode::FAILURE;
    }

    let options = options
        .into_iter()
        .fold(ProcessOptions::new().with_progress(progress), |opts, (key, value)| {
            opts.with_param(key, value)
        });

    let result = match region {
        Some(region) => channel.process_region(payload, region, options).await,
        None => channel.process(payload, options).await,
    };

    match result {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to format result: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Processing failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_status(channel: &CommandChannel, init: InitOptions) -> ExitCode {
    if let Err(e) = channel.initialize(init).await {
        eprintln!("Worker failed to initialize: {}", e);
        return ExitCode::FAILURE;
    }

    let status = channel.get_status().await;
    println!("Initialized:   {}", status.initialized);
    println!("Backend:       {}", status.backend.as_deref().unwrap_or("-"));
    println!("Fallback:      {}", status.using_fallback);
    println!("Models loaded: {}", status.models_loaded);

    match status.error {
        Some(error) => {
            eprintln!("Status error: {}", error);
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    }
}

fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn parse_region(s: &str) -> Result<Region, String> {
    let parts = s
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid region '{}': {}", s, e))?;

    match parts.as_slice() {
        [x, y, width, height] => Ok(Region::new(*x, *y, *width, *height)),
        _ => Err(format!("region must be x,y,width,height, got '{}'", s)),
    }
}

fn parse_option(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("option must be key=value, got '{}'", s))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
