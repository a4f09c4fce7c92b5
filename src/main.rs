mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

use mf_av::{Encoder, FfmpegEncoder, FfprobeProber, MetadataProber, ToolRegistry};
use mf_core::config::Config;
use mf_server::context::AppContext;
use mf_server::transcode::TranscodeRequest;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediaforge=trace,mf_server=trace,mf_av=debug,mf_core=debug,tower_http=debug".to_string()
        } else {
            "mediaforge=info,mf_server=info,mf_av=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt().with_env_filter(&env_filter).init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Transcode { input, name } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(transcode_file(&input, name, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, cli.config.as_deref()))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mediaforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load_or_default(config_path);
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!("Starting mediaforge");
    mf_server::start(config).await?;
    Ok(())
}

async fn transcode_file(input: &Path, name: Option<String>, config_path: Option<&Path>) -> Result<()> {
    if !input.is_file() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::from_registry(&tools)?);
    let prober: Arc<dyn MetadataProber> = Arc::new(FfprobeProber::from_registry(&tools)?);

    let ctx = AppContext::new(config, encoder, prober);
    ctx.ensure_storage().await?;

    let video_name = name.unwrap_or_else(|| {
        input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string())
    });
    let request =
        TranscodeRequest::for_file(input.to_path_buf(), &ctx.config.storage.streams_dir, video_name);
    println!("Transcoding {} as video {}", input.display(), request.video_id);

    let record = ctx.orchestrator.transcode(request).await?;
    println!("\nTranscode complete: {}", record.name);
    for rendition in &record.renditions {
        println!(
            "  {} {}x{} {} bytes - {}",
            rendition.preset,
            rendition.width,
            rendition.height,
            rendition.size_bytes,
            rendition.path.display()
        );
    }

    Ok(())
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {}", file.display());
    }

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let prober = FfprobeProber::from_registry(&tools)?;
    let metadata = prober.probe(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    let secs = metadata.duration_secs as u64;
    println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    println!("Resolution: {}x{}", metadata.width, metadata.height);
    if let Some(ref codec) = metadata.video_codec {
        print!("Video: {codec}");
        if let Some(fps) = metadata.fps {
            print!(" {fps:.3} fps");
        }
        println!();
    }
    if let Some(ref codec) = metadata.audio_codec {
        println!("Audio: {codec}");
    }
    if let Some(bitrate) = metadata.bitrate {
        println!("Bitrate: {} kbit/s", bitrate / 1000);
    }
    if let Some(size) = metadata.size_bytes {
        println!("Size: {size} bytes");
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install ffmpeg to enable transcoding.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        println!("Configuration loaded with {} warning(s):", warnings.len());
        for warning in &warnings {
            println!("  ! {warning}");
        }
    }
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Uploads: {}", config.storage.uploads_dir.display());
    println!("  Streams: {}", config.storage.streams_dir.display());
    println!(
        "  Presets: {}",
        config
            .transcode
            .presets
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Drain timeout: {}s", config.shutdown.drain_timeout_secs);

    Ok(())
}
