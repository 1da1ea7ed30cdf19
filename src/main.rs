use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use v4l2_bridge::config::{parse_descriptor, RelayOptions, StreamConfig};
use v4l2_bridge::video::{StreamManager, V4l2Backend};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// v4l2-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "v4l2-bridge")]
#[command(
    version,
    about = "Zero-copy DMA-BUF relay between V4L2 capture and output devices",
    long_about = None
)]
struct CliArgs {
    /// Number of streams; must be given before the first --stream
    #[arg(short = 'n', long, value_name = "COUNT")]
    streams: usize,

    /// Stream descriptor: CAPTURE:OUTPUT@{i|o}@FPS:BUFFERS:WIDTH,HEIGHT:FOURCC
    #[arg(short = 'S', long = "stream", value_name = "DESCRIPTOR")]
    stream: Vec<String>,

    /// Stop a stream after this many seconds without activity
    #[arg(short = 't', long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,

    /// Parse the streams, print them as JSON and exit without opening devices
    #[arg(long)]
    dry_run: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = CliArgs::command().get_matches();
    let args = CliArgs::from_arg_matches(&matches)?;

    init_logging(args.log_level, args.verbose);

    let configs = stream_configs(&args, &matches)?;

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }

    tracing::info!("Starting v4l2-bridge v{}", env!("CARGO_PKG_VERSION"));

    if args.timeout == 0 {
        bail!("--timeout must be at least one second");
    }
    let options = RelayOptions::default().with_idle_timeout(Duration::from_secs(args.timeout));

    // Installed before any stream starts so an early Ctrl-C still tears down
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let mut manager = StreamManager::new(V4l2Backend, configs, options);
    manager.init().context("stream setup failed")?;
    let shutdown = manager.shutdown_handle();
    manager.start();

    let join = manager.join();
    tokio::pin!(join);
    let result = tokio::select! {
        result = &mut join => result,
        _ = interrupt.recv() => {
            tracing::info!("Interrupt received, stopping streams");
            shutdown.trigger();
            join.await
        }
    };

    match result {
        Ok(reports) => {
            for report in &reports {
                tracing::info!(
                    "Stream {} ended ({:?}): {} frames relayed",
                    report.index,
                    report.reason,
                    report.stats.frames_relayed
                );
            }
            tracing::info!("v4l2-bridge stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Relay failed: {}", e);
            Err(e.into())
        }
    }
}

/// Check stream count and ordering, then parse every descriptor
fn stream_configs(args: &CliArgs, matches: &ArgMatches) -> anyhow::Result<Vec<StreamConfig>> {
    if let (Some(count_at), Some(first_stream)) = (
        matches.index_of("streams"),
        matches.indices_of("stream").and_then(|mut i| i.next()),
    ) {
        if first_stream < count_at {
            bail!("--streams must be given before the first --stream");
        }
    }

    if args.stream.len() != args.streams {
        bail!(
            "expected {} stream descriptor(s), got {}",
            args.streams,
            args.stream.len()
        );
    }

    args.stream
        .iter()
        .enumerate()
        .map(|(i, descriptor)| {
            parse_descriptor(descriptor)
                .with_context(|| format!("invalid stream descriptor #{}: {}", i, descriptor))
        })
        .collect()
}

/// Initialize logging with CLI arguments
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "v4l2_bridge=error",
        LogLevel::Warn => "v4l2_bridge=warn",
        LogLevel::Info => "v4l2_bridge=info",
        LogLevel::Verbose => "v4l2_bridge=debug,v4l2_bridge::video::v4l2_device=info",
        LogLevel::Debug => "v4l2_bridge=debug",
        LogLevel::Trace => "v4l2_bridge=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<Vec<StreamConfig>> {
        let matches = CliArgs::command().try_get_matches_from(argv)?;
        let args = CliArgs::from_arg_matches(&matches)?;
        stream_configs(&args, &matches)
    }

    const STREAM: &str = "/dev/video0:/dev/video1@o@30:4:640,480:YUYV";

    #[test]
    fn test_count_and_descriptors() {
        let configs = parse(&["v4l2-bridge", "-n", "2", "-S", STREAM, "-S", STREAM]).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].buffer_count, 4);
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        assert!(parse(&["v4l2-bridge", "-n", "2", "-S", STREAM]).is_err());
        assert!(parse(&["v4l2-bridge", "-n", "0", "-S", STREAM]).is_err());
    }

    #[test]
    fn test_count_must_come_first() {
        assert!(parse(&["v4l2-bridge", "-S", STREAM, "-n", "1"]).is_err());
    }

    #[test]
    fn test_zero_streams_is_accepted() {
        assert!(parse(&["v4l2-bridge", "-n", "0"]).unwrap().is_empty());
    }

    #[test]
    fn test_bad_descriptor_aborts() {
        let err = parse(&["v4l2-bridge", "-n", "1", "-S", "/dev/video0@o@30:4:640,480:YUYV"])
            .unwrap_err();
        assert!(err.to_string().contains("#0"));
    }
}
