use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use streamcheck::cases::{self, Harness};
use streamcheck::config::HarnessConfig;
use streamcheck::media::session::probe_stream;
use streamcheck::media::{OutputFormat, ProbeSpec, PublishSpec, Publisher, SessionPlan};
use streamcheck::report::CaseStatus;
use streamcheck::task::ErrorSlots;
use streamcheck::{HarnessError, RunContext};

#[derive(Parser)]
#[command(
    name = "streamcheck",
    about = "End-to-end validation harness for live-streaming media servers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $STREAMCHECK_CONFIG, then ./streamcheck.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Management API endpoint
    #[arg(long, global = true, env = "STREAMCHECK_API_ENDPOINT")]
    api_endpoint: Option<String>,

    /// Bearer secret for the management API
    #[arg(long, global = true, env = "STREAMCHECK_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the end-to-end suite against a server
    Run {
        /// Only run these cases (repeatable)
        #[arg(long = "case")]
        cases: Vec<String>,

        /// Skip cases that publish or play streams
        #[arg(long)]
        no_media: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List the registered cases
    List,

    /// Record and inspect one stream URL
    Probe {
        /// Playback URL to probe
        #[arg(long)]
        url: String,

        /// How much of the stream to record, in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Upper bound for the whole probe, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// DVR side file
        #[arg(long, default_value = "streamcheck-probe.flv")]
        dvr: PathBuf,

        /// Print the raw ffprobe JSON
        #[arg(long)]
        json: bool,
    },

    /// Loop the sample file into a destination until interrupted
    Publish {
        /// Destination URL (rtmp:// or srt://)
        #[arg(long)]
        url: String,

        /// Input file (defaults to the configured sample)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Output container
        #[arg(long, value_enum, default_value = "flv")]
        format: Format,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Write a self-signed certificate and key
    Cert {
        /// Output directory
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Certificate common name
        #[arg(long, default_value = streamcheck::cert::DEFAULT_COMMON_NAME)]
        cn: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Flv,
    Mpegts,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Flv => OutputFormat::Flv,
            Format::Mpegts => OutputFormat::MpegTs,
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Cancel `ctx` on Ctrl-C.
fn cancel_on_ctrl_c(ctx: &RunContext) {
    let canceller = ctx.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping");
            canceller.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HarnessConfig::resolve(cli.config.as_deref())?;
    if let Some(endpoint) = cli.api_endpoint {
        config.endpoints.api = endpoint;
    }
    if let Some(secret) = cli.api_secret {
        config.auth.api_secret = secret;
    }
    init_tracing(&config.logging.level, cli.log_json || config.logging.json);

    match cli.command {
        Commands::Run {
            cases: filter,
            no_media,
            json,
        } => {
            if no_media {
                config.suite.no_media_test = true;
            }
            tracing::info!(endpoint = %config.endpoints.api, cases = filter.len(), "Running suite");
            let harness = Harness::new(config)?;
            let report = cases::run_suite(&harness, &filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            if !report.passed() {
                bail!("{} case(s) failed", report.count(CaseStatus::Fail));
            }
        }
        Commands::List => {
            for name in cases::names() {
                println!("{}", name);
            }
        }
        Commands::Probe {
            url,
            duration_ms,
            timeout_ms,
            dvr,
            json,
        } => {
            let media = &config.media;
            let duration = duration_ms.map(Duration::from_millis).unwrap_or(media.probe_duration());
            let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(media.probe_timeout());
            let mut spec = ProbeSpec::new(url.clone(), dvr, duration, timeout);
            spec.retry_interval = media.retry_interval();
            spec.stall_window = media.stall_window();
            spec.inspect_timeout = media.inspect_timeout();

            tracing::info!(%url, ?duration, ?timeout, "Probing stream");
            let ctx = RunContext::background().with_timeout(timeout + media.inspect_timeout());
            cancel_on_ctrl_c(&ctx);
            let (snapshot, outcome) = probe_stream(&ctx, &config.tools(), SessionPlan::new(None, spec)).await;

            if json {
                println!("{}", snapshot.raw);
            } else {
                let result = &snapshot.result;
                println!("\nProbe of {}", url);
                println!("{:<8} | {:<10} | {:<8} | Details", "Index", "Codec", "Type");
                println!("{:-<8}-|-{:-<10}-|-{:-<8}-|-{:-<30}", "", "", "", "");
                for s in &result.streams {
                    let details = match (s.width, s.height, s.sample_rate.as_deref(), s.channels) {
                        (Some(w), Some(h), _, _) => format!("{}x{} {}", w, h, s.profile.as_deref().unwrap_or("")),
                        (_, _, Some(rate), ch) => format!("{} Hz, {} ch", rate, ch.unwrap_or(0)),
                        _ => String::new(),
                    };
                    println!("{:<8} | {:<10} | {:<8} | {}", s.index, s.codec_name, s.codec_type, details);
                }
                println!(
                    "\nformat={} score={} duration={:?}",
                    result.format.format_name,
                    result.score(),
                    result.duration()
                );
            }

            let mut slots = ErrorSlots::new();
            slots.extend(outcome);
            slots.finish(&ctx)?;
        }
        Commands::Publish {
            url,
            input,
            format,
            seconds,
        } => {
            let input = input.unwrap_or_else(|| config.media.input_file.clone());
            let spec = PublishSpec::new(input, url.clone(), format.into());
            let publisher = Publisher::new(&config.media.ffmpeg, spec, config.media.publish_grace());

            let scope = match seconds {
                Some(s) => RunContext::background().with_timeout(Duration::from_secs(s)),
                None => RunContext::background().with_cancel(),
            };
            cancel_on_ctrl_c(&scope);
            tracing::info!(%url, ?seconds, "Publishing");

            match publisher.run(&scope, scope.canceller()).await {
                Ok(()) => {}
                Err(HarnessError::Cancelled) | Err(HarnessError::DeadlineExceeded) => {
                    tracing::info!("publisher stopped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Cert { out_dir, cn } => {
            let cert = streamcheck::cert::generate_self_signed(&cn)?;
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            let key_path = out_dir.join("key.pem");
            let crt_path = out_dir.join("cert.pem");
            std::fs::write(&key_path, &cert.key_pem)
                .with_context(|| format!("failed to write {}", key_path.display()))?;
            std::fs::write(&crt_path, &cert.cert_pem)
                .with_context(|| format!("failed to write {}", crt_path.display()))?;
            println!("Wrote {} and {}", key_path.display(), crt_path.display());
        }
    }

    Ok(())
}
