use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use shortfactory::core::config::{Config, DEFAULT_CONFIG_PATH};
use shortfactory::core::io::NativeStorage;
use shortfactory::core::state::ContentStateMachine;
use shortfactory::services::llm::LlmProvider;
use shortfactory::services::narration::NarrationProviderKind;
use shortfactory::services::setup;
use shortfactory::services::tracking::{content_id_for, run_tracked, TrackedRun};
use shortfactory::services::visual::VisualProviderKind;
use shortfactory::services::workflow::WorkflowManager;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shortfactory", version, about = "Turn one subject into a narrated short video")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a story, narrate and illustrate it, and assemble the video
    Create(CreateArgs),
    /// Show the lifecycle history of one content item, or of all of them.
    /// Needs `state.store: json`; the in-memory store forgets everything on exit.
    Status {
        content_id: Option<String>,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Story subject (defaults to `story_subject` from the config)
    #[arg(short, long)]
    subject: Option<String>,

    /// Number of scenes (defaults to `num_scenes` from the config)
    #[arg(short = 'n', long)]
    scenes: Option<usize>,

    #[arg(long, value_enum)]
    llm: Option<LlmProvider>,

    #[arg(long, value_enum)]
    tts: Option<NarrationProviderKind>,

    #[arg(long, value_enum)]
    image: Option<VisualProviderKind>,

    /// Lifecycle id to track this run under (derived from the subject when omitted)
    #[arg(long)]
    content_id: Option<String>,

    /// Concurrent per-scene generator calls
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Never prompt; fail instead when credentials are missing
    #[arg(long)]
    unattended: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::load_from(&cli.config)?;

    match cli.command {
        Command::Create(args) => create(&mut config, &cli.config, args).await,
        Command::Status { content_id } => {
            status(&config, content_id.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn create(config: &mut Config, config_path: &Path, args: CreateArgs) -> Result<ExitCode> {
    if let Some(provider) = args.llm {
        config.llm.provider = provider;
    }
    if let Some(provider) = args.tts {
        config.narration.provider = provider;
    }
    if let Some(provider) = args.image {
        config.visual.provider = provider;
    }
    if let Some(max) = args.max_concurrency {
        config.pipeline.max_concurrency = max;
    }
    config.unattended |= args.unattended;

    if !config.unattended {
        setup::run_setup(config, config_path)?;
    }
    config.ensure_directories()?;

    let subject = args.subject.unwrap_or_else(|| config.story_subject.clone());
    let num_scenes = args.scenes.unwrap_or(config.num_scenes);
    let content_id = args.content_id.unwrap_or_else(|| content_id_for(&subject));

    let storage = Arc::new(NativeStorage::new());
    let manager = WorkflowManager::from_config(config, storage)?;
    let machine = ContentStateMachine::from_config(&config.state)?;

    info!("Tracking run as content '{}'", content_id);
    let run = run_tracked(&machine, &content_id, || {
        manager.create_video(&subject, num_scenes)
    })
    .await?;

    match run {
        TrackedRun::Skipped(state) => {
            println!("Content '{}' is already {}; nothing to do.", content_id, state);
            Ok(ExitCode::SUCCESS)
        }
        TrackedRun::Finished { result, outcome } => {
            if result.success {
                println!(
                    "Video ready: {}",
                    result.video_path().unwrap_or_default()
                );
                return Ok(ExitCode::SUCCESS);
            }
            error!("Video creation failed: {}", result.error);
            error!("Steps completed: [{}]", result.steps_summary());
            if outcome.is_auto_terminated() {
                warn!(
                    "Content '{}' exhausted its retry budget ({}) and was marked {}",
                    content_id,
                    machine.max_retries(),
                    outcome.state()
                );
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn status(config: &Config, content_id: Option<&str>) -> Result<()> {
    if !config.state.store.is_persistent() {
        warn!(
            "The state store is in-memory, so no history survives between runs. \
             Set `state.store: json` in the config to track content across invocations."
        );
    }
    let machine = ContentStateMachine::from_config(&config.state)?;
    let ids = match content_id {
        Some(id) => vec![id.to_string()],
        None => machine.content_ids()?,
    };
    if ids.is_empty() {
        println!("No content tracked in {:?} store.", config.state.store);
        return Ok(());
    }

    for id in ids {
        let current = machine
            .current_state(&id)?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("{}: {}", id, current);
        for record in machine.state_history(&id)? {
            match &record.error_message {
                Some(msg) => println!(
                    "  {}  {:<11}  {}",
                    record.timestamp.to_rfc3339(),
                    record.state.as_str(),
                    msg
                ),
                None => println!("  {}  {}", record.timestamp.to_rfc3339(), record.state),
            }
        }
    }
    Ok(())
}
