use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mwt_core::{
    load_config, resolve_metadata, ApplicationClientMetadata, BuildOptions, DecisionService,
    DecisionServiceConfiguration, DecisionServiceClient, TracingDiagnostics,
};
use serde_json::Value;
use std::{fs::File, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod remote;

#[derive(Parser, Debug)]
#[command(name = "mwt", version, about = "Multi-world testing decision service CLI")]
struct Cli {
    /// More log output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rank actions for one context
    Decide {
        #[command(flatten)]
        client: ClientArgs,
        /// Context as a JSON object
        #[arg(long)]
        context: String,
        #[arg(long)]
        event_id: String,
    },
    /// Report the reward observed for an earlier decision (no model needed)
    Reward {
        #[command(flatten)]
        source: MetadataArgs,
        #[arg(long)]
        event_id: String,
        #[arg(long, allow_negative_numbers = true)]
        reward: f32,
    },
    /// Application metadata
    Metadata {
        #[command(subcommand)]
        cmd: MetadataCmd,
    },
    /// Administrative settings on a running admin server
    Settings {
        #[command(flatten)]
        admin: AdminArgs,
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Download recorded decisions from a running admin server
    Export {
        #[command(flatten)]
        admin: AdminArgs,
        /// yyyyMMddHHmm, UTC
        #[arg(long)]
        start: String,
        /// yyyyMMddHHmm, UTC, exclusive
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "raw")]
        format: String,
        #[arg(long)]
        out: String,
    },
}

#[derive(Subcommand, Debug)]
enum MetadataCmd {
    /// Resolve and print the client record (connection strings redacted)
    Show {
        #[arg(long)]
        config: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    /// Overwrite the given fields of the client record
    Update {
        #[arg(long)]
        train_arguments: Option<String>,
        #[arg(long)]
        byom_train_arguments: Option<String>,
        #[arg(long)]
        initial_exploration_epsilon: Option<f32>,
        #[arg(long)]
        exploration_enabled: Option<bool>,
    },
    /// Print the server's non-secret settings
    Show,
}

#[derive(Args, Debug)]
struct MetadataArgs {
    /// Client configuration (YAML)
    #[arg(long)]
    config: String,
    /// Metadata JSON reused when the configuration enables offline mode
    #[arg(long)]
    cached: Option<String>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[command(flatten)]
    source: MetadataArgs,
    /// Policy model file
    #[arg(long)]
    model: String,
    #[arg(long, value_enum, default_value_t = ModelFormat::Binary)]
    model_format: ModelFormat,
}

#[derive(Args, Debug)]
struct AdminArgs {
    #[arg(long, env = "MWT_ADMIN_URL", default_value = "http://127.0.0.1:8780/")]
    url: String,
    #[arg(long, env = "MWT_ADMIN_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModelFormat {
    Binary,
    Json,
}

fn expand(path: &str) -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::full(path)?.into_owned()))
}

fn read_config(path: &str) -> anyhow::Result<DecisionServiceConfiguration> {
    Ok(load_config(expand(path)?)?)
}

fn redacted(mut meta: ApplicationClientMetadata) -> ApplicationClientMetadata {
    for field in [
        &mut meta.event_hub_interaction_connection_string,
        &mut meta.event_hub_observation_connection_string,
    ] {
        if !field.is_empty() {
            *field = "<redacted>".into();
        }
    }
    meta
}

/// A client of either model format; contexts are passed through as JSON.
enum CliClient {
    Binary(DecisionServiceClient<Value>),
    Json(DecisionServiceClient<String>),
}

fn build_options(args: &MetadataArgs) -> anyhow::Result<BuildOptions> {
    Ok(match &args.cached {
        Some(path) => {
            let bytes = std::fs::read(expand(path)?)?;
            BuildOptions::cached(ApplicationClientMetadata::from_slice(&bytes)?)
        }
        None => BuildOptions::default(),
    })
}

async fn build_client(args: &ClientArgs) -> anyhow::Result<CliClient> {
    let config = read_config(&args.source.config)?;
    let service = DecisionService::from_config(&config)?;
    let model_path = expand(&args.model)?;
    let model = File::open(&model_path)
        .with_context(|| format!("failed to open model {}", model_path.display()))?;
    let options = build_options(&args.source)?;

    Ok(match args.model_format {
        ModelFormat::Binary => CliClient::Binary(
            service
                .create::<Value>(&config, Box::new(model), None, options)
                .await?,
        ),
        ModelFormat::Json => {
            CliClient::Json(service.create_json(&config, Box::new(model), options).await?)
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Decide {
            client,
            context,
            event_id,
        } => {
            let decision = match build_client(&client).await? {
                CliClient::Binary(client) => {
                    let context: Value =
                        serde_json::from_str(&context).context("context is not valid JSON")?;
                    client.decide(&event_id, &context)?
                }
                CliClient::Json(client) => client.decide(&event_id, &context)?,
            };
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Commands::Reward {
            source,
            event_id,
            reward,
        } => {
            let config = read_config(&source.config)?;
            let reporter = DecisionService::from_config(&config)?
                .create_reporter(&config, build_options(&source)?)
                .await?;
            reporter.report_reward(&event_id, reward)?;
            tracing::info!(%event_id, reward, "reward reported");
        }
        Commands::Metadata { cmd } => match cmd {
            MetadataCmd::Show { config } => {
                let config = read_config(&config)?;
                let store = config.store.build()?;
                let meta = resolve_metadata(
                    &DecisionServiceConfiguration {
                        offline_mode: false,
                        ..config
                    },
                    None,
                    store.as_ref(),
                    &TracingDiagnostics::new(),
                    &CancellationToken::new(),
                )
                .await?;
                println!("{}", serde_json::to_string_pretty(&redacted(meta))?);
            }
        },
        Commands::Settings { admin, cmd } => {
            let remote = remote::AdminClient::new(&admin.url, admin.password)?;
            match cmd {
                SettingsCmd::Update {
                    train_arguments,
                    byom_train_arguments,
                    initial_exploration_epsilon,
                    exploration_enabled,
                } => {
                    let mut query = Vec::new();
                    if let Some(v) = train_arguments {
                        query.push(("trainArguments", v));
                    }
                    if let Some(v) = byom_train_arguments {
                        query.push(("byomTrainArguments", v));
                    }
                    if let Some(v) = initial_exploration_epsilon {
                        query.push(("initialExplorationEpsilon", v.to_string()));
                    }
                    if let Some(v) = exploration_enabled {
                        query.push(("isExplorationEnabled", v.to_string()));
                    }
                    if query.is_empty() {
                        anyhow::bail!("nothing to update, pass at least one field");
                    }
                    remote.update_settings(&query).await?;
                    println!("settings updated");
                }
                SettingsCmd::Show => {
                    let settings = remote.app_settings().await?;
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
            }
        }
        Commands::Export {
            admin,
            start,
            end,
            format,
            out,
        } => {
            let remote = remote::AdminClient::new(&admin.url, admin.password)?;
            let out = expand(&out)?;
            let written = remote.export(&start, &end, &format, &out).await?;
            eprintln!("wrote {written} bytes to {}", out.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn redaction_hides_connection_strings_only() {
        let meta = ApplicationClientMetadata {
            application_id: "app".into(),
            event_hub_interaction_connection_string: "Endpoint=sb://i".into(),
            ..Default::default()
        };
        let shown = redacted(meta);
        assert_eq!(shown.application_id, "app");
        assert_eq!(shown.event_hub_interaction_connection_string, "<redacted>");
        assert!(shown.event_hub_observation_connection_string.is_empty());
    }

    #[test]
    fn reward_does_not_take_a_model() {
        let cli = Cli::try_parse_from([
            "mwt", "reward", "--config", "app.yaml", "--event-id", "evt-1", "--reward", "-1.5",
        ])
        .unwrap();
        match cli.command {
            Commands::Reward {
                source, reward, ..
            } => {
                assert_eq!(source.config, "app.yaml");
                assert!(source.cached.is_none());
                assert_eq!(reward, -1.5);
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "mwt", "reward", "--config", "a.yaml", "--model", "m.bin", "--event-id", "e", "--reward",
            "1",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn reward_with_cached_metadata_writes_an_observation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let events = temp_dir.path().join("events");
        let config_path = temp_dir.path().join("app.yaml");
        std::fs::write(
            &config_path,
            format!(
                "offline_mode: true\nevents_dir: {}\nstore:\n  kind: sqlite\n  path: {}\n",
                events.display(),
                temp_dir.path().join("meta.db").display()
            ),
        )
        .unwrap();
        let cached_path = temp_dir.path().join("meta.json");
        let meta = ApplicationClientMetadata {
            application_id: "app".into(),
            ..Default::default()
        };
        std::fs::write(&cached_path, serde_json::to_vec(&meta).unwrap()).unwrap();

        let source = MetadataArgs {
            config: config_path.display().to_string(),
            cached: Some(cached_path.display().to_string()),
        };
        let config = read_config(&source.config).unwrap();
        let reporter = DecisionService::from_config(&config)
            .unwrap()
            .create_reporter(&config, build_options(&source).unwrap())
            .await
            .unwrap();
        reporter.report_reward("evt-1", 2.0).unwrap();

        let written: Vec<_> = std::fs::read_dir(events.join("observation"))
            .unwrap()
            .collect();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn settings_update_parses_flags() {
        let cli = Cli::try_parse_from([
            "mwt",
            "settings",
            "--password",
            "pw",
            "update",
            "--exploration-enabled",
            "true",
        ])
        .unwrap();
        match cli.command {
            Commands::Settings {
                cmd:
                    SettingsCmd::Update {
                        exploration_enabled,
                        train_arguments,
                        ..
                    },
                ..
            } => {
                assert_eq!(exploration_enabled, Some(true));
                assert!(train_arguments.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
