use anyhow::Context;
use nexen::cli::output::Output;
use nexen::cli::{commands, init, AgentCommands, Cli, Commands, MemoryCommands};
use nexen::types::SessionStatus;
use nexen::utils::toml_config::LoggingConfig;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(logging: &LoggingConfig, verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if json || logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    // init runs before any configuration exists
    if let Commands::Init { path, force, provider } = &cli.command {
        init_tracing(&LoggingConfig::default(), cli.verbose, cli.json_logs);
        let result = init::run(
            init::InitConfig {
                path: path.clone(),
                force: *force,
                provider: provider.clone(),
            },
            &output,
        );
        return Ok(match result {
            init::InitResult::Success => ExitCode::SUCCESS,
            init::InitResult::AlreadyExists => ExitCode::from(2),
            init::InitResult::Error(_) => ExitCode::FAILURE,
        });
    }

    if let Commands::Config { full, validate } = &cli.command {
        init_tracing(&LoggingConfig::default(), cli.verbose, cli.json_logs);
        return Ok(match commands::show_config(&cli.config, *full, *validate, &output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) if *validate => {
                tracing::debug!(error = %e, "configuration rejected");
                ExitCode::FAILURE
            }
            Err(e) => return Err(e).context("failed to show configuration"),
        });
    }

    let config = commands::load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_tracing(&config.logging, cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Research {
            task,
            name,
            owner,
            max_agents,
        } => {
            let session = commands::research(&config, task, name, owner, *max_agents, &output)
                .await
                .context("research run failed")?;
            if session.status != SessionStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Agents(AgentCommands::List { cluster }) => {
            commands::list_agents(nexen::agents::DEFAULT_OWNER, cluster.as_deref(), &output)?;
        }
        Commands::Agents(AgentCommands::Show { agent_type }) => {
            commands::show_agent(nexen::agents::DEFAULT_OWNER, agent_type, &output)?;
        }
        Commands::Agents(AgentCommands::Test { agent_type, task }) => {
            commands::test_agent(&config, nexen::agents::DEFAULT_OWNER, agent_type, task, &output)
                .await
                .with_context(|| format!("agent '{}' test failed", agent_type))?;
        }
        Commands::Memory(MemoryCommands::Ls { session, layer }) => {
            commands::memory_ls(&config, session, layer.as_deref(), &output).await?;
        }
        Commands::Memory(MemoryCommands::Cat { path }) => {
            commands::memory_cat(&config, path).await?;
        }
        Commands::Init { .. } | Commands::Config { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}
