use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use aetheris::app::{TerminalApp, ctrl_c_interrupts};
use aetheris::chat::ChatOrchestrator;
use aetheris::settings::SettingsStore;
use aetheris_llm::{ProviderError, create_adapter};
use aetheris_storage::ConversationStore;

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to create model adapter on `{stage}`: {source}"))]
    CreateAdapter {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error}");
            1
        }
    };
    // A pending stdin read would otherwise hold runtime shutdown until the next line.
    std::process::exit(code);
}

async fn run() -> AppResult<()> {
    let settings = Arc::new(SettingsStore::load());
    let current = settings.settings();
    tracing::info!(
        path = ?settings.config_path(),
        provider_id = %current.provider_id,
        model = %current.model,
        "settings loaded"
    );

    let adapter = create_adapter(current.to_provider_config(), current.echo_delay()).context(
        CreateAdapterSnafu {
            stage: "create-adapter",
        },
    )?;

    let orchestrator = ChatOrchestrator::new(
        Arc::new(ConversationStore::new()),
        adapter,
        current.exchange_config(),
    );
    let app = TerminalApp::new(Arc::new(orchestrator)).with_settings(settings);

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    app.run_with_interrupts(input, tokio::io::stdout(), ctrl_c_interrupts())
        .await
        .context(TerminalSnafu { stage: "run-terminal" })
}
