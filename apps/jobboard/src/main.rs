use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use session_core::{
    hosted::{HostedAuthClient, HostedAuthConfig},
    persistence::FileSessionStore,
    IdentityProvider, Navigator, Notifier, ProfileStore, RoleResolver, RoleStatus,
    SessionController, SessionPhase, SessionState,
};
use shared::{
    domain::{ProfilePatch, Role},
    error::AuthError,
};
use tokio_stream::wrappers::WatchStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Settings};

#[derive(Parser, Debug)]
#[command(name = "jobboard", about = "Sign in to the job board and inspect the session")]
struct Cli {
    /// Config file; defaults to ./jobboard.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: Role,
    },
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    SignOut,
    Status,
    UpdateProfile {
        #[arg(long)]
        name: String,
    },
    /// Print every session change until interrupted.
    Watch,
}

struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect(&self, path: &str) {
        info!(path, "redirect requested");
        println!("-> {path}");
    }
}

fn describe_state(state: &SessionState) -> String {
    let email = state
        .identity
        .as_ref()
        .map(|identity| identity.email.as_str())
        .unwrap_or_default();
    match state.phase() {
        SessionPhase::Bootstrapping => "resolving session".to_string(),
        SessionPhase::Anonymous => "signed out".to_string(),
        SessionPhase::Authenticated(RoleStatus::Pending) => {
            format!("signed in as {email} (role pending)")
        }
        SessionPhase::Authenticated(RoleStatus::Resolved(role)) => {
            format!("signed in as {email} ({role})")
        }
        SessionPhase::Authenticated(RoleStatus::Failed) => {
            format!("signed in as {email} (role unknown)")
        }
    }
}

fn build_controller(settings: &Settings) -> Result<Arc<SessionController>> {
    let store = Arc::new(FileSessionStore::new(&settings.session_file));
    let client = Arc::new(
        HostedAuthClient::new(
            HostedAuthConfig {
                base_url: settings.auth_url.clone(),
                api_key: settings.api_key.clone(),
                profiles_table: settings.profiles_table.clone(),
            },
            store,
        )
        .context("failed to build auth backend client")?,
    );
    Ok(SessionController::new_with_dependencies(
        Arc::clone(&client) as Arc<dyn IdentityProvider>,
        Arc::clone(&client) as Arc<dyn RoleResolver>,
        client as Arc<dyn ProfileStore>,
        Arc::new(TerminalNotifier),
        Arc::new(TerminalNavigator),
        settings.sign_out_path.clone(),
    ))
}

async fn watch_sessions(controller: &SessionController) -> Result<()> {
    let mut updates = WatchStream::new(controller.subscribe());
    loop {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("failed to listen for ctrl-c")?;
                return Ok(());
            }
            next = updates.next() => match next {
                Some(state) => println!("{}", describe_state(&state)),
                None => return Ok(()),
            },
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    info!(auth_url = %settings.auth_url, session_file = %settings.session_file.display(), "loaded settings");

    let controller = build_controller(&settings)?;
    controller.start().await;
    controller.wait_until_settled().await;

    match cli.command {
        Command::SignUp {
            email,
            password,
            name,
            role,
        } => {
            let identity = controller.sign_up(&email, &password, &name, role).await?;
            println!("registered {} ({})", identity.email, identity.id);
        }
        Command::SignIn { email, password } => {
            controller.sign_in(&email, &password).await?;
        }
        Command::SignOut => controller.sign_out().await?,
        Command::Status => {}
        Command::UpdateProfile { name } => {
            controller
                .update_profile(ProfilePatch {
                    display_name: Some(name),
                })
                .await?;
            println!("profile updated");
        }
        Command::Watch => {
            watch_sessions(&controller).await?;
            controller.stop();
            return Ok(());
        }
    }

    let state = controller.wait_until_settled().await;
    println!("{}", describe_state(&state));
    controller.stop();
    Ok(())
}

/// Auth failures were already shown through the notifier; everything else
/// still needs printing.
fn failure_report(err: &anyhow::Error) -> Option<String> {
    match err.downcast_ref::<AuthError>() {
        Some(_) => None,
        None => Some(format!("error: {err:#}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(report) = failure_report(&err) {
                eprintln!("{report}");
            }
            ExitCode::FAILURE
        }
    }
}
