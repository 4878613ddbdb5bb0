use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use eduboard::config::ConfigError;
use eduboard::flow::Step;
use eduboard::http::{ApiRequest, Method};
use eduboard::storage::{FileStore, StorageError};
use eduboard::{ApiError, AuthApi, Client, ClientConfig, FlowError, GuardDecision, Navigator, Route, RouteGuard, StepFlow};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("state file failed: {0}")]
    Storage(#[from] StorageError),
    #[error("{}", .0.user_message())]
    Api(#[from] ApiError),
    #[error("{}", .0.user_message())]
    Flow(#[from] FlowError),
    #[error("not signed in; run `eduboard login` first")]
    NotSignedIn,
    #[error("already signed in; run `eduboard logout` first")]
    AlreadySignedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("input closed before the flow finished")]
    InputClosed,
    #[error("terminal io failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "eduboard", about = "Sign in to the school dashboard backend and call its API")]
struct Cli {
    /// Overrides `EDUBOARD_BACKEND_URL`.
    #[arg(long)]
    backend_url: Option<String>,

    #[arg(long, env = "EDUBOARD_STATE_DIR", default_value = ".eduboard")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login(LoginArgs),
    Logout,
    Whoami,
    /// Create an account: phone, OTP, password.
    Register(FlowArgs),
    /// Reset a forgotten password: phone, OTP, new password.
    ForgotPassword(FlowArgs),
    ChangePassword(ChangePasswordArgs),
    /// Send an authenticated request, e.g. `request get /shifts`.
    Request(RequestArgs),
}

impl Command {
    fn guard(&self) -> Option<RouteGuard> {
        match self {
            Self::Login(_) => Route::Login.guard(),
            Self::Register(_) => Route::Register.guard(),
            Self::ForgotPassword(_) => Route::ForgotPassword.guard(),
            Self::Whoami | Self::ChangePassword(_) | Self::Request(_) => Some(RouteGuard::protected()),
            Self::Logout => None,
        }
    }
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    phone: String,

    #[arg(long, env = "EDUBOARD_PASSWORD")]
    password: Option<String>,

    /// Use the admin sign-in endpoint.
    #[arg(long)]
    admin: bool,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Args, Debug)]
struct ChangePasswordArgs {
    #[arg(long)]
    old: String,

    #[arg(long)]
    new: String,
}

#[derive(Args, Debug)]
struct RequestArgs {
    method: String,

    path: String,

    #[arg(long, help = "JSON request body")]
    data: Option<String>,
}

/// Navigation in a terminal is just telling the user where they would land.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, route: Route) {
        eprintln!("redirect: {route}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.backend_url {
        config.backend_url = ClientConfig::new(url)?.backend_url;
    }

    let state_path = cli.state_dir.join("state.json");
    let store = FileStore::open(&state_path)?;
    tracing::debug!(backend = %config.backend_url, state = %state_path.display(), "starting");
    let client = Client::connect(config, Arc::new(store), Arc::new(TerminalNavigator))?;

    let result = run(&client, cli.command).await;
    client.persist_cookies()?;
    if let Err(e) = &result {
        tracing::debug!(error = %e, "command failed");
    }
    result
}

async fn run(client: &Client, command: Command) -> Result<(), CliError> {
    if let Some(guard) = command.guard() {
        enforce(client, guard)?;
    }

    match command {
        Command::Login(args) => run_login(client, args).await,
        Command::Logout => {
            client.auth().logout().await;
            println!("signed out");
            Ok(())
        }
        Command::Whoami => {
            let user = client.session().user().ok_or(CliError::NotSignedIn)?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::Register(args) => run_flow(client.new_registration(), args.phone).await,
        Command::ForgotPassword(args) => run_flow(client.new_password_reset(), args.phone).await,
        Command::ChangePassword(args) => {
            let message = client.auth().change_password(&args.old, &args.new).await?;
            println!("{message}");
            Ok(())
        }
        Command::Request(args) => run_request(client, args).await,
    }
}

fn enforce(client: &Client, guard: RouteGuard) -> Result<(), CliError> {
    match guard.evaluate(&client.session().snapshot()) {
        GuardDecision::Render | GuardDecision::Loading => Ok(()),
        GuardDecision::Redirect(Route::Home) => Err(CliError::AlreadySignedIn),
        GuardDecision::Redirect(_) => Err(CliError::NotSignedIn),
    }
}

async fn run_login(client: &Client, args: LoginArgs) -> Result<(), CliError> {
    let password = match args.password {
        Some(password) => password,
        None => prompt("Password")?,
    };
    let user = if args.admin {
        client.auth().admin_login(&args.phone, &password).await?
    } else {
        client.auth().login(&args.phone, &password).await?
    };
    print_json(&serde_json::to_value(user)?)
}

async fn run_request(client: &Client, args: RequestArgs) -> Result<(), CliError> {
    let method: Method = args.method.parse()?;
    let mut request = ApiRequest::new(method, args.path);
    if let Some(data) = args.data {
        request = request.with_body(serde_json::from_str(&data)?);
    }
    let envelope = client.http().send(request).await?;
    print_json(&serde_json::to_value(envelope)?)
}

/// Drive a registration or reset flow from stdin until it completes.
///
/// On the code step, `r` asks for a new code and `b` goes back. Rejected
/// steps print the reason and prompt again.
async fn run_flow(mut flow: StepFlow<AuthApi>, mut phone: Option<String>) -> Result<(), CliError> {
    let mut code_sent_at = Instant::now();

    loop {
        let outcome = match flow.step() {
            Step::Phone => {
                let value = match phone.take() {
                    Some(value) => value,
                    None => prompt("Phone number")?,
                };
                flow.submit_phone(&value).await.map(|()| code_sent_at = Instant::now())
            }
            Step::Otp => {
                flow.sync_cooldown(code_sent_at.elapsed());
                if let Some(notice) = flow.notice() {
                    eprintln!("{notice}");
                }
                let input = prompt(&format!("6-digit code (r: {}, b: back)", flow.cooldown().label()))?;
                match input.as_str() {
                    "r" => flow.resend().await.map(|()| code_sent_at = Instant::now()),
                    "b" => flow.back().map(|_| ()),
                    code => flow.submit_otp(code).await,
                }
            }
            Step::Password => {
                let password = prompt("New password (b: back)")?;
                if password == "b" {
                    flow.back().map(|_| code_sent_at = Instant::now())
                } else {
                    let confirm = prompt("Confirm password")?;
                    flow.submit_password(&password, &confirm).await
                }
            }
            Step::Complete => {
                if let Some(notice) = flow.notice() {
                    println!("{notice}");
                }
                let next = flow.finish()?;
                eprintln!("continue at {next}");
                return Ok(());
            }
        };

        if let Err(e) = outcome {
            tracing::debug!(kind = flow.kind().as_str(), step = %flow.step(), error = %e, "flow step rejected");
            eprintln!("{}", e.user_message());
        }
    }
}

fn prompt(label: &str) -> Result<String, CliError> {
    eprint!("{label}: ");
    io::stderr().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(CliError::InputClosed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
