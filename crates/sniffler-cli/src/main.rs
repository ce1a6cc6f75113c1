//! `sniffler`: run the proxy daemon, or inspect and mutate its persisted
//! state while it isn't running.

mod commands;
mod error_helpers;
mod progress;
mod serve;

use clap::{Parser, Subcommand};
use commands::Admin;
use progress::{CliError, ExitCode};
use sniffler_core::model::Protocol;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sniffler", version, about = "Developer-facing intercepting proxy for HTTP and database wire protocols")]
struct Cli {
    /// Override the data directory (defaults to the platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy daemon: bind every auto-starting listener and block
    /// until interrupted.
    Serve {
        /// Start every listener regardless of its per-listener auto_start flag.
        #[arg(long)]
        autostart_all: bool,
    },
    /// Manage listeners.
    Listener {
        #[command(subcommand)]
        action: ListenerAction,
    },
    /// Manage mocks.
    Mock {
        #[command(subcommand)]
        action: MockAction,
    },
    /// Inspect and clear recorded operations.
    Operation {
        #[command(subcommand)]
        action: OperationAction,
    },
    /// Read and update process-wide settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Export or import the full persisted state as a versioned bundle.
    Data {
        #[command(subcommand)]
        action: DataAction,
    },
}

#[derive(Subcommand)]
enum ListenerAction {
    Create {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        upstream_host: String,
        #[arg(long)]
        upstream_port: u16,
        #[arg(long, value_enum)]
        protocol: ProtocolArg,
        #[arg(long)]
        name: Option<String>,
    },
    List,
    Rename {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        name: String,
    },
    Start {
        #[arg(long)]
        port: u16,
    },
    Stop {
        #[arg(long)]
        port: u16,
    },
    Remove {
        #[arg(long)]
        port: u16,
    },
    /// Probe an upstream without creating a listener.
    Test {
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum MockAction {
    Add {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        fingerprint: String,
        /// Response JSON document.
        #[arg(long)]
        response: String,
        #[arg(long)]
        enabled: bool,
    },
    Update {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        fingerprint: String,
        #[arg(long)]
        response: String,
    },
    Toggle {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        fingerprint: String,
    },
    Remove {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        fingerprint: String,
    },
    List {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum OperationAction {
    List {
        #[arg(long)]
        port: Option<u16>,
    },
    Clear {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    Get,
    /// Merge a JSON object of field overrides into the stored settings.
    Update {
        #[arg(long)]
        json: String,
    },
}

#[derive(Subcommand)]
enum DataAction {
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    Import {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProtocolArg {
    Http,
    Postgresql,
    Mysql,
    Sqlserver,
    Mongodb,
    Redis,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Http => Self::Http,
            ProtocolArg::Postgresql => Self::Postgresql,
            ProtocolArg::Mysql => Self::Mysql,
            ProtocolArg::Sqlserver => Self::Sqlserver,
            ProtocolArg::Mongodb => Self::Mongodb,
            ProtocolArg::Redis => Self::Redis,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let data_root = cli.data_dir.unwrap_or_else(sniffler_core::Store::default_root);

    if let Err(err) = dispatch(cli.command, data_root).await {
        err.display_and_exit();
    }
}

async fn dispatch(command: Command, data_root: PathBuf) -> Result<(), CliError> {
    match command {
        Command::Serve { autostart_all } => {
            serve::run(data_root, autostart_all).await?;
            Ok(())
        }
        Command::Listener { action } => dispatch_listener(action, data_root).await,
        Command::Mock { action } => dispatch_mock(action, data_root).await,
        Command::Operation { action } => dispatch_operation(action, data_root).await,
        Command::Settings { action } => dispatch_settings(action, data_root).await,
        Command::Data { action } => dispatch_data(action, data_root).await,
    }
}

async fn dispatch_listener(action: ListenerAction, data_root: PathBuf) -> Result<(), CliError> {
    let admin = Admin::new(data_root);
    match action {
        ListenerAction::Create { port, upstream_host, upstream_port, protocol, name } => {
            let listener = admin.listener_create(port, upstream_host, upstream_port, protocol.into(), name).await?;
            println!("{}", serde_json::to_string_pretty(&listener).expect("listener serializes"));
        }
        ListenerAction::List => {
            let listeners = admin.listener_list().await?;
            println!("{}", serde_json::to_string_pretty(&listeners).expect("listeners serialize"));
        }
        ListenerAction::Rename { port, name } => {
            let listener = admin.listener_rename(port, name).await?;
            println!("{}", serde_json::to_string_pretty(&listener).expect("listener serializes"));
        }
        ListenerAction::Start { port } => {
            admin.listener_mark_start(port).await?;
            println!("listener on port {port} will start on the next 'sniffler serve'");
        }
        ListenerAction::Stop { port } => {
            admin.listener_mark_stop(port).await?;
            println!("listener on port {port} marked stopped");
        }
        ListenerAction::Remove { port } => {
            admin.listener_remove(port).await?;
            println!("listener on port {port} removed");
        }
        ListenerAction::Test { host, port } => {
            let (success, message, error_type) = Admin::listener_test(&host, port).await;
            if success {
                println!("ok: {message}");
            } else {
                return Err(CliError::new(message, ExitCode::NetworkError)
                    .with_suggestion(format!("upstream error type: {error_type:?}")));
            }
        }
    }
    Ok(())
}

async fn dispatch_mock(action: MockAction, data_root: PathBuf) -> Result<(), CliError> {
    let admin = Admin::new(data_root);
    match action {
        MockAction::Add { port, fingerprint, response, enabled } => {
            let response = parse_json_arg(&response)?;
            let mock = admin.mock_add(port, fingerprint, response, enabled).await?;
            println!("{}", serde_json::to_string_pretty(&mock).expect("mock serializes"));
        }
        MockAction::Update { port, fingerprint, response } => {
            let response = parse_json_arg(&response)?;
            let mock = admin.mock_update(port, &fingerprint, response).await?;
            println!("{}", serde_json::to_string_pretty(&mock).expect("mock serializes"));
        }
        MockAction::Toggle { port, fingerprint } => {
            let mock = admin.mock_toggle(port, &fingerprint).await?;
            println!("{}", serde_json::to_string_pretty(&mock).expect("mock serializes"));
        }
        MockAction::Remove { port, fingerprint } => {
            admin.mock_remove(port, &fingerprint).await?;
            println!("mock removed");
        }
        MockAction::List { port } => {
            let mocks = admin.mock_list(port).await?;
            println!("{}", serde_json::to_string_pretty(&mocks).expect("mocks serialize"));
        }
    }
    Ok(())
}

async fn dispatch_operation(action: OperationAction, data_root: PathBuf) -> Result<(), CliError> {
    let admin = Admin::new(data_root);
    match action {
        OperationAction::List { port } => {
            let operations = admin.operation_list(port).await?;
            println!("{}", serde_json::to_string_pretty(&operations).expect("operations serialize"));
        }
        OperationAction::Clear { port } => {
            admin.operation_clear(port).await?;
            println!("operations cleared");
        }
    }
    Ok(())
}

async fn dispatch_settings(action: SettingsAction, data_root: PathBuf) -> Result<(), CliError> {
    let admin = Admin::new(data_root);
    match action {
        SettingsAction::Get => {
            let settings = admin.settings_get().await?;
            println!("{}", serde_json::to_string_pretty(&settings).expect("settings serialize"));
        }
        SettingsAction::Update { json } => {
            let partial = parse_json_arg(&json)?;
            let settings = admin.settings_update(&partial).await?;
            println!("{}", serde_json::to_string_pretty(&settings).expect("settings serialize"));
        }
    }
    Ok(())
}

async fn dispatch_data(action: DataAction, data_root: PathBuf) -> Result<(), CliError> {
    let admin = Admin::new(data_root);
    match action {
        DataAction::Export { out } => {
            let bundle = admin.data_export().await?;
            let text = serde_json::to_string_pretty(&bundle).expect("bundle serializes");
            std::fs::write(&out, text).map_err(|e| CliError::new(format!("failed to write {}: {e}", out.display()), ExitCode::GeneralError))?;
            println!("exported to {}", out.display());
        }
        DataAction::Import { file } => {
            let text = std::fs::read_to_string(&file).map_err(|e| CliError::new(format!("failed to read {}: {e}", file.display()), ExitCode::InvalidArguments))?;
            let bundle = parse_json_arg(&text)?;
            admin.data_import(bundle).await?;
            println!("imported from {}", file.display());
        }
    }
    Ok(())
}

fn parse_json_arg(text: &str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(text).map_err(|e| CliError::new(format!("invalid JSON: {e}"), ExitCode::InvalidArguments))
}
