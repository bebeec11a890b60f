use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod account;
mod bindings;
mod controller;
mod domain;
mod engine;
mod filter;
mod inputter;
mod loader;
mod model;
mod records;
mod session;
mod storage;
mod ui;

use controller::Controller;
use domain::{AppConfig, FdError};
use loader::FsAssetSource;
use model::{Model, Services, Status};
use records::CsvRecordStore;
use session::{Identity, JsonProfileStore, LocalIdentityProvider};
use storage::FsObjectStore;
use ui::TableUI;

/// Terminal drive for the admission folders of a clinic.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding sessions, profiles and the record collections
    #[arg(long, default_value = "data")]
    data_dir: String,

    /// Directory holding the module assets
    #[arg(long, default_value = "assets")]
    assets_dir: String,

    /// Root of the object storage for uploaded files
    #[arg(long, default_value = "storage")]
    storage_dir: String,

    /// Local account whose session is used
    #[arg(long, short, default_value = "demo")]
    user: String,

    /// Write a fresh session for the user before starting
    #[arg(long)]
    sign_in: bool,

    /// E-mail recorded with a fresh session
    #[arg(long, default_value = "")]
    email: String,

    /// Set the local password of the user together with --sign-in
    #[arg(long)]
    password: Option<String>,

    /// Records per page
    #[arg(long, default_value_t = 10)]
    page_size: usize,

    #[arg(long, default_value = "folderdrive.log")]
    log_file: String,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map(|p| p.into_owned()).unwrap_or_else(|_| path.to_string()))
}

fn init_logging(args: &Args) -> Result<(), FdError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(expand(&args.log_file))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Err(e) => {
            ratatui::restore();
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
        Ok(exit_message) => {
            if let Some(message) = exit_message {
                println!("{message}");
            }
            ExitCode::SUCCESS
        }
    }
}

fn run(args: Args) -> Result<Option<String>, FdError> {
    init_logging(&args)?;

    let cfg = AppConfig::default()
        .with_page_size(args.page_size.max(1))
        .with_data_dir(expand(&args.data_dir))
        .with_assets_dir(expand(&args.assets_dir))
        .with_storage_dir(expand(&args.storage_dir));
    info!("Starting folderdrive for {} in {:?}", args.user, cfg.data_dir);

    let identity = LocalIdentityProvider::new(&cfg.data_dir, &args.user);
    if args.sign_in {
        identity.sign_in(&Identity {
            uid: args.user.clone(),
            email: args.email.clone(),
            issued_at: Utc::now(),
        })?;
        if let Some(password) = &args.password {
            identity.set_password(password)?;
        }
    }

    let services = Services {
        identity: Box::new(identity),
        profiles: Box::new(JsonProfileStore::new(&cfg.data_dir)),
        records: Arc::new(CsvRecordStore::new(&cfg.data_dir)),
        objects: Arc::new(FsObjectStore::new(&cfg.storage_dir)),
        assets: Arc::new(FsAssetSource::new(&cfg.assets_dir)),
    };

    let mut model = Model::init(&cfg, services, Instant::now(), Utc::now());
    let mut ui = TableUI::new(&cfg);
    let controller = Controller::new(&cfg);

    let mut terminal = ratatui::init();
    while model.status != Status::QUITTING {
        // Render the current view
        terminal.draw(|f| ui.draw(&model, f))?;

        // Handle events and map to a Message
        let message = controller.handle_event(&model)?;
        model.update(Some(message))?;
    }
    ratatui::restore();

    Ok(model.exit_message().map(str::to_string))
}
