use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use fedflow_envoy::{settings::Settings, CommandTrainer, Envoy};
use fedflow_sdk::{Client, ClientError};

#[derive(Debug, StructOpt)]
#[structopt(name = "Envoy")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    /// Overrides the envoy name of the configuration file
    #[structopt(long)]
    envoy_name: Option<String>,

    /// Overrides the director URL of the configuration file
    #[structopt(long)]
    director_url: Option<Url>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let mut settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    if let Some(name) = opt.envoy_name {
        settings.envoy.name = name;
    }
    if let Some(url) = opt.director_url {
        settings.director.url = url;
    }
    let Settings {
        envoy: envoy_settings,
        director: director_settings,
        trainer: trainer_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let client = client(&director_settings).unwrap_or_else(|err| {
        error!("failed to create the director client: {}", err);
        process::exit(1);
    });

    // the command is validated to be non empty
    let mut command = trainer_settings.command.into_iter();
    let program = command.next().unwrap_or_default();
    let trainer = CommandTrainer::new(program, command.collect())
        .with_credentials(director_settings.credentials());

    let envoy = Envoy::new(envoy_settings.name.clone().into(), client, trainer)
        .with_workspace(envoy_settings.workspace.clone())
        .with_retry_timeout(envoy_settings.retry_timeout());

    tokio::select! {
        result = envoy.start() => {
            if let Err(err) = result {
                error!("{}", err);
                process::exit(1);
            }
            warn!("shutting down: envoy terminated");
        }
        _ = signal::ctrl_c() => {}
    }
}

#[cfg(feature = "tls")]
fn client(settings: &fedflow_envoy::settings::DirectorSettings) -> Result<Client, ClientError> {
    match (
        &settings.root_certificate,
        &settings.certificate,
        &settings.private_key,
    ) {
        (Some(root), Some(certificate), Some(key)) => Client::with_tls(
            settings.url.as_str(),
            Client::certificates_from(&[root.as_path()])?,
            Client::identity_from(certificate, key)?,
        ),
        _ => Client::new(settings.url.as_str()),
    }
}

#[cfg(not(feature = "tls"))]
fn client(settings: &fedflow_envoy::settings::DirectorSettings) -> Result<Client, ClientError> {
    Client::new(settings.url.as_str())
}
