use std::{path::PathBuf, process};

use serde::Serialize;
use structopt::StructOpt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fedflow_sdk::{Client, ClientError};

#[derive(Debug, StructOpt)]
#[structopt(name = "fedflow-submit", about = "Submits and manages fedflow experiments")]
struct Opt {
    /// URL of the director
    #[structopt(long, default_value = "http://127.0.0.1:50051")]
    director_url: String,

    /// Identity sent to a director without TLS client authentication
    #[structopt(long)]
    client_id: Option<String>,

    #[cfg(feature = "tls")]
    /// Trusted root certificate of the director (PEM or DER)
    #[structopt(long, parse(from_os_str), requires_all = &["certificate", "private_key"])]
    root_certificate: Option<PathBuf>,

    #[cfg(feature = "tls")]
    /// PEM encoded client certificate
    #[structopt(long, parse(from_os_str))]
    certificate: Option<PathBuf>,

    #[cfg(feature = "tls")]
    /// PEM encoded private key of the client certificate
    #[structopt(long, parse(from_os_str))]
    private_key: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Uploads an experiment archive
    Submit {
        /// Name of the experiment
        #[structopt(long)]
        name: String,
        /// Envoy taking part in the experiment, repeatable
        #[structopt(long = "collaborator", required = true)]
        collaborators: Vec<String>,
        /// The experiment archive
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
    },
    /// Lists the experiments submitted by this client
    List,
    /// Shows the status of an experiment
    Status { name: String },
    /// Removes an experiment which is not running
    Remove { name: String },
    /// Lists the connected envoys
    Envoys,
    /// Waits for the next experiment to end
    FlowStatus,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(opt).await {
        eprintln!("{}", err);
        process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<(), ClientError> {
    let client = client(&opt)?;
    match opt.command {
        Command::Submit {
            name,
            collaborators,
            archive,
        } => {
            let collaborators = collaborators.into_iter().map(Into::into).collect();
            let accepted = client
                .set_new_experiment(name.into(), collaborators, archive)
                .await?;
            if !accepted {
                eprintln!("the director refused the experiment");
                process::exit(2);
            }
            println!("experiment queued");
        }
        Command::List => print(&client.list_experiments().await?),
        Command::Status { name } => match client.get_experiment_status(&name.into()).await? {
            Some(info) => print(&info),
            None => {
                eprintln!("no such experiment");
                process::exit(2);
            }
        },
        Command::Remove { name } => {
            client.remove_experiment(&name.into()).await?;
            println!("experiment removed");
        }
        Command::Envoys => print(&client.get_envoys().await?),
        Command::FlowStatus => print(&client.get_flow_status().await?),
    }
    Ok(())
}

fn client(opt: &Opt) -> Result<Client, ClientError> {
    #[cfg(feature = "tls")]
    let client = match (&opt.root_certificate, &opt.certificate, &opt.private_key) {
        (Some(root), Some(certificate), Some(key)) => Client::with_tls(
            &opt.director_url,
            Client::certificates_from(&[root.as_path()])?,
            Client::identity_from(certificate, key)?,
        )?,
        _ => Client::new(&opt.director_url)?,
    };
    #[cfg(not(feature = "tls"))]
    let client = Client::new(&opt.director_url)?;

    Ok(match &opt.client_id {
        Some(client_id) => client.with_client_id(client_id.as_str()),
        None => client,
    })
}

fn print<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("failed to print the response: {}", err),
    }
}
