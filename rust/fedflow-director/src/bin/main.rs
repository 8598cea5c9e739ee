use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing::warn;
use tracing_subscriber::FmtSubscriber;

use fedflow_director::{
    rest,
    review::ConsoleReviewer,
    runner::CommandRunner,
    settings::Settings,
    workspace::ArchiveWorkspace,
    Director,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Director")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        director: director_settings,
        aggregator: aggregator_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let workspace = ArchiveWorkspace::create(director_settings.workspace.clone())
        .await
        .unwrap_or_else(|err| {
            eprintln!(
                "failed to create workspace {:?}: {}",
                director_settings.workspace, err
            );
            process::exit(1);
        });

    // the command is validated to be non empty
    let mut command = aggregator_settings.command.into_iter();
    let program = command.next().unwrap_or_default();
    let runner = CommandRunner::new(program, command.collect());

    let mut builder = Director::builder(Arc::new(runner))
        .health_check_period(director_settings.health_check_period())
        .security(api_settings.security_context());
    if director_settings.review_experiment {
        builder = builder.reviewer(Arc::new(ConsoleReviewer));
    }
    let director = builder.build();

    tokio::select! {
        _ = director.start_experiment_execution_loop() => {
            warn!("shutting down: experiment loop terminated");
        }
        _ = director.run_liveness_sweep() => {
            warn!("shutting down: liveness sweep terminated");
        }
        result = rest::serve(api_settings, director.clone(), workspace) => {
            if let Err(err) = result {
                eprintln!("{}", err);
                process::exit(1);
            }
            warn!("shutting down: REST server terminated");
        }
        _ = signal::ctrl_c() => {}
    }
}
