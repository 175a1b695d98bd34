use glove_search::{Config, Pipeline};
use std::{env, process};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // a single argument is expected, the path to the json config
    let args: Vec<String> = env::args().collect();
    let params = match Config::new(&args) {
        Ok(config) => config.get_params(),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    match Pipeline::run(&params) {
        Ok(summary) => info!(
            documents = summary.documents,
            words = summary.vocabulary,
            loss = summary.report.loss_after,
            clusters = summary.clusters,
            converged = summary.converged,
            "done"
        ),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
