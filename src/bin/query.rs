use glove_search::{Config, RankMode, Similarity};
use std::{env, process};
use tracing::error;
use tracing_subscriber::EnvFilter;

// queries the artifacts of a finished pipeline run, independently of main.
// arguments to this executable should be:
// path to the json config used for the run
// a mode selector: "corpus" ranks every document, "cluster" only the query's cluster,
// "words" lists the nearest vocabulary words
// the query itself, the remaining arguments joined by spaces
// example: ... config.json cluster stock market
// for "cluster", GLOVE_RERANK=<text> puts documents containing <text> first

fn main() {

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        error!("usage: query <config.json> <corpus|cluster|words> <query...>");
        process::exit(2);
    }
    let params = match Config::new(&args[..2]) {
        Ok(config) => config.get_params(),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };
    let query = args[3..].join(" ");

    let index = match Similarity::open(&params) {
        Ok(index) => index,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let mode = match args[2].as_str() {
        "corpus" => RankMode::WholeCorpus,
        "cluster" => RankMode::ClusterRouted { rerank: env::var("GLOVE_RERANK").ok() },
        "words" => {
            let vec = index.encode(&query);
            for (i, (word, score)) in index.most_similar(vec.view(), params.top_n).iter().enumerate() {
                println!("{} : {} = {:.4}", i, word, score);
            }
            return;
        }
        other => {
            error!("unrecognized mode {}", other);
            process::exit(2);
        }
    };

    let hits = index.search(&query, &mode, params.top_n);
    if hits.is_empty() {
        println!("no documents found for '{}'", query);
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{} : {} = {:.4}", i, hit.url, hit.score);
        if let Some(snippet) = &hit.snippet {
            println!("    ...{}...", snippet);
        }
    }
}
