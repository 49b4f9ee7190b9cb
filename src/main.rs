use clap::Parser;
use covid_etl::{cli, logging};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    let guard = match logging::init(&args.command) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("warning: logging disabled: {:#}", err);
            None
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let code = match cli::run(args, cancel).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "command failed");
            eprintln!("Error: {:#}", err);
            1
        }
    };

    // exit skips destructors; flush the file sink first.
    drop(guard);
    std::process::exit(code);
}
