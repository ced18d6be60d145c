use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = studioctl::Cli::parse();
    if let Err(err) = studioctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
