use clap::Parser;
use relay_agentd::{cli::Args, init_logging, run, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let settings = Settings::build(&args)?;
    run(settings, args.once).await
}
