use clap::Parser;
use overseer::cli::{Cli, Command};
use overseer::paths::Paths;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let paths = Paths::new();

    if let Command::Daemon { config_dir } = cli.command {
        init_tracing();
        let paths = match config_dir {
            Some(dir) => paths.with_config_dir(dir),
            None => paths,
        };
        return overseer::daemon::run(paths).await;
    }

    let Some(args) = cli.command.to_args() else {
        return Ok(());
    };
    if overseer::client::run(&paths, args)? {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
