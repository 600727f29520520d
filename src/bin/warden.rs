use clap::Parser;
use tracing_subscriber::EnvFilter;

use warden::Cli;

fn verbosity_filter(count: u8) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::from_default_env();
    }
    let level = match count {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::new(format!("warden={level}"))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(verbosity_filter(cli.verbose))
        .init();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(target: "warden::session", error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let code = match warden::run(config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(target: "warden::session", error = %e, "session failed");
            1
        }
    };
    std::process::exit(code);
}
