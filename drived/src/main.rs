use anyhow::Context;
use drived::daemon::{DaemonConfig, DaemonRuntime};
use drived::logging::init_logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    verbose: bool,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        mode: CliMode::Run,
        verbose: false,
    };
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => cli.mode = CliMode::Once,
            "--verbose" | "-v" => cli.verbose = true,
            "--help" | "-h" => cli.mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    if cli.mode == CliMode::Help {
        println!("Usage: drived [--once] [--verbose]");
        println!("  --once      Load the root directory, print it and exit");
        println!("  --verbose   Log loader activity");
        return Ok(());
    }
    init_logging(cli.verbose).context("failed to initialize logging")?;

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match cli.mode {
        CliMode::Once => daemon.run_once().await,
        _ => daemon.run().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("drived")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_defaults_to_run() {
        let cli = parse_cli(args(&[])).unwrap();
        assert_eq!(cli.mode, CliMode::Run);
        assert!(!cli.verbose);
    }

    #[test]
    fn parse_cli_supports_once_and_verbose() {
        let cli = parse_cli(args(&["--once", "--verbose"])).unwrap();
        assert_eq!(cli.mode, CliMode::Once);
        assert!(cli.verbose);
    }

    #[test]
    fn parse_cli_supports_help() {
        let cli = parse_cli(args(&["-h"])).unwrap();
        assert_eq!(cli.mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_rejects_unknown_arguments() {
        assert!(parse_cli(args(&["--logout"])).is_err());
    }
}
