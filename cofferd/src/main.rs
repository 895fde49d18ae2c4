use std::path::PathBuf;

use cofferd::daemon::{DaemonConfig, DaemonRuntime};
use cofferd::restore::{RestoreOptions, RestoreOutcome};
use coffer_core::ObjectId;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Restore {
        directory: ObjectId,
        destination: PathBuf,
        options: RestoreOptions,
    },
    Help,
}

fn parse_object_id(value: &str) -> anyhow::Result<ObjectId> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed
        .map(ObjectId)
        .map_err(|_| anyhow::anyhow!("not an object id: {value}"))
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mut mode = CliMode::Run;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            "--restore" => {
                let (Some(directory), Some(destination)) = (args.next(), args.next()) else {
                    anyhow::bail!("--restore needs a directory id and a destination");
                };
                mode = CliMode::Restore {
                    directory: parse_object_id(&directory)?,
                    destination: PathBuf::from(destination),
                    options: RestoreOptions {
                        allow_resume: true,
                        ..RestoreOptions::default()
                    },
                };
            }
            flag @ ("--deleted" | "--undelete" | "--no-resume") => {
                let CliMode::Restore { options, .. } = &mut mode else {
                    anyhow::bail!("{flag} is only valid after --restore");
                };
                match flag {
                    "--deleted" => options.restore_deleted = true,
                    "--undelete" => options.undelete_after = true,
                    _ => options.allow_resume = false,
                }
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: cofferd [--once | --restore <dir-id> <dest> [--deleted] [--undelete] [--no-resume]]");
        println!("  --once       Run one backup over every location and exit");
        println!("  --restore    Restore a stored directory into <dest>");
        println!("  --deleted    Include deleted entries in the restore");
        println!("  --undelete   Mark the restored directory undeleted on the server");
        println!("  --no-resume  Refuse to continue an interrupted restore");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let mut daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Once => daemon.run_once().await.map(|_| ()),
        CliMode::Restore {
            directory,
            destination,
            options,
        } => match daemon.restore(directory, &destination, options).await? {
            RestoreOutcome::Complete => Ok(()),
            RestoreOutcome::ResumePossible => anyhow::bail!(
                "{} exists with an interrupted restore; run again without --no-resume to continue",
                destination.display()
            ),
            RestoreOutcome::TargetExists => {
                anyhow::bail!("{} already exists; refusing to overwrite", destination.display())
            }
        },
        CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cofferd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once_and_help() {
        assert_eq!(parse_cli_mode(args(&["--once"])).unwrap(), CliMode::Once);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_reads_restore_flags() {
        let mode = parse_cli_mode(args(&["--restore", "0x2a", "/tmp/out", "--deleted", "--no-resume"]))
            .unwrap();
        assert_eq!(
            mode,
            CliMode::Restore {
                directory: ObjectId(42),
                destination: PathBuf::from("/tmp/out"),
                options: RestoreOptions {
                    restore_deleted: true,
                    undelete_after: false,
                    allow_resume: false,
                },
            }
        );
    }

    #[test]
    fn restore_flags_need_restore_mode() {
        assert!(parse_cli_mode(args(&["--undelete"])).is_err());
        assert!(parse_cli_mode(args(&["--restore", "12"])).is_err());
        assert!(parse_cli_mode(args(&["--bogus"])).is_err());
    }
}
