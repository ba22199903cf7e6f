use anyhow::{anyhow, Context};
use std::path::PathBuf;
use steward::config::{DeploymentConfig, StewardConfig};
use steward::telemetry;

enum CliCommand {
    Run { deployment_path: Option<String> },
    Validate { configs: Vec<String> },
    Plan { config: String },
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args(std::env::args().skip(1))? {
        CliCommand::Run { deployment_path } => {
            let mut config = StewardConfig::load().context("failed to load configuration")?;
            if let Some(path) = deployment_path {
                config.deployment_path = Some(path);
            }

            let app = steward::app::StewardApp::initialise(config)
                .context("failed to assemble deployment")?;
            app.run().await.context("deployment runtime error")
        }
        CliCommand::Validate { configs } => run_validate_command(configs),
        CliCommand::Plan { config } => run_plan_command(&config),
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run {
            deployment_path: None,
        });
    };

    match first.as_str() {
        "validate" => {
            let configs: Vec<String> = args.collect();
            if configs.iter().any(|arg| arg == "-h" || arg == "--help") {
                return Ok(CliCommand::Help);
            }
            if configs.is_empty() {
                anyhow::bail!("validate requires at least one deployment descriptor path");
            }
            return Ok(CliCommand::Validate { configs });
        }
        "plan" => {
            let config = args
                .next()
                .ok_or_else(|| anyhow!("plan requires a deployment descriptor path"))?;
            if let Some(extra) = args.next() {
                anyhow::bail!("unexpected argument `{extra}` after plan path");
            }
            return Ok(CliCommand::Plan { config });
        }
        _ => {}
    }

    let mut deployment_path = None;
    let mut pending = Some(first);

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if deployment_path.is_some() {
                    anyhow::bail!("deployment path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                deployment_path = Some(value);
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { deployment_path })
}

fn print_help() {
    println!(
        "\
Usage: steward [OPTIONS]
       steward validate <DEPLOYMENT>...
       steward plan <DEPLOYMENT>

Options:
  -c, --config <PATH>    Deployment descriptor to run (overrides STEWARD__DEPLOYMENT_PATH)
  -h, --help             Print this help message

Commands:
  validate               Check one or more deployment descriptors
  plan                   Print the start and stop order of a deployment
"
    );
}

fn run_validate_command(configs: Vec<String>) -> anyhow::Result<()> {
    let mut had_error = false;

    for config in configs {
        let path = PathBuf::from(&config);
        match DeploymentConfig::from_path(&path) {
            Ok(_) => println!("validated {}", path.display()),
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more deployment descriptors failed validation"))
    } else {
        Ok(())
    }
}

fn run_plan_command(config: &str) -> anyhow::Result<()> {
    let deployment = DeploymentConfig::from_path(config)
        .with_context(|| format!("failed to load deployment descriptor {config}"))?;

    println!("deployment: {}", deployment.name);
    println!("start order:");
    for (position, name) in deployment.start_order().iter().enumerate() {
        println!("  {}. {name}", position + 1);
    }
    println!("stop order:");
    for (position, name) in deployment.stop_order().iter().enumerate() {
        println!("  {}. {name}", position + 1);
    }
    Ok(())
}
