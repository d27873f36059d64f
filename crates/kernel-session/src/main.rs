//! kernel-session CLI entry point.
//!
//! Starts local kernels through the provisioner and runs code on them.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::info;

use kernel_session::config::settings_path;
use kernel_session::{
    local_services, ExecuteOptions, KernelSessionError, Provisioner, SessionSettings,
};

#[derive(Parser, Debug)]
#[command(name = "kernel-session")]
#[command(about = "Run code on Jupyter kernels with managed sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List installed kernelspecs
    Specs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a kernel, run code on it, print the outputs
    Exec {
        /// Code to execute
        code: String,

        /// Kernelspec to launch (default: from settings)
        #[arg(long)]
        kernel: Option<String>,

        /// Seconds before giving up on the execution (0 disables)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print outputs as nbformat JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the effective settings
    Settings {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = SessionSettings::load();

    match cli.command {
        Commands::Specs { json } => list_specs(json).await,
        Commands::Exec {
            code,
            kernel,
            timeout,
            json,
        } => {
            if let Some(kernel) = kernel {
                settings.default_kernel_name = kernel;
            }
            if let Some(timeout) = timeout {
                settings.execution_timeout_secs = timeout;
            }
            exec(settings, &code, json).await
        }
        Commands::Settings { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("Settings file: {}", settings_path().display());
                println!("Kernel:        {}", settings.default_kernel_name);
                println!(
                    "Server:        {}",
                    settings.server_url.as_deref().unwrap_or("-")
                );
                println!("Timeout:       {}s", settings.execution_timeout_secs);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn list_specs(json: bool) -> anyhow::Result<ExitCode> {
    let services = local_services();
    services.kernelspecs.ready().await?;
    let specs = services.kernelspecs.specs();

    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
    } else if specs.is_empty() {
        println!("No kernelspecs found");
    } else {
        let default = services.kernelspecs.default_name();
        for spec in specs {
            let marker = if Some(&spec.name) == default.as_ref() {
                "*"
            } else {
                " "
            };
            println!(
                "{} {:<20} {:<12} {}",
                marker, spec.name, spec.language, spec.display_name
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn exec(settings: SessionSettings, code: &str, json: bool) -> anyhow::Result<ExitCode> {
    let mut config = settings.to_provision_config();
    config.services = Some(local_services());
    config.start_default_kernel = true;

    let provisioner =
        Provisioner::new(config).with_reconnection_store(settings.reconnection_store());
    let provisioned = provisioner.provision().await?;
    let Some(kernel) = provisioned.kernel else {
        anyhow::bail!("no kernel was started");
    };

    kernel.ready().await?;
    info!("Kernel ready: {}", kernel);

    let Some(executor) = kernel.execute(code, ExecuteOptions::default()) else {
        kernel.shutdown().await.ok();
        anyhow::bail!("kernel is not accepting executions");
    };

    let outcome = executor.done().await;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&executor.accumulator().to_json())?
        );
    } else {
        let text = executor.accumulator().text();
        if !text.is_empty() {
            println!("{}", text.trim_end_matches('\n'));
        }
    }

    let code = match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(KernelSessionError::Timeout(limit)) => {
            eprintln!("Execution did not finish within {}s", limit.as_secs());
            kernel.interrupt().await.ok();
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{}", err.report());
            ExitCode::FAILURE
        }
    };

    kernel.shutdown().await.ok();
    Ok(code)
}
