use anyhow::Result;
use clap::Parser;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use cibox::arch::Host;
use cibox::bootstrap::{execute, ProvisionOutcome, Provisioner};
use cibox::catalog::Catalog;
use cibox::cli::{ContainerArgs, CreateArgs, ExecArgs, InvalidateArgs};
use cibox::command_runner::{CommandRunner, RealCommandRunner};
use cibox::config::Settings;
use cibox::download::HttpFetcher;
use cibox::output::Output;
use cibox::repository::ContainerState;
use cibox::{Cli, Commands, ContainerError};

fn main() {
    // e.g. RUST_LOG=cibox=debug
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            Output::error(format!("{err:#}"));
            let container_error = err.downcast_ref::<ContainerError>();
            if let Some(ContainerError::Configuration(message)) = container_error {
                if message.contains("cibox create") {
                    Output::hint("Create the container first, with the same --distro/--release/--arch");
                }
            }
            std::process::exit(container_error.map(ContainerError::exit_code).unwrap_or(1));
        }
    }
}

/// Dispatches a command and returns the process exit code.
fn run(cli: Cli) -> Result<i32> {
    let host = Host::current()?;
    let catalog = Catalog::builtin();
    tracing::debug!(os = host.os.as_str(), arch = %host.arch, bits = host.bits, "detected host");

    match cli.command {
        Commands::Create(args) => cmd_create(&args, &host, catalog),
        Commands::Exec(args) => cmd_exec(args, &host, &catalog),
        Commands::Rootdir(args) => cmd_rootdir(&args, &host, &catalog),
        Commands::Status(args) => cmd_status(&args, &host, &catalog),
        Commands::Invalidate(args) => cmd_invalidate(&args, &host, &catalog),
        Commands::Distros => cmd_distros(&host, &catalog),
    }
}

fn runner() -> Arc<dyn CommandRunner> {
    Arc::new(RealCommandRunner)
}

fn cmd_create(args: &CreateArgs, host: &Host, catalog: Catalog) -> Result<i32> {
    let settings = Settings::for_create(args, host, &catalog)?;
    let label = settings.spec.to_string();

    // Package managers write to the terminal, so the spinner only covers
    // downloading and extracting.
    let spinner = Arc::new(Mutex::new(Some(Output::spinner(format!("Preparing {label}...")))));
    let observer = Arc::clone(&spinner);
    let stage_label = label.clone();
    let provisioner = Provisioner::new(catalog, Arc::new(HttpFetcher::new()?), runner()).on_stage(
        move |stage| {
            let Ok(mut current) = observer.lock() else {
                return;
            };
            match stage {
                ContainerState::Downloading | ContainerState::Extracting => {
                    if let Some(spinner) = current.as_ref() {
                        spinner.set_message(format!("{stage_label}: {stage}..."));
                    }
                }
                _ => {
                    if let Some(spinner) = current.take() {
                        spinner.finish_clear();
                    }
                    Output::step(format!("{stage_label}: {stage}"));
                }
            }
        },
    );

    let outcome = provisioner.provision(&settings);
    let spinner = spinner.lock().ok().and_then(|mut current| current.take());
    match outcome {
        Ok(ProvisionOutcome::CacheHit { path }) => {
            if let Some(spinner) = spinner {
                spinner.finish_clear();
            }
            Output::info(format!("Using cached container at {}", path.display()));
        }
        Ok(ProvisionOutcome::Bootstrapped { path, warnings }) => {
            let message = format!("Created {label} at {}", path.display());
            match spinner {
                Some(spinner) => spinner.finish_success(message),
                None => Output::success(message),
            }
            for warning in warnings {
                Output::warning(warning);
            }
        }
        Err(err) => {
            let message = format!("Could not create {label}");
            match spinner {
                Some(spinner) => spinner.finish_error(message),
                None => Output::error(message),
            }
            return Err(err.into());
        }
    }
    Ok(0)
}

fn cmd_exec(args: ExecArgs, host: &Host, catalog: &Catalog) -> Result<i32> {
    let settings = Settings::resolve(&args.container, host, catalog)?;
    let result = execute(&settings, runner(), args.cmd)?;
    Ok(result.into_exit_code()?)
}

fn cmd_rootdir(args: &ContainerArgs, host: &Host, catalog: &Catalog) -> Result<i32> {
    let settings = Settings::resolve(args, host, catalog)?;
    let repository = settings.repository();
    repository.locate(&settings.spec)?;
    let metadata = repository.read_metadata(&settings.spec)?;
    let prefix = repository.prefix_dir(&settings.spec, metadata.installation);
    Output::value(prefix.display().to_string());
    Ok(0)
}

fn cmd_status(args: &ContainerArgs, host: &Host, catalog: &Catalog) -> Result<i32> {
    let settings = Settings::resolve(args, host, catalog)?;
    let repository = settings.repository();
    let state = repository.state(&settings.spec);

    Output::value(state.to_string());
    Output::kv("Container", settings.spec.to_string());
    Output::kv("Directory", repository.path_for(&settings.spec).display().to_string());
    if state == ContainerState::Ready {
        let metadata = repository.read_metadata(&settings.spec)?;
        Output::kv("Mode", format!("{:?}", metadata.installation).to_lowercase());
        Output::kv("Created", metadata.created_at.to_rfc3339());
    }
    Ok(0)
}

fn cmd_invalidate(args: &InvalidateArgs, host: &Host, catalog: &Catalog) -> Result<i32> {
    let settings = Settings::resolve(&args.container, host, catalog)?;
    let repository = settings.repository();
    if repository.invalidate(&settings.spec, args.purge)? {
        Output::success(format!("Invalidated {}", settings.spec));
    } else {
        Output::info(format!("Nothing to invalidate for {}", settings.spec));
    }
    Ok(0)
}

fn cmd_distros(host: &Host, catalog: &Catalog) -> Result<i32> {
    for entry in catalog.available(host) {
        let archs: Vec<&str> = entry
            .usable_archs(host)
            .iter()
            .map(|arch| arch.universal())
            .collect();
        Output::value(format!("{} {} {}", entry.distro, entry.release, archs.join(",")));
    }
    Ok(0)
}
