//! launch_exec CLI
//!
//! Usage:
//!   launch_exec talker.unit.yaml
//!   launch_exec talker.unit.yaml -a robot:=turtle --noninteractive
//!   launch_exec talker.unit.yaml --dry-run

use launch_exec::{ExecutionContext, LaunchArgs, ManagedProcess, StandardLoggers, UnitFile, UnitOutcome};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(launch_exec::cli::log_filter(&args.log_level));
    env_logger::init_from_env(env);

    log::info!("Loading unit file: {}", args.unit_file);
    let unit_file = match UnitFile::from_file(&args.unit_file) {
        Ok(unit) => unit,
        Err(e) => {
            log::error!("Failed to load unit file: {}", e);
            std::process::exit(1);
        }
    };

    let (configs, options) = match unit_file
        .launch_configurations(&args.arg_overrides())
        .and_then(|configs| Ok((configs, unit_file.options()?)))
    {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("Invalid unit file: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = Arc::new(
        ExecutionContext::new()
            .with_noninteractive(args.noninteractive)
            .with_launch_configurations(configs),
    );
    let description = unit_file.description();

    // Dry run mode
    if args.dry_run {
        match description.prepare(&ctx, options.shell, options.emulate_tty) {
            Ok(spec) => {
                println!("name: {}", spec.name);
                println!("cmd:  {}", spec.command_line());
                if let Some(cwd) = &spec.cwd {
                    println!("cwd:  {}", cwd.display());
                }
                if let Some(env) = &spec.env {
                    println!("env:  {} variables", env.len());
                }
            }
            Err(e) => {
                log::error!("Failed to resolve process: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Set up Ctrl+C handler
    {
        let ctx = ctx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            if !ctx.shutdown(true) {
                log::debug!("Already shutting down, ignoring Ctrl+C");
            }
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    let unit = ManagedProcess::new(description, options, Arc::new(StandardLoggers));
    let completion = match unit.execute(&ctx) {
        Ok(completion) => completion,
        Err(e) => {
            log::error!("Failed to execute unit: {}", e);
            std::process::exit(1);
        }
    };

    let code = match completion.wait().await {
        UnitOutcome::Finished(Some(code)) if code >= 0 => code,
        UnitOutcome::Finished(Some(code)) => 128 - code,
        UnitOutcome::Skipped => 0,
        UnitOutcome::Finished(None) | UnitOutcome::SpawnFailed | UnitOutcome::Abandoned => 1,
    };

    log::info!("launch_exec exiting");
    std::process::exit(code);
}
