mod cli;
mod config;
mod errors;
mod fan;
mod fans;
mod gcode;
mod hooks;
mod host;
mod platform;
mod script;
mod settings;

use std::fs::{self, File};
use std::io::{self, BufRead};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};

use cli::{Cli, Commands};
use config::BoardProfile;
use fans::FansPlugin;
use host::Host;

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log to cncfans.log next to the executable.
    let log_path = std::env::current_exe()
        .unwrap_or_default()
        .parent()
        .unwrap_or(std::path::Path::new("."))
        .join("cncfans.log");
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let log_level = level_from_verbosity(cli.verbose);
    if let Ok(file) = File::create(&log_path) {
        let _ = WriteLogger::init(log_level, log_config, file);
    }
    info!("cncfans started (log level: {})", log_level);

    let profile = match &cli.profile {
        Some(path) => BoardProfile::load(path)
            .with_context(|| format!("loading board profile {}", path.display()))?,
        None => BoardProfile::default(),
    };

    let mut host = boot(&profile, &cli)?;

    match cli.command {
        Commands::Run { script } => cmd_run(&mut host, &script),
        Commands::Exec { lines } => cmd_exec(&mut host, lines),
        Commands::Fans => cmd_fans(&host),
        Commands::Settings => cmd_settings(&host),
        Commands::Options => cmd_options(&mut host),
    }
}

/// Bring up the board, install the fan plugin and load settings.
fn boot(profile: &BoardProfile, cli: &Cli) -> Result<Host> {
    let mut hal = platform::create_hal(profile, cli.nvs.as_deref())?;
    let plugin = FansPlugin::init(&mut hal, profile.fans);

    let mut host = Host::new(hal);
    match plugin {
        Ok(plugin) => host.install(Box::new(plugin)),
        Err(error) => warn!("running without fans: {}", error),
    }

    print!("{}", host.startup());
    Ok(host)
}

fn cmd_run(host: &mut Host, script: &std::path::Path) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if script.as_os_str() == "-" {
        let lines = io::stdin().lock().lines().collect::<Result<Vec<_>, _>>()?;
        return script::run(host, lines, &mut out);
    }

    let text = fs::read_to_string(script)
        .with_context(|| format!("reading script {}", script.display()))?;
    script::run(host, text.lines().map(str::to_string), &mut out)
}

fn cmd_exec(host: &mut Host, lines: Vec<String>) -> Result<()> {
    let stdout = io::stdout();
    script::run(host, lines, &mut stdout.lock())
}

fn cmd_fans(host: &Host) -> Result<()> {
    let fans = host.describe();
    if fans.is_empty() {
        println!("No fans configured.");
        return Ok(());
    }
    for fan in &fans {
        println!("{}", fan);
    }
    Ok(())
}

fn cmd_settings(host: &Host) -> Result<()> {
    let details = host.setting_details();
    if details.is_empty() {
        println!("No settings.");
        return Ok(());
    }

    print!("{}", settings::render_table(&details, &host.settings_report()));
    Ok(())
}

fn cmd_options(host: &mut Host) -> Result<()> {
    print!("{}", host.report_options());
    Ok(())
}
