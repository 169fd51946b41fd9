use anyhow::Result;
use clap::{crate_version, Arg, Command};
use env_logger::Builder;
use log::LevelFilter;

use clubprint_edge_db::connection::run_migrations;
use clubprint_services::supervisor;
use clubprint_settings::{ClubPrintSettings, Secrets};

#[tokio::main]
async fn main() -> Result<()> {
    let app_name = "clubprint";
    let matches = Command::new(app_name)
        .version(crate_version!())
        .about("ClubPrint attendance sheet printing agent")
        .subcommand_required(true)
        .arg(
            Arg::new("v")
                .short('v')
                .multiple_occurrences(true)
                .global(true)
                .help("Sets the level of verbosity. Info: -v Debug: -vv Trace: -vvv"),
        )
        .subcommand(
            Command::new("run")
                .about("Run the scheduling and print delivery engine until terminated"),
        )
        .subcommand(
            Command::new("migrate").about("Apply pending database migrations and exit"),
        )
        .subcommand(Command::new("settings").about("Print the merged settings as TOML"))
        .subcommand(Command::new("health").about("Print the latest health snapshot"))
        .get_matches();

    let mut builder = Builder::new();
    match matches.occurrences_of("v") {
        0 | 1 => builder.filter_level(LevelFilter::Info),
        2 => builder.filter_level(LevelFilter::Debug),
        _ => builder.filter_level(LevelFilter::Trace),
    };
    builder.init();

    match matches.subcommand() {
        Some(("run", _)) => {
            supervisor::install_panic_hook();
            let settings = ClubPrintSettings::new()?;
            let secrets = Secrets::from_env(settings.print_mode)?;
            supervisor::run(settings, secrets).await?;
        }
        Some(("migrate", _)) => {
            let settings = ClubPrintSettings::new()?;
            std::fs::create_dir_all(&settings.paths.data_dir)?;
            let database_path = settings.paths.db().display().to_string();
            run_migrations(&database_path)?;
            println!("Migrations applied to {}", database_path);
        }
        Some(("settings", _)) => {
            let settings = ClubPrintSettings::new()?;
            println!("{}", toml::to_string_pretty(&settings)?);
        }
        Some(("health", _)) => {
            let settings = ClubPrintSettings::new()?;
            let raw = std::fs::read_to_string(settings.paths.health_file())?;
            println!("{}", raw);
        }
        _ => unreachable!("subcommand_required"),
    };
    Ok(())
}
