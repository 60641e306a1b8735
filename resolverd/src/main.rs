#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

mod command;
mod config;
mod database;
mod ethereum;
mod fs;
mod jsonrpc;
mod trace;

use crate::{
    command::{complete, dump_config, initiate, refund, resolve, status, Command, Options},
    config::{read_config, Settings},
    database::Database,
    fs::default_config_path,
};
use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    let file = read_config(&options.config_file, default_config_path)?;
    let settings = Settings::from_config_file_and_defaults(file, options.network)
        .context("could not initialize configuration")?;

    if let Command::DumpConfig = options.cmd {
        return dump_config(settings);
    }

    trace::init_tracing(settings.logging.level).context("initialize tracing")?;

    fs::ensure_directory_exists(&settings.data.dir)
        .context("could not create data directory")?;
    let db = Database::new(&settings.data.dir.join("database"))?;

    match options.cmd {
        Command::Initiate(args) => initiate(&settings, &db, args).await,
        Command::Resolve => resolve(&settings, &db).await,
        Command::Complete(args) => complete(&settings, &db, args).await,
        Command::Refund(args) => refund(&settings, &db, args).await,
        Command::Status => status(&db),
        Command::DumpConfig => unreachable!("handled before tracing is initialized"),
    }
}
