use crate::demo::{run_demo, run_definition_dump, DefinitionArgs, DemoArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use status_workflow::error::AppError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Status Change Workflow",
    about = "Run or demonstrate the student status change approval service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Walk through withdrawal, deferment and reinstatement scenarios against the seeded registry
    Demo(DemoArgs),
    /// Print the active workflow definition table as JSON
    Definition(DefinitionArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Persist requests and audit entries in this SQLite file; the seeded registry still resets on restart
    #[arg(long)]
    pub(crate) database: Option<PathBuf>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args),
        Command::Definition(args) => run_definition_dump(args),
    }
}
