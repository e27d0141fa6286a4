mod derive;
mod grammar;
mod saves;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "seq-fuzz", about = "Grammar-aware differential fuzzing toolkit")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a grammar file and report its shape.
    Grammar(grammar::GrammarArgs),
    /// Derive inputs from a grammar.
    Derive(derive::DeriveArgs),
    /// Inspect a save file.
    SaveInfo(saves::SaveInfoArgs),
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Grammar(args) => args.run(),
            Command::Derive(args) => args.run(),
            Command::SaveInfo(args) => args.run(),
        }
    }
}
