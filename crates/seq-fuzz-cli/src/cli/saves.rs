use std::path::PathBuf;

use clap::Args;
use itertools::Itertools;
use seq_fuzz::{Data, ExclusionTree, Input};

#[derive(Debug, Args)]
pub struct SaveInfoArgs {
    /// Save file to inspect.
    save: PathBuf,
    /// Also list every stored input sequence.
    #[arg(long)]
    inputs: bool,
}

impl SaveInfoArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let data = Data::new();
        let stats = data.load_file(&self.save)?;

        println!("forms:   {}", data.form_count());
        for (form_type, count) in &stats.counts {
            println!("  {form_type:<16} {count}");
        }
        if stats.failed > 0 {
            println!("failed:  {}", stats.failed);
        }
        if stats.skipped > 0 {
            println!("skipped: {}", stats.skipped);
        }

        if let Some(exclusion) =
            data.lookup_form::<ExclusionTree>(seq_fuzz::store::static_ids::EXCLUSION_TREE)
        {
            println!(
                "exclusion tree: {} nodes, {} leaves, depth {}",
                exclusion.node_count(),
                exclusion.leaf_count(),
                exclusion.depth()
            );
        }

        if self.inputs {
            for id in data.form_ids() {
                let Some(input) = data.lookup_form::<Input>(id) else { continue };
                println!(
                    "input {:#x}: [{}]",
                    id,
                    input.tokens().iter().map(|token| format!("{token:?}")).join(", ")
                );
            }
        }
        Ok(())
    }
}
