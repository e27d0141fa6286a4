use std::path::PathBuf;

use clap::Args;
use seq_fuzz::{Data, DerivationTree, Grammar, Input};

#[derive(Debug, Args)]
pub struct DeriveArgs {
    /// Grammar file to derive from.
    #[arg(long)]
    grammar: PathBuf,
    /// Target number of sequence atoms.
    #[arg(long, default_value_t = 10)]
    length: i32,
    /// Derivation seed; consecutive seeds are used for further inputs.
    #[arg(long, default_value_t = 0)]
    seed: u32,
    /// How many inputs to derive.
    #[arg(long, default_value_t = 1)]
    count: u32,
    /// Print the concatenated string instead of the token list.
    #[arg(long)]
    concat: bool,
}

impl DeriveArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let data = Data::new();
        let grammar = data.create_form::<Grammar>();
        grammar.load_file(&self.grammar)?;

        for offset in 0..self.count {
            let seed = self.seed.wrapping_add(offset);
            let tree = data.create_form::<DerivationTree>();
            grammar.derive(&tree, self.length, seed);
            if !tree.is_valid() {
                anyhow::bail!("derivation failed for seed {seed}");
            }
            let input = data.create_form::<Input>();
            input.populate_from_tree(&tree);
            if self.concat {
                println!("{}", input.to_concatenated_string());
            } else {
                println!("{}", input.to_python_list());
            }
        }
        Ok(())
    }
}
