use std::path::PathBuf;

use clap::Args;
use seq_fuzz::{Data, Grammar};

#[derive(Debug, Args)]
pub struct GrammarArgs {
    /// Grammar file to check.
    grammar: PathBuf,
    /// Print the normalized grammar back out.
    #[arg(long)]
    print: bool,
    /// Print the parse-prepared graph instead of the generation graph.
    #[arg(long, requires = "print")]
    parse_graph: bool,
}

impl GrammarArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let data = Data::new();
        let grammar = data.create_form::<Grammar>();
        grammar.load_file(&self.grammar)?;

        let tree = grammar.tree();
        println!("valid:        {}", tree.valid);
        println!("simple:       {}", tree.simple);
        println!("rules:        {}", tree.rule_order.len());
        println!("nodes:        {}", tree.nodes.len());
        println!("expansions:   {}", tree.expansions.len());
        println!("terminals:    {}", tree.terminals.len());
        drop(tree);

        if self.print {
            print!("{}", grammar.render(self.parse_graph));
        }
        Ok(())
    }
}
