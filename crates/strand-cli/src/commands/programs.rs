//! `strand programs`: list the built-in service programs.

use crate::programs::BUILTINS;

pub fn execute() -> anyhow::Result<()> {
    let width = BUILTINS.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, about) in BUILTINS {
        println!("{:width$}  {}", name, about, width = width);
    }
    Ok(())
}
