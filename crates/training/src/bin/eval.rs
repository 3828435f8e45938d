use clap::Parser;
use training::util::{run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    let args = EvalArgs::parse();
    let metrics = run_eval(args)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
