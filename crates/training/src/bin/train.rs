use clap::Parser;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let report = run_train(args)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
