use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;
use usbcap_core::script::{ControlScript, ScriptKind};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the CLI
    Run {
        /// Run stage 1 (firmware)
        #[arg(long)]
        stage1: bool,
        /// Run stage 2 (bitstream and capture)
        #[arg(long)]
        stage2: bool,
    },
    /// Parse both scripts and print their progress ticks
    CheckScripts {
        #[arg(long, default_value = "scripts/firmware.toml")]
        firmware: String,
        #[arg(long, default_value = "scripts/bitstream.toml")]
        bitstream: String,
    },
}

fn check_script(kind: ScriptKind, path: &str) -> Result<()> {
    let script = ControlScript::load(kind, path)?;
    let plan = script.progress_plan();
    println!(
        "{}: {} transfers, tick every {} -> {}",
        kind,
        script.len(),
        plan.stride(),
        plan.render(script.len())
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Run { stage1, stage2 } => {
            println!("Running CLI...");
            let mut cmd = Command::new("cargo");
            cmd.arg("run").arg("-p").arg("usbcap-cli").arg("--");
            if *stage1 {
                cmd.arg("--stage1");
            }
            if *stage2 {
                cmd.arg("--stage2");
            }
            let status = cmd.status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::CheckScripts {
            firmware,
            bitstream,
        } => {
            check_script(ScriptKind::Firmware, firmware)?;
            check_script(ScriptKind::Bitstream, bitstream)?;
        }
    }

    Ok(())
}
