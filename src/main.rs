//! Punto de entrada ("driver").
//!
//! Este módulo orquesta las diferentes fases del proceso de
//! compilación y expone una CLI.

use anyhow::{bail, Context};
use clap::{crate_version, Arg, ArgAction, Command};

use std::fs;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Parsing de CLI
    let args = Command::new("ppp compiler")
        .version(crate_version!())
        .arg(
            Arg::new("input")
                .value_name("FILE")
                .required(true)
                .help("ppp source file"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .default_value("-")
                .help("Output file ('-' for stdout)"),
        )
        .arg(
            Arg::new("emulate")
                .long("emulate")
                .action(ArgAction::SetTrue)
                .help("Run the compiled program on the reference VM"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Cross-check the VM run against the reference evaluator"),
        )
        .get_matches();

    // Se extraen argumentos necesarios
    let input = args.get_one::<String>("input").unwrap();
    let output = args.get_one::<String>("output").unwrap();

    let source = fs::read_to_string(input)
        .with_context(|| format!("Failed to read source file: {}", input))?;

    let compiled = pppc::compile(&source)
        .with_context(|| format!("Failed to compile: {}", input))?;

    match output.as_str() {
        // Salida a stdout
        "-" => print!("{}", compiled.text),

        // Salida a archivo
        path => fs::write(path, &compiled.text)
            .with_context(|| format!("Failed to write output: {}", path))?,
    }

    if args.get_flag("emulate") {
        let report = pppc::vm::run(&compiled.text).context("Emulation failed")?;

        eprintln!("clock cycles: {}", report.cycles);
        eprintln!("dds writes:   {}", report.dds_writes);

        for (line, text) in &report.redundant {
            eprintln!("redundant instruction at line {}: {}", line, text);
        }

        let mut finals: Vec<(&String, &u64)> = report
            .variables
            .iter()
            .filter(|(name, _)| compiled.user_vars.contains(*name))
            .collect();
        finals.sort();

        for (name, value) in finals {
            eprintln!("{} = {}", name, value);
        }
    }

    if args.get_flag("check") {
        let verification = pppc::verify(&compiled).context("Cross-check failed")?;

        if verification.mismatches.is_empty() {
            eprintln!(
                "check: VM and evaluator agree on {} user variables",
                compiled.user_vars.len(),
            );
        } else {
            for (name, vm_value, eval_value) in &verification.mismatches {
                eprintln!(
                    "mismatch in `{}`: vm = {}, evaluator = {}",
                    name, vm_value, eval_value,
                );
            }

            bail!("VM and evaluator disagree");
        }
    }

    Ok(())
}
