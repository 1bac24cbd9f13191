//! `foghorn-ctl` — offline admin CLI (`SPEC_FULL.md` §C.3). Dry-runs the
//! provisioning `Planner` against a manifest file without standing up any
//! cluster component, printing either the batched plan or the cycle trace.

use foghorn::provisioning::{Manifest, PlanScope, Planner};
use std::env;
use std::fs;
use std::process::ExitCode;

fn usage() -> String {
    "usage: foghorn-ctl plan --manifest <path> [--scope all|infrastructure|applications|interfaces]"
        .to_string()
}

fn parse_scope(raw: &str) -> Option<PlanScope> {
    match raw.to_ascii_lowercase().as_str() {
        "all" => Some(PlanScope::All),
        "infrastructure" => Some(PlanScope::Infrastructure),
        "applications" => Some(PlanScope::Applications),
        "interfaces" => Some(PlanScope::Interfaces),
        _ => None,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] != "plan" {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    }

    let mut manifest_path: Option<String> = None;
    let mut scope = PlanScope::All;
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--manifest" => {
                i += 1;
                manifest_path = args.get(i).cloned();
            }
            "--scope" => {
                i += 1;
                match args.get(i).and_then(|s| parse_scope(s)) {
                    Some(s) => scope = s,
                    None => {
                        eprintln!("unrecognized --scope value");
                        return ExitCode::FAILURE;
                    }
                }
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                eprintln!("{}", usage());
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let Some(path) = manifest_path else {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    };

    let raw = match fs::read_to_string(&path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to read manifest {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let manifest: Manifest = match serde_json::from_str(&raw) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to parse manifest {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match Planner::plan(&manifest, scope) {
        Ok(batches) => {
            println!("foghorn-ctl v{} — provisioning plan ({} batch(es))", foghorn::VERSION, batches.len());
            for (idx, batch) in batches.iter().enumerate() {
                println!("  batch {idx}: {}", batch.join(", "));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("plan failed: {e}");
            ExitCode::FAILURE
        }
    }
}
