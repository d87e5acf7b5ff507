//! Command-line front end for the ballot ledger.
//!
//! Generates voter keys, runs a demo election to a chain file, and audits
//! chain files: full validation, inclusion proofs and tallies.

use ballot_ledger::sign::load_or_derive_keypair;
use ballot_ledger::{
    inclusion_in_chain, load_chain_file, write_chain_file, Ballot, Chain, Ed25519KeySource,
    LedgerConfig, LedgerManager, SealMode, ValidationOptions,
};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: ballot_ledger <keygen|simulate|verify|proof|tally> ...");
    println!("  keygen [ed25519://<seed>|<keyfile>] [--out <file>]");
    println!("  simulate [--election <id>] [--voters <N>] [--candidates <a,b,..>]");
    println!("           [--config <ledger.json>] [--out <chain.json>] [--deferred]");
    println!("  verify <chain.json> [--skip-signatures] [--skip-inclusion]");
    println!("  proof <chain.json> <vote_id>");
    println!("  tally <chain.json>");
    println!("Environment: RUST_LOG, BALLOT_LEDGER_DIFFICULTY, BALLOT_LEDGER_MAX_VOTES_PER_BLOCK,");
    println!("  BALLOT_LEDGER_SEAL_MODE, BALLOT_LEDGER_CLOSE_POLICY, BALLOT_LEDGER_ALLOW_EMPTY_BLOCKS,");
    println!("  BALLOT_LEDGER_VERIFY_INCLUSION");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("keygen") => cmd_keygen(args.collect()),
        Some("simulate") => cmd_simulate(args.collect()),
        Some("verify") => cmd_verify(args.collect()),
        Some("proof") => cmd_proof(args.collect()),
        Some("tally") => cmd_tally(args.collect()),
        Some("-h") | Some("--help") | Some("help") | None => print_help(),
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn cmd_keygen(args: Vec<String>) {
    let mut key_spec: Option<String> = None;
    let mut out_path: Option<PathBuf> = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => {
                out_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--out expects a value")),
                ));
            }
            value => {
                if key_spec.is_none() {
                    key_spec = Some(value.to_string());
                } else {
                    fatal(&format!("unknown argument: {value}"));
                }
            }
        }
    }

    let source = Ed25519KeySource::from_spec(key_spec.as_deref());
    let material = load_or_derive_keypair(&source)
        .unwrap_or_else(|err| fatal(&format!("failed to derive key: {err}")));
    if let Some(out_path) = out_path {
        if let Some(parent) = out_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(&out_path, format!("{}\n", hex::encode(material.signing.to_bytes())))
            .unwrap_or_else(|err| fatal(&format!("failed to write key: {err}")));
        println!("key_path: {}", out_path.display());
    }
    println!("public_key_b64: {}", material.public_key_base64());
}

fn cmd_simulate(args: Vec<String>) {
    let mut election_id = String::from("demo-election");
    let mut voters: usize = 12;
    let mut candidates: Vec<String> = vec!["alice".into(), "bob".into(), "carol".into()];
    let mut config_path: Option<PathBuf> = None;
    let mut out_path = PathBuf::from("chain.json");
    let mut deferred = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--election" => {
                election_id = iter
                    .next()
                    .unwrap_or_else(|| fatal("--election expects a value"));
            }
            "--voters" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--voters expects a value"));
                voters = value
                    .parse()
                    .unwrap_or_else(|_| fatal("--voters expects a positive integer"));
            }
            "--candidates" => {
                let value = iter
                    .next()
                    .unwrap_or_else(|| fatal("--candidates expects a value"));
                candidates = value
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect();
            }
            "--config" => {
                config_path = Some(PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--config expects a value")),
                ));
            }
            "--out" => {
                out_path = PathBuf::from(
                    iter.next()
                        .unwrap_or_else(|| fatal("--out expects a value")),
                );
            }
            "--deferred" => deferred = true,
            "-h" | "--help" => {
                print_help();
                return;
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    if candidates.is_empty() {
        fatal("--candidates must name at least one candidate");
    }

    let mut config = LedgerConfig::resolve(config_path.as_deref())
        .unwrap_or_else(|err| fatal(&format!("config error: {err}")));
    if deferred {
        config.seal_mode = SealMode::Deferred;
    }
    let manager = Arc::new(
        LedgerManager::new(config).unwrap_or_else(|err| fatal(&format!("config error: {err}"))),
    );
    manager
        .open_election(&election_id)
        .unwrap_or_else(|err| fatal(&format!("failed to open election: {err}")));

    let ballots: Vec<(Ballot, String)> = (0..voters)
        .map(|i| {
            let keys = ballot_ledger::keypair_from_seed(&format!("{election_id}/voter-{i}"));
            let ballot = Ballot {
                election_id: election_id.clone(),
                voter_public_key: keys.public_key_base64(),
                candidate_id: candidates[i % candidates.len()].clone(),
                timestamp: ballot_ledger::block::now_millis(),
            };
            let signature = ballot
                .sign(&keys)
                .unwrap_or_else(|err| fatal(&format!("failed to sign ballot: {err}")));
            (ballot, signature)
        })
        .collect();

    if manager.config().seal_mode == SealMode::Deferred {
        run_deferred(&manager, &election_id, ballots);
    } else {
        for (ballot, signature) in ballots {
            let receipt = manager
                .submit_vote(&election_id, ballot, signature)
                .unwrap_or_else(|err| fatal(&format!("vote rejected: {err}")));
            println!("{}", serde_json::to_string(&receipt).unwrap_or_default());
        }
        manager
            .close_election(&election_id)
            .unwrap_or_else(|err| fatal(&format!("failed to close election: {err}")));
    }

    let chain = manager
        .chain(&election_id)
        .unwrap_or_else(|err| fatal(&format!("failed to read chain: {err}")));
    write_chain_file(&out_path, &chain)
        .unwrap_or_else(|err| fatal(&format!("failed to write chain: {err}")));
    let report = manager
        .validate(&election_id)
        .unwrap_or_else(|err| fatal(&format!("failed to validate chain: {err}")));
    println!(
        "election: {election_id} blocks: {} valid: {} chain_path: {}",
        chain.len(),
        report.is_valid,
        out_path.display()
    );
}

#[cfg(feature = "worker")]
fn run_deferred(manager: &Arc<LedgerManager>, election_id: &str, ballots: Vec<(Ballot, String)>) {
    use ballot_ledger::SealEvent;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    runtime.block_on(async {
        let (worker, mut events) = ballot_ledger::SealWorker::spawn(Arc::clone(manager));
        for (ballot, signature) in ballots {
            let receipt = worker
                .submit_vote(election_id, ballot, signature)
                .unwrap_or_else(|err| fatal(&format!("vote rejected: {err}")));
            println!("{}", serde_json::to_string(&receipt).unwrap_or_default());
        }
        worker
            .request_close(election_id)
            .unwrap_or_else(|err| fatal(&format!("failed to close election: {err}")));
        worker.shutdown().await;
        while let Some(event) = events.recv().await {
            match event {
                SealEvent::Sealed {
                    block_index,
                    block_hash,
                    vote_ids,
                    ..
                } => println!(
                    "sealed block {block_index} ({} votes) {block_hash}",
                    vote_ids.len()
                ),
                SealEvent::Closed { blocks, .. } => {
                    println!("closed after {blocks} flush block(s)")
                }
                SealEvent::Failed { error, .. } => eprintln!("seal failed: {error}"),
            }
        }
    });
}

#[cfg(not(feature = "worker"))]
fn run_deferred(_: &Arc<LedgerManager>, _: &str, _: Vec<(Ballot, String)>) {
    fatal("deferred sealing requires the `worker` feature");
}

fn load_chain(path: &Path) -> Chain {
    load_chain_file(path)
        .and_then(|document| document.into_chain())
        .unwrap_or_else(|err| fatal(&format!("failed to load chain {}: {err}", path.display())))
}

fn cmd_verify(args: Vec<String>) {
    let mut path: Option<PathBuf> = None;
    let mut options = ValidationOptions::default();
    for arg in args {
        match arg.as_str() {
            "--skip-signatures" => options.verify_signatures = false,
            "--skip-inclusion" => options.verify_inclusion = false,
            value if path.is_none() => path = Some(PathBuf::from(value)),
            value => fatal(&format!("unknown argument: {value}")),
        }
    }
    let path = path.unwrap_or_else(|| fatal("Usage: ballot_ledger verify <chain.json>"));
    let report = load_chain(&path).validate_full(options);
    let rendered = serde_json::to_string_pretty(&report)
        .unwrap_or_else(|err| fatal(&format!("failed to encode report: {err}")));
    println!("{rendered}");
    if !report.is_valid {
        std::process::exit(2);
    }
}

fn cmd_proof(args: Vec<String>) {
    let [path, vote_id] = args.as_slice() else {
        fatal("Usage: ballot_ledger proof <chain.json> <vote_id>");
    };
    let chain = load_chain(Path::new(path));
    let inclusion = inclusion_in_chain(&chain, vote_id)
        .unwrap_or_else(|err| fatal(&format!("failed to build proof: {err}")))
        .unwrap_or_else(|| fatal(&format!("vote {vote_id} is not sealed in {path}")));
    let mut rendered = inclusion.to_json();
    rendered["verified"] = serde_json::Value::Bool(inclusion.verify());
    println!(
        "{}",
        serde_json::to_string_pretty(&rendered).unwrap_or_default()
    );
}

fn cmd_tally(args: Vec<String>) {
    let [path] = args.as_slice() else {
        fatal("Usage: ballot_ledger tally <chain.json>");
    };
    let chain = load_chain(Path::new(path));
    let report = chain.validate_full(ValidationOptions::default());
    if !report.is_valid {
        fatal(&format!(
            "refusing to tally {path}: {} validation issue(s)",
            report.errors.len()
        ));
    }
    for (candidate, count) in chain.tally() {
        println!("{candidate}: {count}");
    }
}
