use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rlm_runner::analysis::{AnalysisRequest, run_analysis};
use rlm_runner::core::supervisor::Phase;
use rlm_runner::exit_codes;
use rlm_runner::io::config::load_config;
use rlm_runner::io::control::{load_control, write_control};
use rlm_runner::io::dispatch::{DEPTH_ENV, ProcessAnalyzer};
use rlm_runner::io::init::{InitOptions, RunnerPaths, init_workspace};
use rlm_runner::io::questions;
use rlm_runner::io::state::load_supervisor_state;
use rlm_runner::io::verify::CommandVerifier;
use rlm_runner::io::worker::ProcessWorkerRunner;
use rlm_runner::logging;
use rlm_runner::session::{Session, load_session, save_session};
use rlm_runner::supervise::run_supervisor;

/// How often a blocking `ask --wait` re-reads the questions file.
const ANSWER_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "rlm-runner", version, about = "Verification-gated goal runner")]
struct Cli {
    /// Workspace root holding the `.rlm/` directory.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold the `.rlm/` workspace layout.
    Init {
        /// Overwrite existing artifacts and config.
        #[arg(long)]
        force: bool,
    },
    /// Run the attempt loop until it passes, exhausts, or is stopped.
    Run,
    /// Answer one query over a large source via chunked sub-workers.
    Analyze {
        /// File or directory to load as the context.
        source: PathBuf,
        /// The query to answer.
        query: String,
        /// Chunk size in bytes (defaults to the configured value).
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Overlap between adjacent chunks in bytes.
        #[arg(long)]
        overlap: Option<usize>,
    },
    /// Print the persisted supervisor state.
    Status,
    /// Block scheduling of the next attempt.
    Pause,
    /// Resume a paused run.
    Resume,
    /// Abort the run; in-flight work is cancelled.
    Stop,
    /// Record an operator question for the running session.
    Ask {
        text: String,
        /// Block until the question is answered and print the answer.
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds.
        #[arg(long, requires = "wait")]
        timeout_secs: Option<u64>,
    },
    /// Answer a previously asked question.
    Respond { id: u32, answer: String },
    /// Query the worker session's loaded context.
    Context {
        #[command(subcommand)]
        op: ContextOp,
    },
}

#[derive(Subcommand)]
enum ContextOp {
    /// Load a file or directory as the session context.
    Load { source: PathBuf },
    /// Print 1-indexed lines [first, last] of the context.
    Peek { first: usize, last: usize },
    /// Search the context; a search unlocks reads above the threshold.
    Search {
        pattern: String,
        #[arg(long, default_value_t = 20)]
        max_matches: usize,
    },
    /// Extract embedded JSON records from the context.
    Extract {
        #[arg(long, default_value_t = 50)]
        max_items: usize,
    },
    /// Print context shape statistics.
    Stats,
    /// Check a destructive operation against the context gate.
    Authorize { operation: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = RunnerPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            init_workspace(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.rlm_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run => {
            let config = load_config(&paths.config_path)?;
            let outcome = run_supervisor(
                &cli.root,
                &config,
                &ProcessWorkerRunner,
                &CommandVerifier,
            )?;
            println!(
                "{} after {} attempt(s)",
                outcome.phase.as_str(),
                outcome.attempts
            );
            Ok(match outcome.phase {
                Phase::Passed => exit_codes::OK,
                Phase::FailedExhausted => exit_codes::EXHAUSTED,
                Phase::Aborted => exit_codes::ABORTED,
                _ => exit_codes::INVALID,
            })
        }
        Command::Analyze {
            source,
            query,
            chunk_size,
            overlap,
        } => {
            let config = load_config(&paths.config_path)?;
            let depth = dispatch_depth()?;
            let analyzer = Arc::new(ProcessAnalyzer {
                command: config.analyzer.command.clone(),
                timeout: config.dispatch_timeout(),
                output_limit_bytes: config.output_limit_bytes,
            });
            let answer = run_analysis(
                &analyzer,
                &AnalysisRequest {
                    source,
                    query,
                    chunk_size_bytes: chunk_size.unwrap_or(config.chunk_size_bytes),
                    chunk_overlap_bytes: overlap.unwrap_or(config.chunk_overlap_bytes),
                    chunks_dir: paths.chunks_dir.clone(),
                    max_sub_agents: config.max_sub_agents,
                    depth,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&answer)?);
            Ok(if answer.complete {
                exit_codes::OK
            } else {
                exit_codes::INCOMPLETE
            })
        }
        Command::Status => {
            match load_supervisor_state(&paths.supervisor_path)? {
                Some(state) => {
                    println!("phase: {}", state.phase.as_str());
                    println!("attempts: {}/{}", state.attempts.len(), state.max_attempts);
                    println!("verified failures: {}", state.verified_failures);
                    println!("stall rollovers: {}", state.stall_rollovers);
                    println!("worker errors: {}", state.worker_errors);
                    if let Some(record) = state.last_verification() {
                        println!(
                            "last verification: {} (exit {:?})",
                            if record.passed { "passed" } else { "failed" },
                            record.exit_code
                        );
                    }
                }
                None => println!("no run recorded"),
            }
            for question in questions::open_questions(&paths.questions_path)? {
                println!("open question {}: {}", question.id, question.text);
            }
            Ok(exit_codes::OK)
        }
        Command::Pause => set_control(&paths, |flags| flags.paused = true),
        Command::Resume => set_control(&paths, |flags| flags.paused = false),
        Command::Stop => set_control(&paths, |flags| flags.stop = true),
        Command::Ask {
            text,
            wait,
            timeout_secs,
        } => {
            if wait {
                let answer = questions::ask_and_wait(
                    &paths.questions_path,
                    &text,
                    ANSWER_POLL,
                    timeout_secs.map(Duration::from_secs),
                )?;
                println!("{answer}");
            } else {
                let id = questions::ask(&paths.questions_path, &text)?;
                println!("question {id} recorded");
            }
            Ok(exit_codes::OK)
        }
        Command::Respond { id, answer } => {
            questions::respond(&paths.questions_path, id, &answer)?;
            println!("question {id} answered");
            Ok(exit_codes::OK)
        }
        Command::Context { op } => run_context_op(&paths, op),
    }
}

/// One `context` subcommand: rehydrate the persisted session, run the
/// operation, and persist any state it changed.
fn run_context_op(paths: &RunnerPaths, op: ContextOp) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    match op {
        ContextOp::Load { source } => {
            // Loading replaces whatever session the previous load left.
            let mut session = Session::new(&config);
            session.load_context(&source)?;
            session.begin_work()?;
            save_session(&session, &paths.session_path)?;
            let stats = session.stats()?;
            println!(
                "loaded {} ({} bytes, {} lines, {} files)",
                source.display(),
                stats.bytes,
                stats.lines,
                stats.files
            );
        }
        ContextOp::Peek { first, last } => {
            let session = load_session(&config, &paths.session_path)?;
            print!("{}", session.peek(first, last)?);
        }
        ContextOp::Search {
            pattern,
            max_matches,
        } => {
            let mut session = load_session(&config, &paths.session_path)?;
            let matches = session.search(&pattern, max_matches)?;
            // The searched flag unlocks large peeks in later invocations.
            save_session(&session, &paths.session_path)?;
            for hit in &matches {
                println!("{}:{}: {}", hit.line, hit.offset, hit.text);
            }
        }
        ContextOp::Extract { max_items } => {
            let session = load_session(&config, &paths.session_path)?;
            let records = session.extract_structured(max_items)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        ContextOp::Stats => {
            let session = load_session(&config, &paths.session_path)?;
            println!("{}", serde_json::to_string_pretty(&session.stats()?)?);
        }
        ContextOp::Authorize { operation } => {
            let session = load_session(&config, &paths.session_path)?;
            session.authorize_destructive(&operation)?;
            println!("allowed");
        }
    }
    Ok(exit_codes::OK)
}

fn set_control(paths: &RunnerPaths, apply: impl FnOnce(&mut rlm_runner::io::control::ControlFlags)) -> Result<i32> {
    let mut flags = load_control(&paths.control_path)?;
    apply(&mut flags);
    write_control(&paths.control_path, &flags)?;
    Ok(exit_codes::OK)
}

/// Recursion depth inherited from a dispatching parent, 0 at the root.
fn dispatch_depth() -> Result<u8> {
    match std::env::var(DEPTH_ENV) {
        Ok(raw) => raw
            .parse::<u8>()
            .with_context(|| format!("{DEPTH_ENV} must be a small integer, got '{raw}'")),
        Err(_) => Ok(0),
    }
}
