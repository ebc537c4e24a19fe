//! Command-line adapter for the fabula engine.
//!
//! Exit codes: 0 on success (including graceful stops), 2 when a chapter
//! needs human review (a pause, not a failure), 1 on any error.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fabula::cancel;
use fabula::config::Config;
use fabula::engine::{
    Orchestrator, Reporter, RollbackTarget, RunOptions, RunOutcome, StepName,
};
use fabula::export;
use fabula::graph::Node;
use fabula::providers::GenerationProviders;
use fabula::retrieval::{self, SearchFilters};

#[derive(Parser, Debug)]
#[command(name = "fabula", version)]
#[command(about = "Checkpointed, resumable long-form narrative generation")]
struct Cli {
    /// Directory that holds all projects.
    #[arg(long, default_value = "projects")]
    base_dir: PathBuf,

    /// Verbose logging (sets the tracing filter to debug).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new project.
    Init {
        /// Project name (falls back to PROJECT_NAME).
        project: Option<String>,
        /// Number of chapters to plan for.
        #[arg(long, short)]
        chapters: Option<u32>,
    },
    /// Run the generation workflow from the start.
    Run {
        project: Option<String>,
        /// Number of chapters to generate.
        #[arg(long, short)]
        chapters: Option<u32>,
        /// Initial prompt used for bootstrap and retrieval.
        #[arg(long)]
        prompt: Option<String>,
        /// Stop gracefully after this node completes.
        #[arg(long, value_parser = parse_node)]
        stop_at: Option<Node>,
    },
    /// Resume from the latest checkpoint.
    Resume { project: Option<String> },
    /// Print step completion, chapter table and memory summary.
    Status { project: Option<String> },
    /// Detailed state dump for rollback planning.
    State { project: Option<String> },
    /// Roll the project back to a step, chapter or scene boundary.
    Rollback {
        project: Option<String>,
        /// Step to roll back to (world, theme_conflict, characters,
        /// outline, chapters).
        #[arg(long, value_parser = parse_step, conflicts_with = "chapter")]
        step: Option<StepName>,
        /// Chapter to roll back to (deletes this chapter onward).
        #[arg(long, short)]
        chapter: Option<u32>,
        /// Scene within --chapter to roll back to.
        #[arg(long, short, requires = "chapter")]
        scene: Option<u32>,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        force: bool,
    },
    /// Render manuscript text (read-only).
    Export {
        project: Option<String>,
        /// Export a single chapter instead of the whole manuscript.
        #[arg(long, short)]
        chapter: Option<u32>,
        /// Write to a file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Keyword search over project artifacts.
    Ask {
        project: Option<String>,
        /// The question to search for.
        #[arg(long, short)]
        question: String,
        /// Maximum number of hits.
        #[arg(long, default_value_t = 8)]
        top_k: usize,
    },
}

fn parse_node(name: &str) -> std::result::Result<Node, String> {
    Node::parse(name).ok_or_else(|| format!("unknown node '{name}'"))
}

fn parse_step(name: &str) -> std::result::Result<StepName, String> {
    StepName::parse(name).ok_or_else(|| format!("unknown step '{name}'"))
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // First Ctrl-C sets the shutdown flag so the graph stops at the next
    // node boundary; a second one aborts the process.
    let _ = ctrlc::set_handler(|| {
        if cancel::is_shutdown_requested() {
            std::process::exit(130);
        }
        eprintln!("[warn] shutdown requested; finishing the current node");
        cancel::request_shutdown();
    });

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[error] {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "fabula=debug" } else { "fabula=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(cli: Cli) -> Result<i32> {
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Init { project, chapters } => {
            let mut config = Config::load(project.as_deref(), &cli.base_dir)?;
            if let Some(chapters) = chapters {
                config.num_chapters = chapters.max(1);
            }
            let orch = Orchestrator::new(config);
            orch.init(&mut reporter)?;
            Ok(0)
        }
        Commands::Run {
            project,
            chapters,
            prompt,
            stop_at,
        } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let mut opts = RunOptions::from_config(&config, chapters, prompt);
            opts.stop_at = stop_at;
            let orch = Orchestrator::new(config);
            let outcome = orch.run(GenerationProviders::templates(), &opts, &mut reporter)?;
            print_outcome(&outcome);
            Ok(outcome.exit_code())
        }
        Commands::Resume { project } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let orch = Orchestrator::new(config);
            let outcome = orch.resume(GenerationProviders::templates(), &mut reporter)?;
            print_outcome(&outcome);
            Ok(outcome.exit_code())
        }
        Commands::Status { project } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let orch = Orchestrator::new(config);
            print_status(&orch)?;
            Ok(0)
        }
        Commands::State { project } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let orch = Orchestrator::new(config);
            print_state(&orch)?;
            Ok(0)
        }
        Commands::Rollback {
            project,
            step,
            chapter,
            scene,
            force,
        } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let target = match (step, chapter, scene) {
                (Some(step), None, _) => RollbackTarget::Step(step),
                (None, Some(chapter), None) => RollbackTarget::Chapter(chapter),
                (None, Some(chapter), Some(scene)) => RollbackTarget::Scene { chapter, scene },
                _ => anyhow::bail!("rollback needs --step or --chapter [--scene]"),
            };

            if !force && !confirm_rollback(&config.project_name, &target)? {
                eprintln!("[info] rollback cancelled");
                return Ok(1);
            }

            let orch = Orchestrator::new(config);
            let report = orch.rollback(target, &mut reporter)?;
            println!(
                "removed {} file(s); pruned {} memory and {} report entries",
                report.deleted_files.len(),
                report.memory_entries_pruned,
                report.report_entries_pruned
            );
            Ok(0)
        }
        Commands::Export {
            project,
            chapter,
            output,
        } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let orch = Orchestrator::new(config);
            let text = match chapter {
                Some(chapter) => export::export_chapter(orch.store(), chapter)?,
                None => export::export_all(orch.store())?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, &text)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("[info] wrote {}", path.display());
                }
                None => print!("{text}"),
            }
            Ok(0)
        }
        Commands::Ask {
            project,
            question,
            top_k,
        } => {
            let config = Config::load(project.as_deref(), &cli.base_dir)?;
            let orch = Orchestrator::new(config.clone());
            if !orch.store().project_exists() {
                anyhow::bail!("project '{}' not found; run 'init' first", config.project_name);
            }

            let hits = retrieval::search(
                orch.store().project_root(),
                &config.retrieval_db(),
                &question,
                top_k,
                &SearchFilters::default(),
            )?;
            if hits.is_empty() {
                println!("no sources matched.");
                return Ok(0);
            }
            println!("answer sketch (excerpts from the project corpus):");
            for (i, hit) in hits.iter().enumerate() {
                let excerpt = hit.excerpt.replace('\n', " ");
                println!("{}. [{}] {}", i + 1, hit.doc_type, excerpt.trim());
            }
            println!("\nsources:");
            for hit in &hits {
                println!("- {} ({})", hit.source_path, hit.source_id);
            }
            Ok(0)
        }
    }
}

fn print_outcome(outcome: &RunOutcome) {
    let state = outcome.state();
    match outcome {
        RunOutcome::Completed(_) => println!(
            "[ok] completed: {} of {} chapter(s) stored",
            state.current_chapter, state.num_chapters
        ),
        RunOutcome::NeedsHumanReview(_) => println!(
            "[review] chapter {} needs human review (resume after editing)",
            state.current_chapter
        ),
        RunOutcome::Stopped(_) => println!(
            "[stopped] at chapter {}; 'resume' continues from the checkpoint",
            state.current_chapter
        ),
    }
}

fn print_status(orch: &Orchestrator) -> Result<()> {
    let status = orch.project_status()?;

    println!("project: {}", orch.config().project_name);
    println!("steps:");
    for (name, exists) in &status.steps {
        println!("  {:<16} {}", name, if *exists { "done" } else { "missing" });
    }
    println!(
        "outline chapters: {}  checkpoint: {}",
        status.outline_chapters,
        if status.checkpoint_exists { "present" } else { "absent" }
    );

    if status.chapters.is_empty() {
        println!("chapters: none yet");
    } else {
        println!("chapters:");
        for (id, chapter) in &status.chapters {
            println!(
                "  {:>3}  plan:{}  scenes:{}  complete:{}  words:{}",
                id,
                if chapter.has_plan { "yes" } else { "no" },
                chapter.scene_files.len(),
                if chapter.complete { "yes" } else { "no" },
                chapter.word_count
            );
        }
    }
    println!(
        "memory entries: {}  report entries: {}",
        status.memory_entries, status.report_entries
    );
    Ok(())
}

fn print_state(orch: &Orchestrator) -> Result<()> {
    let status = orch.project_status()?;
    println!("project: {}", orch.config().project_name);
    println!("rollback targets:");
    for (name, exists) in &status.steps {
        if *exists {
            println!("  --step {name}");
        }
    }
    for (id, chapter) in &status.chapters {
        if chapter.complete || chapter.has_plan {
            println!(
                "  --chapter {id}{}",
                if chapter.scene_files.is_empty() {
                    String::new()
                } else {
                    format!(
                        " (scenes {})",
                        chapter
                            .scene_files
                            .iter()
                            .map(|s| s.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                    )
                }
            );
        }
    }
    println!(
        "checkpoint database: {}",
        if status.checkpoint_exists { "present" } else { "absent" }
    );
    Ok(())
}

fn confirm_rollback(project: &str, target: &RollbackTarget) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("rollback is destructive; pass --force in non-interactive use");
    }
    eprint!(
        "this permanently deletes artifacts of '{project}' ({target:?}); type 'yes' to continue: "
    );
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
