use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use isollm_core::config::{self, AgentIdentity, ProjectConfig};
use isollm_core::error::{canonical_message, IsollmError};
use isollm_core::git_hub::GitHub;
use isollm_core::multiplexer::{CliMultiplexer, NoMultiplexer};
use isollm_core::process::SystemProcessRunner;
use isollm_core::queue::http::HttpQueueClient;
use isollm_core::queue::launcher::CliQueueServerLauncher;
use isollm_core::queue::{ListTasksQuery, NewTask, Priority, QueueBackend, TaskStatus};
use isollm_core::session::down::{parse_choice, DownOptions, ShutdownChoice, ShutdownController};
use isollm_core::session::status::StatusCollector;
use isollm_core::session::up::{find_project_root, SessionController, UpOptions};
use isollm_core::worker::runtime_cli::CliContainerRuntime;
use isollm_core::worker::{RunningStatus, WorkerManager};

const VERSION: &str = "0.1.0";
const DEFAULT_WORKERS: u32 = 3;
const DEFAULT_IMAGE: &str = "ubuntu:24.04";

#[derive(Parser)]
#[command(name = "isollm", about = "orchestrate a fleet of containerized coding agents", version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default isollm.yaml and create the state directory
    Init {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long)]
        image: Option<String>,
    },
    /// Bring a session online
    Up {
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long = "no-zellij")]
        no_zellij: bool,
    },
    /// Bring a session down
    Down {
        #[arg(long)]
        destroy: bool,
        #[arg(long)]
        save: bool,
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show a status snapshot
    Status {
        #[arg(long)]
        brief: bool,
        #[arg(long)]
        json: bool,
    },
    /// Task queue operations
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Worker container operations
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Bare-hub synchronization
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Project configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    Add {
        title: String,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Clear {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Add {
        #[arg(long)]
        name: Option<String>,
    },
    List,
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Remove {
        name: String,
    },
    Reset {
        name: String,
    },
    Shell {
        name: String,
    },
    Exec {
        name: String,
        #[arg(trailing_var_arg = true)]
        argv: Vec<String>,
    },
    Status {
        name: String,
    },
}

#[derive(Subcommand)]
enum SyncCommand {
    Status,
    Pull,
    Push,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    Edit,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        if let Some(msg) = canonical_message(&e) {
            eprintln!("{msg}");
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(exit_code_for(&e));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if matches!(err.downcast_ref::<IsollmError>(), Some(IsollmError::ValidationFailed(_))) {
        1
    } else {
        2
    }
}

/// A loaded project's resolved paths and configuration — assembled once per
/// invocation, then handed to whichever controller the subcommand needs.
struct Workspace {
    project_path: PathBuf,
    state_dir: PathBuf,
    bare_path: PathBuf,
    config: ProjectConfig,
}

fn load_workspace() -> Result<Workspace> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let project_path = find_project_root(&cwd)?;
    let project_config = ProjectConfig::load(&project_path)?;
    let state_dir = config::state_dir(&project_path);
    let bare_path = config::bare_repo_path(&project_config.project)?;
    Ok(Workspace {
        project_path,
        state_dir,
        bare_path,
        config: project_config,
    })
}

fn resolve_agent() -> AgentIdentity {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    AgentIdentity::resolve(None, |k| std::env::var(k).ok(), &cwd)
}

fn container_binary() -> String {
    std::env::var("ISOLLM_CONTAINER_BINARY").unwrap_or_else(|_| "docker".to_string())
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Init { name, workers, image } => cmd_init(name, workers, image),
        Command::Up { workers, base, force, no_zellij } => cmd_up(workers, base, force, no_zellij),
        Command::Down { destroy, save, yes } => cmd_down(destroy, save, yes),
        Command::Status { brief, json } => cmd_status(brief, json),
        Command::Task { command } => cmd_task(command),
        Command::Worker { command } => cmd_worker(command),
        Command::Sync { command } => cmd_sync(command),
        Command::Config { command } => cmd_config(command),
    }
}

fn cmd_init(name: Option<String>, workers: Option<u32>, image: Option<String>) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config_path = cwd.join("isollm.yaml");
    if config_path.is_file() {
        bail!("{} already exists", config_path.display());
    }

    let project = name.unwrap_or_else(|| {
        cwd.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string())
    });

    let mut yaml = format!("project: {project}\n");
    yaml += &format!("workers: {}\n", workers.unwrap_or(DEFAULT_WORKERS));
    yaml += &format!("image: \"{}\"\n", image.as_deref().unwrap_or(DEFAULT_IMAGE));
    std::fs::write(&config_path, &yaml)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let state_dir = config::state_dir(&cwd);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;

    add_gitignore_entry(&cwd, ".isollm/")?;

    println!("Initialized isollm project '{project}' in {}", cwd.display());
    Ok(())
}

fn add_gitignore_entry(project_root: &Path, entry: &str) -> Result<()> {
    let path = project_root.join(".gitignore");
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == entry) {
        return Ok(());
    }
    let mut body = existing;
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body += entry;
    body.push('\n');
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
}

fn cmd_up(workers: Option<u32>, base: Option<String>, force: bool, no_zellij: bool) -> Result<()> {
    let ws = load_workspace()?;
    let runner = SystemProcessRunner;
    let git = GitHub::new(runner, ws.bare_path.clone());
    let runtime = CliContainerRuntime::new(SystemProcessRunner, container_binary());
    let launcher = CliQueueServerLauncher::default();
    let multiplexer = CliMultiplexer::default();

    let controller = SessionController::new(
        &runtime,
        &git,
        &launcher,
        &multiplexer,
        ws.state_dir.clone(),
        ws.project_path.clone(),
        ws.config.image.clone(),
        ws.config.branch_prefix.clone(),
    );

    let opts = UpOptions {
        workers,
        base_branch: base,
        force,
        skip_multiplexer: no_zellij,
    };
    let record = controller.up(&ws.config, opts)?;
    println!(
        "session up: {} worker(s) — {}",
        record.workers.len(),
        record.workers.join(", ")
    );
    Ok(())
}

fn cmd_down(destroy: bool, save: bool, yes: bool) -> Result<()> {
    let ws = load_workspace()?;
    let runtime = CliContainerRuntime::new(SystemProcessRunner, container_binary());
    let git = GitHub::new(SystemProcessRunner, ws.bare_path.clone());
    let workers = WorkerManager::new(
        &runtime,
        ws.state_dir.clone(),
        ws.bare_path.clone(),
        ws.config.image.clone(),
        ws.config.branch_prefix.clone(),
    );
    let controller = ShutdownController {
        workers: &workers,
        git: &git,
        state_dir: ws.state_dir.clone(),
        project_path: ws.project_path.clone(),
        base_branch: ws.config.base_branch.clone(),
    };

    let unsaved = controller.detect_unsaved()?;
    let mut do_salvage = false;

    if !unsaved.is_empty() && !yes {
        for w in &unsaved {
            eprintln!(
                "worker {}: {}{}",
                w.name,
                if w.uncommitted { "uncommitted changes" } else { "" },
                if w.unpushed_commits > 0 {
                    format!(" {} unpushed commit(s)", w.unpushed_commits)
                } else {
                    String::new()
                }
            );
        }
        match prompt_shutdown_choice()? {
            ShutdownChoice::Salvage => do_salvage = true,
            ShutdownChoice::Discard => do_salvage = false,
            ShutdownChoice::Cancel => {
                println!("Shutdown cancelled");
                return Ok(());
            }
        }
    }

    if do_salvage {
        controller.salvage(&unsaved);
    }

    let agent = resolve_agent();
    let queue = HttpQueueClient::new(&ws.config.queue_host, ws.config.queue_port, agent.0.clone());
    controller.release_tasks(&queue, &agent.0);

    if save {
        let snapshot_name = format!("shutdown-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"));
        controller.snapshot_all(&snapshot_name)?;
    }

    let confirm_input = if destroy && !yes {
        print!("type 'destroy' to remove all worker containers: ");
        io::stdout().flush().ok();
        let mut line = String::new();
        io::stdin().read_line(&mut line).context("failed to read confirmation")?;
        Some(line.trim().to_string())
    } else {
        None
    };

    let opts = DownOptions {
        destroy,
        save_snapshots: save,
        skip_confirm: yes,
    };
    let outcome = controller.finish(&opts, confirm_input.as_deref())?;
    if destroy && !outcome.destroyed {
        println!("Destruction cancelled");
    }
    if outcome.destroyed {
        println!("workers destroyed, session cleared");
    } else {
        println!("workers stopped, session cleared");
    }
    Ok(())
}

fn prompt_shutdown_choice() -> Result<ShutdownChoice> {
    loop {
        print!("[s]alvage / [d]iscard / [c]ancel? ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if io::stdin().read_line(&mut line).context("failed to read response")? == 0 {
            return Ok(ShutdownChoice::Cancel);
        }
        if let Some(choice) = parse_choice(&line) {
            return Ok(choice);
        }
        eprintln!("please answer s, d, or c");
    }
}

fn cmd_status(brief: bool, json: bool) -> Result<()> {
    let ws = load_workspace()?;
    let runtime = CliContainerRuntime::new(SystemProcessRunner, container_binary());
    let git = GitHub::new(SystemProcessRunner, ws.bare_path.clone());
    let workers = WorkerManager::new(
        &runtime,
        ws.state_dir.clone(),
        ws.bare_path.clone(),
        ws.config.image.clone(),
        ws.config.branch_prefix.clone(),
    );
    let multiplexer = NoMultiplexer;
    let agent = resolve_agent();
    let queue = HttpQueueClient::new(&ws.config.queue_host, ws.config.queue_port, agent.0.clone());

    let collector = StatusCollector {
        workers: &workers,
        git: &git,
        multiplexer: &multiplexer,
        project_path: ws.project_path.clone(),
        base_branch: ws.config.base_branch.clone(),
        branch_prefix: ws.config.branch_prefix.clone(),
        queue_host: ws.config.queue_host.clone(),
        queue_port: ws.config.queue_port,
    };
    let snapshot = collector.collect(&queue);

    if json {
        println!("{}", serde_json::to_string_pretty(&status_to_json(&snapshot))?);
        return Ok(());
    }

    if brief {
        let running = snapshot.workers.iter().filter(|w| w.status == RunningStatus::Running).count();
        println!(
            "workers {running}/{} running, tasks {} open / {} in-progress / {} blocked / {} done, queue {}",
            snapshot.workers.len(),
            snapshot.tasks.open,
            snapshot.tasks.in_progress,
            snapshot.tasks.blocked,
            snapshot.tasks.done,
            if snapshot.services.queue_reachable { "up" } else { "down" },
        );
        return Ok(());
    }

    println!("project: {}", ws.config.project);
    println!("queue: {}", if snapshot.services.queue_reachable { "reachable" } else { "unreachable" });
    println!(
        "tasks: {} open, {} in-progress, {} blocked, {} done",
        snapshot.tasks.open, snapshot.tasks.in_progress, snapshot.tasks.blocked, snapshot.tasks.done
    );
    println!(
        "sync: host ahead by {}, {} task branch(es) in hub",
        snapshot.sync.host_ahead, snapshot.sync.task_branches
    );
    println!("workers:");
    for w in &snapshot.workers {
        let status = status_str(w.status);
        let assignment = w
            .assignment
            .as_ref()
            .map(|a| format!(" task={} branch={}", a.task_id, a.branch))
            .unwrap_or_default();
        println!("  {} [{status}]{}{}", w.name, assignment, w.ip.as_deref().map(|ip| format!(" ip={ip}")).unwrap_or_default());
    }
    Ok(())
}

fn status_str(status: RunningStatus) -> &'static str {
    match status {
        RunningStatus::Running => "running",
        RunningStatus::Stopped => "stopped",
        RunningStatus::Unknown => "unknown",
    }
}

fn status_to_json(snapshot: &isollm_core::session::status::StatusSnapshot) -> serde_json::Value {
    serde_json::json!({
        "workers": snapshot.workers.iter().map(|w| serde_json::json!({
            "name": w.name,
            "status": status_str(w.status),
            "ip": w.ip,
            "task": w.assignment.as_ref().map(|a| serde_json::json!({
                "id": a.task_id,
                "branch": a.branch,
            })),
        })).collect::<Vec<_>>(),
        "tasks": {
            "open": snapshot.tasks.open,
            "in_progress": snapshot.tasks.in_progress,
            "blocked": snapshot.tasks.blocked,
            "done": snapshot.tasks.done,
        },
        "sync": {
            "host_ahead": snapshot.sync.host_ahead,
            "task_branches": snapshot.sync.task_branches,
        },
        "services": {
            "queue_reachable": snapshot.services.queue_reachable,
            "multiplexer_present": snapshot.services.multiplexer_present,
        },
    })
}

fn queue_client(ws: &Workspace, agent: &AgentIdentity) -> HttpQueueClient {
    HttpQueueClient::new(&ws.config.queue_host, ws.config.queue_port, agent.0.clone())
}

fn cmd_task(command: TaskCommand) -> Result<()> {
    let ws = load_workspace()?;
    let agent = resolve_agent();
    let queue = queue_client(&ws, &agent);

    match command {
        TaskCommand::Add { title, priority, description } => {
            let priority = priority.as_deref().map(Priority::from_str_loose).transpose()?;
            let task = queue.add_task(&agent.0, NewTask { title, priority, description })?;
            println!("added task {} ({})", task.id, task.priority.as_str());
        }
        TaskCommand::List { status } => {
            let status = status.as_deref().map(parse_task_status).transpose()?;
            let tasks = queue.list_tasks(ListTasksQuery { status, ..Default::default() })?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for t in tasks {
                println!("{}\t{}\t{}\t{}", t.id, task_status_str(t.status), t.priority.as_str(), t.title);
            }
        }
        TaskCommand::Clear { all } => {
            if all {
                queue.clear_all_tasks()?;
                println!("cleared all tasks");
            } else {
                queue.clear_done_tasks()?;
                println!("cleared done tasks");
            }
        }
    }
    Ok(())
}

fn parse_task_status(s: &str) -> Result<TaskStatus> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "open" => TaskStatus::Open,
        "in_progress" | "in-progress" => TaskStatus::InProgress,
        "blocked" => TaskStatus::Blocked,
        "done" => TaskStatus::Done,
        other => bail!("unknown task status '{other}'"),
    })
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Open => "open",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Done => "done",
    }
}

fn cmd_worker(command: WorkerCommand) -> Result<()> {
    let ws = load_workspace()?;
    let runtime = CliContainerRuntime::new(SystemProcessRunner, container_binary());
    let workers = WorkerManager::new(
        &runtime,
        ws.state_dir.clone(),
        ws.bare_path.clone(),
        ws.config.image.clone(),
        ws.config.branch_prefix.clone(),
    );

    match command {
        WorkerCommand::Add { name } => {
            let created = workers.create_worker(name.as_deref())?;
            println!("created {created}");
        }
        WorkerCommand::List => {
            for view in workers.list()? {
                let assignment = view
                    .assignment
                    .map(|a| format!(" task={} branch={}", a.task_id, a.branch))
                    .unwrap_or_default();
                println!("{} [{}]{}", view.name, status_str(view.status), assignment);
            }
        }
        WorkerCommand::Start { name } => {
            workers.start(&name)?;
            println!("{name} started");
        }
        WorkerCommand::Stop { name } => {
            workers.stop(&name)?;
            println!("{name} stopped");
        }
        WorkerCommand::Remove { name } => {
            workers.remove(&name)?;
            println!("{name} removed");
        }
        WorkerCommand::Reset { name } => {
            workers.reset(&name)?;
            println!("{name} reset");
        }
        WorkerCommand::Shell { name } => {
            workers.shell(&name)?;
        }
        WorkerCommand::Exec { name, argv } => {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            let out = workers.exec(&name, &argv)?;
            print!("{out}");
        }
        WorkerCommand::Status { name } => {
            let view = workers
                .list()?
                .into_iter()
                .find(|w| w.name == name)
                .with_context(|| format!("no such worker '{name}'"))?;
            println!("{} [{}]", view.name, status_str(view.status));
            if let Some(a) = view.assignment {
                println!("task: {} branch: {}", a.task_id, a.branch);
            }
        }
    }
    Ok(())
}

fn cmd_sync(command: SyncCommand) -> Result<()> {
    let ws = load_workspace()?;
    let git = GitHub::new(SystemProcessRunner, ws.bare_path.clone());

    match command {
        SyncCommand::Status => {
            let ahead = git.is_host_ahead(&ws.project_path, &ws.config.base_branch)?;
            let branches = git.list_task_branches(&ws.config.branch_prefix)?;
            println!("host ahead of hub by {ahead} commit(s) on {}", ws.config.base_branch);
            println!("{} task branch(es) in hub:", branches.len());
            for b in branches {
                println!("  {} {} {}", b.task_id, b.short_commit, b.subject);
            }
        }
        SyncCommand::Pull => {
            git.pull_from_bare(&ws.project_path, &ws.config.branch_prefix)?;
            println!("fetched task branches from hub");
        }
        SyncCommand::Push => {
            git.push_to_bare(&ws.project_path, &ws.config.base_branch)?;
            println!("pushed {} to hub", ws.config.base_branch);
        }
    }
    Ok(())
}

fn cmd_config(command: ConfigCommand) -> Result<()> {
    let ws = load_workspace()?;
    match command {
        ConfigCommand::Show => {
            println!("{:#?}", ws.config);
        }
        ConfigCommand::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let path = ws.project_path.join("isollm.yaml");
            let status = std::process::Command::new(&editor)
                .arg(&path)
                .status()
                .with_context(|| format!("failed to launch editor '{editor}'"))?;
            if !status.success() {
                bail!("editor '{editor}' exited with {status}");
            }
            ProjectConfig::load(&ws.project_path).context("edited config is invalid")?;
        }
    }
    Ok(())
}
