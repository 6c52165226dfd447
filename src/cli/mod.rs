//! AN-060: CLI subcommands — board, groups, cards, documents, runs,
//! environments, background.
//!
//! The main thread plays the UI thread: `run` pumps the session console and
//! prints what arrives.

use crate::app::App;
use crate::core::config::{self, AncileConfig, CONFIG_FILE, CONFIG_TEMPLATE};
use crate::core::error::AncileError;
use crate::core::types::{BoardGroup, RunStatus, SinkEvent};
use crate::core::{settings, store::Store};
use crate::runner::sink::{finished_message, OutputSink};
use clap::{CommandFactory, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "ancile",
    version,
    about = "Snippet cards with per-script Python environments and live, stoppable runs"
)]
pub struct Cli {
    /// Path to ancile.yaml
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new ancile data directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate ancile.yaml
    Validate,

    /// Show every group with its cards
    Board {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Manage groups
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Manage cards
    Card {
        #[command(subcommand)]
        action: CardAction,
    },

    /// Read and write documents
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Run a card's document in its environment, streaming output
    Run {
        /// Card title or id
        title: String,

        /// Stop the run after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Inspect or create per-script environments
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Background image setting
    Background {
        #[command(subcommand)]
        action: BackgroundAction,
    },

    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum GroupAction {
    /// Create a group
    Add { name: String },
    /// Rename a group (by id or name)
    Rename { group: String, name: String },
    /// Delete a group and all of its cards
    Delete { group: String },
    /// List groups
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CardAction {
    /// Add a card to a group (by id or name)
    Add {
        group: String,
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Rename a card (by id or title)
    Rename { card: String, title: String },
    /// Delete a card; its document is kept
    Delete { card: String },
    /// List the cards of a group
    List { group: String },
}

#[derive(Subcommand, Debug)]
pub enum DocAction {
    /// Save a document from a file, or stdin when no file is given
    Save {
        title: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a document, or the default text of an unsaved card
    Show { title: String },
}

#[derive(Subcommand, Debug)]
pub enum EnvAction {
    /// Create the environment for a title if it does not exist
    Ensure { title: String },
    /// Print the interpreter path for a title
    Path { title: String },
}

#[derive(Subcommand, Debug)]
pub enum BackgroundAction {
    /// Record an image as the background
    Set { path: PathBuf },
    /// Print the recorded background image
    Show,
}

fn msg(e: AncileError) -> String {
    e.user_message()
}

/// Prints provisioning progress straight to the terminal.
struct TerminalSink;

impl OutputSink for TerminalSink {
    fn send(&self, event: SinkEvent) {
        print_event(&event);
    }
}

/// Write one console event to stdout or stderr.
fn print_event(event: &SinkEvent) {
    match event {
        SinkEvent::Output { text, kind } if kind.is_error() => eprint!("{}", text),
        SinkEvent::Output { text, .. } | SinkEvent::Info(text) => print!("{}", text),
        SinkEvent::Error(text) => eprint!("{}", text),
        SinkEvent::Finished { status, .. } => print!("{}", finished_message(status)),
    }
    let _ = std::io::stdout().flush();
}

/// Dispatch a CLI command.
/// Set up logging, dispatch and report. Returns the process exit code; the
/// log guard is dropped first so the final error reaches the JSON file.
pub fn run(cli: Cli) -> i32 {
    let guard = config::load_config(&cli.config)
        .ok()
        .map(|c| crate::logging::init(&c.data_dir.join("logs")));
    let code = match dispatch(cli.command, &cli.config) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            1
        }
    };
    drop(guard);
    code
}

pub fn dispatch(cmd: Commands, config_path: &Path) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate => cmd_validate(config_path),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "ancile", &mut std::io::stdout());
            Ok(())
        }
        Commands::Background { action } => {
            let config = config::load_config(config_path).map_err(msg)?;
            cmd_background(&config, action)
        }
        other => {
            let config = config::load_config(config_path).map_err(msg)?;
            let mut app = App::open(&config).map_err(msg)?;
            dispatch_app(&mut app, other)
        }
    }
}

/// Commands that work on an opened application.
pub fn dispatch_app(app: &mut App, cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Board { json } => cmd_board(app, json),
        Commands::Group { action } => cmd_group(app, action),
        Commands::Card { action } => cmd_card(app, action),
        Commands::Doc { action } => cmd_doc(app, action),
        Commands::Run { title, timeout } => {
            let timeout = timeout
                .map(Duration::try_from_secs_f64)
                .transpose()
                .map_err(|e| format!("invalid --timeout: {}", e))?;
            cmd_run(app, &title, timeout).map(|_| ())
        }
        Commands::Env { action } => cmd_env(app, action),
        Commands::Init { .. }
        | Commands::Validate
        | Commands::Completions { .. }
        | Commands::Background { .. } => Err("command does not use the store".to_string()),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    let config = config::load_config(&config_path).map_err(msg)?;
    Store::open(&config.database_path()).map_err(msg)?;
    let venvs = config.venvs_path();
    std::fs::create_dir_all(&venvs).map_err(|e| format!("cannot create venvs dir: {}", e))?;

    println!("Initialized ancile at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}", config.database_path().display());
    println!("  Created: {}/", venvs.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let config = config::parse_config(&content).map_err(msg)?;
    let errors = config::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} (python: {}, venvs: {})",
            file.display(),
            config.python,
            config.venvs_dir.display()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn print_board(groups: &[BoardGroup]) {
    if groups.is_empty() {
        println!("No groups. Create one with `ancile group add <name>`.");
        return;
    }
    for bg in groups {
        println!("{} [{}]", bg.group.name, bg.group.id);
        for card in &bg.cards {
            if card.description.is_empty() {
                println!("  {:>4}  {}", card.id, card.title);
            } else {
                println!("  {:>4}  {}: {}", card.id, card.title, card.description);
            }
        }
    }
}

fn cmd_board(app: &App, json: bool) -> Result<(), String> {
    let groups = app.board.groups().map_err(msg)?;
    if json {
        let out = serde_json::to_string_pretty(&groups).map_err(|e| e.to_string())?;
        println!("{}", out);
    } else {
        print_board(&groups);
    }
    Ok(())
}

fn cmd_group(app: &mut App, action: GroupAction) -> Result<(), String> {
    let board = &mut app.board;
    match action {
        GroupAction::Add { name } => {
            let g = board.add_group(&name).map_err(msg)?;
            println!("Created group '{}' [{}]", g.name, g.id);
        }
        GroupAction::Rename { group, name } => {
            let g = board.resolve_group(&group).map_err(msg)?;
            let renamed = board.rename_group(g.id, &name).map_err(msg)?;
            println!("Renamed group '{}' to '{}'", g.name, renamed.name);
        }
        GroupAction::Delete { group } => {
            let g = board.resolve_group(&group).map_err(msg)?;
            let cards = board.delete_group(g.id).map_err(msg)?;
            println!("Deleted group '{}' and {} card(s)", g.name, cards);
        }
        GroupAction::List { json } => {
            let groups = board.store().list_groups().map_err(msg)?;
            if json {
                let out = serde_json::to_string_pretty(&groups).map_err(|e| e.to_string())?;
                println!("{}", out);
            } else {
                for g in groups {
                    println!("{:>4}  {}", g.id, g.name);
                }
            }
        }
    }
    Ok(())
}

fn cmd_card(app: &mut App, action: CardAction) -> Result<(), String> {
    let board = &mut app.board;
    match action {
        CardAction::Add {
            group,
            title,
            description,
        } => {
            let g = board.resolve_group(&group).map_err(msg)?;
            let c = board.add_card(g.id, &title, &description).map_err(msg)?;
            println!("Added card '{}' [{}] to '{}'", c.title, c.id, g.name);
        }
        CardAction::Rename { card, title } => {
            let c = board.resolve_card(&card).map_err(msg)?;
            let renamed = board.rename_card(c.id, &title).map_err(msg)?;
            println!("Renamed card '{}' to '{}'", c.title, renamed.title);
        }
        CardAction::Delete { card } => {
            let c = board.resolve_card(&card).map_err(msg)?;
            board.delete_card(c.id).map_err(msg)?;
            println!("Deleted card '{}'", c.title);
        }
        CardAction::List { group } => {
            let g = board.resolve_group(&group).map_err(msg)?;
            for c in board.store().list_cards(g.id).map_err(msg)? {
                println!("{:>4}  {}", c.id, c.title);
            }
        }
    }
    Ok(())
}

fn cmd_doc(app: &mut App, action: DocAction) -> Result<(), String> {
    match action {
        DocAction::Save { title, file } => {
            let content = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|e| format!("cannot read {}: {}", path.display(), e))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .map_err(|e| format!("cannot read stdin: {}", e))?;
                    buf
                }
            };
            save_document(app, &title, content)?;
            println!("Saved document '{}'", title.trim());
        }
        DocAction::Show { title } => {
            println!("{}", show_document(app, &title)?);
        }
    }
    Ok(())
}

/// Save through the editor session so the text is trimmed the same way the
/// editor's Save does.
fn save_document(app: &mut App, title: &str, content: String) -> Result<(), String> {
    let description = app
        .board
        .store()
        .find_card(title.trim())
        .map_err(msg)?
        .map(|c| c.description)
        .unwrap_or_default();
    app.session
        .open(app.board.store(), title.trim(), &description)
        .map_err(msg)?;
    app.session.set_text(content);
    let saved = app.save().map_err(msg);
    app.session.back();
    saved
}

fn show_document(app: &mut App, title: &str) -> Result<String, String> {
    let store = app.board.store();
    if let Some(content) = store.load_document(title.trim()).map_err(msg)? {
        return Ok(content);
    }
    let card = app.board.resolve_card(title).map_err(msg)?;
    app.open_card(&card).map_err(msg)?;
    let text = app.session.text().to_string();
    app.session.back();
    Ok(text)
}

/// Poll cadence of the console pump while a run is live.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Open the card, run it, and print output as it arrives. Returns the
/// terminal status; anything other than a zero exit is also an error.
fn cmd_run(app: &mut App, title: &str, timeout: Option<Duration>) -> Result<RunStatus, String> {
    let card = app.board.resolve_card(title).map_err(msg)?;
    app.open_card(&card).map_err(msg)?;
    let handle = app.session.run().map_err(msg)?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    loop {
        match app.session.next_event(PUMP_INTERVAL) {
            Some(event @ SinkEvent::Finished { .. }) => {
                print_event(&event);
                break;
            }
            Some(event) => print_event(&event),
            None if handle.is_finished() => {
                for event in app.session.pump() {
                    print_event(&event);
                }
                break;
            }
            None => {}
        }
        if !timed_out && deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            app.session.stop();
        }
    }

    let status = handle.wait();
    match &status {
        RunStatus::Completed { exit_code: 0 } => Ok(status),
        RunStatus::Completed { exit_code } => Err(format!("process exited with code {}", exit_code)),
        RunStatus::Stopped if timed_out => Err(format!(
            "timed out after {:.1}s",
            timeout.unwrap_or_default().as_secs_f64()
        )),
        RunStatus::Stopped => Err("process stopped".to_string()),
        RunStatus::Failed { reason } => Err(reason.clone()),
        RunStatus::Idle | RunStatus::Running => Err(format!("unexpected run state: {}", status)),
    }
}

fn cmd_env(app: &App, action: EnvAction) -> Result<(), String> {
    match action {
        EnvAction::Ensure { title } => {
            let python = app
                .provisioner
                .ensure_environment(title.trim(), &TerminalSink)
                .map_err(msg)?;
            println!("{}", python.display());
        }
        EnvAction::Path { title } => {
            let python = app.provisioner.interpreter_path(title.trim()).map_err(msg)?;
            let state = if python.exists() { "" } else { " (not provisioned)" };
            println!("{}{}", python.display(), state);
        }
    }
    Ok(())
}

fn cmd_background(config: &AncileConfig, action: BackgroundAction) -> Result<(), String> {
    let file = config.background_path();
    match action {
        BackgroundAction::Set { path } => {
            settings::save_background(&file, &path).map_err(msg)?;
            println!("Background set to {}", path.display());
        }
        BackgroundAction::Show => match settings::load_background(&file) {
            Some(p) => println!("{}", p.display()),
            None => println!("(none)"),
        },
    }
    Ok(())
}
