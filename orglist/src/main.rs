use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::Logger;
use indexmap::IndexSet;
use orglist::config::{Config, Settings, expand_home};
use orglist::core::{Effort, Error, Priority, Tag};
use orglist::engine::{Action, ItemLocation, Target, TodoFile};
use orglist::format_document;
use orglist::session::{Candidate, Choice, NameGuessers, Selector, Session};

#[derive(Debug, Parser)]
#[command(
    name = "orglist",
    about = "Keep TODO lists as headings of an Org file",
    version
)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/orglist/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Org file holding the lists; overrides `storage_path`.
    #[arg(long, global = true)]
    file: Option<PathBuf>,
    /// List to work in; otherwise guessed, then asked for.
    #[arg(long, short = 'l', global = true)]
    list: Option<String>,
    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the lists in the file.
    Lists,

    /// Make a list the active one, creating it if needed.
    Select {
        /// List name; guessed or asked for when omitted.
        name: Option<String>,
    },

    /// Show the items of the active list.
    Items,

    /// Add an item (or select it if one with this title exists).
    Add {
        /// Item text.
        text: String,
    },

    /// Move an item to its next todo state.
    Toggle(ItemArg),

    /// Move an item to the archive location.
    Archive(ItemArg),

    /// Set or clear (`none`) an item's priority.
    Priority {
        priority: String,
        #[command(flatten)]
        item: ItemArg,
    },

    /// Replace an item's tags; no tags clears them.
    Tags {
        tags: Vec<String>,
        #[command(flatten)]
        item: ItemArg,
    },

    /// Set or clear (`none`) an item's effort (`1:30`, `90`, `1h 30min`).
    Effort {
        effort: String,
        #[command(flatten)]
        item: ItemArg,
    },

    /// Set a property, or remove it when no value is given.
    Property {
        key: String,
        value: Option<String>,
        #[command(flatten)]
        item: ItemArg,
    },

    /// Move an item to another list (created if missing).
    Refile {
        /// Destination list.
        to: String,
        #[command(flatten)]
        item: ItemArg,
    },

    /// Print where an item is (file:line).
    Visit(ItemArg),

    /// Print the parsed file.
    Dump,
}

#[derive(Debug, Args)]
struct ItemArg {
    /// Item title; a numbered prompt is shown when omitted.
    #[arg(long, short = 'i')]
    item: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    let _logger = Logger::try_with_env_or_str(level)
        .context("configuring logger")?
        .log_to_stderr()
        .start()
        .context("starting logger")?;

    let settings = load_settings(&cli)?;
    let file = TodoFile::open(settings);
    let guessers = default_guessers();
    let mut selector = PromptSelector::new(io::stdin().lock(), io::stderr());
    let json = cli.json;

    match cli.command {
        Commands::Lists => {
            let sections = file.list_sections()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sections)?);
            } else {
                for section in sections {
                    println!("{}{}", section.name, render_tags(&section.tags));
                }
            }
        }
        Commands::Select { name } => {
            let mut session = Session::new();
            let section = match name.or(cli.list) {
                Some(name) => file.select_or_create_section(&mut session, Some(&name), &guessers)?,
                None => file.choose_section(&mut session, &mut selector, &guessers)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&section)?);
            } else {
                println!("{}", section.name);
            }
        }
        Commands::Items => {
            // Reading never creates the list.
            let section = match cli.list.or_else(|| file.guess_name(&guessers)) {
                Some(name) => name,
                None => pick_existing(&file, &mut selector)?,
            };
            let items = file.list_items(section.trim())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for item in items {
                    let priority = item.priority.map(|p| format!("[#{p}] ")).unwrap_or_default();
                    let effort = item.effort.map(|e| format!(" ({e})")).unwrap_or_default();
                    println!(
                        "{:<6} {priority}{}{effort}{}",
                        item.state,
                        item.title,
                        render_tags(&item.tags)
                    );
                }
            }
        }
        Commands::Dump => {
            let doc = file.load()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", format_document(&doc));
            }
        }
        command => {
            let session = activate(&file, cli.list.as_deref(), &guessers, &mut selector)?;
            let (action, item) = action_for(command)?;
            let target = match item {
                Some(target) => target,
                None => file.choose_item(&session, &mut selector)?,
            };
            let location = file.apply_action(&session, action, target)?;
            print_location(&location, json)?;
        }
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load_or_default(&default_config_path())?,
    };
    let mut settings = config.validate().context("validating configuration")?;
    if let Some(file) = &cli.file {
        settings.storage_path = expand_home(file);
    }
    Ok(settings)
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_home(Path::new("~/.config")));
    base.join("orglist").join("config.toml")
}

/// `$ORGLIST_LIST`, then the name of the enclosing git repository.
fn default_guessers() -> NameGuessers {
    NameGuessers::new()
        .with("env", || std::env::var("ORGLIST_LIST").ok())
        .with("git", || {
            let cwd = std::env::current_dir().ok()?;
            repository_name(&cwd)
        })
}

fn repository_name(start: &Path) -> Option<String> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
}

/// Session for this invocation: `--list`, else a guess, else the prompt.
fn activate<R: BufRead, W: Write>(
    file: &TodoFile,
    list: Option<&str>,
    guessers: &NameGuessers,
    selector: &mut PromptSelector<R, W>,
) -> Result<Session> {
    let mut session = Session::new();
    match file.select_or_create_section(&mut session, list, guessers) {
        Ok(_) => {}
        Err(Error::NoSectionName) => {
            file.choose_section(&mut session, selector, guessers)?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(session)
}

/// Ask for a list name among the existing lists without creating anything.
fn pick_existing<S: Selector>(file: &TodoFile, selector: &mut S) -> Result<String> {
    let candidates: Vec<Candidate<String>> = file
        .list_sections()?
        .into_iter()
        .map(|s| Candidate {
            label: s.name.clone(),
            value: s.name,
        })
        .collect();
    Ok(match selector.choose("List", &candidates, None)? {
        Choice::Existing(name) | Choice::Typed(name) => name,
    })
}

fn action_for(command: Commands) -> Result<(Action, Option<Target>)> {
    let literal = |arg: ItemArg| arg.item.map(Target::Literal);
    Ok(match command {
        Commands::Add { text } => (Action::Insert, Some(Target::Literal(text))),
        Commands::Toggle(item) => (Action::Toggle, literal(item)),
        Commands::Archive(item) => (Action::Archive, literal(item)),
        Commands::Visit(item) => (Action::Visit, literal(item)),
        Commands::Priority { priority, item } => {
            (Action::SetPriority(parse_priority(&priority)?), literal(item))
        }
        Commands::Tags { tags, item } => {
            let tags = tags
                .iter()
                .flat_map(|t| t.split([':', ',']))
                .filter(|t| !t.trim().is_empty())
                .map(Tag::parse)
                .collect::<orglist::Result<IndexSet<_>>>()?;
            (Action::SetTags(tags), literal(item))
        }
        Commands::Effort { effort, item } => {
            let effort = if is_none(&effort) {
                None
            } else {
                Some(effort.parse::<Effort>()?)
            };
            (Action::SetEffort(effort), literal(item))
        }
        Commands::Property { key, value, item } => {
            (Action::SetProperty { key, value }, literal(item))
        }
        Commands::Refile { to, item } => (Action::Refile { to }, literal(item)),
        Commands::Lists | Commands::Select { .. } | Commands::Items | Commands::Dump => {
            anyhow::bail!("not an item command")
        }
    })
}

fn parse_priority(raw: &str) -> Result<Option<Priority>> {
    if is_none(raw) {
        return Ok(None);
    }
    let raw = raw.trim().trim_start_matches("[#").trim_end_matches(']');
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => Ok(Some(Priority(c))),
        _ => anyhow::bail!("priority must be a single letter or digit, got {raw:?}"),
    }
}

fn is_none(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "none" | "-" | "")
}

fn render_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" :{}:", tags.join(":"))
    }
}

fn print_location(location: &ItemLocation, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(location)?);
    } else {
        let section = if location.section.is_empty() {
            String::new()
        } else {
            format!("{} / ", location.section)
        };
        println!(
            "{}:{}: {section}{}",
            location.file.display(),
            location.line,
            location.title
        );
    }
    Ok(())
}

/// Numbered list on `output`, answer read from `input`. A number picks a
/// candidate, other text is taken as typed, an empty answer takes the default.
struct PromptSelector<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Selector for PromptSelector<R, W> {
    fn choose<T: Clone>(
        &mut self,
        prompt: &str,
        candidates: &[Candidate<T>],
        default: Option<&str>,
    ) -> orglist::Result<Choice<T>> {
        let io_err = |source: io::Error| Error::Storage {
            action: "prompt on",
            path: PathBuf::from("<terminal>"),
            source,
        };
        for (idx, candidate) in candidates.iter().enumerate() {
            writeln!(self.output, "{:>3}. {}", idx + 1, candidate.label).map_err(io_err)?;
        }
        let asked = match default {
            Some(default) => write!(self.output, "{prompt} [{default}]: "),
            None => write!(self.output, "{prompt}: "),
        };
        asked.map_err(io_err)?;
        self.output.flush().map_err(io_err)?;

        let mut line = String::new();
        self.input.read_line(&mut line).map_err(io_err)?;
        let answer = line.trim();

        if answer.is_empty() {
            return default
                .map(|d| Choice::Typed(d.to_string()))
                .ok_or_else(|| Error::InvalidValue("nothing selected".into()));
        }
        if let Some(candidate) = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| candidates.get(idx))
        {
            return Ok(Choice::Existing(candidate.value.clone()));
        }
        if let Some(candidate) = candidates.iter().find(|c| c.label == answer) {
            return Ok(Choice::Existing(candidate.value.clone()));
        }
        Ok(Choice::Typed(answer.to_string()))
    }
}
