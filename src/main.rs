//! revtree CLI - peer-to-peer version control for a TOML workspace
//!
//! every `[section]` of the workspace file is one tracked item.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use revtree::{
    CancelToken, Key, MergeReport, Selection, StashRef, Store, VersionControl, Workspace,
};

#[derive(Parser)]
#[command(name = "revtree")]
#[command(about = "peer-to-peer version control for tracked items")]
#[command(version)]
struct Cli {
    /// store path
    #[arg(short, long, default_value = ".revtree", env = "REVTREE_STORE")]
    store: PathBuf,

    /// workspace file holding the live items
    #[arg(short, long, default_value = "workspace.toml", env = "REVTREE_WORKSPACE")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new store
    Init {
        /// join an existing identity (from `export-key` on a peer)
        #[arg(long, requires = "key")]
        public_id: Option<String>,

        /// base64 secret matching --public-id
        #[arg(long, env = "REVTREE_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// show live changes against the head
    Status {
        /// limit to these items
        items: Vec<String>,
    },

    /// record live changes as a new revision
    Commit {
        #[arg(short, long)]
        message: String,

        /// items to commit (default: all)
        items: Vec<String>,
    },

    /// show history from the head back to the root
    Log {
        /// start from this revision instead of the head
        rev: Option<String>,

        #[arg(short = 'n', long)]
        max_count: Option<usize>,
    },

    /// make the workspace match a revision
    Checkout { rev: String },

    /// copy one revision's changes for some items into the workspace
    CherryPick {
        rev: String,

        #[arg(required = true)]
        items: Vec<String>,
    },

    /// discard live changes
    Reset {
        /// items to reset (default: all)
        items: Vec<String>,
    },

    /// fold one item's live changes into the head revision
    Amend { item: String },

    /// point the head elsewhere without touching the workspace
    MoveHead { rev: String },

    /// set live changes aside
    Stash {
        #[arg(short, long, default_value = "stash")]
        message: String,

        /// stash name (default: generated)
        #[arg(long)]
        name: Option<String>,

        /// leave the workspace as it is
        #[arg(long)]
        keep: bool,

        /// items to stash (default: all)
        items: Vec<String>,
    },

    /// apply a stash to the workspace
    StashApply {
        name: String,

        /// keep the stash after applying
        #[arg(long)]
        keep: bool,
    },

    /// delete a stash
    StashDrop { name: String },

    /// list stashes
    StashList {
        /// glob filter
        pattern: Option<String>,
    },

    /// stash everything into the quick slot
    QuickStash,

    /// restore the quick slot
    QuickStashApply,

    /// register a relay directory
    RemoteAdd { name: String, path: PathBuf },

    /// forget a relay
    RemoteRemove { name: String },

    /// list relays
    Remotes,

    /// fetch and merge from a relay
    Pull { remote: Option<String> },

    /// publish the history to a relay
    Push { remote: Option<String> },

    /// pull, merge and push back
    Sync { remote: Option<String> },

    /// print the history fingerprint
    Fingerprint,

    /// print the store's public id
    PublicId,

    /// print the public id and secret a peer needs for `init`
    ExportKey,

    /// forget all history and stashes, keeping the key
    ResetHistory,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn selection(items: Vec<String>) -> Selection {
    if items.is_empty() {
        Selection::All
    } else {
        Selection::items(items)
    }
}

/// a store opened for writing, with its history and the workspace loaded
struct Session {
    store: Store,
    _lock: revtree::StoreLock,
    vc: VersionControl,
    ws: Workspace,
    workspace_path: PathBuf,
}

impl Session {
    fn open(store_path: &Path, workspace_path: &Path) -> revtree::Result<Self> {
        let store = Store::open(store_path)?;
        let lock = store.lock()?;
        let vc = store.load()?;
        let ws = Workspace::load(workspace_path)?;
        Ok(Self {
            store,
            _lock: lock,
            vc,
            ws,
            workspace_path: workspace_path.to_path_buf(),
        })
    }

    fn save(&self) -> revtree::Result<()> {
        self.store.save(&self.vc)?;
        self.ws.save(&self.workspace_path)
    }
}

fn print_report(report: Option<MergeReport>) {
    match report {
        None => println!("relay has no history yet"),
        Some(report) if report.is_up_to_date() => println!("already up to date"),
        Some(report) => {
            println!(
                "imported {} revisions, {} merge nodes, {} rebased",
                report.imported,
                report.merge_nodes.len(),
                report.rebased
            );
            for item in &report.conflicts {
                println!("conflict resolved: {}", item);
            }
        }
    }
}

/// merge from a relay and persist, then optionally push back
///
/// the merge is saved before pushing so a failed push keeps it.
fn pull(
    store: &Path,
    workspace: &Path,
    remote: Option<&str>,
    push_back: bool,
) -> revtree::Result<()> {
    let mut s = Session::open(store, workspace)?;
    let client = s.store.client(remote)?;
    let report = s.vc.merge_with(&mut s.ws, &client, &CancelToken::new())?;
    s.save()?;
    print_report(report);

    if push_back {
        s.vc.push(&client)?;
        println!("pushed {} revisions", s.vc.graph().len());
    }
    Ok(())
}

fn run(cli: Cli) -> revtree::Result<()> {
    match cli.command {
        Commands::Init { public_id, key } => {
            let store = match (public_id, key) {
                (Some(public_id), Some(secret)) => {
                    Store::init_with_key(&cli.store, Key::from_base64(public_id, &secret)?)?
                }
                _ => Store::init(&cli.store)?,
            };
            let vc = store.load()?;
            println!(
                "initialized revtree store at {} ({})",
                cli.store.display(),
                vc.key().public_id()
            );
        }

        Commands::Status { items } => {
            let store = Store::open(&cli.store)?;
            let vc = store.load()?;
            let ws = Workspace::load(&cli.workspace)?;
            for change in vc.status(&ws, &selection(items))? {
                println!("{}", change);
            }
        }

        Commands::Commit { message, items } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let id = s.vc.commit(&s.ws, &selection(items), &message)?;
            s.save()?;
            println!("{}", id);
        }

        Commands::Log { rev, max_count } => {
            let store = Store::open(&cli.store)?;
            let vc = store.load()?;
            let from = rev.map(|r| vc.resolve(&r)).transpose()?;
            for revision in vc.log(from, max_count)? {
                if revision.is_root() {
                    println!("{} (root)", revision.id.short());
                    continue;
                }
                let items: Vec<&str> = revision.deltas.keys().map(|id| id.as_str()).collect();
                println!(
                    "{} {} {} [{}]",
                    revision.id.short(),
                    revision.timestamp,
                    revision.message,
                    items.join(", ")
                );
            }
        }

        Commands::Checkout { rev } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let id = s.vc.resolve(&rev)?;
            s.vc.checkout(&mut s.ws, &id)?;
            s.save()?;
            println!("checked out {}", id.short());
        }

        Commands::CherryPick { rev, items } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let id = s.vc.resolve(&rev)?;
            let items: Vec<_> = items.into_iter().map(revtree::ItemId::from).collect();
            let picked = s.vc.cherry_pick(&mut s.ws, &id, &items)?;
            s.save()?;
            println!("picked {} items from {}", picked.len(), id.short());
        }

        Commands::Reset { items } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let reset = s.vc.reset_changes(&mut s.ws, &selection(items))?;
            s.save()?;
            println!("reset {} items", reset.len());
        }

        Commands::Amend { item } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let id = s.vc.amend(&s.ws, &revtree::ItemId::from(item))?;
            s.save()?;
            println!("{}", id);
        }

        Commands::MoveHead { rev } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let id = s.vc.resolve(&rev)?;
            s.vc.move_head(&id)?;
            s.save()?;
            println!("head at {}", id.short());
        }

        Commands::Stash {
            message,
            name,
            keep,
            items,
        } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let name = s
                .vc
                .stash(&mut s.ws, &selection(items), &message, keep, name.as_deref())?;
            s.save()?;
            println!("stashed as {}", name);
        }

        Commands::StashApply { name, keep } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let items = s.vc.apply_stash(&mut s.ws, StashRef::Name(&name), keep)?;
            s.save()?;
            println!("applied {} ({} items)", name, items.len());
        }

        Commands::StashDrop { name } => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            s.vc.drop_stash(&name)?;
            s.save()?;
            println!("dropped {}", name);
        }

        Commands::StashList { pattern } => {
            let store = Store::open(&cli.store)?;
            let vc = store.load()?;
            let names = match pattern {
                Some(p) => vc.stash_names_matching(&p)?,
                None => vc.stash_names(),
            };
            for name in names {
                println!("{}", name);
            }
            if vc.has_quick_stash() {
                println!("(quick stash present)");
            }
        }

        Commands::QuickStash => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            s.vc.quick_stash_all(&mut s.ws)?;
            s.save()?;
            println!("quick-stashed all changes");
        }

        Commands::QuickStashApply => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            let items = s.vc.apply_quick_stash(&mut s.ws)?;
            s.save()?;
            println!("restored {} items", items.len());
        }

        Commands::RemoteAdd { name, path } => {
            let mut store = Store::open(&cli.store)?;
            let _lock = store.lock()?;
            store.config_mut().add_remote(&name, path)?;
            store.save_config()?;
            println!("added remote {}", name);
        }

        Commands::RemoteRemove { name } => {
            let mut store = Store::open(&cli.store)?;
            let _lock = store.lock()?;
            store.config_mut().remove_remote(&name)?;
            store.save_config()?;
            println!("removed remote {}", name);
        }

        Commands::Remotes => {
            let store = Store::open(&cli.store)?;
            for remote in &store.config().remotes {
                println!("{} {}", remote.name, remote.path.display());
            }
        }

        Commands::Pull { remote } => {
            let push_back = Store::open(&cli.store)?.config().merge.push_after_merge;
            pull(&cli.store, &cli.workspace, remote.as_deref(), push_back)?;
        }

        Commands::Push { remote } => {
            let store = Store::open(&cli.store)?;
            let _lock = store.lock()?;
            let vc = store.load()?;
            vc.push(&store.client(remote.as_deref())?)?;
            println!("pushed {} revisions", vc.graph().len());
        }

        Commands::Sync { remote } => {
            pull(&cli.store, &cli.workspace, remote.as_deref(), true)?;
        }

        Commands::Fingerprint => {
            let store = Store::open(&cli.store)?;
            println!("{}", store.load()?.fingerprint());
        }

        Commands::PublicId => {
            let store = Store::open(&cli.store)?;
            println!("{}", store.load()?.key().public_id());
        }

        Commands::ExportKey => {
            let store = Store::open(&cli.store)?;
            let vc = store.load()?;
            println!("public-id {}", vc.key().public_id());
            println!("key {}", vc.key().secret_base64());
        }

        Commands::ResetHistory => {
            let mut s = Session::open(&cli.store, &cli.workspace)?;
            s.vc.reset();
            s.save()?;
            println!("history reset");
        }
    }

    Ok(())
}
