use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineHandle};
use crate::imap::TcpConnector;

/// imap-probe - drive the IMAP task engine against a real server
#[derive(Parser)]
#[command(name = "imap-probe")]
#[command(about = "Run IMAP tasks against a server and report what happened")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(long, global = true, default_value = "imap-probe.toml")]
    pub config: PathBuf,

    /// Dry run mode (don't make changes)
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Count the messages in one or more mailboxes, concurrently
    Count(CountArgs),

    /// List the children of a mailbox
    List(ListArgs),

    /// Select a mailbox and show its status
    Select(SelectArgs),

    /// Create a mailbox
    Create(CreateArgs),

    /// Delete a mailbox
    Delete(DeleteArgs),

    /// Rename or move a mailbox
    Rename(RenameArgs),

    /// Validate and show the configuration
    CheckConfig,
}

#[derive(Args)]
pub struct CountArgs {
    /// Mailbox paths
    #[arg(default_value = "INBOX")]
    pub mailboxes: Vec<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Parent mailbox path; the top level when omitted
    #[arg(default_value = "")]
    pub parent: String,

    /// Print the whole known tree afterwards
    #[arg(long)]
    pub tree: bool,
}

#[derive(Args)]
pub struct SelectArgs {
    /// Mailbox path
    pub mailbox: String,

    /// Use EXAMINE instead of SELECT
    #[arg(long)]
    pub read_only: bool,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Parent mailbox path; the top level when empty
    #[arg(long, default_value = "")]
    pub parent: String,

    /// Name of the new mailbox
    pub name: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Mailbox path
    pub mailbox: String,
}

#[derive(Args)]
pub struct RenameArgs {
    /// Mailbox path
    pub mailbox: String,

    /// New name, without the parent's path
    pub name: String,

    /// New parent path (empty for the top level); the current parent when omitted
    #[arg(long)]
    pub parent: Option<String>,
}

/// Command-line interface handler
pub struct CliHandler {
    config: EngineConfig,
}

impl CliHandler {
    pub fn new(config_path: &Path) -> Result<Self> {
        let config = EngineConfig::load(config_path)
            .map_err(|e| anyhow!("Cannot use {}: {}", config_path.display(), e))?;
        Ok(Self { config })
    }

    /// Handle CLI commands
    pub async fn handle_command(&self, command: Commands, dry_run: bool) -> Result<()> {
        match command {
            Commands::CheckConfig => self.handle_check_config(),
            command => {
                let engine = Engine::spawn(
                    &self.config,
                    Arc::new(TcpConnector::new(self.config.server.clone())),
                );
                let result = self.run(&engine, command, dry_run).await;
                engine.shutdown().await?;
                result
            }
        }
    }

    async fn run(&self, engine: &EngineHandle, command: Commands, dry_run: bool) -> Result<()> {
        match command {
            Commands::Count(args) => self.handle_count(engine, args).await,
            Commands::List(args) => self.handle_list(engine, args).await,
            Commands::Select(args) => self.handle_select(engine, args).await,
            Commands::Create(args) => self.handle_create(engine, args, dry_run).await,
            Commands::Delete(args) => self.handle_delete(engine, args, dry_run).await,
            Commands::Rename(args) => self.handle_rename(engine, args, dry_run).await,
            Commands::CheckConfig => self.handle_check_config(),
        }
    }

    fn handle_check_config(&self) -> Result<()> {
        let server = &self.config.server;
        println!("✅ Configuration is valid");
        println!("   Server: {} (TLS: {})", server.address(), server.use_tls);
        println!("   User: {} ({:?})", server.username, server.auth);
        println!("   Keep-alive: {}s", self.config.engine.keepalive_seconds);
        println!(
            "   Connect attempts: {}",
            self.config.engine.retry.max_attempts
        );
        Ok(())
    }

    async fn handle_count(&self, engine: &EngineHandle, args: CountArgs) -> Result<()> {
        engine.connect().await?.wait().await?;

        let counts = join_all(args.mailboxes.iter().map(|path| async move {
            let mailbox = engine.locate(path).await?;
            let node_path = engine
                .tree()
                .resolve(mailbox)
                .map(|node| node.path().to_string())
                .unwrap_or_else(|| path.clone());
            engine
                .message_count(&node_path)
                .await
                .map(|count| (node_path, count))
        }))
        .await;

        let mut failures = 0;
        for (path, result) in args.mailboxes.iter().zip(counts) {
            match result {
                Ok((path, count)) => println!("📬 {:<30} {:>8}", path, count),
                Err(e) => {
                    failures += 1;
                    eprintln!("❌ {}: {}", path, e);
                }
            }
        }
        if failures > 0 {
            return Err(anyhow!("{} of {} mailboxes failed", failures, args.mailboxes.len()));
        }
        Ok(())
    }

    async fn handle_list(&self, engine: &EngineHandle, args: ListArgs) -> Result<()> {
        if !args.parent.is_empty() {
            engine.locate(&args.parent).await?;
        }
        let children = engine.list_children(&args.parent).await?;
        let tree = engine.tree();

        let title = if args.parent.is_empty() {
            "top level"
        } else {
            args.parent.as_str()
        };
        println!("📂 Mailboxes under {} ({}):", title, children.len());
        for child in children {
            if let Some(node) = tree.resolve(child) {
                let marker = if node.is_selectable() { " " } else { "*" };
                println!("  {}{}", marker, node.path());
            }
        }

        if args.tree {
            println!("\n🌳 Known tree:");
            for (depth, mailbox) in tree.walk() {
                if let Some(node) = tree.resolve(mailbox) {
                    if !node.is_root() {
                        println!("{}{}", "  ".repeat(depth), node.name());
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_select(&self, engine: &EngineHandle, args: SelectArgs) -> Result<()> {
        engine.locate(&args.mailbox).await?;
        let status = engine.select(&args.mailbox, args.read_only).await?;
        let verb = if args.read_only { "Examined" } else { "Selected" };
        println!("✅ {} {}", verb, args.mailbox);
        println!("   Messages: {}", display(status.messages));
        println!("   Recent: {}", display(status.recent));
        println!("   First unseen: {}", display(status.first_unseen));
        println!("   UIDVALIDITY: {}", display(status.uid_validity));
        println!("   UIDNEXT: {}", display(status.uid_next));
        Ok(())
    }

    async fn handle_create(&self, engine: &EngineHandle, args: CreateArgs, dry_run: bool) -> Result<()> {
        if !args.parent.is_empty() {
            engine.locate(&args.parent).await?;
        }
        if dry_run {
            println!("🔍 Would create {} under {:?}", args.name, args.parent);
            return Ok(());
        }
        let created = engine.create_mailbox(&args.parent, &args.name).await?;
        let path = engine
            .tree()
            .resolve(created)
            .map(|node| node.path().to_string())
            .unwrap_or_default();
        println!("✅ Created {}", path);
        Ok(())
    }

    async fn handle_delete(&self, engine: &EngineHandle, args: DeleteArgs, dry_run: bool) -> Result<()> {
        engine.locate(&args.mailbox).await?;
        if dry_run {
            println!("🔍 Would delete {}", args.mailbox);
            return Ok(());
        }
        engine.delete_mailbox(&args.mailbox).await?;
        println!("🗑️  Deleted {}", args.mailbox);
        Ok(())
    }

    async fn handle_rename(&self, engine: &EngineHandle, args: RenameArgs, dry_run: bool) -> Result<()> {
        let mailbox = engine.locate(&args.mailbox).await?;
        let parent = match args.parent {
            Some(parent) => {
                if !parent.is_empty() {
                    engine.locate(&parent).await?;
                }
                parent
            }
            None => {
                let tree = engine.tree();
                tree.resolve(mailbox)
                    .and_then(|node| node.parent())
                    .and_then(|parent| tree.resolve(parent))
                    .map(|parent| parent.path().to_string())
                    .unwrap_or_default()
            }
        };
        if dry_run {
            println!("🔍 Would rename {} to {} under {:?}", args.mailbox, args.name, parent);
            return Ok(());
        }
        let renamed = engine.rename_mailbox(&args.mailbox, &parent, &args.name).await?;
        let path = engine
            .tree()
            .resolve(renamed)
            .map(|node| node.path().to_string())
            .unwrap_or_default();
        println!("✅ Renamed {} to {}", args.mailbox, path);
        Ok(())
    }
}

fn display(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
