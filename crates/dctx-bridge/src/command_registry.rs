use ahash::AHashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("command disabled: {0}")]
    Disabled(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

// ---------------------------------------------------------------------------
// CommandContext — execution context passed to every command handler
// ---------------------------------------------------------------------------

/// Contextual information available to every command during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContext {
    /// Which surface triggered this command (TUI, web, CLI, API, etc.)
    pub source: CommandSource,
    /// The raw arguments string passed to the command.
    pub args: String,
    /// Key-value parameters parsed from the args.
    pub params: AHashMap<String, serde_json::Value>,
}

impl CommandContext {
    pub fn new(source: CommandSource, args: impl Into<String>) -> Self {
        Self {
            source,
            args: args.into(),
            params: AHashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Get a string parameter by key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Get a u64 parameter by key.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    /// Get a bool parameter by key.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

// ---------------------------------------------------------------------------
// CommandSource — where the command was triggered from
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Tui,
    Web,
    Cli,
    Api,
    Keybinding,
    Plugin,
    Internal,
}

impl std::fmt::Display for CommandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSource::Tui => write!(f, "tui"),
            CommandSource::Web => write!(f, "web"),
            CommandSource::Cli => write!(f, "cli"),
            CommandSource::Api => write!(f, "api"),
            CommandSource::Keybinding => write!(f, "keybinding"),
            CommandSource::Plugin => write!(f, "plugin"),
            CommandSource::Internal => write!(f, "internal"),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandResult — what a command returns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl CommandOutput {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn ok_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandHandler trait — what command implementations provide
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Execute the command with the given context.
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// CommandDescriptor — metadata about a registered command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Unique command name (e.g., "bead.create", "agent.stop").
    pub name: String,
    /// Human-readable title for display in palettes.
    pub title: String,
    /// Short description for help text.
    pub description: String,
    /// Category for grouping in the command palette.
    pub category: CommandCategory,
    /// Keyboard shortcut (if any).
    pub keybinding: Option<String>,
    /// Which surfaces this command is available from.
    pub available_from: Vec<CommandSource>,
    /// Whether the command is currently enabled.
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    /// session.start/save/load/break/resume/end
    Session,
    /// task.assess/task.implement
    Task,
    /// stats and other operational commands
    System,
}

impl std::fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandCategory::Session => write!(f, "Session"),
            CommandCategory::Task => write!(f, "Task"),
            CommandCategory::System => write!(f, "System"),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandEntry — descriptor + handler stored together
// ---------------------------------------------------------------------------

struct CommandEntry {
    descriptor: CommandDescriptor,
    handler: Arc<dyn CommandHandler>,
}

// ---------------------------------------------------------------------------
// CommandRegistry — the central dispatch table
// ---------------------------------------------------------------------------

/// A unified command registry inspired by Lapce's command system.
///
/// All actions in auto-tundra — whether triggered from TUI keybindings,
/// the web dashboard, CLI, or API — are registered as named commands.
/// This gives us:
/// - A command palette (fuzzy search over all commands)
/// - Keybinding support (map keys to command names)
/// - Surface-agnostic execution (same command works from TUI, web, CLI)
/// - Discoverability (list all available commands with descriptions)
pub struct CommandRegistry {
    commands: AHashMap<String, CommandEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: AHashMap::new(),
        }
    }

    /// Register a command with its descriptor and handler.
    pub fn register(&mut self, descriptor: CommandDescriptor, handler: Arc<dyn CommandHandler>) {
        let name = descriptor.name.clone();
        self.commands.insert(
            name,
            CommandEntry {
                descriptor,
                handler,
            },
        );
    }

    /// Execute a command by name.
    pub async fn execute(&self, name: &str, ctx: CommandContext) -> Result<CommandOutput> {
        let entry = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;

        if !entry.descriptor.enabled {
            return Err(CommandError::Disabled(name.to_string()));
        }

        if !entry.descriptor.available_from.is_empty()
            && !entry.descriptor.available_from.contains(&ctx.source)
        {
            return Err(CommandError::PermissionDenied(format!(
                "'{}' not available from {}",
                name, ctx.source,
            )));
        }

        entry.handler.execute(ctx).await
    }

    /// Get descriptor for a command by name.
    pub fn get_descriptor(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name).map(|e| &e.descriptor)
    }

    /// List all registered command descriptors.
    pub fn list(&self) -> Vec<&CommandDescriptor> {
        self.commands.values().map(|e| &e.descriptor).collect()
    }

    /// List commands in a specific category.
    pub fn by_category(&self, category: CommandCategory) -> Vec<&CommandDescriptor> {
        self.commands
            .values()
            .filter(|e| e.descriptor.category == category)
            .map(|e| &e.descriptor)
            .collect()
    }

    /// Fuzzy search commands by name or title for command palette.
    pub fn search(&self, query: &str) -> Vec<&CommandDescriptor> {
        let q = query.to_lowercase();
        let mut matches: Vec<(&CommandDescriptor, usize)> = self
            .commands
            .values()
            .filter_map(|e| {
                let name_match = e.descriptor.name.to_lowercase().contains(&q);
                let title_match = e.descriptor.title.to_lowercase().contains(&q);
                let desc_match = e.descriptor.description.to_lowercase().contains(&q);

                if name_match {
                    Some((&e.descriptor, 0)) // best match
                } else if title_match {
                    Some((&e.descriptor, 1))
                } else if desc_match {
                    Some((&e.descriptor, 2))
                } else {
                    None
                }
            })
            .collect();

        matches.sort_by_key(|(_, score)| *score);
        matches.into_iter().map(|(d, _)| d).collect()
    }

    /// Find the command bound to a keybinding.
    pub fn by_keybinding(&self, keybinding: &str) -> Option<&CommandDescriptor> {
        self.commands
            .values()
            .find(|e| e.descriptor.keybinding.as_deref() == Some(keybinding))
            .map(|e| &e.descriptor)
    }

    /// Filter commands available from a specific source.
    pub fn available_from(&self, source: CommandSource) -> Vec<&CommandDescriptor> {
        self.commands
            .values()
            .filter(|e| {
                e.descriptor.available_from.is_empty()
                    || e.descriptor.available_from.contains(&source)
            })
            .map(|e| &e.descriptor)
            .collect()
    }

    /// Enable or disable a command by name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        if let Some(entry) = self.commands.get_mut(name) {
            entry.descriptor.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Total number of registered commands.
    pub fn count(&self) -> usize {
        self.commands.len()
    }

    /// Check if a command is registered.
    pub fn has(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FnCommandHandler — wrap a closure as a command handler
// ---------------------------------------------------------------------------

/// Wraps an async function as a CommandHandler for simple commands.
pub struct FnCommandHandler<F>
where
    F: Fn(
            CommandContext,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CommandOutput>> + Send>>
        + Send
        + Sync
        + 'static,
{
    f: F,
}

impl<F> FnCommandHandler<F>
where
    F: Fn(
            CommandContext,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CommandOutput>> + Send>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> CommandHandler for FnCommandHandler<F>
where
    F: Fn(
            CommandContext,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CommandOutput>> + Send>>
        + Send
        + Sync
        + 'static,
{
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        (self.f)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
