//! Reactions to triggered redemptions.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::CoreError;
use crate::config::ReactionConfig;

/// Something done with the viewer's text when the trigger reward is redeemed.
#[async_trait]
pub trait ReactionHandler: fmt::Debug + Send + Sync {
    /// React to `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reaction could not be carried out.
    async fn react(&self, text: &str) -> Result<(), CoreError>;
}

/// Pipes the text into an external speech program.
#[derive(Debug, Clone)]
pub struct SpeechCommand {
    program: String,
    args: Vec<String>,
}

impl SpeechCommand {
    /// Build from `[program, args...]`, or `None` when `command` is empty.
    #[must_use]
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ReactionHandler for SpeechCommand {
    async fn react(&self, text: &str) -> Result<(), CoreError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Other(format!("spawning {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(CoreError::Other(format!("{} exited with {status}", self.program)))
        }
    }
}

/// Logs the text instead of speaking it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReaction;

#[async_trait]
impl ReactionHandler for LogReaction {
    async fn react(&self, text: &str) -> Result<(), CoreError> {
        log::info!("reaction: {text}");
        Ok(())
    }
}

/// The configured reaction: the speech command, or logging when none is set.
#[must_use]
pub fn reaction_for(cfg: &ReactionConfig) -> Box<dyn ReactionHandler> {
    match SpeechCommand::new(&cfg.command) {
        Some(command) => Box::new(command),
        None => {
            log::info!("no reaction command configured, redemptions will only be logged");
            Box::new(LogReaction)
        }
    }
}
