//! Deferred export collaborator
//!
//! Items that need transcoding are enqueued with an [`ExportHandle`] and only
//! materialized by the resumable transport right before their transfer starts.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::item::ExportHandle;

/// Resolves export handles into files ready for transfer
///
/// `output` is a staging artifact reserved by the caller, who owns it and
/// deletes it once the transfer ends or is cancelled. The exporter overwrites it.
#[async_trait]
pub trait ItemExporter: Send + Sync {
    /// Extension of the files this exporter produces, without the dot
    fn output_extension(&self) -> &str {
        "bin"
    }

    async fn export(&self, handle: &ExportHandle, output: &Path) -> Result<()>;
}

/// Exporter for pipelines that never see deferred items
pub struct NoExporter;

#[async_trait]
impl ItemExporter for NoExporter {
    async fn export(&self, handle: &ExportHandle, _output: &Path) -> Result<()> {
        Err(anyhow!("no exporter configured for {}", handle.id))
    }
}

/// Runs an external command to produce the exported file
///
/// `{input}` and `{output}` in the argument template are replaced with the
/// handle's location and the destination path. The command is executed
/// directly, not through a shell.
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
    output_extension: String,
}

impl CommandExporter {
    /// Parse a whitespace separated command template, e.g.
    /// `ffmpeg -y -i {input} -c:v libx264 {output}`
    pub fn parse(template: &str, output_extension: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(|s| s.to_string());
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("export command cannot be empty"))?;
        let args: Vec<String> = parts.collect();

        if !args.iter().any(|a| a.contains("{output}")) {
            return Err(anyhow!("export command must reference {{output}}"));
        }

        Ok(Self {
            program,
            args,
            output_extension: output_extension.trim_start_matches('.').to_string(),
        })
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

#[async_trait]
impl ItemExporter for CommandExporter {
    fn output_extension(&self) -> &str {
        &self.output_extension
    }

    async fn export(&self, handle: &ExportHandle, output: &Path) -> Result<()> {
        let input = handle
            .location
            .as_deref()
            .ok_or_else(|| anyhow!("export handle {} has no source location", handle.id))?;

        let args = self.render_args(input, output);
        debug!("Running export: {} {:?}", self.program, args);

        // Dropping this future (cancel_all) kills the child
        let result = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.program))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            ));
        }

        let written = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if written == 0 {
            return Err(anyhow!("{} produced no output", self.program));
        }

        info!("Exported {} -> {}", handle.id, output.display());
        Ok(())
    }
}
