//! Subcommand implementations.

use tokio::io::AsyncWriteExt as _;

use crate::prelude::*;

pub mod process;
pub mod schema;

/// Write `contents` to `path`, or to standard output when no path is given.
async fn write_output(path: Option<&Path>, contents: &str) -> Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write {:?}", path)),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(contents.as_bytes())
                .await
                .context("failed to write to stdout")?;
            stdout.flush().await.context("failed to flush stdout")
        }
    }
}
