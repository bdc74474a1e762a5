// Turning the ordered set of segment files into the final output.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::DownloadError;

/// Concatenate the given files, in order, into `output`.
///
/// The ordering is by segment index and is decided by the caller; combiners
/// never reorder. Container-level remuxing is out of scope for the default
/// implementation; [`CommandCombiner`] hands the same ordered list to an
/// external program for callers that need it.
#[async_trait]
pub trait Combiner: Send + Sync {
    async fn combine(
        &self,
        inputs: &[PathBuf],
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), DownloadError>;
}

/// Default combiner: byte-for-byte concatenation, deleting each input after
/// it has been consumed.
pub struct ConcatCombiner {
    remove_inputs: bool,
}

impl ConcatCombiner {
    pub fn new(remove_inputs: bool) -> Self {
        Self { remove_inputs }
    }
}

impl Default for ConcatCombiner {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Combiner for ConcatCombiner {
    async fn combine(
        &self,
        inputs: &[PathBuf],
        _work_dir: &Path,
        output: &Path,
    ) -> Result<(), DownloadError> {
        let mut out = fs::File::create(output)
            .await
            .map_err(|e| DownloadError::io(output, e))?;

        for input in inputs {
            let mut reader = fs::File::open(input)
                .await
                .map_err(|e| DownloadError::io(input, e))?;
            tokio::io::copy(&mut reader, &mut out)
                .await
                .map_err(|e| DownloadError::io(input, e))?;
            drop(reader);
            if self.remove_inputs {
                fs::remove_file(input)
                    .await
                    .map_err(|e| DownloadError::io(input, e))?;
            }
        }

        out.flush().await.map_err(|e| DownloadError::io(output, e))?;
        info!(output = %output.display(), inputs = inputs.len(), "Combined segment files");
        Ok(())
    }
}

/// Combiner that invokes an external program (ffmpeg-style) with the ordered
/// input list followed by the output path, all relative to the work
/// directory's parent process environment.
pub struct CommandCombiner {
    program: String,
    leading_args: Vec<String>,
    remove_inputs: bool,
}

impl CommandCombiner {
    pub fn new(
        program: impl Into<String>,
        leading_args: Vec<String>,
        remove_inputs: bool,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            remove_inputs,
        }
    }
}

#[async_trait]
impl Combiner for CommandCombiner {
    async fn combine(
        &self,
        inputs: &[PathBuf],
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), DownloadError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(inputs)
            .arg(output)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(program = %self.program, inputs = inputs.len(), "Invoking external combiner");
        let result = command
            .output()
            .await
            .map_err(|e| DownloadError::io(&self.program, e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(program = %self.program, status = ?result.status.code(), "External combiner failed");
            return Err(DownloadError::io(
                output,
                std::io::Error::other(format!(
                    "combiner `{}` exited with {}: {}",
                    self.program,
                    result.status,
                    stderr.trim()
                )),
            ));
        }

        if self.remove_inputs {
            for input in inputs {
                fs::remove_file(input)
                    .await
                    .map_err(|e| DownloadError::io(input, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_inputs(dir: &Path, parts: &[&[u8]]) -> Vec<PathBuf> {
        let mut inputs = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let path = dir.join(format!("segment_{}.ts", i + 1));
            fs::write(&path, part).await.expect("write input");
            inputs.push(path);
        }
        inputs
    }

    #[tokio::test]
    async fn concatenates_in_order_and_removes_inputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = write_inputs(dir.path(), &[b"alpha-", b"beta-", b"gamma"]).await;
        let output = dir.path().join("out.ts");

        ConcatCombiner::new(true)
            .combine(&inputs, dir.path(), &output)
            .await
            .expect("combine");

        let combined = fs::read(&output).await.expect("read output");
        assert_eq!(combined, b"alpha-beta-gamma");
        for input in &inputs {
            assert!(!input.exists(), "{} should be deleted", input.display());
        }
    }

    #[tokio::test]
    async fn keeps_inputs_when_asked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = write_inputs(dir.path(), &[b"a", b"b"]).await;
        let output = dir.path().join("out.ts");

        ConcatCombiner::new(false)
            .combine(&inputs, dir.path(), &output)
            .await
            .expect("combine");

        assert_eq!(fs::read(&output).await.expect("read"), b"ab");
        for input in &inputs {
            assert!(input.exists());
        }
    }

    #[tokio::test]
    async fn truncates_a_pre_existing_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = write_inputs(dir.path(), &[b"fresh"]).await;
        let output = dir.path().join("out.ts");
        fs::write(&output, b"stale stale stale stale")
            .await
            .expect("seed output");

        ConcatCombiner::new(true)
            .combine(&inputs, dir.path(), &output)
            .await
            .expect("combine");

        assert_eq!(fs::read(&output).await.expect("read"), b"fresh");
    }

    #[tokio::test]
    async fn missing_input_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = vec![dir.path().join("segment_1.ts")];
        let output = dir.path().join("out.ts");

        let err = ConcatCombiner::new(true)
            .combine(&inputs, dir.path(), &output)
            .await
            .expect_err("must fail");
        assert!(matches!(err, DownloadError::IOFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_combiner_surfaces_nonzero_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inputs = write_inputs(dir.path(), &[b"x"]).await;
        let output = dir.path().join("out.ts");

        let err = CommandCombiner::new("false", Vec::new(), false)
            .combine(&inputs, dir.path(), &output)
            .await
            .expect_err("false(1) must fail the combine");
        assert!(matches!(err, DownloadError::IOFailed { .. }));
        assert!(inputs[0].exists());
    }
}
