//! `tar` + `zstd` subprocesses around the transfer engine.
//!
//! Compression writes into the pipeline's spill file; extraction reads the
//! download stream on stdin. Both are opaque: their output is captured for
//! logs and error messages, never interpreted.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::Stream;
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tonic::Status;

use crate::errors::{ErrorKind, TransferError, TransferResult};
use crate::generated::ReadResponse;
use crate::pipeline::ProducerCommand;
use crate::remote::KvReader;

/// Archives `sources` (absolute paths preserved) and compresses the tar stream
/// into `spill`. Any failing stage fails the command.
pub fn compress_command(sources: &[PathBuf], spill: &Path) -> ProducerCommand {
    let paths = sources
        .iter()
        .map(|path| shell_quote(&path.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!(
        "tar -cPf - {} | zstd -q -T0 > {}",
        paths,
        shell_quote(&spill.to_string_lossy())
    );
    ProducerCommand::new("bash")
        .arg("-o")
        .arg("pipefail")
        .arg("-c")
        .arg(script)
}

/// Decompresses stdin and unpacks it, restoring absolute paths and permissions.
pub fn extract_command() -> Command {
    let mut command = Command::new("bash");
    command
        .arg("-o")
        .arg("pipefail")
        .arg("-c")
        .arg("zstd -q -d -c | tar -xPpf -");
    command
}

/// Streams the whole of `reader` into `command`'s stdin and waits for it.
///
/// A cache miss on the download side is reported as such even though the
/// command will also fail on its empty input.
pub async fn extract_from<S>(reader: &mut KvReader<S>, mut command: Command) -> TransferResult<u64>
where
    S: Stream<Item = Result<ReadResponse, Status>> + Unpin,
{
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|err| TransferError::local_io("starting extract command", err))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransferError::new(ErrorKind::LocalIo, "extract command has no stdin"))?;
    let output = tokio::spawn(collect_output(child.stdout.take(), child.stderr.take()));

    let copied = reader.copy_to(&mut stdin).await;
    drop(stdin);

    let status = child
        .wait()
        .await
        .map_err(|err| TransferError::local_io("waiting for extract command", err))?;
    let output = output.await.unwrap_or_default();

    match copied {
        Err(err) if err.is_cache_miss() => Err(err),
        _ if !status.success() => {
            debug!("extract output: {output}");
            Err(TransferError::new(
                ErrorKind::LocalIo,
                format!("extract command exited with {}: {}", status, output.trim()),
            ))
        }
        Err(err) => Err(err),
        Ok(bytes) => {
            debug!("extract complete. Output: {output}");
            Ok(bytes)
        }
    }
}

async fn collect_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> String {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let read_out = async {
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut out).await;
        }
    };
    let read_err = async {
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut err).await;
        }
    };
    tokio::join!(read_out, read_err);

    let mut combined = String::from_utf8_lossy(&out).into_owned();
    combined.push_str(&String::from_utf8_lossy(&err));
    combined
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    type Frames = stream::Iter<std::vec::IntoIter<Result<ReadResponse, Status>>>;

    fn reader(items: Vec<Result<ReadResponse, Status>>) -> KvReader<Frames> {
        KvReader::new("kv/main-archive-stream", stream::iter(items))
    }

    fn frame(data: &str) -> Result<ReadResponse, Status> {
        Ok(ReadResponse {
            data: data.as_bytes().to_vec(),
        })
    }

    #[test]
    fn compress_command_quotes_every_path() {
        let cmd = compress_command(
            &[PathBuf::from("/tmp/derived data"), PathBuf::from("/tmp/it's")],
            Path::new("/tmp/spill.tzst"),
        );
        assert_eq!(cmd.program(), "bash");
        let script = cmd.args().last().unwrap();
        assert_eq!(
            script,
            r"tar -cPf - '/tmp/derived data' '/tmp/it'\''s' | zstd -q -T0 > '/tmp/spill.tzst'"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extract_feeds_the_download_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!("cat > '{}'", out.display()));

        let mut reader = reader(vec![frame("compressed "), frame("bytes")]);
        let copied = extract_from(&mut reader, command).await.unwrap();
        assert_eq!(copied, 16);
        assert_eq!(std::fs::read(&out).unwrap(), b"compressed bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_surfaces_its_output() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("cat > /dev/null; echo 'tar: bad header' >&2; exit 2");

        let mut reader = reader(vec![frame("garbage")]);
        let err = extract_from(&mut reader, command).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LocalIo);
        assert!(err.message.contains("bad header"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cache_miss_wins_over_command_failure() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("cat > /dev/null; exit 1");

        let mut reader = reader(vec![Err(Status::not_found("no such blob"))]);
        let err = extract_from(&mut reader, command).await.unwrap_err();
        assert!(err.is_cache_miss());
    }
}
