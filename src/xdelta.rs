//! Subprocess wrapper around the external `xdelta3` binary.
//!
//! Grounded on the original's `XDelta3Impl.run_command` (`subprocess.check_output`
//! with `stderr=STDOUT`, printing `"XDELTA FAIL:"` with the captured output
//! before re-raising) and `encode`/`decode` (fixed arg vectors: `-f -e [-s
//! old] new target` / `-f -d [-s old] patch target`).

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::error::DirPatchError;

/// Resolved relative to the current working directory, matching the
/// original's fixed `lib/xdelta3` layout. Overridable via
/// `XDIRPATCH_XDELTA3` for deployments that vendor the binary elsewhere.
fn binary_path() -> String {
    std::env::var("XDIRPATCH_XDELTA3").unwrap_or_else(|_| "lib/xdelta3".to_string())
}

/// Encode a binary delta from `old` (may be absent, for new files) to `new`,
/// writing the result to `target`.
pub fn encode(old: Option<&Utf8Path>, new: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let mut args = vec!["-f", "-e"];
    if let Some(old) = old {
        args.push("-s");
        args.push(old.as_str());
    }
    args.push(new.as_str());
    args.push(target.as_str());
    run(&args)
}

/// Apply `patch` against `old` (may be absent), writing the reconstructed
/// file to `target`.
pub fn decode(old: Option<&Utf8Path>, patch: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let mut args = vec!["-f", "-d"];
    if let Some(old) = old {
        args.push("-s");
        args.push(old.as_str());
    }
    args.push(patch.as_str());
    args.push(target.as_str());
    run(&args)
}

fn run(args: &[&str]) -> Result<()> {
    let bin = binary_path();
    let output = Command::new(&bin)
        .args(args)
        .output()
        .with_context(|| format!("spawning {bin} {}", args.join(" ")))?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let status = output.status.code().unwrap_or(-1);
        tracing::error!(status, output = %combined, "xdelta3 failed");
        return Err(DirPatchError::CodecFailure {
            status,
            output: combined,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagates_codec_failure_for_nonexistent_binary_input() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let missing = root.join("does-not-exist");
        let target = root.join("out");

        // No xdelta3 binary is guaranteed present in a test sandbox, and no
        // input file exists either; either failure mode should surface as
        // our typed error rather than panicking.
        let result = encode(None, &missing, &target);
        if let Err(err) = result {
            assert!(
                err.downcast_ref::<DirPatchError>().is_some()
                    || err.to_string().contains("spawning")
            );
        }
    }
}
