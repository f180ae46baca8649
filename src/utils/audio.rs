use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Measures the playback length of an audio file in seconds using `ffprobe`.
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Result<f64> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", ffprobe))?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

fn parse_probe_output(stdout: &str) -> Result<f64> {
    let value = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("ffprobe returned no duration"))?;
    let duration: f64 = value
        .parse()
        .with_context(|| format!("Unparseable duration '{}'", value))?;
    if !duration.is_finite() || duration < 0.0 {
        return Err(anyhow!("Invalid duration {}", duration));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        assert_eq!(parse_probe_output("12.345000\n").unwrap(), 12.345);
        assert_eq!(parse_probe_output("\n  3.5  \n").unwrap(), 3.5);
        assert!(parse_probe_output("N/A\n").is_err());
        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("-1.0").is_err());
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_an_error() {
        let result = probe_duration("definitely-not-a-real-ffprobe", Path::new("x.mp3")).await;
        assert!(result.is_err());
    }
}
