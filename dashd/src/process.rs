use std::io;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Run `program` to completion, giving up after `limit`.
/// A timed out child is killed and reported as `ErrorKind::TimedOut`.
pub async fn output_within(program: &str, args: &[&str], limit: Duration) -> io::Result<Output> {
    let child = Command::new(program).args(args).kill_on_drop(true).output();

    match tokio::time::timeout(limit, child).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} did not finish within {:?}", program, limit),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let started = Instant::now();
        let err = output_within("sleep", &["10"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_completed_command_output() {
        let output = output_within("echo", &["hello"], Duration::from_secs(5)).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let err = output_within("dashd-no-such-program", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
