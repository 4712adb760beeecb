use tokio::process::Command;

/// Captured result of one scheduler tool invocation.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub(crate) code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl ToolOutput {
    pub(crate) fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// One-line description for error details: exit code plus whichever
    /// stream has content.
    pub(crate) fn describe(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.code {
            Some(code) => format!("exit {code}: {text}"),
            None => format!("killed by signal: {text}"),
        }
    }
}

/// Spawn a scheduler CLI and capture its output. Every call is a fresh
/// process; there is no pool.
pub(crate) async fn run_tool(program: &str, args: &[String]) -> std::io::Result<ToolOutput> {
    let output = Command::new(program).args(args).output().await?;
    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
