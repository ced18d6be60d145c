use std::process::Output;

use tokio::process::Command;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// Renders a command line for logs and error messages.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_joins_program_and_args() {
        let mut command = Command::new("python3");
        command.arg("tools/assemble_video.py").arg("story.json");
        assert_eq!(describe(&command), "python3 tools/assemble_video.py story.json");
    }
}
