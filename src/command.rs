//! Build command assembly

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

use crate::config::WebhookConfig;

const PRIVILEGE_SWITCH: &str = "sudo";

/// A build invocation as a discrete argument vector. Never joined into a shell string.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl BuildCommand {
    /// `bin build [--repository-url URL] json webroot`, wrapped in a privilege
    /// switch when a build user is configured.
    ///
    /// `sudo -i` starts the command in the build user's home directory, so the
    /// three paths are made absolute against our working directory in that case.
    pub fn new(config: &WebhookConfig, repository_url: Option<&str>) -> Self {
        let user = config.user.as_deref();
        let path_arg = |path: &Path| match user {
            Some(_) => absolute(path),
            None => path.as_os_str().to_owned(),
        };

        let mut args: Vec<OsString> = vec!["build".into()];
        if let Some(url) = repository_url {
            args.push("--repository-url".into());
            args.push(url.into());
        }
        args.push(path_arg(config.json.as_path()));
        args.push(path_arg(config.webroot.as_path()));

        let command = Self {
            program: path_arg(config.bin.as_path()),
            args,
        };
        match user {
            Some(user) => command.run_as(user),
            None => command,
        }
    }

    /// `sudo -u <user> -i -- <inner argv...>`. The inner command stays a list of
    /// separate arguments so sudo escapes each one for the login shell.
    pub fn run_as(self, user: &str) -> Self {
        let mut args: Vec<OsString> = vec![
            "-u".into(),
            user.into(),
            "-i".into(),
            "--".into(),
            self.program,
        ];
        args.extend(self.args);
        Self {
            program: PRIVILEGE_SWITCH.into(),
            args,
        }
    }

    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Human-readable form for logs only.
    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timed-out build can be stopped with everything it spawned.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

fn absolute(path: &Path) -> OsString {
    match std::path::absolute(path) {
        Ok(path) => path.into_os_string(),
        Err(e) => {
            warn!("Could not make {:?} absolute: {}", path, e);
            path.as_os_str().to_owned()
        }
    }
}
