/*
Copyright 2024 San Francisco Compute Company

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Target adapter for hosts reached over ssh

use super::common;
use super::process::{run_process, stream_process, ProcessSpec};
use crate::domain::TargetError;
use crate::ports::{CommandOutput, RunOptions, StreamSinks, Target, TargetCommand};
use async_trait::async_trait;
use log::{debug, warn};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Connection settings for a remote target
#[derive(Clone, PartialEq)]
pub struct RemoteConnection {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Private key file; disables password authentication
    pub key: Option<PathBuf>,
    /// ssh password, handed to `sshpass -e` through the environment
    pub password: Option<String>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| "******"))
            .finish()
    }
}

impl RemoteConnection {
    /// Parse `[user@]host[:port]`
    pub fn parse(spec: &str) -> Result<Self, TargetError> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    TargetError::Io(format!("invalid port '{port}' in target '{spec}'"))
                })?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() || user.as_deref() == Some("") {
            return Err(TargetError::Io(format!("invalid target '{spec}'")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            user,
            key: None,
            password: None,
        })
    }

    /// `user@host` or `host`
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// `[user@]host[:port]`, distinct for every distinct connection
    pub fn label(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.destination(), port),
            None => self.destination(),
        }
    }
}

/// A remote host reached with ssh and scp
pub struct RemoteTarget {
    connection: RemoteConnection,
    /// Local directory holding ssh control sockets
    control_dir: PathBuf,
    /// False when `control_dir` could not be created; connections are then never shared
    control_dir_ready: bool,
    module_timeout: Duration,
    temp_dir: Mutex<Option<String>>,
    architecture: OnceCell<String>,
    user_path: OnceCell<String>,
    can_elevate: OnceCell<bool>,
}

impl RemoteTarget {
    /// Create a remote target
    ///
    /// # Arguments
    /// * `connection` - Host, user and credentials
    /// * `control_dir` - Local directory for shared-connection sockets
    /// * `module_timeout` - Timeout for each modprobe call
    pub fn new(connection: RemoteConnection, control_dir: PathBuf, module_timeout: Duration) -> Self {
        // ssh exits instead of falling back when the ControlPath directory is missing
        let control_dir_ready = match std::fs::create_dir_all(&control_dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "cannot create ssh control directory {}, connections to {} will not be shared: {}",
                    control_dir.display(),
                    connection.host,
                    e
                );
                false
            }
        };
        Self {
            connection,
            control_dir,
            control_dir_ready,
            module_timeout,
            temp_dir: Mutex::new(None),
            architecture: OnceCell::new(),
            user_path: OnceCell::new(),
            can_elevate: OnceCell::new(),
        }
    }

    /// Options shared by ssh and scp
    fn common_flags(&self, reuse_connection: bool) -> Vec<String> {
        let mut flags: Vec<String> = [
            "-2",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "GSSAPIAuthentication=no",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=10",
            "-o",
            "LogLevel=ERROR",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(key) = &self.connection.key {
            flags.push("-o".to_string());
            flags.push("PasswordAuthentication=no".to_string());
            flags.push("-i".to_string());
            flags.push(key.display().to_string());
        }
        if self.connection.password.is_none() {
            flags.push("-o".to_string());
            flags.push("BatchMode=yes".to_string());
        }
        if reuse_connection && self.control_dir_ready {
            flags.push("-o".to_string());
            flags.push(format!(
                "ControlPath={}/cm-%C",
                self.control_dir.display()
            ));
            flags.push("-o".to_string());
            flags.push("ControlMaster=auto".to_string());
            flags.push("-o".to_string());
            flags.push("ControlPersist=1m".to_string());
        }
        flags
    }

    /// Prefix with `sshpass -e` when a password is configured
    fn with_password(&self, argv: Vec<String>) -> ProcessSpec {
        match &self.connection.password {
            Some(password) => {
                let mut wrapped = vec!["sshpass".to_string(), "-e".to_string()];
                wrapped.extend(argv);
                ProcessSpec::new(wrapped).env("SSHPASS", password)
            }
            None => ProcessSpec::new(argv),
        }
    }

    fn ssh_spec(&self, command: &TargetCommand, reuse_connection: bool) -> ProcessSpec {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(self.common_flags(reuse_connection));
        if let Some(port) = self.connection.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.push(self.connection.destination());
        // ssh hands the remote shell a single string
        argv.push(
            command
                .argv()
                .iter()
                .map(|arg| shell_escape::unix::escape(Cow::Borrowed(arg.as_str())).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        );
        self.with_password(argv)
    }

    fn scp_spec(&self, local_path: &Path, remote_destination: &str) -> ProcessSpec {
        let mut argv = vec!["scp".to_string()];
        argv.extend(self.common_flags(true));
        if let Some(port) = self.connection.port {
            argv.push("-P".to_string());
            argv.push(port.to_string());
        }
        if local_path.is_dir() {
            argv.push("-r".to_string());
        }
        argv.push(local_path.display().to_string());
        argv.push(format!(
            "{}:{}",
            self.connection.destination(),
            remote_destination
        ));
        self.with_password(argv)
    }

    fn set_temp_dir(&self, dir: Option<String>) {
        if let Ok(mut guard) = self.temp_dir.lock() {
            *guard = dir;
        }
    }
}

#[async_trait]
impl Target for RemoteTarget {
    fn name(&self) -> String {
        self.connection.label()
    }

    fn temp_directory(&self) -> Option<String> {
        self.temp_dir.lock().ok().and_then(|dir| dir.clone())
    }

    async fn create_temp_directory(&self, root: &str) -> Result<String, TargetError> {
        if let Some(dir) = self.temp_directory() {
            return Ok(dir);
        }
        let dir = common::make_temp_directory(self, root).await?;
        debug!("created temp directory {} on {}", dir, self.name());
        self.set_temp_dir(Some(dir.clone()));
        Ok(dir)
    }

    async fn remove_temp_directory(&self) -> Result<(), TargetError> {
        if let Some(dir) = self.temp_directory() {
            common::remove_directory(self, &dir).await?;
            self.set_temp_dir(None);
        }
        Ok(())
    }

    async fn user_path(&self) -> Result<String, TargetError> {
        self.user_path
            .get_or_try_init(|| async {
                common::run_checked(
                    self,
                    &TargetCommand::new("printenv").args(&["PATH"]),
                    common::PROBE_TIMEOUT,
                )
                .await
            })
            .await
            .cloned()
    }

    async fn architecture(&self) -> Result<String, TargetError> {
        self.architecture
            .get_or_try_init(|| common::uname_machine(self))
            .await
            .cloned()
    }

    async fn can_elevate_privileges(&self) -> bool {
        if self.is_super_user() {
            return true;
        }
        *self
            .can_elevate
            .get_or_init(|| common::probe_sudo(self))
            .await
    }

    fn is_super_user(&self) -> bool {
        self.connection.user.as_deref() == Some("root")
    }

    async fn push_file(
        &self,
        local_path: &Path,
        remote_destination: &str,
    ) -> Result<(), TargetError> {
        let output = run_process(
            &self.scp_spec(local_path, remote_destination),
            Some(Duration::from_secs(120)),
            false,
        )
        .await?;
        if !output.success() {
            return Err(TargetError::TransferFailed {
                source_path: local_path.display().to_string(),
                destination: format!("{}:{}", self.connection.destination(), remote_destination),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_command(
        &self,
        command: &TargetCommand,
        options: RunOptions,
    ) -> Result<CommandOutput, TargetError> {
        run_process(
            &self.ssh_spec(command, options.reuse_connection),
            options.timeout,
            options.new_process_group,
        )
        .await
    }

    async fn run_command_stream(
        &self,
        command: &TargetCommand,
        sinks: StreamSinks,
    ) -> Result<(), TargetError> {
        stream_process(&self.ssh_spec(command, false), sinks).await
    }

    async fn install_modules(&self, modules: &[String]) -> Result<Vec<String>, TargetError> {
        common::install_modules(self, modules, self.module_timeout).await
    }

    async fn uninstall_modules(&self, modules: &[String]) -> Result<(), TargetError> {
        common::uninstall_modules(self, modules, self.module_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(spec: &str) -> RemoteTarget {
        RemoteTarget::new(
            RemoteConnection::parse(spec).unwrap(),
            PathBuf::from("/tmp/sr"),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_parse_connection() {
        let conn = RemoteConnection::parse("admin@10.0.0.5:2222").unwrap();
        assert_eq!(conn.user.as_deref(), Some("admin"));
        assert_eq!(conn.host, "10.0.0.5");
        assert_eq!(conn.port, Some(2222));
        assert_eq!(conn.destination(), "admin@10.0.0.5");

        let conn = RemoteConnection::parse("node7").unwrap();
        assert_eq!(conn.user, None);
        assert_eq!(conn.port, None);

        assert!(RemoteConnection::parse("host:notaport").is_err());
        assert!(RemoteConnection::parse("@host").is_err());
        assert!(RemoteConnection::parse("").is_err());
    }

    #[test]
    fn test_ssh_spec_quotes_remote_command() {
        let target = target("admin@node7:2222");
        let spec = target.ssh_spec(
            &TargetCommand::new("bash")
                .args(&["/tmp/dir/controller.sh"])
                .with_sudo_stdin(),
            false,
        );
        assert_eq!(spec.argv[0], "ssh");
        assert!(!spec.argv.iter().any(|a| a.starts_with("ControlMaster")));
        let port = spec.argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(spec.argv[port + 1], "2222");
        assert_eq!(
            spec.argv.last().unwrap(),
            "sudo -S bash /tmp/dir/controller.sh"
        );

        let spec = target.ssh_spec(&TargetCommand::new("echo").args(&["a b", "$HOME"]), true);
        assert_eq!(spec.argv.last().unwrap(), "echo 'a b' '$HOME'");
        assert!(spec.argv.contains(&"ControlMaster=auto".to_string()));
    }

    #[test]
    fn test_scp_spec_and_password() {
        let mut connection = RemoteConnection::parse("root@node7:2200").unwrap();
        connection.password = Some("pw".to_string());
        let target = RemoteTarget::new(connection, PathBuf::from("/tmp/sr"), Duration::from_secs(1));
        assert!(target.is_super_user());

        let spec = target.scp_spec(Path::new("/local/a.sh"), "/tmp/dir");
        assert_eq!(&spec.argv[..3], ["sshpass", "-e", "scp"]);
        assert_eq!(spec.env, vec![("SSHPASS".to_string(), "pw".to_string())]);
        assert!(!spec.argv.contains(&"BatchMode=yes".to_string()));
        let port = spec.argv.iter().position(|a| a == "-P").unwrap();
        assert_eq!(spec.argv[port + 1], "2200");
        assert_eq!(spec.argv.last().unwrap(), "root@node7:/tmp/dir");
    }

    #[test]
    fn test_key_disables_password_auth() {
        let mut connection = RemoteConnection::parse("node7").unwrap();
        connection.key = Some(PathBuf::from("/home/me/.ssh/id_ed25519"));
        let target = RemoteTarget::new(connection, PathBuf::from("/tmp/sr"), Duration::from_secs(1));
        let flags = target.common_flags(false);
        assert!(flags.contains(&"PasswordAuthentication=no".to_string()));
        assert!(flags.contains(&"/home/me/.ssh/id_ed25519".to_string()));
        assert!(flags.contains(&"BatchMode=yes".to_string()));
        assert!(!target.is_super_user());
    }

    #[test]
    fn test_control_directory_created() {
        let scratch = tempfile::TempDir::new().unwrap();
        let control_dir = scratch.path().join("fresh").join("script_runner");
        let target = RemoteTarget::new(
            RemoteConnection::parse("admin@node7").unwrap(),
            control_dir.clone(),
            Duration::from_secs(1),
        );
        assert!(control_dir.is_dir());
        let flags = target.common_flags(true);
        assert!(flags.contains(&format!("ControlPath={}/cm-%C", control_dir.display())));
    }

    #[test]
    fn test_unusable_control_directory_disables_sharing() {
        let scratch = tempfile::TempDir::new().unwrap();
        let blocker = scratch.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let target = RemoteTarget::new(
            RemoteConnection::parse("node7").unwrap(),
            blocker.join("sockets"),
            Duration::from_secs(1),
        );
        let flags = target.common_flags(true);
        assert!(!flags.iter().any(|f| f.starts_with("ControlPath")));
        assert!(!flags.contains(&"ControlMaster=auto".to_string()));
    }

    #[test]
    fn test_names_distinguish_user_and_port() {
        let first = target("admin@node7:22");
        let second = target("root@node7:2222");
        assert_eq!(first.name(), "admin@node7:22");
        assert_eq!(second.name(), "root@node7:2222");
        assert_eq!(target("node7").name(), "node7");
    }

    #[test]
    fn test_scp_directory_is_recursive() {
        let tool = tempfile::TempDir::new().unwrap();
        let target = target("node7");
        let spec = target.scp_spec(tool.path(), "/tmp/dir");
        assert!(spec.argv.contains(&"-r".to_string()));
        let spec = target.scp_spec(Path::new("/local/a.sh"), "/tmp/dir");
        assert!(!spec.argv.contains(&"-r".to_string()));
    }
}
