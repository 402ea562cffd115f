//! Process spawn specifications.
//!
//! A [`SpawnSpec`] describes everything needed to start a session process:
//! program, arguments, environment, working directory and initial terminal
//! size. It is built from configuration and handed to
//! [`PtyProcess::spawn`](super::pty::PtyProcess::spawn).

use std::path::PathBuf;

use uuid::Uuid;

use crate::config::{ContainerConfig, SessionBackend, SessionConfig};

use super::pty::Dimensions;

/// Terminal type advertised to spawned processes.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Fallback PATH when the gateway itself runs without one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Prefix of the names given to session containers.
pub const CONTAINER_NAME_PREFIX: &str = "termgate-";

/// The container a session process runs in.
///
/// The gateway only owns the runtime client; the container itself has to
/// be removed through the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    /// Runtime binary used to start and remove the container.
    pub runtime: String,
    /// Container name, unique per session.
    pub name: String,
}

/// Description of a process to run inside a pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Program to execute.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Full environment of the child; nothing else is inherited.
    pub env: Vec<(String, String)>,
    /// Working directory, if any.
    pub cwd: Option<PathBuf>,
    /// Initial terminal size.
    pub dimensions: Dimensions,
    /// Set when the process is a container runtime client.
    pub container: Option<ContainerTarget>,
}

fn container_name(instance: Uuid) -> String {
    format!("{CONTAINER_NAME_PREFIX}{}", instance.simple())
}

impl SpawnSpec {
    /// A shell running directly on the gateway host.
    pub fn local_shell(shell: impl Into<String>, dimensions: Dimensions) -> Self {
        let shell = shell.into();
        Self {
            env: base_env(&shell),
            command: shell,
            args: Vec::new(),
            cwd: None,
            dimensions,
            container: None,
        }
    }

    /// An interpreter inside a throwaway, resource-capped container.
    ///
    /// The container gets a fresh name; use [`SpawnSpec::for_instance`] to
    /// give each session its own.
    pub fn container(container: &ContainerConfig, dimensions: Dimensions) -> Self {
        let name = container_name(Uuid::new_v4());
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "-t".to_string(),
            "--name".to_string(),
            name.clone(),
            "--cpus".to_string(),
            container.cpus.clone(),
            "--memory".to_string(),
            container.memory.clone(),
            "--pids-limit".to_string(),
            container.pids_limit.to_string(),
            "--network".to_string(),
            container.network.clone(),
            "-e".to_string(),
            format!("TERM={DEFAULT_TERM}"),
            container.image.clone(),
            container.command.clone(),
        ];
        args.extend(container.args.iter().cloned());

        Self {
            env: base_env(&container.command),
            command: container.runtime.clone(),
            args,
            cwd: None,
            dimensions,
            container: Some(ContainerTarget {
                runtime: container.runtime.clone(),
                name,
            }),
        }
    }

    /// Builds the spec for new sessions from configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        let dimensions = Dimensions::new(config.rows, config.cols);

        let mut spec = match config.backend {
            SessionBackend::Local => {
                let mut spec = Self::local_shell(config.shell.clone(), dimensions);
                spec.args = config.shell_args.clone();
                spec.cwd = config.cwd.clone();
                spec
            }
            SessionBackend::Container => Self::container(&config.container, dimensions),
        };

        for (key, value) in &config.env {
            spec.set_env(key, value);
        }

        spec
    }

    /// Sets or replaces an environment variable.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
    }

    /// Looks up an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the spec for one session instance.
    ///
    /// Container specs get a name derived from `instance`, so the
    /// container can be found and removed when that session ends.
    pub fn for_instance(&self, instance: Uuid) -> Self {
        let mut spec = self.clone();
        if let Some(target) = spec.container.as_mut() {
            let name = container_name(instance);
            if let Some(pos) = spec.args.iter().position(|arg| arg == "--name") {
                if let Some(slot) = spec.args.get_mut(pos + 1) {
                    *slot = name.clone();
                }
            }
            target.name = name;
        }
        spec
    }

    /// Returns a copy with a different initial size.
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }
}

/// The minimum environment every session gets.
fn base_env(shell: &str) -> Vec<(String, String)> {
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "/".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string());
    let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

    vec![
        ("TERM".to_string(), DEFAULT_TERM.to_string()),
        ("PATH".to_string(), path),
        ("HOME".to_string(), home),
        ("USER".to_string(), user),
        ("SHELL".to_string(), shell.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_shell_has_required_env() {
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());

        assert_eq!(spec.command, "/bin/sh");
        assert!(spec.args.is_empty());
        for key in ["TERM", "PATH", "HOME", "USER", "SHELL"] {
            assert!(spec.env_var(key).is_some(), "missing {key}");
        }
        assert_eq!(spec.env_var("TERM"), Some(DEFAULT_TERM));
        assert_eq!(spec.env_var("SHELL"), Some("/bin/sh"));
    }

    #[test]
    fn test_set_env_replaces() {
        let mut spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        spec.set_env("TERM", "dumb");
        spec.set_env("EXTRA", "1");

        assert_eq!(spec.env_var("TERM"), Some("dumb"));
        assert_eq!(spec.env_var("EXTRA"), Some("1"));
        assert_eq!(spec.env.iter().filter(|(k, _)| k == "TERM").count(), 1);
    }

    #[test]
    fn test_container_command_line() {
        let container = ContainerConfig::default();
        let spec = SpawnSpec::container(&container, Dimensions::new(30, 100));

        assert_eq!(spec.command, "docker");
        assert_eq!(&spec.args[..4], &["run", "--rm", "-i", "-t"]);
        assert_eq!(spec.args[4], "--name");
        assert!(spec.args[5].starts_with(CONTAINER_NAME_PREFIX));

        let target = spec.container.as_ref().unwrap();
        assert_eq!(target.runtime, "docker");
        assert_eq!(target.name, spec.args[5]);

        let joined = spec.args.join(" ");
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--memory 256m"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.contains("--network none"));
        assert!(joined.ends_with("python:3.12-slim python3"));
        assert_eq!(spec.dimensions, Dimensions::new(30, 100));
    }

    #[test]
    fn test_for_instance_names_container() {
        let spec = SpawnSpec::container(&ContainerConfig::default(), Dimensions::default());
        let instance = Uuid::new_v4();

        let named = spec.for_instance(instance);
        let expected = format!("{CONTAINER_NAME_PREFIX}{}", instance.simple());

        assert_eq!(named.container.as_ref().unwrap().name, expected);
        assert_eq!(named.args.iter().filter(|arg| **arg == expected).count(), 1);
        assert_eq!(named.args.iter().filter(|arg| *arg == "--name").count(), 1);
        assert_ne!(spec.for_instance(Uuid::new_v4()).args, named.args);
    }

    #[test]
    fn test_for_instance_keeps_local_shell() {
        let spec = SpawnSpec::local_shell("/bin/sh", Dimensions::default());
        assert_eq!(spec.for_instance(Uuid::new_v4()), spec);
        assert!(spec.container.is_none());
    }

    #[test]
    fn test_container_extra_args() {
        let container = ContainerConfig {
            args: vec!["-q".to_string()],
            ..ContainerConfig::default()
        };
        let spec = SpawnSpec::container(&container, Dimensions::default());
        assert_eq!(spec.args.last().map(String::as_str), Some("-q"));
    }

    #[test]
    fn test_from_config_local() {
        let mut config = SessionConfig::default();
        config.shell = "/bin/sh".to_string();
        config.shell_args = vec!["-i".to_string()];
        config.cwd = Some(PathBuf::from("/tmp"));
        config.rows = 50;
        config.cols = 160;
        config.env.insert("LANG".to_string(), "C.UTF-8".to_string());

        let spec = SpawnSpec::from_config(&config);

        assert_eq!(spec.command, "/bin/sh");
        assert_eq!(spec.args, vec!["-i"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.dimensions, Dimensions::new(50, 160));
        assert_eq!(spec.env_var("LANG"), Some("C.UTF-8"));
    }

    #[test]
    fn test_from_config_container() {
        let mut config = SessionConfig::default();
        config.backend = SessionBackend::Container;
        config.container.runtime = "podman".to_string();

        let spec = SpawnSpec::from_config(&config);
        assert_eq!(spec.command, "podman");
        assert!(spec.cwd.is_none());
    }
}
