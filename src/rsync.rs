//! Invocation of the external rsync binary.
//!
//! Builds a shell command line from the configured options and user-supplied
//! include/exclude patterns, runs it, streams its output to the logger and
//! classifies the exit code into a [`Status`].

use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::error::{Error, Result};

/// A local or remote path handed to rsync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPath {
    pub path: String,
    pub host: Option<String>,
}

impl SyncPath {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: None,
        }
    }

    pub fn new(path: impl Into<String>, host: Option<&str>) -> Self {
        Self {
            path: path.into(),
            host: host.filter(|h| !h.is_empty()).map(str::to_owned),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host.as_deref().map_or(true, str::is_empty)
    }

    /// The on-wire form rsync expects: `path` when local, `host:path`
    /// otherwise.
    pub fn resolved(&self) -> String {
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => format!("{}:{}", host, self.path),
            _ => self.path.clone(),
        }
    }
}

impl fmt::Display for SyncPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolved())
    }
}

/// Exit status of a concluded rsync process.
///
/// Only codes from the known table can be constructed; anything else fails
/// with [`Error::InvalidExitCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    exit_code: i32,
}

impl Status {
    pub fn new(exit_code: i32) -> Result<Self> {
        if message_for(exit_code).is_none() {
            return Err(Error::InvalidExitCode(exit_code));
        }
        Ok(Self { exit_code })
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn message(&self) -> &'static str {
        // The constructor rejects unknown codes.
        message_for(self.exit_code).unwrap_or("Unknown")
    }

    /// Whether the transfer can be considered a completed sync. Partial
    /// transfers caused by vanished source files or per-file errors count
    /// as complete.
    pub fn is_complete(&self) -> bool {
        matches!(self.exit_code, 0 | 23 | 24)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// All currently known rsync exit codes, plus 255 for a failed ssh tunnel.
fn message_for(code: i32) -> Option<&'static str> {
    Some(match code {
        0 => "Success",
        1 => "Syntax or usage error",
        2 => "Protocol incompatibility",
        3 => "Errors selecting input/output files, dirs",
        4 => "Requested action not supported",
        5 => "Error starting client-server protocol",
        6 => "Daemon unable to append to log-file",
        10 => "Error in socket I/O",
        11 => "Error in file I/O",
        12 => "Error in rsync protocol data stream",
        13 => "Errors with program diagnostics",
        14 => "Error in IPC code",
        20 => "Received SIGUSR1 or SIGINT",
        21 => "Some error returned by waitpid()",
        22 => "Error allocating core memory buffers",
        23 => "Partial transfer due to error",
        24 => "Partial transfer due to vanished source files",
        25 => "The --max-delete limit stopped deletions",
        30 => "Timeout in data send/receive",
        35 => "Timeout waiting for daemon connection",
        255 => "The underlying connection failed",
        _ => return None,
    })
}

/// Backslash-escape every character outside a small whitelist.
///
/// `*` is deliberately left untouched so user-supplied glob patterns keep
/// working; generic shell quoting would escape the wildcard as well and
/// break pattern support.
pub fn escape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        if !c.is_ascii_alphanumeric() && !",._+:@%/-*\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Quote a token so a POSIX shell treats it as one word.
pub fn shell_quote(token: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c);
    if !token.is_empty() && token.chars().all(safe) {
        return token.to_owned();
    }
    format!("'{}'", token.replace('\'', "'\"'\"'"))
}

/// Drives the external rsync binary.
///
/// Option fields mirror the `[rsync]` section of the config file. At most
/// one invocation may be in flight per instance; a second concurrent call
/// fails with [`Error::AlreadyRunning`].
#[derive(Debug)]
pub struct Rsync {
    pub rsync_bin: String,
    pub ssh_bin: String,
    pub ssh_config_file: Option<PathBuf>,
    pub acls: bool,
    pub xattrs: bool,
    pub prune_empty_dirs: bool,
    pub out_format: Option<String>,
    running: AtomicBool,
}

impl Default for Rsync {
    fn default() -> Self {
        Self {
            rsync_bin: "/usr/bin/rsync".into(),
            ssh_bin: "/usr/bin/ssh".into(),
            ssh_config_file: None,
            acls: true,
            xattrs: true,
            prune_empty_dirs: true,
            out_format: Some("%t %i %n".into()),
            running: AtomicBool::new(false),
        }
    }
}

impl Rsync {
    fn base_cmd(&self, dry_run: bool) -> Vec<String> {
        let mut cmd = vec![self.rsync_bin.clone()];

        // Flag position is a contract: consumers key off "--dry-run" being
        // the first flag after the binary name.
        if dry_run {
            cmd.push("--dry-run".into());
        }

        cmd.extend(
            [
                "--archive",
                "--relative",
                "--human-readable",
                "--stats",
                "--verbose",
            ]
            .map(String::from),
        );

        if let Some(fmt) = &self.out_format {
            cmd.push("--out-format".into());
            cmd.push(shell_quote(fmt));
        }

        if self.acls {
            cmd.push("--acls".into());
        }
        if self.xattrs {
            cmd.push("--xattrs".into());
        }
        if self.prune_empty_dirs {
            cmd.push("--prune-empty-dirs".into());
        }

        cmd
    }

    fn ssh_cmd(&self) -> Vec<String> {
        let mut cmd = vec![
            self.ssh_bin.clone(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "NumberOfPasswordPrompts=0".into(),
        ];

        if let Some(file) = &self.ssh_config_file {
            if file.exists() {
                cmd.push("-F".into());
                cmd.push(shell_quote(&file.to_string_lossy()));
            }
        }

        cmd
    }

    /// Assemble the full shell command line for one transfer.
    pub fn build_command(
        &self,
        target: &SyncPath,
        includes: &[SyncPath],
        excludes: &[String],
        link_dest: Option<&str>,
        dry_run: bool,
    ) -> String {
        let mut cmd = self.base_cmd(dry_run);

        // Tunnel over the same session configuration the IO layer uses.
        if !target.is_local() {
            cmd.push("-e".into());
            cmd.push(shell_quote(&self.ssh_cmd().join(" ")));
        }

        if let Some(link_dest) = link_dest {
            cmd.push("--delete".into());
            cmd.push(format!("--link-dest={}", shell_quote(link_dest)));
        }

        for include in includes {
            cmd.push(escape(&include.resolved()));
        }
        for exclude in excludes {
            cmd.push("--exclude".into());
            cmd.push(shell_quote(exclude));
        }

        cmd.push(target.resolved());

        // Expand include patterns from a fixed working directory.
        format!("cd /; {}", cmd.join(" "))
    }

    /// Synchronize `includes` to `target`, hardlinking unchanged files
    /// against `link_dest` when given.
    pub fn sync(
        &self,
        target: &SyncPath,
        includes: &[SyncPath],
        excludes: &[String],
        link_dest: Option<&str>,
        dry_run: bool,
    ) -> Result<Status> {
        let command = self.build_command(target, includes, excludes, link_dest, dry_run);
        let exit_code = self.exec(&command)?;
        Status::new(exit_code)
    }

    /// Run `command` through the shell, streaming its output line by line.
    /// The exit code is only reported after the process has exited and its
    /// pipes are drained.
    fn exec(&self, command: &str) -> Result<i32> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        info!("Executing rsync:");
        info!("{command}");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_thread = child.stderr.take().map(|err| {
            std::thread::spawn(move || {
                for line in BufReader::new(err).lines().map_while(|l| l.ok()) {
                    warn!("{line}");
                }
            })
        });

        if let Some(out) = child.stdout.take() {
            for line in BufReader::new(out).lines() {
                let line = line?;
                info!("{}", line.trim_matches('"'));
            }
        }

        if let Some(handle) = stderr_thread {
            let _ = handle.join();
        }

        let status = child.wait()?;
        // A process killed by a signal reports no code; map it onto the
        // interrupted entry of the table.
        Ok(status.code().unwrap_or(20))
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_path_local() {
        assert!(SyncPath::local("/tmp").is_local());
        assert!(SyncPath::new("/tmp", None).is_local());
        assert!(SyncPath::new("/tmp", Some("")).is_local());
        assert!(!SyncPath::new("/tmp", Some("localhost")).is_local());
    }

    #[test]
    fn sync_path_resolved() {
        assert_eq!(SyncPath::local("/tmp").resolved(), "/tmp");
        assert_eq!(
            SyncPath::new("/tmp", Some("localhost")).resolved(),
            "localhost:/tmp"
        );
    }

    #[test]
    fn status_known_code() {
        let status = Status::new(0).unwrap();
        assert_eq!(status.exit_code(), 0);
        assert_eq!(status.message(), "Success");
    }

    #[test]
    fn status_unknown_code() {
        assert!(matches!(
            Status::new(-999),
            Err(Error::InvalidExitCode(-999))
        ));
        assert!(matches!(Status::new(7), Err(Error::InvalidExitCode(7))));
    }

    #[test]
    fn status_complete_set() {
        for code in [0, 23, 24] {
            assert!(Status::new(code).unwrap().is_complete(), "code {code}");
        }
        for code in [1, 11, 20, 30, 255] {
            assert!(!Status::new(code).unwrap().is_complete(), "code {code}");
        }
        assert!(!Status::new(23).unwrap().is_success());
    }

    #[test]
    fn escape_neutralizes_spaces() {
        assert_eq!(escape("simple folder"), "simple\\ folder");
        assert_eq!(escape("it's"), "it\\'s");
    }

    #[test]
    fn escape_keeps_wildcards() {
        assert_eq!(escape("*"), "*");
        assert_eq!(escape("/home/*/.cache"), "/home/*/.cache");
    }

    #[test]
    fn escape_special_characters() {
        assert_eq!(
            escape("!\"#$&'()*+,-./:;<=>?@[]^_`{|}~"),
            "\\!\\\"\\#\\$\\&\\'\\(\\)*+,-./:\\;\\<\\=\\>\\?@\\[\\]\\^_\\`\\{\\|\\}\\~"
        );
    }

    #[test]
    fn shell_quote_plain_token() {
        assert_eq!(shell_quote("/backup-target"), "/backup-target");
        assert_eq!(shell_quote("%t %i %n"), "'%t %i %n'");
        assert_eq!(shell_quote("a'b"), "'a'\"'\"'b'");
    }

    #[test]
    fn command_default_options() {
        let sync = Rsync::default();
        let cmd = sync.build_command(&SyncPath::local("/"), &[], &[], None, true);

        assert!(cmd.contains("--acls"));
        assert!(cmd.contains("--xattrs"));
        assert!(cmd.contains("--prune-empty-dirs"));
        assert!(cmd.contains("--out-format '%t %i %n'"));
        assert!(cmd.contains("--dry-run"));
    }

    #[test]
    fn command_modified_options() {
        let mut sync = Rsync::default();
        sync.acls = false;
        sync.xattrs = false;
        sync.prune_empty_dirs = false;
        sync.out_format = Some("%t %i %f %''b".into());

        let cmd = sync.build_command(&SyncPath::local("/"), &[], &[], None, false);

        assert!(!cmd.contains("--acls"));
        assert!(!cmd.contains("--xattrs"));
        assert!(!cmd.contains("--prune-empty-dirs"));
        assert!(cmd.contains(&format!("--out-format {}", shell_quote("%t %i %f %''b"))));
        assert!(!cmd.contains("--dry-run"));
    }

    #[test]
    fn command_dry_run_is_first_flag() {
        let sync = Rsync::default();
        let cmd = sync.build_command(&SyncPath::local("/"), &[], &[], None, true);
        assert!(cmd.starts_with("cd /; /usr/bin/rsync --dry-run --archive"));
    }

    #[test]
    fn command_target_local() {
        let sync = Rsync::default();
        let cmd = sync.build_command(&SyncPath::local("/backup-target"), &[], &[], None, false);
        assert!(cmd.ends_with(" /backup-target"));
        assert!(!cmd.contains(" -e "));
    }

    #[test]
    fn command_target_remote() {
        let sync = Rsync::default();
        let target = SyncPath::new("/backup-target", Some("localhost"));
        let cmd = sync.build_command(&target, &[], &[], None, false);
        assert!(cmd.ends_with(" localhost:/backup-target"));
        assert!(cmd.contains(" -e "));
        assert!(cmd.contains("StrictHostKeyChecking=no"));
        assert!(cmd.contains("NumberOfPasswordPrompts=0"));
    }

    #[test]
    fn command_includes_are_escaped() {
        let sync = Rsync::default();
        let includes = vec![
            SyncPath::local("/simple.file"),
            SyncPath::local("/simple folder"),
            SyncPath::local("/special * folder"),
            SyncPath::local("/pattern/*.log"),
        ];
        let cmd = sync.build_command(&SyncPath::local("/dst"), &includes, &[], None, false);

        assert!(cmd.contains(" /simple.file "));
        assert!(cmd.contains(" /simple\\ folder "));
        assert!(cmd.contains(" /special\\ *\\ folder "));
        assert!(cmd.contains(" /pattern/*.log "));
    }

    #[test]
    fn command_excludes_are_quoted() {
        let sync = Rsync::default();
        let excludes = vec!["/home/*/.cache".to_owned(), "simple folder".to_owned()];
        let cmd = sync.build_command(&SyncPath::local("/dst"), &[], &excludes, None, false);

        assert!(cmd.contains("--exclude '/home/*/.cache'"));
        assert!(cmd.contains("--exclude 'simple folder'"));
    }

    #[test]
    fn command_link_dest() {
        let sync = Rsync::default();
        let cmd = sync.build_command(
            &SyncPath::local("/dst"),
            &[],
            &[],
            Some("/backups/20240101000000/data"),
            false,
        );
        assert!(cmd.contains("--delete"));
        assert!(cmd.contains("--link-dest=/backups/20240101000000/data"));
    }

    #[test]
    fn command_without_link_dest_does_not_delete() {
        let sync = Rsync::default();
        let cmd = sync.build_command(&SyncPath::local("/dst"), &[], &[], None, false);
        assert!(!cmd.contains("--delete"));
        assert!(!cmd.contains("--link-dest"));
    }

    #[test]
    fn exec_rejects_concurrent_invocation() {
        let sync = Rsync::default();
        sync.running.store(true, Ordering::SeqCst);
        let result = sync.sync(&SyncPath::local("/dst"), &[], &[], None, true);
        assert!(matches!(result, Err(Error::AlreadyRunning)));
    }
}
