//! Uniform file operations against a local or SSH-reachable target.
//!
//! Everything above this layer goes through [`Endpoint`] and never touches
//! the filesystem or the network directly. Every path-accepting operation
//! requires an absolute path, checked before any I/O is attempted so a bad
//! argument fails structurally instead of as a remote auth error.

pub mod ssh_config;

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rsync::shell_quote;

const DEFAULT_SSH_PORT: u16 = 22;

/// SFTP status code for a missing remote path.
const SFTP_NO_SUCH_FILE: i32 = 2;

fn ensure_absolute(path: &str) -> Result<()> {
    if Path::new(path).is_absolute() {
        Ok(())
    } else {
        Err(Error::InvalidPath(path.to_owned()))
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

struct Remote {
    session: Session,
    sftp: Sftp,
}

impl Remote {
    /// Run a command over the session's command channel and collect its
    /// exit status and stdout.
    fn exec(&self, command: &str) -> Result<(i32, String)> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        channel.wait_close()?;

        Ok((channel.exit_status()?, stdout))
    }
}

enum Backend {
    Local,
    Remote(Remote),
}

/// One local machine or one authenticated SFTP session.
pub struct Endpoint {
    host: Option<String>,
    backend: Backend,
}

impl Endpoint {
    pub fn local() -> Self {
        Self {
            host: None,
            backend: Backend::Local,
        }
    }

    /// Open an authenticated SFTP session to `host`.
    ///
    /// When `ssh_config_file` exists, its `Host` block for `host` overrides
    /// the hostname, port, user and identity defaults.
    pub fn connect(host: &str, ssh_config_file: Option<&Path>) -> Result<Self> {
        let mut cfg = ssh_config::HostConfig::default();
        if let Some(file) = ssh_config_file {
            if file.exists() {
                cfg = ssh_config::lookup(file, host)?;
            }
        }

        let host_name = cfg.host_name.unwrap_or_else(|| host.to_owned());
        let port = cfg.port.unwrap_or(DEFAULT_SSH_PORT);
        let user = cfg
            .user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".into());
        let identity = cfg
            .identity_file
            .unwrap_or_else(|| ssh_config::expand_tilde("~/.ssh/id_rsa"));

        let failed = |reason: String| Error::Connection {
            host: host.to_owned(),
            reason,
        };

        let tcp = TcpStream::connect((host_name.as_str(), port))
            .map_err(|e| failed(e.to_string()))?;

        let mut session = Session::new().map_err(|e| failed(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| failed(e.to_string()))?;

        if identity.exists() {
            session
                .userauth_pubkey_file(&user, None, &identity, None)
                .map_err(|e| failed(e.to_string()))?;
        } else {
            session
                .userauth_agent(&user)
                .map_err(|e| failed(e.to_string()))?;
        }
        if !session.authenticated() {
            return Err(failed("authentication failed".into()));
        }

        let sftp = session.sftp().map_err(|e| failed(e.to_string()))?;

        debug!(host, host_name = %host_name, port, user = %user, "SFTP session established");

        Ok(Self {
            host: Some(host.to_owned()),
            backend: Backend::Remote(Remote { session, sftp }),
        })
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local)
    }

    pub fn is_file(&self, path: &str) -> Result<bool> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(Path::new(path).is_file()),
            Backend::Remote(r) => match r.sftp.stat(Path::new(path)) {
                Ok(stat) => Ok(stat.is_file()),
                Err(e) if is_missing(&e) => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(Path::new(path).is_dir()),
            Backend::Remote(r) => match r.sftp.stat(Path::new(path)) {
                Ok(stat) => Ok(stat.is_dir()),
                Err(e) if is_missing(&e) => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// A missing path reports absence rather than raising, in both modes.
    pub fn exists(&self, path: &str) -> Result<bool> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(Path::new(path).exists()),
            Backend::Remote(r) => match r.sftp.stat(Path::new(path)) {
                Ok(_) => Ok(true),
                Err(e) if is_missing(&e) => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Entry names in the given directory, in directory order.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => {
                let mut names = Vec::new();
                for entry in fs::read_dir(path)? {
                    names.push(entry?.file_name().to_string_lossy().into_owned());
                }
                Ok(names)
            }
            Backend::Remote(r) => {
                let entries = r.sftp.readdir(Path::new(path))?;
                Ok(entries
                    .into_iter()
                    .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .collect())
            }
        }
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::create_dir(path)?),
            Backend::Remote(r) => Ok(r.sftp.mkdir(Path::new(path), 0o755)?),
        }
    }

    /// Create a directory and any missing parents.
    pub fn make_dirs(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::create_dir_all(path)?),
            Backend::Remote(_) => {
                let mut current = PathBuf::from("/");
                for part in Path::new(path).components().skip(1) {
                    current.push(part);
                    let current = current.to_string_lossy();
                    if !self.exists(&current)? {
                        self.mkdir(&current)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Create an empty file, leaving an existing one untouched.
    pub fn touch(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => {
                fs::OpenOptions::new().create(true).append(true).open(path)?;
                Ok(())
            }
            Backend::Remote(r) => {
                r.sftp.open_mode(
                    Path::new(path),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
                    0o644,
                    OpenType::File,
                )?;
                Ok(())
            }
        }
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::read(path)?),
            Backend::Remote(r) => {
                let mut file = r.sftp.open(Path::new(path))?;
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::write(path, data)?),
            Backend::Remote(r) => {
                let mut file = r.sftp.create(Path::new(path))?;
                file.write_all(data)?;
                Ok(())
            }
        }
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::remove_file(path)?),
            Backend::Remote(r) => Ok(r.sftp.unlink(Path::new(path))?),
        }
    }

    /// Remove an empty directory.
    pub fn remove_dir(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::remove_dir(path)?),
            Backend::Remote(r) => Ok(r.sftp.rmdir(Path::new(path))?),
        }
    }

    /// Remove an entire directory tree.
    ///
    /// Remote removal runs `rm -rf` over the command channel: deleting a
    /// large tree file-by-file over SFTP costs one round trip per entry and
    /// is prohibitively slow.
    pub fn remove_tree(&self, path: &str) -> Result<()> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => Ok(fs::remove_dir_all(path)?),
            Backend::Remote(r) => {
                let (code, _) = r.exec(&format!("rm -rf {}", shell_quote(path)))?;
                if code != 0 {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::Other,
                        format!("rm -rf exited with {code}"),
                    )));
                }
                Ok(())
            }
        }
    }

    /// Total size of the file or directory tree at `path`, in bytes.
    pub fn calculate_size(&self, path: &str) -> Result<u64> {
        ensure_absolute(path)?;
        match &self.backend {
            Backend::Local => dir_size(Path::new(path)),
            Backend::Remote(r) => {
                let (code, out) = r.exec(&format!("du -s {}", shell_quote(path)))?;
                if code != 0 {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::Other,
                        format!("du exited with {code}"),
                    )));
                }
                let kib: u64 = out
                    .split('\t')
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| {
                        Error::Io(std::io::Error::new(
                            ErrorKind::InvalidData,
                            format!("unparsable du output: {out:?}"),
                        ))
                    })?;
                Ok(kib * 1024)
            }
        }
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
    host: Option<String>,
    ssh_config_file: Option<PathBuf>,
}

impl EndpointKey {
    fn new(host: Option<&str>, ssh_config_file: Option<&Path>) -> Self {
        Self {
            host: host.filter(|h| !h.is_empty()).map(str::to_owned),
            ssh_config_file: ssh_config_file.map(Path::to_path_buf),
        }
    }
}

/// Owns one [`Endpoint`] per distinct connection parameter set.
///
/// Owned by the caller (the CLI entry point) and passed by reference into
/// the backup layer. Closing an entry evicts it and drops the underlying
/// session.
#[derive(Default)]
pub struct EndpointPool {
    entries: HashMap<EndpointKey, Arc<Endpoint>>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &mut self,
        host: Option<&str>,
        ssh_config_file: Option<&Path>,
    ) -> Result<Arc<Endpoint>> {
        let key = EndpointKey::new(host, ssh_config_file);
        if let Some(endpoint) = self.entries.get(&key) {
            return Ok(Arc::clone(endpoint));
        }

        let endpoint = Arc::new(match &key.host {
            Some(host) => Endpoint::connect(host, ssh_config_file)?,
            None => Endpoint::local(),
        });
        self.entries.insert(key, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    pub fn close(&mut self, host: Option<&str>, ssh_config_file: Option<&Path>) {
        self.entries.remove(&EndpointKey::new(host, ssh_config_file));
    }

    pub fn close_all(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_in(dir: &Path) -> (Endpoint, String) {
        (Endpoint::local(), dir.to_string_lossy().into_owned())
    }

    #[test]
    fn relative_paths_are_rejected_before_io() {
        let io = Endpoint::local();
        for result in [
            io.exists("relative/path").err(),
            io.is_file("relative").err(),
            io.is_dir("relative").err(),
            io.list_dir("relative").err(),
            io.mkdir("relative").err(),
            io.make_dirs("relative").err(),
            io.touch("relative").err(),
            io.read("relative").err(),
            io.write("relative", b"x").err(),
            io.remove_file("relative").err(),
            io.remove_dir("relative").err(),
            io.remove_tree("relative").err(),
            io.calculate_size("relative").err(),
        ] {
            assert!(matches!(result, Some(Error::InvalidPath(_))));
        }
    }

    #[test]
    fn file_and_dir_predicates() {
        let tmp = tempfile::tempdir().unwrap();
        let (io, root) = local_in(tmp.path());

        let file = format!("{root}/a.file");
        io.touch(&file).unwrap();

        assert!(io.exists(&file).unwrap());
        assert!(io.is_file(&file).unwrap());
        assert!(!io.is_dir(&file).unwrap());
        assert!(io.is_dir(&root).unwrap());
        assert!(!io.exists(&format!("{root}/missing")).unwrap());
    }

    #[test]
    fn make_dirs_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let (io, root) = local_in(tmp.path());

        io.make_dirs(&format!("{root}/a/b/c")).unwrap();
        assert!(io.is_dir(&format!("{root}/a/b/c")).unwrap());
        // Idempotent on an existing chain.
        io.make_dirs(&format!("{root}/a/b/c")).unwrap();

        io.touch(&format!("{root}/a/x")).unwrap();
        let mut names = io.list_dir(&format!("{root}/a")).unwrap();
        names.sort();
        assert_eq!(names, vec!["b".to_owned(), "x".to_owned()]);
    }

    #[test]
    fn read_write_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let (io, root) = local_in(tmp.path());

        let path = format!("{root}/data.json");
        io.write(&path, b"{\"valid\": true}").unwrap();
        assert_eq!(io.read(&path).unwrap(), b"{\"valid\": true}");
    }

    #[test]
    fn removal_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let (io, root) = local_in(tmp.path());

        let file = format!("{root}/f");
        io.touch(&file).unwrap();
        io.remove_file(&file).unwrap();
        assert!(!io.exists(&file).unwrap());

        let empty = format!("{root}/empty");
        io.mkdir(&empty).unwrap();
        io.remove_dir(&empty).unwrap();
        assert!(!io.exists(&empty).unwrap());

        let tree = format!("{root}/tree");
        io.make_dirs(&format!("{tree}/deep/deeper")).unwrap();
        io.touch(&format!("{tree}/deep/file")).unwrap();
        io.remove_tree(&tree).unwrap();
        assert!(!io.exists(&tree).unwrap());
    }

    #[test]
    fn size_of_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let (io, root) = local_in(tmp.path());

        io.make_dirs(&format!("{root}/t/sub")).unwrap();
        io.write(&format!("{root}/t/a"), &[0u8; 100]).unwrap();
        io.write(&format!("{root}/t/sub/b"), &[0u8; 28]).unwrap();

        assert_eq!(io.calculate_size(&format!("{root}/t")).unwrap(), 128);
    }

    #[test]
    fn pool_reuses_local_endpoint() {
        let mut pool = EndpointPool::new();
        let a = pool.get(None, None).unwrap();
        let b = pool.get(None, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // An empty host string means local as well.
        let c = pool.get(Some(""), None).unwrap();
        assert!(Arc::ptr_eq(&a, &c));

        pool.close(None, None);
        let d = pool.get(None, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
    }
}
