//! Privileged filesystem operations.
//!
//! With application-uid separation enabled, installed files are owned
//! by per-package users, so removing or re-owning them needs elevated
//! rights. The core only talks to the [`SystemHelper`] trait; the
//! embedder picks an implementation at startup:
//!
//! - [`DirectHelper`] executes the operations in-process (fine when the
//!   process already runs with sufficient rights),
//! - [`HelperClient`] forwards them over a socket-pair to a helper
//!   process running a [`HelperServer`],
//! - [`DeniedHelper`] refuses them (no helper available).

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Filesystem operations that may require elevated privileges.
pub trait SystemHelper: Send + Sync {
    /// Recursively removes a file or directory tree.
    fn remove_recursive(&self, path: &Path) -> Result<()>;

    /// Recursively changes owner, group and permission bits.
    ///
    /// Directories additionally get an execute bit for every read bit
    /// in `mode`, so they stay traversable.
    fn set_owner_and_permissions_recursive(
        &self,
        path: &Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()>;
}

/// Removes `path` recursively, coping with read-only subdirectories.
pub fn remove_path_recursive(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io_context(format!("cannot stat {}", path.display()), e)),
    };

    if !meta.is_dir() {
        return fs::remove_file(path)
            .map_err(|e| Error::io_context(format!("cannot remove {}", path.display()), e));
    }

    // a read-only subdirectory makes remove_dir_all fail on unix; give
    // ourselves rwx on every directory first
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
            if entry.file_type().is_dir() {
                let mode = entry.metadata().map(|m| m.permissions().mode()).unwrap_or(0);
                if mode & 0o700 != 0o700 {
                    let _ = fs::set_permissions(
                        entry.path(),
                        fs::Permissions::from_mode(mode | 0o700),
                    );
                }
            }
        }
    }

    fs::remove_dir_all(path)
        .map_err(|e| Error::io_context(format!("cannot remove {}", path.display()), e))
}

/// Executes the privileged operations in the current process.
#[derive(Debug, Default)]
pub struct DirectHelper;

impl SystemHelper for DirectHelper {
    fn remove_recursive(&self, path: &Path) -> Result<()> {
        remove_path_recursive(path)
    }

    #[cfg(unix)]
    fn set_owner_and_permissions_recursive(
        &self,
        path: &Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let apply = |p: &Path, is_dir: bool| -> Result<()> {
            let c_path = CString::new(p.as_os_str().as_bytes())
                .map_err(|_| Error::Filesystem(format!("path contains NUL: {}", p.display())))?;

            let mut m = mode;
            if is_dir {
                // set the x bit for directories, but only where it makes sense
                if m & 0o6 != 0 {
                    m |= 0o1;
                }
                if m & 0o60 != 0 {
                    m |= 0o10;
                }
                if m & 0o600 != 0 {
                    m |= 0o100;
                }
            }

            // SAFETY: c_path is a valid NUL-terminated path
            let rc = unsafe { libc::chmod(c_path.as_ptr(), m as libc::mode_t) };
            if rc != 0 {
                return Err(Error::Filesystem(format!(
                    "cannot change mode of {} to {:o}: {}",
                    p.display(),
                    m,
                    std::io::Error::last_os_error()
                )));
            }
            let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
            if rc != 0 {
                return Err(Error::Filesystem(format!(
                    "cannot change owner of {} to {uid}:{gid}: {}",
                    p.display(),
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        };

        // children first, so restrictive directory modes do not lock us out
        for entry in walkdir::WalkDir::new(path).contents_first(true) {
            let entry = entry.map_err(|e| Error::Filesystem(e.to_string()))?;
            apply(entry.path(), entry.file_type().is_dir())?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_owner_and_permissions_recursive(
        &self,
        _path: &Path,
        _uid: u32,
        _gid: u32,
        _mode: u32,
    ) -> Result<()> {
        Err(Error::Filesystem(
            "ownership changes are not supported on this platform".into(),
        ))
    }
}

/// Fallback used when no privileged helper is available: every
/// operation is refused.
#[derive(Debug, Default)]
pub struct DeniedHelper;

impl SystemHelper for DeniedHelper {
    fn remove_recursive(&self, path: &Path) -> Result<()> {
        Err(Error::Filesystem(format!(
            "cannot remove {}: no privileged helper available",
            path.display()
        )))
    }

    fn set_owner_and_permissions_recursive(
        &self,
        path: &Path,
        _uid: u32,
        _gid: u32,
        _mode: u32,
    ) -> Result<()> {
        Err(Error::Filesystem(format!(
            "cannot change ownership of {}: no privileged helper available",
            path.display()
        )))
    }
}

#[cfg(unix)]
pub use remote::{HelperClient, HelperServer};

#[cfg(unix)]
mod remote {
    //! Request/reply forwarding to a helper process.
    //!
    //! Framing, both directions: a 4-byte tag (`RQST`/`RPLY`), a
    //! length-prefixed error string, a length-prefixed payload blob
    //! (both lengths big-endian u32). Requests encode an opcode byte
    //! followed by the operation parameters; replies carry an empty
    //! payload and report failure through the error string.

    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use super::SystemHelper;
    use crate::error::{Error, Result};

    const TAG_REQUEST: &[u8; 4] = b"RQST";
    const TAG_REPLY: &[u8; 4] = b"RPLY";

    const OP_REMOVE_RECURSIVE: u8 = 1;
    const OP_SET_OWNER_AND_PERMISSIONS: u8 = 2;

    fn send_message(
        socket: &mut UnixStream,
        tag: &[u8; 4],
        error: &str,
        payload: &[u8],
    ) -> std::io::Result<()> {
        socket.write_all(tag)?;
        socket.write_all(&(error.len() as u32).to_be_bytes())?;
        socket.write_all(error.as_bytes())?;
        socket.write_all(&(payload.len() as u32).to_be_bytes())?;
        socket.write_all(payload)?;
        socket.flush()
    }

    fn receive_message(
        socket: &mut UnixStream,
        expected_tag: &[u8; 4],
    ) -> std::io::Result<(String, Vec<u8>)> {
        let mut tag = [0u8; 4];
        socket.read_exact(&mut tag)?;
        if &tag != expected_tag {
            return Err(std::io::Error::other("unexpected message tag"));
        }

        let mut len = [0u8; 4];
        socket.read_exact(&mut len)?;
        let mut error = vec![0u8; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut error)?;
        socket.read_exact(&mut len)?;
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut payload)?;

        let error = String::from_utf8(error)
            .map_err(|_| std::io::Error::other("error string is not UTF-8"))?;
        Ok((error, payload))
    }

    fn encode_path(out: &mut Vec<u8>, path: &Path) {
        use std::os::unix::ffi::OsStrExt;
        let bytes = path.as_os_str().as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }

    fn decode_u32(data: &[u8], pos: &mut usize) -> std::io::Result<u32> {
        let bytes: [u8; 4] = data
            .get(*pos..*pos + 4)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| std::io::Error::other("truncated request"))?;
        *pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    fn decode_path(data: &[u8], pos: &mut usize) -> std::io::Result<PathBuf> {
        use std::os::unix::ffi::OsStrExt;
        let len = decode_u32(data, pos)? as usize;
        let bytes = data
            .get(*pos..*pos + len)
            .ok_or_else(|| std::io::Error::other("truncated request"))?;
        *pos += len;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
    }

    /// Client half living in the package manager process.
    ///
    /// A single mutex serializes in-flight requests; the helper handles
    /// one request at a time.
    pub struct HelperClient {
        socket: Mutex<UnixStream>,
    }

    impl HelperClient {
        pub fn new(socket: UnixStream) -> Self {
            Self {
                socket: Mutex::new(socket),
            }
        }

        /// Spawns an in-process helper thread connected through a
        /// socket-pair. Useful for tests and single-process setups; a
        /// production deployment runs [`HelperServer`] in a separate,
        /// privileged process instead.
        pub fn spawn_in_process(inner: Arc<dyn SystemHelper>) -> Result<Self> {
            let (client, server) = UnixStream::pair()
                .map_err(|e| Error::io_context("cannot create helper socket pair", e))?;
            std::thread::spawn(move || HelperServer::new(server, inner).run());
            Ok(Self::new(client))
        }

        fn call(&self, payload: &[u8]) -> Result<Vec<u8>> {
            let mut socket = self
                .socket
                .lock()
                .map_err(|_| Error::Internal("helper client mutex poisoned".into()))?;

            send_message(&mut socket, TAG_REQUEST, "", payload)
                .map_err(|e| Error::Filesystem(format!("cannot send to helper process: {e}")))?;
            let (error, reply) = receive_message(&mut socket, TAG_REPLY)
                .map_err(|e| Error::Filesystem(format!("no reply from helper process: {e}")))?;

            if error.is_empty() {
                Ok(reply)
            } else {
                Err(Error::Filesystem(error))
            }
        }
    }

    impl SystemHelper for HelperClient {
        fn remove_recursive(&self, path: &Path) -> Result<()> {
            let mut payload = vec![OP_REMOVE_RECURSIVE];
            encode_path(&mut payload, path);
            self.call(&payload).map(|_| ())
        }

        fn set_owner_and_permissions_recursive(
            &self,
            path: &Path,
            uid: u32,
            gid: u32,
            mode: u32,
        ) -> Result<()> {
            let mut payload = vec![OP_SET_OWNER_AND_PERMISSIONS];
            encode_path(&mut payload, path);
            payload.extend_from_slice(&uid.to_be_bytes());
            payload.extend_from_slice(&gid.to_be_bytes());
            payload.extend_from_slice(&mode.to_be_bytes());
            self.call(&payload).map(|_| ())
        }
    }

    /// Server half, normally hosted by the privileged helper process.
    pub struct HelperServer {
        socket: UnixStream,
        inner: Arc<dyn SystemHelper>,
    }

    impl HelperServer {
        pub fn new(socket: UnixStream, inner: Arc<dyn SystemHelper>) -> Self {
            Self { socket, inner }
        }

        /// Serves requests until the peer closes the socket.
        pub fn run(mut self) {
            loop {
                let (_, request) = match receive_message(&mut self.socket, TAG_REQUEST) {
                    Ok(msg) => msg,
                    Err(_) => return, // peer gone
                };

                let error = match self.dispatch(&request) {
                    Ok(()) => String::new(),
                    Err(e) => e.to_string(),
                };
                if send_message(&mut self.socket, TAG_REPLY, &error, &[]).is_err() {
                    return;
                }
            }
        }

        fn dispatch(&self, request: &[u8]) -> Result<()> {
            let opcode = *request
                .first()
                .ok_or_else(|| Error::Filesystem("empty helper request".into()))?;
            let mut pos = 1;

            match opcode {
                OP_REMOVE_RECURSIVE => {
                    let path = decode_path(request, &mut pos)
                        .map_err(|e| Error::Filesystem(e.to_string()))?;
                    self.inner.remove_recursive(&path)
                }
                OP_SET_OWNER_AND_PERMISSIONS => {
                    let path = decode_path(request, &mut pos)
                        .map_err(|e| Error::Filesystem(e.to_string()))?;
                    let uid = decode_u32(request, &mut pos)
                        .map_err(|e| Error::Filesystem(e.to_string()))?;
                    let gid = decode_u32(request, &mut pos)
                        .map_err(|e| Error::Filesystem(e.to_string()))?;
                    let mode = decode_u32(request, &mut pos)
                        .map_err(|e| Error::Filesystem(e.to_string()))?;
                    self.inner
                        .set_owner_and_permissions_recursive(&path, uid, gid, mode)
                }
                other => Err(Error::Filesystem(format!(
                    "unknown helper opcode {other}"
                ))),
            }
        }
    }
}
