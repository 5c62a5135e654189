//! Bus emulation over Unix domain sockets.
//!
//! Each bus address is served by one peripheral process listening on
//! `<socket_dir>/bus<channel>-cs<select>.sock`. The coordinator keeps one
//! connection per address and speaks a two-op protocol:
//!
//! ```text
//! 'S' <0|1>                 drive the select line
//! 'X' <len u16 BE> <bytes>  exchange, answered with exactly `len` bytes
//! ```

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{BusAddress, BusDevice, BusTransport};

const OP_SELECT: u8 = b'S';
const OP_EXCHANGE: u8 = b'X';

/// Upper bound on a single emulated exchange.
pub const MAX_EXCHANGE_LEN: usize = u16::MAX as usize;

/// How often the peripheral side re-checks its running flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout for the remainder of an op once its first byte has arrived.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket path for `address` under `socket_dir`.
pub fn socket_path(socket_dir: impl AsRef<Path>, address: BusAddress) -> PathBuf {
    socket_dir
        .as_ref()
        .join(format!("bus{}-cs{}.sock", address.channel, address.select))
}

/// Coordinator side of the emulated bus.
pub struct UdsBus {
    socket_dir: PathBuf,
    connections: BTreeMap<BusAddress, UnixStream>,
    io_timeout: Option<Duration>,
}

/// Handle for an open exchange sequence on a [`UdsBus`].
#[derive(Debug)]
pub struct UdsHandle {
    address: BusAddress,
}

impl UdsBus {
    /// Default per-exchange I/O timeout.
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            connections: BTreeMap::new(),
            io_timeout: Some(Self::DEFAULT_IO_TIMEOUT),
        }
    }

    /// Override the per-exchange I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Directory holding the per-address sockets.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    fn connect(&mut self, address: BusAddress) -> Result<&mut UnixStream> {
        if !self.connections.contains_key(&address) {
            let path = socket_path(&self.socket_dir, address);
            let stream = UnixStream::connect(&path).map_err(|source| TransportError::Open {
                address,
                source,
            })?;
            stream.set_read_timeout(self.io_timeout)?;
            stream.set_write_timeout(self.io_timeout)?;
            debug!(%address, ?path, "connected to emulated bus device");
            self.connections.insert(address, stream);
        }
        self.connections
            .get_mut(&address)
            .ok_or(TransportError::Shutdown)
    }

    fn drop_connection(&mut self, address: BusAddress) {
        if self.connections.remove(&address).is_some() {
            debug!(%address, "dropped emulated bus connection");
        }
    }
}

impl BusTransport for UdsBus {
    type Handle = UdsHandle;

    fn open(&mut self, address: BusAddress) -> Result<UdsHandle> {
        self.connect(address)?;
        Ok(UdsHandle { address })
    }

    fn transfer(&mut self, handle: &mut UdsHandle, tx: &[u8]) -> Result<Vec<u8>> {
        let address = handle.address;
        if tx.len() > MAX_EXCHANGE_LEN {
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("exchange of {} bytes exceeds {MAX_EXCHANGE_LEN}", tx.len()),
            )));
        }

        let stream = self.connect(address)?;
        let mut request = Vec::with_capacity(3 + tx.len());
        request.push(OP_EXCHANGE);
        request.extend_from_slice(&(tx.len() as u16).to_be_bytes());
        request.extend_from_slice(tx);

        let mut rx = vec![0u8; tx.len()];
        let result = stream
            .write_all(&request)
            .and_then(|()| stream.flush())
            .and_then(|()| stream.read_exact(&mut rx));

        match result {
            Ok(()) => Ok(rx),
            Err(err) => {
                self.drop_connection(address);
                Err(TransportError::Io(err))
            }
        }
    }

    fn close(&mut self, _handle: UdsHandle) -> Result<()> {
        Ok(())
    }

    fn set_select(&mut self, address: BusAddress, asserted: bool) -> Result<()> {
        // A device we never reached cannot have its line asserted.
        if !asserted && !self.connections.contains_key(&address) {
            return Ok(());
        }

        let stream = self.connect(address)?;
        let result = stream
            .write_all(&[OP_SELECT, u8::from(asserted)])
            .and_then(|()| stream.flush());
        if let Err(err) = result {
            self.drop_connection(address);
            return Err(TransportError::Io(err));
        }
        Ok(())
    }
}

/// Peripheral side of the emulated bus.
///
/// The socket file is created at bind time and removed on drop, unless the
/// path was replaced in the meantime.
pub struct UdsPort {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    cleanup_on_drop: bool,
}

impl UdsPort {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind the socket serving `address` under `socket_dir`.
    pub fn bind_address(socket_dir: impl AsRef<Path>, address: BusAddress) -> Result<Self> {
        Self::bind(socket_path(socket_dir, address))
    }

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the path already exists and is a socket it is removed first; any
    /// other file type is left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |path: &Path, source: std::io::Error| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
            } else {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        info!(?path, "bus port listening");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created.dev(), created.ino())),
            cleanup_on_drop: true,
        })
    }

    /// The path this port is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve coordinator connections until `running` is cleared.
    ///
    /// `device.idle()` is called whenever `idle` elapses without any bus
    /// activity. Losing the coordinator connection deselects the device.
    pub fn serve<D>(&self, device: &mut D, idle: Duration, running: &AtomicBool) -> Result<()>
    where
        D: BusDevice + ?Sized,
    {
        self.listener.set_nonblocking(true)?;
        let mut last_activity = Instant::now();

        while running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    debug!("coordinator connected");
                    stream.set_nonblocking(false)?;
                    let outcome = serve_connection(
                        stream,
                        device,
                        idle,
                        running,
                        &mut last_activity,
                    );
                    device.select(false);
                    match outcome {
                        Ok(()) => debug!("coordinator disconnected"),
                        Err(err) => warn!(error = %err, "coordinator connection failed"),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    check_idle(device, idle, &mut last_activity);
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Accept(err)),
            }
        }
        Ok(())
    }
}

fn check_idle<D: BusDevice + ?Sized>(device: &mut D, idle: Duration, last_activity: &mut Instant) {
    if last_activity.elapsed() >= idle {
        device.idle();
        *last_activity = Instant::now();
    }
}

fn serve_connection<D: BusDevice + ?Sized>(
    mut stream: UnixStream,
    device: &mut D,
    idle: Duration,
    running: &AtomicBool,
    last_activity: &mut Instant,
) -> Result<()> {
    let mut op = [0u8; 1];
    while running.load(Ordering::SeqCst) {
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        match stream.read(&mut op) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                check_idle(device, idle, last_activity);
                continue;
            }
            Err(err) => return Err(TransportError::Io(err)),
        }

        *last_activity = Instant::now();
        stream.set_read_timeout(Some(OP_TIMEOUT))?;
        match op[0] {
            OP_SELECT => {
                let mut level = [0u8; 1];
                stream.read_exact(&mut level)?;
                device.select(level[0] != 0);
            }
            OP_EXCHANGE => {
                let mut len = [0u8; 2];
                stream.read_exact(&mut len)?;
                let mut tx = vec![0u8; u16::from_be_bytes(len) as usize];
                stream.read_exact(&mut tx)?;

                let mut rx = device.exchange(&tx);
                rx.resize(tx.len(), 0);
                stream.write_all(&rx)?;
                stream.flush()?;
            }
            other => {
                return Err(TransportError::Io(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown bus op 0x{other:02x}"),
                )));
            }
        }
    }
    Ok(())
}

impl Drop for UdsPort {
    fn drop(&mut self) {
        if !self.cleanup_on_drop {
            return;
        }
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "buscap-uds-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[derive(Default)]
    struct Recorder {
        selected: bool,
        idles: usize,
    }

    impl BusDevice for Recorder {
        fn select(&mut self, asserted: bool) {
            self.selected = asserted;
        }

        fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
            if self.selected {
                tx.iter().rev().copied().collect()
            } else {
                vec![0; tx.len()]
            }
        }

        fn idle(&mut self) {
            self.idles += 1;
        }
    }

    #[test]
    fn socket_path_layout() {
        let path = socket_path("/run/buscap", BusAddress::new(1, 2));
        assert_eq!(path, PathBuf::from("/run/buscap/bus1-cs2.sock"));
    }

    #[test]
    fn exchange_roundtrip_through_port() {
        let dir = temp_dir("roundtrip");
        let address = BusAddress::new(0, 1);
        let port = UdsPort::bind_address(&dir, address).unwrap();
        assert!(port.path().exists());

        let running = Arc::new(AtomicBool::new(true));
        let server = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut device = Recorder::default();
                port.serve(&mut device, Duration::from_secs(30), &running)
                    .unwrap();
            })
        };

        let mut bus = UdsBus::new(&dir);
        let mut handle = bus.open(address).unwrap();
        assert_eq!(bus.transfer(&mut handle, &[1, 2, 3]).unwrap(), vec![0, 0, 0]);

        bus.set_select(address, true).unwrap();
        assert_eq!(bus.transfer(&mut handle, &[1, 2, 3]).unwrap(), vec![3, 2, 1]);
        bus.set_select(address, false).unwrap();
        bus.close(handle).unwrap();

        running.store(false, Ordering::SeqCst);
        drop(bus);
        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_missing_device_fails() {
        let dir = temp_dir("missing");
        let mut bus = UdsBus::new(&dir);
        let err = bus.open(BusAddress::new(3, 3)).unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
        // Deasserting a never-reached line is a no-op.
        bus.set_select(BusAddress::new(3, 3), false).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn idle_callback_fires_without_traffic() {
        let dir = temp_dir("idle");
        let port = UdsPort::bind_address(&dir, BusAddress::new(0, 0)).unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let stopper = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                running.store(false, Ordering::SeqCst);
            })
        };

        let mut device = Recorder::default();
        port.serve(&mut device, Duration::from_millis(60), &running)
            .unwrap();
        stopper.join().unwrap();

        assert!(device.idles >= 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = UdsPort::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn bind_rejects_existing_non_socket_file() {
        let dir = temp_dir("file");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").unwrap();

        let result = UdsPort::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_removes_socket_file() {
        let dir = temp_dir("drop");
        let port = UdsPort::bind_address(&dir, BusAddress::new(0, 0)).unwrap();
        let path = port.path().to_path_buf();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(port);
        assert!(!path.exists(), "socket file should be cleaned up on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
