/// File operations over named regions of a DSM buffer
///
/// Every open region holds the lock of the same name on the start server
/// until it is closed, so one client at a time reads or writes it.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::api::types::{ApiError, ApiResult, FileHandle, OpenFlags};
use crate::buffer::DsmBuffer;
use crate::error::DsmError;
use crate::protocol::FileDescription;

/// State of one open descriptor
#[derive(Debug)]
struct OpenRegion {
    handle: FileHandle,
    desc: FileDescription,
    /// Length or pages changed since the registry last saw them
    dirty: bool,
}

/// DSM file system client
///
/// Owns a client-side [`DsmBuffer`]. Regions live on the servers and outlive
/// the client.
pub struct DsmFileSystem {
    buffer: RefCell<DsmBuffer>,

    /// Whether the layout hands out whole pages
    paged: bool,

    /// Open file descriptors
    open_files: RefCell<HashMap<u64, OpenRegion>>,

    /// Next file descriptor
    next_fd: RefCell<u64>,
}

impl DsmFileSystem {
    /// Wrap a configured client buffer
    pub fn new(buffer: DsmBuffer) -> ApiResult<Self> {
        let paged = buffer.map()?.is_paged();
        if buffer.is_server() {
            return Err(ApiError::InvalidArgument(
                "server ranks cannot open regions".to_string(),
            ));
        }
        Ok(Self {
            buffer: RefCell::new(buffer),
            paged,
            open_files: RefCell::new(HashMap::new()),
            next_fd: RefCell::new(3),
        })
    }

    /// Give the buffer back, closing every open region first
    pub fn into_buffer(self) -> ApiResult<DsmBuffer> {
        let handles: Vec<FileHandle> = self
            .open_files
            .borrow()
            .values()
            .map(|region| region.handle.clone())
            .collect();
        for handle in &handles {
            self.dsm_close(handle)?;
        }
        Ok(self.buffer.into_inner())
    }

    /// Run `f` against the underlying buffer
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut DsmBuffer) -> R) -> R {
        f(&mut self.buffer.borrow_mut())
    }

    /// Create `name` with room for `size` bytes and open it read-write
    ///
    /// An existing region grows by `size` bytes instead.
    pub fn dsm_create(&self, name: &str, size: u64) -> ApiResult<FileHandle> {
        self.ensure_closed(name)?;
        let mut buffer = self.buffer.borrow_mut();
        buffer.lock(name)?;
        let desc = match buffer.request_pages(name, size) {
            Ok(desc) => desc,
            Err(e) => {
                buffer.unlock(name)?;
                return Err(e.into());
            }
        };
        drop(buffer);

        tracing::debug!("Created region '{}' with capacity {}", name, desc.capacity());
        Ok(self.install(desc, OpenFlags::create(), false))
    }

    /// Open an existing region
    ///
    /// With `flags.create` a missing region is created empty.
    pub fn dsm_open(&self, name: &str, flags: OpenFlags) -> ApiResult<FileHandle> {
        self.ensure_closed(name)?;
        let mut buffer = self.buffer.borrow_mut();
        buffer.lock(name)?;
        let found = match buffer.request_file(name) {
            Err(DsmError::NotFound(_)) if flags.create => buffer.request_pages(name, 0),
            other => other,
        };
        let mut desc = match found {
            Ok(desc) => desc,
            Err(e) => {
                buffer.unlock(name)?;
                return Err(match e {
                    DsmError::NotFound(_) => ApiError::NotFound(name.to_string()),
                    other => other.into(),
                });
            }
        };
        drop(buffer);

        let truncated = flags.truncate && flags.write && desc.length > 0;
        if truncated {
            desc.length = 0;
        }
        let append_at = desc.length;
        let handle = self.install(desc, flags, truncated);
        if flags.append {
            handle.seek(append_at);
        }
        Ok(handle)
    }

    /// Read from the current position into `buf`
    ///
    /// Returns the number of bytes read, 0 at or past the end.
    pub fn dsm_read(&self, handle: &FileHandle, buf: &mut [u8]) -> ApiResult<usize> {
        if !handle.flags.read {
            return Err(ApiError::PermissionDenied(format!(
                "'{}' is not open for reading",
                handle.name
            )));
        }
        let (desc, position) = {
            let files = self.open_files.borrow();
            let region = files.get(&handle.fd).ok_or(ApiError::BadDescriptor(handle.fd))?;
            (region.desc.clone(), handle.position())
        };

        let available = desc.length.saturating_sub(position);
        let count = (buf.len() as u64).min(available) as usize;
        if count == 0 {
            return Ok(0);
        }
        let mut buffer = self.buffer.borrow_mut();
        if self.paged {
            buffer.get_pages(&desc.pages, position, &mut buf[..count])?;
        } else {
            buffer.get(desc.start + position, &mut buf[..count])?;
        }
        handle.advance(count as u64);
        Ok(count)
    }

    /// Write `data` at the current position, growing the region as needed
    pub fn dsm_write(&self, handle: &FileHandle, data: &[u8]) -> ApiResult<usize> {
        if !handle.flags.write {
            return Err(ApiError::PermissionDenied(format!(
                "'{}' is not open for writing",
                handle.name
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let position = handle.position();
        let end = position.checked_add(data.len() as u64).ok_or_else(|| {
            ApiError::InvalidArgument(format!("write at {} overflows the region", position))
        })?;

        let mut files = self.open_files.borrow_mut();
        let region = files
            .get_mut(&handle.fd)
            .ok_or(ApiError::BadDescriptor(handle.fd))?;
        let mut buffer = self.buffer.borrow_mut();

        let capacity = region.desc.capacity();
        if end > capacity {
            let length = region.desc.length;
            region.desc = buffer.request_pages(&handle.name, end - capacity)?;
            region.desc.length = length;
            region.dirty = true;
        }
        if self.paged {
            buffer.put_pages(&region.desc.pages, position, data)?;
        } else {
            buffer.put(region.desc.start + position, data)?;
        }
        if end > region.desc.length {
            region.desc.length = end;
            region.dirty = true;
        }
        handle.advance(data.len() as u64);
        Ok(data.len())
    }

    /// Seek to a new position
    ///
    /// # Arguments
    /// * `handle` - File handle
    /// * `offset` - Offset from whence
    /// * `whence` - Seek mode (0=SET, 1=CUR, 2=END)
    ///
    /// # Returns
    /// New file position
    pub fn dsm_seek(&self, handle: &FileHandle, offset: i64, whence: i32) -> ApiResult<u64> {
        let base = match whence {
            0 => 0,
            1 => handle.position(),
            2 => self.dsm_size(handle)?,
            _ => return Err(ApiError::InvalidArgument("Invalid whence".to_string())),
        };
        let new_pos = i64::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .ok_or_else(|| ApiError::InvalidArgument("Seek position overflows".to_string()))?;
        if new_pos < 0 {
            return Err(ApiError::InvalidArgument("Seek before beginning".to_string()));
        }
        handle.seek(new_pos as u64);
        Ok(new_pos as u64)
    }

    /// Logical length of the region
    pub fn dsm_size(&self, handle: &FileHandle) -> ApiResult<u64> {
        self.open_files
            .borrow()
            .get(&handle.fd)
            .map(|region| region.desc.length)
            .ok_or(ApiError::BadDescriptor(handle.fd))
    }

    /// Publish the region's current length and pages to the registry
    pub fn dsm_fsync(&self, handle: &FileHandle) -> ApiResult<()> {
        let mut files = self.open_files.borrow_mut();
        let region = files
            .get_mut(&handle.fd)
            .ok_or(ApiError::BadDescriptor(handle.fd))?;
        if region.dirty {
            self.buffer.borrow_mut().register_file(&region.desc)?;
            region.dirty = false;
        }
        Ok(())
    }

    /// Close the region, publishing its description and releasing its lock
    pub fn dsm_close(&self, handle: &FileHandle) -> ApiResult<()> {
        self.dsm_fsync(handle)?;
        let region = self
            .open_files
            .borrow_mut()
            .remove(&handle.fd)
            .ok_or(ApiError::BadDescriptor(handle.fd))?;
        self.buffer.borrow_mut().unlock(&region.handle.name)?;
        tracing::debug!("Closed region '{}' (fd {})", region.handle.name, handle.fd);
        Ok(())
    }

    /// Number of open descriptors
    pub fn open_count(&self) -> usize {
        self.open_files.borrow().len()
    }

    /// Each region's lock is held once per client, so a name opens once
    fn ensure_closed(&self, name: &str) -> ApiResult<()> {
        let files = self.open_files.borrow();
        match files.values().find(|region| region.handle.name == name) {
            Some(region) => Err(ApiError::InvalidArgument(format!(
                "'{}' is already open as fd {}",
                name, region.handle.fd
            ))),
            None => Ok(()),
        }
    }

    fn install(&self, desc: FileDescription, flags: OpenFlags, dirty: bool) -> FileHandle {
        let fd = self.allocate_fd();
        let handle = FileHandle::new(fd, desc.name.clone(), flags);
        self.open_files.borrow_mut().insert(
            fd,
            OpenRegion {
                handle: handle.clone(),
                desc,
                dirty,
            },
        );
        handle
    }

    /// Allocate a new file descriptor
    fn allocate_fd(&self) -> u64 {
        let fd = *self.next_fd.borrow();
        *self.next_fd.borrow_mut() += 1;
        fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalFabric, ProcessGroup, RendezvousFile};
    use crate::layout::LayoutSpec;
    use std::thread;

    /// Serve `spec` on rank 0 and hand a file system on rank 1 to `test`
    fn run_test<F>(spec: LayoutSpec, test: F)
    where
        F: FnOnce(&DsmFileSystem),
    {
        let mut comms = LocalFabric::create(2);
        let client_comm = comms.pop().unwrap();
        let server_comm = comms.pop().unwrap();
        let map = spec.with_servers(0, 0).build(2).unwrap();

        let server_map = map.clone();
        let server = thread::spawn(move || {
            let group = ProcessGroup::bind(&server_comm, RendezvousFile::new("unused")).unwrap();
            let mut buffer = DsmBuffer::new(group);
            buffer.configure(server_map).unwrap();
            buffer.service_loop().unwrap();
        });

        let group = ProcessGroup::bind(&client_comm, RendezvousFile::new("unused")).unwrap();
        let mut buffer = DsmBuffer::new(group);
        buffer.configure(map).unwrap();
        let fs = DsmFileSystem::new(buffer).unwrap();
        test(&fs);
        let mut buffer = fs.into_buffer().unwrap();
        buffer.send_done().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_create_and_open_file() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("mesh", 100).unwrap();
            assert_eq!(handle.name, "mesh");
            assert!(handle.flags.write);
            assert_eq!(fs.dsm_size(&handle).unwrap(), 100);
            fs.dsm_close(&handle).unwrap();

            let handle = fs.dsm_open("mesh", OpenFlags::read_only()).unwrap();
            assert_eq!(fs.dsm_size(&handle).unwrap(), 100);
            fs.dsm_close(&handle).unwrap();
            assert_eq!(fs.open_count(), 0);
        });
    }

    #[test]
    fn test_open_missing_file() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let result = fs.dsm_open("absent", OpenFlags::read_only());
            assert!(matches!(result, Err(ApiError::NotFound(_))));

            // the lock was released on failure
            let handle = fs.dsm_open("absent", OpenFlags::create()).unwrap();
            assert_eq!(fs.dsm_size(&handle).unwrap(), 0);
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_write_and_read_paged_file() {
        run_test(LayoutSpec::block_cyclic(4096, 64), |fs| {
            let handle = fs.dsm_create("field", 0).unwrap();
            let data: Vec<u8> = (0..200u8).collect();
            let written = fs.dsm_write(&handle, &data).unwrap();
            assert_eq!(written, data.len());
            fs.dsm_close(&handle).unwrap();

            let handle = fs.dsm_open("field", OpenFlags::read_only()).unwrap();
            let mut buf = vec![0u8; 300];
            let read = fs.dsm_read(&handle, &mut buf).unwrap();
            assert_eq!(read, data.len());
            assert_eq!(&buf[..read], &data[..]);
            assert_eq!(fs.dsm_read(&handle, &mut buf).unwrap(), 0);
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_write_requires_write_flag() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("ro", 10).unwrap();
            fs.dsm_close(&handle).unwrap();
            let handle = fs.dsm_open("ro", OpenFlags::read_only()).unwrap();
            assert!(matches!(
                fs.dsm_write(&handle, b"x"),
                Err(ApiError::PermissionDenied(_))
            ));
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_seek() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("seek", 0).unwrap();
            fs.dsm_write(&handle, b"0123456789").unwrap();
            fs.dsm_close(&handle).unwrap();

            let handle = fs.dsm_open("seek", OpenFlags::read_only()).unwrap();
            assert_eq!(fs.dsm_seek(&handle, 5, 0).unwrap(), 5);
            assert_eq!(fs.dsm_seek(&handle, 2, 1).unwrap(), 7);
            assert_eq!(fs.dsm_seek(&handle, -3, 2).unwrap(), 7);
            assert!(fs.dsm_seek(&handle, -11, 2).is_err());

            let mut buf = [0u8; 3];
            fs.dsm_read(&handle, &mut buf).unwrap();
            assert_eq!(&buf, b"789");
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_seek_overflow_is_rejected() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("far", 0).unwrap();
            fs.dsm_write(&handle, b"0123").unwrap();
            assert!(matches!(
                fs.dsm_seek(&handle, i64::MAX, 1),
                Err(ApiError::InvalidArgument(_))
            ));
            assert!(matches!(
                fs.dsm_seek(&handle, i64::MAX, 2),
                Err(ApiError::InvalidArgument(_))
            ));
            // the position is unchanged
            assert_eq!(handle.position(), 4);
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_second_open_of_same_name_is_rejected() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("once", 16).unwrap();
            assert!(matches!(
                fs.dsm_open("once", OpenFlags::read_only()),
                Err(ApiError::InvalidArgument(_))
            ));
            assert!(matches!(
                fs.dsm_create("once", 16),
                Err(ApiError::InvalidArgument(_))
            ));
            assert_eq!(fs.open_count(), 1);

            // closing the only descriptor frees the lock for the next open
            fs.dsm_close(&handle).unwrap();
            let handle = fs.dsm_open("once", OpenFlags::read_only()).unwrap();
            assert_eq!(fs.dsm_size(&handle).unwrap(), 16);
            fs.dsm_close(&handle).unwrap();
        });
    }

    #[test]
    fn test_append_and_truncate() {
        run_test(LayoutSpec::uniform(4096), |fs| {
            let handle = fs.dsm_create("log", 0).unwrap();
            fs.dsm_write(&handle, b"abc").unwrap();
            fs.dsm_close(&handle).unwrap();

            let handle = fs
                .dsm_open("log", OpenFlags::read_write().with_append())
                .unwrap();
            assert_eq!(handle.position(), 3);
            fs.dsm_close(&handle).unwrap();

            let handle = fs
                .dsm_open("log", OpenFlags::read_write().with_truncate())
                .unwrap();
            assert_eq!(fs.dsm_size(&handle).unwrap(), 0);
            fs.dsm_close(&handle).unwrap();

            let handle = fs.dsm_open("log", OpenFlags::read_only()).unwrap();
            assert_eq!(fs.dsm_size(&handle).unwrap(), 0);
            fs.dsm_close(&handle).unwrap();
        });
    }
}
