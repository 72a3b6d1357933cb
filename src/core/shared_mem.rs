use crate::config::{SHARED_NAMESPACE, SHARED_SEGMENT_SIZE};
use crate::core::channel::{ChannelId, MsgChannel};
use crate::error::SegmentError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A mapped region holding the message channels of one worker.
pub trait SharedSegment: Send {
    fn name(&self) -> &str;

    fn with_bytes(&mut self, f: &mut dyn FnMut(&mut [u8]));

    fn send(&mut self, channel: ChannelId, msg: &str) -> bool {
        let mut sent = false;
        self.with_bytes(&mut |bytes| {
            sent = MsgChannel::new(&mut bytes[channel.range()]).send_msg(msg);
        });
        sent
    }

    fn force(&mut self, channel: ChannelId, msg: &str) -> bool {
        let mut sent = false;
        self.with_bytes(&mut |bytes| {
            sent = MsgChannel::new(&mut bytes[channel.range()]).force_msg(msg);
        });
        sent
    }

    fn recv(&mut self, channel: ChannelId) -> Option<String> {
        let mut received = None;
        self.with_bytes(&mut |bytes| {
            received = MsgChannel::new(&mut bytes[channel.range()]).get_msg();
        });
        received
    }

    fn has_msg(&mut self, channel: ChannelId) -> bool {
        let mut full = false;
        self.with_bytes(&mut |bytes| {
            full = MsgChannel::new(&mut bytes[channel.range()]).has_msg();
        });
        full
    }
}

/// Creates or attaches segments by name.
pub trait SegmentFactory: Send + Sync {
    fn attach_or_create(&self, name: &str, size: usize) -> Result<Box<dyn SharedSegment>, SegmentError>;
}

/// Stable segment name for a slot directory.
///
/// The same directory always maps to the same name, so a restarted worker
/// finds its segment again while other slots never collide with it.
pub fn segment_name(slot_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(slot_dir.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    if cfg!(windows) {
        format!("Local\\{SHARED_NAMESPACE}_{hex}")
    } else {
        format!("/{SHARED_NAMESPACE}_{hex}")
    }
}

/// OS shared memory backed segment.
pub struct ShmemSegment {
    name: String,
    shm: Shmem,
}

// SAFETY: the mapping is owned by this value alone and carries no
// thread-affine state; moving it to another thread moves the only handle.
unsafe impl Send for ShmemSegment {}

impl ShmemSegment {
    /// Open a segment somebody else created. Used from the worker side.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        let shm = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|err| classify(name, err))?;
        check_size(&shm)?;
        Ok(Self {
            name: name.to_string(),
            shm,
        })
    }

    /// Create the segment, or take over one left behind by a crashed run.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self, SegmentError> {
        let conf = ShmemConf::new().os_id(name).size(size);
        let mut shm = match conf.create() {
            Ok(shm) => shm,
            Err(ShmemError::MappingIdExists) => {
                let mut shm = ShmemConf::new()
                    .os_id(name)
                    .open()
                    .map_err(|err| classify(name, err))?;
                // the leftover belongs to us now and goes away on detach
                shm.set_owner(true);
                shm
            }
            Err(err) => return Err(classify(name, err)),
        };
        check_size(&shm)?;
        shm.set_owner(true);
        let mut segment = Self {
            name: name.to_string(),
            shm,
        };
        segment.with_bytes(&mut |bytes| bytes.fill(0));
        Ok(segment)
    }
}

impl SharedSegment for ShmemSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn with_bytes(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        // SAFETY: the mapping lives as long as `self.shm` and is at least
        // SHARED_SEGMENT_SIZE bytes (checked at attach). The peer only
        // touches channel bytes under the single-writer-per-direction rule.
        let bytes = unsafe { self.shm.as_slice_mut() };
        f(&mut bytes[..SHARED_SEGMENT_SIZE]);
    }
}

fn check_size(shm: &Shmem) -> Result<(), SegmentError> {
    if shm.len() < SHARED_SEGMENT_SIZE {
        return Err(SegmentError::RegionTooSmall {
            required: SHARED_SEGMENT_SIZE,
            actual: shm.len(),
        });
    }
    Ok(())
}

fn classify(name: &str, err: ShmemError) -> SegmentError {
    let message = err.to_string();
    let exhausted = match &err {
        ShmemError::MapCreateFailed(code) | ShmemError::UnknownOsError(code) => {
            is_exhaustion_errno(*code)
        }
        _ => false,
    };
    if exhausted {
        SegmentError::Exhausted {
            name: name.to_string(),
            message,
        }
    } else {
        SegmentError::Failed {
            name: name.to_string(),
            message,
        }
    }
}

#[cfg(unix)]
fn is_exhaustion_errno(code: u32) -> bool {
    let code = code as i32;
    code == libc::ENOSPC || code == libc::ENOMEM || code == libc::EMFILE || code == libc::ENFILE
}

#[cfg(not(unix))]
fn is_exhaustion_errno(code: u32) -> bool {
    // ERROR_NOT_ENOUGH_MEMORY, ERROR_OUTOFMEMORY, ERROR_COMMITMENT_LIMIT
    matches!(code, 8 | 14 | 1455)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShmemFactory;

impl SegmentFactory for ShmemFactory {
    fn attach_or_create(&self, name: &str, size: usize) -> Result<Box<dyn SharedSegment>, SegmentError> {
        Ok(Box::new(ShmemSegment::open_or_create(name, size)?))
    }
}

/// In-process segment. Both ends hold the same buffer.
#[derive(Clone)]
pub struct HeapSegment {
    name: String,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HeapSegment {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            bytes: Arc::new(Mutex::new(vec![0u8; size.max(SHARED_SEGMENT_SIZE)])),
        }
    }

    /// Number of live handles on the buffer, this one included.
    pub fn attachments(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

impl SharedSegment for HeapSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn with_bytes(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        let mut guard = self.bytes.lock();
        f(&mut guard);
    }
}

/// Factory for `HeapSegment`s that can fail on demand and hands out the
/// peer end of any segment it created.
#[derive(Clone, Default)]
pub struct HeapSegments {
    segments: Arc<Mutex<HashMap<String, HeapSegment>>>,
    exhausted: Arc<Mutex<bool>>,
}

impl HeapSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exhausted(&self, exhausted: bool) {
        *self.exhausted.lock() = exhausted;
    }

    pub fn peer(&self, name: &str) -> Option<HeapSegment> {
        self.segments.lock().get(name).cloned()
    }

    /// True while a client-side handle on `name` is still alive.
    pub fn is_attached(&self, name: &str) -> bool {
        self.segments
            .lock()
            .get(name)
            .map(|segment| segment.attachments() > 1)
            .unwrap_or(false)
    }
}

impl SegmentFactory for HeapSegments {
    fn attach_or_create(&self, name: &str, size: usize) -> Result<Box<dyn SharedSegment>, SegmentError> {
        if *self.exhausted.lock() {
            return Err(SegmentError::Exhausted {
                name: name.to_string(),
                message: "no free segments".to_string(),
            });
        }
        let mut segments = self.segments.lock();
        let segment = segments
            .entry(name.to_string())
            .or_insert_with(|| HeapSegment::new(name, size))
            .clone();
        Ok(Box::new(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    #[test]
    fn segment_name_is_stable_and_distinct() {
        let a = segment_name(&PathBuf::from("/data/slots/0"));
        let b = segment_name(&PathBuf::from("/data/slots/1"));
        assert_eq!(a, segment_name(&PathBuf::from("/data/slots/0")));
        assert_ne!(a, b);
        assert!(a.len() < 31, "macOS limits POSIX shm names: {a}");
    }

    #[test]
    fn heap_segment_channels_are_independent() {
        let factory = HeapSegments::new();
        let mut client = factory.attach_or_create("seg", SHARED_SEGMENT_SIZE).unwrap();
        let mut worker = factory.peer("seg").unwrap();

        assert!(client.send(ChannelId::ProcessControlRequest, "<suspend/>"));
        assert!(client.send(ChannelId::Heartbeat, "<heartbeat/>"));
        assert!(worker.send(ChannelId::AppStatus, "<fraction_done>0.1</fraction_done>"));

        assert_eq!(
            worker.recv(ChannelId::ProcessControlRequest).as_deref(),
            Some("<suspend/>")
        );
        assert_eq!(worker.recv(ChannelId::Heartbeat).as_deref(), Some("<heartbeat/>"));
        assert_eq!(
            client.recv(ChannelId::AppStatus).as_deref(),
            Some("<fraction_done>0.1</fraction_done>")
        );
        assert_eq!(client.recv(ChannelId::TrickleUp), None);
    }

    #[test]
    fn exhausted_factory_reports_retryable() {
        let factory = HeapSegments::new();
        factory.set_exhausted(true);
        let err = factory.attach_or_create("seg", SHARED_SEGMENT_SIZE).err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn dropping_client_handle_detaches() {
        let factory = HeapSegments::new();
        let client = factory.attach_or_create("seg", SHARED_SEGMENT_SIZE).unwrap();
        assert!(factory.is_attached("seg"));
        drop(client);
        assert!(!factory.is_attached("seg"));
    }

    #[test]
    #[serial]
    fn os_segment_is_visible_to_peer() {
        let dir = tempfile::tempdir().unwrap();
        let name = segment_name(&dir.path().join("slot"));
        let mut client = ShmemSegment::open_or_create(&name, SHARED_SEGMENT_SIZE).unwrap();
        let mut worker = ShmemSegment::open(&name).unwrap();

        assert!(client.send(ChannelId::ProcessControlRequest, "<quit/>"));
        assert_eq!(worker.recv(ChannelId::ProcessControlRequest).as_deref(), Some("<quit/>"));
        assert!(!client.has_msg(ChannelId::ProcessControlRequest));
    }
}
