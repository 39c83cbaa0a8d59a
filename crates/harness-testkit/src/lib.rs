//! Driver side of the harness protocol, scripted for tests.
//!
//! [`ScriptedDriver`] creates segments, answers the handshake and issues
//! requests the way a fuzzing driver does, one step at a time so tests can
//! stop anywhere in the sequence. [`spawn_session`] runs a processor on the
//! other end of an in-memory channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use harness_core::{
    CancelToken, ChannelError, ControlChannel, MAX_IDENTITY_LEN, ProcessorConfig,
    ProcessorSession, SessionReport, SessionResources,
};
use harness_shm::{
    HeapNamespace, Namespace, Ownership, RegionError, RegionSpec, Role, SegmentRef,
    SharedMemoryRegion,
};
use tokio::task::JoinHandle;

/// Attempts made by [`ScriptedDriver::wait_for_key`].
const WAIT_ATTEMPTS: usize = 50;
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// How the driver tells the processor about a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Create a keyless segment and send its id. The driver owns it.
    Id,
    /// Create a segment under `key` and send the key. The processor owns it.
    Key(i32),
    /// Create a segment under a key the processor already knows; send nothing.
    /// The processor owns it.
    Known(i32),
}

/// Errors seen by the scripted driver.
#[derive(Debug)]
pub enum DriverError {
    Channel(ChannelError),
    Region(RegionError),
    /// No region was prepared for this role.
    NotPrepared(Role),
    /// The payload does not fit the input region.
    PayloadTooLarge { len: usize, capacity: usize },
    /// The processor reported more output than the output region holds.
    ResponseTooLarge { len: usize, capacity: usize },
    /// A keyed segment never showed up.
    Timeout(i32),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "channel: {}", e),
            Self::Region(e) => write!(f, "region: {}", e),
            Self::NotPrepared(role) => write!(f, "no {} region prepared", role),
            Self::PayloadTooLarge { len, capacity } => {
                write!(f, "payload of {} bytes exceeds input capacity {}", len, capacity)
            }
            Self::ResponseTooLarge { len, capacity } => write!(
                f,
                "processor reported {} bytes, output capacity is {}",
                len, capacity
            ),
            Self::Timeout(key) => write!(f, "segment with key {} never appeared", key),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<ChannelError> for DriverError {
    fn from(e: ChannelError) -> Self {
        DriverError::Channel(e)
    }
}

impl From<RegionError> for DriverError {
    fn from(e: RegionError) -> Self {
        DriverError::Region(e)
    }
}

struct Prepared {
    region: SharedMemoryRegion,
    offer: Offer,
}

/// Plays the driver against one processor.
pub struct ScriptedDriver {
    channel: ControlChannel,
    namespace: Namespace,
    input: Option<Prepared>,
    output: Option<Prepared>,
    method_frame_len: usize,
}

impl fmt::Debug for ScriptedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedDriver")
            .field("input", &self.input.as_ref().map(|p| p.offer))
            .field("output", &self.output.as_ref().map(|p| p.offer))
            .finish_non_exhaustive()
    }
}

impl ScriptedDriver {
    pub fn new(channel: ControlChannel, namespace: Namespace) -> Self {
        Self {
            channel,
            namespace,
            input: None,
            output: None,
            method_frame_len: harness_core::DEFAULT_METHOD_FRAME_LEN,
        }
    }

    /// A driver on a fresh in-process namespace, plus the processor's end of
    /// the channel and the namespace to hand to the session.
    pub fn in_process() -> (Self, ControlChannel, HeapNamespace) {
        let heap = HeapNamespace::new();
        let (processor_end, driver_end) = ControlChannel::pair();
        let driver = Self::new(driver_end, Namespace::InProcess(heap.clone()));
        (driver, processor_end, heap)
    }

    pub fn with_method_frame_len(mut self, len: usize) -> Self {
        self.method_frame_len = len;
        self
    }

    pub fn channel(&mut self) -> &mut ControlChannel {
        &mut self.channel
    }

    fn slot(&mut self, role: Role) -> &mut Option<Prepared> {
        match role {
            Role::Input => &mut self.input,
            Role::Output => &mut self.output,
        }
    }

    /// The driver's own attachment of the region for `role`.
    pub fn region(&self, role: Role) -> Result<&SharedMemoryRegion, DriverError> {
        let slot = match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        };
        slot.as_ref()
            .map(|p| &p.region)
            .ok_or(DriverError::NotPrepared(role))
    }

    /// Create the segment for `role`. Returns its system id.
    pub fn prepare(&mut self, role: Role, offer: Offer, capacity: usize) -> Result<i32, DriverError> {
        let region = match offer {
            Offer::Id => SharedMemoryRegion::create_private(&self.namespace, role, capacity)?,
            Offer::Key(key) | Offer::Known(key) => SharedMemoryRegion::open(
                &self.namespace,
                RegionSpec {
                    role,
                    target: SegmentRef::Key(key),
                    capacity,
                    create: true,
                    ownership: Ownership::Borrowed,
                },
            )?,
        };
        let id = region.id();
        tracing::debug!(%role, ?offer, shmid = id, capacity, "driver prepared segment");
        *self.slot(role) = Some(Prepared { region, offer });
        Ok(id)
    }

    /// Read the processor's identity token.
    pub async fn expect_identity(&mut self) -> Result<String, DriverError> {
        Ok(self.channel.read_short_string(MAX_IDENTITY_LEN).await?)
    }

    /// Send whatever the processor needs to find the region for `role`.
    pub async fn offer(&mut self, role: Role) -> Result<(), DriverError> {
        let (offer, id) = match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        }
        .as_ref()
        .map(|p| (p.offer, p.region.id()))
        .ok_or(DriverError::NotPrepared(role))?;

        match offer {
            Offer::Id => self.channel.write_u32_be(id as u32).await?,
            Offer::Key(key) => self.channel.write_u32_be(key as u32).await?,
            Offer::Known(_) => {}
        }
        Ok(())
    }

    /// Send a method name padded to the method frame length.
    pub async fn send_method(&mut self, name: &str) -> Result<(), DriverError> {
        Ok(self
            .channel
            .write_padded_string(name, self.method_frame_len)
            .await?)
    }

    /// Place `payload` in the input region, run one request and return the
    /// response bytes.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, DriverError> {
        let input = match self.input.as_mut() {
            Some(p) => &mut p.region,
            None => return Err(DriverError::NotPrepared(Role::Input)),
        };
        if payload.len() > input.capacity() {
            return Err(DriverError::PayloadTooLarge {
                len: payload.len(),
                capacity: input.capacity(),
            });
        }
        input.view_mut(0, payload.len())?.copy_from_slice(payload);

        let len = self.declare(payload.len() as u32).await? as usize;
        let output = self.region(Role::Output)?;
        if len > output.capacity() {
            return Err(DriverError::ResponseTooLarge {
                len,
                capacity: output.capacity(),
            });
        }
        Ok(output.view(0, len)?.to_vec())
    }

    /// Send a raw length frame and wait for the response length, without
    /// touching the input region.
    pub async fn declare(&mut self, len: u32) -> Result<u32, DriverError> {
        self.channel.write_u32_be(len).await?;
        Ok(self.channel.read_u32_be().await?)
    }

    /// Wait until a segment exists under `key` in this driver's namespace.
    pub async fn wait_for_key(&self, key: i32, capacity: usize) -> Result<i32, DriverError> {
        for _ in 0..WAIT_ATTEMPTS {
            let probe = SharedMemoryRegion::open(
                &self.namespace,
                RegionSpec {
                    role: Role::Input,
                    target: SegmentRef::Key(key),
                    capacity,
                    create: false,
                    ownership: Ownership::Borrowed,
                },
            );
            if let Ok(region) = probe {
                return Ok(region.id());
            }
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
        Err(DriverError::Timeout(key))
    }

    /// Close the write half. The processor sees a clean disconnect at its
    /// next length read.
    pub async fn disconnect(&mut self) -> Result<(), DriverError> {
        Ok(self.channel.shutdown().await?)
    }

    /// Detach everything and destroy the segments this driver owns.
    pub fn release(&mut self) {
        for role in [Role::Input, Role::Output] {
            if let Some(mut prepared) = self.slot(role).take() {
                prepared.region.detach();
                if prepared.region.ownership() == Ownership::Owned {
                    if let Err(e) = prepared.region.destroy() {
                        tracing::warn!(%role, error = %e, "driver failed to destroy segment");
                    }
                }
            }
        }
    }
}

impl Drop for ScriptedDriver {
    fn drop(&mut self) {
        self.release();
    }
}

/// A processor session running on a background task.
pub struct SessionHandle {
    pub cancel: CancelToken,
    pub resources: Arc<SessionResources>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    /// Wait for the session to end.
    pub async fn join(self) -> SessionReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("session task did not complete: {}", e),
        }
    }
}

/// Spawn a session serving `channel`.
pub fn spawn_session(
    config: ProcessorConfig,
    namespace: Namespace,
    channel: ControlChannel,
) -> SessionHandle {
    let cancel = CancelToken::new();
    let session = ProcessorSession::new(config, namespace, cancel.clone());
    let resources = session.resources();
    let task = tokio::spawn(session.run_with_channel(channel));
    SessionHandle {
        cancel,
        resources,
        task,
    }
}
