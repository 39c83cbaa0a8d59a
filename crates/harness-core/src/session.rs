use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness_shm::{Namespace, RegionSpec, Role, SegmentRef, SharedMemoryRegion};

use crate::{
    CancelToken, ChannelError, ControlChannel, Method, MethodSelection, Negotiation,
    ProcessorConfig, ProcessorError, ProtocolFault, SessionResources,
};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Identifying,
    AttachingInput,
    NegotiatingOutputKey,
    AttachingOutput,
    ResolvingMethod,
    Ready,
    Processing,
    Draining,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Identifying => "identifying",
            SessionState::AttachingInput => "attaching-input",
            SessionState::NegotiatingOutputKey => "negotiating-output-key",
            SessionState::AttachingOutput => "attaching-output",
            SessionState::ResolvingMethod => "resolving-method",
            SessionState::Ready => "ready",
            SessionState::Processing => "processing",
            SessionState::Draining => "draining",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The driver closed the channel between requests.
    Disconnected,
    /// The cancellation token fired.
    Cancelled,
    /// A fatal error.
    Failed(ProcessorError),
}

impl SessionOutcome {
    /// `true` for the two normal endings.
    pub fn is_clean(&self) -> bool {
        !matches!(self, SessionOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&ProcessorError> {
        match self {
            SessionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Disconnected => write!(f, "driver disconnected"),
            SessionOutcome::Cancelled => write!(f, "cancelled"),
            SessionOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Per-session counters. Not part of the wire protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Total time spent inside transforms.
    pub busy: Duration,
}

impl SessionStats {
    fn record(&mut self, bytes_in: usize, bytes_out: usize, elapsed: Duration) {
        self.requests += 1;
        self.bytes_in += bytes_in as u64;
        self.bytes_out += bytes_out as u64;
        self.busy += elapsed;
    }
}

/// What [`ProcessorSession::run`] hands back.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub stats: SessionStats,
    /// The method the session served, if it got that far.
    pub method: Option<Method>,
    /// Whether the foreground path performed cleanup, as opposed to a
    /// concurrent caller of [`SessionResources::cleanup`].
    pub cleaned_up: bool,
}

impl SessionReport {
    /// Who released the regions: this session or a concurrent caller such
    /// as a signal handler, which may still be finishing when `run` returns.
    pub fn released_by(&self) -> &'static str {
        if self.cleaned_up {
            "session"
        } else {
            "concurrent caller"
        }
    }
}

enum End {
    Disconnected,
    Cancelled,
}

/// One processor session, from connect to cleanup.
///
/// The foreground future drives the handshake and request loop. Whoever holds
/// the [`CancelToken`] or a [`resources`](Self::resources) handle may stop the
/// session from another task; both paths funnel through the same exactly-once
/// cleanup.
pub struct ProcessorSession {
    config: ProcessorConfig,
    namespace: Namespace,
    cancel: CancelToken,
    resources: Arc<SessionResources>,
    state: SessionState,
    method: Option<Method>,
    stats: SessionStats,
}

impl fmt::Debug for ProcessorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorSession")
            .field("identity", &self.config.identity)
            .field("state", &self.state)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl ProcessorSession {
    pub fn new(config: ProcessorConfig, namespace: Namespace, cancel: CancelToken) -> Self {
        Self {
            config,
            namespace,
            cancel,
            resources: Arc::new(SessionResources::new()),
            state: SessionState::Connecting,
            method: None,
            stats: SessionStats::default(),
        }
    }

    /// Handle to the session's regions, for out-of-band cleanup.
    pub fn resources(&self) -> Arc<SessionResources> {
        self.resources.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect to the configured endpoint and serve until the session ends.
    pub async fn run(self) -> SessionReport {
        let endpoint = self.config.endpoint.clone();
        self.run_inner(async move { ControlChannel::connect(&endpoint).await })
            .await
    }

    /// Serve over an already connected channel.
    pub async fn run_with_channel(self, channel: ControlChannel) -> SessionReport {
        self.run_inner(async move { Ok::<_, ChannelError>(channel) })
            .await
    }

    async fn run_inner<F>(mut self, connect: F) -> SessionReport
    where
        F: Future<Output = Result<ControlChannel, ChannelError>>,
    {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(End::Cancelled),
            result = self.drive(connect) => result,
        };

        self.transition(SessionState::Draining);
        let outcome = match result {
            Ok(End::Disconnected) => SessionOutcome::Disconnected,
            Ok(End::Cancelled) => SessionOutcome::Cancelled,
            Err(e) => {
                tracing::error!(error = %e, state = %self.state, "session failed");
                SessionOutcome::Failed(e)
            }
        };
        let cleaned_up = self.resources.cleanup().is_some();
        if !cleaned_up {
            tracing::info!("cleanup claimed by a concurrent caller, not waiting for it");
        }
        self.transition(SessionState::Terminated);

        let report = SessionReport {
            outcome,
            stats: self.stats,
            method: self.method,
            cleaned_up,
        };
        tracing::info!(
            outcome = %report.outcome,
            released_by = report.released_by(),
            requests = self.stats.requests,
            bytes_in = self.stats.bytes_in,
            bytes_out = self.stats.bytes_out,
            busy = ?self.stats.busy,
            "session terminated"
        );
        report
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = %self.state, to = %next, "session state");
        self.state = next;
    }

    async fn drive<F>(&mut self, connect: F) -> Result<End, ProcessorError>
    where
        F: Future<Output = Result<ControlChannel, ChannelError>>,
    {
        self.config.validate()?;

        self.transition(SessionState::Connecting);
        let mut channel = connect.await?;
        tracing::info!(endpoint = %self.config.endpoint.display(), "connected to driver");

        self.transition(SessionState::Identifying);
        channel.send_identity(&self.config.identity).await?;

        self.transition(SessionState::AttachingInput);
        let target = self.negotiate(&mut channel, Role::Input).await?;
        if !self.attach(Role::Input, target)? {
            return Ok(End::Cancelled);
        }

        self.transition(SessionState::NegotiatingOutputKey);
        let target = self.negotiate(&mut channel, Role::Output).await?;
        self.transition(SessionState::AttachingOutput);
        if !self.attach(Role::Output, target)? {
            return Ok(End::Cancelled);
        }

        let method = match self.config.method {
            MethodSelection::Fixed(method) => method,
            MethodSelection::Negotiated => {
                self.transition(SessionState::ResolvingMethod);
                let name = channel
                    .read_short_string(self.config.method_frame_len)
                    .await?;
                Method::resolve(&name)?
            }
        };
        self.method = Some(method);
        self.transition(SessionState::Ready);
        tracing::info!(%method, identity = %self.config.identity, "session ready");

        self.transition(SessionState::Processing);
        self.serve(&mut channel, method).await
    }

    /// Learn where the region for `role` lives.
    async fn negotiate(
        &self,
        channel: &mut ControlChannel,
        role: Role,
    ) -> Result<SegmentRef, ProcessorError> {
        let target = match self.config.plan(role).negotiation {
            // Ids and keys travel as the raw bits of a 32-bit signed integer.
            Negotiation::ReceiveId => SegmentRef::Id(channel.read_u32_be().await? as i32),
            Negotiation::ReceiveKey => SegmentRef::Key(channel.read_u32_be().await? as i32),
            Negotiation::FixedKey(key) => SegmentRef::Key(key),
        };
        tracing::debug!(%role, ?target, "negotiated region");
        Ok(target)
    }

    /// Attach and hand the region to the shared resources. `false` if cleanup
    /// already ran.
    fn attach(&self, role: Role, target: SegmentRef) -> Result<bool, ProcessorError> {
        let plan = self.config.plan(role);
        let region = SharedMemoryRegion::open(
            &self.namespace,
            RegionSpec {
                role,
                target,
                capacity: self.config.capacity,
                create: plan.create,
                ownership: plan.ownership(),
            },
        )?;
        tracing::info!(
            %role,
            key = ?region.key(),
            shmid = region.id(),
            capacity = region.capacity(),
            "attached region"
        );
        Ok(self.resources.install(region))
    }

    async fn serve(
        &mut self,
        channel: &mut ControlChannel,
        method: Method,
    ) -> Result<End, ProcessorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(End::Cancelled);
            }

            let len = match channel.read_u32_be().await {
                Ok(len) => len as usize,
                Err(ChannelError::Disconnected) => {
                    tracing::info!("driver closed the channel");
                    return Ok(End::Disconnected);
                }
                Err(e) => return Err(e.into()),
            };

            let Some(input) = self.resources.copy_input(len)? else {
                return Ok(End::Cancelled);
            };

            let started = Instant::now();
            let output = method.apply(&input)?;
            let elapsed = started.elapsed();
            tracing::debug!(%method, len, out = output.len(), ?elapsed, "processed request");

            let out_len = u32::try_from(output.len()).map_err(|_| {
                ProcessorError::Protocol(ProtocolFault::OutputTooLarge {
                    len: output.len(),
                    capacity: u32::MAX as usize,
                })
            })?;
            if !self.resources.write_output(&output)? {
                return Ok(End::Cancelled);
            }
            channel.write_u32_be(out_len).await?;

            self.stats.record(len, output.len(), elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_INPUT_KEY, ProtocolVariant, SessionResources};
    use harness_shm::{HeapNamespace, Ownership};

    fn keyed_config(capacity: usize) -> ProcessorConfig {
        ProcessorConfig::for_variant(ProtocolVariant::KeyedInput, "rust").with_capacity(capacity)
    }

    fn driver_segment(ns: &Namespace, role: Role, key: i32) -> SharedMemoryRegion {
        SharedMemoryRegion::open(
            ns,
            RegionSpec {
                role,
                target: SegmentRef::Key(key),
                capacity: 64,
                create: true,
                ownership: Ownership::Borrowed,
            },
        )
        .unwrap()
    }

    #[tokio_test_lite::test]
    async fn keyed_input_serves_and_removes_segments() {
        let heap = HeapNamespace::new();
        let ns = Namespace::InProcess(heap.clone());
        let (processor_end, mut driver) = ControlChannel::pair();

        let mut input = driver_segment(&ns, Role::Input, DEFAULT_INPUT_KEY);
        let output = driver_segment(&ns, Role::Output, 42);

        let session = ProcessorSession::new(keyed_config(64), ns.clone(), CancelToken::new());
        let task = tokio::spawn(session.run_with_channel(processor_end));

        assert_eq!(driver.read_short_string(32).await.unwrap(), "rust");
        driver.write_u32_be(42).await.unwrap();

        input.view_mut(0, 3).unwrap().copy_from_slice(b"abc");
        driver.write_u32_be(3).await.unwrap();
        assert_eq!(driver.read_u32_be().await.unwrap(), 32);
        assert_eq!(output.view(0, 2).unwrap(), &[0xba, 0x78]);

        driver.shutdown().await.unwrap();
        let report = task.await.unwrap();
        assert!(matches!(report.outcome, SessionOutcome::Disconnected));
        assert_eq!(report.stats.requests, 1);
        assert_eq!(report.stats.bytes_in, 3);
        assert_eq!(report.stats.bytes_out, 32);
        assert_eq!(report.method, Some(Method::Sha256));
        assert!(report.cleaned_up);
        // The processor removed both keyed segments.
        assert!(heap.is_empty());
    }

    #[tokio_test_lite::test]
    async fn invalid_config_fails_before_connecting() {
        let cfg = keyed_config(0);
        let session = ProcessorSession::new(
            cfg,
            Namespace::InProcess(HeapNamespace::new()),
            CancelToken::new(),
        );
        let (processor_end, _driver) = ControlChannel::pair();
        let report = session.run_with_channel(processor_end).await;
        assert!(matches!(
            report.outcome,
            SessionOutcome::Failed(ProcessorError::Config(_))
        ));
        assert!(report.cleaned_up);
    }

    #[tokio_test_lite::test]
    async fn pre_cancelled_session_ends_without_handshake() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let session = ProcessorSession::new(
            keyed_config(64),
            Namespace::InProcess(HeapNamespace::new()),
            cancel,
        );
        let resources: Arc<SessionResources> = session.resources();
        let (processor_end, _driver) = ControlChannel::pair();

        let report = session.run_with_channel(processor_end).await;
        assert!(matches!(report.outcome, SessionOutcome::Cancelled));
        assert!(report.outcome.is_clean());
        assert!(resources.is_cleaned_up());
        assert_eq!(report.stats, SessionStats::default());
    }

    #[tokio_test_lite::test]
    async fn cleanup_by_another_caller_is_reported() {
        let cancel = CancelToken::new();
        let session = ProcessorSession::new(
            keyed_config(64),
            Namespace::InProcess(HeapNamespace::new()),
            cancel.clone(),
        );
        let resources = session.resources();
        cancel.cancel();
        assert!(resources.cleanup().is_some());

        let (processor_end, _driver) = ControlChannel::pair();
        let report = session.run_with_channel(processor_end).await;
        assert!(matches!(report.outcome, SessionOutcome::Cancelled));
        assert!(!report.cleaned_up);
        assert_eq!(report.released_by(), "concurrent caller");
    }

    #[test]
    fn outcome_classification() {
        assert!(SessionOutcome::Disconnected.is_clean());
        let failed = SessionOutcome::Failed(ProcessorError::UnsupportedMethod("md5".into()));
        assert!(!failed.is_clean());
        assert!(failed.error().is_some());
        assert_eq!(SessionState::NegotiatingOutputKey.to_string(), "negotiating-output-key");
    }
}
