use std::path::PathBuf;

use harness_shm::{Ownership, Role};

use crate::{ConfigError, Method};

/// Rendezvous socket the driver listens on.
pub const DEFAULT_ENDPOINT: &str = "/tmp/eth-cl-fuzz";

/// Segment size used by the driver for both regions (100 MiB).
pub const DEFAULT_CAPACITY: usize = 100 * 1024 * 1024;

/// Well-known key of the input segment in the keyed-input variant.
pub const DEFAULT_INPUT_KEY: i32 = 1000;

/// Buffer size for the method-name read.
pub const DEFAULT_METHOD_FRAME_LEN: usize = 64;

/// Largest identity the driver reads in its single name read.
pub const MAX_IDENTITY_LEN: usize = 32;

/// How the processor learns where a region lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Read a segment id from the channel and attach to it.
    ReceiveId,
    /// Read a key from the channel and resolve it.
    ReceiveKey,
    /// Use a key known to both sides ahead of time; nothing is read.
    FixedKey(i32),
}

/// Creation and release responsibilities for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    pub negotiation: Negotiation,
    /// Create the segment if its key does not exist yet.
    pub create: bool,
    /// Destroy the segment at session end (this side owns it).
    pub destroy: bool,
}

impl RegionPlan {
    pub fn ownership(&self) -> Ownership {
        if self.destroy {
            Ownership::Owned
        } else {
            Ownership::Borrowed
        }
    }
}

/// Where the method comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSelection {
    /// Fixed for the process; no method frame is read.
    Fixed(Method),
    /// Read a bounded, NUL-padded name frame after the output region is attached.
    Negotiated,
}

/// The two handshake shapes seen in deployed drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Driver creates both segments and sends both ids, then a method name.
    /// The driver owns the segments.
    AttachById,
    /// Input lives at a well-known key; the driver sends only the output key.
    /// Method fixed at start. The driver creates both segments, the processor
    /// removes both at exit.
    KeyedInput,
}

impl ProtocolVariant {
    pub fn input_plan(self, input_key: i32) -> RegionPlan {
        match self {
            ProtocolVariant::AttachById => RegionPlan {
                negotiation: Negotiation::ReceiveId,
                create: false,
                destroy: false,
            },
            ProtocolVariant::KeyedInput => RegionPlan {
                negotiation: Negotiation::FixedKey(input_key),
                create: false,
                destroy: true,
            },
        }
    }

    pub fn output_plan(self) -> RegionPlan {
        match self {
            ProtocolVariant::AttachById => RegionPlan {
                negotiation: Negotiation::ReceiveId,
                create: false,
                destroy: false,
            },
            ProtocolVariant::KeyedInput => RegionPlan {
                negotiation: Negotiation::ReceiveKey,
                create: false,
                destroy: true,
            },
        }
    }

    pub fn method(self) -> MethodSelection {
        match self {
            ProtocolVariant::AttachById => MethodSelection::Negotiated,
            ProtocolVariant::KeyedInput => MethodSelection::Fixed(Method::Sha256),
        }
    }
}

/// Full processor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub endpoint: PathBuf,
    pub identity: String,
    /// Size of each region in bytes.
    pub capacity: usize,
    pub input: RegionPlan,
    pub output: RegionPlan,
    pub method: MethodSelection,
    pub method_frame_len: usize,
}

impl ProcessorConfig {
    /// Configuration for one of the known protocol variants.
    pub fn for_variant(variant: ProtocolVariant, identity: impl Into<String>) -> Self {
        Self {
            endpoint: PathBuf::from(DEFAULT_ENDPOINT),
            identity: identity.into(),
            capacity: DEFAULT_CAPACITY,
            input: variant.input_plan(DEFAULT_INPUT_KEY),
            output: variant.output_plan(),
            method: variant.method(),
            method_frame_len: DEFAULT_METHOD_FRAME_LEN,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<PathBuf>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Move a fixed-key input to `key`. No effect when the input id or key is
    /// received over the channel.
    pub fn with_input_key(mut self, key: i32) -> Self {
        if let Negotiation::FixedKey(_) = self.input.negotiation {
            self.input.negotiation = Negotiation::FixedKey(key);
        }
        self
    }

    /// Let the processor create the input segment if the driver has not.
    pub fn with_input_create(mut self, create: bool) -> Self {
        self.input.create = create;
        self
    }

    pub fn with_method(mut self, method: MethodSelection) -> Self {
        self.method = method;
        self
    }

    pub fn plan(&self, role: Role) -> &RegionPlan {
        match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.identity.is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        if self.identity.len() > MAX_IDENTITY_LEN {
            return Err(ConfigError::IdentityTooLong {
                len: self.identity.len(),
                max: MAX_IDENTITY_LEN,
            });
        }
        for role in [Role::Input, Role::Output] {
            let plan = self.plan(role);
            if plan.create && plan.negotiation == Negotiation::ReceiveId {
                return Err(ConfigError::CreateById(role));
            }
            if plan.negotiation == Negotiation::FixedKey(0) {
                return Err(ConfigError::PrivateKey(role));
            }
        }
        if self.method == MethodSelection::Negotiated && self.method_frame_len == 0 {
            return Err(ConfigError::ZeroMethodFrame);
        }
        Ok(())
    }
}
