use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use harness_core::{
    DEFAULT_CAPACITY, DEFAULT_ENDPOINT, DEFAULT_INPUT_KEY, DEFAULT_METHOD_FRAME_LEN, Method,
    MethodSelection, ProcessorConfig, ProtocolVariant,
};

#[derive(Parser, Debug)]
#[command(name = "shm-processor")]
#[command(about = "Serve digest requests from a fuzzing driver over shared memory")]
pub struct Args {
    /// Unix socket the driver listens on
    #[arg(long, env = "SHM_PROCESSOR_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: PathBuf,

    /// Name announced to the driver
    #[arg(long, env = "SHM_PROCESSOR_IDENTITY", default_value = "rust")]
    pub identity: String,

    /// Handshake shape the driver speaks
    #[arg(long, env = "SHM_PROCESSOR_VARIANT", value_enum, default_value_t = Variant::KeyedInput)]
    pub variant: Variant,

    /// Fix the method instead of using the variant's default
    #[arg(long, env = "SHM_PROCESSOR_METHOD", conflicts_with = "negotiate_method")]
    pub method: Option<Method>,

    /// Read the method name from the driver even if the variant fixes it
    #[arg(long, env = "SHM_PROCESSOR_NEGOTIATE_METHOD")]
    pub negotiate_method: bool,

    /// Size of each shared-memory region in bytes
    #[arg(long, env = "SHM_PROCESSOR_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Well-known key of the input segment (keyed-input variant)
    #[arg(long, env = "SHM_PROCESSOR_INPUT_KEY", default_value_t = DEFAULT_INPUT_KEY)]
    pub input_key: i32,

    /// Create the input segment if the driver has not (keyed-input variant)
    #[arg(long, env = "SHM_PROCESSOR_CREATE_INPUT")]
    pub create_input: bool,

    /// Size of the method-name frame in bytes
    #[arg(long, env = "SHM_PROCESSOR_METHOD_FRAME_LEN", default_value_t = DEFAULT_METHOD_FRAME_LEN)]
    pub method_frame_len: usize,

    /// Log filter, e.g. "debug" or "harness_core=trace". Falls back to RUST_LOG, then "info".
    #[arg(long, env = "SHM_PROCESSOR_LOG")]
    pub log: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Variant {
    /// Driver creates both segments and sends their ids, then a method name
    AttachById,
    /// Input at a well-known key, output key sent by the driver, fixed method
    KeyedInput,
}

impl From<Variant> for ProtocolVariant {
    fn from(v: Variant) -> Self {
        match v {
            Variant::AttachById => ProtocolVariant::AttachById,
            Variant::KeyedInput => ProtocolVariant::KeyedInput,
        }
    }
}

impl Args {
    pub fn to_config(&self) -> ProcessorConfig {
        let mut config = ProcessorConfig::for_variant(self.variant.into(), self.identity.clone())
            .with_endpoint(&self.endpoint)
            .with_capacity(self.capacity)
            .with_input_key(self.input_key);
        if self.create_input {
            config = config.with_input_create(true);
        }
        if let Some(method) = self.method {
            config = config.with_method(MethodSelection::Fixed(method));
        } else if self.negotiate_method {
            config = config.with_method(MethodSelection::Negotiated);
        }
        config.method_frame_len = self.method_frame_len;
        config
    }
}
