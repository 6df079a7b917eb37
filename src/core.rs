use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash.
///
/// In `kumiki` this is used to derive stable, content-addressed identifiers
/// for resources, e.g. the ids handed out by the in-memory provisioner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        hex(&self.0)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = String::with_capacity(bytes.len() * 2);

    for &byte in bytes {
        acc.push(HEX[(byte >> 4) as usize] as char);
        acc.push(HEX[(byte & 0xF) as usize] as char);
    }

    acc
}

/// Identifies one blueprint instance. Handles and values carry it so that a
/// reference leaking from one stack into another can be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StackId(u64);

impl StackId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        StackId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The kind of a provisioned unit. Every kind has a closed set of output
/// fields, see [`Kind::fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Network,
    Volume,
    Image,
    Secret,
    Service,
}

impl Kind {
    /// Output fields a resource of this kind exposes once it is created.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Kind::Network => &["name", "id"],
            Kind::Volume => &["name"],
            Kind::Image => &["name", "image_id"],
            Kind::Secret => &["value"],
            Kind::Service => &["name", "host", "id"],
        }
    }

    /// Tie breaker used when more than one resource is ready to be created.
    /// Leaves go first, then generated secrets, then services.
    pub(crate) fn tier(self) -> u8 {
        match self {
            Kind::Network | Kind::Volume | Kind::Image => 0,
            Kind::Secret => 1,
            Kind::Service => 2,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Network => "network",
            Kind::Volume => "volume",
            Kind::Image => "image",
            Kind::Secret => "secret",
            Kind::Service => "service",
        };
        f.pad(name)
    }
}

/// Knobs for a single plan pass.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of resources submitted to the provisioner at once.
    pub parallelism: NonZeroUsize,
    /// Whether to draw progress bars for in-flight resources.
    pub progress: bool,
}

impl Settings {
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = NonZeroUsize::new(parallelism).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Create resources one by one, in exactly the order of
    /// [`Blueprint::topo_order`](crate::Blueprint::topo_order).
    pub fn sequential(self) -> Self {
        self.parallelism(1)
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            progress: true,
        }
    }
}
