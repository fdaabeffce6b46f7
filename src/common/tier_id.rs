//! Memory tier identifier type.

use std::fmt;

/// Identifies a memory tier: host memory or one GPU device.
///
/// Ordered so that the CPU tier sorts before all devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierId {
    Cpu,
    Gpu(u16),
}

impl TierId {
    #[inline]
    pub fn is_gpu(&self) -> bool {
        matches!(self, TierId::Gpu(_))
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierId::Cpu => write!(f, "CPU"),
            TierId::Gpu(device) => write!(f, "GPU{}", device),
        }
    }
}
