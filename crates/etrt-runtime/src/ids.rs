//! Strongly typed identifiers
//!
//! Raw integers appear only at the outermost API boundary through
//! `as_raw`/`from_raw`.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($repr:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($repr);

        impl $name {
            /// Wrap a raw identifier
            pub const fn from_raw(raw: $repr) -> Self {
                Self(raw)
            }

            /// Raw identifier
            pub const fn as_raw(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// A device enumerated by the runtime's device layer
    DeviceId(u32),
    "dev"
);
id_type!(
    /// An ordered command queue bound to one device
    StreamId(u32),
    "stream"
);
id_type!(
    /// Completion of exactly one submitted operation
    ///
    /// Allocated monotonically from 1 and never reused.
    EventId(u64),
    "event"
);
id_type!(
    /// A loaded code image
    KernelId(u32),
    "kernel"
);

/// A device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const fn address(self) -> u64 {
        self.0
    }

    /// Pointer `bytes` past this one
    pub const fn offset(self, bytes: u64) -> Self {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<DeviceId> for etrt_device::DeviceIndex {
    fn from(id: DeviceId) -> Self {
        etrt_device::DeviceIndex::new(id.as_raw())
    }
}

impl From<etrt_device::DeviceIndex> for DeviceId {
    fn from(index: etrt_device::DeviceIndex) -> Self {
        DeviceId::from_raw(index.index())
    }
}
