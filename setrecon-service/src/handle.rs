//! Service-local handles.
//!
//! Sets, contents, operations, listeners, requests and channels all live in
//! maps owned by the service and refer to each other by these integer ids.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// A client-visible set handle.
    SetId,
    "set"
);
handle!(
    /// Shared backing store of one or more sets.
    ContentId,
    "content"
);
handle!(
    /// A running (bound) operation.
    OperationId,
    "op"
);
handle!(
    /// A registered listener.
    ListenerId,
    "listener"
);
handle!(
    /// An inbound operation request waiting for accept or reject.
    RequestId,
    "request"
);
handle!(
    /// One end of a peer channel, local to this service.
    ChannelId,
    "channel"
);

/// Monotonic id source.
#[derive(Debug, Default)]
pub(crate) struct Counter(u64);

impl Counter {
    pub(crate) fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}
