//! Local TCP tunnel over the relay
//!
//! A [`TunnelSession`] opens a relay session for one target, binds a loopback
//! port and forwards the first client that connects to it. Unmodified client
//! software (an RDP client, ssh, ...) talks to `127.0.0.1:<port>` as if it were
//! talking to the target directly.
//!
//! ```text
//!  Created → Opening → Listening → Relaying → Closing → Closed
//!                  └────────┴──────────┴──────────┴──→ Faulted
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod pump;
pub mod tunnel;

pub use config::{PumpConfig, TunnelConfig};
pub use error::{TunnelError, TunnelResult};
pub use manager::{TunnelManager, TunnelPolicy};
pub use pump::{PumpEnd, PumpStats};
pub use tunnel::{TunnelSession, TunnelState, TunnelSummary};
