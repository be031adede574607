//! Kernel filter interfaces: wire protocol, channel seam, in-process
//! emulation and the in-flight action table.

pub mod channel;
pub mod loopback;
pub mod protocol;

pub use channel::{DriverChannel, DriverControl, InFlightGuard, InFlightTable};
