//! Shared protocol definitions for the Parlor wire format.

pub mod codec;
pub mod frame;
pub mod ids;
