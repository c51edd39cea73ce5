pub mod cyclic_buffer;
pub mod deframer;
pub mod error;
pub mod framer;
mod macros;
pub mod registry;
pub mod server;
pub mod socket;

pub use cyclic_buffer::{CyclicBuffer, RecvOutcome, SendOutcome};
pub use deframer::{Deframer, DeframerOutcome};
pub use error::TunnelError;
pub use framer::{CONTROL_ORDER, ControlOp, ESC, FLAG, Framer};
pub use registry::{ClientRegistry, ClientState, MAX_CLIENTS};
pub use server::TunnelServer;
