//! Host command protocol
//!
//! Hosts talk to the gateway with single-line text frames. The first field is
//! the verb, the remaining fields are verb-specific arguments:
//!
//! ```text
//! host -> gateway   PUBLISH,<topic>,<payload>,<retain 0|1>,<qos>
//!                   SUBSCRIBE,<topic>,<qos>
//!                   MEM | TIME | STATUS
//! gateway -> host   STATUS,<code>[,...]
//!                   SUBSCRIPTION,<topic>,<payload>,<True|False>
//!                   MEM,<free>,<used>
//!                   TIME,<unix seconds>
//! ```

pub mod codec;
pub mod command;

pub use codec::{Frame, SEP};
pub use command::{Command, Notice, ProtocolError, StatusCode, Verb};
