//! The pub-sub message bus: framing, message shapes, and the
//! publisher/subscriber halves, per spec.md §6.

pub mod codec;
pub mod messages;
pub mod publisher;
pub mod subscriber;

/// Controller-bound ports: the controller listens, GUIs connect in.
pub const PORT_CSS: u16 = 5000;
pub const PORT_RTD: u16 = 5050;
pub const PORT_RSP_GUI1: u16 = 5020;
pub const PORT_RSP_GUI2: u16 = 5023;
pub const PORT_FWRS: u16 = 5040;

/// GUI-bound ports: the GUI listens, the controller connects out.
pub const PORT_HB_GUI1: u16 = 5011;
pub const PORT_HB_GUI2: u16 = 5012;
pub const PORT_CMD_GUI1: u16 = 5021;
pub const PORT_CMD_GUI2: u16 = 5022;
pub const PORT_TIME_GUI1: u16 = 5031;
pub const PORT_TIME_GUI2: u16 = 5032;
pub const PORT_FWUP_GUI1: u16 = 5041;
