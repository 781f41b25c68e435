//! Flow-tracking core: the 5-tuple entry record, the fixed-capacity
//! open-addressed table, and its hash primitive.

pub mod entry;
pub mod hash;
pub mod table;

pub use entry::{FlowEntry, FlowKey, Occupancy, PACKET_COUNT_MAX};
pub use table::{FlowTable, InsertError};
