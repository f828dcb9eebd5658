//! Backend implementation using [`redis`](::redis)

const STREAM_ID_NEW: &str = "*";
const STREAM_ID_HEAD: &str = "0";
const STREAM_ID_TAIL: &str = "$";
const STREAM_ID_ADDITIONS: &str = ">";
const BUSY_GROUP: &str = "BUSYGROUP";
const NO_GROUP: &str = "NOGROUP";

mod factory;
mod store;

pub use factory::*;
pub use store::*;
