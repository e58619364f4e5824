use derive_more::{From, Into};

use crate::listener::AcceptedAddr;

/// Address of the connected client, captured at accept time.
#[derive(From, Into, Debug, Clone)]
pub struct PeerAddr(pub AcceptedAddr);
