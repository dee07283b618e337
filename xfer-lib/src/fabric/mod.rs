//! Fabric wrapper: context, worker, endpoint, memory handle, remote key and
//! request tokens, backed by the in-process shared-memory provider.

mod context;
mod directory;
mod request;
mod worker;

pub use context::{Context, ThreadingMode};
pub use request::ReqToken;
pub use worker::{
    AmAttrs, ArmStatus, Endpoint, MemHandle, Rkey, Worker, pack_rkey,
    register_memory,
};

pub(crate) use request::ReqState;
