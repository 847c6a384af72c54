//! Utility
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because kernel object types mention some of its items.
#[macro_use]
mod pool;
mod init;
pub(crate) mod intrusive_list;

pub use self::{init::*, pool::*};
