pub use crate::state_cache::{Error, StateCache};

mod state_cache;
