pub mod file_store;
pub mod updates_state;

pub use file_store::{ensure_dir, write_atomic, write_atomic_sync};
pub use updates_state::{UpdatesState, UpdatesStateStore, UserState};
