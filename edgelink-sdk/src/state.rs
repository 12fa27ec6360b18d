//! Shared mutable state helpers.
//!
//! Every piece of state touched by more than one task (session registry,
//! loop states, coordinator phase) goes through `Shared<T>`. Locks are
//! never held across an `.await`.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
